//! Registry of live connections.
//!
//! Maps each peer address to the handle used to reach it: the sender half
//! of its outbound frame queue and, once authenticated, its session.
//! All access goes through one `RwLock`; nothing here ever awaits or writes
//! to a socket while holding it. Deliveries work on snapshots returned by
//! `broadcast_targets` and `lookup_user`.
//!
//! Entries are created by `register` and removed when the returned
//! `Registration` guard drops, so removal happens exactly once per
//! connection however its handler exits. A session bound to a connection
//! is only usable from that connection, so removal also invalidates it.

use crate::session::{Session, SessionStore};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Queue feeding a connection's writer task.
pub type Outbound = mpsc::Sender<Bytes>;

/// A registered connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub addr: SocketAddr,
    pub outbound: Outbound,
    pub session: Option<Session>,
    pub connected_at: DateTime<Utc>,
}

/// One reachable recipient, copied out of the registry.
#[derive(Debug, Clone)]
pub struct Target {
    pub addr: SocketAddr,
    pub outbound: Outbound,
}

/// Thread-safe registry keyed by remote address
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<SocketAddr, ConnectionHandle>>,
    /// Where bound sessions are invalidated on unregister
    sessions: Option<Arc<SessionStore>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registry whose unregistered connections take their session with them.
    pub fn with_sessions(sessions: Arc<SessionStore>) -> Arc<Self> {
        Arc::new(Self {
            connections: RwLock::default(),
            sessions: Some(sessions),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SocketAddr, ConnectionHandle>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SocketAddr, ConnectionHandle>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a freshly accepted connection.
    ///
    /// Returns `None` if the address is already registered.
    pub fn register(self: &Arc<Self>, addr: SocketAddr, outbound: Outbound) -> Option<Registration> {
        let mut connections = self.write();
        if connections.contains_key(&addr) {
            return None;
        }
        connections.insert(
            addr,
            ConnectionHandle {
                addr,
                outbound,
                session: None,
                connected_at: Utc::now(),
            },
        );
        trace!(peer = %addr, total = connections.len(), "Connection registered");

        Some(Registration {
            registry: Arc::clone(self),
            addr,
        })
    }

    /// Remove a connection. Idempotent: a second call returns `None`.
    pub fn remove(&self, addr: &SocketAddr) -> Option<ConnectionHandle> {
        self.write().remove(addr)
    }

    /// Bind a session to a connection, returning the one it replaces.
    ///
    /// Returns `Err(session)` if the connection is no longer registered.
    pub fn bind_session(
        &self,
        addr: &SocketAddr,
        session: Session,
    ) -> Result<Option<Session>, Session> {
        match self.write().get_mut(addr) {
            Some(handle) => Ok(handle.session.replace(session)),
            None => Err(session),
        }
    }

    /// Unbind `session_id` from a connection if it is the one bound there.
    pub fn clear_session(&self, addr: &SocketAddr, session_id: &str) -> Option<Session> {
        let mut connections = self.write();
        let handle = connections.get_mut(addr)?;
        if handle.session.as_ref().map(|s| s.id.as_str()) == Some(session_id) {
            handle.session.take()
        } else {
            None
        }
    }

    pub fn session_of(&self, addr: &SocketAddr) -> Option<Session> {
        self.read().get(addr).and_then(|h| h.session.clone())
    }

    /// Every connection currently bound to `username`.
    pub fn lookup_user(&self, username: &str) -> Vec<Target> {
        self.read()
            .values()
            .filter(|h| h.session.as_ref().is_some_and(|s| s.username == username))
            .map(Target::from)
            .collect()
    }

    /// Snapshot of every authenticated connection except `exclude`.
    ///
    /// Order follows the underlying hash map and is unspecified.
    pub fn broadcast_targets(&self, exclude: &SocketAddr) -> Vec<Target> {
        self.read()
            .values()
            .filter(|h| h.addr != *exclude && h.session.is_some())
            .map(Target::from)
            .collect()
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.read().contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&ConnectionHandle> for Target {
    fn from(handle: &ConnectionHandle) -> Self {
        Self {
            addr: handle.addr,
            outbound: handle.outbound.clone(),
        }
    }
}

/// Keeps a connection registered for as long as it lives.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    addr: SocketAddr,
}

impl Registration {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let Some(handle) = self.registry.remove(&self.addr) else {
            return;
        };
        if let (Some(session), Some(sessions)) = (&handle.session, &self.registry.sessions) {
            sessions.invalidate(&session.id);
        }
        let age = Utc::now() - handle.connected_at;
        debug!(
            peer = %self.addr,
            age_ms = age.num_milliseconds(),
            "Connection unregistered"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn outbound() -> (Outbound, mpsc::Receiver<Bytes>) {
        mpsc::channel(8)
    }

    fn session(id: &str, username: &str) -> Session {
        Session {
            id: id.to_string(),
            username: username.to_string(),
            issued_at: Utc::now(),
            expires_at: None,
        }
    }

    #[test]
    fn test_register_and_drop_removes_once() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = outbound();

        let guard = registry.register(addr(1), tx).unwrap();
        assert!(registry.contains(&addr(1)));
        assert_eq!(registry.len(), 1);

        // Another path removing first must not make the guard misbehave
        assert!(registry.remove(&addr(1)).is_some());
        assert!(registry.remove(&addr(1)).is_none());
        drop(guard);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = outbound();
        let (tx2, _rx2) = outbound();

        let _guard = registry.register(addr(1), tx1).unwrap();
        assert!(registry.register(addr(1), tx2).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_bind_and_clear_session() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = outbound();
        let _guard = registry.register(addr(1), tx).unwrap();

        assert_eq!(registry.bind_session(&addr(1), session("s1", "alice")), Ok(None));
        let replaced = registry.bind_session(&addr(1), session("s2", "alice")).unwrap();
        assert_eq!(replaced.map(|s| s.id), Some("s1".to_string()));

        assert!(registry.clear_session(&addr(1), "s1").is_none());
        assert_eq!(registry.session_of(&addr(1)).unwrap().id, "s2");
        assert!(registry.clear_session(&addr(1), "s2").is_some());
        assert!(registry.session_of(&addr(1)).is_none());

        assert!(registry.bind_session(&addr(9), session("s3", "bob")).is_err());
    }

    #[test]
    fn test_lookup_and_broadcast_targets() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = outbound();
        let (tx2, _rx2) = outbound();
        let (tx3, _rx3) = outbound();
        let (tx4, _rx4) = outbound();
        let _g1 = registry.register(addr(1), tx1).unwrap();
        let _g2 = registry.register(addr(2), tx2).unwrap();
        let _g3 = registry.register(addr(3), tx3).unwrap();
        let _g4 = registry.register(addr(4), tx4).unwrap();

        registry.bind_session(&addr(1), session("a", "alice")).unwrap();
        registry.bind_session(&addr(2), session("b", "bob")).unwrap();
        registry.bind_session(&addr(3), session("b2", "bob")).unwrap();
        // addr(4) stays unauthenticated

        let bobs: Vec<_> = registry.lookup_user("bob").iter().map(|t| t.addr).collect();
        assert_eq!(bobs.len(), 2);
        assert!(bobs.contains(&addr(2)) && bobs.contains(&addr(3)));
        assert!(registry.lookup_user("carol").is_empty());

        let mut others: Vec<_> = registry
            .broadcast_targets(&addr(1))
            .iter()
            .map(|t| t.addr)
            .collect();
        others.sort();
        assert_eq!(others, vec![addr(2), addr(3)]);
    }

    #[test]
    fn test_unregister_invalidates_bound_session() {
        let sessions = SessionStore::new(0);
        let registry = ConnectionRegistry::with_sessions(Arc::clone(&sessions));
        let (tx1, _rx1) = outbound();
        let (tx2, _rx2) = outbound();
        let guard1 = registry.register(addr(1), tx1).unwrap();
        let _guard2 = registry.register(addr(2), tx2).unwrap();

        let alice = sessions.create("alice");
        let bob = sessions.create("bob");
        registry.bind_session(&addr(1), alice.clone()).unwrap();
        registry.bind_session(&addr(2), bob.clone()).unwrap();

        drop(guard1);
        assert!(sessions.validate(&alice.id).is_none());
        assert!(sessions.validate(&bob.id).is_some());
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_register_and_disconnect() {
        let registry = ConnectionRegistry::new();
        let n = 64u16;
        let m = 40u16;

        let mut tasks = Vec::new();
        for port in 1..=n {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let (tx, _rx) = mpsc::channel(1);
                registry.register(addr(port), tx).unwrap()
            }));
        }
        let mut guards = Vec::new();
        for task in tasks {
            guards.push(task.await.unwrap());
        }
        assert_eq!(registry.len(), n as usize);

        let leaving: Vec<_> = guards.drain(..m as usize).collect();
        let drops: Vec<_> = leaving
            .into_iter()
            .map(|guard| tokio::spawn(async move { drop(guard) }))
            .collect();
        for task in drops {
            task.await.unwrap();
        }

        assert_eq!(registry.len(), (n - m) as usize);
        for guard in &guards {
            assert!(registry.contains(&guard.addr()));
        }
    }
}
