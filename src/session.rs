//! In-memory session store.
//!
//! Sessions are minted on successful authentication and identified by a
//! random UUID. An optional TTL expires them; expired sessions are dropped
//! lazily on access and eagerly by `cleanup_task`.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, trace};
use uuid::Uuid;

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub username: String,
    pub issued_at: DateTime<Utc>,
    /// None = never expires
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now() >= expires_at,
            None => false,
        }
    }
}

/// Thread-safe session storage
#[derive(Debug)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    ttl: Option<TimeDelta>,
}

impl SessionStore {
    /// Create a store whose sessions live for `ttl_secs` (0 = forever).
    pub fn new(ttl_secs: u64) -> Arc<Self> {
        let ttl = if ttl_secs == 0 {
            None
        } else {
            i64::try_from(ttl_secs).ok().and_then(TimeDelta::try_seconds)
        };
        info!(ttl_secs, "Initializing session store");
        Self::with_ttl(ttl)
    }

    pub fn with_ttl(ttl: Option<TimeDelta>) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        })
    }

    /// Mint a new session for `username`.
    pub fn create(&self, username: &str) -> Session {
        let issued_at = Utc::now();
        let session = Session {
            id: Uuid::new_v4().simple().to_string(),
            username: username.to_string(),
            issued_at,
            expires_at: self.ttl.map(|ttl| issued_at + ttl),
        };

        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id.clone(), session.clone());
        trace!(username, "Session created");
        session
    }

    /// Look up a live session. Expired sessions are removed and reported missing.
    pub fn validate(&self, id: &str) -> Option<Session> {
        let session = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()?;

        if session.is_expired() {
            trace!(username = %session.username, "Session expired on access");
            self.invalidate(id);
            return None;
        }
        Some(session)
    }

    /// Remove a session, returning it if it existed.
    pub fn invalidate(&self, id: &str) -> Option<Session> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Drop every expired session, returning how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired());
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Background task to sweep expired sessions
pub async fn cleanup_task(store: Arc<SessionStore>, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));

    loop {
        interval.tick().await;
        let count = store.cleanup_expired();
        if count > 0 {
            debug!(count, "Cleaned up expired sessions");
        }
    }
}
