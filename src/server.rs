//! TCP server for chat connections.
//!
//! Accepts connections, registers each one, and runs a handler task per
//! connection. Each connection gets two halves:
//! - a read loop that decodes frames and dispatches requests in order
//! - a writer task draining the connection's outbound queue to the socket
//!
//! A connection ends when the peer closes, on a transport error, or when
//! its writer fails. It is unregistered exactly once on the way out.

use crate::config::{Config, ConnectionSettings, OverflowPolicy};
use crate::error::{ConnectionError, ServerError};
use crate::framing::FrameCodec;
use crate::handlers::{self, Context, Peer};
use crate::protocol::{self, DecodeError};
use crate::registry::{ConnectionRegistry, Registration};
use crate::session::{cleanup_task, SessionStore};
use crate::users::UserStore;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server instance
pub struct Server {
    config: Config,
    listener: TcpListener,
    ctx: Arc<Context>,
    settings: ConnectionSettings,
    connection_limit: Option<Arc<Semaphore>>,
}

impl Server {
    /// Bind the listening socket and build shared state.
    pub async fn bind(config: Config, users: Arc<dyn UserStore>) -> Result<Self, ServerError> {
        let addr: SocketAddr = tokio::net::lookup_host(&config.listen)
            .await
            .map_err(|_| ServerError::InvalidAddress(config.listen.clone()))?
            .next()
            .ok_or_else(|| ServerError::InvalidAddress(config.listen.clone()))?;

        let listener = create_listener(addr, config.backlog).map_err(|source| ServerError::Bind {
            addr: config.listen.clone(),
            source,
        })?;
        let listener = TcpListener::from_std(listener)?;

        let codec = FrameCodec::new(config.framing, config.max_frame_len, config.chunk_size);
        let sessions = SessionStore::new(config.session_ttl);
        let ctx = Arc::new(Context::new(
            ConnectionRegistry::with_sessions(Arc::clone(&sessions)),
            sessions,
            users,
            codec,
        ));
        let connection_limit =
            (config.max_connections > 0).then(|| Arc::new(Semaphore::new(config.max_connections)));

        Ok(Server {
            settings: ConnectionSettings::from(&config),
            config,
            listener,
            ctx,
            connection_limit,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.ctx.registry)
    }

    pub fn sessions(&self) -> Arc<SessionStore> {
        Arc::clone(&self.ctx.sessions)
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> Result<(), ServerError> {
        info!(
            address = %self.local_addr()?,
            framing = ?self.config.framing,
            max_connections = self.config.max_connections,
            "Server listening"
        );

        if self.config.session_ttl > 0 {
            let sessions = Arc::clone(&self.ctx.sessions);
            let interval = self.config.cleanup_interval;
            tokio::spawn(async move {
                cleanup_task(sessions, interval).await;
            });
        }

        loop {
            // Queue policy: wait for a slot before accepting
            let queued_permit = match (&self.connection_limit, self.config.overflow) {
                (Some(limit), OverflowPolicy::Queue) => Some(
                    Arc::clone(limit)
                        .acquire_owned()
                        .await
                        .map_err(|_| ServerError::LimiterClosed)?,
                ),
                _ => None,
            };

            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let permit = match (queued_permit, &self.connection_limit) {
                (Some(permit), _) => Some(permit),
                (None, Some(limit)) => match Arc::clone(limit).try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        warn!(
                            peer = %addr,
                            max = self.config.max_connections,
                            "Connection rejected: limit reached"
                        );
                        continue;
                    }
                },
                (None, None) => None,
            };

            self.spawn_connection(stream, addr, permit);
        }
    }

    /// Register an accepted connection and start its handler task.
    fn spawn_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let (outbound, outbound_rx) = mpsc::channel(self.settings.outbound_queue);
        let Some(registration) = self.ctx.registry.register(addr, outbound.clone()) else {
            warn!(peer = %addr, "Address already registered, dropping connection");
            return;
        };
        debug!(peer = %addr, "New connection");

        let peer = Peer::new(addr, outbound);
        let ctx = Arc::clone(&self.ctx);
        let settings = self.settings;

        tokio::spawn(async move {
            if let Err(e) =
                handle_connection(stream, peer, outbound_rx, registration, ctx, settings).await
            {
                debug!(peer = %addr, error = %e, "Connection error");
            }
            drop(permit);
        });
    }
}

/// Build the listening socket (SO_REUSEADDR, custom backlog).
fn create_listener(addr: SocketAddr, backlog: u32) -> std::io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    Ok(socket.into())
}

/// Run one connection to completion.
async fn handle_connection(
    stream: TcpStream,
    peer: Peer,
    outbound_rx: mpsc::Receiver<Bytes>,
    registration: Registration,
    ctx: Arc<Context>,
    settings: ConnectionSettings,
) -> Result<(), ConnectionError> {
    let (reader, writer) = stream.into_split();
    let mut writer_task = tokio::spawn(write_loop(writer, outbound_rx, settings.write_timeout));

    let (result, writer_done) = tokio::select! {
        result = read_loop(reader, &peer, &ctx, &settings) => (result, false),
        joined = &mut writer_task => (writer_result(joined), true),
    };

    // Unregister before the socket closes so no one queues to a dead writer
    drop(registration);
    let addr = peer.addr;
    drop(peer);

    if !writer_done {
        if let Err(e) = writer_result(writer_task.await) {
            debug!(peer = %addr, error = %e, "Writer finished with error");
        }
    }

    info!(peer = %addr, "Connection closed");
    result
}

fn writer_result(
    joined: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), ConnectionError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e)),
        Err(e) => Err(ConnectionError::Writer(e.to_string())),
    }
}

/// Read frames and dispatch them until the peer closes.
async fn read_loop(
    reader: OwnedReadHalf,
    peer: &Peer,
    ctx: &Context,
    settings: &ConnectionSettings,
) -> Result<(), ConnectionError> {
    let mut frames = ctx.codec.reader(reader);

    loop {
        let next = match settings.read_timeout {
            Some(limit) => timeout(limit, frames.next_frame())
                .await
                .map_err(|_| ConnectionError::Idle(limit))?,
            None => frames.next_frame().await,
        };

        let Some(frame) = next? else {
            trace!(peer = %peer.addr, "Connection closed by client");
            return Ok(());
        };

        match protocol::decode(&frame) {
            Ok(request) => handlers::dispatch(ctx, peer, request).await?,
            Err(DecodeError::UnknownType(request_type)) => {
                warn!(peer = %peer.addr, %request_type, "Unknown request type");
            }
            Err(e) => {
                warn!(peer = %peer.addr, error = %e, "Dropping malformed frame");
            }
        }
    }
}

/// Drain the outbound queue to the socket until every sender is gone.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Bytes>,
    write_timeout: Option<Duration>,
) -> std::io::Result<()> {
    while let Some(frame) = outbound.recv().await {
        match write_timeout {
            Some(limit) => timeout(limit, writer.write_all(&frame))
                .await
                .map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "write timed out")
                })??,
            None => writer.write_all(&frame).await?,
        }
    }
    // Best effort: the peer may already be gone
    let _ = writer.shutdown().await;
    Ok(())
}
