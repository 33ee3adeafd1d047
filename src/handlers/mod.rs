//! Request handlers.
//!
//! `dispatch` routes a decoded request to its handler and sends any reply
//! back to the originating connection:
//! - `authenticate`: verify credentials, mint and bind a session
//! - `register`: create a user in the user store
//! - `message`: route a chat message to one user or to everyone
//! - `logout`: invalidate the connection's session
//!
//! Handlers never write to sockets directly. Replies and deliveries are
//! pushed onto per-connection outbound queues drained by writer tasks.

pub mod authenticate;
pub mod logout;
pub mod message;
pub mod register;

use crate::error::{ChatError, ConnectionError};
use crate::framing::FrameCodec;
use crate::protocol::{Reply, Request, RequestKind};
use crate::registry::{ConnectionRegistry, Outbound, Target};
use crate::session::SessionStore;
use crate::users::UserStore;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, trace, warn};

/// Shared state every handler works against.
pub struct Context {
    pub registry: Arc<ConnectionRegistry>,
    pub sessions: Arc<SessionStore>,
    pub users: Arc<dyn UserStore>,
    pub codec: FrameCodec,
}

impl Context {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        sessions: Arc<SessionStore>,
        users: Arc<dyn UserStore>,
        codec: FrameCodec,
    ) -> Self {
        Self {
            registry,
            sessions,
            users,
            codec,
        }
    }

    pub(crate) fn encode<T: serde::Serialize>(&self, payload: &T) -> Result<Bytes, ChatError> {
        self.codec
            .encode(payload)
            .map_err(|e| ChatError::internal(format!("encode failed: {e}")))
    }
}

/// The connection a request arrived on.
#[derive(Debug, Clone)]
pub struct Peer {
    pub addr: SocketAddr,
    outbound: Outbound,
}

impl Peer {
    pub fn new(addr: SocketAddr, outbound: Outbound) -> Self {
        Self { addr, outbound }
    }

    /// Queue a frame for this connection, waiting for queue space.
    pub async fn send(&self, frame: Bytes) -> Result<(), ConnectionError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| ConnectionError::WriterClosed)
    }
}

/// Route one request and send its reply, if it has one.
///
/// Only a failure to queue the reply is returned; application errors are
/// turned into error replies.
pub async fn dispatch(ctx: &Context, peer: &Peer, request: Request) -> Result<(), ConnectionError> {
    let kind = request.kind();
    trace!(peer = %peer.addr, ?request, "Dispatching request");

    let reply = match request {
        Request::Authenticate { username, password } => Some(Reply::from_result(
            kind,
            authenticate::handle(ctx, peer, username, password)
                .await
                .map(Some),
        )),
        Request::Register { username, password } => Some(Reply::from_result(
            kind,
            register::handle(ctx, username, password).await.map(|()| None),
        )),
        Request::Message {
            session_id,
            receiver,
            message: body,
        } => match message::handle(ctx, peer, &session_id, receiver, body) {
            Ok(delivered) => {
                trace!(peer = %peer.addr, delivered, "Message routed");
                None
            }
            Err(e) => Some(Reply::error(kind, &e)),
        },
        Request::Logout { session_id } => {
            if let Err(e) = logout::handle(ctx, peer, &session_id) {
                debug!(peer = %peer.addr, error = %e, "Logout ignored");
            }
            None
        }
    };

    match reply {
        Some(reply) => send_reply(ctx, peer, kind, &reply).await,
        None => Ok(()),
    }
}

async fn send_reply(
    ctx: &Context,
    peer: &Peer,
    kind: RequestKind,
    reply: &Reply,
) -> Result<(), ConnectionError> {
    if !reply.is_ok() {
        debug!(peer = %peer.addr, request = %kind, reason = ?reply.reason, "Request failed");
    }
    match ctx.encode(reply) {
        Ok(frame) => peer.send(frame).await,
        Err(e) => {
            error!(peer = %peer.addr, error = %e, "Dropping reply");
            Ok(())
        }
    }
}

/// Push one frame to every target without waiting on any of them.
///
/// Targets whose queue is full or closed are skipped. Returns how many
/// frames were queued.
pub fn deliver(targets: &[Target], frame: &Bytes) -> usize {
    let mut queued = 0;
    for target in targets {
        match target.outbound.try_send(frame.clone()) {
            Ok(()) => queued += 1,
            Err(TrySendError::Full(_)) => {
                warn!(peer = %target.addr, "Outbound queue full, dropping message");
            }
            Err(TrySendError::Closed(_)) => {
                trace!(peer = %target.addr, "Recipient already closed");
            }
        }
    }
    queued
}
