//! LOGOUT handler.

use super::{Context, Peer};
use crate::error::ChatError;
use tracing::info;

/// Invalidate the session bound to this connection. The connection itself
/// stays open.
pub fn handle(ctx: &Context, peer: &Peer, session_id: &str) -> Result<(), ChatError> {
    let session = ctx
        .registry
        .clear_session(&peer.addr, session_id)
        .ok_or(ChatError::InvalidSession)?;
    ctx.sessions.invalidate(&session.id);

    info!(peer = %peer.addr, username = %session.username, "User logged out");
    Ok(())
}
