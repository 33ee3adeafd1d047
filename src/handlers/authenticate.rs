//! AUTHENTICATE handler.

use super::{Context, Peer};
use crate::error::ChatError;
use std::sync::Arc;
use tracing::{debug, info};

/// Verify credentials and bind a new session to the peer's connection.
///
/// Returns the new session id. A session previously bound to the same
/// connection is invalidated.
pub async fn handle(
    ctx: &Context,
    peer: &Peer,
    username: String,
    password: String,
) -> Result<String, ChatError> {
    let users = Arc::clone(&ctx.users);
    let name = username.clone();
    tokio::task::spawn_blocking(move || users.verify(&name, &password))
        .await
        .map_err(|e| ChatError::internal(format!("verify task failed: {e}")))??;

    let session = ctx.sessions.create(&username);
    let session_id = session.id.clone();

    match ctx.registry.bind_session(&peer.addr, session) {
        Ok(Some(previous)) => {
            ctx.sessions.invalidate(&previous.id);
            debug!(peer = %peer.addr, previous = %previous.username, "Replaced session");
        }
        Ok(None) => {}
        Err(orphan) => {
            // Connection went away mid-request
            ctx.sessions.invalidate(&orphan.id);
            return Err(ChatError::InvalidSession);
        }
    }

    info!(peer = %peer.addr, username = %username, "User authenticated");
    Ok(session_id)
}
