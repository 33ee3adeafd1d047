//! MESSAGE handler.
//!
//! Routing rules:
//! - receiver `BROADCAST`: every authenticated connection except the sender's
//! - any other receiver: every connection bound to that username, or an
//!   error back to the sender if there is none
//!
//! Delivery is fire-and-forget onto the recipients' outbound queues.

use super::{deliver, Context, Peer};
use crate::error::ChatError;
use crate::protocol::{Delivery, BROADCAST};
use tracing::trace;

/// Route a message. Returns the number of connections it was queued for.
pub fn handle(
    ctx: &Context,
    peer: &Peer,
    session_id: &str,
    receiver: String,
    message: String,
) -> Result<usize, ChatError> {
    let session = ctx
        .registry
        .session_of(&peer.addr)
        .filter(|session| session.id == session_id)
        .ok_or(ChatError::InvalidSession)?;

    if ctx.sessions.validate(session_id).is_none() {
        ctx.registry.clear_session(&peer.addr, session_id);
        return Err(ChatError::InvalidSession);
    }

    let targets = if receiver == BROADCAST {
        ctx.registry.broadcast_targets(&peer.addr)
    } else {
        let targets = ctx.registry.lookup_user(&receiver);
        if targets.is_empty() {
            return Err(ChatError::ReceiverOffline(receiver));
        }
        targets
    };

    let delivery = Delivery::new(&session.username, &receiver, message);
    let frame = ctx.encode(&delivery)?;
    let queued = deliver(&targets, &frame);
    trace!(
        sender = %session.username,
        receiver = %receiver,
        targets = targets.len(),
        queued,
        "Message delivered"
    );
    Ok(queued)
}
