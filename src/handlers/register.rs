//! REGISTER handler.

use super::Context;
use crate::error::ChatError;
use crate::protocol::BROADCAST;
use std::sync::Arc;
use tracing::info;

pub const MAX_USERNAME_LEN: usize = 32;

/// Create a user. No session is created; the client authenticates next.
pub async fn handle(ctx: &Context, username: String, password: String) -> Result<(), ChatError> {
    validate_username(&username)?;
    if password.is_empty() {
        return Err(ChatError::EmptyPassword);
    }

    let users = Arc::clone(&ctx.users);
    let name = username.clone();
    tokio::task::spawn_blocking(move || users.register(&name, &password))
        .await
        .map_err(|e| ChatError::internal(format!("register task failed: {e}")))??;

    info!(username = %username, "User registered");
    Ok(())
}

fn validate_username(username: &str) -> Result<(), ChatError> {
    let len = username.chars().count();
    if len == 0
        || len > MAX_USERNAME_LEN
        || username.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(ChatError::InvalidUsername {
            max: MAX_USERNAME_LEN,
        });
    }
    if username.eq_ignore_ascii_case(BROADCAST) {
        return Err(ChatError::ReservedUsername(username.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::tests::context;

    #[tokio::test]
    async fn test_register_succeeds_exactly_once() {
        let ctx = context();

        assert!(handle(&ctx, "alice".into(), "p".into()).await.is_ok());
        assert_eq!(
            handle(&ctx, "alice".into(), "q".into()).await,
            Err(ChatError::UsernameTaken("alice".into()))
        );
    }

    #[tokio::test]
    async fn test_concurrent_registrations_single_winner() {
        let ctx = Arc::new(context());
        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move { handle(&ctx, "race".into(), "pw".into()).await.is_ok() })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_rejects_bad_input() {
        let ctx = context();

        assert_eq!(
            handle(&ctx, "".into(), "p".into()).await,
            Err(ChatError::InvalidUsername { max: MAX_USERNAME_LEN })
        );
        assert_eq!(
            handle(&ctx, "has space".into(), "p".into()).await,
            Err(ChatError::InvalidUsername { max: MAX_USERNAME_LEN })
        );
        assert_eq!(
            handle(&ctx, "x".repeat(MAX_USERNAME_LEN + 1), "p".into()).await,
            Err(ChatError::InvalidUsername { max: MAX_USERNAME_LEN })
        );
        assert_eq!(
            handle(&ctx, "broadcast".into(), "p".into()).await,
            Err(ChatError::ReservedUsername("broadcast".into()))
        );
        assert_eq!(
            handle(&ctx, "bob".into(), "".into()).await,
            Err(ChatError::EmptyPassword)
        );
    }
}
