//! chat-relay: a TCP chat relay server
//!
//! Clients exchange JSON frames with the server to:
//! - register a username and password
//! - authenticate and receive a session id
//! - send messages to one user or broadcast them to everyone online
//! - log out
//!
//! The server keeps a registry of live connections and routes messages
//! between them. Credentials live behind the `UserStore` trait; sessions
//! live in memory.

pub mod config;
pub mod error;
pub mod framing;
pub mod handlers;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod users;

pub use config::Config;
pub use error::{ChatError, ConnectionError, ServerError};
pub use server::Server;
pub use users::{MemoryUserStore, UserStore};
