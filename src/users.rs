//! User credential store.
//!
//! The server only talks to users through the `UserStore` trait, so a
//! database-backed store can replace `MemoryUserStore` without touching
//! the handlers. Passwords are kept as Argon2id PHC strings.

use crate::error::ChatError;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info};

/// Credential storage used by the Register and Authenticate handlers.
///
/// Implementations may block (hashing is deliberately slow); callers run
/// them on the blocking pool.
pub trait UserStore: Send + Sync {
    /// Create a user. Fails with `UsernameTaken` if the name exists.
    fn register(&self, username: &str, password: &str) -> Result<(), ChatError>;

    /// Check credentials. Unknown users and wrong passwords both fail with
    /// `InvalidCredentials`.
    fn verify(&self, username: &str, password: &str) -> Result<(), ChatError>;
}

/// Users held in process memory; lost on restart.
pub struct MemoryUserStore {
    /// username -> PHC hash
    users: RwLock<HashMap<String, String>>,
    hasher: Argon2<'static>,
}

impl MemoryUserStore {
    /// Create a store hashing with the given Argon2id memory (KiB) and
    /// iteration cost.
    pub fn new(memory_kib: u32, iterations: u32) -> Result<Self, argon2::Error> {
        let params = Params::new(memory_kib, iterations, 1, None)?;
        info!(memory_kib, iterations, "Initializing user store");
        Ok(Self {
            users: RwLock::new(HashMap::new()),
            hasher: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    pub fn len(&self) -> usize {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn hash(&self, password: &str) -> Result<String, ChatError> {
        let salt = SaltString::generate(&mut OsRng);
        self.hasher
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| ChatError::internal(format!("password hashing failed: {e}")))
    }
}

impl UserStore for MemoryUserStore {
    fn register(&self, username: &str, password: &str) -> Result<(), ChatError> {
        if self
            .users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(username)
        {
            return Err(ChatError::UsernameTaken(username.to_string()));
        }

        // Hash outside the lock; the entry check below settles races.
        let hash = self.hash(password)?;

        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        match users.entry(username.to_string()) {
            Entry::Occupied(_) => Err(ChatError::UsernameTaken(username.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(hash);
                debug!(username, "User registered");
                Ok(())
            }
        }
    }

    fn verify(&self, username: &str, password: &str) -> Result<(), ChatError> {
        let stored = self
            .users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(username)
            .cloned()
            .ok_or(ChatError::InvalidCredentials)?;

        let parsed = PasswordHash::new(&stored)
            .map_err(|e| ChatError::internal(format!("stored hash unreadable: {e}")))?;

        match self.hasher.verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(()),
            Err(argon2::password_hash::Error::Password) => Err(ChatError::InvalidCredentials),
            Err(e) => Err(ChatError::internal(e.to_string())),
        }
    }
}
