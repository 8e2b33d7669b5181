//! Tunnel authentication tokens
//!
//! A token is a fixed-length credential derived deterministically from a
//! shared key. The client sends `generate(key)` in its auth frame, the server
//! accepts it when the token belongs to a registered key.

use parking_lot::RwLock;
use std::collections::HashMap;

/// Length of an MD5 token in bytes
pub const MD5_TOKEN_LEN: usize = 16;

/// Token derivation plus a mutable registry of accepted keys
pub trait TokenAuthenticator: Send + Sync {
    /// Fixed output length of `generate`
    fn token_len(&self) -> usize;

    /// Derive the token for `key`
    fn generate(&self, key: &str) -> Vec<u8>;

    /// Whether `token` belongs to a registered key
    fn verify(&self, token: &[u8]) -> bool;

    /// Register a key; returns false if it was already present
    fn add(&self, key: &str) -> bool;

    /// Unregister a key; returns false if it was not present
    fn remove(&self, key: &str) -> bool;

    /// Registered keys, sorted
    fn list_keys(&self) -> Vec<String>;
}

/// MD5-digest tokens with an in-memory key registry
#[derive(Debug, Default)]
pub struct Md5TokenAuthenticator {
    registry: RwLock<HashMap<[u8; MD5_TOKEN_LEN], String>>,
}

impl Md5TokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an authenticator with `keys` registered
    pub fn with_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let auth = Self::new();
        for key in keys {
            auth.add(key.as_ref());
        }
        auth
    }

    fn digest(key: &str) -> [u8; MD5_TOKEN_LEN] {
        md5::compute(key.as_bytes()).0
    }
}

impl TokenAuthenticator for Md5TokenAuthenticator {
    fn token_len(&self) -> usize {
        MD5_TOKEN_LEN
    }

    fn generate(&self, key: &str) -> Vec<u8> {
        Self::digest(key).to_vec()
    }

    fn verify(&self, token: &[u8]) -> bool {
        let Ok(token) = <[u8; MD5_TOKEN_LEN]>::try_from(token) else {
            return false;
        };
        self.registry.read().contains_key(&token)
    }

    fn add(&self, key: &str) -> bool {
        self.registry
            .write()
            .insert(Self::digest(key), key.to_string())
            .is_none()
    }

    fn remove(&self, key: &str) -> bool {
        self.registry.write().remove(&Self::digest(key)).is_some()
    }

    fn list_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.registry.read().values().cloned().collect();
        keys.sort();
        keys
    }
}
