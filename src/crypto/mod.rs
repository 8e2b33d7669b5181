//! Cryptographic primitives for the tunnel
//!
//! This module provides:
//! - HKDF-SHA256 derivation of per-direction stream keys from the shared secret
//! - Pluggable stream ciphers (ChaCha20, or identity for debugging)
//! - Token generation and verification for tunnel authentication

mod cipher;
mod kdf;
mod token;

pub use cipher::{ChaCha20Stream, CipherKind, CipherSuite, PlainStream, StreamCipher};
pub use kdf::{derive_stream_keys, Hkdf, StreamKeys};
pub use token::{Md5TokenAuthenticator, TokenAuthenticator, MD5_TOKEN_LEN};

use thiserror::Error;

/// Length of a stream cipher key in bytes
pub const KEY_LEN: usize = 32;

/// Length of a stream cipher nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Unknown cipher: {0}")]
    UnknownCipher(String),

    #[error("Shared secret must not be empty")]
    EmptySecret,

    #[error("Keystream exhausted")]
    KeystreamExhausted,
}
