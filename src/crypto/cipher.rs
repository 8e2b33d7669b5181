//! Stream ciphers used by the frame codec
//!
//! A stream cipher here is a stateful keystream cursor: every call continues
//! where the previous one stopped, so one instance must be used for exactly
//! one direction of one connection.

use super::{derive_stream_keys, CryptoError, StreamKeys};
use chacha20::cipher::{KeyIvInit, StreamCipher as _};
use chacha20::ChaCha20;
use std::str::FromStr;

/// Pluggable keystream primitive
pub trait StreamCipher: Send {
    /// XOR the next `data.len()` keystream bytes into `data`
    fn apply_keystream(&mut self, data: &mut [u8]) -> Result<(), CryptoError>;

    /// Short name for logging
    fn name(&self) -> &'static str;
}

/// ChaCha20 (IETF) keystream
pub struct ChaCha20Stream {
    inner: ChaCha20,
}

impl ChaCha20Stream {
    pub fn new(keys: &StreamKeys) -> Self {
        Self {
            inner: ChaCha20::new(&keys.key.into(), &keys.nonce.into()),
        }
    }
}

impl StreamCipher for ChaCha20Stream {
    fn apply_keystream(&mut self, data: &mut [u8]) -> Result<(), CryptoError> {
        self.inner
            .try_apply_keystream(data)
            .map_err(|_| CryptoError::KeystreamExhausted)
    }

    fn name(&self) -> &'static str {
        "chacha20"
    }
}

/// Identity cipher, frames carry plaintext
#[derive(Debug, Default)]
pub struct PlainStream;

impl StreamCipher for PlainStream {
    fn apply_keystream(&mut self, _data: &mut [u8]) -> Result<(), CryptoError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Cipher selection from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    ChaCha20,
    None,
}

impl FromStr for CipherKind {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chacha20" => Ok(CipherKind::ChaCha20),
            "none" | "plain" => Ok(CipherKind::None),
            other => Err(CryptoError::UnknownCipher(other.to_string())),
        }
    }
}

/// Seeds fresh cipher instances for every tunnel connection.
///
/// Holds the derived key material only; cipher state itself is never
/// shared, each call hands out new cursors positioned at the stream start.
///
/// # Keystream reuse
///
/// Keys and nonces derive from the shared secret alone, so every connection
/// under one secret encrypts each direction with the same keystream. XOR of
/// two captured ciphertexts at equal offsets yields the XOR of the
/// plaintexts (a two-time pad), and frames are not authenticated beyond the
/// CRC32. The tunnel hides payloads from casual inspection only; run it
/// inside a transport that provides confidentiality when that matters.
#[derive(Debug, Clone)]
pub struct CipherSuite {
    kind: CipherKind,
    upstream: Option<StreamKeys>,
    downstream: Option<StreamKeys>,
}

impl CipherSuite {
    /// Build a suite from the configured cipher and shared secret
    pub fn new(kind: CipherKind, secret: &str) -> Result<Self, CryptoError> {
        match kind {
            CipherKind::ChaCha20 => {
                let (upstream, downstream) = derive_stream_keys(secret.as_bytes())?;
                Ok(Self {
                    kind,
                    upstream: Some(upstream),
                    downstream: Some(downstream),
                })
            }
            CipherKind::None => Ok(Self::plain()),
        }
    }

    /// Suite whose frames are not ciphered
    pub fn plain() -> Self {
        Self {
            kind: CipherKind::None,
            upstream: None,
            downstream: None,
        }
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// `(encryptor, decryptor)` for the client end of a tunnel
    pub fn client_ciphers(&self) -> (Box<dyn StreamCipher>, Box<dyn StreamCipher>) {
        (
            Self::make(self.upstream.as_ref()),
            Self::make(self.downstream.as_ref()),
        )
    }

    /// `(encryptor, decryptor)` for the server end of a tunnel
    pub fn server_ciphers(&self) -> (Box<dyn StreamCipher>, Box<dyn StreamCipher>) {
        (
            Self::make(self.downstream.as_ref()),
            Self::make(self.upstream.as_ref()),
        )
    }

    fn make(keys: Option<&StreamKeys>) -> Box<dyn StreamCipher> {
        match keys {
            Some(keys) => Box::new(ChaCha20Stream::new(keys)),
            None => Box::new(PlainStream),
        }
    }
}
