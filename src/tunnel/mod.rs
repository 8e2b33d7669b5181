//! Tunnel layer - encrypted relay stream between the two hops
//!
//! Provides:
//! - Length-prefixed, checksummed, stream-ciphered frames
//! - Reassembly of frames split across arbitrary reads

mod frame;

pub use frame::{
    FrameCodec, CHECKSUM_SIZE, FRAME_OVERHEAD, LENGTH_HEADER_SIZE, MAX_FRAME_BODY,
    MAX_FRAME_PAYLOAD, MAX_FRAME_SIZE,
};

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}
