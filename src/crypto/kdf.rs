//! Key Derivation Functions
//!
//! Provides HKDF-SHA256 for deriving stream keys from the shared secret

use super::{CryptoError, KEY_LEN, NONCE_LEN};
use ring::hkdf::{self, Salt, HKDF_SHA256};

/// Fixed salt so that both hops derive identical material from the secret
const STREAM_SALT: &[u8] = b"socks_tunnel_stream_salt";

/// HKDF-SHA256 key derivation
pub struct Hkdf {
    prk: hkdf::Prk,
}

impl Hkdf {
    /// Create HKDF from input keying material
    ///
    /// # Arguments
    /// * `salt` - Optional salt (if None, uses zeros)
    /// * `ikm` - Input keying material
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        let salt = match salt {
            Some(s) => Salt::new(HKDF_SHA256, s),
            None => Salt::new(HKDF_SHA256, &[0u8; 32]),
        };

        Self {
            prk: salt.extract(ikm),
        }
    }

    /// Fill `output` with key material bound to `info`
    pub fn expand(&self, info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
        let info_refs = [info];
        let okm = self
            .prk
            .expand(&info_refs, HkdfLen(output.len()))
            .map_err(|_| CryptoError::KeyDerivation("HKDF expand failed".to_string()))?;

        okm.fill(output)
            .map_err(|_| CryptoError::KeyDerivation("HKDF fill failed".to_string()))
    }

    /// Derive a fixed-size array
    pub fn expand_array<const N: usize>(&self, info: &[u8]) -> Result<[u8; N], CryptoError> {
        let mut out = [0u8; N];
        self.expand(info, &mut out)?;
        Ok(out)
    }
}

/// Helper struct for HKDF output length
struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Key and nonce seeding one stream direction
#[derive(Clone)]
pub struct StreamKeys {
    pub key: [u8; KEY_LEN],
    pub nonce: [u8; NONCE_LEN],
}

impl std::fmt::Debug for StreamKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamKeys([REDACTED])")
    }
}

/// Derive the client->server and server->client stream keys from the
/// shared secret.
///
/// Returns `(upstream, downstream)`.
pub fn derive_stream_keys(secret: &[u8]) -> Result<(StreamKeys, StreamKeys), CryptoError> {
    if secret.is_empty() {
        return Err(CryptoError::EmptySecret);
    }

    let hkdf = Hkdf::new(Some(STREAM_SALT), secret);

    let upstream = StreamKeys {
        key: hkdf.expand_array(b"socks_tunnel upstream key")?,
        nonce: hkdf.expand_array(b"socks_tunnel upstream nonce")?,
    };
    let downstream = StreamKeys {
        key: hkdf.expand_array(b"socks_tunnel downstream key")?,
        nonce: hkdf.expand_array(b"socks_tunnel downstream nonce")?,
    };

    Ok((upstream, downstream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_labels_differ() {
        let hkdf = Hkdf::new(Some(b"salt"), b"input keying material");

        let key1: [u8; KEY_LEN] = hkdf.expand_array(b"label1").unwrap();
        let key2: [u8; KEY_LEN] = hkdf.expand_array(b"label2").unwrap();
        assert_ne!(key1, key2);

        let key1_again: [u8; KEY_LEN] = hkdf.expand_array(b"label1").unwrap();
        assert_eq!(key1, key1_again);
    }

    #[test]
    fn test_stream_keys_deterministic() {
        let (up1, down1) = derive_stream_keys(b"secret").unwrap();
        let (up2, down2) = derive_stream_keys(b"secret").unwrap();

        assert_eq!(up1.key, up2.key);
        assert_eq!(down1.nonce, down2.nonce);
        assert_ne!(up1.key, down1.key);
        assert_ne!(up1.nonce, down1.nonce);
    }

    #[test]
    fn test_stream_keys_depend_on_secret() {
        let (a, _) = derive_stream_keys(b"secret-a").unwrap();
        let (b, _) = derive_stream_keys(b"secret-b").unwrap();
        assert_ne!(a.key, b.key);
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(matches!(
            derive_stream_keys(b""),
            Err(CryptoError::EmptySecret)
        ));
    }
}
