//! Frame encoding/decoding for the relay stream
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+--------+--------+----------------
//! |  Length (2B)    |          CRC32 of plaintext (4B)  |  Ciphertext ...
//! +--------+--------+--------+--------+--------+--------+----------------
//! ```
//!
//! `Length` counts the bytes after itself (checksum + ciphertext). Frames are
//! written back to back onto the TCP stream, so the decoder has to put them
//! together again from whatever chunks the socket hands out.

use super::TunnelError;
use crate::crypto::StreamCipher;
use bytes::{BufMut, BytesMut};

/// Size of the length prefix
pub const LENGTH_HEADER_SIZE: usize = 2;

/// Size of the plaintext checksum
pub const CHECKSUM_SIZE: usize = 4;

/// Bytes added to every plaintext chunk
pub const FRAME_OVERHEAD: usize = LENGTH_HEADER_SIZE + CHECKSUM_SIZE;

/// Largest value of the length field
pub const MAX_FRAME_BODY: usize = u16::MAX as usize;

/// Largest plaintext carried by one frame
pub const MAX_FRAME_PAYLOAD: usize = MAX_FRAME_BODY - CHECKSUM_SIZE;

/// Largest encoded frame, length prefix included
pub const MAX_FRAME_SIZE: usize = LENGTH_HEADER_SIZE + MAX_FRAME_BODY;

/// Per-connection frame codec.
///
/// Owns one encrypt and one decrypt keystream cursor; both advance with every
/// frame and are never rewound, so a codec belongs to exactly one tunnel
/// connection.
pub struct FrameCodec {
    encryptor: Box<dyn StreamCipher>,
    decryptor: Box<dyn StreamCipher>,
}

impl FrameCodec {
    pub fn new(encryptor: Box<dyn StreamCipher>, decryptor: Box<dyn StreamCipher>) -> Self {
        Self {
            encryptor,
            decryptor,
        }
    }

    /// Encode `plain` as one or more frames appended to `out`
    pub fn encrypt(&mut self, plain: &[u8], out: &mut BytesMut) -> Result<(), TunnelError> {
        for chunk in plain.chunks(MAX_FRAME_PAYLOAD) {
            self.encrypt_frame(chunk, out)?;
        }
        Ok(())
    }

    fn encrypt_frame(&mut self, chunk: &[u8], out: &mut BytesMut) -> Result<(), TunnelError> {
        out.reserve(FRAME_OVERHEAD + chunk.len());

        // length is backpatched once the body is in place
        let start = out.len();
        out.put_u16(0);
        out.put_u32(crc32fast::hash(chunk));

        let body = out.len();
        out.extend_from_slice(chunk);
        self.encryptor.apply_keystream(&mut out[body..])?;

        let len = (CHECKSUM_SIZE + chunk.len()) as u16;
        out[start..start + LENGTH_HEADER_SIZE].copy_from_slice(&len.to_be_bytes());
        Ok(())
    }

    /// Decode as many complete frames from `input` as possible, appending
    /// their plaintext to `out`.
    ///
    /// `scratch` carries the unfinished frame between calls: empty, one byte
    /// of the length header, or the full header plus part of the body.
    /// Returns whether at least one frame was completed.
    pub fn decrypt(
        &mut self,
        scratch: &mut BytesMut,
        mut input: &[u8],
        out: &mut BytesMut,
    ) -> Result<bool, TunnelError> {
        let mut progressed = false;

        loop {
            match scratch.len() {
                0 => {
                    if input.len() < LENGTH_HEADER_SIZE {
                        scratch.extend_from_slice(input);
                        return Ok(progressed);
                    }

                    let len = frame_len(&input[..LENGTH_HEADER_SIZE])?;
                    let body = &input[LENGTH_HEADER_SIZE..];
                    if body.len() < len {
                        scratch.extend_from_slice(input);
                        return Ok(progressed);
                    }

                    self.decode_frame(&body[..len], out)?;
                    progressed = true;
                    input = &body[len..];
                }
                1 => {
                    let Some((&byte, rest)) = input.split_first() else {
                        return Ok(progressed);
                    };
                    scratch.put_u8(byte);
                    input = rest;
                    frame_len(&scratch[..LENGTH_HEADER_SIZE])?;
                }
                pending => {
                    let len = frame_len(&scratch[..LENGTH_HEADER_SIZE])?;
                    let needed = len - (pending - LENGTH_HEADER_SIZE);
                    if input.len() < needed {
                        scratch.extend_from_slice(input);
                        return Ok(progressed);
                    }

                    scratch.extend_from_slice(&input[..needed]);
                    input = &input[needed..];

                    let decoded = self.decode_frame(&scratch[LENGTH_HEADER_SIZE..], out);
                    scratch.clear();
                    decoded?;
                    progressed = true;
                }
            }

            if input.is_empty() {
                return Ok(progressed);
            }
        }
    }

    fn decode_frame(&mut self, body: &[u8], out: &mut BytesMut) -> Result<(), TunnelError> {
        let (checksum, ciphertext) = body.split_at(CHECKSUM_SIZE);
        let expected = u32::from_be_bytes([checksum[0], checksum[1], checksum[2], checksum[3]]);

        let start = out.len();
        out.extend_from_slice(ciphertext);
        self.decryptor.apply_keystream(&mut out[start..])?;

        let actual = crc32fast::hash(&out[start..]);
        if actual != expected {
            out.truncate(start);
            return Err(TunnelError::ChecksumMismatch { expected, actual });
        }
        Ok(())
    }
}

/// Parse and validate a length header
fn frame_len(header: &[u8]) -> Result<usize, TunnelError> {
    let len = u16::from_be_bytes([header[0], header[1]]) as usize;
    if len < CHECKSUM_SIZE {
        return Err(TunnelError::InvalidFrame(format!(
            "frame length {} shorter than checksum",
            len
        )));
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherKind, CipherSuite};
    use rand::{Rng, RngCore};

    fn codec_pair() -> (FrameCodec, FrameCodec) {
        let suite = CipherSuite::new(CipherKind::ChaCha20, "frame-test").unwrap();
        let (enc, dec) = suite.client_ciphers();
        let client = FrameCodec::new(enc, dec);
        let (enc, dec) = suite.server_ciphers();
        let server = FrameCodec::new(enc, dec);
        (client, server)
    }

    fn encode(codec: &mut FrameCodec, messages: &[&[u8]]) -> BytesMut {
        let mut wire = BytesMut::new();
        for msg in messages {
            codec.encrypt(msg, &mut wire).unwrap();
        }
        wire
    }

    fn feed(codec: &mut FrameCodec, chunks: &[&[u8]]) -> Vec<u8> {
        let mut scratch = BytesMut::new();
        let mut out = BytesMut::new();
        for chunk in chunks {
            codec.decrypt(&mut scratch, chunk, &mut out).unwrap();
        }
        assert!(scratch.is_empty(), "frame left unfinished");
        out.to_vec()
    }

    #[test]
    fn test_frame_layout() {
        let (mut client, _) = codec_pair();
        let wire = encode(&mut client, &[b"hello"]);

        assert_eq!(wire.len(), FRAME_OVERHEAD + 5);
        assert_eq!(&wire[..2], &9u16.to_be_bytes());
        assert_eq!(&wire[2..6], &crc32fast::hash(b"hello").to_be_bytes());
        assert_ne!(&wire[6..], b"hello");
    }

    #[test]
    fn test_single_frame_exact_chunk() {
        let (mut client, mut server) = codec_pair();
        let wire = encode(&mut client, &[b"exact"]);

        let mut scratch = BytesMut::new();
        let mut out = BytesMut::new();
        assert!(server.decrypt(&mut scratch, &wire, &mut out).unwrap());
        assert_eq!(&out[..], b"exact");
        assert!(scratch.is_empty());
    }

    #[test]
    fn test_one_byte_at_a_time() {
        let (mut client, mut server) = codec_pair();
        let wire = encode(&mut client, &[b"first", b"", b"second frame"]);

        let mut scratch = BytesMut::new();
        let mut out = BytesMut::new();
        let mut completed = 0;
        for byte in wire.iter() {
            if server
                .decrypt(&mut scratch, std::slice::from_ref(byte), &mut out)
                .unwrap()
            {
                completed += 1;
            }
            assert!(scratch.len() <= LENGTH_HEADER_SIZE + 16);
        }
        // the empty message produces no frame
        assert_eq!(completed, 2);
        assert_eq!(&out[..], b"firstsecond frame");
    }

    #[test]
    fn test_split_mid_header() {
        let (mut client, mut server) = codec_pair();
        let wire = encode(&mut client, &[b"abc", b"defg"]);

        // 1 byte of the first header, then the rest plus one byte of the next header
        let first_len = FRAME_OVERHEAD + 3;
        let out = feed(
            &mut server,
            &[&wire[..1], &wire[1..first_len + 1], &wire[first_len + 1..]],
        );
        assert_eq!(out, b"abcdefg");
    }

    #[test]
    fn test_coalesced_frames() {
        for count in 1..=5 {
            let (mut client, mut server) = codec_pair();
            let messages: Vec<Vec<u8>> = (0..count).map(|i| vec![i as u8; 10 + i]).collect();
            let refs: Vec<&[u8]> = messages.iter().map(|m| m.as_slice()).collect();
            let wire = encode(&mut client, &refs);

            let out = feed(&mut server, &[&wire]);
            assert_eq!(out, messages.concat());
        }
    }

    #[test]
    fn test_partial_body_then_coalesced_remainder() {
        let (mut client, mut server) = codec_pair();
        let wire = encode(&mut client, &[b"0123456789", b"abc", b"xyz"]);

        let mut scratch = BytesMut::new();
        let mut out = BytesMut::new();
        assert!(!server.decrypt(&mut scratch, &wire[..8], &mut out).unwrap());
        assert_eq!(scratch.len(), 8);
        assert!(out.is_empty());

        assert!(server.decrypt(&mut scratch, &wire[8..], &mut out).unwrap());
        assert!(scratch.is_empty());
        assert_eq!(&out[..], b"0123456789abcxyz");
    }

    #[test]
    fn test_random_chunking() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let (mut client, mut server) = codec_pair();
            let messages: Vec<Vec<u8>> = (0..rng.gen_range(1..8))
                .map(|_| {
                    let mut m = vec![0u8; rng.gen_range(0..3000)];
                    rng.fill_bytes(&mut m);
                    m
                })
                .collect();
            let refs: Vec<&[u8]> = messages.iter().map(|m| m.as_slice()).collect();
            let wire = encode(&mut client, &refs);

            let mut chunks = Vec::new();
            let mut rest = &wire[..];
            while !rest.is_empty() {
                let n = rng.gen_range(1..=rest.len().min(700));
                let (head, tail) = rest.split_at(n);
                chunks.push(head);
                rest = tail;
            }

            assert_eq!(feed(&mut server, &chunks), messages.concat());
        }
    }

    #[test]
    fn test_large_plaintext_is_split() {
        let (mut client, mut server) = codec_pair();
        let plain = vec![0x5au8; MAX_FRAME_PAYLOAD + 100];
        let wire = encode(&mut client, &[&plain]);

        assert_eq!(wire.len(), plain.len() + 2 * FRAME_OVERHEAD);
        assert_eq!(feed(&mut server, &[&wire]), plain);
    }

    #[test]
    fn test_checksum_mismatch_is_fatal() {
        let (mut client, mut server) = codec_pair();
        let mut wire = encode(&mut client, &[b"tamper me"]);
        let last = wire.len() - 1;
        wire[last] ^= 0xff;

        let mut scratch = BytesMut::new();
        let mut out = BytesMut::new();
        let err = server.decrypt(&mut scratch, &wire, &mut out).unwrap_err();
        assert!(matches!(err, TunnelError::ChecksumMismatch { .. }));
        assert!(out.is_empty());
    }

    #[test]
    fn test_short_length_rejected() {
        let (_, mut server) = codec_pair();
        let mut scratch = BytesMut::new();
        let mut out = BytesMut::new();

        let err = server
            .decrypt(&mut scratch, &[0x00, 0x02, 0xaa, 0xbb], &mut out)
            .unwrap_err();
        assert!(matches!(err, TunnelError::InvalidFrame(_)));
    }

    #[test]
    fn test_plain_suite_passes_bytes_through() {
        let suite = CipherSuite::plain();
        let (enc, dec) = suite.client_ciphers();
        let mut codec = FrameCodec::new(enc, dec);
        let wire = encode(&mut codec, &[b"visible"]);
        assert_eq!(&wire[6..], b"visible");
    }
}
