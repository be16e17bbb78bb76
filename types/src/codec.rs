// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! Byte-level codec for wire messages and canonical hashing.
//!
//! Wire encoding is bincode. Trx payloads are additionally gzip-compressed
//! on the wire; the signature always covers the *uncompressed* payload, so
//! receivers inflate before verifying.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};

use crate::{ChainError, GroveResult};

/// Wire codec over bincode.
pub struct MessageCodec;

impl MessageCodec {
    /// Encode any serializable value to bytes.
    pub fn encode<T: Serialize>(value: &T) -> GroveResult<Bytes> {
        let bytes = bincode::serialize(value).map_err(|e| ChainError::Codec(e.to_string()))?;
        Ok(Bytes::from(bytes))
    }

    /// Encode to a `Vec<u8>` where an owned buffer is needed.
    pub fn encode_to_vec<T: Serialize>(value: &T) -> GroveResult<Vec<u8>> {
        bincode::serialize(value).map_err(|e| ChainError::Codec(e.to_string()))
    }

    /// Decode bytes back into a value.
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> GroveResult<T> {
        bincode::deserialize(bytes).map_err(|e| ChainError::Codec(e.to_string()))
    }
}

/// SHA-256 over a canonical serialized byte string.
pub fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

/// Gzip-compress a payload for the wire.
pub fn compress(data: &[u8]) -> GroveResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| ChainError::Codec(e.to_string()))
}

/// Streaming gzip inflate of a wire payload.
pub fn decompress(data: &[u8]) -> GroveResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ChainError::Codec(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_roundtrip() {
        let payload = b"some group content, long enough to actually deflate aaaaaaaaaaaaaaaa";
        let packed = compress(payload).unwrap();
        let unpacked = decompress(&packed).unwrap();
        assert_eq!(unpacked, payload);
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        assert!(decompress(b"not a gzip stream").is_err());
    }

    #[test]
    fn test_sha256_is_stable() {
        assert_eq!(sha256(b"abc"), sha256(b"abc"));
        assert_ne!(sha256(b"abc"), sha256(b"abd"));
    }
}
