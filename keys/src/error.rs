// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

use grove_types::ChainError;
use thiserror::Error;

/// Errors from key handling and the crypto primitives.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("malformed signature")]
    MalformedSignature,

    #[error("decryption failed")]
    DecryptFailed,

    #[error("encryption failed")]
    EncryptFailed,

    #[error("no keys for group <{0}>")]
    NoSuchGroup(String),
}

impl From<KeyError> for ChainError {
    fn from(e: KeyError) -> Self {
        ChainError::Key(e.to_string())
    }
}
