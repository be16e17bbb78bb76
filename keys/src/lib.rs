// Copyright (c) Grove Contributors
// SPDX-License-Identifier: Apache-2.0

//! Keystore and cryptographic primitives for Grove.
//!
//! This crate provides:
//! - `crypto`: secp256k1 ECDSA over SHA-256 prehashes, compressed base64url
//!   public keys
//! - `cipher`: AES-256-GCM with the group's shared cipher key
//! - `envelope`: multi-recipient sealing for private-group POST payloads
//! - `keystore`: the `AccountKeystore` capability trait and an in-memory
//!   implementation
//!
//! The keystore is process-wide and thread-safe; the engine receives it as
//! a constructor parameter, never through module-level state.

pub mod cipher;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod keystore;

pub use cipher::{aes_decode, aes_encode, parse_cipher_key};
pub use crypto::{hash, pubkey_from_base64, pubkey_to_base64, sign_hash, verify_sig, KeyPair};
pub use error::KeyError;
pub use keystore::{AccountKeystore, GroupKeyInfo, InMemKeystore};
