mod keys;
mod signing;

pub use keys::{KeyError, KeyPair, PublicKey, SecretKey};
pub use signing::{hash_message, sign, verify, SignatureError};

/*
 * Cryptography module for the registry DHT
 *
 * This module handles the primitive operations used by the trust layer:
 * - Ed25519 key generation and (de)serialization
 * - Signing and verification of challenge payloads
 * - SHA-256 digests used for node ids and DHT keys
 */
