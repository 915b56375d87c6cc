use crate::crypto::{PublicKey, SecretKey};
use ed25519_dalek::{Signature, Verifier};
use std::convert::TryFrom;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("Verification failed: {0}")]
    VerificationFailed(String),
}

/// 使用私钥签名消息
pub fn sign(secret_key: &SecretKey, message: &[u8]) -> Vec<u8> {
    let public_key = ed25519_dalek::PublicKey::from(secret_key.signing_key());

    secret_key
        .expanded()
        .sign(message, &public_key)
        .to_bytes()
        .to_vec()
}

/// 使用公钥验证签名
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
    if signature.len() != 64 {
        return Err(SignatureError::VerificationFailed("Invalid signature length".to_string()));
    }

    let sig = Signature::try_from(signature)
        .map_err(|e| SignatureError::VerificationFailed(e.to_string()))?;

    public_key
        .signing_key()
        .verify(message, &sig)
        .map_err(|e| SignatureError::VerificationFailed(format!("Verification failed: {}", e)))
}

/// SHA-256摘要
pub fn hash_message(message: &[u8]) -> [u8; 32] {
    let digest = ring::digest::digest(&ring::digest::SHA256, message);

    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    out
}
