use ed25519_dalek::{ExpandedSecretKey, PublicKey as EdPublicKey, SecretKey as EdSecretKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Key generation failed: {0}")]
    GenerationFailed(String),

    #[error("Key deserialization failed: {0}")]
    DeserializationFailed(String),
}

/// Ed25519 public key used to verify runtime signatures.
#[derive(Clone, Copy)]
pub struct PublicKey(EdPublicKey);

// ed25519_dalek::PublicKey没有实现Serialize/Deserialize，按原始字节编码
impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(self.0.as_bytes())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = <Vec<u8>>::deserialize(deserializer)?;
        PublicKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

impl PublicKey {
    /// Returns the underlying Ed25519 key
    pub fn signing_key(&self) -> &EdPublicKey {
        &self.0
    }

    /// Raw 32 byte encoding
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Creates a public key from a byte array
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != 32 {
            return Err(KeyError::DeserializationFailed(format!(
                "Expected 32 bytes, got {}",
                bytes.len()
            )));
        }

        let key = EdPublicKey::from_bytes(bytes)
            .map_err(|e| KeyError::DeserializationFailed(e.to_string()))?;

        Ok(Self(key))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", hex::encode(&self.0.as_bytes()[0..4]))
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes() == other.0.as_bytes()
    }
}

impl Eq for PublicKey {}

/// Ed25519 secret key. Never leaves the node except through `to_bytes`.
pub struct SecretKey(EdSecretKey);

// EdSecretKey不支持Clone，从字节重新创建
impl Clone for SecretKey {
    fn clone(&self) -> Self {
        match EdSecretKey::from_bytes(self.0.as_bytes()) {
            Ok(key) => Self(key),
            // 字节来自一个合法的密钥，长度必然正确
            Err(_) => unreachable!("secret key bytes are always 32 bytes long"),
        }
    }
}

impl SecretKey {
    /// Returns the underlying Ed25519 key
    pub fn signing_key(&self) -> &EdSecretKey {
        &self.0
    }

    /// Expands the key for signing
    pub(crate) fn expanded(&self) -> ExpandedSecretKey {
        ExpandedSecretKey::from(&self.0)
    }

    /// Raw 32 byte encoding, for storage
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Creates a secret key from a byte array
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != 32 {
            return Err(KeyError::DeserializationFailed(format!(
                "Expected 32 bytes, got {}",
                bytes.len()
            )));
        }

        let key = EdSecretKey::from_bytes(bytes)
            .map_err(|e| KeyError::DeserializationFailed(e.to_string()))?;

        Ok(Self(key))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey {{ <redacted> }}")
    }
}

/// Represents a key pair (public and secret keys) held by a runtime or CA.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

impl KeyPair {
    /// Generates a new random key pair
    pub fn generate() -> Result<Self, KeyError> {
        // ed25519-dalek 1.x依赖旧版rand_core，直接用随机种子构造
        let mut seed = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut seed);

        let secret = EdSecretKey::from_bytes(&seed)
            .map_err(|e| KeyError::GenerationFailed(e.to_string()))?;

        Ok(Self::from_secret(SecretKey(secret)))
    }

    /// Creates a key pair from existing secret key
    pub fn from_secret(secret: SecretKey) -> Self {
        let public = EdPublicKey::from(&secret.0);

        Self {
            public: PublicKey(public),
            secret,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let first = KeyPair::generate().expect("Failed to generate keypair");
        let second = KeyPair::generate().expect("Failed to generate keypair");

        assert_ne!(first.public, second.public);
    }

    #[test]
    fn test_secret_key_restores_public_key() {
        let keypair = KeyPair::generate().unwrap();

        let secret = SecretKey::from_bytes(&keypair.secret.to_bytes()).unwrap();
        let restored = KeyPair::from_secret(secret);

        assert_eq!(restored.public, keypair.public);
    }

    #[test]
    fn test_public_key_rejects_bad_length() {
        assert!(PublicKey::from_bytes(&[1u8; 31]).is_err());
    }
}
