use crate::crypto::verify;
use crate::identity::Certificate;
use crate::storage::DatabaseError;
use chrono::Utc;
use log::debug;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrustError {
    #[error("Certificate issuer is not trusted: {0}")]
    UnknownIssuer(String),

    #[error("Certificate signature is invalid: {0}")]
    BadCertificateSignature(String),

    #[error("Certificate is outside its validity period: {0}")]
    Expired(String),

    #[error("Root certificate is not self-signed: {0}")]
    NotSelfSigned(String),

    #[error("Signature verification failed: {0}")]
    VerificationFailed(String),

    #[error("Certificate could not be read: {0}")]
    InvalidCertificate(String),

    #[error("Certificate could not be stored: {0}")]
    Storage(#[from] DatabaseError),
}

/// 受信任的CA根证书集合
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    /// CA名字 -> 根证书
    roots: HashMap<String, Certificate>,
}

impl TrustStore {
    /// Creates an empty trust store
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加根证书，根证书必须是自签名的
    pub fn add_root(&mut self, root: Certificate) -> Result<(), TrustError> {
        if !root.is_self_issued() {
            return Err(TrustError::NotSelfSigned(root.subject.clone()));
        }

        let tbs = root
            .tbs_bytes()
            .map_err(|e| TrustError::InvalidCertificate(e.to_string()))?;
        verify(&root.public_key, &tbs, &root.signature)
            .map_err(|e| TrustError::BadCertificateSignature(e.to_string()))?;

        debug!("Trusting CA {}", root.subject);
        self.roots.insert(root.subject.clone(), root);
        Ok(())
    }

    /// Loads every `*.pem` file in `dir` as a trusted root
    pub fn load_dir(dir: &Path) -> Result<Self, TrustError> {
        let mut store = Self::new();

        let entries = std::fs::read_dir(dir).map_err(|e| TrustError::InvalidCertificate(e.to_string()))?;
        for entry in entries {
            let path = entry
                .map_err(|e| TrustError::InvalidCertificate(e.to_string()))?
                .path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("pem") {
                continue;
            }

            let root = Certificate::load(&path).map_err(|e| TrustError::InvalidCertificate(e.to_string()))?;
            store.add_root(root)?;
        }

        Ok(store)
    }

    /// Number of trusted roots
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// 验证证书由受信任的CA签发且在有效期内
    pub fn verify_certificate(&self, cert: &Certificate) -> Result<(), TrustError> {
        let root = self
            .roots
            .get(&cert.issuer)
            .ok_or_else(|| TrustError::UnknownIssuer(cert.issuer.clone()))?;

        let tbs = cert
            .tbs_bytes()
            .map_err(|e| TrustError::InvalidCertificate(e.to_string()))?;
        verify(&root.public_key, &tbs, &cert.signature)
            .map_err(|e| TrustError::BadCertificateSignature(format!("{}: {}", cert.subject, e)))?;

        let now = Utc::now();
        if !cert.is_valid_at(now) || !root.is_valid_at(now) {
            return Err(TrustError::Expired(cert.subject.clone()));
        }

        Ok(())
    }
}
