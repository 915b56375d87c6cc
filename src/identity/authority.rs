use crate::crypto::{sign, KeyPair, PublicKey, SecretKey};
use crate::identity::{Certificate, CertificateError};
use chrono::{Duration, Utc};
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// 根证书有效期（天）
const ROOT_VALIDITY_DAYS: i64 = 3650;

/// 运行时证书有效期（天）
const RUNTIME_VALIDITY_DAYS: i64 = 365;

const CA_KEY_FILE: &str = "ca.key";
const CA_CERT_FILE: &str = "ca.pem";

/// 证书颁发机构
///
/// 持有自签名的根证书和对应私钥，为运行时签发证书。
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    keypair: KeyPair,
    certificate: Certificate,
}

impl CertificateAuthority {
    /// Creates a new CA with a fresh key and a self-signed root
    pub fn new(name: &str) -> Result<Self, CertificateError> {
        let keypair =
            KeyPair::generate().map_err(|e| CertificateError::EncodingFailed(e.to_string()))?;

        let certificate = Self::sign_certificate(
            name,
            name,
            keypair.public,
            Duration::days(ROOT_VALIDITY_DAYS),
            &keypair.secret,
        )?;

        Ok(Self { keypair, certificate })
    }

    /// The CA's root certificate
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// CA name, used as the issuer of every certificate it signs
    pub fn name(&self) -> &str {
        &self.certificate.subject
    }

    /// Issues a runtime certificate for `subject`
    pub fn issue(&self, subject: &str, public_key: PublicKey) -> Result<Certificate, CertificateError> {
        self.issue_with_validity(subject, public_key, Duration::days(RUNTIME_VALIDITY_DAYS))
    }

    /// Issues a runtime certificate with an explicit validity period
    pub fn issue_with_validity(
        &self,
        subject: &str,
        public_key: PublicKey,
        validity: Duration,
    ) -> Result<Certificate, CertificateError> {
        Self::sign_certificate(subject, self.name(), public_key, validity, &self.keypair.secret)
    }

    fn sign_certificate(
        subject: &str,
        issuer: &str,
        public_key: PublicKey,
        validity: Duration,
        signer: &SecretKey,
    ) -> Result<Certificate, CertificateError> {
        let now = Utc::now();

        let mut certificate = Certificate {
            serial: Uuid::new_v4(),
            subject: subject.to_string(),
            issuer: issuer.to_string(),
            public_key,
            not_before: now - Duration::minutes(5),
            not_after: now + validity,
            signature: Vec::new(),
        };

        certificate.signature = sign(signer, &certificate.tbs_bytes()?);

        Ok(certificate)
    }

    /// 保存CA到目录（私钥为hex文本）
    pub fn save(&self, dir: &Path) -> Result<(), CertificateError> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join(CA_KEY_FILE), hex::encode(self.keypair.secret.to_bytes()))?;
        fs::write(dir.join(CA_CERT_FILE), self.certificate.to_pem()?)?;
        Ok(())
    }

    /// 从目录加载CA
    pub fn load(dir: &Path) -> Result<Self, CertificateError> {
        let keypair = load_keypair(&dir.join(CA_KEY_FILE))?;
        let certificate = Certificate::load(&dir.join(CA_CERT_FILE))?;

        if certificate.public_key != keypair.public {
            return Err(CertificateError::EncodingFailed(
                "CA key does not match CA certificate".to_string(),
            ));
        }

        Ok(Self { keypair, certificate })
    }
}

/// Reads a hex encoded Ed25519 secret key file
pub fn load_keypair(path: &Path) -> Result<KeyPair, CertificateError> {
    let text = fs::read_to_string(path)?;
    let bytes = hex::decode(text.trim()).map_err(|e| CertificateError::EncodingFailed(e.to_string()))?;
    let secret =
        SecretKey::from_bytes(&bytes).map_err(|e| CertificateError::EncodingFailed(e.to_string()))?;

    Ok(KeyPair::from_secret(secret))
}

/// Writes a secret key as hex text
pub fn save_keypair(path: &Path, keypair: &KeyPair) -> Result<(), CertificateError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, hex::encode(keypair.secret.to_bytes()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::verify;

    #[test]
    fn test_issued_certificate_is_signed_by_ca() {
        let ca = CertificateAuthority::new("testdomain").unwrap();
        let runtime = KeyPair::generate().unwrap();

        let cert = ca.issue("runtime-1", runtime.public).unwrap();

        assert_eq!(cert.issuer, "testdomain");
        assert_eq!(cert.public_key, runtime.public);
        assert!(verify(&ca.certificate().public_key, &cert.tbs_bytes().unwrap(), &cert.signature).is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::new("testdomain").unwrap();
        ca.save(dir.path()).unwrap();

        let loaded = CertificateAuthority::load(dir.path()).unwrap();
        assert_eq!(loaded.certificate(), ca.certificate());

        // 加载后的CA仍能签发可验证的证书
        let runtime = KeyPair::generate().unwrap();
        let cert = loaded.issue("runtime-2", runtime.public).unwrap();
        assert!(verify(&ca.certificate().public_key, &cert.tbs_bytes().unwrap(), &cert.signature).is_ok());
    }
}
