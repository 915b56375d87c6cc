use crate::crypto::{hash_message, PublicKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const PEM_BEGIN: &str = "-----BEGIN NODE CERTIFICATE-----";
const PEM_END: &str = "-----END NODE CERTIFICATE-----";
const PEM_LINE_WIDTH: usize = 64;

#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("Certificate encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Invalid PEM block: {0}")]
    InvalidPem(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// 运行时证书
///
/// 由CA签发，把一个运行时名字绑定到它的Ed25519公钥上。证书编码的
/// SHA-256摘要决定了节点在DHT中的ID。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    /// 序列号
    pub serial: Uuid,

    /// 证书主体（运行时名字）
    pub subject: String,

    /// 签发者（CA名字）
    pub issuer: String,

    /// 主体公钥
    pub public_key: PublicKey,

    /// 生效时间
    pub not_before: DateTime<Utc>,

    /// 过期时间
    pub not_after: DateTime<Utc>,

    /// 签发者对其余字段的签名
    pub signature: Vec<u8>,
}

/// 被签名的证书字段
#[derive(Serialize)]
struct TbsCertificate<'a> {
    serial: &'a Uuid,
    subject: &'a str,
    issuer: &'a str,
    public_key: &'a PublicKey,
    not_before: &'a DateTime<Utc>,
    not_after: &'a DateTime<Utc>,
}

impl Certificate {
    /// Bytes covered by the issuer signature
    pub fn tbs_bytes(&self) -> Result<Vec<u8>, CertificateError> {
        let tbs = TbsCertificate {
            serial: &self.serial,
            subject: &self.subject,
            issuer: &self.issuer,
            public_key: &self.public_key,
            not_before: &self.not_before,
            not_after: &self.not_after,
        };

        bincode::serialize(&tbs).map_err(|e| CertificateError::EncodingFailed(e.to_string()))
    }

    /// Full binary encoding, signature included
    pub fn encode(&self) -> Result<Vec<u8>, CertificateError> {
        bincode::serialize(self).map_err(|e| CertificateError::EncodingFailed(e.to_string()))
    }

    /// Decodes a certificate from its binary encoding
    pub fn decode(bytes: &[u8]) -> Result<Self, CertificateError> {
        bincode::deserialize(bytes).map_err(|e| CertificateError::EncodingFailed(e.to_string()))
    }

    /// SHA-256 fingerprint of the encoded certificate
    pub fn fingerprint(&self) -> Result<[u8; 32], CertificateError> {
        Ok(hash_message(&self.encode()?))
    }

    /// Whether `now` falls inside the validity window
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// Whether subject and issuer are the same entity
    pub fn is_self_issued(&self) -> bool {
        self.subject == self.issuer
    }

    /// PEM风格的文本形式
    pub fn to_pem(&self) -> Result<String, CertificateError> {
        let body = hex::encode(self.encode()?);

        let mut pem = String::with_capacity(body.len() + body.len() / PEM_LINE_WIDTH + 80);
        pem.push_str(PEM_BEGIN);
        pem.push('\n');
        for chunk in body.as_bytes().chunks(PEM_LINE_WIDTH) {
            // hex输出只包含ASCII字符
            pem.push_str(&String::from_utf8_lossy(chunk));
            pem.push('\n');
        }
        pem.push_str(PEM_END);
        pem.push('\n');

        Ok(pem)
    }

    /// Parses the text form produced by `to_pem`
    pub fn from_pem(pem: &str) -> Result<Self, CertificateError> {
        let mut lines = pem.lines().map(str::trim).filter(|l| !l.is_empty());

        match lines.next() {
            Some(PEM_BEGIN) => {}
            other => {
                return Err(CertificateError::InvalidPem(format!(
                    "Missing header, found {:?}",
                    other
                )))
            }
        }

        let mut body = String::new();
        let mut terminated = false;
        for line in lines {
            if line == PEM_END {
                terminated = true;
                break;
            }
            body.push_str(line);
        }

        if !terminated {
            return Err(CertificateError::InvalidPem("Missing footer".to_string()));
        }

        let bytes = hex::decode(&body).map_err(|e| CertificateError::InvalidPem(e.to_string()))?;
        Self::decode(&bytes)
    }

    /// Reads a PEM file from disk
    pub fn load(path: &std::path::Path) -> Result<Self, CertificateError> {
        let pem = std::fs::read_to_string(path)?;
        Self::from_pem(&pem)
    }
}
