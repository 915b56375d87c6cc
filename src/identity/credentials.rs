use crate::crypto::{sign, verify, KeyPair};
use crate::dht::NodeId;
use crate::identity::authority::load_keypair;
use crate::identity::{Certificate, TrustError, TrustStore};
use crate::storage::{CertificateDb, DatabaseError};
use log::{debug, warn};
use std::path::Path;

/// 运行时身份
///
/// 节点自己的密钥、证书、信任的CA，以及已验证过的其他节点证书。
#[derive(Debug, Clone)]
pub struct RuntimeCredentials {
    keypair: KeyPair,
    certificate: Certificate,
    node_id: NodeId,
    trust_store: TrustStore,
    cert_db: CertificateDb,
}

impl RuntimeCredentials {
    /// 组装运行时身份，自己的证书必须与私钥匹配并被信任
    pub fn new(
        keypair: KeyPair,
        certificate: Certificate,
        trust_store: TrustStore,
        cert_db: CertificateDb,
    ) -> Result<Self, TrustError> {
        if certificate.public_key != keypair.public {
            return Err(TrustError::InvalidCertificate(
                "Certificate does not match the runtime key".to_string(),
            ));
        }

        trust_store.verify_certificate(&certificate)?;

        let node_id =
            NodeId::from_certificate(&certificate).map_err(|e| TrustError::InvalidCertificate(e.to_string()))?;

        debug!("Runtime {} has node id {}", certificate.subject, node_id);

        Ok(Self {
            keypair,
            certificate,
            node_id,
            trust_store,
            cert_db,
        })
    }

    /// 从磁盘加载：私钥文件、证书PEM、CA证书目录
    pub fn load(key_path: &Path, cert_path: &Path, trust_dir: &Path, cert_db: CertificateDb) -> Result<Self, TrustError> {
        let keypair = load_keypair(key_path).map_err(|e| TrustError::InvalidCertificate(e.to_string()))?;
        let certificate = Certificate::load(cert_path).map_err(|e| TrustError::InvalidCertificate(e.to_string()))?;
        let trust_store = TrustStore::load_dir(trust_dir)?;

        Self::new(keypair, certificate, trust_store, cert_db)
    }

    /// 本节点ID
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// 本节点证书
    pub fn own_certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// 用运行时私钥签名
    pub fn sign_data(&self, data: &[u8]) -> Vec<u8> {
        sign(&self.keypair.secret, data)
    }

    /// 用证书中的公钥验证签名
    pub fn verify_signed_data(&self, cert: &Certificate, signature: &[u8], data: &[u8]) -> Result<(), TrustError> {
        verify(&cert.public_key, data, signature).map_err(|e| TrustError::VerificationFailed(e.to_string()))
    }

    /// 验证证书链到受信任的CA
    pub fn verify_certificate(&self, cert: &Certificate) -> Result<(), TrustError> {
        self.trust_store.verify_certificate(cert)
    }

    /// 验证并保存其他节点的证书，返回它对应的节点ID
    pub fn store_others_cert(&self, cert: &Certificate) -> Result<NodeId, TrustError> {
        self.verify_certificate(cert)?;

        let id = NodeId::from_certificate(cert).map_err(|e| TrustError::InvalidCertificate(e.to_string()))?;
        if id == self.node_id {
            return Ok(id);
        }

        // 没存下来的证书之后查不到，对方的每个请求都会收到NACK
        self.cert_db.put(&id, cert)?;

        Ok(id)
    }

    /// 把证书库写回磁盘
    pub fn flush(&self) -> Result<(), DatabaseError> {
        self.cert_db.flush()
    }

    /// 本地查找证书，自己的证书总能找到
    pub fn get_certificate_locally(&self, id: &NodeId) -> Option<Certificate> {
        if *id == self.node_id {
            return Some(self.certificate.clone());
        }

        match self.cert_db.get(id) {
            Ok(cert) => cert,
            Err(e) => {
                warn!("Failed to read certificate for {}: {}", id, e);
                None
            }
        }
    }
}
