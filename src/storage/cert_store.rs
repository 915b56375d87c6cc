use crate::dht::NodeId;
use crate::identity::Certificate;
use crate::storage::{Database, DatabaseError};
use log::debug;
use std::path::Path;

const CERT_TREE: &str = "certificates";

/// 其他节点证书的持久化存储，按节点ID索引
#[derive(Debug, Clone)]
pub struct CertificateDb {
    db: Database,
}

impl CertificateDb {
    /// 在目录中打开证书库
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        Ok(Self {
            db: Database::open(path)?,
        })
    }

    /// 不落盘的证书库
    pub fn temporary() -> Result<Self, DatabaseError> {
        Ok(Self {
            db: Database::temporary()?,
        })
    }

    /// 保存证书
    pub fn put(&self, id: &NodeId, cert: &Certificate) -> Result<(), DatabaseError> {
        debug!("Persisting certificate {} for {}", cert.subject, id);
        self.db.put_serialized(CERT_TREE, &id.0, cert)
    }

    /// 读取证书
    pub fn get(&self, id: &NodeId) -> Result<Option<Certificate>, DatabaseError> {
        self.db.get_serialized(CERT_TREE, &id.0)
    }

    /// 已保存的证书数量
    pub fn len(&self) -> Result<usize, DatabaseError> {
        self.db.count(CERT_TREE)
    }

    pub fn flush(&self) -> Result<(), DatabaseError> {
        self.db.flush()
    }
}
