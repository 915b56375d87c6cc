use crate::dht::kademlia::{DhtError, NodeId};
use crate::identity::Certificate;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// 引导节点：地址和它的证书
///
/// 证书用来在第一次ping之前推导并验证种子节点的ID。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedNode {
    /// 种子节点地址
    pub addr: SocketAddr,

    /// 种子节点证书
    pub certificate: Certificate,
}

impl SeedNode {
    pub fn new(addr: SocketAddr, certificate: Certificate) -> Self {
        Self { addr, certificate }
    }

    /// 解析`ip:port=cert.pem`形式的引导参数
    pub fn parse(entry: &str) -> Result<Self, DhtError> {
        let (addr, cert_path) = entry
            .split_once('=')
            .ok_or_else(|| DhtError::OperationFailed(format!("Expected <ip:port>=<cert.pem>, got {}", entry)))?;

        let addr: SocketAddr = addr
            .trim()
            .parse()
            .map_err(|e| DhtError::OperationFailed(format!("Invalid seed address {}: {}", addr, e)))?;

        let certificate =
            Certificate::load(Path::new(cert_path.trim())).map_err(|e| DhtError::Identity(e.to_string()))?;

        Ok(Self { addr, certificate })
    }

    /// 由证书推导的节点ID
    pub fn node_id(&self) -> Result<NodeId, DhtError> {
        NodeId::from_certificate(&self.certificate)
    }
}
