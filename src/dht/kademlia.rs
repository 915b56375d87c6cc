use crate::crypto::hash_message;
use crate::identity::Certificate;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// 节点ID和键的字节长度（160位）
pub const ID_LENGTH: usize = 20;

/// ID的比特数，也是路由表中bucket的数量
pub const ID_BITS: usize = ID_LENGTH * 8;

#[derive(Error, Debug)]
pub enum DhtError {
    #[error("Node ID derivation failed: {0}")]
    NodeIdDerivationFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("DHT operation failed: {0}")]
    OperationFailed(String),

    #[error("Server is stopped")]
    Stopped,
}

impl From<std::io::Error> for DhtError {
    fn from(e: std::io::Error) -> Self {
        DhtError::Transport(e.to_string())
    }
}

/// Configuration for the Kademlia DHT
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// The number of nodes to keep in each k-bucket
    pub ksize: usize,
    /// The number of nodes to query in parallel during lookups
    pub alpha: usize,
    /// Deadline for a single RPC
    pub rpc_timeout: Duration,
    /// Records older than this are culled from the local store
    pub record_ttl: Duration,
    /// Consecutive timeouts before a contact is evicted
    pub max_failures: u32,
    /// Delay between bootstrap attempts while the transport is not ready
    pub bootstrap_retry_delay: Duration,
    /// How many times bootstrap waits for the transport before giving up
    pub bootstrap_retries: u32,
    /// The interval for refreshing buckets
    pub refresh_interval: Duration,
    /// The interval for republishing keys
    pub republish_interval: Duration,
    /// How often the maintenance task wakes up
    pub maintenance_interval: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            ksize: 20,
            alpha: 3,
            rpc_timeout: Duration::from_secs(5),
            record_ttl: Duration::from_secs(604800), // 1 week
            max_failures: 2,
            bootstrap_retry_delay: Duration::from_secs(1),
            bootstrap_retries: 30,
            refresh_interval: Duration::from_secs(3600), // 1 hour
            republish_interval: Duration::from_secs(3600),
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

/// Represents a node's identifier, or a hashed key, in the DHT
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub [u8; ID_LENGTH]);

impl NodeId {
    /// SHA-256摘要的低20字节
    pub fn digest(data: &[u8]) -> Self {
        let hash = hash_message(data);

        let mut id = [0u8; ID_LENGTH];
        id.copy_from_slice(&hash[hash.len() - ID_LENGTH..]);
        Self(id)
    }

    /// Hashes a client key into the id space
    pub fn for_key(key: &str) -> Self {
        Self::digest(key.as_bytes())
    }

    /// Derives the node id bound to a certificate
    pub fn from_certificate(cert: &Certificate) -> Result<Self, DhtError> {
        let fingerprint = cert
            .fingerprint()
            .map_err(|e| DhtError::NodeIdDerivationFailed(e.to_string()))?;

        let mut id = [0u8; ID_LENGTH];
        id.copy_from_slice(&fingerprint[fingerprint.len() - ID_LENGTH..]);
        Ok(Self(id))
    }

    /// 证书在DHT中的存储键：digest(大写hex(id) + "cert")
    pub fn cert_key(&self) -> NodeId {
        Self::digest(format!("{}cert", self.to_hex_upper()).as_bytes())
    }

    /// Generates a random NodeId
    pub fn random() -> Self {
        let mut id = [0u8; ID_LENGTH];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut id);
        Self(id)
    }

    /// 在指定bucket覆盖的距离范围内随机生成一个ID
    pub fn random_in_bucket(&self, bucket: usize) -> Self {
        let mut id = Self::random();
        let bucket = bucket.min(ID_BITS - 1);

        // 前bucket位与本地ID相同，第bucket位相反
        for bit in 0..=bucket {
            let byte = bit / 8;
            let mask = 0x80u8 >> (bit % 8);
            let local = self.0[byte] & mask;
            let wanted = if bit == bucket { local ^ mask } else { local };
            id.0[byte] = (id.0[byte] & !mask) | wanted;
        }

        id
    }

    /// Calculates the XOR distance between two NodeIds
    pub fn distance(&self, other: &Self) -> [u8; ID_LENGTH] {
        let mut result = [0u8; ID_LENGTH];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        result
    }

    /// Uppercase hex, the form signed payloads and cert keys use
    pub fn to_hex_upper(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..6]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl TryFrom<&[u8]> for NodeId {
    type Error = DhtError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != ID_LENGTH {
            return Err(DhtError::NodeIdDerivationFailed(format!(
                "Invalid length: expected {}, got {}",
                ID_LENGTH,
                bytes.len()
            )));
        }

        let mut id = [0u8; ID_LENGTH];
        id.copy_from_slice(bytes);

        Ok(Self(id))
    }
}

/// 网络中的一个节点：ID加地址
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl Contact {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }

    /// Distance from this contact to `target`
    pub fn distance_to(&self, target: &NodeId) -> [u8; ID_LENGTH] {
        self.id.distance(target)
    }
}

impl fmt::Debug for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", hex::encode_upper(&self.id.0[..4]), self.addr)
    }
}
