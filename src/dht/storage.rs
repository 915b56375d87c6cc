use crate::dht::kademlia::NodeId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// 记录的种类，由最后一次写入它的RPC决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// STORE写入的单值
    Single,
    /// APPEND/REMOVE维护的JSON列表集合
    Set,
}

/// 本地存储中的一条记录
#[derive(Debug, Clone)]
pub struct StoredRecord {
    /// 原始值
    pub value: Vec<u8>,

    /// 记录种类
    pub kind: RecordKind,

    /// 写入时间
    pub stored_at: Instant,
}

impl StoredRecord {
    pub fn new(value: Vec<u8>, kind: RecordKind) -> Self {
        Self {
            value,
            kind,
            stored_at: Instant::now(),
        }
    }
}

/// DHT存储接口
///
/// 调用方持有节点状态锁时同步访问。
pub trait DhtStorage: Send {
    /// 存储键值对，覆盖已有记录
    fn store(&mut self, key: NodeId, value: Vec<u8>, kind: RecordKind);

    /// 获取键对应的记录
    fn get(&mut self, key: &NodeId) -> Option<StoredRecord>;

    /// 检查键是否存在
    fn contains(&mut self, key: &NodeId) -> bool {
        self.get(key).is_some()
    }

    /// 移除键值对
    fn remove(&mut self, key: &NodeId) -> Option<StoredRecord>;

    /// 所有未过期的记录
    fn items(&mut self) -> Vec<(NodeId, StoredRecord)>;

    /// 写入时间早于`age`之前的记录，用于重新发布
    fn items_older_than(&mut self, age: Duration) -> Vec<(NodeId, StoredRecord)>;

    /// 清理过期数据
    fn cull(&mut self) -> usize;

    /// 记录数量
    fn len(&self) -> usize;
}

/// 内存DHT存储实现，记录超过ttl后被遗忘
#[derive(Debug)]
pub struct ForgetfulStorage {
    /// 存储数据
    data: HashMap<NodeId, StoredRecord>,

    /// 记录存活时间
    ttl: Duration,
}

impl ForgetfulStorage {
    /// 创建新的内存DHT存储
    pub fn new(ttl: Duration) -> Self {
        Self {
            data: HashMap::new(),
            ttl,
        }
    }
}

impl DhtStorage for ForgetfulStorage {
    fn store(&mut self, key: NodeId, value: Vec<u8>, kind: RecordKind) {
        self.data.insert(key, StoredRecord::new(value, kind));
    }

    fn get(&mut self, key: &NodeId) -> Option<StoredRecord> {
        self.cull();
        self.data.get(key).cloned()
    }

    fn remove(&mut self, key: &NodeId) -> Option<StoredRecord> {
        self.data.remove(key)
    }

    fn items(&mut self) -> Vec<(NodeId, StoredRecord)> {
        self.cull();
        self.data.iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    fn items_older_than(&mut self, age: Duration) -> Vec<(NodeId, StoredRecord)> {
        self.cull();
        self.data
            .iter()
            .filter(|(_, v)| v.stored_at.elapsed() >= age)
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    fn cull(&mut self) -> usize {
        let ttl = self.ttl;
        let before = self.data.len();
        self.data.retain(|_, v| v.stored_at.elapsed() < ttl);
        before - self.data.len()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}
