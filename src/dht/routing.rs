use crate::dht::kademlia::{Contact, NodeId, ID_BITS};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// bucket中的一个联系人，带连续失败计数
#[derive(Debug, Clone)]
struct TrackedContact {
    contact: Contact,
    failures: u32,
}

/// 单个k-bucket
#[derive(Debug)]
struct KBucket {
    /// 按最近活跃排序，队首最久未见
    nodes: VecDeque<TrackedContact>,

    /// bucket满时新节点进入替换缓存
    replacements: VecDeque<Contact>,

    /// 上次有节点加入或被刷新的时间
    last_updated: Instant,
}

impl KBucket {
    fn new(ksize: usize) -> Self {
        Self {
            nodes: VecDeque::with_capacity(ksize),
            replacements: VecDeque::new(),
            last_updated: Instant::now(),
        }
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.contact.id == *id)
    }
}

/// 添加联系人的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// 新加入bucket
    Added,
    /// 已存在，移到队尾
    Refreshed,
    /// bucket已满，放入替换缓存
    Cached,
    /// 本地节点自己
    Ignored,
}

/// 路由表实现，基于Kademlia的k-bucket结构
#[derive(Debug)]
pub struct RoutingTable {
    /// 本地节点ID
    local_id: NodeId,

    /// 每个bucket的容量
    ksize: usize,

    /// k-buckets，第i个bucket存放与本地ID前i位相同、第i位不同的节点
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    /// 创建新的路由表
    pub fn new(local_id: NodeId, ksize: usize) -> Self {
        let buckets = (0..ID_BITS).map(|_| KBucket::new(ksize)).collect();

        Self {
            local_id,
            ksize,
            buckets,
        }
    }

    /// 本地节点ID
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// 计算应该放入哪个bucket
    pub fn bucket_index(&self, id: &NodeId) -> usize {
        let distance = self.local_id.distance(id);

        // 找到第一个非零字节中最高的非零位
        for (i, &byte) in distance.iter().enumerate() {
            if byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }

        // 本地节点自己
        ID_BITS - 1
    }

    /// 节点是否还不在路由表中
    pub fn is_new_node(&self, id: &NodeId) -> bool {
        let idx = self.bucket_index(id);
        self.buckets[idx].position(id).is_none()
    }

    /// 添加或刷新联系人
    pub fn add_contact(&mut self, contact: Contact) -> AddOutcome {
        if contact.id == self.local_id {
            return AddOutcome::Ignored;
        }

        let ksize = self.ksize;
        let idx = self.bucket_index(&contact.id);
        let bucket = &mut self.buckets[idx];
        bucket.last_updated = Instant::now();

        if let Some(pos) = bucket.position(&contact.id) {
            // 已存在，移到队尾并清除失败标记
            bucket.nodes.remove(pos);
            bucket.nodes.push_back(TrackedContact { contact, failures: 0 });
            return AddOutcome::Refreshed;
        }

        if bucket.nodes.len() < ksize {
            bucket.replacements.retain(|c| c.id != contact.id);
            bucket.nodes.push_back(TrackedContact { contact, failures: 0 });
            return AddOutcome::Added;
        }

        // 队首节点有失败记录时直接替换
        if let Some(head) = bucket.nodes.front() {
            if head.failures > 0 {
                bucket.nodes.pop_front();
                bucket.nodes.push_back(TrackedContact { contact, failures: 0 });
                return AddOutcome::Added;
            }
        }

        bucket.replacements.retain(|c| c.id != contact.id);
        bucket.replacements.push_back(contact);
        if bucket.replacements.len() > ksize {
            bucket.replacements.pop_front();
        }

        AddOutcome::Cached
    }

    /// 移除联系人，并从替换缓存中补位
    pub fn remove_contact(&mut self, id: &NodeId) -> bool {
        let idx = self.bucket_index(id);
        let bucket = &mut self.buckets[idx];

        bucket.replacements.retain(|c| c.id != *id);

        match bucket.position(id) {
            Some(pos) => {
                bucket.nodes.remove(pos);
                if let Some(replacement) = bucket.replacements.pop_back() {
                    bucket.nodes.push_back(TrackedContact {
                        contact: replacement,
                        failures: 0,
                    });
                }
                true
            }
            None => false,
        }
    }

    /// 记录一次失败，达到上限时移除，返回是否被移除
    pub fn mark_failed(&mut self, id: &NodeId, max_failures: u32) -> bool {
        let idx = self.bucket_index(id);
        let exceeded = match self.buckets[idx].position(id) {
            Some(pos) => {
                let tracked = &mut self.buckets[idx].nodes[pos];
                tracked.failures += 1;
                tracked.failures >= max_failures
            }
            None => false,
        };

        if exceeded {
            self.remove_contact(id);
        }

        exceeded
    }

    /// 查找特定联系人
    pub fn get(&self, id: &NodeId) -> Option<Contact> {
        let idx = self.bucket_index(id);
        let bucket = &self.buckets[idx];
        bucket.position(id).map(|pos| bucket.nodes[pos].contact)
    }

    /// 获取离目标最近的count个节点，可排除一个节点（通常是请求方）
    pub fn find_neighbors(&self, target: &NodeId, count: usize, exclude: Option<&NodeId>) -> Vec<Contact> {
        let mut nodes: Vec<Contact> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes.iter().map(|t| t.contact))
            .filter(|c| Some(&c.id) != exclude)
            .collect();

        nodes.sort_by_key(|c| c.distance_to(target));
        nodes.truncate(count);
        nodes
    }

    /// 返回超过refresh_interval没有更新过的非空bucket
    pub fn lonely_buckets(&self, refresh_interval: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.nodes.is_empty() && b.last_updated.elapsed() >= refresh_interval)
            .map(|(i, _)| i)
            .collect()
    }

    /// 标记bucket已刷新
    pub fn mark_bucket_refreshed(&mut self, bucket_idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(bucket_idx) {
            bucket.last_updated = Instant::now();
        }
    }

    /// 获取路由表中的节点总数
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    /// 检查路由表是否为空
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.nodes.is_empty())
    }

    /// 获取路由表中的所有节点
    pub fn all_contacts(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(|b| b.nodes.iter().map(|t| t.contact))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::kademlia::ID_LENGTH;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn contact(first: u8, last: u8) -> Contact {
        let mut id = [0u8; ID_LENGTH];
        id[0] = first;
        id[ID_LENGTH - 1] = last;
        Contact::new(
            NodeId(id),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8000 + last as u16),
        )
    }

    #[test]
    fn test_bucket_index() {
        let table = RoutingTable::new(NodeId([0; ID_LENGTH]), 20);

        let test_cases = [(128u8, 0usize), (1, 7), (2, 6)];
        for (first, expected_index) in test_cases {
            assert_eq!(table.bucket_index(&contact(first, 0).id), expected_index);
        }

        let mut id = [0u8; ID_LENGTH];
        id[1] = 1;
        assert_eq!(table.bucket_index(&NodeId(id)), 15);
    }

    #[test]
    fn test_add_and_find_neighbors() {
        let mut table = RoutingTable::new(NodeId([0; ID_LENGTH]), 20);

        for i in 1..10 {
            assert_eq!(table.add_contact(contact(i, 0)), AddOutcome::Added);
        }
        assert_eq!(table.len(), 9);

        let target = contact(2, 0).id;
        let closest = table.find_neighbors(&target, 3, None);

        // 第一个应该是目标本身
        assert_eq!(closest.len(), 3);
        assert_eq!(closest[0].id, target);

        let without = table.find_neighbors(&target, 3, Some(&target));
        assert!(without.iter().all(|c| c.id != target));
    }

    #[test]
    fn test_local_node_is_ignored() {
        let local = contact(5, 5);
        let mut table = RoutingTable::new(local.id, 20);

        assert_eq!(table.add_contact(local), AddOutcome::Ignored);
        assert!(table.is_empty());
    }

    #[test]
    fn test_full_bucket_uses_replacement_cache() {
        let mut table = RoutingTable::new(NodeId([0; ID_LENGTH]), 2);

        // 都落在bucket 0
        let a = contact(0x80, 1);
        let b = contact(0x80, 2);
        let c = contact(0x80, 3);

        table.add_contact(a);
        table.add_contact(b);
        assert_eq!(table.add_contact(c), AddOutcome::Cached);
        assert!(table.is_new_node(&c.id));

        // 移除后替换缓存中的节点补位
        assert!(table.remove_contact(&a.id));
        assert!(!table.is_new_node(&c.id));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_mark_failed_evicts_after_limit() {
        let mut table = RoutingTable::new(NodeId([0; ID_LENGTH]), 20);
        let a = contact(0x40, 1);
        table.add_contact(a);

        assert!(!table.mark_failed(&a.id, 2));
        assert!(table.get(&a.id).is_some());

        // 成功响应清除失败标记
        table.add_contact(a);
        assert!(!table.mark_failed(&a.id, 2));
        assert!(table.mark_failed(&a.id, 2));
        assert!(table.get(&a.id).is_none());
    }

    #[test]
    fn test_failed_head_is_replaced_when_full() {
        let mut table = RoutingTable::new(NodeId([0; ID_LENGTH]), 2);
        let a = contact(0x80, 1);
        let b = contact(0x80, 2);
        let c = contact(0x80, 3);

        table.add_contact(a);
        table.add_contact(b);
        table.mark_failed(&a.id, 5);

        assert_eq!(table.add_contact(c), AddOutcome::Added);
        assert!(table.get(&a.id).is_none());
    }

    #[test]
    fn test_lonely_buckets() {
        let mut table = RoutingTable::new(NodeId([0; ID_LENGTH]), 20);
        table.add_contact(contact(0x80, 1));

        assert_eq!(table.lonely_buckets(Duration::from_secs(0)), vec![0]);
        assert!(table.lonely_buckets(Duration::from_secs(3600)).is_empty());
    }
}
