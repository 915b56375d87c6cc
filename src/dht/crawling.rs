use crate::dht::kademlia::{Contact, NodeId};
use crate::dht::records::{decode_set, majority, merge_replicas};
use crate::dht::rpc::{FindResult, KademliaProtocol};
use log::{debug, info};
use std::collections::HashSet;
use tokio::task::JoinSet;

/// 按到目标距离排序的有界候选集合
#[derive(Debug)]
pub struct NodeHeap {
    target: NodeId,
    capacity: usize,
    nodes: Vec<Contact>,
    contacted: HashSet<NodeId>,
}

impl NodeHeap {
    pub fn new(target: NodeId, capacity: usize) -> Self {
        Self {
            target,
            capacity,
            nodes: Vec::new(),
            contacted: HashSet::new(),
        }
    }

    /// 加入节点，重复的ID忽略，超出容量时丢弃最远的
    pub fn push(&mut self, contacts: impl IntoIterator<Item = Contact>) {
        for contact in contacts {
            if self.nodes.iter().any(|c| c.id == contact.id) {
                continue;
            }
            self.nodes.push(contact);
        }

        let target = self.target;
        self.nodes.sort_by_key(|c| c.distance_to(&target));
        self.nodes.truncate(self.capacity);
    }

    pub fn remove(&mut self, ids: &[NodeId]) {
        self.nodes.retain(|c| !ids.contains(&c.id));
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|c| c.id).collect()
    }

    pub fn mark_contacted(&mut self, contact: &Contact) {
        self.contacted.insert(contact.id);
    }

    /// 还未联系过的节点，由近到远
    pub fn uncontacted(&self) -> Vec<Contact> {
        self.nodes
            .iter()
            .filter(|c| !self.contacted.contains(&c.id))
            .copied()
            .collect()
    }

    pub fn all_been_contacted(&self) -> bool {
        self.nodes.iter().all(|c| self.contacted.contains(&c.id))
    }

    /// 取出最近的节点
    pub fn popleft(&mut self) -> Option<Contact> {
        if self.nodes.is_empty() {
            None
        } else {
            Some(self.nodes.remove(0))
        }
    }

    pub fn closest(&self, count: usize) -> Vec<Contact> {
        self.nodes.iter().take(count).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// 所有爬取共用的状态：候选集合和上一轮的ID
struct SpiderCrawl {
    protocol: KademliaProtocol,
    target: NodeId,
    nearest: NodeHeap,
    last_ids_crawled: Vec<NodeId>,
    ksize: usize,
    alpha: usize,
}

impl SpiderCrawl {
    fn new(protocol: KademliaProtocol, target: NodeId, peers: Vec<Contact>) -> Self {
        let ksize = protocol.config().ksize;
        let alpha = protocol.config().alpha;
        let mut nearest = NodeHeap::new(target, (ksize + 1) * ksize);
        nearest.push(peers);

        Self {
            protocol,
            target,
            nearest,
            last_ids_crawled: Vec::new(),
            ksize,
            alpha,
        }
    }

    /// 本轮要查询的节点：通常是最近的α个，候选集合没有变化时查询全部未联系节点
    fn next_batch(&mut self) -> Vec<Contact> {
        let ids = self.nearest.ids();
        let count = if ids == self.last_ids_crawled {
            usize::MAX
        } else {
            self.alpha
        };
        self.last_ids_crawled = ids;

        let batch: Vec<Contact> = self.nearest.uncontacted().into_iter().take(count).collect();
        for contact in &batch {
            self.nearest.mark_contacted(contact);
        }
        batch
    }

    /// 并发发出一轮find_node
    async fn node_round(&self, batch: Vec<Contact>) -> Vec<(Contact, Option<Vec<Contact>>)> {
        let mut calls = JoinSet::new();
        for contact in batch {
            let protocol = self.protocol.clone();
            let target = self.target;
            calls.spawn(async move { (contact, protocol.call_find_node(&contact, target).await) });
        }

        collect(calls).await
    }

    /// 并发发出一轮find_value
    async fn value_round(&self, batch: Vec<Contact>) -> Vec<(Contact, Option<FindResult>)> {
        let mut calls = JoinSet::new();
        for contact in batch {
            let protocol = self.protocol.clone();
            let key = self.target;
            calls.spawn(async move { (contact, protocol.call_find_value(&contact, key).await) });
        }

        collect(calls).await
    }
}

async fn collect<T: Send + 'static>(mut calls: JoinSet<T>) -> Vec<T> {
    let mut results = Vec::new();
    while let Some(joined) = calls.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => debug!("Crawl call task failed: {}", e),
        }
    }
    results
}

/// 节点查找
pub struct NodeSpiderCrawl {
    crawl: SpiderCrawl,
}

impl NodeSpiderCrawl {
    pub fn new(protocol: KademliaProtocol, target: NodeId, peers: Vec<Contact>) -> Self {
        Self {
            crawl: SpiderCrawl::new(protocol, target, peers),
        }
    }

    /// 一直查询到所有候选都联系过，返回最近的k个应答节点
    pub async fn find(mut self) -> Vec<Contact> {
        loop {
            let batch = self.crawl.next_batch();
            if batch.is_empty() {
                break;
            }

            let mut silent = Vec::new();
            for (contact, result) in self.crawl.node_round(batch).await {
                match result {
                    Some(nodes) => self.crawl.nearest.push(nodes),
                    None => silent.push(contact.id),
                }
            }
            self.crawl.nearest.remove(&silent);

            if self.crawl.nearest.all_been_contacted() {
                break;
            }
        }

        let found = self.crawl.nearest.closest(self.crawl.ksize);
        debug!("Node crawl for {} found {} nodes", self.crawl.target, found.len());
        found
    }
}

/// 单值查找，收到α个值后提前结束
pub struct ValueSpiderCrawl {
    crawl: SpiderCrawl,
    nearest_without_value: NodeHeap,
}

impl ValueSpiderCrawl {
    pub fn new(protocol: KademliaProtocol, key: NodeId, peers: Vec<Contact>) -> Self {
        Self {
            crawl: SpiderCrawl::new(protocol, key, peers),
            nearest_without_value: NodeHeap::new(key, 1),
        }
    }

    pub async fn find(mut self) -> Option<Vec<u8>> {
        let mut found = Vec::new();

        loop {
            let batch = self.crawl.next_batch();
            if batch.is_empty() {
                break;
            }

            let mut silent = Vec::new();
            for (contact, result) in self.crawl.value_round(batch).await {
                match result {
                    Some(FindResult::Value(value)) => found.push(value),
                    Some(FindResult::Nodes(nodes)) => {
                        self.nearest_without_value.push([contact]);
                        self.crawl.nearest.push(nodes);
                    }
                    None => silent.push(contact.id),
                }
            }
            self.crawl.nearest.remove(&silent);

            if found.len() >= self.crawl.alpha || self.crawl.nearest.all_been_contacted() {
                break;
            }
        }

        let value = majority(&found)?;
        if found.iter().any(|v| *v != value) {
            info!("Got multiple values for key {}, using the most common", self.crawl.target);
        }

        // 把结果写回离key最近但没有值的节点
        if let Some(peer) = self.nearest_without_value.popleft() {
            let stored = self
                .crawl
                .protocol
                .call_store(&peer, self.crawl.target, value.clone())
                .await;
            debug!("Repaired {} on {:?}: {}", self.crawl.target, peer, stored);
        }

        Some(value)
    }
}

/// 集合查找：遍历全部候选，合并所有副本
pub struct ValueListSpiderCrawl {
    crawl: SpiderCrawl,
    nearest_without_value: NodeHeap,
    local_value: Option<Vec<u8>>,
}

impl ValueListSpiderCrawl {
    pub fn new(protocol: KademliaProtocol, key: NodeId, peers: Vec<Contact>, local_value: Option<Vec<u8>>) -> Self {
        Self {
            crawl: SpiderCrawl::new(protocol, key, peers),
            nearest_without_value: NodeHeap::new(key, 1),
            local_value,
        }
    }

    pub async fn find(mut self) -> Option<Vec<u8>> {
        let mut found: Vec<Vec<u8>> = self.local_value.take().into_iter().collect();

        loop {
            let batch = self.crawl.next_batch();
            if batch.is_empty() {
                break;
            }

            let mut silent = Vec::new();
            for (contact, result) in self.crawl.value_round(batch).await {
                match result {
                    Some(FindResult::Value(value)) => found.push(value),
                    Some(FindResult::Nodes(nodes)) => {
                        self.nearest_without_value.push([contact]);
                        self.crawl.nearest.push(nodes);
                    }
                    None => silent.push(contact.id),
                }
            }
            self.crawl.nearest.remove(&silent);
        }

        let merged = merge_replicas(&found)?;
        if found.len() > 1 {
            debug!("Merged {} replicas for key {}", found.len(), self.crawl.target);
        }

        // 后台写回，不拖慢读取
        if let Some(peer) = self.nearest_without_value.popleft() {
            let protocol = self.crawl.protocol.clone();
            let key = self.crawl.target;
            let value = merged.clone();
            tokio::spawn(async move {
                let stored = if decode_set(&value).is_ok() {
                    protocol.call_append(&peer, key, value).await
                } else {
                    protocol.call_store(&peer, key, value).await
                };
                debug!("Repaired {} on {:?}: {}", key, peer, stored);
            });
        }

        Some(merged)
    }
}
