use crate::dht::bootstrap::SeedNode;
use crate::dht::crawling::{NodeSpiderCrawl, ValueListSpiderCrawl, ValueSpiderCrawl};
use crate::dht::kademlia::{Contact, DhtConfig, DhtError, NodeId};
use crate::dht::network::{TransportHandle, UdpTransport};
use crate::dht::records::{decode_set, is_tombstone, tombstone};
use crate::dht::rpc::KademliaProtocol;
use crate::dht::storage::{DhtStorage, ForgetfulStorage, RecordKind};
use crate::dht::validation::validate_node_id;
use crate::identity::RuntimeCredentials;
use crate::utils::lock;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

/// save_state写出的内容
#[derive(Debug, Serialize, Deserialize)]
struct SavedState {
    id: String,
    ksize: usize,
    alpha: usize,
    neighbors: Vec<SeedNode>,
}

/// 复制方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replication {
    Store,
    Append,
    Remove,
}

/// 面向客户端的DHT存储服务
///
/// 组合路由表、认证RPC和爬取算法，提供set/get/get_concat/append/remove。
pub struct AppendServer {
    protocol: KademliaProtocol,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AppendServer {
    /// 使用内存存储创建服务
    pub fn new(config: DhtConfig, credentials: RuntimeCredentials) -> Self {
        let storage = Box::new(ForgetfulStorage::new(config.record_ttl));
        Self::with_storage(config, credentials, storage)
    }

    pub fn with_storage(config: DhtConfig, credentials: RuntimeCredentials, storage: Box<dyn DhtStorage>) -> Self {
        let (shutdown, _) = watch::channel(false);

        Self {
            protocol: KademliaProtocol::new(config, credentials, storage),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.protocol.node_id()
    }

    pub fn protocol(&self) -> &KademliaProtocol {
        &self.protocol
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.protocol.local_addr()
    }

    fn ksize(&self) -> usize {
        self.protocol.config().ksize
    }

    fn ensure_running(&self) -> Result<(), DhtError> {
        if *self.shutdown.borrow() {
            Err(DhtError::Stopped)
        } else {
            Ok(())
        }
    }

    /// 在UDP地址上监听
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, DhtError> {
        self.ensure_running()?;
        let handle = UdpTransport::bind(addr).await?;
        Ok(self.attach(handle))
    }

    /// 接入任意数据报传输，启动接收和维护任务
    pub fn attach(&self, handle: TransportHandle) -> SocketAddr {
        let local_addr = handle.local_addr;

        let receiver = self.protocol.attach(handle, self.shutdown.subscribe());
        let maintenance = tokio::spawn(maintenance_loop(self.protocol.clone(), self.shutdown.subscribe()));

        let mut tasks = lock(&self.tasks);
        tasks.push(receiver);
        tasks.push(maintenance);

        local_addr
    }

    /// 监听并从种子节点引导
    pub async fn start(&self, addr: SocketAddr, seeds: &[SeedNode]) -> Result<bool, DhtError> {
        let local_addr = self.listen(addr).await?;
        info!("Registry node {} started on {}", self.node_id(), local_addr);

        if seeds.is_empty() {
            return Ok(true);
        }
        self.bootstrap(seeds).await
    }

    /// 从种子节点引导：依次尝试，第一个验证通过的种子用来填充路由表
    pub async fn bootstrap(&self, seeds: &[SeedNode]) -> Result<bool, DhtError> {
        self.ensure_running()?;
        self.wait_until_ready().await?;

        for seed in seeds {
            info!("Bootstrapping from {}", seed.addr);

            if let Some(contact) = self.protocol.introduce(seed.addr, &seed.certificate).await {
                let found = NodeSpiderCrawl::new(self.protocol.clone(), self.node_id(), vec![contact])
                    .find()
                    .await;
                info!("Bootstrap found {} nodes, routing table holds {}", found.len(), self.protocol.state().router.len());
                return Ok(true);
            }

            warn!("Seed {} did not respond", seed.addr);
        }

        Ok(false)
    }

    /// 传输未就绪时按间隔重试
    async fn wait_until_ready(&self) -> Result<(), DhtError> {
        let config = self.protocol.config();
        let mut ready = self.protocol.ready();

        for _ in 0..config.bootstrap_retries {
            if *ready.borrow_and_update() {
                return Ok(());
            }
            debug!("Transport not ready, retrying bootstrap in {:?}", config.bootstrap_retry_delay);
            let _ = tokio::time::timeout(config.bootstrap_retry_delay, ready.changed()).await;
        }

        if *ready.borrow() {
            Ok(())
        } else {
            Err(DhtError::Transport("Transport never became ready".to_string()))
        }
    }

    //
    // 写操作
    //

    /// 覆盖写入单值
    pub async fn set(&self, key: &str, value: Vec<u8>) -> Result<bool, DhtError> {
        self.ensure_running()?;
        debug!("Setting '{}'", key);
        self.replicate(NodeId::for_key(key), value, Replication::Store).await
    }

    /// 把JSON列表并入集合
    pub async fn append(&self, key: &str, values: &[Value]) -> Result<bool, DhtError> {
        self.ensure_running()?;
        let value = serde_json::to_vec(values).map_err(|e| DhtError::Encoding(e.to_string()))?;
        self.replicate(NodeId::for_key(key), value, Replication::Append).await
    }

    /// 从集合中移除JSON列表中的元素
    pub async fn remove(&self, key: &str, values: &[Value]) -> Result<bool, DhtError> {
        self.ensure_running()?;
        let value = serde_json::to_vec(values).map_err(|e| DhtError::Encoding(e.to_string()))?;
        self.replicate(NodeId::for_key(key), value, Replication::Remove).await
    }

    /// 写入删除标记
    pub async fn delete(&self, key: &str) -> Result<bool, DhtError> {
        self.set(key, tombstone()).await
    }

    /// 找到离key最近的k个节点，必要时写入本地，再发给这些节点
    async fn replicate(&self, key: NodeId, value: Vec<u8>, mode: Replication) -> Result<bool, DhtError> {
        if mode != Replication::Store {
            decode_set(&value)?;
        }

        let nearest = self.protocol.neighbors(&key, self.ksize());
        if nearest.is_empty() {
            warn!("There are no known neighbors to set key {}", key);
            self.apply_local(key, value, mode);
            return Ok(true);
        }

        let nodes = NodeSpiderCrawl::new(self.protocol.clone(), key, nearest).find().await;
        debug!("Replicating {} to {} nodes", key, nodes.len());

        if self.is_among_closest(&key, &nodes) {
            self.apply_local(key, value.clone(), mode);
        }

        let mut calls = JoinSet::new();
        for node in nodes {
            let protocol = self.protocol.clone();
            let value = value.clone();
            calls.spawn(async move {
                match mode {
                    Replication::Store => protocol.call_store(&node, key, value).await,
                    Replication::Append => protocol.call_append(&node, key, value).await,
                    Replication::Remove => protocol.call_remove(&node, key, value).await,
                }
            });
        }

        let mut any_success = false;
        while let Some(joined) = calls.join_next().await {
            any_success |= joined.unwrap_or(false);
        }

        Ok(any_success)
    }

    fn is_among_closest(&self, key: &NodeId, nodes: &[Contact]) -> bool {
        match nodes.iter().map(|n| n.distance_to(key)).max() {
            Some(farthest) => nodes.len() < self.ksize() || self.node_id().distance(key) < farthest,
            None => true,
        }
    }

    fn apply_local(&self, key: NodeId, value: Vec<u8>, mode: Replication) {
        let result = match mode {
            Replication::Store => {
                self.protocol.store_local(key, value, RecordKind::Single);
                Ok(())
            }
            Replication::Append => self.protocol.append_local(key, &value),
            Replication::Remove => self.protocol.remove_local(key, &value),
        };

        if let Err(e) = result {
            error!("Local update of {} failed: {}", key, e);
        }
    }

    //
    // 读操作
    //

    /// 读取单值，本地有值时不访问网络
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DhtError> {
        self.ensure_running()?;
        let dkey = NodeId::for_key(key);

        if let Some(value) = self.protocol.local_value(&dkey) {
            return Ok(live(value));
        }

        let nearest = self.protocol.neighbors(&dkey, self.ksize());
        if nearest.is_empty() {
            warn!("There are no known neighbors to get key {}", key);
            return Ok(None);
        }

        let value = ValueSpiderCrawl::new(self.protocol.clone(), dkey, nearest).find().await;
        Ok(value.and_then(live))
    }

    /// 读取并合并所有副本，即使本地已有值也会查询网络
    pub async fn get_concat(&self, key: &str) -> Result<Option<Vec<u8>>, DhtError> {
        self.ensure_running()?;
        let dkey = NodeId::for_key(key);
        let local = self.protocol.local_value(&dkey);

        let nearest = self.protocol.neighbors(&dkey, self.ksize());
        if nearest.is_empty() {
            if local.is_none() {
                warn!("There are no known neighbors to get key {}", key);
            }
            return Ok(local.and_then(live));
        }

        let value = ValueListSpiderCrawl::new(self.protocol.clone(), dkey, nearest, local)
            .find()
            .await;
        Ok(value.and_then(live))
    }

    /// get_concat的结果解码为列表，不存在时为空
    pub async fn get_set(&self, key: &str) -> Result<Vec<Value>, DhtError> {
        match self.get_concat(key).await? {
            Some(bytes) => decode_set(&bytes),
            None => Ok(Vec::new()),
        }
    }

    //
    // 生命周期和状态
    //

    /// 停止接收和维护任务，等待中的调用按无应答处理
    pub async fn stop(&self) -> Result<(), DhtError> {
        if self.shutdown.send_replace(true) {
            return Ok(());
        }

        self.protocol.detach();

        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        if let Err(e) = self.protocol.credentials().flush() {
            warn!("Failed to flush certificate store: {}", e);
        }

        info!("Registry node {} stopped", self.node_id());
        Ok(())
    }

    /// 可以用来重新引导的邻居：路由表中证书已知的节点
    pub fn bootstrappable_neighbors(&self) -> Vec<SeedNode> {
        bootstrappable_neighbors(&self.protocol)
    }

    /// 把ID、k、alpha和邻居写成JSON
    pub fn save_state(&self, path: &Path) -> Result<(), DhtError> {
        write_state(&self.protocol, path)
    }

    /// 读取save_state的结果，返回新服务和用来引导的种子节点
    pub fn load_state(
        path: &Path,
        mut config: DhtConfig,
        credentials: RuntimeCredentials,
    ) -> Result<(Self, Vec<SeedNode>), DhtError> {
        let content = std::fs::read_to_string(path)?;
        let state: SavedState = serde_json::from_str(&content).map_err(|e| DhtError::Encoding(e.to_string()))?;

        let id = validate_node_id(&state.id).map_err(DhtError::Identity)?;
        if id != credentials.node_id() {
            return Err(DhtError::Identity(format!(
                "Saved state belongs to {}, not {}",
                id,
                credentials.node_id()
            )));
        }

        config.ksize = state.ksize;
        config.alpha = state.alpha;

        info!("Loaded state for {} with {} neighbors", id, state.neighbors.len());
        Ok((Self::new(config, credentials), state.neighbors))
    }

    /// 定期保存状态，直到服务停止
    pub fn save_state_regularly(&self, path: PathBuf, interval: Duration) {
        let protocol = self.protocol.clone();
        let mut shutdown = self.shutdown.subscribe();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = write_state(&protocol, &path) {
                            warn!("Failed to save state to {}: {}", path.display(), e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        lock(&self.tasks).push(task);
    }
}

fn bootstrappable_neighbors(protocol: &KademliaProtocol) -> Vec<SeedNode> {
    let contacts = protocol.state().router.all_contacts();
    let credentials = protocol.credentials();

    contacts
        .into_iter()
        .filter_map(|c| {
            credentials
                .get_certificate_locally(&c.id)
                .map(|cert| SeedNode::new(c.addr, cert))
        })
        .collect()
}

fn write_state(protocol: &KademliaProtocol, path: &Path) -> Result<(), DhtError> {
    let neighbors = bootstrappable_neighbors(protocol);
    if neighbors.is_empty() {
        warn!("No known neighbors, so not writing to cache");
        return Ok(());
    }

    let config = protocol.config();
    let state = SavedState {
        id: protocol.node_id().to_string(),
        ksize: config.ksize,
        alpha: config.alpha,
        neighbors,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(&state).map_err(|e| DhtError::Encoding(e.to_string()))?;
    std::fs::write(path, content)?;

    debug!("Saved state with {} neighbors to {}", state.neighbors.len(), path.display());
    Ok(())
}

/// 删除标记读出来是None
fn live(value: Vec<u8>) -> Option<Vec<u8>> {
    if is_tombstone(&value) {
        None
    } else {
        Some(value)
    }
}

/// 定期清理过期记录、刷新冷清的bucket、重新发布旧记录
async fn maintenance_loop(protocol: KademliaProtocol, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(protocol.config().maintenance_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => refresh_table(&protocol).await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    debug!("Maintenance task for {} stopped", protocol.node_id());
}

pub(crate) async fn refresh_table(protocol: &KademliaProtocol) {
    let config = protocol.config().clone();
    let node_id = protocol.node_id();

    let (culled, lonely, stale) = {
        let mut state = protocol.state();
        let culled = state.storage.cull();
        let lonely = state.router.lonely_buckets(config.refresh_interval);
        for bucket in &lonely {
            state.router.mark_bucket_refreshed(*bucket);
        }
        let stale = state.storage.items_older_than(config.republish_interval);
        (culled, lonely, stale)
    };

    if culled > 0 {
        debug!("Culled {} expired records", culled);
    }

    for bucket in lonely {
        let target = node_id.random_in_bucket(bucket);
        let peers = protocol.neighbors(&target, config.ksize);
        NodeSpiderCrawl::new(protocol.clone(), target, peers).find().await;
    }

    for (key, record) in stale {
        let peers = protocol.neighbors(&key, config.ksize);
        if peers.is_empty() {
            continue;
        }

        let nodes = NodeSpiderCrawl::new(protocol.clone(), key, peers).find().await;
        debug!("Republishing {} to {} nodes", key, nodes.len());

        // 重新写入本地以更新时间戳
        protocol.store_local(key, record.value.clone(), record.kind);

        for node in nodes {
            match record.kind {
                RecordKind::Set => protocol.call_append(&node, key, record.value.clone()).await,
                RecordKind::Single => protocol.call_store(&node, key, record.value.clone()).await,
            };
        }
    }
}
