use crate::dht::kademlia::{Contact, DhtConfig, DhtError, NodeId};
use crate::dht::network::{Inbound, Outbound, TransportHandle};
use crate::dht::protocol::{
    generate_challenge, Challenge, Reply, Request, RequestEnvelope, ResponseEnvelope, Verb, WireMessage,
};
use crate::dht::records::{subtract_from, union_into};
use crate::dht::routing::{AddOutcome, RoutingTable};
use crate::dht::storage::{DhtStorage, RecordKind, StoredRecord};
use crate::identity::{Certificate, RuntimeCredentials};
use crate::utils::lock;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// 节点的可变状态：路由表和本地记录
pub struct NodeState {
    pub router: RoutingTable,
    pub storage: Box<dyn DhtStorage>,
}

/// 一次签名调用的结果
#[derive(Debug)]
pub(crate) enum Outcome {
    /// 签名有效的应答
    Reply(Reply),
    /// 签名有效的NACK
    Nack,
    /// 超时或发送失败
    NoResponse,
    /// 证书或签名无法验证
    Invalid,
}

/// find_value的结果
#[derive(Debug, Clone, PartialEq)]
pub enum FindResult {
    Value(Vec<u8>),
    Nodes(Vec<Contact>),
}

/// 等待应答的调用
struct PendingCall {
    tx: oneshot::Sender<ResponseEnvelope>,
    target: SocketAddr,
}

/// 已接入的传输
struct Link {
    local_addr: SocketAddr,
    outbound: mpsc::Sender<Outbound>,
}

struct ProtocolInner {
    config: DhtConfig,
    credentials: RuntimeCredentials,
    node_id: NodeId,
    state: Mutex<NodeState>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    next_message_id: AtomicU64,
    link: Mutex<Option<Link>>,
    ready: watch::Sender<bool>,
    /// 正在获取证书的节点
    cert_lookups: Mutex<HashSet<NodeId>>,
}

/// 带证书认证的Kademlia RPC层
///
/// 每个出站调用签名`接收方ID || 挑战 || 参数`，应答方对同一挑战签名；
/// 入站请求只有在发送方证书可验证时才会被执行。
#[derive(Clone)]
pub struct KademliaProtocol {
    inner: Arc<ProtocolInner>,
}

impl KademliaProtocol {
    pub fn new(config: DhtConfig, credentials: RuntimeCredentials, storage: Box<dyn DhtStorage>) -> Self {
        let node_id = credentials.node_id();
        let router = RoutingTable::new(node_id, config.ksize);
        let (ready, _) = watch::channel(false);

        Self {
            inner: Arc::new(ProtocolInner {
                config,
                credentials,
                node_id,
                state: Mutex::new(NodeState { router, storage }),
                pending: Mutex::new(HashMap::new()),
                next_message_id: AtomicU64::new(1),
                link: Mutex::new(None),
                ready,
                cert_lookups: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    pub fn config(&self) -> &DhtConfig {
        &self.inner.config
    }

    pub fn credentials(&self) -> &RuntimeCredentials {
        &self.inner.credentials
    }

    /// 传输的本地地址，未接入时为None
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.link).as_ref().map(|link| link.local_addr)
    }

    /// 传输就绪状态
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.inner.ready.subscribe()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, NodeState> {
        lock(&self.inner.state)
    }

    /// 接入传输并启动接收任务
    pub fn attach(&self, handle: TransportHandle, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let TransportHandle {
            local_addr,
            outbound,
            inbound,
        } = handle;

        *lock(&self.inner.link) = Some(Link { local_addr, outbound });
        self.inner.ready.send_replace(true);

        info!("Node {} listening on {}", self.node_id(), local_addr);

        let protocol = self.clone();
        tokio::spawn(protocol.receive_loop(inbound, shutdown))
    }

    /// 断开传输，所有等待中的调用按无应答处理
    pub fn detach(&self) {
        *lock(&self.inner.link) = None;
        self.inner.ready.send_replace(false);

        let failed = {
            let mut pending = lock(&self.inner.pending);
            let count = pending.len();
            pending.clear();
            count
        };

        if failed > 0 {
            debug!("Failed {} outstanding calls on shutdown", failed);
        }
    }

    async fn receive_loop(self, mut inbound: mpsc::Receiver<Inbound>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                datagram = inbound.recv() => match datagram {
                    Some((bytes, from)) => self.handle_datagram(&bytes, from).await,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Receive loop for {} stopped", self.node_id());
    }

    async fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let message = match WireMessage::from_bytes(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("Failed to parse message from {}: {}", from, e);
                return;
            }
        };

        match message {
            WireMessage::Response { message_id, envelope } => {
                let call = lock(&self.inner.pending).remove(&message_id);
                match call {
                    Some(call) if call.target == from => {
                        let _ = call.tx.send(envelope);
                    }
                    Some(call) => {
                        warn!("Response {} came from {} instead of {}", message_id, from, call.target);
                        lock(&self.inner.pending).insert(message_id, call);
                    }
                    None => debug!("Late or unknown response {} from {}", message_id, from),
                }
            }
            WireMessage::Request { message_id, envelope } => {
                if let Some(response) = self.handle_request(envelope, from) {
                    let message = WireMessage::Response {
                        message_id,
                        envelope: response,
                    };
                    if let Err(e) = self.send(from, &message).await {
                        warn!("Failed to send response to {}: {}", from, e);
                    }
                }
            }
        }
    }

    async fn send(&self, to: SocketAddr, message: &WireMessage) -> Result<(), DhtError> {
        let bytes = message.to_bytes().map_err(|e| DhtError::Encoding(e.to_string()))?;

        let outbound = lock(&self.inner.link)
            .as_ref()
            .map(|link| link.outbound.clone())
            .ok_or_else(|| DhtError::Transport("Transport not ready".to_string()))?;

        outbound
            .send((to, bytes))
            .await
            .map_err(|_| DhtError::Transport("Transport closed".to_string()))
    }

    fn sign_reply(&self, recipient: &NodeId, challenge: &Challenge, reply: Reply) -> ResponseEnvelope {
        let signature = self
            .inner
            .credentials
            .sign_data(&reply.signed_payload(recipient, challenge));

        ResponseEnvelope { signature, reply }
    }

    //
    // 入站请求
    //

    /// 验证并执行一个入站请求，返回要发回的应答；None表示静默丢弃
    pub(crate) fn handle_request(&self, envelope: RequestEnvelope, from: SocketAddr) -> Option<ResponseEnvelope> {
        let RequestEnvelope {
            sender,
            challenge,
            signature,
            request,
        } = envelope;
        let verb = request.verb();
        let credentials = &self.inner.credentials;

        if sender == self.node_id() {
            debug!("Ignoring {} from our own id at {}", verb, from);
            return None;
        }

        let attached = match request.attached_certificate() {
            Some(cert) => {
                if let Err(e) = credentials.verify_certificate(cert) {
                    warn!("Dropping {} from {}: {}", verb, from, e);
                    return None;
                }
                match NodeId::from_certificate(cert) {
                    Ok(id) if id == sender => Some(cert.clone()),
                    _ => {
                        warn!("Dropping {} from {}: certificate does not match claimed id {}", verb, from, sender);
                        return None;
                    }
                }
            }
            None => None,
        };

        let cert = match attached.clone().or_else(|| credentials.get_certificate_locally(&sender)) {
            Some(cert) => cert,
            None => {
                debug!("Certificate for {} not found in store, sending NACK for {}", sender, verb);
                return Some(self.sign_reply(&sender, &challenge, Reply::Nack));
            }
        };

        let payload = request.signed_payload(&self.node_id(), &challenge);
        if let Err(e) = credentials.verify_signed_data(&cert, &signature, &payload) {
            warn!("Dropping {} from {}: {}", verb, from, e);
            return None;
        }

        if let Some(cert) = attached {
            if let Err(e) = credentials.store_others_cert(&cert) {
                warn!("Failed to store certificate of {}: {}", sender, e);
            }
        }

        let source = Contact::new(sender, from);
        self.welcome(source);

        debug!("{} from {:?}", verb, source);
        let reply = self.execute(&source, request);

        Some(self.sign_reply(&sender, &challenge, reply))
    }

    fn execute(&self, source: &Contact, request: Request) -> Reply {
        let ksize = self.inner.config.ksize;

        match request {
            Request::Ping { .. } => Reply::Pong { id: self.node_id() },
            Request::Store { key, value } => {
                self.store_local(key, value, RecordKind::Single);
                Reply::Stored
            }
            Request::Append { key, value } => {
                if let Err(e) = self.append_local(key, &value) {
                    warn!("Append from {:?} skipped: {}", source, e);
                }
                Reply::Stored
            }
            Request::Remove { key, value } => {
                if let Err(e) = self.remove_local(key, &value) {
                    warn!("Remove from {:?} skipped: {}", source, e);
                }
                Reply::Stored
            }
            Request::FindNode { target } => {
                Reply::Nodes(self.state().router.find_neighbors(&target, ksize, Some(&source.id)))
            }
            Request::FindValue { key, .. } => match self.local_value(&key) {
                Some(value) => Reply::Value(value),
                None => Reply::Nodes(self.state().router.find_neighbors(&key, ksize, Some(&source.id))),
            },
            Request::FindCert { .. } => Reply::Certificate(self.inner.credentials.own_certificate().clone()),
        }
    }

    //
    // 本地存储
    //

    pub(crate) fn store_local(&self, key: NodeId, value: Vec<u8>, kind: RecordKind) {
        self.state().storage.store(key, value, kind);
    }

    pub(crate) fn append_local(&self, key: NodeId, delta: &[u8]) -> Result<(), DhtError> {
        let mut state = self.state();
        let existing = state.storage.get(&key).map(|record| record.value);
        let merged = union_into(existing.as_deref(), delta)?;
        state.storage.store(key, merged, RecordKind::Set);
        Ok(())
    }

    pub(crate) fn remove_local(&self, key: NodeId, delta: &[u8]) -> Result<(), DhtError> {
        let mut state = self.state();
        let existing = state.storage.get(&key).map(|record| record.value);
        let remaining = subtract_from(existing.as_deref(), delta)?;
        state.storage.store(key, remaining, RecordKind::Set);
        Ok(())
    }

    pub(crate) fn get_local(&self, key: &NodeId) -> Option<StoredRecord> {
        self.state().storage.get(key)
    }

    /// 本地可以回答的值；本节点证书的键总能解析为自己的PEM证书
    pub fn local_value(&self, key: &NodeId) -> Option<Vec<u8>> {
        if let Some(record) = self.get_local(key) {
            return Some(record.value);
        }

        if *key == self.node_id().cert_key() {
            return self.own_certificate().to_pem().ok().map(String::into_bytes);
        }

        None
    }

    /// 路由表中的所有节点
    pub fn contacts(&self) -> Vec<Contact> {
        self.state().router.all_contacts()
    }

    /// 路由表中离目标最近的count个节点
    pub fn neighbors(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        self.state().router.find_neighbors(target, count, None)
    }

    //
    // 路由表维护
    //

    /// 接纳一个已验证身份的节点；第一次进入路由表时把它应负责的记录推给它
    ///
    /// 返回推送的记录数。进入替换缓存的节点不算加入。
    pub(crate) fn welcome(&self, contact: Contact) -> usize {
        let transfers = {
            let mut state = self.state();

            if !state.router.is_new_node(&contact.id) {
                state.router.add_contact(contact);
                return 0;
            }

            if state.router.add_contact(contact) != AddOutcome::Added {
                return 0;
            }

            info!("Added new contact {:?}", contact);
            self.records_for_new_node(&mut state, &contact)
        };

        if !transfers.is_empty() {
            debug!("Transferring {} records to {:?}", transfers.len(), contact);
        }

        let count = transfers.len();
        for (key, record) in transfers {
            self.spawn_transfer(contact, key, record);
        }
        count
    }

    /// 新节点进入最近k个且本节点仍在最近k个中的记录
    fn records_for_new_node(&self, state: &mut NodeState, contact: &Contact) -> Vec<(NodeId, StoredRecord)> {
        let ksize = self.inner.config.ksize;
        let node_id = self.node_id();
        let items = state.storage.items();

        items
            .into_iter()
            .filter(|(key, _)| {
                let neighbors = state.router.find_neighbors(key, ksize, Some(&contact.id));
                match neighbors.last() {
                    None => true,
                    Some(farthest) => {
                        let room = neighbors.len() < ksize;
                        let limit = farthest.distance_to(key);
                        let new_node_close = room || contact.distance_to(key) < limit;
                        let this_node_close = room || node_id.distance(key) < limit;
                        new_node_close && this_node_close
                    }
                }
            })
            .collect()
    }

    fn spawn_transfer(&self, to: Contact, key: NodeId, record: StoredRecord) {
        let protocol = self.clone();
        tokio::spawn(async move {
            let request = match record.kind {
                RecordKind::Set => Request::Append {
                    key,
                    value: record.value,
                },
                RecordKind::Single => Request::Store {
                    key,
                    value: record.value,
                },
            };

            if protocol.invoke(&to, request).await.is_none() {
                debug!("Transfer of {} to {:?} failed", key, to);
            }
        });
    }

    fn note_failure(&self, contact: &Contact) {
        let max_failures = self.inner.config.max_failures;
        if self.state().router.mark_failed(&contact.id, max_failures) {
            info!("No response from {:?}, removing from bucket", contact);
        } else {
            debug!("No response from {:?}", contact);
        }
    }

    fn drop_contact(&self, contact: &Contact) {
        if self.state().router.remove_contact(&contact.id) {
            info!("Removed contact {:?}", contact);
        }
    }

    /// 只保留证书已知的节点，其余节点在后台获取证书
    fn filter_certified(&self, contacts: Vec<Contact>) -> Vec<Contact> {
        let mut certified = Vec::with_capacity(contacts.len());

        for contact in contacts {
            if contact.id == self.node_id() {
                continue;
            }

            if self.inner.credentials.get_certificate_locally(&contact.id).is_some() {
                certified.push(contact);
            } else {
                self.spawn_certificate_lookup(contact);
            }
        }

        certified
    }

    fn spawn_certificate_lookup(&self, contact: Contact) {
        if !lock(&self.inner.cert_lookups).insert(contact.id) {
            return;
        }

        let protocol = self.clone();
        tokio::spawn(async move {
            let fetched = protocol.fetch_certificate(&contact).await;
            lock(&protocol.inner.cert_lookups).remove(&contact.id);

            if fetched.is_none() {
                debug!("Could not obtain certificate of {:?}", contact);
            }
        });
    }

    //
    // 出站调用
    //

    /// 发出一个签名请求并验证应答
    pub(crate) async fn exchange(&self, to: &Contact, request: Request) -> Outcome {
        let challenge = generate_challenge();
        let verb = request.verb();
        let signature = self
            .inner
            .credentials
            .sign_data(&request.signed_payload(&to.id, &challenge));

        let envelope = RequestEnvelope {
            sender: self.node_id(),
            challenge,
            signature,
            request,
        };

        let message_id = self.inner.next_message_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(message_id, PendingCall { tx, target: to.addr });

        if let Err(e) = self.send(to.addr, &WireMessage::Request { message_id, envelope }).await {
            lock(&self.inner.pending).remove(&message_id);
            debug!("Failed to send {} to {:?}: {}", verb, to, e);
            return Outcome::NoResponse;
        }

        let response = match timeout(self.inner.config.rpc_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Outcome::NoResponse,
            Err(_) => {
                lock(&self.inner.pending).remove(&message_id);
                debug!("{} to {:?} timed out", verb, to);
                return Outcome::NoResponse;
            }
        };

        self.verify_reply(to, verb, &challenge, response)
    }

    fn verify_reply(&self, to: &Contact, verb: Verb, challenge: &Challenge, response: ResponseEnvelope) -> Outcome {
        let ResponseEnvelope { signature, reply } = response;
        let credentials = &self.inner.credentials;

        if !verb.accepts(&reply) {
            warn!("Unexpected reply to {} from {:?}", verb, to);
            return Outcome::Invalid;
        }

        // FIND_CERT的应答自带证书，其他应答用本地已知的证书验证
        let cert = match (&reply, verb) {
            (Reply::Certificate(cert), Verb::FindCert) => {
                if let Err(e) = credentials.verify_certificate(cert) {
                    warn!("Invalid certificate response from {:?}: {}", to, e);
                    return Outcome::Invalid;
                }
                match NodeId::from_certificate(cert) {
                    Ok(id) if id == to.id => cert.clone(),
                    _ => {
                        warn!("Certificate from {:?} does not match claimed node id", to);
                        return Outcome::Invalid;
                    }
                }
            }
            _ => match credentials.get_certificate_locally(&to.id) {
                Some(cert) => cert,
                None => {
                    debug!("Certificate for sender of {} reply {:?} not present in store", verb, to);
                    return Outcome::Invalid;
                }
            },
        };

        let payload = reply.signed_payload(&self.node_id(), challenge);
        if let Err(e) = credentials.verify_signed_data(&cert, &signature, &payload) {
            warn!("Bad signature on {} reply from {:?}: {}", verb, to, e);
            return Outcome::Invalid;
        }

        match reply {
            Reply::Nack => Outcome::Nack,
            Reply::Pong { id } if id != to.id => {
                warn!("Pong id mismatch for {:?}", to);
                Outcome::Invalid
            }
            Reply::Certificate(cert) => {
                if let Err(e) = credentials.store_others_cert(&cert) {
                    warn!("Failed to store certificate of {:?}: {}", to, e);
                    return Outcome::Invalid;
                }
                Outcome::Reply(Reply::Certificate(cert))
            }
            reply => Outcome::Reply(reply),
        }
    }

    /// 完整的调用：处理NACK重试、失败计数和路由表更新
    pub(crate) async fn invoke(&self, to: &Contact, request: Request) -> Option<Reply> {
        match self.exchange(to, request.clone()).await {
            Outcome::Reply(reply) => {
                self.welcome(*to);
                Some(reply)
            }
            Outcome::Nack => self.retry_after_nack(to, request).await,
            Outcome::NoResponse => {
                self.note_failure(to);
                None
            }
            Outcome::Invalid => {
                self.drop_contact(to);
                None
            }
        }
    }

    /// 对方不认识我们：先发带证书的ping，再重试一次
    async fn retry_after_nack(&self, to: &Contact, request: Request) -> Option<Reply> {
        debug!("NACK from {:?}, sending our certificate", to);

        let ping = Request::Ping {
            certificate: Some(self.own_certificate()),
        };

        if let Outcome::Reply(Reply::Pong { .. }) = self.exchange(to, ping).await {
            self.welcome(*to);
            if let Outcome::Reply(reply) = self.exchange(to, request).await {
                return Some(reply);
            }
        }

        self.drop_contact(to);
        None
    }

    fn own_certificate(&self) -> Certificate {
        self.inner.credentials.own_certificate().clone()
    }

    pub async fn call_ping(&self, to: &Contact) -> Option<NodeId> {
        match self.invoke(to, Request::Ping { certificate: None }).await {
            Some(Reply::Pong { id }) => Some(id),
            _ => None,
        }
    }

    pub async fn call_store(&self, to: &Contact, key: NodeId, value: Vec<u8>) -> bool {
        matches!(self.invoke(to, Request::Store { key, value }).await, Some(Reply::Stored))
    }

    pub async fn call_append(&self, to: &Contact, key: NodeId, value: Vec<u8>) -> bool {
        matches!(self.invoke(to, Request::Append { key, value }).await, Some(Reply::Stored))
    }

    pub async fn call_remove(&self, to: &Contact, key: NodeId, value: Vec<u8>) -> bool {
        matches!(self.invoke(to, Request::Remove { key, value }).await, Some(Reply::Stored))
    }

    pub async fn call_find_node(&self, to: &Contact, target: NodeId) -> Option<Vec<Contact>> {
        match self.invoke(to, Request::FindNode { target }).await {
            Some(Reply::Nodes(nodes)) => Some(self.filter_certified(nodes)),
            _ => None,
        }
    }

    pub async fn call_find_value(&self, to: &Contact, key: NodeId) -> Option<FindResult> {
        let request = Request::FindValue { key, certificate: None };

        match self.invoke(to, request).await {
            Some(Reply::Value(value)) => Some(FindResult::Value(value)),
            Some(Reply::Nodes(nodes)) => Some(FindResult::Nodes(self.filter_certified(nodes))),
            _ => None,
        }
    }

    /// 向节点索要证书，成功后把它加入路由表
    pub async fn fetch_certificate(&self, to: &Contact) -> Option<Certificate> {
        let request = Request::FindCert {
            key: to.id.cert_key(),
            certificate: self.own_certificate(),
        };

        match self.exchange(to, request).await {
            Outcome::Reply(Reply::Certificate(cert)) => {
                self.welcome(*to);
                Some(cert)
            }
            _ => None,
        }
    }

    /// 用种子节点的证书认识它：验证证书、带证书ping、确认身份
    pub async fn introduce(&self, addr: SocketAddr, certificate: &Certificate) -> Option<Contact> {
        let id = match self.inner.credentials.store_others_cert(certificate) {
            Ok(id) => id,
            Err(e) => {
                warn!("Rejecting seed {}: {}", addr, e);
                return None;
            }
        };

        let contact = Contact::new(id, addr);
        let ping = Request::Ping {
            certificate: Some(self.own_certificate()),
        };

        match self.exchange(&contact, ping).await {
            Outcome::Reply(Reply::Pong { .. }) => {
                self.welcome(contact);
                Some(contact)
            }
            outcome => {
                debug!("Seed {:?} did not answer ping: {:?}", contact, outcome);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::dht::storage::ForgetfulStorage;
    use crate::identity::{CertificateAuthority, TrustStore};
    use crate::storage::CertificateDb;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn protocol(ca: &CertificateAuthority, name: &str) -> KademliaProtocol {
        let keypair = KeyPair::generate().unwrap();
        let cert = ca.issue(name, keypair.public).unwrap();
        let mut trust = TrustStore::new();
        trust.add_root(ca.certificate().clone()).unwrap();
        let creds = RuntimeCredentials::new(keypair, cert, trust, CertificateDb::temporary().unwrap()).unwrap();

        let config = DhtConfig {
            rpc_timeout: Duration::from_millis(300),
            ..DhtConfig::default()
        };
        KademliaProtocol::new(config, creds, Box::new(ForgetfulStorage::new(Duration::from_secs(60))))
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn signed_request(from: &KademliaProtocol, to: &KademliaProtocol, request: Request) -> RequestEnvelope {
        let challenge = generate_challenge();
        let signature = from
            .credentials()
            .sign_data(&request.signed_payload(&to.node_id(), &challenge));

        RequestEnvelope {
            sender: from.node_id(),
            challenge,
            signature,
            request,
        }
    }

    #[tokio::test]
    async fn test_unknown_sender_gets_signed_nack() {
        let ca = CertificateAuthority::new("testdomain").unwrap();
        let alice = protocol(&ca, "alice");
        let bob = protocol(&ca, "bob");

        let envelope = signed_request(&alice, &bob, Request::Ping { certificate: None });
        let challenge = envelope.challenge;
        let response = bob.handle_request(envelope, addr(5001)).unwrap();

        assert_eq!(response.reply, Reply::Nack);
        let payload = Reply::Nack.signed_payload(&alice.node_id(), &challenge);
        assert!(alice
            .credentials()
            .verify_signed_data(bob.credentials().own_certificate(), &response.signature, &payload)
            .is_ok());

        // 未认证的请求不会进入路由表
        assert!(bob.state().router.is_empty());
    }

    #[tokio::test]
    async fn test_ping_with_certificate_is_accepted() {
        let ca = CertificateAuthority::new("testdomain").unwrap();
        let alice = protocol(&ca, "alice");
        let bob = protocol(&ca, "bob");

        let ping = Request::Ping {
            certificate: Some(alice.credentials().own_certificate().clone()),
        };
        let response = bob.handle_request(signed_request(&alice, &bob, ping), addr(5001)).unwrap();

        assert_eq!(response.reply, Reply::Pong { id: bob.node_id() });
        assert!(bob.state().router.get(&alice.node_id()).is_some());
        assert!(bob.credentials().get_certificate_locally(&alice.node_id()).is_some());
    }

    #[tokio::test]
    async fn test_bad_signature_changes_nothing() {
        let ca = CertificateAuthority::new("testdomain").unwrap();
        let alice = protocol(&ca, "alice");
        let bob = protocol(&ca, "bob");
        bob.credentials().store_others_cert(alice.credentials().own_certificate()).unwrap();

        let key = NodeId::for_key("k");
        let mut envelope = signed_request(
            &alice,
            &bob,
            Request::Store {
                key,
                value: b"v".to_vec(),
            },
        );
        envelope.signature[0] ^= 0xff;

        assert!(bob.handle_request(envelope, addr(5001)).is_none());
        assert!(bob.get_local(&key).is_none());
        assert!(bob.state().router.is_empty());
    }

    #[tokio::test]
    async fn test_replayed_signature_for_other_recipient_is_rejected() {
        let ca = CertificateAuthority::new("testdomain").unwrap();
        let alice = protocol(&ca, "alice");
        let bob = protocol(&ca, "bob");
        let carol = protocol(&ca, "carol");
        carol.credentials().store_others_cert(alice.credentials().own_certificate()).unwrap();

        // 发给bob的签名请求被转发给carol
        let envelope = signed_request(&alice, &bob, Request::FindNode { target: NodeId::random() });
        assert!(carol.handle_request(envelope, addr(5001)).is_none());
    }

    #[tokio::test]
    async fn test_mismatched_attached_certificate_is_dropped() {
        let ca = CertificateAuthority::new("testdomain").unwrap();
        let alice = protocol(&ca, "alice");
        let bob = protocol(&ca, "bob");
        let mallory = protocol(&ca, "mallory");

        // mallory声称自己是alice，却附带自己的证书
        let challenge = generate_challenge();
        let request = Request::Ping {
            certificate: Some(mallory.credentials().own_certificate().clone()),
        };
        let signature = mallory
            .credentials()
            .sign_data(&request.signed_payload(&bob.node_id(), &challenge));
        let envelope = RequestEnvelope {
            sender: alice.node_id(),
            challenge,
            signature,
            request,
        };

        assert!(bob.handle_request(envelope, addr(5001)).is_none());
        assert!(bob.state().router.is_empty());
    }

    #[tokio::test]
    async fn test_append_and_remove_update_local_set() {
        let ca = CertificateAuthority::new("testdomain").unwrap();
        let alice = protocol(&ca, "alice");
        let bob = protocol(&ca, "bob");
        bob.credentials().store_others_cert(alice.credentials().own_certificate()).unwrap();
        let key = NodeId::for_key("color");

        for request in [
            Request::Append { key, value: br#"["red","blue"]"#.to_vec() },
            Request::Append { key, value: br#"["red"]"#.to_vec() },
            Request::Remove { key, value: br#"["red"]"#.to_vec() },
            Request::Append { key, value: b"garbage".to_vec() },
        ] {
            let response = bob.handle_request(signed_request(&alice, &bob, request), addr(5001)).unwrap();
            assert_eq!(response.reply, Reply::Stored);
        }

        let record = bob.get_local(&key).unwrap();
        assert_eq!(record.kind, RecordKind::Set);
        assert_eq!(record.value, br#"["blue"]"#.to_vec());
    }

    #[tokio::test]
    async fn test_find_value_returns_nodes_when_missing() {
        let ca = CertificateAuthority::new("testdomain").unwrap();
        let alice = protocol(&ca, "alice");
        let bob = protocol(&ca, "bob");
        let carol = protocol(&ca, "carol");
        bob.credentials().store_others_cert(alice.credentials().own_certificate()).unwrap();
        bob.welcome(Contact::new(carol.node_id(), addr(5003)));

        let key = NodeId::for_key("missing");
        let request = Request::FindValue { key, certificate: None };
        let response = bob.handle_request(signed_request(&alice, &bob, request), addr(5001)).unwrap();

        // 请求方自己不在返回列表中
        assert_eq!(response.reply, Reply::Nodes(vec![Contact::new(carol.node_id(), addr(5003))]));
    }

    #[tokio::test]
    async fn test_find_value_on_certificate_key_returns_own_certificate() {
        let ca = CertificateAuthority::new("testdomain").unwrap();
        let alice = protocol(&ca, "alice");
        let bob = protocol(&ca, "bob");
        bob.credentials().store_others_cert(alice.credentials().own_certificate()).unwrap();

        let request = Request::FindValue {
            key: bob.node_id().cert_key(),
            certificate: None,
        };
        let response = bob.handle_request(signed_request(&alice, &bob, request), addr(5001)).unwrap();

        let expected = bob.credentials().own_certificate().to_pem().unwrap().into_bytes();
        assert_eq!(response.reply, Reply::Value(expected));
    }

    #[tokio::test]
    async fn test_welcome_selects_records_for_new_node() {
        let ca = CertificateAuthority::new("testdomain").unwrap();
        let alice = protocol(&ca, "alice");
        let bob = protocol(&ca, "bob");
        alice.store_local(NodeId::for_key("a"), b"1".to_vec(), RecordKind::Single);
        alice.append_local(NodeId::for_key("b"), br#"["x"]"#).unwrap();

        // 路由表为空时所有记录都要推送
        let contact = Contact::new(bob.node_id(), addr(5002));
        let records = {
            let mut state = alice.state();
            alice.records_for_new_node(&mut state, &contact)
        };
        assert_eq!(records.len(), 2);

        // 只在第一次加入时推送
        assert_eq!(alice.welcome(contact), 2);
        assert_eq!(alice.welcome(contact), 0);
    }

    #[tokio::test]
    async fn test_cached_contact_receives_no_transfer() {
        let ca = CertificateAuthority::new("testdomain").unwrap();
        let keypair = KeyPair::generate().unwrap();
        let cert = ca.issue("alice", keypair.public).unwrap();
        let mut trust = TrustStore::new();
        trust.add_root(ca.certificate().clone()).unwrap();
        let creds = RuntimeCredentials::new(keypair, cert, trust, CertificateDb::temporary().unwrap()).unwrap();
        let config = DhtConfig {
            ksize: 2,
            ..DhtConfig::default()
        };
        let alice = KademliaProtocol::new(config, creds, Box::new(ForgetfulStorage::new(Duration::from_secs(60))));
        alice.store_local(NodeId::for_key("a"), b"1".to_vec(), RecordKind::Single);

        // 三个节点落在同一个（最远的）桶里
        let neighbor = |last: u8| {
            let mut id = alice.node_id().0;
            id[0] ^= 0x80;
            id[19] = last;
            Contact::new(NodeId(id), addr(6000 + last as u16))
        };
        alice.welcome(neighbor(1));
        alice.welcome(neighbor(2));

        let late = neighbor(3);
        assert_eq!(alice.welcome(late), 0);
        assert_eq!(alice.welcome(late), 0);
        assert!(alice.state().router.get(&late.id).is_none());
    }

    #[tokio::test]
    async fn test_calls_without_transport_are_non_responses() {
        let ca = CertificateAuthority::new("testdomain").unwrap();
        let alice = protocol(&ca, "alice");
        let bob = protocol(&ca, "bob");
        let contact = Contact::new(bob.node_id(), addr(5002));

        alice.state().router.add_contact(contact);
        assert!(alice.call_ping(&contact).await.is_none());
        assert!(alice.call_ping(&contact).await.is_none());

        // 连续两次失败后被移除
        assert!(alice.state().router.get(&bob.node_id()).is_none());
        assert!(alice.local_addr().is_none());
    }
}
