use crate::dht::kademlia::DhtError;
use crate::utils::lock;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// 出站数据报：目的地址和内容
pub type Outbound = (SocketAddr, Vec<u8>);

/// 入站数据报：内容和来源地址
pub type Inbound = (Vec<u8>, SocketAddr);

const CHANNEL_CAPACITY: usize = 1000;
const MAX_DATAGRAM: usize = 65536;

/// 一个已就绪的数据报传输
///
/// DHT只需要发送和接收数据报，底层可以是UDP也可以是进程内交换。
#[derive(Debug)]
pub struct TransportHandle {
    /// 本地绑定地址
    pub local_addr: SocketAddr,

    /// 出站通道
    pub outbound: mpsc::Sender<Outbound>,

    /// 入站通道
    pub inbound: mpsc::Receiver<Inbound>,
}

/// UDP传输
pub struct UdpTransport;

impl UdpTransport {
    /// 绑定UDP socket并启动收发任务
    pub async fn bind(bind_addr: SocketAddr) -> Result<TransportHandle, DhtError> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| DhtError::Transport(format!("Failed to bind UDP socket: {}", e)))?;

        let local_addr = socket
            .local_addr()
            .map_err(|e| DhtError::Transport(format!("Failed to get local address: {}", e)))?;

        info!("DHT transport bound to {}", local_addr);

        let socket = Arc::new(socket);
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);

        Self::spawn_send_task(socket.clone(), outbound_rx);
        Self::spawn_receive_task(socket, inbound_tx);

        Ok(TransportHandle {
            local_addr,
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }

    /// 出站通道关闭时结束
    fn spawn_send_task(socket: Arc<UdpSocket>, mut outbound_rx: mpsc::Receiver<Outbound>) {
        tokio::spawn(async move {
            while let Some((addr, bytes)) = outbound_rx.recv().await {
                if let Err(e) = socket.send_to(&bytes, addr).await {
                    warn!("Failed to send datagram to {}: {}", addr, e);
                }
            }

            debug!("UDP send task stopped");
        });
    }

    /// 入站接收方被丢弃时结束
    fn spawn_receive_task(socket: Arc<UdpSocket>, inbound_tx: mpsc::Sender<Inbound>) {
        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];

            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buffer) => match received {
                        Ok((len, addr)) => {
                            if inbound_tx.send((buffer[..len].to_vec(), addr)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            // ICMP不可达等错误在部分平台上会从recv_from返回
                            debug!("Failed to receive datagram: {}", e);
                        }
                    },
                    _ = inbound_tx.closed() => break,
                }
            }

            debug!("UDP receive task stopped");
        });
    }
}

#[derive(Default)]
struct SwitchState {
    peers: HashMap<SocketAddr, mpsc::Sender<Inbound>>,
    blocked: HashSet<SocketAddr>,
    next_port: u16,
}

/// 进程内数据报交换，用于测试
///
/// 可以让某个节点"掉线"：发往它或来自它的数据报被丢弃。
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<SwitchState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// 接入一个新节点，分配127.0.0.1上的虚拟端口
    pub fn attach(&self) -> TransportHandle {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let local_addr = {
            let mut state = lock(&self.state);
            state.next_port = state.next_port.wrapping_add(1);
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 10000 + state.next_port);
            state.peers.insert(addr, inbound_tx);
            addr
        };

        let switch = self.clone();
        tokio::spawn(async move {
            while let Some((dest, bytes)) = outbound_rx.recv().await {
                let target = {
                    let state = lock(&switch.state);
                    if state.blocked.contains(&local_addr) || state.blocked.contains(&dest) {
                        None
                    } else {
                        state.peers.get(&dest).cloned()
                    }
                };

                match target {
                    Some(tx) => {
                        // 队列满时丢弃，和UDP一样不保证送达
                        let _ = tx.try_send((bytes, local_addr));
                    }
                    None => debug!("Dropping datagram {} -> {}", local_addr, dest),
                }
            }

            lock(&switch.state).peers.remove(&local_addr);
        });

        TransportHandle {
            local_addr,
            outbound: outbound_tx,
            inbound: inbound_rx,
        }
    }

    /// 断开节点
    pub fn detach(&self, addr: &SocketAddr) {
        lock(&self.state).peers.remove(addr);
    }

    /// 阻断或恢复节点的所有流量
    pub fn set_blocked(&self, addr: SocketAddr, blocked: bool) {
        let mut state = lock(&self.state);
        if blocked {
            state.blocked.insert(addr);
        } else {
            state.blocked.remove(&addr);
        }
    }
}
