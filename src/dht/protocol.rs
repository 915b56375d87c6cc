use crate::dht::kademlia::{Contact, NodeId};
use crate::identity::Certificate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 每次调用生成的随机挑战
pub type Challenge = [u8; 8];

/// 生成8字节随机挑战
pub fn generate_challenge() -> Challenge {
    let mut challenge = [0u8; 8];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut challenge);
    challenge
}

/// RPC动词
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Ping,
    Store,
    Append,
    Remove,
    FindNode,
    FindValue,
    FindCert,
}

impl Verb {
    fn tag(&self) -> &'static [u8] {
        match self {
            Verb::Ping => b"ping",
            Verb::Store => b"store",
            Verb::Append => b"append",
            Verb::Remove => b"remove",
            Verb::FindNode => b"find_node",
            Verb::FindValue => b"find_value",
            Verb::FindCert => b"find_cert",
        }
    }

    /// 该动词可以收到的应答类型，NACK对所有动词都合法
    pub fn accepts(&self, reply: &Reply) -> bool {
        matches!(
            (self, reply),
            (_, Reply::Nack)
                | (Verb::Ping, Reply::Pong { .. })
                | (Verb::Store, Reply::Stored)
                | (Verb::Append, Reply::Stored)
                | (Verb::Remove, Reply::Stored)
                | (Verb::FindNode, Reply::Nodes(_))
                | (Verb::FindValue, Reply::Nodes(_))
                | (Verb::FindValue, Reply::Value(_))
                | (Verb::FindCert, Reply::Certificate(_))
        )
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.tag()))
    }
}

/// RPC请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Ping消息，可附带调用方证书
    Ping { certificate: Option<Certificate> },

    /// 覆盖写入单值
    Store { key: NodeId, value: Vec<u8> },

    /// 并入集合
    Append { key: NodeId, value: Vec<u8> },

    /// 从集合中移除
    Remove { key: NodeId, value: Vec<u8> },

    /// 查找离目标最近的节点
    FindNode { target: NodeId },

    /// 查找值，找不到时返回最近的节点
    FindValue {
        key: NodeId,
        certificate: Option<Certificate>,
    },

    /// 向节点索要它自己的证书，总是附带调用方证书
    FindCert { key: NodeId, certificate: Certificate },
}

impl Request {
    pub fn verb(&self) -> Verb {
        match self {
            Request::Ping { .. } => Verb::Ping,
            Request::Store { .. } => Verb::Store,
            Request::Append { .. } => Verb::Append,
            Request::Remove { .. } => Verb::Remove,
            Request::FindNode { .. } => Verb::FindNode,
            Request::FindValue { .. } => Verb::FindValue,
            Request::FindCert { .. } => Verb::FindCert,
        }
    }

    /// 请求附带的调用方证书
    pub fn attached_certificate(&self) -> Option<&Certificate> {
        match self {
            Request::Ping { certificate } => certificate.as_ref(),
            Request::FindValue { certificate, .. } => certificate.as_ref(),
            Request::FindCert { certificate, .. } => Some(certificate),
            _ => None,
        }
    }

    /// 调用方签名的字节：接收方ID、动词、挑战和参数
    pub fn signed_payload(&self, recipient: &NodeId, challenge: &Challenge) -> Vec<u8> {
        let mut payload = SignedPayload::new(recipient, self.verb().tag(), challenge);

        match self {
            Request::Ping { .. } => {}
            Request::Store { key, value } | Request::Append { key, value } | Request::Remove { key, value } => {
                payload.field(&key.0);
                payload.field(value);
            }
            Request::FindNode { target } => payload.field(&target.0),
            Request::FindValue { key, .. } | Request::FindCert { key, .. } => payload.field(&key.0),
        }

        payload.finish()
    }
}

/// RPC应答
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    /// Ping的响应，带应答方ID
    Pong { id: NodeId },

    /// STORE/APPEND/REMOVE已执行
    Stored,

    /// 最近的节点列表
    Nodes(Vec<Contact>),

    /// 找到的值
    Value(Vec<u8>),

    /// 应答方自己的证书
    Certificate(Certificate),

    /// 应答方不认识调用方，签名只覆盖挑战
    Nack,
}

impl Reply {
    fn tag(&self) -> &'static [u8] {
        match self {
            Reply::Pong { .. } => b"pong",
            Reply::Stored => b"stored",
            Reply::Nodes(_) => b"nodes",
            Reply::Value(_) => b"value",
            Reply::Certificate(_) => b"certificate",
            Reply::Nack => b"nack",
        }
    }

    /// 应答方签名的字节：调用方ID、应答类型、挑战和内容
    pub fn signed_payload(&self, recipient: &NodeId, challenge: &Challenge) -> Vec<u8> {
        let mut payload = SignedPayload::new(recipient, self.tag(), challenge);

        match self {
            Reply::Pong { id } => payload.field(&id.0),
            Reply::Stored | Reply::Nack => {}
            Reply::Nodes(contacts) => {
                for contact in contacts {
                    payload.field(&contact.id.0);
                    payload.field(contact.addr.to_string().as_bytes());
                }
            }
            Reply::Value(value) => payload.field(value),
            Reply::Certificate(cert) => match cert.fingerprint() {
                Ok(fingerprint) => payload.field(&fingerprint),
                Err(_) => payload.field(&[]),
            },
        }

        payload.finish()
    }
}

/// 长度前缀拼接，避免字段边界歧义
struct SignedPayload(Vec<u8>);

impl SignedPayload {
    fn new(recipient: &NodeId, tag: &[u8], challenge: &Challenge) -> Self {
        let mut payload = Self(Vec::with_capacity(64));
        payload.0.extend_from_slice(&recipient.0);
        payload.field(tag);
        payload.0.extend_from_slice(challenge);
        payload
    }

    fn field(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        self.0.extend_from_slice(bytes);
    }

    fn finish(self) -> Vec<u8> {
        self.0
    }
}

/// 请求信封
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub sender: NodeId,
    pub challenge: Challenge,
    pub signature: Vec<u8>,
    pub request: Request,
}

/// 应答信封
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub signature: Vec<u8>,
    pub reply: Reply,
}

/// 线上传输的数据报
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    Request {
        message_id: u64,
        envelope: RequestEnvelope,
    },
    Response {
        message_id: u64,
        envelope: ResponseEnvelope,
    },
}

impl WireMessage {
    /// 获取消息ID
    pub fn message_id(&self) -> u64 {
        match self {
            WireMessage::Request { message_id, .. } => *message_id,
            WireMessage::Response { message_id, .. } => *message_id,
        }
    }

    /// 序列化消息为字节
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// 从字节反序列化消息
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    #[test]
    fn test_message_serialization() {
        let message = WireMessage::Request {
            message_id: 12345,
            envelope: RequestEnvelope {
                sender: NodeId::random(),
                challenge: generate_challenge(),
                signature: vec![1; 64],
                request: Request::FindNode { target: NodeId::random() },
            },
        };

        let bytes = message.to_bytes().unwrap();
        let decoded = WireMessage::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.message_id(), 12345);
        assert!(WireMessage::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn test_signed_payload_binds_recipient_challenge_and_args() {
        let recipient = NodeId::random();
        let challenge = [1u8; 8];
        let store = Request::Store {
            key: NodeId::for_key("k"),
            value: b"v".to_vec(),
        };
        let append = Request::Append {
            key: NodeId::for_key("k"),
            value: b"v".to_vec(),
        };

        let base = store.signed_payload(&recipient, &challenge);
        assert_ne!(base, append.signed_payload(&recipient, &challenge));
        assert_ne!(base, store.signed_payload(&NodeId::random(), &challenge));
        assert_ne!(base, store.signed_payload(&recipient, &[2u8; 8]));
    }

    #[test]
    fn test_nack_payload_differs_from_other_replies() {
        let recipient = NodeId::random();
        let challenge = generate_challenge();

        let nack = Reply::Nack.signed_payload(&recipient, &challenge);
        let stored = Reply::Stored.signed_payload(&recipient, &challenge);
        assert_ne!(nack, stored);

        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4000);
        let one = Reply::Nodes(vec![Contact::new(NodeId::random(), addr)]);
        assert_ne!(
            one.signed_payload(&recipient, &challenge),
            Reply::Nodes(Vec::new()).signed_payload(&recipient, &challenge)
        );
    }

    #[test]
    fn test_verb_accepts_matching_replies() {
        assert!(Verb::Ping.accepts(&Reply::Pong { id: NodeId::random() }));
        assert!(Verb::Store.accepts(&Reply::Nack));
        assert!(Verb::FindValue.accepts(&Reply::Value(b"v".to_vec())));
        assert!(!Verb::FindNode.accepts(&Reply::Value(b"v".to_vec())));
        assert!(!Verb::Append.accepts(&Reply::Pong { id: NodeId::random() }));
    }

    #[test]
    fn test_attached_certificate() {
        assert!(Request::Ping { certificate: None }.attached_certificate().is_none());
        assert!(Request::FindNode { target: NodeId::random() }
            .attached_certificate()
            .is_none());
    }
}
