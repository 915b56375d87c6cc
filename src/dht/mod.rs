mod bootstrap;
mod crawling;
mod kademlia;
mod network;
mod protocol;
pub mod records;
mod routing;
mod rpc;
mod server;
mod storage;
mod validation;

pub use bootstrap::SeedNode;
pub use crawling::{NodeHeap, NodeSpiderCrawl, ValueListSpiderCrawl, ValueSpiderCrawl};
pub use kademlia::{Contact, DhtConfig, DhtError, NodeId, ID_BITS, ID_LENGTH};
pub use network::{Inbound, MemoryNetwork, Outbound, TransportHandle, UdpTransport};
pub use protocol::{generate_challenge, Challenge, Reply, Request, RequestEnvelope, ResponseEnvelope, Verb, WireMessage};
pub use routing::{AddOutcome, RoutingTable};
pub use rpc::{FindResult, KademliaProtocol, NodeState};
pub use server::AppendServer;
pub use storage::{DhtStorage, ForgetfulStorage, RecordKind, StoredRecord};
pub use validation::validate_node_id;

/*
 * Secure Kademlia DHT for the registry
 *
 * Layers, leaves first:
 *
 * 1. kademlia / routing - node ids, contacts and the k-bucket table
 * 2. protocol / network - signed wire messages over a datagram transport
 * 3. rpc - challenge/response authenticated calls, NACK handling and
 *    record transfer to newly admitted nodes
 * 4. crawling - node, value and value-list spider crawls
 * 5. server - the AppendServer facade: set/get/get_concat/append/remove
 */
