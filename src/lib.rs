pub mod crypto;
pub mod dht;
pub mod identity;
pub mod storage;
pub mod utils;
