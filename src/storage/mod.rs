mod cert_store;
mod database;

pub use cert_store::CertificateDb;
pub use database::{Database, DatabaseError};

/*
 * Persistent storage
 *
 * sled-backed storage for state that must survive a restart. Today this is
 * the cache of peers' certificates; DHT records themselves live in memory
 * (see dht::ForgetfulStorage).
 */
