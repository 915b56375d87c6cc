use dht_registry::crypto::KeyPair;
use dht_registry::dht::{AppendServer, DhtConfig, SeedNode};
use dht_registry::identity::{save_keypair, Certificate, CertificateAuthority, RuntimeCredentials};
use dht_registry::storage::CertificateDb;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// 像命令行的issue一样把私钥和证书写到磁盘
fn issue_to_disk(ca: &CertificateAuthority, name: &str, dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let keypair = KeyPair::generate().unwrap();
    let cert = ca.issue(name, keypair.public).unwrap();

    let key_path = dir.join(format!("{}.key", name));
    let cert_path = dir.join(format!("{}.pem", name));
    save_keypair(&key_path, &keypair).unwrap();
    std::fs::write(&cert_path, cert.to_pem().unwrap()).unwrap();

    (key_path, cert_path)
}

fn load_node(ca_dir: &Path, dir: &Path, name: &str, ca: &CertificateAuthority) -> RuntimeCredentials {
    let (key_path, cert_path) = issue_to_disk(ca, name, dir);
    let db = CertificateDb::open(dir.join(format!("{}-certs", name))).unwrap();

    RuntimeCredentials::load(&key_path, &cert_path, ca_dir, db).unwrap()
}

fn config() -> DhtConfig {
    DhtConfig {
        rpc_timeout: Duration::from_millis(500),
        ..DhtConfig::default()
    }
}

#[tokio::test]
async fn test_nodes_over_loopback_udp() {
    let dir = tempfile::tempdir().unwrap();
    let ca_dir = dir.path().join("ca");
    let ca = CertificateAuthority::new("registry-ca").unwrap();
    ca.save(&ca_dir).unwrap();
    let ca = CertificateAuthority::load(&ca_dir).unwrap();

    let seed_creds = load_node(&ca_dir, dir.path(), "seed", &ca);
    let peer_creds = load_node(&ca_dir, dir.path(), "peer", &ca);
    let seed_cert = Certificate::load(&dir.path().join("seed.pem")).unwrap();

    let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let seed = AppendServer::new(config(), seed_creds);
    assert!(seed.start(loopback, &[]).await.unwrap());
    let seed_addr = seed.local_addr().unwrap();

    let peer = AppendServer::new(config(), peer_creds);
    let seed_entry = format!("{}={}", seed_addr, dir.path().join("seed.pem").display());
    let seeds = vec![SeedNode::parse(&seed_entry).unwrap()];
    assert_eq!(seeds[0].certificate, seed_cert);
    assert!(peer.start(loopback, &seeds).await.unwrap());

    assert!(peer.set("runtime/peer", b"alive".to_vec()).await.unwrap());
    assert_eq!(seed.get("runtime/peer").await.unwrap(), Some(b"alive".to_vec()));

    assert!(seed.append("index/runtimes", &[Value::from("seed")]).await.unwrap());
    assert!(peer.append("index/runtimes", &[Value::from("peer")]).await.unwrap());
    assert_eq!(peer.get_set("index/runtimes").await.unwrap().len(), 2);

    // 对方的证书已经验证并缓存
    assert_eq!(
        peer.protocol().credentials().get_certificate_locally(&seed.node_id()),
        Some(seed_cert)
    );

    peer.stop().await.unwrap();
    seed.stop().await.unwrap();
}
