use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dht_registry::crypto::KeyPair;
use dht_registry::dht::{AppendServer, DhtConfig, SeedNode};
use dht_registry::identity::{save_keypair, CertificateAuthority, RuntimeCredentials};
use dht_registry::storage::CertificateDb;
use dht_registry::utils::{self, parse_log_level, setup_logger, Config};
use log::{error, info, warn};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::ctrl_c;

/// 命令行参数
#[derive(Parser, Debug)]
#[clap(author, version, about = "Secure Kademlia registry node", long_about = None)]
struct Args {
    /// 配置文件路径
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// 日志级别
    #[clap(long)]
    log_level: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 创建新的CA（根证书和私钥）
    CaInit {
        /// CA名称
        #[clap(long, default_value = "registry-ca")]
        name: String,

        /// 输出目录
        #[clap(long)]
        dir: PathBuf,
    },

    /// 用CA为节点签发证书和私钥
    Issue {
        /// CA目录
        #[clap(long)]
        ca: PathBuf,

        /// 证书主题
        #[clap(long)]
        name: String,

        /// 输出目录，写入<name>.key和<name>.pem
        #[clap(long)]
        out: PathBuf,
    },

    /// 启动节点
    Run {
        /// 监听地址，覆盖配置
        #[clap(short, long)]
        listen: Option<String>,

        /// 引导节点，格式: <ip:port>=<cert.pem>
        #[clap(short, long)]
        bootstrap: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path).context("Failed to load config")?;

    let level = args.log_level.as_deref().unwrap_or(&config.log_level);
    let level = parse_log_level(level).map_err(anyhow::Error::msg)?;
    setup_logger(Some(level)).map_err(anyhow::Error::msg)?;

    match args.command {
        Command::CaInit { name, dir } => ca_init(&name, &dir),
        Command::Issue { ca, name, out } => issue(&ca, &name, &out),
        Command::Run { listen, bootstrap } => {
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            if !bootstrap.is_empty() {
                config.bootstrap_nodes = bootstrap;
            }
            // 首次运行时保存默认配置
            if !config_path.exists() {
                config.save(&config_path)?;
            }
            run(config).await
        }
    }
}

fn ca_init(name: &str, dir: &Path) -> anyhow::Result<()> {
    let ca = CertificateAuthority::new(name)?;
    ca.save(dir).with_context(|| format!("Failed to write CA to {}", dir.display()))?;

    info!("Created CA '{}' in {}", name, dir.display());
    println!("{}", dir.join("ca.pem").display());
    Ok(())
}

fn issue(ca_dir: &Path, name: &str, out: &Path) -> anyhow::Result<()> {
    let ca = CertificateAuthority::load(ca_dir).with_context(|| format!("Failed to load CA from {}", ca_dir.display()))?;

    let keypair = KeyPair::generate()?;
    let cert = ca.issue(name, keypair.public)?;

    std::fs::create_dir_all(out)?;
    let key_path = out.join(format!("{}.key", name));
    let cert_path = out.join(format!("{}.pem", name));
    save_keypair(&key_path, &keypair)?;
    std::fs::write(&cert_path, cert.to_pem()?)?;

    info!("Issued certificate for '{}' signed by '{}'", name, ca.name());
    println!("{}", cert_path.display());
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    config.ensure_data_dir()?;
    info!("Starting {} {} as '{}'", utils::name(), utils::version(), config.node_name);

    let cert_db = CertificateDb::open(config.cert_db_path()).context("Failed to open certificate store")?;
    let credentials = RuntimeCredentials::load(
        &config.resolve(&config.key_path),
        &config.resolve(&config.cert_path),
        &config.resolve(&config.ca_dir),
        cert_db,
    )
    .context("Failed to load runtime credentials")?;

    let mut seeds = Vec::new();
    for entry in &config.bootstrap_nodes {
        match SeedNode::parse(entry) {
            Ok(seed) => seeds.push(seed),
            Err(e) => warn!("Invalid bootstrap node {}: {}", entry, e),
        }
    }

    let state_path = config.state_path();
    let server = if seeds.is_empty() && state_path.exists() {
        let (server, saved) = AppendServer::load_state(&state_path, DhtConfig::default(), credentials)?;
        seeds = saved;
        server
    } else {
        AppendServer::new(DhtConfig::default(), credentials)
    };

    info!("Node id: {}", server.node_id());

    let listen_addr = config.listen_socket_addr()?;
    if !server.start(listen_addr, &seeds).await? {
        warn!("Bootstrap did not reach any seed, running alone");
    }
    server.save_state_regularly(state_path.clone(), Duration::from_secs(600));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !handle_command(&server, line.trim()).await {
                        break;
                    }
                }
                None => break,
            },
            _ = ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    if let Err(e) = server.save_state(&state_path) {
        warn!("Failed to save state: {}", e);
    }
    server.stop().await?;

    info!("Registry node stopped.");
    Ok(())
}

/// 执行一行命令，返回false表示退出
async fn handle_command(server: &AppendServer, line: &str) -> bool {
    let mut parts = line.splitn(3, char::is_whitespace);
    let command = parts.next().unwrap_or("");
    let key = parts.next();
    let rest = parts.next().map(str::trim);

    let result = match (command, key, rest) {
        ("", _, _) => return true,
        ("quit", _, _) | ("exit", _, _) => return false,
        ("help", _, _) => {
            println!("set <key> <value> | get <key> | append <key> <json list> | remove <key> <json list>");
            println!("concat <key> | delete <key> | neighbors | quit");
            return true;
        }
        ("neighbors", _, _) => {
            for seed in server.bootstrappable_neighbors() {
                println!("{}", seed.addr);
            }
            return true;
        }
        ("set", Some(key), Some(value)) => server.set(key, value.as_bytes().to_vec()).await.map(|ok| ok.to_string()),
        ("get", Some(key), None) => server.get(key).await.map(printable),
        ("concat", Some(key), None) => server.get_concat(key).await.map(printable),
        ("delete", Some(key), None) => server.delete(key).await.map(|ok| ok.to_string()),
        ("append", Some(key), Some(values)) | ("remove", Some(key), Some(values)) => {
            match parse_list(values) {
                Ok(values) if command == "append" => server.append(key, &values).await.map(|ok| ok.to_string()),
                Ok(values) => server.remove(key, &values).await.map(|ok| ok.to_string()),
                Err(e) => {
                    println!("{}", e);
                    return true;
                }
            }
        }
        _ => {
            println!("Unknown command, try 'help'");
            return true;
        }
    };

    match result {
        Ok(output) => println!("{}", output),
        Err(e) => error!("{} failed: {}", command, e),
    }
    true
}

fn parse_list(text: &str) -> anyhow::Result<Vec<Value>> {
    match serde_json::from_str::<Value>(text)? {
        Value::Array(items) => Ok(items),
        _ => bail!("Expected a JSON list such as [\"a\", \"b\"]"),
    }
}

fn printable(value: Option<Vec<u8>>) -> String {
    match value {
        Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        None => "(not found)".to_string(),
    }
}
