use serde::{Deserialize, Serialize};
use std::fs::{create_dir_all, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Path error: {0}")]
    PathError(String),
}

/// 应用程序配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 节点名称，也是签发证书时的主题
    pub node_name: String,

    /// 监听地址
    pub listen_addr: String,

    /// 数据目录
    pub data_dir: PathBuf,

    /// 私钥文件
    pub key_path: PathBuf,

    /// 节点证书
    pub cert_path: PathBuf,

    /// 受信任的CA证书目录
    pub ca_dir: PathBuf,

    /// DHT引导节点，格式: <ip:port>=<cert.pem>
    pub bootstrap_nodes: Vec<String>,

    /// 日志级别
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: "registry-node".to_string(),
            listen_addr: "0.0.0.0:5000".to_string(),
            data_dir: PathBuf::from("data"),
            key_path: PathBuf::from("node.key"),
            cert_path: PathBuf::from("node.pem"),
            ca_dir: PathBuf::from("trust"),
            bootstrap_nodes: vec![],
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// 默认配置文件位置
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dht-registry")
            .join("config.json")
    }

    /// 从文件加载配置，文件不存在时使用默认值
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let mut file = File::open(path)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;

        let config = serde_json::from_str(&content)?;

        Ok(config)
    }

    /// 保存配置到文件
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;

        let mut file = File::create(path)?;
        file.write_all(content.as_bytes())?;

        Ok(())
    }

    /// 确保数据目录存在
    pub fn ensure_data_dir(&self) -> Result<(), ConfigError> {
        create_dir_all(&self.data_dir)?;
        Ok(())
    }

    /// 相对路径按数据目录解析
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    /// 证书库（sled）目录
    pub fn cert_db_path(&self) -> PathBuf {
        self.data_dir.join("certificates")
    }

    /// save_state的文件
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    /// 解析监听地址
    pub fn listen_socket_addr(&self) -> Result<std::net::SocketAddr, ConfigError> {
        self.listen_addr
            .parse()
            .map_err(|e| ConfigError::PathError(format!("Invalid listen address {}: {}", self.listen_addr, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.node_name = "node-a".to_string();
        config.bootstrap_nodes = vec!["127.0.0.1:5000=seed.pem".to_string()];
        config.save(&path).unwrap();

        assert_eq!(Config::load(&path).unwrap(), config);
        assert_eq!(Config::load(&dir.path().join("missing.json")).unwrap(), Config::default());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"node_name": "node-b"}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.node_name, "node-b");
        assert_eq!(config.listen_addr, Config::default().listen_addr);
    }

    #[test]
    fn test_relative_paths_resolve_against_data_dir() {
        let config = Config {
            data_dir: PathBuf::from("/var/lib/registry"),
            ..Config::default()
        };

        assert_eq!(config.resolve(&config.key_path), PathBuf::from("/var/lib/registry/node.key"));
        assert_eq!(config.resolve(Path::new("/etc/ca")), PathBuf::from("/etc/ca"));
        assert!(config.listen_socket_addr().is_ok());
    }
}
