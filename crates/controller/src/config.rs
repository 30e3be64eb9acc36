/// 配置管理

use common::models::constants::{DEFAULT_LOCAL_SERVER_PORT, DEFAULT_RPC_TIMEOUT};
use common::utils::parse_endpoint;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub settings_path: PathBuf,
    pub local_server_host: String,
    pub local_server_port: u16,
    pub remote_servers: Vec<(String, u16)>,
    pub project_dir: Option<PathBuf>,
    pub rpc_timeout: u64,
    pub connect_timeout: u64,
    pub log_level: String,
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> anyhow::Result<Self> {
        let settings_path = std::env::var("SETTINGS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("settings.json"));

        let local_server_host = std::env::var("LOCAL_SERVER_HOST")
            .unwrap_or_else(|_| "127.0.0.1".to_string());

        let local_server_port = match std::env::var("LOCAL_SERVER_PORT") {
            Ok(port) => port.parse()?,
            Err(_) => DEFAULT_LOCAL_SERVER_PORT,
        };

        // 格式: host1:port1,host2:port2
        let remote_servers = match std::env::var("REMOTE_SERVERS") {
            Ok(list) => parse_server_list(&list)?,
            Err(_) => Vec::new(),
        };

        let project_dir = std::env::var("PROJECT_DIR").ok().map(PathBuf::from);

        let rpc_timeout = std::env::var("RPC_TIMEOUT_SECS")
            .unwrap_or_else(|_| DEFAULT_RPC_TIMEOUT.to_string())
            .parse()?;

        let connect_timeout = std::env::var("CONNECT_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()?;

        let log_level = std::env::var("LOG_LEVEL")
            .unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            settings_path,
            local_server_host,
            local_server_port,
            remote_servers,
            project_dir,
            rpc_timeout,
            connect_timeout,
            log_level,
        })
    }
}

/// 解析逗号分隔的服务器列表
pub fn parse_server_list(list: &str) -> anyhow::Result<Vec<(String, u16)>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_endpoint(s).ok_or_else(|| anyhow::anyhow!("无效的服务器地址: {}", s)))
        .collect()
}
