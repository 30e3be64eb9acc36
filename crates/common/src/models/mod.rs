/// 共享数据模型
///
/// 定义 controller 和 provisioner 共享的数据结构

use serde::{Deserialize, Serialize};

/// 服务器连接状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Disconnected,
    Connecting,
    Connected,
}

/// 云主机状态（由云厂商分配）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Building,
    Active,
    Error,
    Deleted,
    Unknown,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Building => "building",
            Self::Active => "active",
            Self::Error => "error",
            Self::Deleted => "deleted",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// 云主机实例
///
/// 不做缓存，每次列表都要请求云厂商
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudInstance {
    pub id: String,
    pub name: String,
    pub state: InstanceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
}

/// 与云主机一同创建的密钥对
///
/// 私钥只在创建时返回一次，丢失后无法找回
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyPair {
    pub name: String,
    pub private_key: String,
}

/// 常量定义
pub mod constants {
    /// 本地服务器在虚拟机定义中的标识
    pub const LOCAL_SERVER: &str = "local";

    /// 默认本地服务器端口
    pub const DEFAULT_LOCAL_SERVER_PORT: u16 = 8000;

    /// 默认 RPC 请求超时（秒）
    pub const DEFAULT_RPC_TIMEOUT: u64 = 30;

    /// 项目目录后缀，发送给远程服务器时去掉
    pub const PROJECT_FILES_SUFFIX: &str = "-files";
}
