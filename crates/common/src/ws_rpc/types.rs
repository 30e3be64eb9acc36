/// 通知协议数据类型定义

use serde::{Deserialize, Serialize};

// ============================================================================
// 方法名
// ============================================================================

pub mod methods {
    pub const VIRTUALBOX_SETTINGS: &str = "virtualbox.settings";
    pub const VIRTUALBOX_RESET: &str = "virtualbox.reset";
    pub const VIRTUALBOX_START: &str = "virtualbox.start";
    pub const VIRTUALBOX_STOP: &str = "virtualbox.stop";
    pub const VIRTUALBOX_VM_LIST: &str = "virtualbox.vm_list";
}

// ============================================================================
// 节点
// ============================================================================

/// 服务器上报的节点故障通知
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeFailureNotification {
    pub id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: String,
}

/// 启动、停止节点的通知参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRequest {
    pub id: String,
}

// ============================================================================
// 虚拟机列表
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmListResponse {
    #[serde(default)]
    pub vms: Vec<String>,
}

// ============================================================================
// 远程服务器启动
// ============================================================================

/// 通过 SSH 启动远程模拟服务器时传入的数据
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerStartPayload {
    pub instance_id: String,
    pub cloud_user_name: String,
    pub cloud_api_key: String,
    pub region: String,
    /// 空闲多少秒后自动关机
    pub dead_time: u64,
}
