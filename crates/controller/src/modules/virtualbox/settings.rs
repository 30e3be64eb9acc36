/// VirtualBox 模块设置与虚拟机定义

use crate::settings::SettingsSchema;
use common::models::constants::LOCAL_SERVER;
use common::Server;
use serde::{Deserialize, Serialize};

use super::super::NodeSettings;

/// 模块设置分组
pub const SETTINGS_GROUP: &str = "VirtualBox";

/// 虚拟机定义分组
pub const VMS_GROUP: &str = "VirtualBoxVMs";

/// 虚拟机定义数组名
pub const VMS_ARRAY: &str = "VM";

/// 不发送给远程服务器的设置
pub const LOCAL_ONLY_SETTINGS: &[&str] = &["vboxwrapper_path"];

/// 模块设置 schema
pub fn settings_schema() -> SettingsSchema {
    SettingsSchema::new()
        .path("vboxwrapper_path", "")
        .path("vboxmanage_path", "")
        .bool("use_local_server", true)
        .int("console_start_port_range", 3501)
        .int("console_end_port_range", 4000)
        .int("udp_start_port_range", 35001)
        .int("udp_end_port_range", 35500)
}

/// 虚拟机定义 schema
pub fn vm_schema() -> SettingsSchema {
    SettingsSchema::new()
        .string("vmname", "")
        .int("adapters", 1)
        .int("adapter_start_index", 0)
        .string("adapter_type", "Automatic")
        .bool("headless", false)
        .bool("enable_console", true)
        .string("server", LOCAL_SERVER)
}

/// 绑定到某个服务器的虚拟机定义
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDefinition {
    pub vmname: String,
    pub adapters: u32,
    pub adapter_start_index: u32,
    pub adapter_type: String,
    pub headless: bool,
    pub enable_console: bool,
    /// 服务器主机名，或本地服务器标识 "local"
    pub server: String,
}

impl VmDefinition {
    /// 组合键 "server:vmname"
    pub fn key(&self) -> String {
        format!("{}:{}", self.server, self.vmname)
    }

    /// 定义是否属于指定服务器
    pub fn belongs_to(&self, server: &dyn Server) -> bool {
        self.server == server.host() || (server.is_local() && self.server == LOCAL_SERVER)
    }

    /// 复制到节点的设置
    pub fn node_settings(&self) -> NodeSettings {
        NodeSettings {
            adapters: self.adapters,
            adapter_start_index: self.adapter_start_index,
            adapter_type: self.adapter_type.clone(),
            headless: self.headless,
            enable_console: self.enable_console,
        }
    }
}
