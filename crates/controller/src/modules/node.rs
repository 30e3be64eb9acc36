/// 节点定义
///
/// 节点是虚拟机在拓扑中的一个实例，创建时绑定到一个服务器

use common::ws_rpc::{methods, NodeRequest};
use common::Server;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// 节点类型
///
/// 封闭枚举，取代按类名动态查找
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    VirtualBoxVm,
}

impl NodeType {
    pub const ALL: &'static [NodeType] = &[NodeType::VirtualBoxVm];

    /// 类型标签（与保存的拓扑文件一致）
    pub fn tag(self) -> &'static str {
        match self {
            Self::VirtualBoxVm => "VirtualBoxVM",
        }
    }

    /// 从标签解析
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.tag() == tag)
    }

    /// 展示用信息
    pub fn info(self) -> NodeTypeInfo {
        match self {
            Self::VirtualBoxVm => NodeTypeInfo {
                tag: self.tag(),
                name: "VirtualBox VM",
                categories: vec!["end_devices"],
                default_symbol: ":/symbols/vbox_guest.normal.svg",
                hover_symbol: ":/symbols/vbox_guest.selected.svg",
            },
        }
    }

    /// 构造节点实例
    pub fn construct(self, id: String, server: Arc<dyn Server>) -> Node {
        Node::new(id, self, server)
    }
}

/// 节点类型展示信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeTypeInfo {
    pub tag: &'static str,
    pub name: &'static str,
    pub categories: Vec<&'static str>,
    pub default_symbol: &'static str,
    pub hover_symbol: &'static str,
}

/// 节点状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Stopped,
    Started,
}

/// 从虚拟机定义复制到节点的设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSettings {
    pub adapters: u32,
    pub adapter_start_index: u32,
    pub adapter_type: String,
    pub headless: bool,
    pub enable_console: bool,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            adapters: 1,
            adapter_start_index: 0,
            adapter_type: "Automatic".to_string(),
            headless: false,
            enable_console: true,
        }
    }
}

/// 节点实例
pub struct Node {
    id: String,
    name: String,
    node_type: NodeType,
    server: Arc<dyn Server>,
    vmname: Option<String>,
    settings: NodeSettings,
    state: NodeState,
}

impl Node {
    pub fn new(id: String, node_type: NodeType, server: Arc<dyn Server>) -> Self {
        Self {
            id,
            name: String::new(),
            node_type,
            server,
            vmname: None,
            settings: NodeSettings::default(),
            state: NodeState::Stopped,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn server(&self) -> &Arc<dyn Server> {
        &self.server
    }

    /// 绑定的虚拟机名，未初始化时为 None
    pub fn vmname(&self) -> Option<&str> {
        self.vmname.as_deref()
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// 绑定虚拟机并应用初始设置
    pub fn setup(&mut self, name: impl Into<String>, vmname: impl Into<String>, settings: NodeSettings) {
        self.name = name.into();
        self.vmname = Some(vmname.into());
        self.settings = settings;
        info!("节点 {} 已绑定虚拟机 {:?}", self.id, self.vmname);
    }

    /// 启动节点
    pub async fn start(&mut self) -> common::Result<()> {
        let params = serde_json::to_value(NodeRequest { id: self.id.clone() })?;
        self.server
            .notify(methods::VIRTUALBOX_START, Some(params))
            .await?;
        self.state = NodeState::Started;
        Ok(())
    }

    /// 停止节点
    ///
    /// 服务器不可达时只记录警告，节点仍然标记为已停止
    pub async fn stop(&mut self) {
        let request = NodeRequest { id: self.id.clone() };
        let result = match serde_json::to_value(request) {
            Ok(params) => self.server.notify(methods::VIRTUALBOX_STOP, Some(params)).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!("停止节点 {} 失败: {}", self.id, e);
        }
        self.state = NodeState::Stopped;
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("node_type", &self.node_type)
            .field("server", &self.server.endpoint())
            .field("vmname", &self.vmname)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingServer;

    #[test]
    fn test_node_type_tags() {
        assert_eq!(NodeType::from_tag("VirtualBoxVM"), Some(NodeType::VirtualBoxVm));
        assert_eq!(NodeType::from_tag("IOURouter"), None);
        assert_eq!(NodeType::VirtualBoxVm.info().categories, vec!["end_devices"]);
    }

    #[test]
    fn test_default_node_settings() {
        let settings = NodeSettings::default();
        assert_eq!(settings.adapters, 1);
        assert_eq!(settings.adapter_type, "Automatic");
        assert!(settings.enable_console);
        assert!(!settings.headless);
    }

    #[tokio::test]
    async fn test_start_and_stop_notify_server() {
        let server = RecordingServer::local();
        let mut node = Node::new("n1".to_string(), NodeType::VirtualBoxVm, server.clone());

        node.start().await.unwrap();
        assert_eq!(node.state(), NodeState::Started);
        assert_eq!(server.sent_params(methods::VIRTUALBOX_START)[0]["id"], "n1");

        node.stop().await;
        assert_eq!(node.state(), NodeState::Stopped);
        assert_eq!(server.sent_params(methods::VIRTUALBOX_STOP)[0]["id"], "n1");
    }

    #[tokio::test]
    async fn test_stop_on_unreachable_server_still_stops() {
        let server = RecordingServer::unreachable("10.0.0.9");
        let mut node = Node::new("n2".to_string(), NodeType::VirtualBoxVm, server.clone());

        assert!(node.start().await.is_err());
        assert_eq!(node.state(), NodeState::Stopped);

        node.stop().await;
        assert_eq!(node.state(), NodeState::Stopped);
        assert!(server.sent().is_empty());
    }
}
