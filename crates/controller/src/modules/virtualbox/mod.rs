/// VirtualBox 模块
///
/// 管理 VirtualBox 设置、虚拟机定义、服务器和节点，并把设置同步给服务器

pub mod settings;

use async_trait::async_trait;
use common::ws_rpc::{methods, NodeFailureNotification, VmListResponse};
use common::{utils, Error, Result, Server, ServerRegistry};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Module, ModuleEvent, Node, NodeType, NodeTypeInfo, VmSelector};
use crate::settings::{Settings, SettingsStore};
pub use settings::VmDefinition;
use settings::{
    settings_schema, vm_schema, LOCAL_ONLY_SETTINGS, SETTINGS_GROUP, VMS_ARRAY, VMS_GROUP,
};

/// VirtualBox 模块
pub struct VirtualBoxModule {
    /// 设置存储
    store: Arc<SettingsStore>,

    /// 服务器注册表（用于分配服务器）
    registry: Arc<ServerRegistry>,

    /// 模块设置
    settings: Settings,

    /// 虚拟机定义: "server:vmname" -> 定义
    vms: BTreeMap<String, VmDefinition>,

    /// 已创建的节点
    nodes: Vec<Node>,

    /// 模块使用的服务器
    servers: Vec<Arc<dyn Server>>,

    /// 本地项目文件目录
    working_dir: PathBuf,

    /// 事件通道
    events: mpsc::UnboundedSender<ModuleEvent>,

    /// 请求超时
    rpc_timeout: Duration,
}

impl VirtualBoxModule {
    /// 创建模块并从存储中加载设置和虚拟机定义
    pub async fn new(
        store: Arc<SettingsStore>,
        registry: Arc<ServerRegistry>,
        events: mpsc::UnboundedSender<ModuleEvent>,
        rpc_timeout: Duration,
    ) -> Self {
        let settings = store.load(SETTINGS_GROUP, &settings_schema()).await;
        let vms = store
            .load_keyed_collection(VMS_GROUP, VMS_ARRAY, &vm_schema(), VmDefinition::key)
            .await;
        info!("VirtualBox 模块已加载 {} 个虚拟机定义", vms.len());

        Self {
            store,
            registry,
            settings,
            vms,
            nodes: Vec::new(),
            servers: Vec::new(),
            working_dir: PathBuf::new(),
            events,
            rpc_timeout,
        }
    }

    /// 模块设置
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// 本地项目目录
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    fn use_local_server(&self) -> bool {
        self.settings
            .get("use_local_server")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    /// 更新设置
    ///
    /// 只把值真正变化的键发送给已连接的服务器；无论是否变化都会持久化合并后的设置
    pub async fn set_settings(&mut self, new_settings: Settings) -> Result<()> {
        let new_settings = settings_schema().coerce_known(new_settings);
        let changed: Settings = new_settings
            .iter()
            .filter(|(name, value)| {
                self.settings
                    .get(name.as_str())
                    .is_some_and(|current| current != *value)
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        if !changed.is_empty() {
            debug!("VirtualBox 设置变化: {:?}", changed.keys().collect::<Vec<_>>());
            for server in &self.servers {
                if !server.is_connected().await {
                    continue;
                }
                let params = self.server_params(server.as_ref(), changed.clone());
                if let Err(e) = server
                    .notify(methods::VIRTUALBOX_SETTINGS, Some(params))
                    .await
                {
                    warn!("发送设置到服务器 {} 失败: {}", server.endpoint(), e);
                }
            }
        }

        self.settings.extend(new_settings);
        self.store.save(SETTINGS_GROUP, &self.settings).await
    }

    /// 虚拟机定义
    pub fn vm_definitions(&self) -> &BTreeMap<String, VmDefinition> {
        &self.vms
    }

    /// 替换并保存虚拟机定义
    pub async fn set_vm_definitions(&mut self, vms: BTreeMap<String, VmDefinition>) -> Result<()> {
        self.vms = vms;
        self.store
            .save_keyed_collection(VMS_GROUP, VMS_ARRAY, self.vms.values())
            .await
    }

    /// 模块使用的服务器
    pub fn servers(&self) -> &[Arc<dyn Server>] {
        &self.servers
    }

    /// 已创建的节点
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// 按 ID 查找节点
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id() == node_id)
    }

    /// 添加节点
    pub fn add_node(&mut self, node: Node) {
        self.nodes.push(node);
    }

    /// 移除节点，节点绑定的服务器和虚拟机定义不受影响
    pub fn remove_node(&mut self, node_id: &str) -> Option<Node> {
        let index = self.nodes.iter().position(|n| n.id() == node_id)?;
        Some(self.nodes.remove(index))
    }

    /// 为节点分配服务器
    ///
    /// 启用本地服务器时总是返回本地服务器，否则轮询远程服务器
    pub async fn allocate_server(&self, node_type: NodeType) -> Result<Arc<dyn Server>> {
        debug!("为 {} 分配服务器", node_type.tag());
        if self.use_local_server() {
            self.registry
                .local_server()
                .await
                .ok_or_else(|| Error::NoServerAvailable("本地服务器未配置".to_string()))
        } else {
            self.registry
                .next_remote_server()
                .await
                .ok_or_else(|| Error::NoServerAvailable("没有配置远程服务器".to_string()))
        }
    }

    /// 创建节点
    ///
    /// 服务器未连接时先尝试重连，失败返回连接错误
    pub async fn create_node(&mut self, node_type: NodeType, server: Arc<dyn Server>) -> Result<String> {
        info!("创建节点 {} (服务器 {})", node_type.tag(), server.endpoint());

        ensure_connected(server.as_ref()).await?;

        if !self.has_server(server.as_ref()) {
            self.add_server(server.clone()).await;
        }

        let node = node_type.construct(utils::generate_id(), server);
        let node_id = node.id().to_string();
        self.nodes.push(node);
        Ok(node_id)
    }

    /// 初始化节点：选择虚拟机定义并应用设置
    pub fn setup_node(
        &mut self,
        node_id: &str,
        name: &str,
        selector: Option<&dyn VmSelector>,
    ) -> Result<()> {
        let index = self
            .nodes
            .iter()
            .position(|n| n.id() == node_id)
            .ok_or_else(|| Error::NotFound(format!("节点 {}", node_id)))?;
        let server = self.nodes[index].server().clone();
        info!("配置节点 {} ({})", name, node_id);

        let candidates: Vec<String> = self
            .vms
            .iter()
            .filter(|(_, vm)| vm.belongs_to(server.as_ref()))
            .map(|(key, _)| key.clone())
            .collect();

        let key = match candidates.len() {
            0 => {
                return Err(Error::NoDefinitionAvailable(format!(
                    "服务器 {} 上没有 VirtualBox 虚拟机",
                    server.host()
                )));
            }
            1 => candidates[0].clone(),
            _ => {
                let selected = selector
                    .and_then(|s| s.select(&candidates))
                    .filter(|key| candidates.contains(key));
                selected.ok_or_else(|| {
                    Error::AmbiguousSelection(format!(
                        "服务器 {} 上有多个 VirtualBox 虚拟机，请选择一个",
                        server.host()
                    ))
                })?
            }
        };
        let vm = self.vms[&key].clone();

        // 同一服务器上的同一虚拟机只能被一个节点使用
        let duplicate = self.nodes.iter().enumerate().any(|(i, other)| {
            i != index
                && other.vmname() == Some(vm.vmname.as_str())
                && vm.belongs_to(other.server().as_ref())
        });
        if duplicate {
            return Err(Error::DuplicateBinding(format!(
                "虚拟机 {} 在拓扑中只能使用一次",
                vm.vmname
            )));
        }

        self.nodes[index].setup(name, vm.vmname.clone(), vm.node_settings());
        Ok(())
    }

    /// 获取服务器上的虚拟机列表
    pub async fn vm_list(&self, server: &dyn Server) -> Result<Vec<String>> {
        ensure_connected(server).await?;
        let response = server
            .call(methods::VIRTUALBOX_VM_LIST, Value::Null, self.rpc_timeout)
            .await?;
        let list: VmListResponse = serde_json::from_value(response)?;
        Ok(list.vms)
    }

    fn has_server(&self, server: &dyn Server) -> bool {
        self.servers
            .iter()
            .any(|s| common::servers::same_server(s.as_ref(), server))
    }

    /// 为指定服务器补充工作目录信息
    ///
    /// 本地服务器收到完整路径，远程服务器只收到项目名
    fn server_params(&self, server: &dyn Server, mut params: Settings) -> Value {
        if server.is_local() {
            params.insert(
                "working_dir".to_string(),
                Value::String(self.working_dir.to_string_lossy().into_owned()),
            );
        } else {
            params.insert(
                "project_name".to_string(),
                Value::String(utils::project_name_from_dir(&self.working_dir)),
            );
        }
        Value::Object(params)
    }

    /// 发送完整设置
    async fn send_settings(&self, server: &dyn Server) {
        info!("发送 VirtualBox 设置到服务器 {}", server.endpoint());
        let mut params = self.settings.clone();
        if !server.is_local() {
            for name in LOCAL_ONLY_SETTINGS {
                params.remove(*name);
            }
        }
        let params = self.server_params(server, params);
        if let Err(e) = server
            .notify(methods::VIRTUALBOX_SETTINGS, Some(params))
            .await
        {
            warn!("发送设置到服务器 {} 失败: {}", server.endpoint(), e);
        }
    }
}

/// 服务器未连接时尝试重连
async fn ensure_connected(server: &dyn Server) -> Result<()> {
    if server.is_connected().await {
        return Ok(());
    }
    info!("重新连接服务器 {}", server.endpoint());
    server.reconnect().await.map_err(|e| {
        Error::Connection(format!("无法连接到服务器 {}: {}", server.endpoint(), e))
    })
}

#[async_trait]
impl Module for VirtualBoxModule {
    fn name(&self) -> &'static str {
        "virtualbox"
    }

    async fn set_project_directory(&mut self, path: &Path) {
        self.working_dir = path.to_path_buf();
        info!("VirtualBox 模块本地工作目录: {:?}", self.working_dir);

        for server in &self.servers {
            if server.is_connected().await {
                self.send_settings(server.as_ref()).await;
            }
        }
    }

    async fn set_image_directory(&mut self, _path: &Path) {
        // 本模块不使用镜像目录
    }

    async fn add_server(&mut self, server: Arc<dyn Server>) {
        info!("VirtualBox 模块添加服务器 {}", server.endpoint());
        self.send_settings(server.as_ref()).await;
        self.servers.push(server);
    }

    fn remove_server(&mut self, server: &dyn Server) {
        info!("VirtualBox 模块移除服务器 {}", server.endpoint());
        self.servers
            .retain(|s| !common::servers::same_server(s.as_ref(), server));
    }

    async fn reset(&mut self) {
        info!("VirtualBox 模块重置");
        for server in &self.servers {
            if !server.is_connected().await {
                continue;
            }
            if let Err(e) = server.notify(methods::VIRTUALBOX_RESET, None).await {
                warn!("重置服务器 {} 失败: {}", server.endpoint(), e);
            }
        }
        self.servers.clear();
        self.nodes.clear();
    }

    async fn notification(&mut self, destination: &str, params: &Value) {
        let failure: NodeFailureNotification = match serde_json::from_value(params.clone()) {
            Ok(failure) => failure,
            Err(e) => {
                debug!("忽略无法解析的通知 {}: {}", destination, e);
                return;
            }
        };
        let Some(node) = self.nodes.iter_mut().find(|n| n.id() == failure.id) else {
            debug!("通知 {} 对应的节点 {} 不存在", destination, failure.id);
            return;
        };

        let event = ModuleEvent::NodeFailure {
            node_id: failure.id,
            message: format!("node {}: {}", node.name(), failure.message),
            details: failure.details,
        };
        warn!("服务器通知 {}: {:?}", destination, event);
        if self.events.send(event).is_err() {
            debug!("模块事件接收端已关闭");
        }
        node.stop().await;
    }

    fn node_types(&self) -> Vec<NodeTypeInfo> {
        vec![NodeType::VirtualBoxVm.info()]
    }
}
