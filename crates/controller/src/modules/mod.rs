/// 模块管理
///
/// 每种虚拟机类型对应一个模块，模块负责：
/// - 自身设置和虚拟机定义的持久化
/// - 把设置变化同步给已连接的模拟服务器
/// - 管理已创建的节点

pub mod node;
pub mod virtualbox;

use async_trait::async_trait;
use common::servers::InboundNotification;
use common::Server;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub use node::{Node, NodeSettings, NodeState, NodeType, NodeTypeInfo};
pub use virtualbox::VirtualBoxModule;

/// 模块向界面层发出的事件
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleEvent {
    /// 服务器报告某个节点出错，节点已被停止
    NodeFailure {
        node_id: String,
        message: String,
        details: String,
    },
}

/// 多个虚拟机定义匹配时，由界面让用户选择
pub trait VmSelector: Send + Sync {
    /// 返回选中的定义键；取消时返回 None
    fn select(&self, candidates: &[String]) -> Option<String>;
}

/// 模块 Trait
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// 模块名，同时是通知方法名的前缀
    fn name(&self) -> &'static str;

    /// 设置项目文件目录
    async fn set_project_directory(&mut self, path: &Path);

    /// 设置镜像文件目录
    async fn set_image_directory(&mut self, path: &Path);

    /// 添加服务器
    async fn add_server(&mut self, server: Arc<dyn Server>);

    /// 移除服务器
    fn remove_server(&mut self, server: &dyn Server);

    /// 重置所有服务器并清空节点
    async fn reset(&mut self);

    /// 处理服务器发来的通知
    async fn notification(&mut self, destination: &str, params: &serde_json::Value);

    /// 模块支持的节点类型
    fn node_types(&self) -> Vec<NodeTypeInfo>;
}

/// 模块注册表
///
/// 启动时创建，关闭时调用 `shutdown` 显式重置所有模块
#[derive(Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<&'static str, Arc<Mutex<dyn Module>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册模块
    pub async fn register(&mut self, module: Arc<Mutex<dyn Module>>) {
        let name = module.lock().await.name();
        info!("注册模块: {}", name);
        self.modules.insert(name, module);
    }

    /// 按名称获取模块
    pub fn get(&self, name: &str) -> Option<Arc<Mutex<dyn Module>>> {
        self.modules.get(name).cloned()
    }

    /// 已注册的模块名
    pub fn names(&self) -> Vec<&'static str> {
        self.modules.keys().copied().collect()
    }

    /// 所有模块支持的节点类型
    pub async fn node_types(&self) -> Vec<NodeTypeInfo> {
        let mut types = Vec::new();
        for module in self.modules.values() {
            types.extend(module.lock().await.node_types());
        }
        types
    }

    /// 把服务器加入所有模块
    pub async fn add_server(&self, server: Arc<dyn Server>) {
        for module in self.modules.values() {
            module.lock().await.add_server(server.clone()).await;
        }
    }

    /// 从所有模块移除服务器
    pub async fn remove_server(&self, server: &dyn Server) {
        for module in self.modules.values() {
            module.lock().await.remove_server(server);
        }
    }

    /// 通知所有模块新的项目目录
    pub async fn set_project_directory(&self, path: &Path) {
        for module in self.modules.values() {
            module.lock().await.set_project_directory(path).await;
        }
    }

    /// 通知所有模块新的镜像目录
    pub async fn set_image_directory(&self, path: &Path) {
        for module in self.modules.values() {
            module.lock().await.set_image_directory(path).await;
        }
    }

    /// 按方法名前缀把服务器通知分发给对应模块
    pub async fn dispatch(&self, notification: InboundNotification) -> bool {
        let Some((namespace, _)) = notification.method.split_once('.') else {
            warn!("通知方法名缺少模块前缀: {}", notification.method);
            return false;
        };
        match self.modules.get(namespace) {
            Some(module) => {
                debug!(
                    "分发通知 {} (来自 {}) 到模块 {}",
                    notification.method, notification.server, namespace
                );
                module
                    .lock()
                    .await
                    .notification(&notification.method, &notification.params)
                    .await;
                true
            }
            None => {
                warn!("没有模块处理通知: {}", notification.method);
                false
            }
        }
    }

    /// 重置所有模块
    pub async fn shutdown(&self) {
        for (name, module) in &self.modules {
            info!("关闭模块: {}", name);
            module.lock().await.reset().await;
        }
    }
}
