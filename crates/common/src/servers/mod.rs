/// 模拟服务器抽象
///
/// 模块通过 `Server` trait 与模拟服务器通信；连接本身由 `ServerRegistry` 持有，
/// 模块只保存引用

pub mod ws;

use crate::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

pub use ws::{InboundNotification, WsServer};

/// 模拟服务器 Trait
#[async_trait]
pub trait Server: Send + Sync + 'static {
    /// 主机地址
    fn host(&self) -> &str;

    /// 端口
    fn port(&self) -> u16;

    /// 是否是本地服务器
    fn is_local(&self) -> bool;

    /// "host:port"，用作服务器身份
    fn endpoint(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }

    /// 当前是否已连接
    async fn is_connected(&self) -> bool;

    /// 重新建立连接
    async fn reconnect(&self) -> Result<()>;

    /// 发送单向通知
    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()>;

    /// 发送请求，返回响应负载
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value>;
}

/// 判断两个服务器引用是否指向同一个端点
pub fn same_server(a: &dyn Server, b: &dyn Server) -> bool {
    a.host() == b.host() && a.port() == b.port()
}

/// 创建服务器时的参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub host: String,
    pub port: u16,
    pub local: bool,
    pub ca_file: Option<PathBuf>,
}

/// 服务器构造函数
pub type ServerFactory = Arc<dyn Fn(ServerSpec) -> Arc<dyn Server> + Send + Sync>;

/// 服务器注册表
///
/// 启动时创建一次，通过 `Arc` 注入到模块和 provisioner 中
pub struct ServerRegistry {
    /// 本地服务器
    local: RwLock<Option<Arc<dyn Server>>>,

    /// 远程服务器列表
    remotes: RwLock<Vec<Arc<dyn Server>>>,

    /// 轮询游标
    next: AtomicUsize,

    factory: ServerFactory,
}

impl ServerRegistry {
    pub fn new(factory: ServerFactory) -> Self {
        Self {
            local: RwLock::new(None),
            remotes: RwLock::new(Vec::new()),
            next: AtomicUsize::new(0),
            factory,
        }
    }

    /// 设置本地服务器
    pub async fn set_local_server(&self, host: impl Into<String>, port: u16) -> Arc<dyn Server> {
        let server = (self.factory)(ServerSpec {
            host: host.into(),
            port,
            local: true,
            ca_file: None,
        });
        info!("本地服务器: {}", server.endpoint());
        *self.local.write().await = Some(server.clone());
        server
    }

    /// 获取本地服务器
    pub async fn local_server(&self) -> Option<Arc<dyn Server>> {
        self.local.read().await.clone()
    }

    /// 获取或创建远程服务器
    ///
    /// 只创建端点对象，不保证远端进程已经可以接收流量
    pub async fn get_remote_server(
        &self,
        host: &str,
        port: u16,
        ca_file: Option<PathBuf>,
    ) -> Arc<dyn Server> {
        let mut remotes = self.remotes.write().await;
        if let Some(existing) = remotes
            .iter()
            .find(|s| s.host() == host && s.port() == port)
        {
            return existing.clone();
        }

        let server = (self.factory)(ServerSpec {
            host: host.to_string(),
            port,
            local: false,
            ca_file,
        });
        info!("新增远程服务器: {}", server.endpoint());
        remotes.push(server.clone());
        server
    }

    /// 移除远程服务器
    pub async fn remove_remote_server(&self, host: &str, port: u16) -> bool {
        let mut remotes = self.remotes.write().await;
        let before = remotes.len();
        remotes.retain(|s| !(s.host() == host && s.port() == port));
        before != remotes.len()
    }

    /// 所有远程服务器
    pub async fn remote_servers(&self) -> Vec<Arc<dyn Server>> {
        self.remotes.read().await.clone()
    }

    /// 按轮询方式选出下一个远程服务器
    pub async fn next_remote_server(&self) -> Option<Arc<dyn Server>> {
        let remotes = self.remotes.read().await;
        if remotes.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % remotes.len();
        Some(remotes[index].clone())
    }
}
