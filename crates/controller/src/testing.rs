/// 测试用的服务器实现

use async_trait::async_trait;
use common::servers::{ServerFactory, ServerSpec};
use common::{Error, Result, Server};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 记录所有通知的服务器
pub struct RecordingServer {
    host: String,
    port: u16,
    local: bool,
    connected: AtomicBool,
    reconnect_ok: AtomicBool,
    sent: Mutex<Vec<(String, Option<Value>)>>,
    vms: Vec<String>,
}

impl RecordingServer {
    fn build(host: &str, port: u16, local: bool) -> Self {
        Self {
            host: host.to_string(),
            port,
            local,
            connected: AtomicBool::new(true),
            reconnect_ok: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            vms: vec!["win7".to_string(), "ubuntu".to_string()],
        }
    }

    pub fn local() -> Arc<Self> {
        Arc::new(Self::build("127.0.0.1", 8000, true))
    }

    pub fn remote(host: &str) -> Arc<Self> {
        Arc::new(Self::build(host, 8000, false))
    }

    /// 断开且无法重连的服务器
    pub fn unreachable(host: &str) -> Arc<Self> {
        let server = Self::build(host, 8000, false);
        server.connected.store(false, Ordering::SeqCst);
        server.reconnect_ok.store(false, Ordering::SeqCst);
        Arc::new(server)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// 已发送的通知
    pub fn sent(&self) -> Vec<(String, Option<Value>)> {
        self.sent.lock().unwrap().clone()
    }

    /// 指定方法的通知负载
    pub fn sent_params(&self, method: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.unwrap_or(Value::Null))
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl Server for RecordingServer {
    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn is_local(&self) -> bool {
        self.local
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<()> {
        if self.reconnect_ok.load(Ordering::SeqCst) {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(Error::Connection("connection refused".to_string()))
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::Connection(format!("{} 未连接", self.host)));
        }
        self.sent.lock().unwrap().push((method.to_string(), params));
        Ok(())
    }

    async fn call(&self, method: &str, _params: Value, _timeout: Duration) -> Result<Value> {
        self.sent.lock().unwrap().push((method.to_string(), None));
        Ok(json!({"vms": self.vms}))
    }
}

/// 创建 RecordingServer 的工厂
pub fn recording_factory() -> ServerFactory {
    Arc::new(|spec: ServerSpec| {
        Arc::new(RecordingServer::build(&spec.host, spec.port, spec.local)) as Arc<dyn Server>
    })
}
