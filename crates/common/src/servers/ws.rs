/// WebSocket 模拟服务器连接

use super::{Server, ServerSpec};
use crate::models::ServerState;
use crate::ws_rpc::connection::{frame, Inbound, RpcConnection};
use crate::ws_rpc::RpcError;
use crate::{Error, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::Connector;
use tracing::{debug, error, info, warn};

/// 服务器主动发来的通知
#[derive(Debug, Clone)]
pub struct InboundNotification {
    /// 来源服务器 "host:port"
    pub server: String,
    pub method: String,
    pub params: serde_json::Value,
}

/// 基于 WebSocket 的模拟服务器连接
pub struct WsServer {
    host: String,
    port: u16,
    local: bool,
    ca_file: Option<PathBuf>,

    /// 连接状态
    state: Arc<RwLock<ServerState>>,

    /// 当前连接（断开后为 None）
    connection: RwLock<Option<RpcConnection>>,

    /// 服务器通知转发通道
    inbound: mpsc::UnboundedSender<InboundNotification>,

    /// 建立连接的超时
    connect_timeout: Duration,
}

impl WsServer {
    pub fn new(
        spec: ServerSpec,
        inbound: mpsc::UnboundedSender<InboundNotification>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            host: spec.host,
            port: spec.port,
            local: spec.local,
            ca_file: spec.ca_file,
            state: Arc::new(RwLock::new(ServerState::Disconnected)),
            connection: RwLock::new(None),
            inbound,
            connect_timeout,
        }
    }

    /// 连接地址，配置了 CA 文件时使用 wss
    pub fn url(&self) -> String {
        let scheme = if self.ca_file.is_some() { "wss" } else { "ws" };
        format!("{}://{}:{}/", scheme, self.host, self.port)
    }

    /// 当前状态
    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    /// 建立 WebSocket 连接并启动收发任务
    async fn connect(&self) -> Result<()> {
        *self.state.write().await = ServerState::Connecting;
        let url = self.url();
        info!("连接模拟服务器: {}", url);

        let connector = match &self.ca_file {
            Some(path) => Some(tls_connector(path)?),
            None => None,
        };

        let connecting =
            tokio_tungstenite::connect_async_tls_with_config(url.as_str(), None, false, connector);
        let ws_stream = match tokio::time::timeout(self.connect_timeout, connecting).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                *self.state.write().await = ServerState::Disconnected;
                return Err(Error::Connection(format!(
                    "无法连接到服务器 {}: {}",
                    self.endpoint(),
                    e
                )));
            }
            Err(_) => {
                *self.state.write().await = ServerState::Disconnected;
                return Err(Error::Connection(format!(
                    "连接服务器 {} 超时",
                    self.endpoint()
                )));
            }
        };
        info!("✅ 已连接到服务器 {}", self.endpoint());

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (connection, mut rx) = RpcConnection::new();

        // 先标记已连接，接收任务结束时才能覆盖为断开
        *self.connection.write().await = Some(connection.clone());
        *self.state.write().await = ServerState::Connected;

        // 发送任务
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let ws_msg = match frame::encode(&msg) {
                    Ok(ws_msg) => ws_msg,
                    Err(e) => {
                        error!("序列化消息失败: {}", e);
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(ws_msg).await {
                    error!("发送消息失败: {}", e);
                    break;
                }
            }
            debug!("发送任务结束");
        });

        // 接收任务
        let receiver_conn = connection.clone();
        let state = self.state.clone();
        let inbound = self.inbound.clone();
        let endpoint = self.endpoint();
        tokio::spawn(async move {
            while let Some(received) = ws_receiver.next().await {
                let msg = match received.map(frame::decode) {
                    Ok(Ok(Some(msg))) => msg,
                    Ok(Ok(None)) => continue,
                    Ok(Err(RpcError::ConnectionClosed)) => break,
                    Ok(Err(e)) => {
                        warn!("无法解析服务器 {} 的消息: {}", endpoint, e);
                        continue;
                    }
                    Err(e) => {
                        error!("接收消息错误: {}", e);
                        break;
                    }
                };
                if let Some(notification) = receiver_conn.route(msg).await {
                    forward_notification(&endpoint, notification, &inbound);
                }
            }
            *state.write().await = ServerState::Disconnected;
            receiver_conn.fail_all().await;
            warn!("与服务器 {} 的连接已断开", endpoint);
        });

        Ok(())
    }

    async fn live_connection(&self) -> Result<RpcConnection> {
        let connection = self.connection.read().await;
        match connection.as_ref() {
            Some(conn) if conn.is_open() => Ok(conn.clone()),
            _ => Err(Error::Connection(format!(
                "服务器 {} 未连接",
                self.endpoint()
            ))),
        }
    }
}

/// 附上来源服务器后转发
fn forward_notification(
    endpoint: &str,
    notification: Inbound,
    inbound: &mpsc::UnboundedSender<InboundNotification>,
) {
    debug!("📥 收到通知: server={}, method={}", endpoint, notification.method);
    let notification = InboundNotification {
        server: endpoint.to_string(),
        method: notification.method,
        params: notification.params,
    };
    if inbound.send(notification).is_err() {
        debug!("通知接收端已关闭");
    }
}

/// 用指定 CA 文件构造 TLS 连接器
fn tls_connector(ca_file: &Path) -> Result<Connector> {
    use rustls::pki_types::pem::PemObject;
    use rustls::pki_types::CertificateDer;

    let mut roots = rustls::RootCertStore::empty();
    let certs = CertificateDer::pem_file_iter(ca_file)
        .map_err(|e| Error::Configuration(format!("无法读取 CA 文件 {:?}: {}", ca_file, e)))?;
    for cert in certs {
        let cert = cert
            .map_err(|e| Error::Configuration(format!("CA 文件 {:?} 格式错误: {}", ca_file, e)))?;
        roots
            .add(cert)
            .map_err(|e| Error::Configuration(format!("无效的 CA 证书: {}", e)))?;
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Connector::Rustls(Arc::new(config)))
}

#[async_trait]
impl Server for WsServer {
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
        self.state().await == ServerState::Connected
    }

    async fn reconnect(&self) -> Result<()> {
        if let Some(old) = self.connection.write().await.take() {
            old.fail_all().await;
        }
        self.connect().await
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        let connection = self.live_connection().await?;
        debug!("📤 发送通知: server={}, method={}", self.endpoint(), method);
        connection.notify(method, params)?;
        Ok(())
    }

    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let connection = self.live_connection().await?;
        info!("📤 发送请求: server={}, method={}", self.endpoint(), method);
        Ok(connection.call(method, params, timeout).await?)
    }
}
