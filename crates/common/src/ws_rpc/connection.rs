/// 请求/响应配对
///
/// 实际的 WebSocket 读写由持有发送接收端的任务完成，这里只负责：
/// - 发出的请求登记等待器，收到同 id 的响应时唤醒
/// - 把服务器主动发来的通知交还给调用方

use super::{MessageType, RpcError, RpcMessage};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

type Waiter = oneshot::Sender<Result<Value, RpcError>>;

/// 服务器主动发来的通知
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub method: String,
    pub params: Value,
}

#[derive(Clone)]
pub struct RpcConnection {
    waiters: Arc<Mutex<HashMap<String, Waiter>>>,
    outbound: mpsc::UnboundedSender<RpcMessage>,
}

impl RpcConnection {
    /// 返回连接和待写出消息的接收端
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RpcMessage>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let connection = Self {
            waiters: Arc::new(Mutex::new(HashMap::new())),
            outbound,
        };
        (connection, rx)
    }

    /// 发送请求，返回响应负载
    pub async fn call(&self, method: &str, payload: Value, timeout: Duration) -> Result<Value, RpcError> {
        let request = RpcMessage::request(method, payload);
        let id = request.id.clone();
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(id.clone(), tx);

        if self.outbound.send(request).is_err() {
            self.waiters.lock().await.remove(&id);
            return Err(RpcError::ConnectionClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // 等待器被丢弃说明连接已经清理
            Ok(Err(_)) => Err(RpcError::ConnectionClosed),
            Err(_) => {
                self.waiters.lock().await.remove(&id);
                Err(RpcError::Timeout(format!("{} ({})", method, id)))
            }
        }
    }

    pub fn notify(&self, method: &str, payload: Option<Value>) -> Result<(), RpcError> {
        self.outbound
            .send(RpcMessage::notification(method, payload))
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// 处理一条收到的消息，通知原样交还
    pub async fn route(&self, msg: RpcMessage) -> Option<Inbound> {
        match msg.message_type {
            MessageType::Response => {
                let waiter = self.waiters.lock().await.remove(&msg.id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(msg.into_result());
                    }
                    None => warn!("收到未预期的响应: {}", msg.id),
                }
                None
            }
            MessageType::Notification => match msg.method {
                Some(method) => Some(Inbound {
                    method,
                    params: msg.payload.unwrap_or(Value::Null),
                }),
                None => {
                    warn!("通知缺少方法名: {}", msg.id);
                    None
                }
            },
            MessageType::Request => {
                debug!("忽略服务器发来的请求: {:?}", msg.method);
                None
            }
        }
    }

    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    pub async fn waiting(&self) -> usize {
        self.waiters.lock().await.len()
    }

    /// 连接断开时让所有等待中的请求失败
    pub async fn fail_all(&self) {
        for (id, waiter) in self.waiters.lock().await.drain() {
            debug!("取消等待中的请求: {}", id);
            let _ = waiter.send(Err(RpcError::ConnectionClosed));
        }
    }
}

/// WebSocket 帧与消息的转换
pub mod frame {
    use super::{RpcError, RpcMessage};
    use tokio_tungstenite::tungstenite::Message;

    pub fn encode(msg: &RpcMessage) -> Result<Message, RpcError> {
        Ok(Message::Text(serde_json::to_string(msg)?))
    }

    /// 控制帧返回 None，关闭帧返回 ConnectionClosed
    pub fn decode(frame: Message) -> Result<Option<RpcMessage>, RpcError> {
        match frame {
            Message::Text(text) => Ok(Some(serde_json::from_str(&text)?)),
            Message::Binary(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Message::Ping(_) | Message::Pong(_) => Ok(None),
            Message::Close(_) => Err(RpcError::ConnectionClosed),
            other => Err(RpcError::UnsupportedFrame(format!("{:?}", other))),
        }
    }
}
