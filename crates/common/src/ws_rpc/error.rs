/// 通知协议错误

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("连接已关闭")]
    ConnectionClosed,

    #[error("请求 {0} 超时")]
    Timeout(String),

    #[error("消息格式错误: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("不支持的 WebSocket 帧: {0}")]
    UnsupportedFrame(String),

    /// 服务器处理请求失败
    #[error("服务器返回错误 [{code}]: {message}")]
    Remote { code: String, message: String },
}

impl From<RpcError> for crate::Error {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Malformed(e) => crate::Error::Serialization(e),
            RpcError::ConnectionClosed => crate::Error::Connection("连接已关闭".to_string()),
            RpcError::Timeout(id) => crate::Error::Timeout(format!("请求 {}", id)),
            other => crate::Error::Internal(other.to_string()),
        }
    }
}
