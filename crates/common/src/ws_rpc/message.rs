/// 消息信封
///
/// 与模拟服务器之间的所有消息都使用同一个 JSON 信封：
/// `{"id": ..., "type": ..., "method": ..., "payload": ..., "error": ...}`

use super::RpcError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    /// 单向消息，双方都可以发送
    Notification,
}

/// 服务器在响应里报告的失败
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage {
    pub id: String,

    #[serde(rename = "type")]
    pub message_type: MessageType,

    /// 方法名，形如 "virtualbox.settings"；响应不带方法名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl RpcMessage {
    fn build(id: String, message_type: MessageType, method: Option<String>, payload: Option<Value>) -> Self {
        Self {
            id,
            message_type,
            method,
            payload,
            error: None,
        }
    }

    pub fn request(method: impl Into<String>, payload: Value) -> Self {
        Self::build(
            format!("req-{}", Uuid::new_v4()),
            MessageType::Request,
            Some(method.into()),
            Some(payload),
        )
    }

    /// 针对请求 id 的成功响应
    pub fn response(id: impl Into<String>, payload: Value) -> Self {
        Self::build(id.into(), MessageType::Response, None, Some(payload))
    }

    /// 针对请求 id 的失败响应
    pub fn failure(id: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut msg = Self::build(id.into(), MessageType::Response, None, None);
        msg.error = Some(RemoteError {
            code: code.into(),
            message: message.into(),
        });
        msg
    }

    /// 通知，payload 为空时不携带负载
    pub fn notification(method: impl Into<String>, payload: Option<Value>) -> Self {
        Self::build(
            format!("notif-{}", Uuid::new_v4()),
            MessageType::Notification,
            Some(method.into()),
            payload,
        )
    }

    /// 把响应拆成负载或服务器报告的错误，缺少负载时为 Null
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(RemoteError { code, message }) => Err(RpcError::Remote { code, message }),
            None => Ok(self.payload.unwrap_or(Value::Null)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notification_without_payload() {
        let msg = RpcMessage::notification("virtualbox.reset", None);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("payload"));
        assert!(json.contains("\"type\":\"notification\""));
        assert!(msg.id.starts_with("notif-"));
    }

    #[test]
    fn test_failure_into_result() {
        let msg = RpcMessage::failure("req-1", "VM_NOT_FOUND", "no such vm");
        match msg.into_result() {
            Err(RpcError::Remote { code, message }) => {
                assert_eq!(code, "VM_NOT_FOUND");
                assert_eq!(message, "no such vm");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_empty_response_is_null() {
        let raw = r#"{"id":"req-1","type":"response"}"#;
        let msg: RpcMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn test_parse_inbound_notification() {
        let raw = r#"{"id":"n-1","type":"notification","method":"virtualbox.vm_error","payload":{"id":"node-1","message":"crashed"}}"#;
        let msg: RpcMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.message_type, MessageType::Notification);
        assert_eq!(msg.method.as_deref(), Some("virtualbox.vm_error"));
        assert_eq!(msg.payload.unwrap()["message"], json!("crashed"));
    }
}
