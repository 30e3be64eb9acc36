/// 通知协议
///
/// 基于 WebSocket 的 JSON 通知/请求协议，用于与模拟服务器通信

pub mod connection;
pub mod error;
pub mod message;
pub mod types;

pub use connection::{Inbound, RpcConnection};
pub use error::RpcError;
pub use message::{MessageType, RemoteError, RpcMessage};
pub use types::*;
