/// 模拟器前端核心 - 公共库
/// 
/// 提供 controller 和 provisioner 共享的类型、错误处理、通知协议与服务器抽象

pub mod errors;
pub mod models;
pub mod servers;
pub mod utils;
pub mod ws_rpc;

// 重新导出常用类型
pub use errors::{Error, Result};
pub use servers::{Server, ServerRegistry};
pub use ws_rpc::{MessageType, RpcError, RpcMessage};
