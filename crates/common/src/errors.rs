use thiserror::Error;

/// 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 云凭据缺失、认证失败或区域设置失败
    #[error("配置错误: {0}")]
    Configuration(String),

    /// 服务器不可达或重连失败
    #[error("连接错误: {0}")]
    Connection(String),

    #[error("没有可用的服务器: {0}")]
    NoServerAvailable(String),

    #[error("没有可用的虚拟机定义: {0}")]
    NoDefinitionAvailable(String),

    #[error("虚拟机选择不明确: {0}")]
    AmbiguousSelection(String),

    #[error("虚拟机已被使用: {0}")]
    DuplicateBinding(String),

    /// SSH / socket 层面的暂时性失败，不会跨越 worker 边界抛出
    #[error("暂时性网络错误: {0}")]
    TransientNetwork(String),

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("无效参数: {0}")]
    InvalidArgument(String),

    #[error("内部错误: {0}")]
    Internal(String),

    #[error("其他错误: {0}")]
    Other(#[from] anyhow::Error),
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, Error>;
