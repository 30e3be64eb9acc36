/// 工具函数集合

use crate::models::constants::PROJECT_FILES_SUFFIX;
use std::path::Path;
use uuid::Uuid;

/// 生成唯一 ID
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// 由本地工作目录推导项目名
///
/// 远程服务器只需要项目名，目录名末尾的 "-files" 会被去掉
pub fn project_name_from_dir(working_dir: &Path) -> String {
    let name = working_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    name.strip_suffix(PROJECT_FILES_SUFFIX)
        .unwrap_or(name)
        .to_string()
}

/// 解析 "host:port" 形式的地址
pub fn parse_endpoint(endpoint: &str) -> Option<(String, u16)> {
    let (host, port) = endpoint.trim().rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port = port.parse::<u16>().ok()?;
    Some((host.to_string(), port))
}
