/// 模拟器前端核心 - 模块控制器
/// 
/// 管理各虚拟机类型模块的设置持久化，并把设置和生命周期事件同步给模拟服务器

pub mod config;
pub mod modules;
pub mod settings;

#[cfg(test)]
pub(crate) mod testing;
