/// 云主机开通
///
/// 通过云厂商创建云主机，SSH 启动远程模拟服务器，再交给连接层

pub mod cloud;
pub mod config;
pub mod lifecycle;
pub mod ssh;
pub mod workers;

#[cfg(test)]
pub(crate) mod testing;

pub use cloud::{get_provider, try_get_provider, CloudProvider, CloudSettings};
pub use config::ProvisionConfig;
pub use lifecycle::{ProvisionRequest, ProvisionState, ProvisionTracker, ProvisionedServer};
pub use ssh::{OpenSshTransport, ShellSession, ShellTransport};
pub use workers::{ProvisionEvent, Provisioner, StartServerRequest, WorkerOutcome};
