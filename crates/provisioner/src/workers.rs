/// 后台 worker
///
/// 每个操作在独立的 tokio 任务中执行，成功时发送一个事件，失败只记录日志

use crate::cloud::CloudProvider;
use crate::config::ProvisionConfig;
use crate::ssh::{start_command, ShellSession, ShellTransport};
use common::models::{CloudInstance, KeyPair};
use common::ws_rpc::types::ServerStartPayload;
use common::{Error, Result, Server, ServerRegistry};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// worker 完成事件
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionEvent {
    InstancesReady(Vec<CloudInstance>),
    InstanceCreated {
        instance: CloudInstance,
        key_pair: KeyPair,
    },
    InstanceDeleted(CloudInstance),
    ServerStarted {
        instance_id: String,
        host: String,
        response: String,
    },
    Established {
        instance_id: String,
    },
}

/// worker 的结束方式，只通过 JoinHandle 返回
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// 已发送事件
    Completed,
    /// 云厂商拒绝或主机不可达，未发送事件
    Rejected,
    /// 出错，未发送事件
    Failed(String),
}

/// 启动远程服务器的参数
#[derive(Debug, Clone)]
pub struct StartServerRequest {
    pub host: String,
    pub private_key: String,
    pub payload: ServerStartPayload,
}

/// 为 future 加上超时
pub(crate) async fn with_timeout<T, F>(timeout: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| Error::Timeout(format!("{} 超过 {:?}", what, timeout)))?
}

/// 创建与实例同名的密钥对，再用它创建实例
pub async fn create_with_key_pair(
    provider: &dyn CloudProvider,
    name: &str,
    flavor_id: &str,
    image_id: &str,
    timeout: Duration,
) -> Result<(CloudInstance, KeyPair)> {
    let key_pair = with_timeout(timeout, "创建密钥对", provider.create_key_pair(name)).await?;
    let instance = with_timeout(
        timeout,
        "创建云主机",
        provider.create_instance(name, flavor_id, image_id, &key_pair),
    )
    .await?;
    Ok((instance, key_pair))
}

/// 在已打开的会话上执行启动命令，返回 stdout
pub async fn run_start_command(
    session: &mut dyn ShellSession,
    payload: &ServerStartPayload,
) -> Result<String> {
    let command = start_command(payload)?;
    session.exec(&command).await
}

/// 打开会话并启动远程服务器，会话总是被关闭
///
/// 主机不可达时返回 Ok(None)
pub async fn start_server_over_shell(
    transport: &dyn ShellTransport,
    request: &StartServerRequest,
) -> Result<Option<String>> {
    let Some(mut session) = transport.open(&request.host, &request.private_key).await else {
        return Ok(None);
    };
    let result = run_start_command(session.as_mut(), &request.payload).await;
    session.close().await;
    result.map(Some)
}

/// 云主机开通的调度器
pub struct Provisioner {
    events: mpsc::UnboundedSender<ProvisionEvent>,
    transport: Arc<dyn ShellTransport>,
    registry: Arc<ServerRegistry>,
    config: ProvisionConfig,
}

impl Provisioner {
    /// 创建调度器，返回事件接收端
    pub fn new(
        transport: Arc<dyn ShellTransport>,
        registry: Arc<ServerRegistry>,
        config: ProvisionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ProvisionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                events,
                transport,
                registry,
                config,
            },
            rx,
        )
    }

    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    pub(crate) fn transport(&self) -> &dyn ShellTransport {
        self.transport.as_ref()
    }

    pub(crate) fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    /// 列出云主机
    pub fn list_instances(&self, provider: Arc<dyn CloudProvider>) -> JoinHandle<WorkerOutcome> {
        let events = self.events.clone();
        let timeout = self.config.provider_timeout;

        tokio::spawn(async move {
            match with_timeout(timeout, "列出云主机", provider.list_instances()).await {
                Ok(instances) => {
                    info!("列出 {} 台云主机", instances.len());
                    emit(&events, ProvisionEvent::InstancesReady(instances))
                }
                Err(e) => {
                    error!("列出云主机失败: {}", e);
                    WorkerOutcome::Failed(e.to_string())
                }
            }
        })
    }

    /// 创建密钥对和云主机
    pub fn create_instance(
        &self,
        provider: Arc<dyn CloudProvider>,
        name: impl Into<String>,
        flavor_id: impl Into<String>,
        image_id: impl Into<String>,
    ) -> JoinHandle<WorkerOutcome> {
        let events = self.events.clone();
        let timeout = self.config.provider_timeout;
        let (name, flavor_id, image_id) = (name.into(), flavor_id.into(), image_id.into());

        tokio::spawn(async move {
            match create_with_key_pair(provider.as_ref(), &name, &flavor_id, &image_id, timeout).await {
                Ok((instance, key_pair)) => {
                    info!("云主机已创建: {} ({})", instance.name, instance.id);
                    emit(&events, ProvisionEvent::InstanceCreated { instance, key_pair })
                }
                Err(e) => {
                    error!("创建云主机 {} 失败: {}", name, e);
                    WorkerOutcome::Failed(e.to_string())
                }
            }
        })
    }

    /// 删除云主机，只有云厂商确认后才发送事件
    pub fn delete_instance(
        &self,
        provider: Arc<dyn CloudProvider>,
        instance: CloudInstance,
    ) -> JoinHandle<WorkerOutcome> {
        let events = self.events.clone();
        let registry = self.registry.clone();
        let timeout = self.config.provider_timeout;
        let port = self.config.remote_server_port;

        tokio::spawn(async move {
            match with_timeout(timeout, "删除云主机", provider.delete_instance(&instance)).await {
                Ok(true) => {
                    info!("云主机已删除: {}", instance.id);
                    // 已删除实例的服务器端点不再参与分配
                    if let Some(ip) = &instance.public_ip {
                        if registry.remove_remote_server(ip, port).await {
                            info!("移除远程服务器 {}:{}", ip, port);
                        }
                    }
                    emit(&events, ProvisionEvent::InstanceDeleted(instance))
                }
                Ok(false) => {
                    warn!("云厂商未确认删除: {}", instance.id);
                    WorkerOutcome::Rejected
                }
                Err(e) => {
                    error!("删除云主机 {} 失败: {}", instance.id, e);
                    WorkerOutcome::Failed(e.to_string())
                }
            }
        })
    }

    /// 通过 SSH 启动远程服务器
    pub fn start_remote_server(&self, request: StartServerRequest) -> JoinHandle<WorkerOutcome> {
        let events = self.events.clone();
        let transport = self.transport.clone();

        tokio::spawn(async move {
            match start_server_over_shell(transport.as_ref(), &request).await {
                Ok(Some(response)) => {
                    info!("远程服务器已启动: {}", request.host);
                    emit(
                        &events,
                        ProvisionEvent::ServerStarted {
                            instance_id: request.payload.instance_id.clone(),
                            host: request.host.clone(),
                            response,
                        },
                    )
                }
                Ok(None) => {
                    info!("主机 {} 暂不可达", request.host);
                    WorkerOutcome::Rejected
                }
                Err(e) => {
                    warn!("启动远程服务器 {} 失败: {}", request.host, e);
                    WorkerOutcome::Failed(e.to_string())
                }
            }
        })
    }

    /// 把远程服务器交给连接层
    pub fn connect_remote_server(
        &self,
        instance_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        ca_file: Option<PathBuf>,
    ) -> JoinHandle<WorkerOutcome> {
        let events = self.events.clone();
        let registry = self.registry.clone();
        let (instance_id, host) = (instance_id.into(), host.into());

        tokio::spawn(async move {
            let server: Arc<dyn Server> = registry.get_remote_server(&host, port, ca_file).await;
            info!("云主机 {} 的服务器端点: {}", instance_id, server.endpoint());
            emit(&events, ProvisionEvent::Established { instance_id })
        })
    }
}

fn emit(events: &mpsc::UnboundedSender<ProvisionEvent>, event: ProvisionEvent) -> WorkerOutcome {
    match events.send(event) {
        Ok(()) => WorkerOutcome::Completed,
        Err(_) => WorkerOutcome::Failed("事件接收端已关闭".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{endpoint_factory, FakeProvider, FakeTransport};
    use common::models::InstanceState;

    fn provisioner(
        transport: Arc<FakeTransport>,
    ) -> (Provisioner, mpsc::UnboundedReceiver<ProvisionEvent>, Arc<ServerRegistry>) {
        let registry = Arc::new(ServerRegistry::new(endpoint_factory()));
        let config = ProvisionConfig {
            provider_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let (provisioner, rx) = Provisioner::new(transport, registry.clone(), config);
        (provisioner, rx, registry)
    }

    fn request() -> StartServerRequest {
        StartServerRequest {
            host: "203.0.113.10".into(),
            private_key: "KEY".into(),
            payload: ServerStartPayload {
                instance_id: "i-1".into(),
                cloud_user_name: "alice".into(),
                cloud_api_key: "secret".into(),
                region: "ord".into(),
                dead_time: 3600,
            },
        }
    }

    #[tokio::test]
    async fn test_list_instances() {
        let (provisioner, mut rx, _) = provisioner(FakeTransport::new());
        let provider = FakeProvider::new();
        provider.add_instance(CloudInstance {
            id: "i-9".into(),
            name: "existing".into(),
            state: InstanceState::Active,
            public_ip: Some("203.0.113.9".into()),
        });

        let outcome = provisioner.list_instances(provider).await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Completed);
        match rx.try_recv().unwrap() {
            ProvisionEvent::InstancesReady(instances) => assert_eq!(instances.len(), 1),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_error_emits_nothing() {
        let (provisioner, mut rx, _) = provisioner(FakeTransport::new());
        let provider = FakeProvider::new();
        provider.fail_listing();

        let outcome = provisioner.list_instances(provider).await.unwrap();
        assert!(matches!(outcome, WorkerOutcome::Failed(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_hung_provider_times_out() {
        let (provisioner, mut rx, _) = provisioner(FakeTransport::new());
        let provider = FakeProvider::new();
        provider.hang_listing();

        let outcome = provisioner.list_instances(provider).await.unwrap();
        match outcome {
            WorkerOutcome::Failed(reason) => assert!(reason.contains("超时")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_create_emits_instance_and_key_pair() {
        let (provisioner, mut rx, _) = provisioner(FakeTransport::new());
        let provider = FakeProvider::new();

        let outcome = provisioner
            .create_instance(provider.clone(), "lab-1", "2", "img")
            .await
            .unwrap();
        assert_eq!(outcome, WorkerOutcome::Completed);
        match rx.try_recv().unwrap() {
            ProvisionEvent::InstanceCreated { instance, key_pair } => {
                assert_eq!(instance.name, "lab-1");
                assert_eq!(key_pair.name, "lab-1");
                assert!(!key_pair.private_key.is_empty());
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(provider.key_pairs(), vec!["lab-1".to_string()]);
    }

    #[tokio::test]
    async fn test_create_failure_emits_nothing() {
        let (provisioner, mut rx, _) = provisioner(FakeTransport::new());
        let provider = FakeProvider::new();
        provider.fail_creation();

        let outcome = provisioner.create_instance(provider, "lab-1", "2", "img").await.unwrap();
        assert!(matches!(outcome, WorkerOutcome::Failed(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_delete_confirmed() {
        let (provisioner, mut rx, _) = provisioner(FakeTransport::new());
        let provider = FakeProvider::new();
        let instance = CloudInstance {
            id: "i-1".into(),
            name: "lab-1".into(),
            state: InstanceState::Active,
            public_ip: None,
        };
        provider.add_instance(instance.clone());

        let outcome = provisioner.delete_instance(provider, instance.clone()).await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Completed);
        assert_eq!(rx.try_recv().unwrap(), ProvisionEvent::InstanceDeleted(instance));
    }

    #[tokio::test]
    async fn test_delete_drops_server_endpoint() {
        let (provisioner, mut rx, registry) = provisioner(FakeTransport::new());
        let provider = FakeProvider::new();
        let instance = CloudInstance {
            id: "i-2".into(),
            name: "lab-2".into(),
            state: InstanceState::Active,
            public_ip: Some("203.0.113.20".into()),
        };
        provider.add_instance(instance.clone());
        registry.get_remote_server("203.0.113.20", 8000, None).await;
        registry.get_remote_server("203.0.113.21", 8000, None).await;

        let outcome = provisioner.delete_instance(provider, instance).await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Completed);
        assert!(matches!(rx.try_recv().unwrap(), ProvisionEvent::InstanceDeleted(_)));

        let remaining = registry.remote_servers().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].host(), "203.0.113.21");
    }

    #[tokio::test]
    async fn test_delete_rejected_emits_nothing() {
        let (provisioner, mut rx, _) = provisioner(FakeTransport::new());
        let provider = FakeProvider::new();
        provider.reject_deletes();
        let instance = CloudInstance {
            id: "i-1".into(),
            name: "lab-1".into(),
            state: InstanceState::Active,
            public_ip: None,
        };

        let outcome = provisioner.delete_instance(provider, instance).await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Rejected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_remote_server() {
        let transport = FakeTransport::new();
        let (provisioner, mut rx, _) = provisioner(transport.clone());

        let outcome = provisioner.start_remote_server(request()).await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Completed);
        match rx.try_recv().unwrap() {
            ProvisionEvent::ServerStarted { instance_id, host, response } => {
                assert_eq!(instance_id, "i-1");
                assert_eq!(host, "203.0.113.10");
                assert_eq!(response, "started\n");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let commands = transport.commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].contains("start_server.py -d -v --data="));
        assert_eq!(transport.closes(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_host_emits_nothing() {
        let transport = FakeTransport::unreachable();
        let (provisioner, mut rx, _) = provisioner(transport.clone());

        let outcome = provisioner.start_remote_server(request()).await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Rejected);
        assert!(rx.try_recv().is_err());
        assert!(transport.commands().is_empty());
    }

    #[tokio::test]
    async fn test_exec_failure_still_closes_session() {
        let transport = FakeTransport::new();
        transport.fail_exec();
        let (provisioner, mut rx, _) = provisioner(transport.clone());

        let outcome = provisioner.start_remote_server(request()).await.unwrap();
        assert!(matches!(outcome, WorkerOutcome::Failed(_)));
        assert!(rx.try_recv().is_err());
        assert_eq!(transport.closes(), 1);
    }

    #[tokio::test]
    async fn test_connect_remote_server() {
        let (provisioner, mut rx, registry) = provisioner(FakeTransport::new());

        let outcome = provisioner
            .connect_remote_server("i-1", "203.0.113.10", 8000, None)
            .await
            .unwrap();
        assert_eq!(outcome, WorkerOutcome::Completed);
        assert_eq!(
            rx.try_recv().unwrap(),
            ProvisionEvent::Established { instance_id: "i-1".into() }
        );

        let remotes = registry.remote_servers().await;
        assert_eq!(remotes.len(), 1);
        assert_eq!(remotes[0].host(), "203.0.113.10");

        // 同一端点不会重复创建
        provisioner
            .connect_remote_server("i-1", "203.0.113.10", 8000, None)
            .await
            .unwrap();
        assert_eq!(registry.remote_servers().await.len(), 1);
    }
}
