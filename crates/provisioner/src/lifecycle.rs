/// 单台云主机的开通流程
///
/// Requested -> Building -> (ShellReachable | Unreachable, 重试) -> ServerStarted
/// -> ConnectionEstablished，任一步失败进入 Failed

use crate::cloud::{CloudProvider, CloudSettings};
use crate::workers::{create_with_key_pair, run_start_command, with_timeout, Provisioner};
use chrono::{DateTime, Utc};
use common::models::{CloudInstance, InstanceState, KeyPair};
use common::ws_rpc::types::ServerStartPayload;
use common::{Error, Result, Server};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 开通状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    Requested,
    Building,
    ShellReachable,
    Unreachable,
    ServerStarted,
    ConnectionEstablished,
    Failed,
}

impl ProvisionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ConnectionEstablished | Self::Failed)
    }

    /// 是否允许迁移到 next
    pub fn can_transition_to(self, next: ProvisionState) -> bool {
        use ProvisionState::*;

        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Requested, Building)
                | (Building, ShellReachable)
                | (Building, Unreachable)
                | (Unreachable, Unreachable)
                | (Unreachable, ShellReachable)
                | (ShellReachable, ServerStarted)
                | (ServerStarted, ConnectionEstablished)
        )
    }
}

/// 状态迁移记录
#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub state: ProvisionState,
    pub at: DateTime<Utc>,
}

/// 跟踪一台云主机的开通进度
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionTracker {
    pub name: String,
    pub instance_id: Option<String>,
    state: ProvisionState,
    /// 当前状态下的 SSH 尝试次数
    attempts: u32,
    failure: Option<String>,
    history: Vec<Transition>,
}

impl ProvisionTracker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance_id: None,
            state: ProvisionState::Requested,
            attempts: 0,
            failure: None,
            history: vec![Transition {
                state: ProvisionState::Requested,
                at: Utc::now(),
            }],
        }
    }

    pub fn state(&self) -> ProvisionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// 迁移到下一状态，非法迁移返回 InvalidArgument
    pub fn advance(&mut self, next: ProvisionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidArgument(format!(
                "{}: 不能从 {:?} 迁移到 {:?}",
                self.name, self.state, next
            )));
        }

        if next == ProvisionState::Unreachable {
            self.attempts += 1;
        } else {
            self.attempts = 0;
        }
        debug!("{}: {:?} -> {:?}", self.name, self.state, next);
        self.state = next;
        self.history.push(Transition {
            state: next,
            at: Utc::now(),
        });
        Ok(())
    }

    /// 标记失败，已经结束的流程不受影响
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        let reason = reason.into();
        error!("{}: 开通失败: {}", self.name, reason);
        self.failure = Some(reason);
        self.state = ProvisionState::Failed;
        self.history.push(Transition {
            state: ProvisionState::Failed,
            at: Utc::now(),
        });
    }
}

/// 开通请求
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub name: String,
    pub flavor_id: String,
    pub image_id: String,
    pub credentials: CloudSettings,
    /// 连接远程服务器使用的 CA 证书，None 表示不加密
    pub ca_file: Option<PathBuf>,
}

/// 开通完成的远程服务器
pub struct ProvisionedServer {
    pub instance: CloudInstance,
    pub key_pair: KeyPair,
    pub server: Arc<dyn Server>,
    /// 启动命令的输出
    pub response: String,
}

impl Provisioner {
    /// 完整开通一台远程服务器：创建云主机，等待 active，SSH 启动服务器，交给连接层
    pub async fn provision(
        &self,
        provider: Arc<dyn CloudProvider>,
        request: ProvisionRequest,
        tracker: &mut ProvisionTracker,
    ) -> Result<ProvisionedServer> {
        match self.run_provision(provider, &request, tracker).await {
            Ok(provisioned) => Ok(provisioned),
            Err(e) => {
                tracker.fail(e.to_string());
                Err(e)
            }
        }
    }

    async fn run_provision(
        &self,
        provider: Arc<dyn CloudProvider>,
        request: &ProvisionRequest,
        tracker: &mut ProvisionTracker,
    ) -> Result<ProvisionedServer> {
        let config = self.config();
        info!("🚀 开通云主机: {}", request.name);

        let (instance, key_pair) = create_with_key_pair(
            provider.as_ref(),
            &request.name,
            &request.flavor_id,
            &request.image_id,
            config.provider_timeout,
        )
        .await?;
        tracker.instance_id = Some(instance.id.clone());

        match self
            .bring_up(provider.as_ref(), request, &instance, &key_pair, tracker)
            .await
        {
            Ok((instance, server, response)) => Ok(ProvisionedServer {
                instance,
                key_pair,
                server,
                response,
            }),
            Err(e) => {
                // 密钥对只在本次开通中持有，失败后实例无法再登录
                self.discard_instance(provider.as_ref(), &instance).await;
                Err(e)
            }
        }
    }

    /// 等待实例就绪，启动并连接远程服务器
    async fn bring_up(
        &self,
        provider: &dyn CloudProvider,
        request: &ProvisionRequest,
        instance: &CloudInstance,
        key_pair: &KeyPair,
        tracker: &mut ProvisionTracker,
    ) -> Result<(CloudInstance, Arc<dyn Server>, String)> {
        let config = self.config();
        tracker.advance(ProvisionState::Building)?;

        let instance = self.wait_until_active(provider, &instance.id).await?;
        let host = instance
            .public_ip
            .clone()
            .ok_or_else(|| Error::Internal(format!("{} 没有公网地址", instance.id)))?;

        let payload = ServerStartPayload {
            instance_id: instance.id.clone(),
            cloud_user_name: request.credentials.user_name.clone(),
            cloud_api_key: request.credentials.api_key.clone(),
            region: request.credentials.region.clone(),
            dead_time: config.dead_time,
        };
        let response = self
            .start_with_retry(&host, &key_pair.private_key, &payload, tracker)
            .await?;
        tracker.advance(ProvisionState::ServerStarted)?;

        let server = self
            .registry()
            .get_remote_server(&host, config.remote_server_port, request.ca_file.clone())
            .await;
        tracker.advance(ProvisionState::ConnectionEstablished)?;
        info!("✅ 云主机 {} 已就绪: {}", instance.id, server.endpoint());

        Ok((instance, server, response))
    }

    /// 删除开通失败的实例，删除失败只记录日志
    async fn discard_instance(&self, provider: &dyn CloudProvider, instance: &CloudInstance) {
        let timeout = self.config().provider_timeout;
        match with_timeout(timeout, "删除云主机", provider.delete_instance(instance)).await {
            Ok(true) => info!("🗑️ 已删除开通失败的云主机 {}", instance.id),
            Ok(false) => warn!("云厂商拒绝删除云主机 {}，需要手动清理", instance.id),
            Err(e) => error!("删除云主机 {} 失败，需要手动清理: {}", instance.id, e),
        }
    }

    /// 轮询直到实例 active 且有公网地址
    async fn wait_until_active(
        &self,
        provider: &dyn CloudProvider,
        instance_id: &str,
    ) -> Result<CloudInstance> {
        let config = self.config();

        for attempt in 1..=config.max_poll_attempts {
            let instances =
                with_timeout(config.provider_timeout, "列出云主机", provider.list_instances()).await?;
            let instance = instances
                .into_iter()
                .find(|i| i.id == instance_id)
                .ok_or_else(|| Error::NotFound(format!("云主机 {}", instance_id)))?;

            match instance.state {
                InstanceState::Active if instance.public_ip.is_some() => return Ok(instance),
                InstanceState::Error | InstanceState::Deleted => {
                    return Err(Error::Internal(format!(
                        "云主机 {} 状态为 {}",
                        instance_id, instance.state
                    )));
                }
                state => debug!("云主机 {} 状态 {} (第 {} 次)", instance_id, state, attempt),
            }
            tokio::time::sleep(config.poll_interval).await;
        }

        Err(Error::Timeout(format!(
            "云主机 {} 在 {} 次轮询后仍未就绪",
            instance_id, config.max_poll_attempts
        )))
    }

    /// SSH 不可达时退避重试
    async fn start_with_retry(
        &self,
        host: &str,
        private_key: &str,
        payload: &ServerStartPayload,
        tracker: &mut ProvisionTracker,
    ) -> Result<String> {
        let config = self.config();

        loop {
            match self.transport().open(host, private_key).await {
                Some(mut session) => {
                    tracker.advance(ProvisionState::ShellReachable)?;
                    let result = run_start_command(session.as_mut(), payload).await;
                    session.close().await;
                    return result;
                }
                None => {
                    tracker.advance(ProvisionState::Unreachable)?;
                    if tracker.attempts() >= config.max_poll_attempts {
                        return Err(Error::Timeout(format!(
                            "{} 在 {} 次尝试后仍不可达",
                            host,
                            tracker.attempts()
                        )));
                    }
                    let delay = config.backoff(tracker.attempts());
                    warn!("{} 暂不可达，{:?} 后重试", host, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
