/// 模拟器前端核心 - 远程服务器启动工具
///
/// 在已创建的云主机上通过 SSH 启动远程模拟服务器，并登记服务器端点

use anyhow::Context;
use common::servers::{ServerFactory, ServerSpec, WsServer};
use common::ws_rpc::types::ServerStartPayload;
use common::{Server, ServerRegistry};
use provisioner::{OpenSshTransport, ProvisionConfig, ProvisionEvent, Provisioner, StartServerRequest, WorkerOutcome};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

fn required(key: &str) -> anyhow::Result<String> {
    std::env::var(key).with_context(|| format!("缺少环境变量 {}", key))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载配置
    dotenvy::dotenv().ok();
    let config = ProvisionConfig::from_env()?;

    // 初始化日志
    // RUST_LOG=provisioner=debug,common=debug cargo run --bin provisioner
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level))
        )
        .init();

    let host = required("INSTANCE_HOST")?;
    let key_file = PathBuf::from(required("SSH_KEY_FILE")?);
    let private_key = tokio::fs::read_to_string(&key_file)
        .await
        .with_context(|| format!("无法读取私钥 {:?}", key_file))?;
    let ca_file = std::env::var("SERVER_CA_FILE").ok().map(PathBuf::from);

    let request = StartServerRequest {
        host: host.clone(),
        private_key,
        payload: ServerStartPayload {
            instance_id: required("INSTANCE_ID")?,
            cloud_user_name: required("CLOUD_USER_NAME")?,
            cloud_api_key: required("CLOUD_API_KEY")?,
            region: required("CLOUD_REGION")?,
            dead_time: config.dead_time,
        },
    };

    let transport = Arc::new(OpenSshTransport::new(
        config.ssh_user.clone(),
        config.ssh_connect_timeout,
        config.ssh_command_timeout,
    ));
    let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
    let connect_timeout = config.ssh_connect_timeout;
    let factory: ServerFactory = Arc::new(move |spec: ServerSpec| {
        Arc::new(WsServer::new(spec, inbound_tx.clone(), connect_timeout)) as Arc<dyn Server>
    });
    let registry = Arc::new(ServerRegistry::new(factory));
    let port = config.remote_server_port;
    let max_attempts = config.max_poll_attempts;
    let (provisioner, mut events) = Provisioner::new(transport, registry.clone(), config);

    info!("🚀 在 {} 上启动远程服务器...", host);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match provisioner.start_remote_server(request.clone()).await? {
            WorkerOutcome::Completed => break,
            WorkerOutcome::Rejected if attempt < max_attempts => {
                let delay = provisioner.config().backoff(attempt);
                warn!("{} 暂不可达，{:?} 后重试", host, delay);
                tokio::time::sleep(delay).await;
            }
            WorkerOutcome::Rejected => anyhow::bail!("{} 在 {} 次尝试后仍不可达", host, attempt),
            WorkerOutcome::Failed(reason) => anyhow::bail!("启动远程服务器失败: {}", reason),
        }
    }

    provisioner
        .connect_remote_server(request.payload.instance_id.clone(), host, port, ca_file)
        .await?;

    while let Ok(event) = events.try_recv() {
        match event {
            ProvisionEvent::ServerStarted { instance_id, host, response } => {
                info!("✅ {} ({}) 已启动: {}", instance_id, host, response.trim());
            }
            ProvisionEvent::Established { instance_id } => {
                info!("✅ {} 的服务器端点已登记", instance_id);
            }
            other => error!("意外的事件: {:?}", other),
        }
    }

    for server in registry.remote_servers().await {
        info!("远程服务器: {}", server.endpoint());
    }
    Ok(())
}
