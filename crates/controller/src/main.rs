/// 模拟器前端核心 - 控制器
///
/// 连接本地和远程模拟服务器，加载模块设置并同步给服务器，处理服务器通知

use common::servers::{ServerFactory, ServerSpec, WsServer};
use common::{Server, ServerRegistry};
use controller::config::Config;
use controller::modules::{ModuleEvent, ModuleRegistry, VirtualBoxModule};
use controller::settings::SettingsStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载配置
    dotenvy::dotenv().ok();
    let cfg = Config::from_env()?;

    // 初始化日志
    // 可以通过环境变量 RUST_LOG 设置日志级别，例如：
    // RUST_LOG=controller=debug,common=debug cargo run
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log_level))
        )
        .init();

    info!("🚀 启动控制器...");
    info!("✅ 配置加载成功");

    info!("💾 加载设置: {:?}", cfg.settings_path);
    let store = Arc::new(SettingsStore::open(&cfg.settings_path).await?);

    // 服务器注册表，所有服务器的通知汇总到同一个通道
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let connect_timeout = Duration::from_secs(cfg.connect_timeout);
    let factory: ServerFactory = Arc::new(move |spec: ServerSpec| {
        Arc::new(WsServer::new(spec, inbound_tx.clone(), connect_timeout)) as Arc<dyn Server>
    });
    let registry = Arc::new(ServerRegistry::new(factory));
    let local = registry
        .set_local_server(cfg.local_server_host.clone(), cfg.local_server_port)
        .await;
    for (host, port) in &cfg.remote_servers {
        registry.get_remote_server(host, *port, None).await;
    }

    // 模块
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let virtualbox = VirtualBoxModule::new(
        store.clone(),
        registry.clone(),
        event_tx,
        Duration::from_secs(cfg.rpc_timeout),
    )
    .await;
    let mut modules = ModuleRegistry::new();
    modules.register(Arc::new(Mutex::new(virtualbox))).await;
    info!("✅ 模块已初始化: {:?}", modules.names());

    if let Some(dir) = &cfg.project_dir {
        modules.set_project_directory(dir).await;
    }

    // 连接本地服务器
    match local.reconnect().await {
        Ok(()) => modules.add_server(local.clone()).await,
        Err(e) => warn!("本地服务器不可用: {}", e),
    }

    info!("🎯 等待服务器通知...");
    loop {
        tokio::select! {
            Some(notification) = inbound_rx.recv() => {
                modules.dispatch(notification).await;
            }
            Some(event) = event_rx.recv() => match event {
                ModuleEvent::NodeFailure { node_id, message, details } => {
                    error!("节点 {} 出错: {} ({})", node_id, message, details);
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("收到退出信号");
                break;
            }
        }
    }

    modules.shutdown().await;
    info!("👋 控制器已退出");
    Ok(())
}
