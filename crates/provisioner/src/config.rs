/// 配置管理

use common::models::constants::DEFAULT_LOCAL_SERVER_PORT;
use std::time::Duration;

/// 云主机开通配置
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// 登录云主机使用的用户名
    pub ssh_user: String,
    pub ssh_connect_timeout: Duration,
    pub ssh_command_timeout: Duration,
    /// 每次云厂商 API 调用的超时
    pub provider_timeout: Duration,
    /// 轮询云主机状态的间隔，也是 SSH 重试的退避基数
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    /// SSH 重试退避上限
    pub max_backoff: Duration,
    pub remote_server_port: u16,
    /// 远程服务器空闲多少秒后自动关机
    pub dead_time: u64,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            ssh_user: "root".to_string(),
            ssh_connect_timeout: Duration::from_secs(10),
            ssh_command_timeout: Duration::from_secs(60),
            provider_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            max_poll_attempts: 60,
            max_backoff: Duration::from_secs(60),
            remote_server_port: DEFAULT_LOCAL_SERVER_PORT,
            dead_time: 3600,
        }
    }
}

impl ProvisionConfig {
    /// 从环境变量加载配置，未设置的项使用默认值
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let ssh_user = std::env::var("SSH_USER").unwrap_or(defaults.ssh_user);

        Ok(Self {
            ssh_user,
            ssh_connect_timeout: secs_from_env("SSH_CONNECT_TIMEOUT_SECS", defaults.ssh_connect_timeout)?,
            ssh_command_timeout: secs_from_env("SSH_COMMAND_TIMEOUT_SECS", defaults.ssh_command_timeout)?,
            provider_timeout: secs_from_env("PROVIDER_TIMEOUT_SECS", defaults.provider_timeout)?,
            poll_interval: secs_from_env("POLL_INTERVAL_SECS", defaults.poll_interval)?,
            max_poll_attempts: match std::env::var("MAX_POLL_ATTEMPTS") {
                Ok(v) => v.parse()?,
                Err(_) => defaults.max_poll_attempts,
            },
            max_backoff: secs_from_env("MAX_BACKOFF_SECS", defaults.max_backoff)?,
            remote_server_port: match std::env::var("REMOTE_SERVER_PORT") {
                Ok(v) => v.parse()?,
                Err(_) => defaults.remote_server_port,
            },
            dead_time: match std::env::var("DEAD_TIME_SECS") {
                Ok(v) => v.parse()?,
                Err(_) => defaults.dead_time,
            },
        })
    }

    /// 第 attempt 次 SSH 重试前的等待时间（线性退避，有上限）
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.poll_interval
            .saturating_mul(attempt.max(1))
            .min(self.max_backoff)
    }
}

fn secs_from_env(key: &str, default: Duration) -> anyhow::Result<Duration> {
    match std::env::var(key) {
        Ok(v) => Ok(Duration::from_secs(v.parse()?)),
        Err(_) => Ok(default),
    }
}
