/// 远程 shell
///
/// 通过系统的 ssh 命令执行远程命令，首次连接总是信任主机密钥
///
/// 运行环境需要安装 OpenSSH 客户端，`ssh` 不在 PATH 中时可用
/// `OpenSshTransport::with_binary` 指定路径；找不到程序时主机视为不可达

use async_trait::async_trait;
use common::ws_rpc::types::ServerStartPayload;
use common::{Error, Result};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// 远程服务器启动脚本
pub const START_SCRIPT: &str = "/opt/gns3/gns3-server/gns3server/start_server.py";

/// 远程 Python 解释器
pub const PYTHON_PATH: &str = "/usr/bin/python3";

/// 远程服务器 stderr 日志
pub const STDERR_LOG: &str = "/tmp/gns3_stderr.log";

/// 远程 shell 传输
#[async_trait]
pub trait ShellTransport: Send + Sync + 'static {
    /// 打开会话，主机不可达时返回 None
    async fn open(&self, host: &str, private_key: &str) -> Option<Box<dyn ShellSession>>;
}

/// 已建立的 shell 会话
#[async_trait]
pub trait ShellSession: Send {
    /// 执行命令，返回 stdout
    async fn exec(&mut self, command: &str) -> Result<String>;

    async fn close(&mut self);
}

/// 转义为双引号内的 shell 参数
pub fn escape_double_quoted(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// 构造启动远程服务器的命令
pub fn start_command(payload: &ServerStartPayload) -> Result<String> {
    let data = serde_json::to_string(payload)?;
    Ok(format!(
        "{} {} -d -v --data=\"{}\" 2>{}",
        PYTHON_PATH,
        START_SCRIPT,
        escape_double_quoted(&data),
        STDERR_LOG
    ))
}

/// 基于 ssh 命令的传输
#[derive(Debug, Clone)]
pub struct OpenSshTransport {
    ssh_binary: PathBuf,
    user: String,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl OpenSshTransport {
    pub fn new(user: impl Into<String>, connect_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            ssh_binary: PathBuf::from("ssh"),
            user: user.into(),
            connect_timeout,
            command_timeout,
        }
    }

    /// 指定 ssh 可执行文件路径
    pub fn with_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssh_binary = path.into();
        self
    }

    fn write_identity(private_key: &str) -> std::io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        file.write_all(private_key.as_bytes())?;
        if !private_key.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        file.flush()?;
        Ok(file)
    }
}

#[async_trait]
impl ShellTransport for OpenSshTransport {
    async fn open(&self, host: &str, private_key: &str) -> Option<Box<dyn ShellSession>> {
        let identity = match Self::write_identity(private_key) {
            Ok(file) => file,
            Err(e) => {
                warn!("无法写入 SSH 私钥: {}", e);
                return None;
            }
        };

        let mut session = OpenSshSession {
            ssh_binary: self.ssh_binary.clone(),
            target: format!("{}@{}", self.user, host),
            connect_timeout: self.connect_timeout,
            command_timeout: self.command_timeout,
            identity: Some(identity),
        };

        // 探测主机是否可达
        match session.run("true", self.connect_timeout * 2).await {
            Ok(_) => {
                info!("SSH 会话已建立: {}", session.target);
                Some(Box::new(session))
            }
            Err(e) => {
                warn!("{}", Error::TransientNetwork(format!("{}: {}", host, e)));
                session.close().await;
                None
            }
        }
    }
}

/// ssh 会话，私钥文件随会话关闭删除
pub struct OpenSshSession {
    ssh_binary: PathBuf,
    target: String,
    connect_timeout: Duration,
    command_timeout: Duration,
    identity: Option<NamedTempFile>,
}

impl OpenSshSession {
    fn command(&self, remote: &str) -> Result<Command> {
        let identity = self
            .identity
            .as_ref()
            .ok_or_else(|| Error::Connection(format!("{} 会话已关闭", self.target)))?;

        let mut cmd = Command::new(&self.ssh_binary);
        cmd.arg("-i")
            .arg(identity.path())
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "BatchMode=yes"])
            .args(["-o", "LogLevel=ERROR"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg(&self.target)
            .arg(remote)
            .kill_on_drop(true);
        Ok(cmd)
    }

    async fn run(&self, remote: &str, timeout: Duration) -> Result<String> {
        let mut cmd = self.command(remote)?;
        debug!("执行远程命令: {} {}", self.target, remote);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| Error::Timeout(format!("{}: {}", self.target, remote)))?
            .map_err(|e| Error::TransientNetwork(format!("无法启动 ssh: {}", e)))?;

        // 255 是 ssh 自身的连接错误
        if output.status.code() == Some(255) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::TransientNetwork(stderr.trim().to_string()));
        }
        if !output.status.success() {
            warn!(
                "远程命令退出码 {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ShellSession for OpenSshSession {
    async fn exec(&mut self, command: &str) -> Result<String> {
        self.run(command, self.command_timeout).await
    }

    async fn close(&mut self) {
        if let Some(identity) = self.identity.take() {
            if let Err(e) = identity.close() {
                warn!("无法删除 SSH 私钥文件: {}", e);
            }
            debug!("SSH 会话已关闭: {}", self.target);
        }
    }
}
