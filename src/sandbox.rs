//! Process primitives of the sandbox hosting the gateway
//!
//! The service never trusts the `status` reported here for liveness; the
//! supervisor probes the gateway port directly. Status is only used to skip
//! processes that have clearly exited.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Maximum bytes of output retained per stream
const LOG_CAPACITY: usize = 64 * 1024;

/// Reported state of a sandbox process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Unknown,
    Starting,
    Running,
    Exited,
}

/// A process as listed by the sandbox runtime
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub id: String,
    pub command: String,
    pub status: ProcessStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
}

/// Result of a command run to completion
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Captured output of a long-running process
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessLogs {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to spawn process: {0}")]
    Spawn(String),
    #[error("unknown process: {0}")]
    UnknownProcess(String),
    #[error("sandbox runtime error: {0}")]
    Runtime(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Process primitives offered by a sandbox runtime
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// List processes started through this sandbox
    async fn list_processes(&self) -> Result<Vec<ProcessInfo>, SandboxError>;

    /// Start a long-running process from a shell command line
    async fn start_process(
        &self,
        command: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<ProcessInfo, SandboxError>;

    /// Run a shell command to completion and capture its output
    async fn exec(
        &self,
        command: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<ExecOutput, SandboxError>;

    /// Output captured so far from a started process
    async fn logs(&self, id: &str) -> Result<ProcessLogs, SandboxError>;

    /// Terminate a started process
    async fn kill(&self, id: &str) -> Result<(), SandboxError>;
}

pub type SharedSandbox = Arc<dyn Sandbox>;

/// Bounded, shared text buffer that keeps the most recent output
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    inner: Arc<Mutex<String>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, chunk: &str) {
        let mut buf = self.inner.lock();
        buf.push_str(chunk);
        if buf.len() > LOG_CAPACITY {
            let mut cut = buf.len() - LOG_CAPACITY;
            while !buf.is_char_boundary(cut) {
                cut += 1;
            }
            buf.drain(..cut);
        }
    }

    pub fn snapshot(&self) -> String {
        self.inner.lock().clone()
    }
}

/// Copy everything from a child stream into a log buffer until EOF
pub(crate) fn capture_stream<R>(mut reader: R, buffer: LogBuffer)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.push(&String::from_utf8_lossy(&chunk[..n])),
            }
        }
    });
}

struct LocalProcess {
    command: String,
    started_at: DateTime<Utc>,
    child: Mutex<Child>,
    stdout: LogBuffer,
    stderr: LogBuffer,
}

/// Sandbox whose processes are children of this service
#[derive(Default)]
pub struct LocalSandbox {
    processes: DashMap<String, LocalProcess>,
}

impl LocalSandbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Forget processes that have exited, along with their output
    fn prune_exited(&self) {
        self.processes.retain(|id, process| {
            let exited = matches!(process.child.get_mut().try_wait(), Ok(Some(_)));
            if exited {
                debug!(id, "Dropping exited sandbox process");
            }
            !exited
        });
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn list_processes(&self) -> Result<Vec<ProcessInfo>, SandboxError> {
        let mut list = Vec::with_capacity(self.processes.len());
        for entry in self.processes.iter() {
            let (status, exit_code) = match entry.child.lock().try_wait() {
                Ok(Some(exit)) => (ProcessStatus::Exited, exit.code().map(i64::from)),
                Ok(None) => (ProcessStatus::Running, None),
                Err(_) => (ProcessStatus::Unknown, None),
            };
            list.push(ProcessInfo {
                id: entry.key().clone(),
                command: entry.command.clone(),
                status,
                started_at: entry.started_at,
                exit_code,
            });
        }
        list.sort_by_key(|p| p.started_at);
        Ok(list)
    }

    async fn start_process(
        &self,
        command: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<ProcessInfo, SandboxError> {
        self.prune_exited();

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.envs(env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Spawn(format!("{}: {}", command, e)))?;

        let stdout = LogBuffer::new();
        let stderr = LogBuffer::new();
        if let Some(out) = child.stdout.take() {
            capture_stream(out, stdout.clone());
        }
        if let Some(err) = child.stderr.take() {
            capture_stream(err, stderr.clone());
        }

        let id = uuid::Uuid::new_v4().to_string();
        let pid = child.id().unwrap_or(0);
        let started_at = Utc::now();
        info!(id, pid, "Sandbox process spawned");

        self.processes.insert(
            id.clone(),
            LocalProcess {
                command: command.to_string(),
                started_at,
                child: Mutex::new(child),
                stdout,
                stderr,
            },
        );

        Ok(ProcessInfo {
            id,
            command: command.to_string(),
            status: ProcessStatus::Starting,
            started_at,
            exit_code: None,
        })
    }

    async fn exec(
        &self,
        command: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<ExecOutput, SandboxError> {
        debug!(command = command.split_whitespace().next().unwrap_or(""), "Sandbox exec");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .envs(env)
            .stdin(Stdio::null())
            .output()
            .await?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().map(i64::from),
        })
    }

    async fn logs(&self, id: &str) -> Result<ProcessLogs, SandboxError> {
        let process = self
            .processes
            .get(id)
            .ok_or_else(|| SandboxError::UnknownProcess(id.to_string()))?;
        Ok(ProcessLogs {
            stdout: process.stdout.snapshot(),
            stderr: process.stderr.snapshot(),
        })
    }

    async fn kill(&self, id: &str) -> Result<(), SandboxError> {
        let process = self
            .processes
            .get(id)
            .ok_or_else(|| SandboxError::UnknownProcess(id.to_string()))?;
        if let Err(e) = process.child.lock().start_kill() {
            // Already exited
            warn!(id, error = %e, "Failed to signal sandbox process");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_log_buffer_keeps_tail() {
        let buf = LogBuffer::new();
        buf.push(&"a".repeat(LOG_CAPACITY));
        buf.push("tail");
        let snap = buf.snapshot();
        assert_eq!(snap.len(), LOG_CAPACITY);
        assert!(snap.ends_with("tail"));
    }

    #[test]
    fn test_exec_output_helpers() {
        let out = ExecOutput {
            stdout: "out\n".to_string(),
            stderr: "err\n".to_string(),
            exit_code: Some(0),
        };
        assert!(out.success());
        assert_eq!(out.combined(), "out\nerr\n");
        assert!(!ExecOutput::default().success());
    }

    #[tokio::test]
    async fn test_local_exec_captures_output_and_env() {
        let sandbox = LocalSandbox::new();
        let mut env = BTreeMap::new();
        env.insert("GREETING".to_string(), "hello".to_string());

        let out = sandbox.exec("echo $GREETING; echo oops >&2; exit 3", &env).await.unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
        assert_eq!(out.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_local_process_lifecycle() {
        let sandbox = LocalSandbox::new();
        let info = sandbox
            .start_process("echo started; sleep 30", &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(info.status, ProcessStatus::Starting);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let list = sandbox.list_processes().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].status, ProcessStatus::Running);
        assert_eq!(list[0].command, "echo started; sleep 30");

        let logs = sandbox.logs(&info.id).await.unwrap();
        assert_eq!(logs.stdout, "started\n");

        sandbox.kill(&info.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let list = sandbox.list_processes().await.unwrap();
        assert_eq!(list[0].status, ProcessStatus::Exited);
    }

    #[tokio::test]
    async fn test_exited_processes_pruned_on_start() {
        let sandbox = LocalSandbox::new();
        let first = sandbox.start_process("exit 0", &BTreeMap::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sandbox.list_processes().await.unwrap()[0].status, ProcessStatus::Exited);

        let second = sandbox.start_process("sleep 30", &BTreeMap::new()).await.unwrap();
        let list = sandbox.list_processes().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, second.id);
        assert!(sandbox.logs(&first.id).await.is_err());

        sandbox.kill(&second.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_process() {
        let sandbox = LocalSandbox::new();
        assert!(matches!(
            sandbox.logs("nope").await,
            Err(SandboxError::UnknownProcess(_))
        ));
        assert!(sandbox.kill("nope").await.is_err());
    }
}
