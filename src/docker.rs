//! Sandbox backed by an existing Docker container
//!
//! Every process is an exec instance inside the container. Output of long-running
//! execs is drained into bounded buffers so `logs` works like the local sandbox.

use crate::sandbox::{
    ExecOutput, LogBuffer, ProcessInfo, ProcessLogs, ProcessStatus, Sandbox, SandboxError,
};
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct ExecProcess {
    command: String,
    started_at: DateTime<Utc>,
    stdout: LogBuffer,
    stderr: LogBuffer,
}

/// Runs sandbox processes inside a named container
pub struct DockerSandbox {
    client: Docker,
    container: String,
    processes: DashMap<String, ExecProcess>,
}

impl DockerSandbox {
    /// Connect to the Docker daemon and verify the container is running
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Platform default socket
    pub async fn connect(docker_host: Option<&str>, container: &str) -> anyhow::Result<Arc<Self>> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host,
                    e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host)?
        } else {
            Docker::connect_with_socket_defaults()
                .map_err(|e| anyhow::anyhow!("Cannot connect to Docker daemon: {}", e))?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!("Docker daemon is not responding: {}", e)
        })?;

        let running = client
            .inspect_container(container, None)
            .await
            .map_err(|e| anyhow::anyhow!("Sandbox container '{}' not found: {}", container, e))?
            .state
            .and_then(|s| s.running)
            .unwrap_or(false);
        if !running {
            anyhow::bail!("Sandbox container '{}' is not running", container);
        }

        info!(container, "Connected to sandbox container");
        Ok(Arc::new(Self {
            client,
            container: container.to_string(),
            processes: DashMap::new(),
        }))
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn create_exec(
        &self,
        command: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<String, SandboxError> {
        let options = CreateExecOptions::<String> {
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), command.to_string()]),
            env: Some(env_pairs(env)),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        self.client
            .create_exec(&self.container, options)
            .await
            .map(|created| created.id)
            .map_err(|e| SandboxError::Runtime(format!("create exec failed: {}", e)))
    }
}

fn env_pairs(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

fn route_output(output: LogOutput, stdout: &LogBuffer, stderr: &LogBuffer) {
    match output {
        LogOutput::StdOut { message } | LogOutput::Console { message } => {
            stdout.push(&String::from_utf8_lossy(&message));
        }
        LogOutput::StdErr { message } => {
            stderr.push(&String::from_utf8_lossy(&message));
        }
        LogOutput::StdIn { .. } => {}
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn list_processes(&self) -> Result<Vec<ProcessInfo>, SandboxError> {
        let ids: Vec<(String, String, DateTime<Utc>)> = self
            .processes
            .iter()
            .map(|p| (p.key().clone(), p.command.clone(), p.started_at))
            .collect();

        let mut list = Vec::with_capacity(ids.len());
        for (id, command, started_at) in ids {
            let (status, exit_code) = match self.client.inspect_exec(&id).await {
                Ok(inspect) if inspect.running == Some(true) => (ProcessStatus::Running, None),
                Ok(inspect) => (ProcessStatus::Exited, inspect.exit_code),
                Err(e) => {
                    debug!(id, error = %e, "Failed to inspect exec");
                    (ProcessStatus::Unknown, None)
                }
            };
            list.push(ProcessInfo {
                id,
                command,
                status,
                started_at,
                exit_code,
            });
        }
        Ok(list)
    }

    async fn start_process(
        &self,
        command: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<ProcessInfo, SandboxError> {
        let id = self
            .create_exec(command, env)
            .await
            .map_err(|e| SandboxError::Spawn(e.to_string()))?;

        let results = self
            .client
            .start_exec(&id, None)
            .await
            .map_err(|e| SandboxError::Spawn(format!("start exec failed: {}", e)))?;

        let stdout = LogBuffer::new();
        let stderr = LogBuffer::new();
        if let StartExecResults::Attached { mut output, .. } = results {
            let (out, err) = (stdout.clone(), stderr.clone());
            let exec_id = id.clone();
            tokio::spawn(async move {
                while let Some(item) = output.next().await {
                    match item {
                        Ok(chunk) => route_output(chunk, &out, &err),
                        Err(e) => {
                            warn!(exec_id, error = %e, "Exec output stream failed");
                            break;
                        }
                    }
                }
                debug!(exec_id, "Exec output stream ended");
            });
        }

        let started_at = Utc::now();
        info!(id, container = %self.container, "Sandbox exec process started");
        self.processes.insert(
            id.clone(),
            ExecProcess {
                command: command.to_string(),
                started_at,
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
        let id = self.create_exec(command, env).await?;
        let results = self
            .client
            .start_exec(&id, None)
            .await
            .map_err(|e| SandboxError::Runtime(format!("start exec failed: {}", e)))?;

        let stdout = LogBuffer::new();
        let stderr = LogBuffer::new();
        if let StartExecResults::Attached { mut output, .. } = results {
            while let Some(item) = output.next().await {
                match item {
                    Ok(chunk) => route_output(chunk, &stdout, &stderr),
                    Err(e) => return Err(SandboxError::Runtime(e.to_string())),
                }
            }
        }

        let exit_code = self
            .client
            .inspect_exec(&id)
            .await
            .map_err(|e| SandboxError::Runtime(format!("inspect exec failed: {}", e)))?
            .exit_code;

        Ok(ExecOutput {
            stdout: stdout.snapshot(),
            stderr: stderr.snapshot(),
            exit_code,
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
        let pid = self
            .client
            .inspect_exec(id)
            .await
            .map_err(|e| SandboxError::Runtime(format!("inspect exec failed: {}", e)))?
            .pid
            .ok_or_else(|| SandboxError::UnknownProcess(id.to_string()))?;

        // Exec instances have no kill endpoint; signal the pid from inside the container
        let output = self
            .exec(&format!("kill -TERM {}", pid), &BTreeMap::new())
            .await?;
        if !output.success() {
            warn!(id, pid, stderr = %output.stderr.trim(), "kill reported failure");
        }
        Ok(())
    }
}
