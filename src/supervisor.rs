use crate::config::GatewayConfig;
use crate::env::BackendEnv;
use crate::sandbox::{ProcessInfo, ProcessLogs, ProcessStatus, SandboxError, SharedSandbox};
use crate::storage::{RestoreOutcome, StorageError, StorageManager};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Connect timeout for a single port probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a restart waits for killed processes to disappear
const RESTART_SETTLE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    /// The sandbox refused to create the process
    #[error("failed to spawn gateway: {0}")]
    Spawn(String),
    /// The process exists but its port never opened
    #[error("gateway did not accept connections within {}s", .waited.as_secs())]
    StartupTimeout { waited: Duration },
    #[error("no gateway process is running")]
    NotRunning,
    #[error("sandbox error: {0}")]
    Sandbox(String),
}

impl From<SandboxError> for SupervisorError {
    fn from(err: SandboxError) -> Self {
        SupervisorError::Sandbox(err.to_string())
    }
}

/// The supervised gateway process
#[derive(Debug, Clone, Serialize)]
pub struct GatewayProcess {
    pub id: String,
    pub status: ProcessStatus,
    pub started_at: DateTime<Utc>,
    pub port: u16,
}

/// Result of a non-blocking look at the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GatewayStatus {
    NotRunning,
    /// Process exists, port not open yet
    Starting { id: String },
    Running { id: String },
}

type StartFuture = Shared<BoxFuture<'static, Result<GatewayProcess, SupervisorError>>>;

/// Discovers, starts and probes the gateway process.
///
/// `new` returns `Arc<Self>`; startup runs on a spawned task that every
/// concurrent caller of [`ensure_running`](GatewaySupervisor::ensure_running)
/// awaits, so a single startup attempt is ever in flight.
pub struct GatewaySupervisor {
    sandbox: SharedSandbox,
    config: GatewayConfig,
    env: BackendEnv,
    storage: Option<Arc<StorageManager>>,
    /// Startup attempt shared by all waiters
    inflight: Mutex<Option<StartFuture>>,
    /// Last process seen accepting connections
    last_ready: RwLock<Option<GatewayProcess>>,
}

impl GatewaySupervisor {
    pub fn new(
        sandbox: SharedSandbox,
        config: GatewayConfig,
        env: BackendEnv,
        storage: Option<Arc<StorageManager>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sandbox,
            config,
            env,
            storage,
            inflight: Mutex::new(None),
            last_ready: RwLock::new(None),
        })
    }

    pub fn sandbox(&self) -> &SharedSandbox {
        &self.sandbox
    }

    /// Make sure the gateway is up and return it
    pub async fn ensure_running(self: &Arc<Self>) -> Result<GatewayProcess, SupervisorError> {
        let cached = self.last_ready.read().clone();
        if let Some(process) = cached {
            if self.probe().await {
                return Ok(process);
            }
            debug!(id = %process.id, "Gateway port closed, rediscovering");
            self.last_ready.write().take();
        }

        let attempt = {
            let mut slot = self.inflight.lock();
            match slot.as_ref() {
                Some(attempt) => attempt.clone(),
                None => {
                    let this = Arc::clone(self);
                    let task = tokio::spawn(async move {
                        let result = this.discover_or_start().await;
                        this.inflight.lock().take();
                        result
                    });
                    let attempt: StartFuture = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(SupervisorError::Spawn(format!("startup task failed: {}", e)))
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(attempt.clone());
                    attempt
                }
            }
        };

        attempt.await
    }

    /// Start the gateway in the background without waiting for it
    pub fn start_in_background(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.ensure_running().await {
                warn!(error = %e, "Background gateway start failed");
            }
        });
    }

    async fn discover_or_start(&self) -> Result<GatewayProcess, SupervisorError> {
        if let Some(existing) = self.find_gateway().await? {
            info!(id = %existing.id, status = ?existing.status, "Found existing gateway process");
            return self.wait_for_port(existing).await;
        }

        self.prepare_storage().await;

        let command = self.config.launch_command();
        info!(port = self.config.port, "Starting gateway process");
        let started = self
            .sandbox
            .start_process(&command, &self.env)
            .await
            .map_err(|e| {
                error!(error = %e, "Gateway spawn failed");
                SupervisorError::Spawn(e.to_string())
            })?;

        self.wait_for_port(started).await
    }

    /// Mount and restore durable state before a fresh start
    async fn prepare_storage(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        if !storage.config().is_configured() {
            return;
        }

        if let Err(e) = storage.mount().await {
            warn!(error = %e, "Durable storage unavailable, starting without restore");
            return;
        }
        match storage.restore_in().await {
            Ok(RestoreOutcome::Restored(ts)) => info!(backup = %ts, "Restored gateway state"),
            Ok(RestoreOutcome::NothingToRestore) => debug!("No gateway state to restore"),
            Err(StorageError::SyncInProgress) => debug!("Sync running, skipping restore"),
            Err(e) => warn!(error = %e, "Restore failed, starting with local state"),
        }
    }

    /// Poll the gateway port until it accepts connections.
    ///
    /// On timeout the process is left running; the next call finds it again.
    async fn wait_for_port(&self, process: ProcessInfo) -> Result<GatewayProcess, SupervisorError> {
        let timeout = self.config.startup_timeout();
        let interval = self.config.health_check_interval();
        let start = Instant::now();

        debug!(id = %process.id, port = self.config.port, "Waiting for gateway port");

        loop {
            if self.probe().await {
                let ready = GatewayProcess {
                    id: process.id,
                    status: ProcessStatus::Running,
                    started_at: process.started_at,
                    port: self.config.port,
                };
                info!(
                    id = %ready.id,
                    port = ready.port,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Gateway is accepting connections"
                );
                *self.last_ready.write() = Some(ready.clone());
                return Ok(ready);
            }

            if start.elapsed() >= timeout {
                warn!(id = %process.id, timeout_secs = timeout.as_secs(), "Gateway startup timed out");
                return Err(SupervisorError::StartupTimeout { waited: timeout });
            }

            tokio::time::sleep(interval).await;
        }
    }

    /// Single TCP connect to the gateway port
    pub async fn probe(&self) -> bool {
        let addr = (self.config.host.as_str(), self.config.port);
        matches!(
            tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }

    fn matches_signature(&self, command: &str) -> bool {
        self.config
            .process_signatures
            .iter()
            .any(|sig| command.contains(sig.as_str()))
    }

    /// Newest matching process that has not exited
    pub async fn find_gateway(&self) -> Result<Option<ProcessInfo>, SupervisorError> {
        let processes = self.sandbox.list_processes().await?;
        Ok(processes
            .into_iter()
            .filter(|p| p.status != ProcessStatus::Exited && self.matches_signature(&p.command))
            .max_by_key(|p| p.started_at))
    }

    pub async fn status(&self) -> Result<GatewayStatus, SupervisorError> {
        Ok(match self.find_gateway().await? {
            None => GatewayStatus::NotRunning,
            Some(p) if self.probe().await => GatewayStatus::Running { id: p.id },
            Some(p) => GatewayStatus::Starting { id: p.id },
        })
    }

    /// Kill every gateway process, then start a fresh one
    pub async fn restart(self: &Arc<Self>) -> Result<GatewayProcess, SupervisorError> {
        self.last_ready.write().take();

        let processes = self.sandbox.list_processes().await?;
        for p in processes
            .iter()
            .filter(|p| p.status != ProcessStatus::Exited && self.matches_signature(&p.command))
        {
            info!(id = %p.id, "Killing gateway process");
            if let Err(e) = self.sandbox.kill(&p.id).await {
                warn!(id = %p.id, error = %e, "Failed to kill gateway process");
            }
        }

        let start = Instant::now();
        while start.elapsed() < RESTART_SETTLE && self.find_gateway().await?.is_some() {
            tokio::time::sleep(self.config.health_check_interval()).await;
        }

        self.ensure_running().await
    }

    /// Output of the current gateway process
    pub async fn logs(&self) -> Result<ProcessLogs, SupervisorError> {
        let process = self.find_gateway().await?.ok_or(SupervisorError::NotRunning)?;
        Ok(self.sandbox.logs(&process.id).await?)
    }
}
