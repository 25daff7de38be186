//! Durable storage: bucket mount and backup/restore sync
//!
//! The bucket is mounted into the sandbox through an s3fs-style FUSE gateway.
//! Nothing reported by the sandbox is taken at face value: mount state is read
//! from the live mount table on every call, and a sync only counts as done when
//! the marker file at the mount root carries this sync's id after a valid date.
//!
//! The mount directory is external durable state. This module never removes or
//! resets it; the only writes under it are the sync copies and the marker.

use crate::config::{StorageConfig, SyncPath};
use crate::sandbox::{SandboxError, SharedSandbox};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOutcome {
    Mounted,
    AlreadyMounted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Local state replaced from the backup taken at this time
    Restored(String),
    /// No valid backup, or local state is at least as new
    NothingToRestore,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("durable storage is not configured")]
    NotConfigured,
    /// Bucket could not be attached; also returned when a sync finds no mount
    #[error("mount failed: {0}")]
    Mount(String),
    #[error("a sync is already in progress")]
    SyncInProgress,
    #[error("refusing to sync: {0} is missing")]
    MissingSource(String),
    #[error("sync failed: {0}")]
    Sync(String),
    #[error("sandbox error: {0}")]
    Sandbox(String),
}

impl From<SandboxError> for StorageError {
    fn from(err: SandboxError) -> Self {
        StorageError::Sandbox(err.to_string())
    }
}

/// Snapshot for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct StorageStatus {
    pub configured: bool,
    pub mounted: bool,
    pub mount_path: String,
    pub last_sync: Option<String>,
    pub syncing: bool,
}

/// True when the marker content starts with a `YYYY-MM-DD` date
pub fn is_valid_marker(content: &str) -> bool {
    let content = content.trim();
    content
        .get(..10)
        .map(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").is_ok())
        .unwrap_or(false)
}

/// Timestamp part of a marker (`<timestamp> <sync id>`)
fn marker_timestamp(content: &str) -> Option<&str> {
    if !is_valid_marker(content) {
        return None;
    }
    content.split_whitespace().next()
}

/// Clears the in-progress flag when a sync ends, however it ends
struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct StorageManager {
    config: StorageConfig,
    sandbox: SharedSandbox,
    syncing: AtomicBool,
    /// Set once a restore has been checked for this sandbox lifetime
    restored: AtomicBool,
    mount_lock: tokio::sync::Mutex<()>,
}

impl StorageManager {
    pub fn new(config: StorageConfig, sandbox: SharedSandbox) -> Arc<Self> {
        Arc::new(Self {
            config,
            sandbox,
            syncing: AtomicBool::new(false),
            restored: AtomicBool::new(false),
            mount_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    fn mount_root(&self) -> &str {
        self.config.mount_path.trim_end_matches('/')
    }

    fn remote_dir(&self, path: &SyncPath) -> String {
        format!("{}/{}", self.mount_root(), path.remote.trim_start_matches('/'))
    }

    /// Local copy of the marker, kept beside the primary synced tree
    fn local_marker_path(&self) -> Option<String> {
        self.config.paths.first().map(|p| {
            format!("{}/{}", p.local.trim_end_matches('/'), self.config.marker_file)
        })
    }

    /// Inspect the live mount table for our mount
    pub async fn is_mounted(&self) -> Result<bool, StorageError> {
        let output = self.sandbox.exec("mount", &BTreeMap::new()).await?;
        let target = format!(" on {} ", self.mount_root());
        Ok(output
            .stdout
            .lines()
            .any(|line| line.contains(&self.config.mount_signature) && line.contains(&target)))
    }

    /// Attach the bucket at the mount path
    pub async fn mount(&self) -> Result<MountOutcome, StorageError> {
        if !self.config.is_configured() {
            return Err(StorageError::NotConfigured);
        }

        let _lock = self.mount_lock.lock().await;

        if self.is_mounted().await? {
            debug!(path = %self.config.mount_path, "Storage already mounted");
            return Ok(MountOutcome::AlreadyMounted);
        }

        let (Some(bucket), Some(endpoint)) = (&self.config.bucket, &self.config.endpoint) else {
            return Err(StorageError::NotConfigured);
        };

        let root = shell_words::quote(self.mount_root()).into_owned();
        self.sandbox
            .exec(&format!("mkdir -p {}", root), &BTreeMap::new())
            .await?;

        let mut env = BTreeMap::new();
        if let (Some(id), Some(secret)) = (&self.config.access_key_id, &self.config.secret_access_key) {
            env.insert("AWS_ACCESS_KEY_ID".to_string(), id.clone());
            env.insert("AWS_SECRET_ACCESS_KEY".to_string(), secret.clone());
            env.insert("AWSACCESSKEYID".to_string(), id.clone());
            env.insert("AWSSECRETACCESSKEY".to_string(), secret.clone());
        }

        let command = format!(
            "s3fs {} {} -o url={} -o use_path_request_style -o nomultipart",
            shell_words::quote(bucket),
            root,
            shell_words::quote(endpoint),
        );

        info!(bucket, path = %self.config.mount_path, "Mounting durable storage");
        let output = self.sandbox.exec(&command, &env).await?;

        // The mount command can fail against an already mounted target and can
        // succeed without attaching anything; only the mount table decides.
        debug!(exit_code = ?output.exit_code, "Mount command finished");

        if self.is_mounted().await? {
            info!(path = %self.config.mount_path, "Durable storage mounted");
            Ok(MountOutcome::Mounted)
        } else {
            let detail = output.stderr.trim();
            Err(StorageError::Mount(if detail.is_empty() {
                format!("{} not present in mount table", self.config.mount_path)
            } else {
                detail.to_string()
            }))
        }
    }

    async fn ensure_mounted(&self) -> Result<(), StorageError> {
        match self.mount().await {
            Ok(_) => Ok(()),
            Err(StorageError::Sandbox(detail)) => Err(StorageError::Mount(detail)),
            Err(e) => Err(e),
        }
    }

    fn try_begin_sync(&self) -> Result<SyncGuard<'_>, StorageError> {
        self.syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| SyncGuard(&self.syncing))
            .map_err(|_| StorageError::SyncInProgress)
    }

    async fn read_marker(&self, path: &str) -> Result<Option<String>, StorageError> {
        let output = self
            .sandbox
            .exec(&format!("cat {} 2>/dev/null", shell_words::quote(path)), &BTreeMap::new())
            .await?;
        let content = output.stdout.trim().to_string();
        Ok(if content.is_empty() { None } else { Some(content) })
    }

    /// Timestamp of the last successful sync, if any
    pub async fn last_sync(&self) -> Result<Option<String>, StorageError> {
        let marker = self.read_marker(&self.config.marker_path()).await?;
        Ok(marker.as_deref().and_then(marker_timestamp).map(String::from))
    }

    /// Copy local state into the bucket
    pub async fn sync_out(&self) -> Result<String, StorageError> {
        if !self.config.is_configured() {
            return Err(StorageError::NotConfigured);
        }
        let _guard = self.try_begin_sync()?;

        self.ensure_mounted().await?;

        if let Some(primary) = self.config.paths.first() {
            if let Some(required) = &primary.required_file {
                let file = format!("{}/{}", primary.local.trim_end_matches('/'), required);
                let check = self
                    .sandbox
                    .exec(&format!("test -f {}", shell_words::quote(&file)), &BTreeMap::new())
                    .await?;
                if !check.success() {
                    warn!(file, "Sync source incomplete, keeping existing backup");
                    return Err(StorageError::MissingSource(file));
                }
            }
        }

        let sync_id = uuid::Uuid::new_v4().simple().to_string();
        let marker = self.config.marker_path();
        let mut steps: Vec<String> = self
            .config
            .paths
            .iter()
            .map(|p| self.copy_command(&p.local, &self.remote_dir(p), &p.exclude, true))
            .collect();
        steps.push(format!(
            "printf '%s %s\\n' \"$(date -u +%Y-%m-%dT%H:%M:%SZ)\" {} > {}",
            sync_id,
            shell_words::quote(&marker)
        ));
        // Local state now matches the backup
        if let Some(local_marker) = self.local_marker_path() {
            steps.push(format!(
                "cp {} {}",
                shell_words::quote(&marker),
                shell_words::quote(&local_marker)
            ));
        }
        let script = steps.join(" && ");

        info!(paths = self.config.paths.len(), "Starting storage sync");
        let output = self.sandbox.exec(&script, &BTreeMap::new()).await?;
        debug!(exit_code = ?output.exit_code, "Sync command finished");

        let content = self.read_marker(&marker).await?.unwrap_or_default();
        match marker_timestamp(&content) {
            Some(ts) if content.contains(&sync_id) => {
                info!(timestamp = ts, "Storage sync complete");
                Ok(ts.to_string())
            }
            _ => {
                let detail = output.stderr.trim();
                Err(StorageError::Sync(if detail.is_empty() {
                    "sync marker was not written".to_string()
                } else {
                    detail.to_string()
                }))
            }
        }
    }

    /// Copy the bucket's state back into the sandbox when it is newer.
    ///
    /// Only the first successful check per sandbox lifetime can restore;
    /// later gateway restarts keep whatever is on local disk.
    pub async fn restore_in(&self) -> Result<RestoreOutcome, StorageError> {
        if !self.config.is_configured() {
            return Err(StorageError::NotConfigured);
        }
        if self.restored.load(Ordering::Acquire) {
            debug!("Restore already checked for this sandbox, keeping local state");
            return Ok(RestoreOutcome::NothingToRestore);
        }
        let _guard = self.try_begin_sync()?;

        let outcome = self.restore_from_backup().await?;
        self.restored.store(true, Ordering::Release);
        Ok(outcome)
    }

    async fn restore_from_backup(&self) -> Result<RestoreOutcome, StorageError> {
        self.ensure_mounted().await?;

        let remote = self.read_marker(&self.config.marker_path()).await?;
        let Some(remote) = remote.filter(|m| is_valid_marker(m)) else {
            info!("No backup found in durable storage");
            return Ok(RestoreOutcome::NothingToRestore);
        };
        let remote_ts = marker_timestamp(&remote).unwrap_or_default().to_string();

        let Some(local_marker) = self.local_marker_path() else {
            return Ok(RestoreOutcome::NothingToRestore);
        };
        if let Some(local) = self.read_marker(&local_marker).await? {
            if let Some(local_ts) = marker_timestamp(&local) {
                // ISO-8601 UTC timestamps order lexicographically
                if local_ts >= remote_ts.as_str() {
                    debug!(local_ts, remote_ts, "Local state is current");
                    return Ok(RestoreOutcome::NothingToRestore);
                }
            }
        }

        let mut steps: Vec<String> = self
            .config
            .paths
            .iter()
            .map(|p| {
                let from = format!("{}/", self.remote_dir(p).trim_end_matches('/'));
                format!(
                    "mkdir -p {local} && if [ -d {from} ]; then {copy}; fi",
                    local = shell_words::quote(&p.local),
                    from = shell_words::quote(&from),
                    copy = self.copy_command(&from, &p.local, &[], false),
                )
            })
            .collect();
        steps.push(format!(
            "cp {} {}",
            shell_words::quote(&self.config.marker_path()),
            shell_words::quote(&local_marker)
        ));
        let script = steps.join(" && ");

        info!(backup = %remote_ts, "Restoring state from durable storage");
        let output = self.sandbox.exec(&script, &BTreeMap::new()).await?;
        debug!(exit_code = ?output.exit_code, "Restore command finished");

        match self.read_marker(&local_marker).await? {
            Some(local) if local == remote => {
                info!(backup = %remote_ts, "Restore complete");
                Ok(RestoreOutcome::Restored(remote_ts))
            }
            _ => Err(StorageError::Sync(format!(
                "restore did not complete: {}",
                output.stderr.trim()
            ))),
        }
    }

    /// Recursive copy without timestamp preservation; the bucket filesystem
    /// cannot set modification times.
    fn copy_command(&self, from: &str, to: &str, exclude: &[String], delete: bool) -> String {
        let mut cmd = String::from("rsync -r --no-times");
        if delete {
            cmd.push_str(" --delete");
        }
        cmd.push_str(&format!(
            " --exclude={}",
            shell_words::quote(&self.config.marker_file)
        ));
        for pattern in exclude {
            cmd.push_str(&format!(" --exclude={}", shell_words::quote(pattern)));
        }
        cmd.push_str(&format!(" {} {}", shell_words::quote(from), shell_words::quote(to)));
        cmd
    }

    pub async fn status(&self) -> StorageStatus {
        let configured = self.config.is_configured();
        let mounted = if configured {
            self.is_mounted().await.unwrap_or(false)
        } else {
            false
        };
        let last_sync = if mounted {
            self.last_sync().await.ok().flatten()
        } else {
            None
        };
        StorageStatus {
            configured,
            mounted,
            mount_path: self.config.mount_path.clone(),
            last_sync,
            syncing: self.is_syncing(),
        }
    }

    /// Scheduled backup loop. Failures are logged and retried on the next tick.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = self.config.sync_interval();
        info!(interval_secs = interval.as_secs(), "Storage sync scheduler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.sync_out().await {
                        Ok(timestamp) => debug!(timestamp, "Scheduled sync succeeded"),
                        Err(StorageError::SyncInProgress) => {
                            debug!("Scheduled sync skipped, another sync is running");
                        }
                        Err(StorageError::Mount(e)) => {
                            error!(error = %e, "Durable storage unavailable, state is not being backed up");
                        }
                        Err(e) => warn!(error = %e, "Scheduled sync failed, retrying next interval"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Storage sync scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{ExecOutput, LocalSandbox, ProcessInfo, ProcessLogs, Sandbox};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Runs real shell commands, but fakes the mount table, the FUSE mount
    /// and the copy tool.
    struct FakeStorageSandbox {
        shell: Arc<LocalSandbox>,
        mount_path: String,
        mounted: AtomicBool,
        mount_works: bool,
        copy_fails: bool,
        copy_delay: Duration,
        commands: Mutex<Vec<String>>,
    }

    impl FakeStorageSandbox {
        fn new(mount_path: &str, mounted: bool, mount_works: bool) -> Arc<Self> {
            Arc::new(Self {
                shell: LocalSandbox::new(),
                mount_path: mount_path.to_string(),
                mounted: AtomicBool::new(mounted),
                mount_works,
                copy_fails: false,
                copy_delay: Duration::from_millis(0),
                commands: Mutex::new(Vec::new()),
            })
        }

        fn with_delay(mut self: Arc<Self>, delay: Duration) -> Arc<Self> {
            Arc::get_mut(&mut self).expect("unshared").copy_delay = delay;
            self
        }

        fn with_failing_copy(mut self: Arc<Self>) -> Arc<Self> {
            Arc::get_mut(&mut self).expect("unshared").copy_fails = true;
            self
        }

        fn count(&self, needle: &str) -> usize {
            self.commands.lock().iter().filter(|c| c.contains(needle)).count()
        }
    }

    #[async_trait]
    impl Sandbox for FakeStorageSandbox {
        async fn list_processes(&self) -> Result<Vec<ProcessInfo>, SandboxError> {
            Ok(Vec::new())
        }

        async fn start_process(
            &self,
            _command: &str,
            _env: &BTreeMap<String, String>,
        ) -> Result<ProcessInfo, SandboxError> {
            Err(SandboxError::Spawn("not supported".to_string()))
        }

        async fn exec(
            &self,
            command: &str,
            env: &BTreeMap<String, String>,
        ) -> Result<ExecOutput, SandboxError> {
            self.commands.lock().push(command.to_string());

            if command == "mount" {
                let mut table = String::from("proc on /proc type proc (rw,nosuid)\n");
                if self.mounted.load(Ordering::SeqCst) {
                    table.push_str(&format!(
                        "s3fs on {} type fuse.s3fs (rw,nosuid,nodev)\n",
                        self.mount_path
                    ));
                }
                return Ok(ExecOutput {
                    stdout: table,
                    ..Default::default()
                });
            }

            if command.starts_with("s3fs ") {
                assert!(env.contains_key("AWS_ACCESS_KEY_ID"));
                if self.mount_works {
                    self.mounted.store(true, Ordering::SeqCst);
                }
                // Exit status is deliberately unhelpful either way
                return Ok(ExecOutput {
                    stdout: String::new(),
                    stderr: "s3fs: mountpoint is not empty".to_string(),
                    exit_code: Some(1),
                });
            }

            if command.contains("rsync ") {
                tokio::time::sleep(self.copy_delay).await;
                let stand_in = if self.copy_fails { "false " } else { "true " };
                return self.shell.exec(&command.replace("rsync ", stand_in), env).await;
            }

            self.shell.exec(command, env).await
        }

        async fn logs(&self, _id: &str) -> Result<ProcessLogs, SandboxError> {
            Ok(ProcessLogs::default())
        }

        async fn kill(&self, _id: &str) -> Result<(), SandboxError> {
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        config: StorageConfig,
    }

    fn fixture(with_source: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_string_lossy().to_string();
        let local = format!("{}/state/", root);
        std::fs::create_dir_all(&local).unwrap();
        std::fs::create_dir_all(format!("{}/mnt", root)).unwrap();
        if with_source {
            std::fs::write(format!("{}config.json", local), "{}").unwrap();
        }

        let config = StorageConfig {
            bucket: Some("backups".to_string()),
            endpoint: Some("https://acct.r2.cloudflarestorage.com".to_string()),
            mount_path: format!("{}/mnt", root),
            paths: vec![SyncPath {
                local,
                remote: "state/".to_string(),
                required_file: Some("config.json".to_string()),
                exclude: vec!["*.lock".to_string()],
            }],
            access_key_id: Some("id".to_string()),
            secret_access_key: Some("secret".to_string()),
            ..StorageConfig::default()
        };
        Fixture { _dir: dir, config }
    }

    #[test]
    fn test_marker_validation() {
        assert!(is_valid_marker("2026-10-19T10:00:00Z abc"));
        assert!(is_valid_marker("2026-01-02\n"));
        assert!(!is_valid_marker(""));
        assert!(!is_valid_marker("Mon Oct 19 2026"));
        assert!(!is_valid_marker("2026-13-40T00:00:00Z"));
        assert_eq!(marker_timestamp("2026-10-19T10:00:00Z abc"), Some("2026-10-19T10:00:00Z"));
    }

    #[tokio::test]
    async fn test_mount_verified_by_mount_table() {
        let fx = fixture(true);
        let sandbox = FakeStorageSandbox::new(&fx.config.mount_path, false, true);
        let manager = StorageManager::new(fx.config.clone(), sandbox.clone());

        // s3fs exits 1 but the mount table shows the mount
        assert_eq!(manager.mount().await.unwrap(), MountOutcome::Mounted);
        assert_eq!(manager.mount().await.unwrap(), MountOutcome::AlreadyMounted);
        assert_eq!(sandbox.count("s3fs "), 1);
    }

    #[tokio::test]
    async fn test_mount_failure_reported() {
        let fx = fixture(true);
        let sandbox = FakeStorageSandbox::new(&fx.config.mount_path, false, false);
        let manager = StorageManager::new(fx.config.clone(), sandbox);

        let err = manager.mount().await.unwrap_err();
        assert!(matches!(err, StorageError::Mount(_)));
    }

    #[tokio::test]
    async fn test_unconfigured_storage() {
        let sandbox = FakeStorageSandbox::new("/data/moltbot", false, true);
        let manager = StorageManager::new(StorageConfig::default(), sandbox);
        assert_eq!(manager.mount().await.unwrap_err(), StorageError::NotConfigured);
        assert_eq!(manager.sync_out().await.unwrap_err(), StorageError::NotConfigured);
        assert!(!manager.status().await.configured);
    }

    #[tokio::test]
    async fn test_restore_then_sync_then_mount() {
        let fx = fixture(true);
        let sandbox = FakeStorageSandbox::new(&fx.config.mount_path, false, true);
        let manager = StorageManager::new(fx.config.clone(), sandbox);

        assert_eq!(manager.restore_in().await.unwrap(), RestoreOutcome::NothingToRestore);

        let ts = manager.sync_out().await.unwrap();
        assert!(is_valid_marker(&ts));

        let marker = std::fs::read_to_string(fx.config.marker_path()).unwrap();
        assert!(is_valid_marker(&marker));
        assert!(marker.starts_with(&ts));

        assert_eq!(manager.mount().await.unwrap(), MountOutcome::AlreadyMounted);
        assert_eq!(manager.last_sync().await.unwrap(), Some(ts));
    }

    #[tokio::test]
    async fn test_restore_copies_newer_backup_marker() {
        let fx = fixture(true);
        std::fs::write(fx.config.marker_path(), "2026-10-19T08:00:00Z previous\n").unwrap();
        let local_marker = format!("{}.last-sync", fx.config.paths[0].local);
        std::fs::write(&local_marker, "2026-10-18T08:00:00Z older\n").unwrap();

        let sandbox = FakeStorageSandbox::new(&fx.config.mount_path, true, true);
        let manager = StorageManager::new(fx.config.clone(), sandbox.clone());

        assert_eq!(
            manager.restore_in().await.unwrap(),
            RestoreOutcome::Restored("2026-10-19T08:00:00Z".to_string())
        );
        let copied = std::fs::read_to_string(&local_marker).unwrap();
        assert!(copied.starts_with("2026-10-19T08:00:00Z"));
        // Restore never deletes local files
        assert!(!sandbox.commands.lock().iter().any(|c| c.contains("--delete")));

        // Second restore sees local state as current
        assert_eq!(manager.restore_in().await.unwrap(), RestoreOutcome::NothingToRestore);
    }

    #[tokio::test]
    async fn test_restore_after_own_sync_keeps_local_state() {
        let fx = fixture(true);
        let sandbox = FakeStorageSandbox::new(&fx.config.mount_path, true, true);
        let manager = StorageManager::new(fx.config.clone(), sandbox.clone());

        assert_eq!(manager.restore_in().await.unwrap(), RestoreOutcome::NothingToRestore);
        let ts = manager.sync_out().await.unwrap();

        let local_marker = format!("{}.last-sync", fx.config.paths[0].local);
        let local = std::fs::read_to_string(&local_marker).unwrap();
        assert!(local.starts_with(&ts));

        // Gateway restart within the same sandbox
        assert_eq!(manager.restore_in().await.unwrap(), RestoreOutcome::NothingToRestore);

        // A fresh manager sees the local marker as current
        let reopened = StorageManager::new(fx.config.clone(), sandbox.clone());
        assert_eq!(reopened.restore_in().await.unwrap(), RestoreOutcome::NothingToRestore);

        assert_eq!(sandbox.count("if [ -d "), 0);
    }

    #[tokio::test]
    async fn test_failed_restore_is_retried() {
        let fx = fixture(true);
        let sandbox = FakeStorageSandbox::new(&fx.config.mount_path, false, false);
        let manager = StorageManager::new(fx.config.clone(), sandbox);

        assert!(matches!(manager.restore_in().await, Err(StorageError::Mount(_))));
        assert!(!manager.restored.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_sync_requires_source_config() {
        let fx = fixture(false);
        let sandbox = FakeStorageSandbox::new(&fx.config.mount_path, true, true);
        let manager = StorageManager::new(fx.config.clone(), sandbox.clone());

        let err = manager.sync_out().await.unwrap_err();
        assert!(matches!(err, StorageError::MissingSource(_)));
        assert_eq!(sandbox.count("rsync"), 0);
    }

    #[tokio::test]
    async fn test_sync_without_mount_is_mount_error_and_not_destructive() {
        let fx = fixture(true);
        let sandbox = FakeStorageSandbox::new(&fx.config.mount_path, false, false);
        let manager = StorageManager::new(fx.config.clone(), sandbox.clone());
        std::fs::write(format!("{}/keep.txt", fx.config.mount_path), "data").unwrap();

        let err = manager.sync_out().await.unwrap_err();
        assert!(matches!(err, StorageError::Mount(_)));
        assert_eq!(sandbox.count("rsync"), 0);
        assert!(!sandbox.commands.lock().iter().any(|c| c.starts_with("rm ")));
        assert!(std::path::Path::new(&format!("{}/keep.txt", fx.config.mount_path)).exists());
        assert!(!manager.is_syncing());
    }

    #[tokio::test]
    async fn test_concurrent_sync_rejected() {
        let fx = fixture(true);
        let sandbox = FakeStorageSandbox::new(&fx.config.mount_path, true, true)
            .with_delay(Duration::from_millis(300));
        let manager = StorageManager::new(fx.config.clone(), sandbox.clone());

        let first = {
            let m = Arc::clone(&manager);
            tokio::spawn(async move { m.sync_out().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.is_syncing());

        let second = manager.sync_out().await;
        assert_eq!(second.unwrap_err(), StorageError::SyncInProgress);

        assert!(first.await.unwrap().is_ok());
        assert_eq!(sandbox.count("rsync"), 1);
        assert!(!manager.is_syncing());
    }

    #[tokio::test]
    async fn test_stale_marker_is_not_success() {
        let fx = fixture(true);
        std::fs::write(fx.config.marker_path(), "2026-10-01T00:00:00Z stale\n").unwrap();

        let sandbox = FakeStorageSandbox::new(&fx.config.mount_path, true, true).with_failing_copy();
        let manager = StorageManager::new(fx.config.clone(), sandbox);

        let err = manager.sync_out().await.unwrap_err();
        assert!(matches!(err, StorageError::Sync(_)));
        // The previous backup is left alone
        let marker = std::fs::read_to_string(fx.config.marker_path()).unwrap();
        assert!(marker.contains("stale"));
    }

    #[tokio::test]
    async fn test_status_reports_mount_and_last_sync() {
        let fx = fixture(true);
        std::fs::write(fx.config.marker_path(), "2026-10-19T08:00:00Z id\n").unwrap();
        let sandbox = FakeStorageSandbox::new(&fx.config.mount_path, true, true);
        let manager = StorageManager::new(fx.config.clone(), sandbox);

        let status = manager.status().await;
        assert!(status.configured);
        assert!(status.mounted);
        assert!(!status.syncing);
        assert_eq!(status.last_sync.as_deref(), Some("2026-10-19T08:00:00Z"));
    }
}
