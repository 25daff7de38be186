//! Device pairing relay
//!
//! Pairing state belongs to the gateway. This module only runs the gateway
//! CLI inside the sandbox and reports what it says.

use crate::config::GatewayConfig;
use crate::sandbox::{ExecOutput, SandboxError, SharedSandbox};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("device list output was not JSON: {0}")]
    Parse(String),
    #[error("invalid request id: {0}")]
    InvalidId(String),
}

/// Pending pairing requests and paired devices, as reported by the CLI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceList {
    #[serde(default)]
    pub pending: Vec<Value>,
    #[serde(default)]
    pub paired: Vec<Value>,
}

impl DeviceList {
    /// Request ids of pending pairings
    pub fn pending_ids(&self) -> Vec<String> {
        self.pending
            .iter()
            .filter_map(|req| {
                req.get("requestId")
                    .or_else(|| req.get("id"))
                    .and_then(Value::as_str)
                    .map(String::from)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveResult {
    pub request_id: String,
    pub success: bool,
    pub output: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApproveAllResult {
    pub approved: Vec<String>,
    pub failed: Vec<ApproveResult>,
}

/// Words that negate a following "approved"
const NEGATIONS: &[&str] = &["not", "never", "no", "cannot", "isn", "wasn"];

/// Approval is detected from CLI output, not from the exit code: the word
/// "approved" must appear without a negation in the two words before it.
pub fn is_approved(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    words.iter().enumerate().any(|(i, word)| {
        *word == "approved"
            && !words[i.saturating_sub(2)..i]
                .iter()
                .any(|prev| NEGATIONS.contains(prev))
    })
}

/// Extract the JSON document from CLI output that may start with log lines
fn parse_list(stdout: &str) -> Result<DeviceList, DeviceError> {
    let start = stdout
        .find('{')
        .ok_or_else(|| DeviceError::Parse(stdout.chars().take(200).collect()))?;
    let mut stream = serde_json::Deserializer::from_str(&stdout[start..]).into_iter::<DeviceList>();
    match stream.next() {
        Some(Ok(list)) => Ok(list),
        Some(Err(e)) => Err(DeviceError::Parse(e.to_string())),
        None => Err(DeviceError::Parse("empty output".to_string())),
    }
}

fn valid_request_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

pub struct DeviceRelay {
    sandbox: SharedSandbox,
    cli: String,
    ws_url: String,
    token: Option<String>,
    env: BTreeMap<String, String>,
}

impl DeviceRelay {
    pub fn new(sandbox: SharedSandbox, gateway: &GatewayConfig, token: Option<String>) -> Self {
        Self {
            sandbox,
            cli: gateway.cli.clone(),
            ws_url: gateway.ws_url(),
            token,
            env: BTreeMap::new(),
        }
    }

    fn command(&self, args: &[&str]) -> String {
        let mut parts: Vec<String> = vec![self.cli.clone()];
        parts.extend(args.iter().map(|a| shell_words::quote(a).into_owned()));
        parts.push("--url".to_string());
        parts.push(shell_words::quote(&self.ws_url).into_owned());
        if let Some(token) = &self.token {
            parts.push("--token".to_string());
            parts.push(shell_words::quote(token).into_owned());
        }
        parts.join(" ")
    }

    async fn run(&self, args: &[&str]) -> Result<ExecOutput, DeviceError> {
        Ok(self.sandbox.exec(&self.command(args), &self.env).await?)
    }

    pub async fn list(&self) -> Result<DeviceList, DeviceError> {
        let output = self.run(&["devices", "list", "--json"]).await?;
        parse_list(&output.stdout)
    }

    pub async fn approve(&self, request_id: &str) -> Result<ApproveResult, DeviceError> {
        if !valid_request_id(request_id) {
            return Err(DeviceError::InvalidId(request_id.to_string()));
        }
        let output = self.run(&["devices", "approve", request_id]).await?;
        let combined = output.combined();
        let success = is_approved(&combined);
        if success {
            info!(request_id, "Device approved");
        } else {
            warn!(request_id, exit_code = ?output.exit_code, "Device approval not confirmed");
        }
        Ok(ApproveResult {
            request_id: request_id.to_string(),
            success,
            output: combined.trim().to_string(),
        })
    }

    pub async fn approve_all(&self) -> Result<ApproveAllResult, DeviceError> {
        let list = self.list().await?;
        let mut result = ApproveAllResult {
            approved: Vec::new(),
            failed: Vec::new(),
        };
        for id in list.pending_ids() {
            match self.approve(&id).await {
                Ok(r) if r.success => result.approved.push(id),
                Ok(r) => result.failed.push(r),
                Err(e) => result.failed.push(ApproveResult {
                    request_id: id,
                    success: false,
                    output: e.to_string(),
                }),
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{ProcessInfo, ProcessLogs, Sandbox};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct CliSandbox {
        list_output: String,
        commands: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Sandbox for CliSandbox {
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
            _env: &BTreeMap<String, String>,
        ) -> Result<ExecOutput, SandboxError> {
            self.commands.lock().push(command.to_string());
            let stdout = if command.contains("devices list") {
                self.list_output.clone()
            } else if command.contains("req-bad") {
                "error: unknown request\n".to_string()
            } else {
                "Device Approved\n".to_string()
            };
            Ok(ExecOutput {
                stdout,
                stderr: String::new(),
                exit_code: Some(1),
            })
        }

        async fn logs(&self, _id: &str) -> Result<ProcessLogs, SandboxError> {
            Ok(ProcessLogs::default())
        }

        async fn kill(&self, _id: &str) -> Result<(), SandboxError> {
            Ok(())
        }
    }

    fn relay(list_output: &str, token: Option<&str>) -> (DeviceRelay, Arc<CliSandbox>) {
        let sandbox = Arc::new(CliSandbox {
            list_output: list_output.to_string(),
            commands: Mutex::new(Vec::new()),
        });
        let relay = DeviceRelay::new(
            sandbox.clone(),
            &GatewayConfig::default(),
            token.map(String::from),
        );
        (relay, sandbox)
    }

    #[test]
    fn test_is_approved() {
        assert!(is_approved("Approved device abc"));
        assert!(is_approved("request APPROVED"));
        assert!(!is_approved("error: not found"));
        assert!(!is_approved("request not approved"));
        assert!(!is_approved("device isn't approved yet"));
        assert!(!is_approved("unapproved request"));
        assert!(!is_approved("preapproved"));
        assert!(is_approved("[info] connecting\nDevice req-1 approved."));
    }

    #[tokio::test]
    async fn test_list_tolerates_log_lines() {
        let output = "[info] connecting\n{\"pending\":[{\"requestId\":\"req-1\"}],\"paired\":[{\"id\":\"d1\"}]}\n";
        let (relay, sandbox) = relay(output, Some("tok"));
        let list = relay.list().await.unwrap();
        assert_eq!(list.pending_ids(), vec!["req-1"]);
        assert_eq!(list.paired.len(), 1);

        let cmd = sandbox.commands.lock()[0].clone();
        assert_eq!(
            cmd,
            "clawdbot devices list --json --url ws://localhost:18789 --token tok"
        );
    }

    #[tokio::test]
    async fn test_list_rejects_non_json() {
        let (relay, _) = relay("gateway not reachable\n", None);
        assert!(matches!(relay.list().await, Err(DeviceError::Parse(_))));
    }

    #[tokio::test]
    async fn test_approve_uses_output_not_exit_code() {
        let (relay, _) = relay("{}", None);
        let result = relay.approve("req-1").await.unwrap();
        assert!(result.success);

        let result = relay.approve("req-bad").await.unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_approve_rejects_unsafe_id() {
        let (relay, sandbox) = relay("{}", None);
        assert!(matches!(
            relay.approve("x; rm -rf /").await,
            Err(DeviceError::InvalidId(_))
        ));
        assert!(sandbox.commands.lock().is_empty());
    }

    #[tokio::test]
    async fn test_approve_all_reports_per_id() {
        let output = r#"{"pending":[{"requestId":"req-1"},{"requestId":"req-bad"},{"requestId":"req-2"}],"paired":[]}"#;
        let (relay, _) = relay(output, None);
        let result = relay.approve_all().await.unwrap();
        assert_eq!(result.approved, vec!["req-1", "req-2"]);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].request_id, "req-bad");
    }
}
