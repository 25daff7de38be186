use crate::env::{build_backend_env, BackendEnv, ExternalConfig, MissingConfiguration};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the service
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Inbound listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Where the gateway process lives
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// How the gateway process is launched and probed
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Durable storage mount and sync
    #[serde(default)]
    pub storage: StorageConfig,

    /// Identity verification
    #[serde(default)]
    pub auth: AuthSettings,

    /// Remote browser capability behind the CDP shim
    #[serde(default)]
    pub cdp: CdpConfig,

    /// Extra entries for the external configuration record.
    /// Process environment variables take precedence over these.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,

    /// Expose the /debug routes (default: false)
    #[serde(default)]
    pub debug_routes: bool,

    /// Path of the device-approval UI that pairing redirects point at
    #[serde(default = "default_admin_ui_path")]
    pub admin_ui_path: String,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            tls_cert: None,
            tls_key: None,
            debug_routes: false,
            admin_ui_path: default_admin_ui_path(),
        }
    }
}

/// Sandbox runtime flavour
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    /// Processes run as children of this service (default)
    #[default]
    Local,
    /// Processes run as exec instances inside an existing container
    Docker,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SandboxConfig {
    #[serde(default)]
    pub kind: SandboxKind,

    /// Container name or id (docker only)
    pub container: Option<String>,

    /// Docker host URL (default: DOCKER_HOST or the platform socket)
    pub docker_host: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Launch command, without the flags this service appends
    #[serde(default = "default_gateway_command")]
    pub command: String,

    /// Port the gateway listens on
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Host used to reach the gateway port
    #[serde(default = "default_gateway_host")]
    pub host: String,

    /// Value for the gateway's `--bind` flag
    #[serde(default = "default_bind_mode")]
    pub bind_mode: String,

    /// Substrings identifying an already running gateway in the process list
    #[serde(default = "default_process_signatures")]
    pub process_signatures: Vec<String>,

    /// Gateway CLI used for device management
    #[serde(default = "default_cli")]
    pub cli: String,

    /// Startup timeout in seconds
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Health probe interval while starting, in milliseconds
    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,
}

impl GatewayConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Local WebSocket URL passed to every CLI invocation
    pub fn ws_url(&self) -> String {
        format!("ws://localhost:{}", self.port)
    }

    /// Full launch command line
    pub fn launch_command(&self) -> String {
        format!(
            "{} --port {} --verbose --allow-unconfigured --bind {}",
            self.command,
            self.port,
            shell_words::quote(&self.bind_mode)
        )
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            command: default_gateway_command(),
            port: default_gateway_port(),
            host: default_gateway_host(),
            bind_mode: default_bind_mode(),
            process_signatures: default_process_signatures(),
            cli: default_cli(),
            startup_timeout_secs: default_startup_timeout(),
            health_check_interval_ms: default_health_interval(),
        }
    }
}

/// One directory tree kept in durable storage
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SyncPath {
    /// Directory inside the sandbox (trailing slash: copy contents)
    pub local: String,

    /// Directory relative to the mount root
    pub remote: String,

    /// File that must exist in `local` before it may overwrite the backup
    pub required_file: Option<String>,

    /// rsync exclude patterns
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Bucket name. Storage is disabled when unset.
    pub bucket: Option<String>,

    /// S3-compatible endpoint URL
    pub endpoint: Option<String>,

    /// Mount target inside the sandbox
    #[serde(default = "default_mount_path")]
    pub mount_path: String,

    /// Filesystem type string identifying the mount in the mount table
    #[serde(default = "default_mount_signature")]
    pub mount_signature: String,

    /// Marker file name at the mount root
    #[serde(default = "default_marker_file")]
    pub marker_file: String,

    /// Scheduled sync interval in seconds
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// Trees to keep in storage
    #[serde(default = "default_sync_paths")]
    pub paths: Vec<SyncPath>,

    /// Access key id (filled from R2_ACCESS_KEY_ID)
    #[serde(skip)]
    pub access_key_id: Option<String>,

    /// Secret access key (filled from R2_SECRET_ACCESS_KEY)
    #[serde(skip)]
    pub secret_access_key: Option<String>,
}

impl StorageConfig {
    /// Storage is usable only with a bucket, an endpoint and credentials
    pub fn is_configured(&self) -> bool {
        self.bucket.is_some()
            && self.endpoint.is_some()
            && self.access_key_id.is_some()
            && self.secret_access_key.is_some()
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn marker_path(&self) -> String {
        format!("{}/{}", self.mount_path.trim_end_matches('/'), self.marker_file)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            endpoint: None,
            mount_path: default_mount_path(),
            mount_signature: default_mount_signature(),
            marker_file: default_marker_file(),
            sync_interval_secs: default_sync_interval(),
            paths: default_sync_paths(),
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
    /// Identity provider team domain (e.g. `myteam.cloudflareaccess.com`)
    pub team_domain: Option<String>,

    /// Required `aud` claim
    pub audience: Option<String>,

    /// Header carrying the signed identity token
    #[serde(default = "default_jwt_header")]
    pub jwt_header: String,

    /// Cookie carrying the signed identity token
    #[serde(default = "default_jwt_cookie")]
    pub jwt_cookie: String,

    /// Opt-in that allows DEV_MODE to bypass identity verification
    #[serde(default)]
    pub allow_dev_mode: bool,

    /// Effective dev mode (DEV_MODE=true and allow_dev_mode)
    #[serde(skip)]
    pub dev_mode: bool,

    /// Shared gateway token (filled from MOLTBOT_GATEWAY_TOKEN)
    #[serde(skip)]
    pub gateway_token: Option<String>,

    /// CDP shared secret (filled from CDP_SECRET)
    #[serde(skip)]
    pub cdp_secret: Option<String>,
}

impl AuthSettings {
    /// URL of the identity provider's published key set
    pub fn jwks_url(&self) -> Option<String> {
        self.team_domain
            .as_ref()
            .map(|d| format!("https://{}/cdn-cgi/access/certs", d.trim_end_matches('/')))
    }

    /// Expected `iss` claim
    pub fn issuer(&self) -> Option<String> {
        self.team_domain
            .as_ref()
            .map(|d| format!("https://{}", d.trim_end_matches('/')))
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            team_domain: None,
            audience: None,
            jwt_header: default_jwt_header(),
            jwt_cookie: default_jwt_cookie(),
            allow_dev_mode: false,
            dev_mode: false,
            gateway_token: None,
            cdp_secret: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CdpConfig {
    /// Base URL of the remote browser capability. The shim is disabled when unset.
    pub endpoint: Option<String>,

    /// Bearer token for the remote browser (filled from BROWSER_API_TOKEN)
    #[serde(skip)]
    pub api_token: Option<String>,
}

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_ui_path() -> String {
    "/_admin/".to_string()
}

fn default_gateway_command() -> String {
    "clawdbot gateway".to_string()
}

fn default_gateway_port() -> u16 {
    18789
}

fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_mode() -> String {
    "lan".to_string()
}

fn default_process_signatures() -> Vec<String> {
    vec!["start-moltbot.sh".to_string(), "clawdbot gateway".to_string()]
}

fn default_cli() -> String {
    "clawdbot".to_string()
}

fn default_startup_timeout() -> u64 {
    180
}

fn default_health_interval() -> u64 {
    500
}

fn default_mount_path() -> String {
    "/data/moltbot".to_string()
}

fn default_mount_signature() -> String {
    "s3fs".to_string()
}

fn default_marker_file() -> String {
    ".last-sync".to_string()
}

fn default_sync_interval() -> u64 {
    300 // 5 minutes
}

fn default_sync_paths() -> Vec<SyncPath> {
    vec![
        SyncPath {
            local: "/root/.clawdbot/".to_string(),
            remote: "clawdbot/".to_string(),
            required_file: Some("clawdbot.json".to_string()),
            exclude: vec!["*.lock".to_string(), "*.log".to_string(), "*.tmp".to_string()],
        },
        SyncPath {
            local: "/root/clawd/skills/".to_string(),
            remote: "skills/".to_string(),
            required_file: None,
            exclude: Vec::new(),
        },
    ]
}

fn default_jwt_header() -> String {
    "cf-access-jwt-assertion".to_string()
}

fn default_jwt_cookie() -> String {
    "CF_Authorization".to_string()
}

fn lookup(record: &ExternalConfig, key: &str) -> Option<String> {
    record
        .get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn is_truthy(value: Option<&String>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("true") | Some("1") | Some("yes")
    )
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge the `[env]` table under the given environment variables
    pub fn external_record(&self, vars: impl IntoIterator<Item = (String, String)>) -> ExternalConfig {
        let mut record: ExternalConfig = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        record.extend(vars);
        record
    }

    /// Fill secret fields from the external configuration record
    pub fn apply_external(&mut self, record: &ExternalConfig) {
        self.auth.gateway_token = lookup(record, "MOLTBOT_GATEWAY_TOKEN");
        self.auth.cdp_secret = lookup(record, "CDP_SECRET");
        if let Some(domain) = lookup(record, "CF_ACCESS_TEAM_DOMAIN") {
            self.auth.team_domain = Some(domain);
        }
        if let Some(aud) = lookup(record, "CF_ACCESS_AUD") {
            self.auth.audience = Some(aud);
        }
        self.auth.dev_mode = self.auth.allow_dev_mode && is_truthy(record.get("DEV_MODE"));

        self.storage.access_key_id = lookup(record, "R2_ACCESS_KEY_ID");
        self.storage.secret_access_key = lookup(record, "R2_SECRET_ACCESS_KEY");
        if self.storage.endpoint.is_none() {
            if let Some(account) = lookup(record, "CF_ACCOUNT_ID") {
                self.storage.endpoint = Some(format!("https://{}.r2.cloudflarestorage.com", account));
            }
        }

        self.cdp.api_token = lookup(record, "BROWSER_API_TOKEN");
    }

    /// Validate everything needed to serve and build the gateway environment.
    ///
    /// All problems are collected so operators see the full list at once.
    pub fn validate(&self, record: &ExternalConfig) -> Result<BackendEnv, MissingConfiguration> {
        let mut missing = Vec::new();

        if !self.auth.dev_mode {
            if self.auth.team_domain.is_none() {
                missing.push("CF_ACCESS_TEAM_DOMAIN".to_string());
            }
            if self.auth.audience.is_none() {
                missing.push("CF_ACCESS_AUD".to_string());
            }
        }

        if self.sandbox.kind == SandboxKind::Docker && self.sandbox.container.is_none() {
            missing.push("sandbox.container".to_string());
        }

        let env = build_backend_env(record, !self.auth.dev_mode);
        match env {
            Ok(env) if missing.is_empty() => Ok(env),
            Ok(_) => Err(MissingConfiguration { missing }),
            Err(e) => {
                // Keep the environment builder's keys first
                let mut all = e.missing;
                all.extend(missing);
                Err(MissingConfiguration { missing: all })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> ExternalConfig {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 9000
bind = "127.0.0.1"
debug_routes = true

[gateway]
command = "/usr/local/bin/gateway run"
port = 19000
startup_timeout_secs = 60

[storage]
bucket = "backups"
endpoint = "https://acct.r2.cloudflarestorage.com"
sync_interval_secs = 60

[[storage.paths]]
local = "/srv/state/"
remote = "state/"
exclude = ["*.sock"]

[auth]
team_domain = "team.example.com"
audience = "aud-123"

[env]
ANTHROPIC_API_KEY = "from-file"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.server.port, 9000);
        assert!(config.server.debug_routes);
        assert_eq!(config.gateway.port, 19000);
        assert_eq!(config.gateway.startup_timeout(), Duration::from_secs(60));
        assert_eq!(config.storage.bucket.as_deref(), Some("backups"));
        assert_eq!(config.storage.paths.len(), 1);
        assert_eq!(config.storage.paths[0].exclude, vec!["*.sock"]);
        assert_eq!(config.auth.audience.as_deref(), Some("aud-123"));
        assert_eq!(config.env.get("ANTHROPIC_API_KEY").map(String::as_str), Some("from-file"));
    }

    #[test]
    fn test_empty_config_defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.admin_ui_path, "/_admin/");
        assert_eq!(config.sandbox.kind, SandboxKind::Local);
        assert_eq!(config.gateway.port, 18789);
        assert_eq!(config.gateway.startup_timeout(), Duration::from_secs(180));
        assert_eq!(config.gateway.health_check_interval(), Duration::from_millis(500));
        assert_eq!(config.storage.sync_interval(), Duration::from_secs(300));
        assert_eq!(config.storage.marker_path(), "/data/moltbot/.last-sync");
        assert_eq!(config.storage.paths.len(), 2);
        assert!(!config.storage.is_configured());
        assert!(!config.auth.allow_dev_mode);
        assert!(config.cdp.endpoint.is_none());
    }

    #[test]
    fn test_launch_command_flags() {
        let gateway = GatewayConfig::default();
        let cmd = gateway.launch_command();
        assert!(cmd.starts_with("clawdbot gateway --port 18789"));
        assert!(cmd.contains("--allow-unconfigured"));
        assert!(cmd.contains("--bind lan"));
        assert_eq!(gateway.ws_url(), "ws://localhost:18789");
    }

    #[test]
    fn test_env_overrides_file_table() {
        let config: Config = toml::from_str("[env]\nA = \"file\"\nB = \"file\"\n").unwrap();
        let record = config.external_record(vec![("A".to_string(), "process".to_string())]);
        assert_eq!(record.get("A").map(String::as_str), Some("process"));
        assert_eq!(record.get("B").map(String::as_str), Some("file"));
    }

    #[test]
    fn test_dev_mode_requires_opt_in() {
        let mut config = Config::default();
        config.apply_external(&record(&[("DEV_MODE", "true")]));
        assert!(!config.auth.dev_mode);

        config.auth.allow_dev_mode = true;
        config.apply_external(&record(&[("DEV_MODE", "true")]));
        assert!(config.auth.dev_mode);

        config.apply_external(&record(&[("DEV_MODE", "false")]));
        assert!(!config.auth.dev_mode);
    }

    #[test]
    fn test_apply_external_fills_secrets() {
        let mut config = Config::default();
        config.storage.bucket = Some("b".to_string());
        config.apply_external(&record(&[
            ("MOLTBOT_GATEWAY_TOKEN", "gw"),
            ("CDP_SECRET", "cdp"),
            ("CF_ACCESS_TEAM_DOMAIN", "team.example.com"),
            ("CF_ACCESS_AUD", "aud"),
            ("R2_ACCESS_KEY_ID", "id"),
            ("R2_SECRET_ACCESS_KEY", "secret"),
            ("CF_ACCOUNT_ID", "acct"),
        ]));

        assert_eq!(config.auth.gateway_token.as_deref(), Some("gw"));
        assert_eq!(config.auth.cdp_secret.as_deref(), Some("cdp"));
        assert_eq!(
            config.auth.jwks_url().as_deref(),
            Some("https://team.example.com/cdn-cgi/access/certs")
        );
        assert_eq!(config.auth.issuer().as_deref(), Some("https://team.example.com"));
        assert_eq!(
            config.storage.endpoint.as_deref(),
            Some("https://acct.r2.cloudflarestorage.com")
        );
        assert!(config.storage.is_configured());
    }

    #[test]
    fn test_validate_lists_every_missing_key() {
        let mut config = Config::default();
        let rec = ExternalConfig::new();
        config.apply_external(&rec);

        let err = config.validate(&rec).unwrap_err();
        assert_eq!(
            err.missing,
            vec![
                "AI_GATEWAY_API_KEY|ANTHROPIC_API_KEY|OPENAI_API_KEY",
                "MOLTBOT_GATEWAY_TOKEN",
                "CF_ACCESS_TEAM_DOMAIN",
                "CF_ACCESS_AUD",
            ]
        );
    }

    #[test]
    fn test_validate_docker_requires_container() {
        let mut config: Config = toml::from_str("[sandbox]\nkind = \"docker\"\n").unwrap();
        config.auth.allow_dev_mode = true;
        let rec = record(&[("DEV_MODE", "true"), ("ANTHROPIC_API_KEY", "k")]);
        config.apply_external(&rec);

        let err = config.validate(&rec).unwrap_err();
        assert_eq!(err.missing, vec!["sandbox.container"]);
    }

    #[test]
    fn test_validate_ok_in_dev_mode() {
        let mut config = Config::default();
        config.auth.allow_dev_mode = true;
        let rec = record(&[("DEV_MODE", "1"), ("OPENAI_API_KEY", "k")]);
        config.apply_external(&rec);

        let env = config.validate(&rec).unwrap();
        assert_eq!(env.get("OPENAI_API_KEY").map(String::as_str), Some("k"));
    }
}
