use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sandgate::admin::{PKG_NAME, VERSION};
use sandgate::auth::AuthGate;
use sandgate::cdp::{HttpBrowser, SharedBrowser};
use sandgate::config::{Config, SandboxKind};
use sandgate::docker::DockerSandbox;
use sandgate::proxy::{GatewayState, ProxyServer};
use sandgate::sandbox::{LocalSandbox, SharedSandbox};
use sandgate::storage::StorageManager;
use sandgate::supervisor::GatewaySupervisor;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sandgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("sandgate.toml"));

    let mut config = if config_path.exists() {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    } else {
        info!(path = %config_path.display(), "No configuration file, using defaults");
        Config::default()
    };

    let record = config.external_record(std::env::vars());
    config.apply_external(&record);
    let backend_env = config.validate(&record).map_err(|e| {
        error!(missing = ?e.missing, "Refusing to start with incomplete configuration");
        anyhow::anyhow!(e)
    })?;

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sandbox: SharedSandbox = match config.sandbox.kind {
        SandboxKind::Local => LocalSandbox::new(),
        SandboxKind::Docker => {
            let container = config
                .sandbox
                .container
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("sandbox.container is required for docker sandboxes"))?;
            DockerSandbox::connect(config.sandbox.docker_host.as_deref(), container).await?
        }
    };

    let storage = StorageManager::new(config.storage.clone(), Arc::clone(&sandbox));
    let supervisor = GatewaySupervisor::new(
        Arc::clone(&sandbox),
        config.gateway.clone(),
        backend_env,
        config.storage.is_configured().then(|| Arc::clone(&storage)),
    );
    let auth = AuthGate::new(config.auth.clone());

    let browser: Option<SharedBrowser> = match &config.cdp.endpoint {
        Some(endpoint) => {
            let browser: SharedBrowser = HttpBrowser::new(endpoint, config.cdp.api_token.clone())?;
            Some(browser)
        }
        None => None,
    };

    let tls_acceptor = if config.server.tls_enabled() {
        let (cert_path, key_path) = match (&config.server.tls_cert, &config.server.tls_key) {
            (Some(cert), Some(key)) => (cert.clone(), key.clone()),
            _ => anyhow::bail!("server.tls_cert and server.tls_key must be set together"),
        };
        let certs = load_certs(&cert_path)?;
        let key = load_key(&key_path)?;
        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;
        info!(cert = %cert_path, key = %key_path, "TLS enabled");
        Some(TlsAcceptor::from(Arc::new(tls_config)))
    } else {
        None
    };

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let storage_task = if config.storage.is_configured() {
        let storage = Arc::clone(&storage);
        let shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move { storage.run(shutdown).await }))
    } else {
        None
    };

    let state = GatewayState::new(config, Arc::clone(&supervisor), storage, auth, browser);
    let mut server = ProxyServer::new(bind_addr, state, shutdown_rx.clone());
    if let Some(acceptor) = tls_acceptor {
        server = server.with_tls(acceptor);
    }
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Warm the gateway so the first request doesn't pay for startup
    supervisor.start_in_background();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    // The gateway keeps running in the sandbox; only our tasks stop
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = server_handle.await;
        if let Some(handle) = storage_task {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway front");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        tls = config.server.tls_enabled(),
        debug_routes = config.server.debug_routes,
        "Server configuration"
    );
    info!(
        sandbox = ?config.sandbox.kind,
        container = ?config.sandbox.container,
        "Sandbox"
    );
    info!(
        command = %config.gateway.command,
        port = config.gateway.port,
        startup_timeout_secs = config.gateway.startup_timeout_secs,
        health_check_interval_ms = config.gateway.health_check_interval_ms,
        "Gateway settings"
    );
    if config.storage.is_configured() {
        info!(
            mount_path = %config.storage.mount_path,
            sync_interval_secs = config.storage.sync_interval_secs,
            paths = config.storage.paths.len(),
            "Durable storage enabled"
        );
    } else {
        warn!("Durable storage is not configured; gateway state will be lost when the sandbox restarts");
    }
    if config.auth.dev_mode {
        warn!("DEV_MODE is on: identity checks are bypassed");
    } else {
        info!(team_domain = ?config.auth.team_domain, "Identity verification enabled");
    }
    info!(
        cdp = config.cdp.endpoint.is_some(),
        gateway_token = config.auth.gateway_token.is_some(),
        "Optional features"
    );
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }

    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("No private key found in {}", path)
}
