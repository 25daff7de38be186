use crate::admin::{route_admin, route_debug, ADMIN_PREFIX, DEBUG_PREFIX, PKG_NAME, VERSION};
use crate::auth::{rejection_response, AuthDecision, AuthGate};
use crate::cdp::{self, SharedBrowser};
use crate::config::Config;
use crate::devices::DeviceRelay;
use crate::error::{json_error_response, json_response, starting_response, ErrorCode, ResponseBody};
use crate::pool::{append_query, query_param, ConnectionPool, PoolConfig};
use crate::storage::StorageManager;
use crate::supervisor::{GatewaySupervisor, SupervisorError};
use crate::ws::{proxy_websocket, RedirectTargets};
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

const HEALTH_PATH: &str = "/sandbox-health";
const STATUS_PATH: &str = "/api/status";
const CDP_PATH: &str = "/cdp";

/// Everything a request handler needs
pub struct GatewayState {
    pub config: Config,
    pub supervisor: Arc<GatewaySupervisor>,
    pub storage: Arc<StorageManager>,
    pub auth: Arc<AuthGate>,
    pub devices: DeviceRelay,
    /// Remote browser for the CDP shim, when configured
    pub browser: Option<SharedBrowser>,
    pub pool: ConnectionPool,
}

impl GatewayState {
    pub fn new(
        config: Config,
        supervisor: Arc<GatewaySupervisor>,
        storage: Arc<StorageManager>,
        auth: Arc<AuthGate>,
        browser: Option<SharedBrowser>,
    ) -> Arc<Self> {
        let devices = DeviceRelay::new(
            Arc::clone(supervisor.sandbox()),
            &config.gateway,
            config.auth.gateway_token.clone(),
        );
        Arc::new(Self {
            config,
            supervisor,
            storage,
            auth,
            devices,
            browser,
            pool: ConnectionPool::new(PoolConfig::default()),
        })
    }
}

/// Which auth regime a path falls under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    Public,
    Cdp,
    Admin,
    Debug,
    Proxy,
}

pub fn classify(path: &str) -> RouteClass {
    if path == HEALTH_PATH || path == STATUS_PATH {
        RouteClass::Public
    } else if path == CDP_PATH || path.starts_with("/cdp/") {
        RouteClass::Cdp
    } else if path.starts_with(ADMIN_PREFIX) {
        RouteClass::Admin
    } else if path.starts_with(DEBUG_PREFIX) {
        RouteClass::Debug
    } else {
        RouteClass::Proxy
    }
}

/// The public listener
pub struct ProxyServer {
    bind_addr: SocketAddr,
    state: Arc<GatewayState>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, state: Arc<GatewayState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %self.bind_addr, protocol, "Listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let tls_acceptor = self.tls_acceptor.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let tls_acceptor = tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, state, true).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, state, false).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    state: Arc<GatewayState>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr, is_tls).await }
    });

    // WebSocket upgrades ride on HTTP/1.1 connections
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    state: Arc<GatewayState>,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<ResponseBody>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Overwrite rather than append: this is the first trusted hop
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    let path = req.uri().path().to_string();
    debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let response = match classify(&path) {
        RouteClass::Public => handle_public(&path, &state).await,
        RouteClass::Cdp => handle_cdp(req, &path, &state, is_tls, request_id).await,
        RouteClass::Admin => match authenticate(&req, &state).await {
            Err(resp) => resp,
            Ok(()) => route_admin(req.method(), &path, &state)
                .await
                .unwrap_or_else(|| json_error_response(ErrorCode::NotFound, "Not found")),
        },
        RouteClass::Debug => {
            if !state.config.server.debug_routes {
                json_error_response(ErrorCode::NotFound, "Not found")
            } else {
                match authenticate(&req, &state).await {
                    Err(resp) => resp,
                    Ok(()) => route_debug(req.method(), &path, &state)
                        .await
                        .unwrap_or_else(|| json_error_response(ErrorCode::NotFound, "Not found")),
                }
            }
        }
        RouteClass::Proxy => proxy_request(req, &state, request_id).await,
    };

    Ok(response)
}

/// Signed-identity check shared by admin and debug routes
async fn authenticate(req: &Request<Incoming>, state: &GatewayState) -> Result<(), Response<ResponseBody>> {
    match state.auth.authenticate_user(req.headers()).await {
        AuthDecision::Rejected(reason) => {
            debug!(%reason, path = %req.uri().path(), "Admin request rejected");
            Err(rejection_response(&reason))
        }
        AuthDecision::UserIdentity(claims) => {
            debug!(email = ?claims.email, dev_mode = claims.dev_mode, "Admin request accepted");
            Ok(())
        }
        AuthDecision::DeviceToken(_) => Ok(()),
    }
}

async fn handle_public(path: &str, state: &GatewayState) -> Response<ResponseBody> {
    if path == HEALTH_PATH {
        return json_response(
            StatusCode::OK,
            &json!({
                "status": "ok",
                "service": PKG_NAME,
                "version": VERSION,
                "gatewayPort": state.config.gateway.port,
            }),
        );
    }

    match state.supervisor.status().await {
        Ok(status) => json_response(
            StatusCode::OK,
            &json!({
                "ok": matches!(status, crate::supervisor::GatewayStatus::Running { .. }),
                "gateway": status,
            }),
        ),
        Err(e) => {
            warn!(error = %e, "Status check failed");
            json_response(
                StatusCode::OK,
                &json!({ "ok": false, "error": "sandbox unavailable" }),
            )
        }
    }
}

async fn handle_cdp(
    req: Request<Incoming>,
    path: &str,
    state: &GatewayState,
    is_tls: bool,
    request_id: String,
) -> Response<ResponseBody> {
    let Some(browser) = state.browser.clone() else {
        return json_error_response(ErrorCode::NotFound, "Browser automation is not configured");
    };

    let secret = query_param(req.uri().query(), "secret");
    if let AuthDecision::Rejected(reason) = state.auth.authenticate_cdp(secret.as_deref()) {
        debug!(%reason, "CDP request rejected");
        return rejection_response(&reason);
    }

    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost")
        .to_string();
    let scheme = if is_tls { "wss" } else { "ws" };
    let ws_url = append_query(
        &format!("{}://{}{}", scheme, host, CDP_PATH),
        "secret",
        secret.as_deref().unwrap_or_default(),
    );

    let method = req.method().clone();
    match (&method, path.trim_end_matches('/')) {
        (&Method::GET, CDP_PATH) if is_websocket_upgrade(&req) => {
            cdp::accept_upgrade(req, browser, request_id)
        }
        (&Method::GET, CDP_PATH) => json_error_response(ErrorCode::BadRequest, "WebSocket upgrade required"),
        (&Method::GET, "/cdp/json/version") => json_response(StatusCode::OK, &cdp::version_info(&ws_url)),
        (&Method::GET, "/cdp/json/list") | (&Method::GET, "/cdp/json") => {
            json_response(StatusCode::OK, &cdp::target_list(&ws_url))
        }
        _ => json_error_response(ErrorCode::NotFound, "Not found"),
    }
}

fn is_websocket_upgrade(req: &Request<Incoming>) -> bool {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Browser navigation (as opposed to fetch/XHR or API clients)
fn wants_html(headers: &hyper::HeaderMap) -> bool {
    headers
        .get(hyper::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/html"))
        .unwrap_or(false)
}

/// Drop one query parameter from a path-and-query string
pub fn remove_query_param(path_and_query: &str, key: &str) -> String {
    let Some((path, query)) = path_and_query.split_once('?') else {
        return path_and_query.to_string();
    };
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty() && pair.split('=').next() != Some(key))
        .collect();
    if kept.is_empty() {
        path.to_string()
    } else {
        format!("{}?{}", path, kept.join("&"))
    }
}

/// Backend-side path for a proxied request.
///
/// Clients that authenticated by identity get the configured gateway token in
/// place of whatever `token` they sent.
fn backend_path_and_query(
    path_and_query: &str,
    decision: &AuthDecision,
    gateway_token: Option<&str>,
) -> String {
    match (decision, gateway_token) {
        (AuthDecision::DeviceToken(_), _) | (_, None) => path_and_query.to_string(),
        (_, Some(token)) => append_query(
            &remove_query_param(path_and_query, "token"),
            "token",
            token,
        ),
    }
}

async fn proxy_request(
    req: Request<Incoming>,
    state: &GatewayState,
    request_id: String,
) -> Response<ResponseBody> {
    let query_token = query_param(req.uri().query(), "token");
    let decision = state
        .auth
        .authenticate_proxy(req.headers(), query_token.as_deref())
        .await;
    match &decision {
        AuthDecision::Rejected(reason) => {
            debug!(%reason, request_id, "Proxy request rejected");
            return rejection_response(reason);
        }
        AuthDecision::UserIdentity(claims) if claims.dev_mode => {
            debug!(request_id, dev_mode = true, "Proxy request accepted");
        }
        _ => {}
    }

    let upgrade = is_websocket_upgrade(&req);
    let html = !upgrade && wants_html(req.headers());

    // Browsers get the starting page right away instead of a hanging tab
    if html && !state.supervisor.probe().await {
        state.supervisor.start_in_background();
        return starting_response(true);
    }

    let process = match state.supervisor.ensure_running().await {
        Ok(process) => process,
        Err(SupervisorError::StartupTimeout { waited }) => {
            warn!(request_id, waited_secs = waited.as_secs(), "Gateway still starting");
            return starting_response(html);
        }
        Err(e) => {
            error!(request_id, error = %e, "Failed to start gateway");
            return json_error_response(ErrorCode::SpawnFailed, "Gateway unavailable");
        }
    };

    let host = state.config.gateway.host.clone();
    let port = process.port;

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    let backend_path = backend_path_and_query(
        &path,
        &decision,
        state.config.auth.gateway_token.as_deref(),
    );

    if upgrade {
        let targets = RedirectTargets {
            reconnect_path: remove_query_param(&path, "token"),
            admin_ui_path: state.config.server.admin_ui_path.clone(),
        };
        let url = format!("ws://{}:{}{}", host, port, backend_path);
        return proxy_websocket(req, url, targets, request_id).await;
    }

    match state.pool.send_request(req, &host, port, &backend_path).await {
        Ok(response) => response,
        Err(e) => {
            warn!(request_id, error = %e, "Failed to forward request to gateway");
            json_error_response(ErrorCode::ConnectionFailed, "Failed to connect to gateway")
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::AuthSettings;
    use crate::env::BackendEnv;
    use crate::sandbox::{ExecOutput, ProcessInfo, ProcessLogs, Sandbox, SandboxError};
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    /// Sandbox with no processes whose CLI lists nothing and approves everything
    struct IdleSandbox;

    #[async_trait]
    impl Sandbox for IdleSandbox {
        async fn list_processes(&self) -> Result<Vec<ProcessInfo>, SandboxError> {
            Ok(Vec::new())
        }

        async fn start_process(
            &self,
            _command: &str,
            _env: &BTreeMap<String, String>,
        ) -> Result<ProcessInfo, SandboxError> {
            Err(SandboxError::Spawn("disabled".to_string()))
        }

        async fn exec(
            &self,
            command: &str,
            _env: &BTreeMap<String, String>,
        ) -> Result<ExecOutput, SandboxError> {
            let stdout = if command.contains("devices list") {
                r#"{"pending":[],"paired":[]}"#.to_string()
            } else {
                "approved".to_string()
            };
            Ok(ExecOutput {
                stdout,
                stderr: String::new(),
                exit_code: Some(0),
            })
        }

        async fn logs(&self, id: &str) -> Result<ProcessLogs, SandboxError> {
            Err(SandboxError::UnknownProcess(id.to_string()))
        }

        async fn kill(&self, _id: &str) -> Result<(), SandboxError> {
            Ok(())
        }
    }

    pub(crate) fn test_state() -> Arc<GatewayState> {
        let mut config = Config::default();
        config.auth = AuthSettings {
            allow_dev_mode: true,
            dev_mode: true,
            ..AuthSettings::default()
        };
        let sandbox: crate::sandbox::SharedSandbox = Arc::new(IdleSandbox);
        let storage = StorageManager::new(config.storage.clone(), Arc::clone(&sandbox));
        let supervisor = GatewaySupervisor::new(
            sandbox,
            config.gateway.clone(),
            BackendEnv::new(),
            None,
        );
        let auth = AuthGate::new(config.auth.clone());
        GatewayState::new(config, supervisor, storage, auth, None)
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("/sandbox-health"), RouteClass::Public);
        assert_eq!(classify("/api/status"), RouteClass::Public);
        assert_eq!(classify("/cdp"), RouteClass::Cdp);
        assert_eq!(classify("/cdp/json/version"), RouteClass::Cdp);
        assert_eq!(classify("/cdpx"), RouteClass::Proxy);
        assert_eq!(classify("/api/admin/devices"), RouteClass::Admin);
        assert_eq!(classify("/debug/logs"), RouteClass::Debug);
        assert_eq!(classify("/"), RouteClass::Proxy);
        assert_eq!(classify("/api/other"), RouteClass::Proxy);
    }

    #[test]
    fn test_remove_query_param() {
        assert_eq!(remove_query_param("/ws?token=abc", "token"), "/ws");
        assert_eq!(remove_query_param("/ws?a=1&token=abc&b=2", "token"), "/ws?a=1&b=2");
        assert_eq!(remove_query_param("/ws?tokenx=1", "token"), "/ws?tokenx=1");
        assert_eq!(remove_query_param("/ws", "token"), "/ws");
    }

    #[test]
    fn test_backend_path_replaces_client_token_for_identity() {
        let device = AuthDecision::DeviceToken("shared-secret".to_string());
        let user = AuthDecision::UserIdentity(crate::auth::Claims {
            sub: Some("u".to_string()),
            email: None,
            iss: None,
            exp: 0,
            dev_mode: false,
        });

        assert_eq!(backend_path_and_query("/p?token=gw", &device, Some("gw")), "/p?token=gw");
        assert_eq!(backend_path_and_query("/p?x=1", &user, Some("gw")), "/p?x=1&token=gw");
        assert_eq!(
            backend_path_and_query("/p?token=stale&x=1", &user, Some("gw")),
            "/p?x=1&token=gw"
        );
        assert_eq!(backend_path_and_query("/p?token=stale", &user, None), "/p?token=stale");
    }

    #[test]
    fn test_wants_html() {
        let mut headers = hyper::HeaderMap::new();
        assert!(!wants_html(&headers));
        headers.insert(
            hyper::header::ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml"),
        );
        assert!(wants_html(&headers));
    }

    #[tokio::test]
    async fn test_public_status_reports_not_running() {
        let state = test_state();
        let resp = handle_public(STATUS_PATH, &state).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = handle_public(HEALTH_PATH, &state).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
