//! Chrome DevTools Protocol shim
//!
//! Accepts CDP JSON-RPC messages over a WebSocket and drives a remote browser
//! capability instead of a local browser. Only a fixed method table is
//! supported; anything else gets a "method not found" error and the
//! connection stays open.
//!
//! Per connection the shim keeps: in-flight request ids, targets (our ids
//! mapped to remote page ids), attached sessions, and DOM node handles
//! (node ids mapped to CSS selectors). All remote pages are closed when the
//! connection ends.
//!
//! Events are synthesized, not relayed from the remote browser: only
//! `Target.attachedToTarget` (before the attach reply) and
//! `Page.domContentEventFired`/`Page.loadEventFired` (after a navigate, reload
//! or setContent reply) are ever sent.

use crate::error::{full_body, json_error_response, ErrorCode, ResponseBody};
use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::{SinkExt, StreamExt};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

const PROTOCOL_VERSION: &str = "1.3";
const REMOTE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CdpError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("'{0}' wasn't found")]
    MethodNotFound(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("remote browser error: {0}")]
    Remote(String),
}

impl CdpError {
    pub fn code(&self) -> i64 {
        match self {
            CdpError::Parse(_) => -32700,
            CdpError::InvalidRequest(_) => -32600,
            CdpError::MethodNotFound(_) => -32601,
            CdpError::InvalidParams(_) => -32602,
            CdpError::Remote(_) => -32000,
        }
    }
}

/// A page opened on the remote browser
#[derive(Debug, Clone, Deserialize)]
pub struct RemotePage {
    pub id: String,
    #[serde(default)]
    pub url: String,
}

/// Operation performed against one remote page
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PageAction {
    Navigate { url: String },
    Reload,
    Screenshot { format: String, quality: Option<u8> },
    SetContent { html: String },
    Evaluate { expression: String },
    Count { selector: String },
    OuterHtml { selector: String, index: usize },
    Mouse { kind: String, x: f64, y: f64, button: String, click_count: u32 },
    Key { kind: String, key: Option<String>, code: Option<String>, text: Option<String> },
    InsertText { text: String },
    ExtraHeaders { headers: HashMap<String, String> },
    UserAgent { user_agent: String },
    GetCookies { urls: Vec<String> },
    SetCookies { cookies: Vec<Value> },
    ClearCookies,
    Interception { enabled: bool, patterns: Vec<Value> },
    ContinueRequest { request_id: String, url: Option<String>, method: Option<String> },
    Viewport { width: u32, height: u32, device_scale_factor: f64, mobile: bool },
}

/// Remote browser-automation capability
#[async_trait]
pub trait BrowserCapability: Send + Sync {
    async fn create_page(&self, url: &str) -> Result<RemotePage, CdpError>;
    async fn close_page(&self, page_id: &str) -> Result<(), CdpError>;
    async fn perform(&self, page_id: &str, action: PageAction) -> Result<Value, CdpError>;
}

pub type SharedBrowser = Arc<dyn BrowserCapability>;

/// Browser capability reached over HTTP/JSON
pub struct HttpBrowser {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpBrowser {
    pub fn new(endpoint: &str, token: Option<String>) -> anyhow::Result<Arc<Self>> {
        let client = reqwest::Client::builder().timeout(REMOTE_TIMEOUT).build()?;
        Ok(Arc::new(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        }))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.endpoint, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, CdpError> {
        builder
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| CdpError::Remote(e.to_string()))
    }
}

#[async_trait]
impl BrowserCapability for HttpBrowser {
    async fn create_page(&self, url: &str) -> Result<RemotePage, CdpError> {
        let resp = self
            .send(self.request(reqwest::Method::POST, "/pages").json(&json!({ "url": url })))
            .await?;
        resp.json().await.map_err(|e| CdpError::Remote(e.to_string()))
    }

    async fn close_page(&self, page_id: &str) -> Result<(), CdpError> {
        let path = format!("/pages/{}", urlencoding::encode(page_id));
        self.send(self.request(reqwest::Method::DELETE, &path)).await?;
        Ok(())
    }

    async fn perform(&self, page_id: &str, action: PageAction) -> Result<Value, CdpError> {
        let path = format!("/pages/{}/actions", urlencoding::encode(page_id));
        let resp = self
            .send(self.request(reqwest::Method::POST, &path).json(&action))
            .await?;
        let body: Value = resp.json().await.map_err(|e| CdpError::Remote(e.to_string()))?;
        Ok(body.get("result").cloned().unwrap_or(body))
    }
}

/// Supported methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdpMethod {
    BrowserGetVersion,
    BrowserClose,
    TargetCreateTarget,
    TargetCloseTarget,
    TargetGetTargets,
    TargetAttachToTarget,
    TargetActivateTarget,
    PageEnable,
    PageNavigate,
    PageReload,
    PageCaptureScreenshot,
    PageGetFrameTree,
    PageSetContent,
    RuntimeEnable,
    RuntimeEvaluate,
    RuntimeCallFunctionOn,
    DomEnable,
    DomGetDocument,
    DomQuerySelector,
    DomQuerySelectorAll,
    DomGetOuterHtml,
    InputDispatchMouseEvent,
    InputDispatchKeyEvent,
    InputInsertText,
    NetworkEnable,
    NetworkSetExtraHttpHeaders,
    NetworkSetUserAgentOverride,
    NetworkGetCookies,
    NetworkSetCookies,
    NetworkClearBrowserCookies,
    FetchEnable,
    FetchDisable,
    FetchContinueRequest,
    EmulationSetDeviceMetricsOverride,
    EmulationSetUserAgentOverride,
}

impl CdpMethod {
    pub fn parse(method: &str) -> Option<Self> {
        use CdpMethod::*;
        let (domain, name) = method.split_once('.')?;
        Some(match (domain, name) {
            ("Browser", "getVersion") => BrowserGetVersion,
            ("Browser", "close") => BrowserClose,
            ("Target", "createTarget") => TargetCreateTarget,
            ("Target", "closeTarget") => TargetCloseTarget,
            ("Target", "getTargets") => TargetGetTargets,
            ("Target", "attachToTarget") => TargetAttachToTarget,
            ("Target", "activateTarget") => TargetActivateTarget,
            ("Page", "enable") => PageEnable,
            ("Page", "navigate") => PageNavigate,
            ("Page", "reload") => PageReload,
            ("Page", "captureScreenshot") => PageCaptureScreenshot,
            ("Page", "getFrameTree") => PageGetFrameTree,
            ("Page", "setContent") => PageSetContent,
            ("Runtime", "enable") => RuntimeEnable,
            ("Runtime", "evaluate") => RuntimeEvaluate,
            ("Runtime", "callFunctionOn") => RuntimeCallFunctionOn,
            ("DOM", "enable") => DomEnable,
            ("DOM", "getDocument") => DomGetDocument,
            ("DOM", "querySelector") => DomQuerySelector,
            ("DOM", "querySelectorAll") => DomQuerySelectorAll,
            ("DOM", "getOuterHTML") => DomGetOuterHtml,
            ("Input", "dispatchMouseEvent") => InputDispatchMouseEvent,
            ("Input", "dispatchKeyEvent") => InputDispatchKeyEvent,
            ("Input", "insertText") => InputInsertText,
            ("Network", "enable") => NetworkEnable,
            ("Network", "setExtraHTTPHeaders") => NetworkSetExtraHttpHeaders,
            ("Network", "setUserAgentOverride") => NetworkSetUserAgentOverride,
            ("Network", "getCookies") => NetworkGetCookies,
            ("Network", "setCookies") => NetworkSetCookies,
            ("Network", "clearBrowserCookies") => NetworkClearBrowserCookies,
            ("Fetch", "enable") => FetchEnable,
            ("Fetch", "disable") => FetchDisable,
            ("Fetch", "continueRequest") => FetchContinueRequest,
            ("Emulation", "setDeviceMetricsOverride") => EmulationSetDeviceMetricsOverride,
            ("Emulation", "setUserAgentOverride") => EmulationSetUserAgentOverride,
            _ => return None,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCall {
    id: Option<Value>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    session_id: Option<String>,
}

/// A validated message waiting to be dispatched
#[derive(Debug)]
pub struct Call {
    id: i64,
    method: CdpMethod,
    params: Value,
    session_id: Option<String>,
}

#[derive(Debug, Clone)]
struct Target {
    page_id: String,
    url: String,
    title: String,
    attached: bool,
}

/// Element handle: the n-th match of a selector
#[derive(Debug, Clone, PartialEq)]
struct NodeRef {
    selector: String,
    index: usize,
}

const DOCUMENT_NODE: i64 = 1;

#[derive(Default)]
struct SessionState {
    targets: HashMap<String, Target>,
    sessions: HashMap<String, String>,
    last_target: Option<String>,
    nodes: HashMap<i64, NodeRef>,
    next_node: i64,
    user_agent: Option<String>,
}

/// State of one CDP connection
pub struct CdpSession {
    browser: SharedBrowser,
    state: Mutex<SessionState>,
    inflight: Mutex<HashSet<i64>>,
}

fn params<T: DeserializeOwned>(value: &Value) -> Result<T, CdpError> {
    let value = if value.is_null() { json!({}) } else { value.clone() };
    serde_json::from_value(value).map_err(|e| CdpError::InvalidParams(e.to_string()))
}

fn error_body(id: Option<i64>, err: &CdpError, session_id: Option<&str>) -> String {
    let mut body = json!({
        "id": id,
        "error": { "code": err.code(), "message": err.to_string() },
    });
    if let Some(session) = session_id {
        body["sessionId"] = json!(session);
    }
    body.to_string()
}

fn event_body(method: &str, params: Value, session_id: Option<&str>) -> String {
    let mut body = json!({ "method": method, "params": params });
    if let Some(session) = session_id {
        body["sessionId"] = json!(session);
    }
    body.to_string()
}

fn target_info(target_id: &str, target: &Target) -> Value {
    json!({
        "targetId": target_id,
        "type": "page",
        "title": target.title,
        "url": target.url,
        "attached": target.attached,
    })
}

fn result_body(id: i64, result: Value, session_id: Option<&str>) -> String {
    let mut body = json!({ "id": id, "result": result });
    if let Some(session) = session_id {
        body["sessionId"] = json!(session);
    }
    body.to_string()
}

/// CDP `RemoteObject` for a plain JSON value
fn remote_object(value: Value) -> Value {
    match value {
        Value::Null => json!({ "type": "undefined" }),
        Value::Bool(_) => json!({ "type": "boolean", "value": value }),
        Value::Number(_) => json!({ "type": "number", "value": value, "description": value.to_string() }),
        Value::String(_) => json!({ "type": "string", "value": value }),
        Value::Array(_) => json!({ "type": "object", "subtype": "array", "value": value }),
        Value::Object(_) => json!({ "type": "object", "value": value }),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetParams {
    target_id: String,
}

#[derive(Deserialize)]
struct CreateTargetParams {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
struct UrlParams {
    url: String,
}

#[derive(Deserialize)]
struct ScreenshotParams {
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    quality: Option<u8>,
}

#[derive(Deserialize)]
struct HtmlParams {
    html: String,
}

#[derive(Deserialize)]
struct EvaluateParams {
    expression: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallFunctionParams {
    function_declaration: String,
    #[serde(default)]
    arguments: Vec<CallArgument>,
}

#[derive(Deserialize)]
struct CallArgument {
    #[serde(default)]
    value: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectorParams {
    node_id: i64,
    selector: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeParams {
    node_id: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MouseParams {
    #[serde(rename = "type")]
    kind: String,
    x: f64,
    y: f64,
    #[serde(default)]
    button: Option<String>,
    #[serde(default)]
    click_count: Option<u32>,
}

#[derive(Deserialize)]
struct KeyParams {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct TextParams {
    text: String,
}

#[derive(Deserialize)]
struct HeadersParams {
    headers: HashMap<String, String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserAgentParams {
    user_agent: String,
}

#[derive(Deserialize)]
struct CookieUrlsParams {
    #[serde(default)]
    urls: Vec<String>,
}

#[derive(Deserialize)]
struct SetCookiesParams {
    cookies: Vec<Value>,
}

#[derive(Deserialize)]
struct FetchEnableParams {
    #[serde(default)]
    patterns: Vec<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContinueParams {
    request_id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    method: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricsParams {
    width: u32,
    height: u32,
    #[serde(default)]
    device_scale_factor: f64,
    #[serde(default)]
    mobile: bool,
}

impl CdpSession {
    pub fn new(browser: SharedBrowser) -> Arc<Self> {
        Arc::new(Self {
            browser,
            state: Mutex::new(SessionState {
                next_node: DOCUMENT_NODE + 1,
                ..SessionState::default()
            }),
            inflight: Mutex::new(HashSet::new()),
        })
    }

    /// Validate a message and register its id. Errors come back as the
    /// response text to send.
    pub fn begin(&self, text: &str) -> Result<Call, String> {
        let raw: RawCall = serde_json::from_str(text)
            .map_err(|e| error_body(None, &CdpError::Parse(e.to_string()), None))?;

        let id = match raw.id.as_ref().and_then(Value::as_i64) {
            Some(id) => id,
            None => {
                let err = CdpError::InvalidRequest("missing or non-integer id".to_string());
                return Err(error_body(None, &err, raw.session_id.as_deref()));
            }
        };
        let session_id = raw.session_id;

        let Some(name) = raw.method else {
            let err = CdpError::InvalidRequest("missing method".to_string());
            return Err(error_body(Some(id), &err, session_id.as_deref()));
        };
        let Some(method) = CdpMethod::parse(&name) else {
            debug!(method = %name, "Unsupported CDP method");
            return Err(error_body(Some(id), &CdpError::MethodNotFound(name), session_id.as_deref()));
        };

        if !self.inflight.lock().insert(id) {
            let err = CdpError::InvalidRequest(format!("request id {} is already in flight", id));
            return Err(error_body(Some(id), &err, session_id.as_deref()));
        }

        Ok(Call {
            id,
            method,
            params: raw.params,
            session_id,
        })
    }

    /// Execute a call and produce the messages to send, in order: the reply
    /// plus any events it triggers.
    pub async fn dispatch(self: Arc<Self>, call: Call) -> Vec<String> {
        let session_id = call.session_id.as_deref();
        let result = self.execute(call.method, &call.params, session_id).await;
        self.inflight.lock().remove(&call.id);
        match result {
            Ok(value) => {
                let (before, after) = self.events_for(call.method, &call.params, &value, session_id);
                let mut messages = before;
                messages.push(result_body(call.id, value, session_id));
                messages.extend(after);
                messages
            }
            Err(err) => {
                debug!(id = call.id, method = ?call.method, error = %err, "CDP call failed");
                vec![error_body(Some(call.id), &err, session_id)]
            }
        }
    }

    /// Process one message to completion
    pub async fn handle_message(self: &Arc<Self>, text: &str) -> Vec<String> {
        match self.begin(text) {
            Ok(call) => Arc::clone(self).dispatch(call).await,
            Err(response) => vec![response],
        }
    }

    /// Events sent before and after the reply to a successful call
    fn events_for(
        &self,
        method: CdpMethod,
        params: &Value,
        result: &Value,
        session_id: Option<&str>,
    ) -> (Vec<String>, Vec<String>) {
        match method {
            CdpMethod::TargetAttachToTarget => {
                let state = self.state.lock();
                let attached = result.get("sessionId").and_then(Value::as_str);
                let info = params
                    .get("targetId")
                    .and_then(Value::as_str)
                    .and_then(|id| state.targets.get(id).map(|t| target_info(id, t)));
                let before = match (attached, info) {
                    (Some(attached), Some(info)) => vec![event_body(
                        "Target.attachedToTarget",
                        json!({
                            "sessionId": attached,
                            "targetInfo": info,
                            "waitingForDebugger": false,
                        }),
                        None,
                    )],
                    _ => Vec::new(),
                };
                (before, Vec::new())
            }
            CdpMethod::PageNavigate | CdpMethod::PageReload | CdpMethod::PageSetContent => {
                let timestamp = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
                let after = ["Page.domContentEventFired", "Page.loadEventFired"]
                    .iter()
                    .map(|event| event_body(event, json!({ "timestamp": timestamp }), session_id))
                    .collect();
                (Vec::new(), after)
            }
            _ => (Vec::new(), Vec::new()),
        }
    }

    fn resolve_target(&self, session_id: Option<&str>) -> Result<(String, Target), CdpError> {
        let state = self.state.lock();
        let target_id = match session_id {
            Some(session) => state
                .sessions
                .get(session)
                .cloned()
                .ok_or_else(|| CdpError::InvalidParams(format!("unknown session {}", session)))?,
            None => state
                .last_target
                .clone()
                .ok_or_else(|| CdpError::InvalidParams("no target; call Target.createTarget first".to_string()))?,
        };
        let target = state
            .targets
            .get(&target_id)
            .cloned()
            .ok_or_else(|| CdpError::InvalidParams(format!("target {} is closed", target_id)))?;
        Ok((target_id, target))
    }

    async fn perform(&self, session_id: Option<&str>, action: PageAction) -> Result<Value, CdpError> {
        let (_, target) = self.resolve_target(session_id)?;
        self.browser.perform(&target.page_id, action).await
    }

    fn node(&self, node_id: i64) -> Result<NodeRef, CdpError> {
        if node_id == DOCUMENT_NODE {
            return Ok(NodeRef {
                selector: ":root".to_string(),
                index: 0,
            });
        }
        self.state
            .lock()
            .nodes
            .get(&node_id)
            .cloned()
            .ok_or_else(|| CdpError::InvalidParams(format!("unknown node {}", node_id)))
    }

    fn scoped_selector(&self, parent: i64, selector: &str) -> Result<String, CdpError> {
        let parent = self.node(parent)?;
        Ok(if parent.selector == ":root" {
            selector.to_string()
        } else {
            format!("{} {}", parent.selector, selector)
        })
    }

    async fn match_count(&self, session_id: Option<&str>, selector: &str) -> Result<usize, CdpError> {
        let result = self
            .perform(session_id, PageAction::Count { selector: selector.to_string() })
            .await?;
        Ok(result
            .get("count")
            .and_then(Value::as_u64)
            .or_else(|| result.as_u64())
            .unwrap_or(0) as usize)
    }

    fn register_nodes(&self, selector: &str, count: usize) -> Vec<i64> {
        let mut state = self.state.lock();
        (0..count)
            .map(|index| {
                let id = state.next_node;
                state.next_node += 1;
                state.nodes.insert(
                    id,
                    NodeRef {
                        selector: selector.to_string(),
                        index,
                    },
                );
                id
            })
            .collect()
    }

    async fn execute(
        &self,
        method: CdpMethod,
        p: &Value,
        session_id: Option<&str>,
    ) -> Result<Value, CdpError> {
        use CdpMethod::*;
        match method {
            BrowserGetVersion => {
                let ua = self.state.lock().user_agent.clone().unwrap_or_default();
                Ok(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "product": format!("sandgate/{} (remote)", env!("CARGO_PKG_VERSION")),
                    "revision": "",
                    "userAgent": ua,
                    "jsVersion": "",
                }))
            }
            BrowserClose => {
                self.close_all().await;
                Ok(json!({}))
            }
            TargetCreateTarget => {
                let args: CreateTargetParams = params(p)?;
                let url = args.url.unwrap_or_else(|| "about:blank".to_string());
                let page = self.browser.create_page(&url).await?;
                let target_id = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
                info!(target_id, page_id = %page.id, "CDP target created");
                let mut state = self.state.lock();
                state.targets.insert(
                    target_id.clone(),
                    Target {
                        page_id: page.id,
                        url: if page.url.is_empty() { url } else { page.url },
                        title: String::new(),
                        attached: false,
                    },
                );
                state.last_target = Some(target_id.clone());
                Ok(json!({ "targetId": target_id }))
            }
            TargetCloseTarget => {
                let args: TargetParams = params(p)?;
                let target = {
                    let mut state = self.state.lock();
                    let target = state
                        .targets
                        .remove(&args.target_id)
                        .ok_or_else(|| CdpError::InvalidParams(format!("no target {}", args.target_id)))?;
                    state.sessions.retain(|_, t| t != &args.target_id);
                    if state.last_target.as_deref() == Some(args.target_id.as_str()) {
                        state.last_target = state.targets.keys().next().cloned();
                    }
                    target
                };
                self.browser.close_page(&target.page_id).await?;
                Ok(json!({ "success": true }))
            }
            TargetGetTargets => {
                let state = self.state.lock();
                let infos: Vec<Value> = state
                    .targets
                    .iter()
                    .map(|(id, t)| target_info(id, t))
                    .collect();
                Ok(json!({ "targetInfos": infos }))
            }
            TargetAttachToTarget => {
                let args: TargetParams = params(p)?;
                let mut state = self.state.lock();
                let target = state
                    .targets
                    .get_mut(&args.target_id)
                    .ok_or_else(|| CdpError::InvalidParams(format!("no target {}", args.target_id)))?;
                target.attached = true;
                let session = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
                state.sessions.insert(session.clone(), args.target_id);
                Ok(json!({ "sessionId": session }))
            }
            TargetActivateTarget => {
                let args: TargetParams = params(p)?;
                let mut state = self.state.lock();
                if !state.targets.contains_key(&args.target_id) {
                    return Err(CdpError::InvalidParams(format!("no target {}", args.target_id)));
                }
                state.last_target = Some(args.target_id);
                Ok(json!({}))
            }
            PageEnable | RuntimeEnable | DomEnable | NetworkEnable => Ok(json!({})),
            PageNavigate => {
                let args: UrlParams = params(p)?;
                let (target_id, _) = self.resolve_target(session_id)?;
                self.perform(session_id, PageAction::Navigate { url: args.url.clone() })
                    .await?;
                if let Some(target) = self.state.lock().targets.get_mut(&target_id) {
                    target.url = args.url;
                }
                Ok(json!({
                    "frameId": target_id,
                    "loaderId": uuid::Uuid::new_v4().simple().to_string(),
                }))
            }
            PageReload => {
                self.perform(session_id, PageAction::Reload).await?;
                Ok(json!({}))
            }
            PageCaptureScreenshot => {
                let args: ScreenshotParams = params(p)?;
                let result = self
                    .perform(
                        session_id,
                        PageAction::Screenshot {
                            format: args.format.unwrap_or_else(|| "png".to_string()),
                            quality: args.quality,
                        },
                    )
                    .await?;
                let data = result
                    .get("data")
                    .cloned()
                    .or_else(|| result.as_str().map(|s| json!(s)))
                    .ok_or_else(|| CdpError::Remote("screenshot returned no data".to_string()))?;
                Ok(json!({ "data": data }))
            }
            PageGetFrameTree => {
                let (target_id, target) = self.resolve_target(session_id)?;
                Ok(json!({
                    "frameTree": {
                        "frame": {
                            "id": target_id,
                            "loaderId": "",
                            "url": target.url,
                            "securityOrigin": "",
                            "mimeType": "text/html",
                        }
                    }
                }))
            }
            PageSetContent => {
                let args: HtmlParams = params(p)?;
                self.perform(session_id, PageAction::SetContent { html: args.html }).await?;
                Ok(json!({}))
            }
            RuntimeEvaluate => {
                let args: EvaluateParams = params(p)?;
                let result = self
                    .perform(session_id, PageAction::Evaluate { expression: args.expression })
                    .await?;
                let value = result.get("value").cloned().unwrap_or(result);
                Ok(json!({ "result": remote_object(value) }))
            }
            RuntimeCallFunctionOn => {
                let args: CallFunctionParams = params(p)?;
                let values: Vec<Value> = args.arguments.into_iter().map(|a| a.value).collect();
                let expression = format!(
                    "({}).apply(null, {})",
                    args.function_declaration,
                    Value::Array(values)
                );
                let result = self
                    .perform(session_id, PageAction::Evaluate { expression })
                    .await?;
                let value = result.get("value").cloned().unwrap_or(result);
                Ok(json!({ "result": remote_object(value) }))
            }
            DomGetDocument => {
                let (_, target) = self.resolve_target(session_id)?;
                Ok(json!({
                    "root": {
                        "nodeId": DOCUMENT_NODE,
                        "backendNodeId": DOCUMENT_NODE,
                        "nodeType": 9,
                        "nodeName": "#document",
                        "localName": "",
                        "nodeValue": "",
                        "documentURL": target.url,
                    }
                }))
            }
            DomQuerySelector => {
                let args: SelectorParams = params(p)?;
                let selector = self.scoped_selector(args.node_id, &args.selector)?;
                let count = self.match_count(session_id, &selector).await?;
                let node_id = self
                    .register_nodes(&selector, count.min(1))
                    .first()
                    .copied()
                    .unwrap_or(0);
                Ok(json!({ "nodeId": node_id }))
            }
            DomQuerySelectorAll => {
                let args: SelectorParams = params(p)?;
                let selector = self.scoped_selector(args.node_id, &args.selector)?;
                let count = self.match_count(session_id, &selector).await?;
                Ok(json!({ "nodeIds": self.register_nodes(&selector, count) }))
            }
            DomGetOuterHtml => {
                let args: NodeParams = params(p)?;
                let node = self.node(args.node_id)?;
                let result = self
                    .perform(
                        session_id,
                        PageAction::OuterHtml {
                            selector: node.selector,
                            index: node.index,
                        },
                    )
                    .await?;
                let html = result
                    .get("html")
                    .cloned()
                    .or_else(|| result.as_str().map(|s| json!(s)))
                    .unwrap_or_else(|| json!(""));
                Ok(json!({ "outerHTML": html }))
            }
            InputDispatchMouseEvent => {
                let args: MouseParams = params(p)?;
                self.perform(
                    session_id,
                    PageAction::Mouse {
                        kind: args.kind,
                        x: args.x,
                        y: args.y,
                        button: args.button.unwrap_or_else(|| "none".to_string()),
                        click_count: args.click_count.unwrap_or(0),
                    },
                )
                .await?;
                Ok(json!({}))
            }
            InputDispatchKeyEvent => {
                let args: KeyParams = params(p)?;
                self.perform(
                    session_id,
                    PageAction::Key {
                        kind: args.kind,
                        key: args.key,
                        code: args.code,
                        text: args.text,
                    },
                )
                .await?;
                Ok(json!({}))
            }
            InputInsertText => {
                let args: TextParams = params(p)?;
                self.perform(session_id, PageAction::InsertText { text: args.text }).await?;
                Ok(json!({}))
            }
            NetworkSetExtraHttpHeaders => {
                let args: HeadersParams = params(p)?;
                self.perform(session_id, PageAction::ExtraHeaders { headers: args.headers })
                    .await?;
                Ok(json!({}))
            }
            NetworkSetUserAgentOverride | EmulationSetUserAgentOverride => {
                let args: UserAgentParams = params(p)?;
                self.perform(
                    session_id,
                    PageAction::UserAgent {
                        user_agent: args.user_agent.clone(),
                    },
                )
                .await?;
                self.state.lock().user_agent = Some(args.user_agent);
                Ok(json!({}))
            }
            NetworkGetCookies => {
                let args: CookieUrlsParams = params(p)?;
                let result = self
                    .perform(session_id, PageAction::GetCookies { urls: args.urls })
                    .await?;
                let cookies = match result {
                    Value::Array(_) => result,
                    other => other.get("cookies").cloned().unwrap_or_else(|| json!([])),
                };
                Ok(json!({ "cookies": cookies }))
            }
            NetworkSetCookies => {
                let args: SetCookiesParams = params(p)?;
                self.perform(session_id, PageAction::SetCookies { cookies: args.cookies })
                    .await?;
                Ok(json!({}))
            }
            NetworkClearBrowserCookies => {
                self.perform(session_id, PageAction::ClearCookies).await?;
                Ok(json!({}))
            }
            FetchEnable => {
                let args: FetchEnableParams = params(p)?;
                self.perform(
                    session_id,
                    PageAction::Interception {
                        enabled: true,
                        patterns: args.patterns,
                    },
                )
                .await?;
                Ok(json!({}))
            }
            FetchDisable => {
                self.perform(
                    session_id,
                    PageAction::Interception {
                        enabled: false,
                        patterns: Vec::new(),
                    },
                )
                .await?;
                Ok(json!({}))
            }
            FetchContinueRequest => {
                let args: ContinueParams = params(p)?;
                self.perform(
                    session_id,
                    PageAction::ContinueRequest {
                        request_id: args.request_id,
                        url: args.url,
                        method: args.method,
                    },
                )
                .await?;
                Ok(json!({}))
            }
            EmulationSetDeviceMetricsOverride => {
                let args: MetricsParams = params(p)?;
                self.perform(
                    session_id,
                    PageAction::Viewport {
                        width: args.width,
                        height: args.height,
                        device_scale_factor: if args.device_scale_factor > 0.0 {
                            args.device_scale_factor
                        } else {
                            1.0
                        },
                        mobile: args.mobile,
                    },
                )
                .await?;
                Ok(json!({}))
            }
        }
    }

    /// Close every remote page opened on this connection
    pub async fn close_all(&self) {
        let targets: Vec<(String, Target)> = {
            let mut state = self.state.lock();
            state.sessions.clear();
            state.nodes.clear();
            state.last_target = None;
            state.targets.drain().collect()
        };
        for (target_id, target) in targets {
            if let Err(e) = self.browser.close_page(&target.page_id).await {
                warn!(target_id, error = %e, "Failed to close remote page");
            }
        }
    }

    pub fn target_count(&self) -> usize {
        self.state.lock().targets.len()
    }
}

/// Serve CDP over an established WebSocket until it closes
pub async fn serve_connection<S>(ws: WebSocketStream<S>, browser: SharedBrowser, request_id: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let session = CdpSession::new(browser);
    let (mut tx, mut rx) = ws.split();
    let mut pending = FuturesUnordered::new();

    info!(request_id, "CDP connection opened");
    loop {
        tokio::select! {
            msg = rx.next() => match msg {
                Some(Ok(Message::Text(text))) => match session.begin(text.as_str()) {
                    Ok(call) => pending.push(Arc::clone(&session).dispatch(call)),
                    Err(response) => {
                        if tx.send(Message::text(response)).await.is_err() {
                            break;
                        }
                    }
                },
                Some(Ok(Message::Binary(data))) => {
                    let response = match std::str::from_utf8(data.as_ref()) {
                        Ok(text) => match session.begin(text) {
                            Ok(call) => {
                                pending.push(Arc::clone(&session).dispatch(call));
                                continue;
                            }
                            Err(response) => response,
                        },
                        Err(e) => error_body(None, &CdpError::Parse(e.to_string()), None),
                    };
                    if tx.send(Message::text(response)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(request_id, error = %e, "CDP WebSocket error");
                    break;
                }
            },
            Some(messages) = pending.next(), if !pending.is_empty() => {
                let mut sent = true;
                for message in messages {
                    if tx.send(Message::text(message)).await.is_err() {
                        sent = false;
                        break;
                    }
                }
                if !sent {
                    break;
                }
            }
        }
    }

    session.close_all().await;
    let _ = tx.close().await;
    info!(request_id, "CDP connection closed");
}

/// Accept a CDP WebSocket upgrade
pub fn accept_upgrade(
    req: Request<Incoming>,
    browser: SharedBrowser,
    request_id: String,
) -> Response<ResponseBody> {
    let Some(key) = req
        .headers()
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
    else {
        return json_error_response(ErrorCode::BadRequest, "WebSocket upgrade required");
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let ws =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                serve_connection(ws, browser, &request_id).await;
            }
            Err(e) => warn!(request_id, error = %e, "CDP upgrade failed"),
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(hyper::header::CONNECTION, "Upgrade")
        .header(hyper::header::UPGRADE, "websocket")
        .header("Sec-WebSocket-Accept", derive_accept_key(key.as_bytes()))
        .body(full_body(hyper::body::Bytes::new()))
        .expect("valid response builder")
}

/// Body of `/cdp/json/version`
pub fn version_info(ws_url: &str) -> Value {
    json!({
        "Browser": format!("sandgate/{}", env!("CARGO_PKG_VERSION")),
        "Protocol-Version": PROTOCOL_VERSION,
        "User-Agent": "",
        "V8-Version": "",
        "WebKit-Version": "",
        "webSocketDebuggerUrl": ws_url,
    })
}

/// Body of `/cdp/json/list`. Targets live per connection, so the list
/// advertises the single endpoint that creates them.
pub fn target_list(ws_url: &str) -> Value {
    json!([{
        "id": "sandgate",
        "type": "browser",
        "title": "Remote browser",
        "url": "about:blank",
        "description": "",
        "webSocketDebuggerUrl": ws_url,
    }])
}
