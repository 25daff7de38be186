//! WebSocket proxying with inspection of gateway frames
//!
//! The client handshake is completed here, a second connection is opened to
//! the gateway, and frames are relayed one message at a time. Gateway frames
//! that carry one of two known failure strings are replaced by a redirect
//! instruction; everything else is relayed unchanged.

use crate::error::{full_body, json_error_response, ErrorCode, ResponseBody};
use futures::{SinkExt, StreamExt};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Gateway text meaning the connection lacked the gateway token
pub const TOKEN_MISSING: &str = "gateway token missing";
/// Gateway text meaning the device has not been approved yet
pub const PAIRING_REQUIRED: &str = "pairing required";

/// Handshake and hop-by-hop headers that are not copied to the gateway
const SKIP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "content-length",
    "transfer-encoding",
    "keep-alive",
    "te",
];

/// Where redirects point for one proxied connection
#[derive(Debug, Clone)]
pub struct RedirectTargets {
    /// Path (and query, without `token`) the client connected to
    pub reconnect_path: String,
    /// Device approval UI
    pub admin_ui_path: String,
}

/// Redirect instruction sent in place of a failure frame
#[derive(Debug, Serialize)]
struct Redirect<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    reason: &'static str,
    location: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_param: Option<&'static str>,
}

fn redirect_message(text: &str, targets: &RedirectTargets) -> Option<Message> {
    let redirect = if text.contains(TOKEN_MISSING) {
        Redirect {
            kind: "redirect",
            reason: "gateway_token_missing",
            location: &targets.reconnect_path,
            query_param: Some("token"),
        }
    } else if text.contains(PAIRING_REQUIRED) {
        Redirect {
            kind: "redirect",
            reason: "pairing_required",
            location: &targets.admin_ui_path,
            query_param: None,
        }
    } else {
        return None;
    };
    serde_json::to_string(&redirect).ok().map(Message::text)
}

/// Messages to send to the client for one gateway message
pub fn rewrite_backend_message(msg: Message, targets: &RedirectTargets) -> Vec<Message> {
    let redirect = match &msg {
        Message::Text(text) => redirect_message(text.as_str(), targets),
        Message::Binary(data) => std::str::from_utf8(data.as_ref())
            .ok()
            .and_then(|text| redirect_message(text, targets)),
        Message::Close(Some(frame)) => redirect_message(&frame.reason.to_string(), targets),
        _ => None,
    };

    match (redirect, msg) {
        (None, msg) => vec![msg],
        (Some(redirect), Message::Close(Some(frame))) => vec![
            redirect,
            Message::Close(Some(CloseFrame {
                code: frame.code,
                reason: "redirect".into(),
            })),
        ],
        (Some(redirect), _) => vec![redirect],
    }
}

fn header_str<'a>(req: &'a Request<Incoming>, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Complete a client upgrade and relay it to `backend_url`
pub async fn proxy_websocket(
    req: Request<Incoming>,
    backend_url: String,
    targets: RedirectTargets,
    request_id: String,
) -> Response<ResponseBody> {
    let Some(key) = header_str(&req, "sec-websocket-key").map(String::from) else {
        return json_error_response(ErrorCode::BadRequest, "Missing Sec-WebSocket-Key");
    };

    let mut backend_req = match backend_url.as_str().into_client_request() {
        Ok(r) => r,
        Err(e) => {
            warn!(request_id, error = %e, "Invalid gateway WebSocket URL");
            return json_error_response(ErrorCode::InternalError, "Invalid gateway address");
        }
    };
    for (name, value) in req.headers() {
        if SKIP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        backend_req.headers_mut().insert(name.clone(), value.clone());
    }

    let (backend, backend_resp) = match tokio_tungstenite::connect_async(backend_req).await {
        Ok(pair) => pair,
        Err(WsError::Http(resp)) => {
            // Gateway refused the upgrade; hand its status back
            warn!(request_id, status = %resp.status(), "Gateway rejected WebSocket upgrade");
            let body = resp.body().clone().unwrap_or_default();
            return Response::builder()
                .status(resp.status())
                .body(full_body(body))
                .expect("valid response builder");
        }
        Err(e) => {
            warn!(request_id, error = %e, "Failed to connect to gateway WebSocket");
            return json_error_response(ErrorCode::ConnectionFailed, "Failed to connect to gateway");
        }
    };

    let mut response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(hyper::header::CONNECTION, "Upgrade")
        .header(hyper::header::UPGRADE, "websocket")
        .header("Sec-WebSocket-Accept", derive_accept_key(key.as_bytes()));
    if let Some(protocol) = backend_resp.headers().get("sec-websocket-protocol") {
        if let Ok(value) = HeaderValue::from_bytes(protocol.as_bytes()) {
            response = response.header(HeaderName::from_static("sec-websocket-protocol"), value);
        }
    }

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let client =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                info!(request_id, "WebSocket connected to gateway");
                splice(client, backend, &targets, &request_id).await;
            }
            Err(e) => warn!(request_id, error = %e, "Client upgrade failed"),
        }
    });

    response
        .body(full_body(hyper::body::Bytes::new()))
        .expect("valid response builder")
}

/// Relay frames both ways until either side closes, then close the other.
pub async fn splice<C, B>(
    client: WebSocketStream<C>,
    backend: WebSocketStream<B>,
    targets: &RedirectTargets,
    request_id: &str,
) where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_tx, mut client_rx) = client.split();
    let (mut backend_tx, mut backend_rx) = backend.split();

    'relay: loop {
        tokio::select! {
            msg = client_rx.next() => match msg {
                Some(Ok(Message::Close(frame))) => {
                    debug!(request_id, "Client closed WebSocket");
                    let _ = backend_tx.send(Message::Close(frame)).await;
                    break;
                }
                Some(Ok(msg)) => {
                    if backend_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!(request_id, error = %e, "Client WebSocket error");
                    break;
                }
                None => break,
            },
            msg = backend_rx.next() => match msg {
                Some(Ok(msg)) => {
                    let closing = matches!(msg, Message::Close(_));
                    for out in rewrite_backend_message(msg, targets) {
                        if client_tx.send(out).await.is_err() {
                            break 'relay;
                        }
                    }
                    if closing {
                        debug!(request_id, "Gateway closed WebSocket");
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!(request_id, error = %e, "Gateway WebSocket error");
                    let _ = client_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Away,
                            reason: "gateway connection lost".into(),
                        })))
                        .await;
                    break;
                }
                None => break,
            },
        }
    }

    let _ = client_tx.close().await;
    let _ = backend_tx.close().await;
    debug!(request_id, "WebSocket relay finished");
}
