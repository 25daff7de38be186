//! Admin and debug API handlers
//!
//! Callers are authenticated by the proxy before these run.

use crate::devices::DeviceError;
use crate::error::{json_error_response, json_response, ErrorCode, ResponseBody};
use crate::proxy::GatewayState;
use crate::storage::StorageError;
use crate::supervisor::SupervisorError;
use hyper::{Method, Response, StatusCode};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

pub const ADMIN_PREFIX: &str = "/api/admin/";
pub const DEBUG_PREFIX: &str = "/debug/";

fn storage_error_response(err: &StorageError) -> Response<ResponseBody> {
    match err {
        StorageError::SyncInProgress => {
            json_error_response(ErrorCode::SyncInProgress, "A sync is already running")
        }
        StorageError::NotConfigured => {
            json_error_response(ErrorCode::StorageUnavailable, "Durable storage is not configured")
        }
        StorageError::Mount(_) => {
            json_error_response(ErrorCode::StorageUnavailable, "Durable storage is not mounted")
        }
        StorageError::MissingSource(what) => json_error_response(
            ErrorCode::BadRequest,
            format!("Nothing to back up: {} is missing", what),
        ),
        StorageError::Sync(_) | StorageError::Sandbox(_) => {
            json_error_response(ErrorCode::InternalError, "Sync failed")
        }
    }
}

fn device_error_response(err: &DeviceError) -> Response<ResponseBody> {
    match err {
        DeviceError::InvalidId(_) => json_error_response(ErrorCode::BadRequest, "Invalid request id"),
        DeviceError::Parse(_) => json_error_response(
            ErrorCode::ConnectionFailed,
            "Gateway returned an unexpected device list",
        ),
        DeviceError::Sandbox(_) => {
            json_error_response(ErrorCode::InternalError, "Failed to run the gateway CLI")
        }
    }
}

fn supervisor_error_response(err: &SupervisorError) -> Response<ResponseBody> {
    match err {
        SupervisorError::NotRunning => {
            json_error_response(ErrorCode::NotFound, "Gateway is not running")
        }
        _ => json_error_response(ErrorCode::InternalError, "Sandbox unavailable"),
    }
}

/// Route an admin request. `None` means no such route.
pub async fn route_admin(
    method: &Method,
    path: &str,
    state: &Arc<GatewayState>,
) -> Option<Response<ResponseBody>> {
    let rest = path.strip_prefix(ADMIN_PREFIX)?;
    let segments: Vec<&str> = rest.trim_end_matches('/').split('/').collect();

    let response = match (method, segments.as_slice()) {
        (&Method::GET, ["devices"]) => match state.devices.list().await {
            Ok(list) => json_response(StatusCode::OK, &list),
            Err(e) => {
                warn!(error = %e, "Device list failed");
                device_error_response(&e)
            }
        },
        (&Method::POST, ["devices", "approve-all"]) => match state.devices.approve_all().await {
            Ok(result) => json_response(StatusCode::OK, &result),
            Err(e) => {
                warn!(error = %e, "Approve-all failed");
                device_error_response(&e)
            }
        },
        (&Method::POST, ["devices", id, "approve"]) => {
            let id = urlencoding::decode(id).map(|s| s.into_owned()).unwrap_or_default();
            match state.devices.approve(&id).await {
                Ok(result) => {
                    let status = if result.success {
                        StatusCode::OK
                    } else {
                        StatusCode::BAD_GATEWAY
                    };
                    json_response(status, &result)
                }
                Err(e) => device_error_response(&e),
            }
        }
        (&Method::GET, ["storage"]) => json_response(StatusCode::OK, &state.storage.status().await),
        (&Method::POST, ["storage", "sync"]) => match state.storage.sync_out().await {
            Ok(last_sync) => json_response(
                StatusCode::OK,
                &json!({ "success": true, "lastSync": last_sync }),
            ),
            Err(e) => {
                warn!(error = %e, "Manual sync failed");
                storage_error_response(&e)
            }
        },
        (&Method::POST, ["gateway", "restart"]) => {
            let supervisor = Arc::clone(&state.supervisor);
            tokio::spawn(async move {
                match supervisor.restart().await {
                    Ok(process) => info!(id = %process.id, "Gateway restarted"),
                    Err(e) => error!(error = %e, "Gateway restart failed"),
                }
            });
            json_response(
                StatusCode::ACCEPTED,
                &json!({ "success": true, "message": "Gateway restart initiated" }),
            )
        }
        _ => return None,
    };
    Some(response)
}

/// Route a debug request. `None` means no such route.
pub async fn route_debug(
    method: &Method,
    path: &str,
    state: &Arc<GatewayState>,
) -> Option<Response<ResponseBody>> {
    if method != Method::GET {
        return None;
    }
    let response = match path.strip_prefix(DEBUG_PREFIX)?.trim_end_matches('/') {
        "processes" => match state.supervisor.sandbox().list_processes().await {
            Ok(processes) => json_response(StatusCode::OK, &json!({ "processes": processes })),
            Err(e) => supervisor_error_response(&SupervisorError::from(e)),
        },
        "logs" => match state.supervisor.logs().await {
            Ok(logs) => json_response(StatusCode::OK, &logs),
            Err(e) => supervisor_error_response(&e),
        },
        "pool" => json_response(StatusCode::OK, &state.pool.stats()),
        "version" => json_response(
            StatusCode::OK,
            &json!({ "name": PKG_NAME, "version": VERSION }),
        ),
        _ => return None,
    };
    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::tests::test_state;

    #[test]
    fn test_storage_error_mapping() {
        assert_eq!(
            storage_error_response(&StorageError::SyncInProgress).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            storage_error_response(&StorageError::NotConfigured).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        let resp = storage_error_response(&StorageError::Mount("no mount".to_string()));
        assert_eq!(resp.headers().get("X-Gateway-Error").unwrap(), "STORAGE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_unknown_admin_route() {
        let state = test_state();
        assert!(route_admin(&Method::GET, "/api/admin/nope", &state).await.is_none());
        assert!(route_admin(&Method::DELETE, "/api/admin/devices", &state).await.is_none());
        assert!(route_admin(&Method::GET, "/other", &state).await.is_none());
    }

    #[tokio::test]
    async fn test_storage_routes_without_configuration() {
        let state = test_state();
        let resp = route_admin(&Method::GET, "/api/admin/storage", &state).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = route_admin(&Method::POST, "/api/admin/storage/sync", &state).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_device_routes() {
        let state = test_state();
        let resp = route_admin(&Method::GET, "/api/admin/devices", &state).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = route_admin(&Method::POST, "/api/admin/devices/req-1/approve", &state)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_debug_routes() {
        let state = test_state();
        let resp = route_debug(&Method::GET, "/debug/processes", &state).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = route_debug(&Method::GET, "/debug/logs", &state).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = route_debug(&Method::GET, "/debug/pool", &state).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        assert!(route_debug(&Method::POST, "/debug/logs", &state).await.is_none());
    }
}
