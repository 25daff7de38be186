//! Connection pool for HTTP requests forwarded to the gateway
//!
//! Requests are streamed through a pooled hyper client. No timeout is applied
//! here: a slow gateway response is the gateway's business.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStatsSnapshot {
    pub total_requests: u64,
    pub failed_requests: u64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
        }
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Append `key=value` to a path-and-query string
pub fn append_query(path_and_query: &str, key: &str, value: &str) -> String {
    let separator = if path_and_query.contains('?') { '&' } else { '?' };
    format!(
        "{}{}{}={}",
        path_and_query,
        separator,
        key,
        urlencoding::encode(value)
    )
}

/// Value of a query parameter, percent-decoded
pub fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k == key {
            urlencoding::decode(v).ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

/// A connection pool for HTTP connections to the gateway
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    stats: PoolStats,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: PoolStats::default(),
        }
    }

    /// Forwarded request counters
    pub fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot()
    }

    /// Forward a request to `host:port` at `path_and_query`, keeping method,
    /// headers and body.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        host: &str,
        port: u16,
        path_and_query: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let uri = format!("http://{}:{}{}", host, port, path_and_query);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let backend_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        let response = self.client.request(backend_req).await.map_err(|e| {
            self.stats.record_failure();
            PoolError::from(e)
        })?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();
        stats.record_request();
        stats.record_request();
        stats.record_failure();

        let snap = stats.snapshot();
        assert_eq!(snap.total_requests, 2);
        assert_eq!(snap.failed_requests, 1);
    }

    #[test]
    fn test_append_query() {
        assert_eq!(append_query("/", "token", "abc"), "/?token=abc");
        assert_eq!(append_query("/chat?x=1", "token", "a b&c"), "/chat?x=1&token=a%20b%26c");
    }

    #[test]
    fn test_query_param() {
        assert_eq!(query_param(Some("a=1&token=x%2Fy"), "token").as_deref(), Some("x/y"));
        assert_eq!(query_param(Some("flag&b=2"), "flag").as_deref(), Some(""));
        assert_eq!(query_param(Some("a=1"), "token"), None);
        assert_eq!(query_param(None, "token"), None);
    }

    #[tokio::test]
    async fn test_failed_forward_is_counted() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        // Feed a real Incoming body through a loopback server
        let server = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_port = server.local_addr().unwrap().port();
        let pool = std::sync::Arc::new(ConnectionPool::new(PoolConfig::default()));
        let forward = std::sync::Arc::clone(&pool);
        tokio::spawn(async move {
            let (stream, _) = server.accept().await.unwrap();
            let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                let pool = std::sync::Arc::clone(&forward);
                async move {
                    let status = match pool.send_request(req, "127.0.0.1", port, "/x").await {
                        Ok(_) => hyper::StatusCode::OK,
                        Err(_) => hyper::StatusCode::BAD_GATEWAY,
                    };
                    Ok::<_, std::convert::Infallible>(
                        Response::builder()
                            .status(status)
                            .body(http_body_util::Empty::<Bytes>::new())
                            .unwrap(),
                    )
                }
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(hyper_util::rt::TokioIo::new(stream), service)
                .await;
        });

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", server_port)).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(
            &mut stream,
            b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();
        let mut response = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut stream, &mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 502"));

        let stats = pool.stats();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.failed_requests, 1);
    }

    #[test]
    fn test_pool_creation() {
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
        });
        let stats = pool.stats();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.failed_requests, 0);
    }
}
