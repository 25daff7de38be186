//! Request authentication
//!
//! Two paths: a shared secret compared in constant time (device token, CDP
//! secret) and a signed identity token verified against the identity
//! provider's published key set. Every attempt yields an [`AuthDecision`];
//! the HTTP layer only ever reports a generic 401/403.

use crate::config::AuthSettings;
use crate::error::{json_error_response, ErrorCode, ResponseBody};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Clock skew tolerated on `exp`
const LEEWAY_SECS: u64 = 30;

/// Minimum spacing between key set fetches triggered by unknown `kid`s
const JWKS_REFRESH_COOLDOWN: Duration = Duration::from_secs(60);

/// Why a verification attempt failed. Logged, never sent to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("no token")]
    NoToken,
    #[error("bad signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("wrong audience")]
    WrongAudience,
    #[error("wrong issuer")]
    WrongIssuer,
    #[error("unknown signing key")]
    UnknownKey,
    #[error("malformed token")]
    Malformed,
    #[error("key set unavailable")]
    KeysUnavailable,
    #[error("identity verification not configured")]
    NotConfigured,
}

/// Claims surfaced from a verified identity token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub iss: Option<String>,
    pub exp: i64,
    /// Set only for identities granted by the dev-mode bypass
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dev_mode: bool,
}

impl Claims {
    fn dev() -> Self {
        Self {
            sub: Some("dev".to_string()),
            email: Some("dev@localhost".to_string()),
            iss: None,
            exp: i64::MAX,
            dev_mode: true,
        }
    }
}

/// Result of one verification attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AuthDecision {
    Rejected(RejectReason),
    /// Caller presented the shared token; carries the device label
    DeviceToken(String),
    UserIdentity(Claims),
}

impl AuthDecision {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, AuthDecision::Rejected(_))
    }
}

/// Compare two strings in constant time (for the same length)
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Shared-secret check. An unset expected secret rejects everything.
pub fn check_shared_secret(provided: Option<&str>, expected: Option<&str>) -> AuthDecision {
    match (provided, expected) {
        (_, None) => AuthDecision::Rejected(RejectReason::NotConfigured),
        (None, _) => AuthDecision::Rejected(RejectReason::NoToken),
        (Some(p), Some(e)) if !p.is_empty() && constant_time_compare(p, e) => {
            AuthDecision::DeviceToken("shared-secret".to_string())
        }
        (Some(_), Some(_)) => AuthDecision::Rejected(RejectReason::BadSignature),
    }
}

/// Value of a named cookie from a Cookie header
pub fn cookie_value(cookie_header: &str, name: &str) -> Option<String> {
    cookie_header.split(';').find_map(|cookie| {
        cookie
            .trim()
            .strip_prefix(name)
            .and_then(|rest| rest.strip_prefix('='))
            .filter(|v| !v.is_empty())
            .map(String::from)
    })
}

/// Generic response for a rejection; the reason stays in the logs
pub fn rejection_response(reason: &RejectReason) -> hyper::Response<ResponseBody> {
    match reason {
        RejectReason::NoToken => json_error_response(ErrorCode::Unauthorized, "Unauthorized"),
        _ => json_error_response(ErrorCode::Forbidden, "Forbidden"),
    }
}

pub struct AuthGate {
    settings: AuthSettings,
    keys: RwLock<HashMap<String, DecodingKey>>,
    http: reqwest::Client,
    /// Keys were supplied up front; never fetch
    static_keys: bool,
    last_refresh: Mutex<Option<Instant>>,
}

impl AuthGate {
    pub fn new(settings: AuthSettings) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(JWKS_FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            settings,
            keys: RwLock::new(HashMap::new()),
            http,
            static_keys: false,
            last_refresh: Mutex::new(None),
        })
    }

    /// Gate with a fixed key set
    pub fn with_key_set(settings: AuthSettings, set: &JwkSet) -> Arc<Self> {
        let gate = Self {
            settings,
            keys: RwLock::new(HashMap::new()),
            http: reqwest::Client::new(),
            static_keys: true,
            last_refresh: Mutex::new(None),
        };
        gate.load_keys(set);
        Arc::new(gate)
    }

    fn load_keys(&self, set: &JwkSet) -> usize {
        let mut keys = self.keys.write();
        for jwk in &set.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                continue;
            };
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    keys.insert(kid, key);
                }
                Err(e) => debug!(kid, error = %e, "Skipping unusable key"),
            }
        }
        keys.len()
    }

    async fn refresh_keys(&self) -> Result<(), RejectReason> {
        if self.static_keys {
            return Ok(());
        }
        let url = self.settings.jwks_url().ok_or(RejectReason::NotConfigured)?;

        let set: JwkSet = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                warn!(url, error = %e, "Failed to fetch identity key set");
                RejectReason::KeysUnavailable
            })?
            .json()
            .await
            .map_err(|e| {
                warn!(url, error = %e, "Invalid identity key set");
                RejectReason::KeysUnavailable
            })?;

        let count = self.load_keys(&set);
        info!(keys = count, "Identity key set refreshed");
        Ok(())
    }

    /// Claim the next key set fetch, at most one per cooldown
    fn begin_refresh(&self) -> bool {
        let mut last = self.last_refresh.lock();
        match *last {
            Some(at) if at.elapsed() < JWKS_REFRESH_COOLDOWN => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    async fn key_for(&self, kid: &str) -> Result<DecodingKey, RejectReason> {
        if let Some(key) = self.keys.read().get(kid) {
            return Ok(key.clone());
        }
        if !self.begin_refresh() {
            debug!(kid, "Unknown signing key, key set fetched recently");
            return Err(RejectReason::UnknownKey);
        }
        self.refresh_keys().await?;
        self.keys
            .read()
            .get(kid)
            .cloned()
            .ok_or(RejectReason::UnknownKey)
    }

    /// Verify a signed identity token
    pub async fn verify_identity(&self, token: &str) -> AuthDecision {
        match self.verify(token).await {
            Ok(claims) => AuthDecision::UserIdentity(claims),
            Err(reason) => AuthDecision::Rejected(reason),
        }
    }

    async fn verify(&self, token: &str) -> Result<Claims, RejectReason> {
        let (Some(audience), Some(issuer)) = (&self.settings.audience, self.settings.issuer()) else {
            return Err(RejectReason::NotConfigured);
        };

        let header = decode_header(token).map_err(|_| RejectReason::Malformed)?;
        if header.alg != Algorithm::RS256 {
            return Err(RejectReason::BadSignature);
        }
        let kid = header.kid.ok_or(RejectReason::UnknownKey)?;
        let key = self.key_for(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[audience]);
        validation.set_issuer(&[issuer]);
        validation.leeway = LEEWAY_SECS;

        decode::<Claims>(token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => RejectReason::BadSignature,
                ErrorKind::ExpiredSignature => RejectReason::Expired,
                ErrorKind::InvalidAudience => RejectReason::WrongAudience,
                ErrorKind::InvalidIssuer => RejectReason::WrongIssuer,
                _ => RejectReason::Malformed,
            })
    }

    /// Signed-identity check for admin and debug routes
    pub async fn authenticate_user(&self, headers: &hyper::HeaderMap) -> AuthDecision {
        if self.settings.dev_mode {
            debug!(dev_mode = true, "Identity check bypassed");
            return AuthDecision::UserIdentity(Claims::dev());
        }

        let token = headers
            .get(self.settings.jwt_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .or_else(|| {
                headers
                    .get(hyper::header::COOKIE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|c| cookie_value(c, &self.settings.jwt_cookie))
            });

        let decision = match token {
            Some(token) => self.verify_identity(&token).await,
            None => AuthDecision::Rejected(RejectReason::NoToken),
        };
        if let AuthDecision::Rejected(reason) = &decision {
            debug!(%reason, "Identity rejected");
        }
        decision
    }

    /// Check for the catch-all proxy: gateway token in the query, else identity
    pub async fn authenticate_proxy(
        &self,
        headers: &hyper::HeaderMap,
        query_token: Option<&str>,
    ) -> AuthDecision {
        if let Some(provided) = query_token {
            if let d @ AuthDecision::DeviceToken(_) =
                check_shared_secret(Some(provided), self.settings.gateway_token.as_deref())
            {
                return d;
            }
        }
        self.authenticate_user(headers).await
    }

    /// Shared-secret check for the CDP endpoints
    pub fn authenticate_cdp(&self, secret: Option<&str>) -> AuthDecision {
        check_shared_secret(secret, self.settings.cdp_secret.as_deref())
    }
}
