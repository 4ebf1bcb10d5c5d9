//! Request signing for the pub/sub endpoint
//!
//! Every connect, subscribe and publish carries an authorization header map.
//! The signer producing it is opaque to the transport: an API key, static
//! headers, or a closure wrapping an external credential provider.

use crate::error::TransportError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// What is being signed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningRequest {
    /// Host of the HTTP API the realtime endpoint belongs to
    pub host: String,
    /// URL the request is addressed to
    pub url: String,
    /// Request body (`{}` for the connection itself)
    pub body: String,
}

/// Produces authorization headers for a request
pub trait RequestSigner: Send + Sync {
    /// Sign one request
    fn sign(&self, request: &SigningRequest) -> Result<BTreeMap<String, String>, TransportError>;
}

/// API key authorization
pub struct ApiKeySigner {
    api_key: String,
}

impl ApiKeySigner {
    /// Create a signer for an API key
    pub fn new(api_key: impl Into<String>) -> Self {
        ApiKeySigner {
            api_key: api_key.into(),
        }
    }
}

impl fmt::Debug for ApiKeySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeySigner")
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl RequestSigner for ApiKeySigner {
    fn sign(&self, request: &SigningRequest) -> Result<BTreeMap<String, String>, TransportError> {
        if self.api_key.is_empty() {
            return Err(TransportError::AuthFailed("API key is empty".to_string()));
        }
        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), request.host.clone());
        headers.insert("x-api-key".to_string(), self.api_key.clone());
        headers.insert("x-amz-date".to_string(), amz_date(Utc::now()));
        Ok(headers)
    }
}

/// Fixed headers, for endpoints authorized by a pre-issued token
#[derive(Debug, Clone, Default)]
pub struct StaticHeaders(pub BTreeMap<String, String>);

impl RequestSigner for StaticHeaders {
    fn sign(&self, request: &SigningRequest) -> Result<BTreeMap<String, String>, TransportError> {
        let mut headers = self.0.clone();
        headers
            .entry("host".to_string())
            .or_insert_with(|| request.host.clone());
        Ok(headers)
    }
}

type SignFn = dyn Fn(&SigningRequest) -> Result<BTreeMap<String, String>, TransportError>
    + Send
    + Sync;

/// Signer backed by a closure
pub struct FnSigner(Box<SignFn>);

impl FnSigner {
    /// Wrap a signing closure
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&SigningRequest) -> Result<BTreeMap<String, String>, TransportError>
            + Send
            + Sync
            + 'static,
    {
        FnSigner(Box::new(f))
    }
}

impl RequestSigner for FnSigner {
    fn sign(&self, request: &SigningRequest) -> Result<BTreeMap<String, String>, TransportError> {
        (self.0)(request)
    }
}

/// Encode signed headers as the `header-` WebSocket subprotocol
pub fn encode_auth_subprotocol(
    headers: &BTreeMap<String, String>,
) -> Result<String, TransportError> {
    let json = serde_json::to_vec(headers)
        .map_err(|e| TransportError::AuthFailed(format!("Failed to encode headers: {}", e)))?;
    Ok(format!("header-{}", URL_SAFE_NO_PAD.encode(json)))
}

/// Format a timestamp as `YYYYMMDD'T'HHMMSS'Z'`
fn amz_date(now: DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%SZ").to_string()
}
