//! Static bearer-token authentication for the write endpoints.

use std::fmt;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header::AUTHORIZATION, HeaderMap};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::ApiError;
use crate::AppState;

/// The configured API secret. Only its SHA-256 digest is kept, so presented
/// tokens of any length compare in constant time.
#[derive(Clone, Default)]
pub struct ApiToken {
    digest: Option<[u8; 32]>,
}

impl ApiToken {
    /// A blank secret disables every authenticated route.
    pub fn new(secret: &str) -> Self {
        if secret.trim().is_empty() {
            return Self::disabled();
        }
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&Sha256::digest(secret.as_bytes()));
        Self {
            digest: Some(digest),
        }
    }

    pub fn disabled() -> Self {
        Self { digest: None }
    }

    pub fn from_optional(secret: Option<&str>) -> Self {
        secret.map(Self::new).unwrap_or_default()
    }

    pub fn is_configured(&self) -> bool {
        self.digest.is_some()
    }

    pub fn verify(&self, presented: &str) -> bool {
        let Some(expected) = &self.digest else {
            return false;
        };
        let actual = Sha256::digest(presented.as_bytes());
        constant_time_eq(expected, actual.as_slice())
    }

    /// Short digest prefix, safe to log.
    pub fn fingerprint(&self) -> Option<String> {
        self.digest.map(|digest| hex::encode(&digest[..4]))
    }
}

impl fmt::Debug for ApiToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiToken")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Rejects the request with 401 unless it carries the configured token.
/// Runs before any body extraction.
pub async fn require_bearer(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let authorized = bearer_token(request.headers())
        .map(|token| state.api_token.verify(token))
        .unwrap_or(false);
    if !authorized {
        warn!(path = %request.uri().path(), "rejected request without a valid token");
        return ApiError::Unauthorized.into_response();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn verify_accepts_only_the_configured_secret() {
        let token = ApiToken::new("s3cret");
        assert!(token.verify("s3cret"));
        assert!(!token.verify("s3cret "));
        assert!(!token.verify(""));
        assert!(!token.verify("a much longer token than the secret"));
    }

    #[test]
    fn blank_or_missing_secret_rejects_everything() {
        assert!(!ApiToken::new("  ").verify("  "));
        assert!(!ApiToken::from_optional(None).is_configured());
        assert!(!ApiToken::disabled().verify(""));
    }

    #[test]
    fn debug_output_never_contains_the_secret() {
        let token = ApiToken::new("s3cret");
        let printed = format!("{token:?}");
        assert!(!printed.contains("s3cret"));
        assert_eq!(token.fingerprint().map(|f| f.len()), Some(8));
    }

    #[test]
    fn bearer_token_is_read_from_the_authorization_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }
}
