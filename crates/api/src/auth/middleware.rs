//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE, USER_AGENT},
        HeaderMap, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use super::cookies::REFRESH_COOKIE;
use super::tokens::{ClientMeta, TokenError, TokenService};

/// Verified identity of the caller, inserted into request extensions
///
/// Handlers receive it through `Extension<AuthUser>`; nothing downstream mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: String,
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub tokens: TokenService,
}

/// Extract the bearer token from the Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::trim)
        // Clients sometimes send the literal strings "undefined" or "null"
        .filter(|token| !token.is_empty() && *token != "undefined" && *token != "null")
        .map(String::from)
}

/// Extract the rotating refresh token from its HttpOnly cookie
pub fn extract_refresh_cookie(headers: &HeaderMap) -> Option<String> {
    let prefix = format!("{REFRESH_COOKIE}=");
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .map(str::trim)
        .find_map(|cookie| cookie.strip_prefix(prefix.as_str()))
        .filter(|token| !token.is_empty())
        .map(String::from)
}

/// Extract IP address from request headers (X-Forwarded-For, CF-Connecting-IP or X-Real-IP)
pub fn extract_ip_address(headers: &HeaderMap) -> Option<String> {
    // X-Forwarded-For may contain multiple IPs, take first
    if let Some(xff) = headers.get("X-Forwarded-For").and_then(|h| h.to_str().ok()) {
        if let Some(first) = xff.split(',').next().map(str::trim).filter(|s| !s.is_empty()) {
            return Some(first.to_string());
        }
    }
    ["CF-Connecting-IP", "X-Real-IP"]
        .iter()
        .find_map(|name| headers.get(*name).and_then(|h| h.to_str().ok()))
        .map(String::from)
}

pub fn client_meta(headers: &HeaderMap) -> ClientMeta {
    ClientMeta {
        ip_address: extract_ip_address(headers),
        user_agent: headers
            .get(USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .map(String::from),
    }
}

/// Middleware that requires a valid access token
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(token) = extract_bearer_token(request.headers()) else {
        tracing::debug!(path = %path, "require_auth: no bearer token");
        return AuthError::MissingAuth.into_response();
    };

    match auth_state.tokens.verify_access_token(&token) {
        Ok(claims) => {
            tracing::debug!(path = %path, user_id = %claims.sub, "require_auth: authenticated");
            request.extensions_mut().insert(AuthUser {
                user_id: claims.sub,
                email: claims.email,
            });
            next.run(request).await
        }
        Err(err) => {
            tracing::info!(path = %path, error = %err, "require_auth: authentication failed");
            AuthError::from(err).into_response()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Token expired")]
    TokenExpired,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<TokenError> for AuthError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::TokenExpired => AuthError::TokenExpired,
            TokenError::TokenMalformed | TokenError::TokenRevoked => AuthError::InvalidToken,
            TokenError::SigningKeyUnavailable(msg) => AuthError::Internal(msg),
            TokenError::Persistence(e) => AuthError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, error, message) = match &self {
            AuthError::MissingAuth => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Authentication required",
            ),
            AuthError::TokenExpired => (StatusCode::UNAUTHORIZED, "token_expired", "Token expired"),
            AuthError::InvalidToken => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Invalid or expired token",
            ),
            AuthError::Internal(detail) => {
                tracing::error!(error = %detail, "Authentication failed internally");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error",
                )
            }
        };

        let body = Json(json!({
            "error": error,
            "message": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_bearer_token_extraction() {
        assert_eq!(
            extract_bearer_token(&headers(&[("authorization", "Bearer abc.def.ghi")])),
            Some("abc.def.ghi".to_string())
        );
        assert_eq!(extract_bearer_token(&headers(&[("authorization", "Basic xyz")])), None);
        assert_eq!(
            extract_bearer_token(&headers(&[("authorization", "Bearer undefined")])),
            None
        );
        assert_eq!(extract_bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn test_refresh_cookie_extraction() {
        let map = headers(&[("cookie", "theme=dark; tokenRefresh=r.t.k; other=1")]);
        assert_eq!(extract_refresh_cookie(&map), Some("r.t.k".to_string()));

        let split = headers(&[("cookie", "theme=dark"), ("cookie", "tokenRefresh=second")]);
        assert_eq!(extract_refresh_cookie(&split), Some("second".to_string()));

        assert_eq!(extract_refresh_cookie(&headers(&[("cookie", "tokenRefresh=")])), None);
    }

    #[test]
    fn test_ip_extraction_order() {
        let map = headers(&[
            ("x-forwarded-for", "198.51.100.1, 10.0.0.1"),
            ("x-real-ip", "10.0.0.2"),
        ]);
        assert_eq!(extract_ip_address(&map), Some("198.51.100.1".to_string()));
        assert_eq!(
            extract_ip_address(&headers(&[("x-real-ip", "10.0.0.2")])),
            Some("10.0.0.2".to_string())
        );
        assert_eq!(extract_ip_address(&HeaderMap::new()), None);
    }

    #[test]
    fn test_client_meta_reads_user_agent() {
        let meta = client_meta(&headers(&[("user-agent", "wizpix-test/1.0")]));
        assert_eq!(meta.user_agent.as_deref(), Some("wizpix-test/1.0"));
        assert_eq!(meta.ip_address, None);
    }
}
