//! Refresh token cookie policy

use axum::http::{header::InvalidHeaderValue, HeaderValue};

use crate::config::AppEnv;

pub const REFRESH_COOKIE: &str = "tokenRefresh";

/// Only the auth routes ever need the refresh cookie
pub const REFRESH_COOKIE_PATH: &str = "/api/auth";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookiePolicy {
    pub secure: bool,
    pub same_site: &'static str,
    pub domain: Option<String>,
    pub path: &'static str,
    pub max_age_secs: i64,
}

impl CookiePolicy {
    /// `Secure; SameSite=None` in production, `SameSite=Lax` over plain HTTP in development
    pub fn for_env(app_env: AppEnv, domain: Option<String>, max_age_secs: i64) -> Self {
        let production = app_env.is_production();
        Self {
            secure: production,
            same_site: if production { "None" } else { "Lax" },
            domain,
            path: REFRESH_COOKIE_PATH,
            max_age_secs,
        }
    }

    pub fn refresh_cookie(&self, token: &str) -> Result<HeaderValue, InvalidHeaderValue> {
        HeaderValue::from_str(&self.serialize(token, self.max_age_secs))
    }

    /// Expire the refresh cookie with the same scope it was set with
    pub fn clear_refresh_cookie(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        HeaderValue::from_str(&self.serialize("", 0))
    }

    fn serialize(&self, value: &str, max_age: i64) -> String {
        let mut parts = vec![format!("{REFRESH_COOKIE}={value}")];
        parts.push(format!("Max-Age={max_age}"));
        if let Some(ref domain) = self.domain {
            parts.push(format!("Domain={domain}"));
        }
        parts.push(format!("Path={}", self.path));
        if self.secure {
            parts.push("Secure".into());
        }
        parts.push("HttpOnly".into());
        parts.push(format!("SameSite={}", self.same_site));
        parts.join("; ")
    }
}
