//! Process configuration loaded from environment variables

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;
use wizpix_billing::QuotaEnforcement;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Production,
}

impl AppEnv {
    pub fn is_production(self) -> bool {
        matches!(self, AppEnv::Production)
    }
}

impl FromStr for AppEnv {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(AppEnv::Production),
            "development" | "dev" | "test" => Ok(AppEnv::Development),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub app_env: AppEnv,
    pub jwt_private_key_path: PathBuf,
    pub jwt_public_key_path: PathBuf,
    pub access_token_minutes: i64,
    /// Refresh token lifetime; the refresh cookie uses the same max-age
    pub refresh_token_minutes: i64,
    pub cookie_domain: Option<String>,
    pub allowed_origins: Vec<String>,
    pub run_migrations: bool,
    pub quota_enforcement: QuotaEnforcement,
    pub checkout_stale_after_minutes: i64,
    pub frontend_url: String,
    pub enable_billing: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let app_env = match optional("APP_ENV") {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                name: "APP_ENV",
                value,
            })?,
            None => AppEnv::Development,
        };

        let default_refresh = if app_env.is_production() { 15 } else { 60 };

        let quota_enforcement = match optional("QUOTA_ENFORCEMENT") {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                name: "QUOTA_ENFORCEMENT",
                value,
            })?,
            None => QuotaEnforcement::default(),
        };

        let allowed_origins = optional("ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            bind_address: optional("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            app_env,
            jwt_private_key_path: required("JWT_PRIVATE_KEY_PATH")?.into(),
            jwt_public_key_path: required("JWT_PUBLIC_KEY_PATH")?.into(),
            access_token_minutes: positive("JWT_ACCESS_EXPIRES_MINUTES", 15)?,
            refresh_token_minutes: positive("JWT_REFRESH_EXPIRES_MINUTES", default_refresh)?,
            cookie_domain: optional("COOKIE_DOMAIN"),
            allowed_origins,
            run_migrations: flag("RUN_MIGRATIONS", true)?,
            quota_enforcement,
            checkout_stale_after_minutes: positive("CHECKOUT_STALE_AFTER_MINUTES", 1440)?,
            frontend_url: optional("FRONTEND_URL")
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
            enable_billing: flag("ENABLE_BILLING", false)?,
        })
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::Missing(name))
}

fn positive(name: &'static str, default: i64) -> Result<i64, ConfigError> {
    match optional(name) {
        None => Ok(default),
        Some(value) => match value.trim().parse::<i64>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(ConfigError::Invalid { name, value }),
        },
    }
}

fn flag(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match optional(name) {
        None => Ok(default),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { name, value }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "DATABASE_URL",
        "BIND_ADDRESS",
        "APP_ENV",
        "JWT_PRIVATE_KEY_PATH",
        "JWT_PUBLIC_KEY_PATH",
        "JWT_ACCESS_EXPIRES_MINUTES",
        "JWT_REFRESH_EXPIRES_MINUTES",
        "COOKIE_DOMAIN",
        "ALLOWED_ORIGINS",
        "RUN_MIGRATIONS",
        "QUOTA_ENFORCEMENT",
        "CHECKOUT_STALE_AFTER_MINUTES",
        "FRONTEND_URL",
        "ENABLE_BILLING",
    ];

    fn reset() {
        for var in VARS {
            env::remove_var(var);
        }
        env::set_var("DATABASE_URL", "postgres://localhost/wizpix");
        env::set_var("JWT_PRIVATE_KEY_PATH", "keys/private.pem");
        env::set_var("JWT_PUBLIC_KEY_PATH", "keys/public.pem");
    }

    #[test]
    #[serial]
    fn test_defaults() {
        reset();
        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.app_env, AppEnv::Development);
        assert_eq!(config.access_token_minutes, 15);
        assert_eq!(config.refresh_token_minutes, 60);
        assert!(config.run_migrations);
        assert!(!config.enable_billing);
        assert_eq!(config.quota_enforcement, QuotaEnforcement::Strict);
        assert_eq!(config.checkout_stale_after_minutes, 1440);
        assert_eq!(config.allowed_origins.len(), 2);
    }

    #[test]
    #[serial]
    fn test_production_shortens_refresh_lifetime() {
        reset();
        env::set_var("APP_ENV", "production");
        let config = Config::from_env().unwrap();
        assert!(config.app_env.is_production());
        assert_eq!(config.refresh_token_minutes, 15);

        env::set_var("JWT_REFRESH_EXPIRES_MINUTES", "30");
        assert_eq!(Config::from_env().unwrap().refresh_token_minutes, 30);
        env::remove_var("APP_ENV");
        env::remove_var("JWT_REFRESH_EXPIRES_MINUTES");
    }

    #[test]
    #[serial]
    fn test_missing_database_url() {
        reset();
        env::remove_var("DATABASE_URL");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    #[serial]
    fn test_invalid_values_are_rejected() {
        reset();
        env::set_var("QUOTA_ENFORCEMENT", "sometimes");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid { name: "QUOTA_ENFORCEMENT", .. }
        ));

        reset();
        env::set_var("JWT_ACCESS_EXPIRES_MINUTES", "0");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid { name: "JWT_ACCESS_EXPIRES_MINUTES", .. }
        ));

        reset();
        env::set_var("ENABLE_BILLING", "maybe");
        assert!(Config::from_env().is_err());
        env::remove_var("ENABLE_BILLING");
        env::remove_var("QUOTA_ENFORCEMENT");
        env::remove_var("JWT_ACCESS_EXPIRES_MINUTES");
    }

    #[test]
    #[serial]
    fn test_origins_and_flags() {
        reset();
        env::set_var("ALLOWED_ORIGINS", "https://wizpix.ch, ,https://app.wizpix.ch");
        env::set_var("RUN_MIGRATIONS", "false");
        env::set_var("QUOTA_ENFORCEMENT", "best_effort");
        let config = Config::from_env().unwrap();
        assert_eq!(
            config.allowed_origins,
            vec!["https://wizpix.ch".to_string(), "https://app.wizpix.ch".to_string()]
        );
        assert!(!config.run_migrations);
        assert_eq!(config.quota_enforcement, QuotaEnforcement::BestEffort);
        env::remove_var("ALLOWED_ORIGINS");
        env::remove_var("RUN_MIGRATIONS");
        env::remove_var("QUOTA_ENFORCEMENT");
    }
}
