// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Wizpix API Library
//!
//! HTTP surface of the billing and entitlement engine: token issuance and
//! rotation, authentication middleware, checkout, usage and webhook routes.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod tasks;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{AppEnv, Config, ConfigError};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
