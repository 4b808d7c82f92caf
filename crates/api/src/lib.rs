// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError carries owned context strings
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Rewritely API Library
//!
//! HTTP surface of Rewritely: the metered rewrite endpoint, usage and plan
//! reads, order creation and the Stripe notification endpoint.

pub mod auth;
pub mod config;
pub mod error;
pub mod extract;
pub mod rewrite;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use rewrite::{ChatCompletionRewriter, RewriteError, Rewriter};
pub use routes::create_router;
pub use state::AppState;
