//! Authentication module for Rewritely
//!
//! Identity is delegated to an external provider; this server only verifies
//! the provider's signed access tokens.

#[cfg(test)]
mod edge_case_tests;
pub mod jwt;
pub mod middleware;
#[cfg(test)]
mod middleware_tests;

pub use jwt::{Claims, IdentityVerifier};
pub use middleware::{require_auth, AuthError, AuthState, AuthUser};
