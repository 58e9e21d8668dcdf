//! Core library for logsim-console.
//!
//! Provides the authenticated request pipeline used for every call to the
//! Log Simulator backend: bearer credentials, session expiry detection,
//! single-flight token refresh with a bounded retry, a fixed error taxonomy,
//! and cache invalidation when credentials change.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;

pub use api::{ApiClient, ApiError, ErrorKind, Outcome, RequestDescriptor};
pub use auth::{AuthState, Session, SessionStore};
pub use cache::{CacheInvalidator, CacheManager};
pub use config::Config;
