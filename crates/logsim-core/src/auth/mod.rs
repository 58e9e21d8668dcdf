//! Authentication state and credential handling.
//!
//! This module provides:
//! - `SessionStore`: sole owner of the access/refresh token pair and auth state
//! - `RefreshCoordinator`: single-flight access token refresh
//! - `CredentialStore`: remembered login passwords in the OS keychain
//!
//! Sessions are persisted to disk so a restart does not force a new login.

pub mod credentials;
pub mod refresh;
pub mod session;

pub use credentials::CredentialStore;
pub use refresh::{RefreshCoordinator, RefreshFailure, RefreshResult};
pub use session::{AuthState, Role, Session, SessionStore, Tokens, UserProfile};
