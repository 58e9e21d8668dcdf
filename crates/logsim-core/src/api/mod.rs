//! REST API pipeline for the Log Simulator backend.
//!
//! Every backend call goes through `ApiClient::call`, which layers session
//! handling on top of the smaller pieces in this module:
//! - `RequestDescriptor`: what to call
//! - `RequestExecutor`: one outbound call with a bearer token attached
//! - `classify`: raw status/body to the `ApiError` taxonomy
//! - `Transport`: the network seam (reqwest in production)
//!
//! The backend uses JWT bearer authentication with an access/refresh
//! token pair.

pub mod classify;
pub mod client;
pub mod error;
pub mod executor;
pub mod request;
pub mod transport;

pub use classify::{classify, Outcome, RawResult};
pub use client::{ApiClient, ApiClientBuilder, ClientOptions};
pub use error::{ApiError, ErrorKind, FieldError};
pub use executor::RequestExecutor;
pub use request::{Body, HttpRequest, Method, RequestDescriptor};
pub use transport::{ReqwestTransport, Transport};
