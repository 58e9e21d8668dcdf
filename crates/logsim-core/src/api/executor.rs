use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::classify::{classify, Outcome, RawResult};
use super::request::{HttpRequest, RequestDescriptor};
use super::transport::Transport;

/// Performs single outbound calls: attaches the credential, sends, classifies.
///
/// Never touches session state. Clone is cheap.
#[derive(Clone)]
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    base_url: Arc<str>,
    timeout: Duration,
}

impl RequestExecutor {
    pub fn new(transport: Arc<dyn Transport>, base_url: &str, timeout: Duration) -> Self {
        Self {
            transport,
            base_url: Arc::from(base_url),
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn execute(&self, descriptor: &RequestDescriptor, credential: Option<&str>) -> Outcome {
        self.execute_within(descriptor, credential, self.timeout).await
    }

    /// Like `execute`, with an explicit deadline for this one call.
    pub async fn execute_within(
        &self,
        descriptor: &RequestDescriptor,
        credential: Option<&str>,
        timeout: Duration,
    ) -> Outcome {
        let request = HttpRequest::from_descriptor(&self.base_url, descriptor, credential);
        debug!(
            method = %descriptor.method(),
            path = descriptor.path(),
            authenticated = credential.is_some(),
            "Sending request"
        );

        let raw = match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Ok(raw) => raw,
            Err(_) => {
                warn!(path = descriptor.path(), timeout_ms = timeout.as_millis() as u64, "Request timed out");
                RawResult::Timeout
            }
        };

        let outcome = classify(raw);
        if let Err(ref e) = outcome {
            debug!(path = descriptor.path(), kind = ?e.kind(), "Request failed");
        }
        outcome
    }
}
