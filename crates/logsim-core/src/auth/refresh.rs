//! Single-flight access-token refresh.
//!
//! The first caller to hit an expired credential starts one refresh task and
//! joins the waiter queue; everyone arriving while it runs only joins the
//! queue. When the refresh settles, the session and the caches are updated
//! first, then every waiter is released with the same result, in the order
//! it joined.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ApiError, RequestDescriptor, RequestExecutor};
use crate::cache::CacheInvalidator;

use super::session::{SessionStore, Tokens};

pub const REFRESH_PATH: &str = "/api/v1/auth/refresh";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RefreshFailure {
    #[error("No access/refresh token pair to refresh")]
    MissingCredentials,

    #[error("Refresh rejected: {0}")]
    Rejected(ApiError),

    #[error("Malformed refresh response: {0}")]
    MalformedResponse(String),

    #[error("Session changed while refreshing")]
    Superseded,
}

pub type RefreshResult = Result<String, RefreshFailure>;

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<RefreshResult>,
}

struct InFlight {
    round: u64,
    waiters: VecDeque<Waiter>,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct WaiterQueue {
    next_round: u64,
    next_waiter: u64,
    in_flight: Option<InFlight>,
}

impl WaiterQueue {
    fn enqueue(&mut self) -> Option<(u64, u64, oneshot::Receiver<RefreshResult>)> {
        let in_flight = self.in_flight.as_mut()?;
        let (tx, rx) = oneshot::channel();
        self.next_waiter += 1;
        let id = self.next_waiter;
        in_flight.waiters.push_back(Waiter { id, tx });
        Some((in_flight.round, id, rx))
    }

    /// Take the waiters of `round`, ending it. Empty if it already ended.
    fn take_round(&mut self, round: u64) -> VecDeque<Waiter> {
        match self.in_flight {
            Some(ref in_flight) if in_flight.round == round => self
                .in_flight
                .take()
                .map(|f| f.waiters)
                .unwrap_or_default(),
            _ => VecDeque::new(),
        }
    }
}

/// Removes a waiter from the queue if its caller stops waiting.
struct WaiterGuard {
    queue: Arc<Mutex<WaiterQueue>>,
    round: u64,
    id: u64,
    armed: bool,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut queue = self.queue.lock();
        if let Some(ref mut in_flight) = queue.in_flight {
            if in_flight.round == self.round {
                in_flight.waiters.retain(|w| w.id != self.id);
                debug!(waiter = self.id, "Canceled call left the refresh queue");
            }
        }
    }
}

struct Inner {
    session: SessionStore,
    executor: RequestExecutor,
    invalidator: Arc<dyn CacheInvalidator>,
    timeout: Duration,
    queue: Arc<Mutex<WaiterQueue>>,
}

/// Guarantees at most one refresh call in flight. Clone is cheap.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        session: SessionStore,
        executor: RequestExecutor,
        invalidator: Arc<dyn CacheInvalidator>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                session,
                executor,
                invalidator,
                timeout,
                queue: Arc::new(Mutex::new(WaiterQueue::default())),
            }),
        }
    }

    /// Produce a credential fresher than `rejected`, the one the backend
    /// just refused.
    ///
    /// Joins the in-flight refresh if there is one, otherwise starts it.
    /// If the session already holds a different credential than `rejected`
    /// (a refresh finished while this caller's request was on the wire),
    /// that credential is returned without another refresh.
    pub async fn ensure_fresh_credential(&self, rejected: Option<&str>) -> RefreshResult {
        let (round, id, rx) = {
            let mut queue = self.inner.queue.lock();
            match queue.enqueue() {
                Some(joined) => {
                    debug!(waiter = joined.1, "Refresh in flight, queued");
                    joined
                }
                None => {
                    let session = self.inner.session.get();
                    if let Some(current) = session.credential() {
                        if Some(current) != rejected {
                            debug!("Credential already replaced, reusing it");
                            return Ok(current.to_string());
                        }
                    }

                    let Some(tokens) = session.tokens() else {
                        drop(queue);
                        return Err(self.fail_without_network());
                    };
                    let Some(epoch) = self.inner.session.begin_refresh() else {
                        drop(queue);
                        return Err(self.fail_without_network());
                    };

                    queue.next_round += 1;
                    let round = queue.next_round;
                    queue.in_flight = Some(InFlight {
                        round,
                        waiters: VecDeque::new(),
                        task: None,
                    });
                    let joined = queue.enqueue();

                    let inner = Arc::clone(&self.inner);
                    let task = tokio::spawn(async move {
                        inner.run_refresh(round, epoch, tokens).await;
                    });
                    if let Some(ref mut in_flight) = queue.in_flight {
                        if in_flight.round == round {
                            in_flight.task = Some(task);
                        }
                    }
                    info!(round, "Access token refresh started");

                    match joined {
                        Some(joined) => joined,
                        None => return Err(RefreshFailure::Superseded),
                    }
                }
            }
        };

        let mut guard = WaiterGuard {
            queue: Arc::clone(&self.inner.queue),
            round,
            id,
            armed: true,
        };
        let result = rx.await;
        guard.armed = false;

        result.unwrap_or(Err(RefreshFailure::Superseded))
    }

    /// Abandon any in-flight refresh, failing its waiters with `Superseded`.
    /// Used when the session is replaced or torn down underneath it.
    pub fn cancel_in_flight(&self) {
        let in_flight = self.inner.queue.lock().in_flight.take();
        if let Some(in_flight) = in_flight {
            if let Some(task) = in_flight.task {
                task.abort();
            }
            let count = in_flight.waiters.len();
            for waiter in in_flight.waiters {
                let _ = waiter.tx.send(Err(RefreshFailure::Superseded));
            }
            info!(round = in_flight.round, released = count, "In-flight refresh canceled");
        }
    }

    /// Whether a refresh is currently running.
    pub fn is_refreshing(&self) -> bool {
        self.inner.queue.lock().in_flight.is_some()
    }

    fn fail_without_network(&self) -> RefreshFailure {
        warn!("Cannot refresh without both tokens, expiring session");
        self.inner.session.clear();
        self.inner.invalidator.purge_all();
        RefreshFailure::MissingCredentials
    }
}

impl Inner {
    async fn run_refresh(&self, round: u64, epoch: u64, tokens: Tokens) {
        let result = self.request_refresh(&tokens).await;

        let result = match result {
            Ok(fresh) => {
                let access = fresh.access_token.clone();
                let rotated = fresh.refresh_token.is_some();
                if self.session.apply_refresh(epoch, fresh.access_token, fresh.refresh_token) {
                    self.invalidator.credentials_rotated();
                    info!(round, rotated, "Access token refreshed");
                    Ok(access)
                } else {
                    warn!(round, "Session changed during refresh, discarding new token");
                    Err(RefreshFailure::Superseded)
                }
            }
            Err(failure) => {
                warn!(round, error = %failure, "Access token refresh failed");
                if self.session.clear_if_epoch(epoch) {
                    self.invalidator.purge_all();
                }
                Err(failure)
            }
        };

        let waiters = self.queue.lock().take_round(round);
        let released = waiters.len();
        for waiter in waiters {
            // A closed receiver means that caller went away
            let _ = waiter.tx.send(result.clone());
        }
        debug!(round, released, "Refresh waiters released");
    }

    async fn request_refresh(&self, tokens: &Tokens) -> Result<RefreshResponse, RefreshFailure> {
        let descriptor = RequestDescriptor::post(
            REFRESH_PATH,
            json!({
                "access_token": tokens.access_token,
                "refresh_token": tokens.refresh_token,
            }),
        )
        .retryable(false);

        let payload = self
            .executor
            .execute_within(&descriptor, None, self.timeout)
            .await
            .map_err(RefreshFailure::Rejected)?;

        serde_json::from_value(payload).map_err(|e| RefreshFailure::MalformedResponse(e.to_string()))
    }
}
