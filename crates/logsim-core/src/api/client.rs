//! The authenticated request pipeline.
//!
//! `ApiClient::call` is the single entry point for backend calls. It attaches
//! the current access token, and when the backend answers 401 it obtains a
//! fresh token through the refresh coordinator and replays the request
//! exactly once.

use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize};
use tracing::{debug, info, warn};

use crate::auth::{RefreshCoordinator, SessionStore, Tokens, UserProfile};
use crate::cache::{CacheInvalidator, CacheManager, Invalidators};
use crate::config::Config;

use super::classify::Outcome;
use super::executor::RequestExecutor;
use super::request::RequestDescriptor;
use super::transport::{ReqwestTransport, Transport};
use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

const LOGIN_PATH: &str = "/api/v1/auth/login";
const LOGOUT_PATH: &str = "/api/v1/auth/logout";
const SELF_PATH: &str = "/api/v1/auth/self";

/// Tag carried by cached profile responses.
const AUTH_TAG: &str = "Auth";

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    scopes: Vec<String>,
}

/// Tunables for an `ApiClient`.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub base_url: String,
    pub request_timeout: Duration,
    pub refresh_timeout: Duration,
    pub cache_ttl: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ClientOptions {
    fn from(config: &Config) -> Self {
        Self {
            base_url: config.api_url(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            refresh_timeout: Duration::from_secs(config.refresh_timeout_secs),
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
        }
    }
}

pub struct ApiClientBuilder {
    options: ClientOptions,
    transport: Option<Arc<dyn Transport>>,
    session: Option<SessionStore>,
    invalidators: Vec<Arc<dyn CacheInvalidator>>,
}

impl ApiClientBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn session(mut self, session: SessionStore) -> Self {
        self.session = Some(session);
        self
    }

    /// Register another sink to be told about credential changes, besides
    /// the client's own response cache.
    pub fn invalidator(mut self, invalidator: Arc<dyn CacheInvalidator>) -> Self {
        self.invalidators.push(invalidator);
        self
    }

    pub fn build(self) -> reqwest::Result<ApiClient> {
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(self.options.request_timeout)?),
        };
        let session = self.session.unwrap_or_default();
        let cache = Arc::new(CacheManager::new(self.options.cache_ttl));

        let mut invalidators = Invalidators::new(vec![cache.clone() as Arc<dyn CacheInvalidator>]);
        for sink in self.invalidators {
            invalidators.push(sink);
        }
        let invalidators: Arc<dyn CacheInvalidator> = Arc::new(invalidators);

        let executor = RequestExecutor::new(
            transport,
            &self.options.base_url,
            self.options.request_timeout,
        );
        let refresh = RefreshCoordinator::new(
            session.clone(),
            executor.clone(),
            invalidators.clone(),
            self.options.refresh_timeout,
        );

        Ok(ApiClient {
            executor,
            session,
            refresh,
            cache,
            invalidators,
        })
    }
}

/// API client for the Log Simulator backend.
/// Clone is cheap - every part is shared behind an Arc.
#[derive(Clone)]
pub struct ApiClient {
    executor: RequestExecutor,
    session: SessionStore,
    refresh: RefreshCoordinator,
    cache: Arc<CacheManager>,
    invalidators: Arc<dyn CacheInvalidator>,
}

impl ApiClient {
    pub fn builder(options: ClientOptions) -> ApiClientBuilder {
        ApiClientBuilder {
            options,
            transport: None,
            session: None,
            invalidators: Vec::new(),
        }
    }

    /// Create a client talking to the configured backend over HTTP.
    pub fn new(config: &Config, session: SessionStore) -> reqwest::Result<Self> {
        Self::builder(ClientOptions::from(config)).session(session).build()
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn base_url(&self) -> &str {
        self.executor.base_url()
    }

    /// Issue one logical call.
    ///
    /// Only `Unauthorized` is recovered from, by refreshing the credential
    /// and replaying the request once. A second `Unauthorized` is returned
    /// as is; callers should treat it as a forced logout. A call that was in
    /// flight when the session was cleared also comes back `Unauthorized`.
    /// Every other outcome is returned unchanged.
    pub async fn call(&self, descriptor: &RequestDescriptor) -> Outcome {
        let cache_key = descriptor.cache_tags().map(|_| descriptor.cache_key());
        if let Some(ref key) = cache_key {
            if let Some(hit) = self.cache.get(key) {
                debug!(cache = %key, "Serving cached response");
                return Ok(hit);
            }
        }

        // Generation first: a clear after this point must be observable
        let generation = self.cache.generation();
        let snapshot = self.session.get();
        let credential = snapshot.credential().map(str::to_string);
        let (outcome, generation) = match self.executor.execute(descriptor, credential.as_deref()).await {
            Err(ApiError::Unauthorized) => self.recover(descriptor, credential.as_deref()).await,
            other => (other, Some(generation)),
        };

        let payload = outcome?;

        let current = self.session.get();
        if current.epoch != snapshot.epoch && current.is_expired() {
            debug!(path = descriptor.path(), "Session cleared while in flight, dropping response");
            return Err(ApiError::Unauthorized);
        }

        if let (Some(key), Some(tags), Some(generation)) = (cache_key, descriptor.cache_tags(), generation) {
            // Refused if a rotation or purge cleared the cache since the fetch
            self.cache.store_if_current(key, payload.clone(), tags.to_vec(), generation);
        }
        self.cache.invalidate_tags(descriptor.invalidated_tags());
        Ok(payload)
    }

    /// Refresh and replay once. Also returns the cache generation the replay
    /// was issued under, or `None` if its result must not be cached.
    async fn recover(
        &self,
        descriptor: &RequestDescriptor,
        rejected: Option<&str>,
    ) -> (Outcome, Option<u64>) {
        debug!(path = descriptor.path(), "Unauthorized, refreshing credential");
        match self.refresh.ensure_fresh_credential(rejected).await {
            Ok(fresh) => {
                let generation = self.cache.generation();
                let generation = if self.session.get().credential() == Some(fresh.as_str()) {
                    Some(generation)
                } else {
                    None
                };
                if !descriptor.is_retryable() {
                    debug!(path = descriptor.path(), "Not retryable, surfacing Unauthorized");
                    return (Err(ApiError::Unauthorized), None);
                }
                let retried = self.executor.execute(descriptor, Some(&fresh)).await;
                if matches!(retried, Err(ApiError::Unauthorized)) {
                    warn!(path = descriptor.path(), "Still unauthorized after refresh");
                }
                (retried, generation)
            }
            Err(failure) => {
                warn!(path = descriptor.path(), error = %failure, "Could not refresh credential");
                (Err(ApiError::Unauthorized), None)
            }
        }
    }

    /// `call`, then deserialize the payload.
    pub async fn fetch<T: DeserializeOwned>(&self, descriptor: &RequestDescriptor) -> Result<T, ApiError> {
        let payload = self.call(descriptor).await?;
        serde_json::from_value(payload).map_err(|e| ApiError::ServerFault {
            status: None,
            detail: format!("Failed to parse response from {}: {}", descriptor.path(), e),
        })
    }

    // ===== Session Lifecycle =====

    /// Log in with a username and password, then load the profile.
    ///
    /// Sent straight through the executor: a 401 here means bad credentials,
    /// not an expired token.
    pub async fn login(&self, username: &str, password: &str) -> Result<UserProfile, ApiError> {
        let descriptor = RequestDescriptor::new(super::Method::Post, LOGIN_PATH)
            .form(vec![
                ("username".to_string(), username.to_string()),
                ("password".to_string(), password.to_string()),
            ])
            .retryable(false);

        let payload = self.executor.execute(&descriptor, None).await?;
        let login: LoginResponse = serde_json::from_value(payload).map_err(|e| ApiError::ServerFault {
            status: None,
            detail: format!("Failed to parse login response: {}", e),
        })?;

        self.refresh.cancel_in_flight();
        self.invalidators.purge_all();
        self.session.set(Tokens {
            access_token: login.access_token,
            refresh_token: login.refresh_token,
        });
        info!(username, scopes = login.scopes.len(), "Logged in");

        self.load_profile().await
    }

    /// Fetch the current account and attach it to the session, completing
    /// authentication.
    pub async fn load_profile(&self) -> Result<UserProfile, ApiError> {
        let descriptor = RequestDescriptor::get(SELF_PATH).cached([AUTH_TAG]);
        let profile: UserProfile = self.fetch(&descriptor).await?;
        if self.session.set_profile(profile.clone()) {
            debug!(username = %profile.username, "Profile loaded");
        }
        Ok(profile)
    }

    /// End the session locally and on the backend.
    ///
    /// The local session is cleared and all cached data purged first and
    /// unconditionally; calls racing the logout come back `Unauthorized`.
    /// The backend is then asked to revoke the old token; failure there is
    /// only logged.
    pub async fn logout(&self) {
        let previous = self.session.get().credential().map(str::to_string);

        self.refresh.cancel_in_flight();
        self.session.clear();
        self.invalidators.purge_all();
        info!("Logged out");

        if let Some(token) = previous {
            let descriptor = RequestDescriptor::new(super::Method::Post, LOGOUT_PATH).retryable(false);
            if let Err(e) = self.executor.execute(&descriptor, Some(&token)).await {
                warn!(error = %e, "Backend logout failed");
            }
        }
    }
}
