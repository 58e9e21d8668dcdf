//! Scripted in-process backend for driving the pipeline in tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use logsim_core::api::{
    ApiClient, Body, ClientOptions, HttpRequest, Method, RawResult, Transport,
};
use logsim_core::auth::SessionStore;
use logsim_core::cache::CacheInvalidator;

pub const REFRESH: &str = "/api/v1/auth/refresh";

/// How the fake backend answers refresh calls.
#[derive(Debug, Clone)]
pub enum RefreshMode {
    /// Issue this access token, optionally rotating the refresh token.
    Grant { access: String, refresh: Option<String> },
    /// `{success: false}` with a 401.
    Reject,
    /// Never answer.
    Hang,
    /// The connection fails.
    Unreachable,
    /// `{success: true}` without an access token.
    Malformed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Seen {
    pub method: Method,
    pub path: String,
    pub token: Option<String>,
}

struct State {
    valid_tokens: HashSet<String>,
    refresh_mode: RefreshMode,
    refresh_calls: usize,
    refresh_bodies: Vec<Value>,
    unauthorized: usize,
    fixed: HashMap<String, (u16, String)>,
    always_unauthorized: HashSet<String>,
    held: HashMap<String, Arc<Semaphore>>,
    seen: Vec<Seen>,
}

/// Shared ordered log of interesting events across backend and caches.
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub struct FakeBackend {
    state: Mutex<State>,
    refresh_gate: Option<Arc<Semaphore>>,
    events: EventLog,
}

pub fn envelope_ok(data: Value) -> String {
    json!({"success": true, "data": data, "errorMessage": ""}).to_string()
}

impl FakeBackend {
    pub fn new(valid_token: &str, refresh_mode: RefreshMode) -> Self {
        Self {
            state: Mutex::new(State {
                valid_tokens: HashSet::from([valid_token.to_string()]),
                refresh_mode,
                refresh_calls: 0,
                refresh_bodies: Vec::new(),
                unauthorized: 0,
                fixed: HashMap::new(),
                always_unauthorized: HashSet::new(),
                held: HashMap::new(),
                seen: Vec::new(),
            }),
            refresh_gate: None,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Hold every refresh call until the returned semaphore gets a permit.
    pub fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.refresh_gate = Some(gate.clone());
        (self, gate)
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    /// Answer `path` with this status/body once the bearer token checks out.
    pub fn respond(&self, path: &str, status: u16, body: &str) {
        self.state
            .lock()
            .fixed
            .insert(path.to_string(), (status, body.to_string()));
    }

    /// Answer `path` with 401 no matter which token is presented.
    pub fn always_unauthorized(&self, path: &str) {
        self.state.lock().always_unauthorized.insert(path.to_string());
    }

    /// Hold the answer to `path` until the returned semaphore gets a
    /// permit. The answer itself is decided when the request arrives.
    pub fn hold(&self, path: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.state.lock().held.insert(path.to_string(), gate.clone());
        gate
    }

    /// Invalidate every issued access token, as if they all expired.
    pub fn expire_tokens(&self) {
        self.state.lock().valid_tokens.clear();
    }

    pub fn refresh_calls(&self) -> usize {
        self.state.lock().refresh_calls
    }

    pub fn refresh_bodies(&self) -> Vec<Value> {
        self.state.lock().refresh_bodies.clone()
    }

    pub fn unauthorized_count(&self) -> usize {
        self.state.lock().unauthorized
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.state.lock().seen.clone()
    }

    pub fn hits(&self, path: &str) -> usize {
        self.seen().iter().filter(|s| s.path == path).count()
    }

    fn path_of(url: &str) -> String {
        let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
        match without_scheme.find('/') {
            Some(i) => without_scheme[i..].to_string(),
            None => "/".to_string(),
        }
    }

    fn unauthorized(state: &mut State) -> RawResult {
        state.unauthorized += 1;
        RawResult::Response {
            status: 401,
            body: json!({"success": false, "data": "", "errorMessage": "Token expired"}).to_string(),
        }
    }

    async fn refresh(&self, request: &HttpRequest) -> RawResult {
        let mode = {
            let mut state = self.state.lock();
            state.refresh_calls += 1;
            if let Body::Json(ref body) = request.body {
                state.refresh_bodies.push(body.clone());
            }
            state.refresh_mode.clone()
        };

        if let Some(ref gate) = self.refresh_gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        match mode {
            RefreshMode::Grant { access, refresh } => {
                self.state.lock().valid_tokens = HashSet::from([access.clone()]);
                let mut data = json!({"access_token": access, "token_type": "bearer"});
                if let Some(refresh) = refresh {
                    data["refresh_token"] = json!(refresh);
                }
                RawResult::Response {
                    status: 200,
                    body: envelope_ok(data),
                }
            }
            RefreshMode::Reject => RawResult::Response {
                status: 401,
                body: json!({"success": false, "data": "", "errorMessage": "Refresh token revoked"})
                    .to_string(),
            },
            RefreshMode::Hang => std::future::pending().await,
            RefreshMode::Unreachable => RawResult::Connect("connection refused".to_string()),
            RefreshMode::Malformed => RawResult::Response {
                status: 200,
                body: envelope_ok(json!({"token_type": "bearer"})),
            },
        }
    }
}

impl FakeBackend {
    fn route(&self, request: &HttpRequest, path: &str, token: Option<&str>) -> RawResult {
        if path == "/api/v1/auth/login" {
            let password = match request.body {
                Body::Form(ref fields) => fields
                    .iter()
                    .find(|(k, _)| k == "password")
                    .map(|(_, v)| v.clone()),
                _ => None,
            };
            let mut state = self.state.lock();
            if password.as_deref() != Some("secret") {
                return Self::unauthorized(&mut state);
            }
            state.valid_tokens = HashSet::from(["login-access".to_string()]);
            return RawResult::Response {
                status: 200,
                body: json!({
                    "access_token": "login-access",
                    "refresh_token": "login-refresh",
                    "token_type": "bearer",
                    "scopes": ["me", "job"],
                })
                .to_string(),
            };
        }

        let mut state = self.state.lock();
        let authorized = token.map(|t| state.valid_tokens.contains(t)).unwrap_or(false);
        if !authorized || state.always_unauthorized.contains(path) {
            return Self::unauthorized(&mut state);
        }

        if path == "/api/v1/auth/logout" {
            state.valid_tokens.clear();
            return RawResult::Response {
                status: 200,
                body: "\"Logout successfully\"".to_string(),
            };
        }
        if path == "/api/v1/auth/self" {
            return RawResult::Response {
                status: 200,
                body: envelope_ok(json!({
                    "id": "7",
                    "username": "admin",
                    "email": "admin@example.com",
                    "role": {"name": "admin"},
                })),
            };
        }
        if let Some((status, body)) = state.fixed.get(path) {
            return RawResult::Response {
                status: *status,
                body: body.clone(),
            };
        }
        RawResult::Response {
            status: 200,
            body: envelope_ok(json!({"path": path, "token": token})),
        }
    }
}

#[async_trait]
impl Transport for FakeBackend {
    async fn send(&self, request: HttpRequest) -> RawResult {
        let path = Self::path_of(&request.url);
        let token = request.bearer_token().map(str::to_string);
        self.state.lock().seen.push(Seen {
            method: request.method,
            path: path.clone(),
            token: token.clone(),
        });
        self.events.lock().push(format!(
            "request {} {}",
            path,
            token.as_deref().unwrap_or("-")
        ));

        if path == REFRESH {
            return self.refresh(&request).await;
        }

        let response = self.route(&request, &path, token.as_deref());
        let gate = self.state.lock().held.get(&path).cloned();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        response
    }
}

/// Invalidator that records each notification in the event log.
pub struct RecordingInvalidator {
    events: EventLog,
}

impl RecordingInvalidator {
    pub fn new(events: EventLog) -> Self {
        Self { events }
    }
}

impl CacheInvalidator for RecordingInvalidator {
    fn credentials_rotated(&self) {
        self.events.lock().push("invalidate".to_string());
    }

    fn purge_all(&self) {
        self.events.lock().push("purge".to_string());
    }
}

pub fn options() -> ClientOptions {
    ClientOptions {
        base_url: "http://backend.test".to_string(),
        request_timeout: Duration::from_secs(5),
        refresh_timeout: Duration::from_secs(2),
        cache_ttl: Duration::from_secs(60),
    }
}

pub fn client(backend: Arc<FakeBackend>, extra: Option<Arc<dyn CacheInvalidator>>) -> ApiClient {
    let mut builder = ApiClient::builder(options())
        .transport(backend)
        .session(SessionStore::in_memory());
    if let Some(extra) = extra {
        builder = builder.invalidator(extra);
    }
    builder.build().expect("client builds without network")
}

/// A client logged in as `admin`, whose access token has since expired.
pub async fn expired_client(
    backend: Arc<FakeBackend>,
    extra: Option<Arc<dyn CacheInvalidator>>,
) -> ApiClient {
    let client = client(backend.clone(), extra);
    client
        .login("admin", "secret")
        .await
        .expect("login against fake backend");
    backend.expire_tokens();
    client
}
