use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Session file name in cache directory
pub const SESSION_FILE: &str = "session.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum AuthState {
    #[default]
    Unauthenticated,
    /// Tokens held, profile not yet confirmed.
    Authenticating,
    Authenticated,
    RefreshInFlight,
    /// Terminal: reached by a failed refresh or a logout. No tokens.
    Expired,
}

impl AuthState {
    /// States in which an access token may be held.
    pub fn holds_credentials(self) -> bool {
        matches!(
            self,
            AuthState::Authenticating | AuthState::Authenticated | AuthState::RefreshInFlight
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tokens {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Role {
    pub name: String,
}

/// The account returned by `/auth/self`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
}

impl UserProfile {
    pub fn display(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.username)
    }
}

/// Immutable snapshot of the process-wide authentication state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub auth_state: AuthState,
    pub profile: Option<UserProfile>,
    /// Bumped by every login and every transition into `Expired`.
    pub epoch: u64,
}

impl Session {
    /// The access credential to attach to requests, if any.
    pub fn credential(&self) -> Option<&str> {
        if self.auth_state.holds_credentials() {
            self.access_token.as_deref()
        } else {
            None
        }
    }

    pub fn tokens(&self) -> Option<Tokens> {
        match (&self.access_token, &self.refresh_token) {
            (Some(access), Some(refresh)) => Some(Tokens {
                access_token: access.clone(),
                refresh_token: refresh.clone(),
            }),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_state == AuthState::Authenticated
    }

    pub fn is_expired(&self) -> bool {
        self.auth_state == AuthState::Expired
    }

    pub fn profile_loaded(&self) -> bool {
        self.profile.is_some()
    }
}

/// On-disk form of a session; the auth state is re-derived on load.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedSession {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    profile: Option<UserProfile>,
}

/// Sole owner of the `Session`.
///
/// Readers get snapshots or a `watch` subscription; every mutation replaces
/// the snapshot in one step, so no reader sees tokens and state disagree.
/// Mutation is crate-private: login/logout go through `ApiClient`, refresh
/// resolution through the refresh coordinator. Clone is cheap.
#[derive(Clone)]
pub struct SessionStore {
    tx: Arc<watch::Sender<Session>>,
    path: Option<Arc<PathBuf>>,
    file_lock: Arc<Mutex<()>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl SessionStore {
    /// A session that lives only as long as the process.
    pub fn in_memory() -> Self {
        let (tx, _) = watch::channel(Session::default());
        Self {
            tx: Arc::new(tx),
            path: None,
            file_lock: Arc::new(Mutex::new(())),
        }
    }

    /// A session persisted to `path`, restored from it if present.
    ///
    /// A restored session has not been confirmed by the backend yet, so it
    /// starts out `Authenticating`.
    pub fn persistent(path: PathBuf) -> Result<Self> {
        let mut session = Session::default();
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .context("Failed to read session file")?;
            let saved: PersistedSession = serde_json::from_str(&contents)
                .context("Failed to parse session file")?;
            debug!(has_profile = saved.profile.is_some(), "Session restored from disk");
            session = Session {
                access_token: Some(saved.access_token),
                refresh_token: Some(saved.refresh_token),
                auth_state: AuthState::Authenticating,
                profile: saved.profile,
                epoch: 0,
            };
        }
        let (tx, _) = watch::channel(session);
        Ok(Self {
            tx: Arc::new(tx),
            path: Some(Arc::new(path)),
            file_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn get(&self) -> Session {
        self.tx.borrow().clone()
    }

    /// Receive every committed change, e.g. to redirect to login on `Expired`.
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.tx.subscribe()
    }

    /// Install a freshly issued token pair (login).
    pub(crate) fn set(&self, tokens: Tokens) {
        self.tx.send_modify(|s| {
            s.access_token = Some(tokens.access_token);
            s.refresh_token = Some(tokens.refresh_token);
            s.auth_state = AuthState::Authenticating;
            s.profile = None;
            s.epoch += 1;
        });
        info!("Session credentials set");
        self.sync_file();
    }

    /// Attach the confirmed profile; completes authentication.
    pub(crate) fn set_profile(&self, profile: UserProfile) -> bool {
        let applied = self.tx.send_if_modified(|s| {
            if !s.auth_state.holds_credentials() {
                return false;
            }
            s.profile = Some(profile);
            if s.auth_state == AuthState::Authenticating {
                s.auth_state = AuthState::Authenticated;
            }
            true
        });
        if applied {
            self.sync_file();
        }
        applied
    }

    /// Mark a refresh as started. Returns the session epoch it belongs to,
    /// or `None` when there are no credentials to refresh.
    pub(crate) fn begin_refresh(&self) -> Option<u64> {
        let mut epoch = None;
        self.tx.send_if_modified(|s| {
            if !s.auth_state.holds_credentials() {
                return false;
            }
            epoch = Some(s.epoch);
            s.auth_state = AuthState::RefreshInFlight;
            true
        });
        epoch
    }

    /// Commit a refreshed access token (and rotated refresh token, if any).
    ///
    /// Rejected when the session moved on since the refresh began, so a
    /// logout can never be undone by a late refresh.
    pub(crate) fn apply_refresh(
        &self,
        epoch: u64,
        access_token: String,
        refresh_token: Option<String>,
    ) -> bool {
        let applied = self.tx.send_if_modified(|s| {
            if s.epoch != epoch || s.auth_state != AuthState::RefreshInFlight {
                return false;
            }
            s.access_token = Some(access_token);
            if let Some(refresh) = refresh_token {
                s.refresh_token = Some(refresh);
            }
            s.auth_state = AuthState::Authenticated;
            true
        });
        if applied {
            self.sync_file();
        }
        applied
    }

    /// Clear both tokens and the profile, landing in `Expired`. Idempotent.
    pub(crate) fn clear(&self) {
        let changed = self.tx.send_if_modified(|s| {
            if s.auth_state == AuthState::Expired {
                return false;
            }
            *s = Session {
                auth_state: AuthState::Expired,
                epoch: s.epoch + 1,
                ..Session::default()
            };
            true
        });
        if changed {
            info!("Session expired");
            self.sync_file();
        }
    }

    /// `clear`, but only if no login or logout happened since `epoch`.
    pub(crate) fn clear_if_epoch(&self, epoch: u64) -> bool {
        if self.tx.borrow().epoch != epoch {
            return false;
        }
        let changed = self.tx.send_if_modified(|s| {
            if s.epoch != epoch || s.auth_state == AuthState::Expired {
                return false;
            }
            *s = Session {
                auth_state: AuthState::Expired,
                epoch: s.epoch + 1,
                ..Session::default()
            };
            true
        });
        if changed {
            info!("Session expired after failed refresh");
            self.sync_file();
        }
        changed
    }

    /// Bring the session file in line with the current snapshot: written
    /// while tokens are held, removed otherwise. Failures are logged only.
    ///
    /// The snapshot is read under the file lock, so whichever sync runs last
    /// writes the newest state and a cleared session is never written back.
    fn sync_file(&self) {
        let Some(ref path) = self.path else {
            return;
        };
        let _file = self.file_lock.lock();
        let snapshot = self.get();
        let (Some(access_token), Some(refresh_token)) = (snapshot.access_token, snapshot.refresh_token)
        else {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path.as_path()) {
                    warn!(error = %e, "Failed to remove session file");
                }
            }
            return;
        };
        let saved = PersistedSession {
            access_token,
            refresh_token,
            profile: snapshot.profile,
        };
        let result = (|| -> Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let contents = serde_json::to_string_pretty(&saved)?;
            std::fs::write(path.as_path(), contents)?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!(error = %e, "Failed to save session");
        }
    }
}
