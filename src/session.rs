//! The authenticated session slot.
//!
//! A [`SessionStore`] holds at most one [`Session`]. It is written only by
//! explicit login/logout calls and by the gateway when the backend answers
//! 401; every other code path reads it. When a path is configured the
//! session is mirrored to a JSON file with the keys `token` and `user`.
//!
//! Collaborators that must react to an expired session (e.g. to prompt for
//! a new login) subscribe via [`SessionStore::subscribe`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::sync::broadcast;

use crate::models::User;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    #[serde(default)]
    pub user: Option<User>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Established { username: Option<String> },
    /// The backend rejected the token; the session was cleared.
    Expired,
    LoggedOut,
}

pub struct SessionStore {
    slot: RwLock<Option<Session>>,
    path: Option<PathBuf>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self::with_path(None, None)
    }

    fn with_path(path: Option<PathBuf>, initial: Option<Session>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            slot: RwLock::new(initial),
            path,
            events,
        }
    }

    /// Open a file-backed store, loading any session saved there.
    ///
    /// A missing file yields an empty store. An unreadable file is treated
    /// the same way, with a warning, so a corrupt session never blocks login.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let initial = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Session>(&content) {
                Ok(session) if !session.token.is_empty() => Some(session),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable session file");
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read session file: {}", path.display())
                })
            }
        };
        Ok(Self::with_path(Some(path), initial))
    }

    pub fn current(&self) -> Option<Session> {
        self.read_slot().clone()
    }

    pub fn token(&self) -> Option<String> {
        self.read_slot().as_ref().map(|s| s.token.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.read_slot().is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Install a new session (login or register), replacing any existing one.
    pub fn replace(&self, session: Session) -> Result<()> {
        let username = session.user.as_ref().map(|u| u.username.clone());
        self.persist(Some(&session))?;
        *self.write_slot() = Some(session);
        tracing::info!(user = username.as_deref().unwrap_or("-"), "session established");
        let _ = self.events.send(SessionEvent::Established { username });
        Ok(())
    }

    /// Refresh the stored user record without changing the token.
    pub fn update_user(&self, user: User) -> Result<()> {
        let updated = {
            let mut slot = self.write_slot();
            match slot.as_mut() {
                Some(session) => {
                    session.user = Some(user);
                    Some(session.clone())
                }
                None => None,
            }
        };
        if let Some(session) = updated {
            self.persist(Some(&session))?;
        }
        Ok(())
    }

    /// Explicit logout. Returns whether a session was present.
    pub fn logout(&self) -> Result<bool> {
        let had = self.write_slot().take().is_some();
        self.persist(None)?;
        if had {
            tracing::info!("logged out");
            let _ = self.events.send(SessionEvent::LoggedOut);
        }
        Ok(had)
    }

    /// Clear the session if it still holds `token`.
    ///
    /// Returns `true` only for the call that actually cleared it, so
    /// concurrent requests failing with the same stale token invalidate once.
    pub fn invalidate_if_current(&self, token: &str) -> bool {
        let cleared = {
            let mut slot = self.write_slot();
            match slot.as_ref() {
                Some(session) if session.token == token => {
                    *slot = None;
                    true
                }
                _ => false,
            }
        };
        if cleared {
            self.after_expiry();
        }
        cleared
    }

    /// Clear whatever session is present.
    pub fn invalidate(&self) -> bool {
        let cleared = self.write_slot().take().is_some();
        if cleared {
            self.after_expiry();
        }
        cleared
    }

    fn after_expiry(&self) {
        if let Err(e) = self.persist(None) {
            tracing::warn!(error = %e, "failed to remove session file");
        }
        tracing::info!("session expired");
        let _ = self.events.send(SessionEvent::Expired);
    }

    fn persist(&self, session: Option<&Session>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        match session {
            Some(session) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create session directory: {}", parent.display())
                    })?;
                }
                let json = serde_json::to_string_pretty(session)?;
                write_private(path, json.as_bytes())
                    .with_context(|| format!("Failed to write session file: {}", path.display()))?;
            }
            None => match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to remove session file: {}", path.display())
                    })
                }
            },
        }
        Ok(())
    }

    fn read_slot(&self) -> std::sync::RwLockReadGuard<'_, Option<Session>> {
        self.slot.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_slot(&self) -> std::sync::RwLockWriteGuard<'_, Option<Session>> {
        self.slot.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Write the session file readable by its owner only.
#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // `mode` only applies on create; tighten a file left by an older version.
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::in_memory()
    }
}
