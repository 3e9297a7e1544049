//! Client session correlation.
//!
//! Sessions are opaque ids supplied by clients (or issued on unified
//! `initialize`). The gateway only records who used an id and when; the id
//! itself is forwarded to backends unchanged.

use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub use crate::transport::http::SESSION_HEADER;

/// Sessions not seen for this long are dropped by the supervisor.
pub const SESSION_IDLE_TTL: Duration = Duration::hours(1);

const ANONYMOUS: &str = "anonymous";

/// The authenticated caller of a request, inserted by the auth middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub identity: String,
}

impl Caller {
    pub fn anonymous() -> Self {
        Self {
            identity: ANONYMOUS.to_string(),
        }
    }

    pub fn from_credential(credential: &str) -> Self {
        Self {
            identity: identity_for_credential(credential),
        }
    }
}

/// Stable, non-reversible identity for a credential: `key:` plus the first
/// 12 hex characters of its SHA-256.
pub fn identity_for_credential(credential: &str) -> String {
    let digest = Sha256::digest(credential.as_bytes());
    let encoded = hex::encode(digest);
    format!("key:{}", &encoded[..12])
}

/// Reads a non-empty `Mcp-Session-Id` header.
pub fn session_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub identity: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records use of `id` by `caller`, creating the session on first
    /// sight. A session keeps the identity it was created with.
    pub fn touch(&self, id: &str, caller: &Caller) -> Session {
        let now = Utc::now();
        let mut sessions = self.lock();
        let session = sessions.entry(id.to_string()).or_insert_with(|| {
            tracing::debug!(identity = %caller.identity, "new client session");
            Session {
                id: id.to_string(),
                identity: caller.identity.clone(),
                created_at: now,
                last_seen: now,
            }
        });
        if session.identity != caller.identity {
            tracing::warn!(
                owner = %session.identity,
                caller = %caller.identity,
                "session id reused by a different caller"
            );
        }
        session.last_seen = now;
        session.clone()
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops sessions idle longer than [`SESSION_IDLE_TTL`]. Returns how many
    /// were removed.
    pub fn prune_idle(&self) -> usize {
        self.prune_idle_since(Utc::now() - SESSION_IDLE_TTL)
    }

    fn prune_idle_since(&self, cutoff: DateTime<Utc>) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, s| s.last_seen >= cutoff);
        before - sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn identity_hides_credential() {
        let identity = identity_for_credential("super-secret-key");
        assert!(identity.starts_with("key:"));
        assert_eq!(identity.len(), "key:".len() + 12);
        assert!(!identity.contains("secret"));
        assert_eq!(identity, identity_for_credential("super-secret-key"));
    }

    #[test]
    fn touch_keeps_creation_time() {
        let store = SessionStore::new();
        let caller = Caller::anonymous();
        let first = store.touch("s1", &caller);
        let second = store.touch("s1", &caller);
        assert_eq!(first.created_at, second.created_at);
        assert!(second.last_seen >= first.last_seen);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn prune_drops_idle_sessions() {
        let store = SessionStore::new();
        store.touch("old", &Caller::anonymous());
        assert_eq!(store.prune_idle_since(Utc::now() + Duration::seconds(1)), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn blank_session_header_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, HeaderValue::from_static("  "));
        assert_eq!(session_id_from_headers(&headers), None);
        headers.insert(SESSION_HEADER, HeaderValue::from_static("abc"));
        assert_eq!(session_id_from_headers(&headers).as_deref(), Some("abc"));
    }
}
