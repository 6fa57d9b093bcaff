//! Session data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A stored session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,

    /// Opaque caller data
    #[serde(default)]
    pub payload: Map<String, Value>,

    pub created_at: DateTime<Utc>,

    pub last_accessed_at: DateTime<Utc>,

    /// TTL (seconds) applied by the most recent write
    pub ttl_secs: u64,
}

impl Session {
    pub fn new(session_id: impl Into<String>, payload: Map<String, Value>, ttl_secs: u64) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            payload,
            created_at: now,
            last_accessed_at: now,
            ttl_secs,
        }
    }

    /// Shallow merge: top-level keys of `partial` replace those in the payload.
    pub fn merge(&mut self, partial: Map<String, Value>) {
        for (k, v) in partial {
            self.payload.insert(k, v);
        }
    }

    /// Mark the session as read/written now with the given TTL
    pub fn touch(&mut self, ttl_secs: u64) {
        self.last_accessed_at = Utc::now();
        self.ttl_secs = ttl_secs;
    }

    /// Payload field by name
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

/// Outcome of a session read that keeps "missing" and "store down" apart
#[derive(Debug, Clone, PartialEq)]
pub enum SessionLookup {
    Found(Session),
    Missing,
    Unavailable,
}

impl SessionLookup {
    pub fn into_session(self) -> Option<Session> {
        match self {
            Self::Found(session) => Some(session),
            _ => None,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

/// What an authorization check does when the store cannot answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Treat an unreachable store as "authorized"
    FailOpen,
    /// Treat an unreachable store as "not authorized"
    #[default]
    FailClosed,
}

/// Result of a maintenance sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Session keys seen by the scan
    pub scanned: usize,
    /// Keys that expired between the scan and the TTL check
    pub expired: usize,
    /// Keys without expiry (or with an unreadable body) that were deleted
    pub orphans_removed: usize,
    /// Expired entries reclaimed from the store, sessions and locks alike
    pub purged: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_is_shallow() {
        let mut session = Session::new(
            "s1",
            json!({"user": "alice", "prefs": {"theme": "dark", "lang": "en"}})
                .as_object()
                .cloned()
                .unwrap(),
            60,
        );
        session.merge(
            json!({"prefs": {"theme": "light"}, "step": 2})
                .as_object()
                .cloned()
                .unwrap(),
        );
        assert_eq!(session.field("user"), Some(&json!("alice")));
        assert_eq!(session.field("prefs"), Some(&json!({"theme": "light"})));
        assert_eq!(session.field("step"), Some(&json!(2)));
    }

    #[test]
    fn test_session_json_shape() {
        let session = Session::new("s1", Map::new(), 60);
        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["session_id"], "s1");
        assert_eq!(value["ttl_secs"], 60);
        assert!(value["created_at"].is_string());
    }

    #[test]
    fn test_default_policy_is_fail_closed() {
        assert_eq!(StoreFailurePolicy::default(), StoreFailurePolicy::FailClosed);
    }
}
