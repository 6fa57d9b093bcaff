//! Key layout for the shared backing store
//!
//! Every entry the hive writes lives under a namespace prefix so several
//! deployments can share one store without colliding.

/// Default namespace prefix
pub const DEFAULT_NAMESPACE: &str = "hive";

/// Key prefix for distributed locks
pub const LOCK_PREFIX: &str = "lock:";

/// Key prefix for sessions
pub const SESSION_PREFIX: &str = "session:";

/// Builds namespaced keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    /// Create a key space. An empty namespace yields bare keys.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    fn prefixed(&self, kind: &str, name: &str) -> String {
        if self.namespace.is_empty() {
            format!("{}{}", kind, name)
        } else {
            format!("{}:{}{}", self.namespace, kind, name)
        }
    }

    /// Key for a lock
    pub fn lock(&self, name: &str) -> String {
        self.prefixed(LOCK_PREFIX, name)
    }

    /// Key for a session
    pub fn session(&self, session_id: &str) -> String {
        self.prefixed(SESSION_PREFIX, session_id)
    }

    /// Prefix shared by every lock key
    pub fn lock_prefix(&self) -> String {
        self.prefixed(LOCK_PREFIX, "")
    }

    /// Prefix shared by every session key
    pub fn session_prefix(&self) -> String {
        self.prefixed(SESSION_PREFIX, "")
    }

    /// Strip the lock prefix from a full key
    pub fn parse_lock_name<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.lock_prefix().as_str())
    }

    /// Strip the session prefix from a full key
    pub fn parse_session_id<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.session_prefix().as_str())
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaced_keys() {
        let keys = KeySpace::default();
        assert_eq!(keys.lock("proposal-42"), "hive:lock:proposal-42");
        assert_eq!(keys.session("abc"), "hive:session:abc");
    }

    #[test]
    fn test_bare_keys() {
        let keys = KeySpace::new("");
        assert_eq!(keys.lock("x"), "lock:x");
        assert_eq!(keys.session_prefix(), "session:");
    }

    #[test]
    fn test_parse_round_trip() {
        let keys = KeySpace::new("prod");
        let key = keys.lock("treasury:rebalance");
        assert_eq!(keys.parse_lock_name(&key), Some("treasury:rebalance"));
        assert_eq!(keys.parse_session_id(&key), None);
    }
}
