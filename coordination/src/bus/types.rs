//! Message bus types

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use tokio::sync::watch;

/// Reserved recipient that fans an envelope out to every other agent
pub const BROADCAST: &str = "all";

// ============================================================================
// Priority / Kind
// ============================================================================

/// Delivery priority. Higher priorities are drained first. Carried on
/// the wire as its numeric level, 0 to 2.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(into = "u8", from = "u8")]
pub enum Priority {
    #[default]
    Normal = 0,
    High = 1,
    Critical = 2,
}

impl Priority {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Map a numeric level (0..=2); anything above 2 is critical.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Self::Normal,
            1 => Self::High,
            _ => Self::Critical,
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.as_u8()
    }
}

impl From<u8> for Priority {
    fn from(level: u8) -> Self {
        Self::from_level(level)
    }
}

/// What an envelope carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Task,
    Query,
    Alert,
    Status,
    Result,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Query => "query",
            Self::Alert => "alert",
            Self::Status => "status",
            Self::Result => "result",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Reply slot shared by every copy of one send
pub(crate) type ReplySlot = Arc<watch::Sender<Option<Value>>>;

/// A message as delivered to a mailbox.
///
/// Clones share the delivered flag and the reply slot, so the copy kept in
/// the history observes delivery and responses made through the copy the
/// recipient drained.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub payload: Value,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    #[serde(serialize_with = "serialize_flag")]
    pub(crate) delivered: Arc<AtomicBool>,
    #[serde(rename = "response", serialize_with = "serialize_reply")]
    pub(crate) reply: ReplySlot,
}

impl Envelope {
    pub(crate) fn new(
        id: String,
        sender: &str,
        recipient: &str,
        kind: MessageKind,
        payload: Value,
        priority: Priority,
        reply: ReplySlot,
    ) -> Self {
        Self {
            id,
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            kind,
            payload,
            priority,
            timestamp: Utc::now(),
            delivered: Arc::new(AtomicBool::new(false)),
            reply,
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_delivered(&self) {
        self.delivered.store(true, Ordering::SeqCst);
    }

    /// Response, if one has been given
    pub fn response(&self) -> Option<Value> {
        self.reply.borrow().clone()
    }
}

fn serialize_flag<S: Serializer>(flag: &Arc<AtomicBool>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_bool(flag.load(Ordering::SeqCst))
}

fn serialize_reply<S: Serializer>(slot: &ReplySlot, s: S) -> Result<S::Ok, S::Error> {
    slot.borrow().serialize(s)
}

/// A message about to be sent
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub sender: String,
    pub recipient: String,
    pub kind: MessageKind,
    pub payload: Value,
    pub priority: Priority,
    pub wait_for_response: bool,
}

impl OutgoingMessage {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        kind: MessageKind,
        payload: Value,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            kind,
            payload,
            priority: Priority::Normal,
            wait_for_response: false,
        }
    }

    /// Address every registered agent except the sender
    pub fn broadcast(sender: impl Into<String>, kind: MessageKind, payload: Value) -> Self {
        Self::new(sender, BROADCAST, kind, payload)
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Block the send until a recipient responds or the ceiling elapses
    pub fn wait_for_response(mut self) -> Self {
        self.wait_for_response = true;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient == BROADCAST
    }
}

// ============================================================================
// History / Stats / Health
// ============================================================================

/// History query. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryFilter {
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub kind: Option<MessageKind>,
}

impl HistoryFilter {
    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn kind(mut self, kind: MessageKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        self.sender.as_deref().map_or(true, |s| envelope.sender == s)
            && self
                .recipient
                .as_deref()
                .map_or(true, |r| envelope.recipient == r)
            && self.kind.map_or(true, |k| envelope.kind == k)
    }
}

/// Aggregate traffic statistics over the retained history
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BusStats {
    pub total_messages: usize,
    pub delivered_messages: usize,
    /// Delivered / total, 0.0 when nothing was sent
    pub delivery_rate: f64,
    pub registered_agents: usize,
    pub by_sender: BTreeMap<String, usize>,
    pub by_kind: BTreeMap<MessageKind, usize>,
    pub by_priority: BTreeMap<Priority, usize>,
}

/// Overall bus condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

/// Result of [`super::MessageBus::health_check`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusHealth {
    pub status: HealthStatus,
    pub active: bool,
    pub registered: Vec<String>,
    pub queue_depths: BTreeMap<String, usize>,
    pub stats: BusStats,
    pub issues: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert_eq!(Priority::from_level(7), Priority::Critical);
        assert_eq!(Priority::High.as_u8(), 1);
    }

    #[test]
    fn test_priority_wire_level() {
        assert_eq!(serde_json::to_value(Priority::Critical).unwrap(), json!(2));
        let parsed: Priority = serde_json::from_value(json!(1)).unwrap();
        assert_eq!(parsed, Priority::High);
        let clamped: Priority = serde_json::from_value(json!(9)).unwrap();
        assert_eq!(clamped, Priority::Critical);
        assert!(serde_json::from_value::<Priority>(json!("high")).is_err());
    }

    #[test]
    fn test_envelope_serializes_live_state() {
        let (tx, _rx) = watch::channel(None);
        let env = Envelope::new(
            "m1".into(),
            "queen",
            "maths_bee",
            MessageKind::Query,
            json!({"q": 1}),
            Priority::High,
            Arc::new(tx),
        );
        let copy = env.clone();
        copy.mark_delivered();
        copy.reply.send_replace(Some(json!(42)));

        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "query");
        assert_eq!(value["priority"], 1);
        assert_eq!(value["delivered"], true);
        assert_eq!(value["response"], 42);
    }

    #[test]
    fn test_history_filter() {
        let (tx, _rx) = watch::channel(None);
        let env = Envelope::new(
            "m1".into(),
            "data_bee",
            "maths_bee",
            MessageKind::Task,
            Value::Null,
            Priority::Normal,
            Arc::new(tx),
        );
        assert!(HistoryFilter::default().matches(&env));
        assert!(HistoryFilter::default().sender("data_bee").matches(&env));
        assert!(!HistoryFilter::default().recipient("queen").matches(&env));
        assert!(!HistoryFilter::default()
            .kind(MessageKind::Alert)
            .matches(&env));
    }

    #[test]
    fn test_outgoing_builder() {
        let msg = OutgoingMessage::broadcast("queen", MessageKind::Alert, Value::Null)
            .priority(Priority::Critical)
            .wait_for_response();
        assert!(msg.is_broadcast());
        assert!(msg.wait_for_response);
        assert_eq!(msg.priority, Priority::Critical);
    }
}
