//! System state, audit events and snapshots

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::breaker::BreakerSnapshot;

/// Process-wide operating state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    #[default]
    Normal,
    Paused,
    Degraded,
    Emergency,
    Shutdown,
}

impl SystemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Paused => "paused",
            Self::Degraded => "degraded",
            Self::Emergency => "emergency",
            Self::Shutdown => "shutdown",
        }
    }

    /// Whether new operations may start in this state
    pub fn allows_operations(&self) -> bool {
        matches!(self, Self::Normal | Self::Degraded)
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity attached to shutdown and emergency events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyLevel {
    Info,
    Warning,
    Critical,
    #[default]
    Shutdown,
}

/// Audit trail entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EmergencyEvent {
    SystemPaused {
        reason: String,
        previous: SystemState,
    },
    SystemResumed {
        restored: SystemState,
    },
    EmergencyShutdown {
        severity: EmergencyLevel,
        reason: String,
        triggered_by: String,
        previous: SystemState,
    },
    EmergencyDeclared {
        severity: EmergencyLevel,
        reason: String,
        declared_by: String,
    },
    DegradedEntered {
        reason: String,
    },
    ForcedRecovery {
        from: SystemState,
    },
    NormalRestored {
        restored_by: String,
    },
    BeePaused {
        bee_name: String,
        reason: String,
    },
    BeeResumed {
        bee_name: String,
    },
    FeatureDisabled {
        feature: String,
        reason: String,
    },
    FeatureEnabled {
        feature: String,
    },
    CircuitOpened {
        operation: String,
        failures: u32,
    },
    CircuitHalfOpened {
        operation: String,
    },
    CircuitClosed {
        operation: String,
    },
    CircuitReset {
        operation: String,
    },
    DecisionOverride {
        decision_id: String,
        override_value: Value,
        reason: String,
        overridden_by: String,
    },
    TransitionRefused {
        action: String,
        state: SystemState,
    },
}

impl EmergencyEvent {
    /// Event type name, as serialized
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SystemPaused { .. } => "system_paused",
            Self::SystemResumed { .. } => "system_resumed",
            Self::EmergencyShutdown { .. } => "emergency_shutdown",
            Self::EmergencyDeclared { .. } => "emergency_declared",
            Self::DegradedEntered { .. } => "degraded_entered",
            Self::ForcedRecovery { .. } => "forced_recovery",
            Self::NormalRestored { .. } => "normal_restored",
            Self::BeePaused { .. } => "bee_paused",
            Self::BeeResumed { .. } => "bee_resumed",
            Self::FeatureDisabled { .. } => "feature_disabled",
            Self::FeatureEnabled { .. } => "feature_enabled",
            Self::CircuitOpened { .. } => "circuit_opened",
            Self::CircuitHalfOpened { .. } => "circuit_half_opened",
            Self::CircuitClosed { .. } => "circuit_closed",
            Self::CircuitReset { .. } => "circuit_reset",
            Self::DecisionOverride { .. } => "decision_override",
            Self::TransitionRefused { .. } => "transition_refused",
        }
    }
}

/// A logged event with its time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: EmergencyEvent,
}

/// Serializable view of the controls for admin surfaces
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmergencySnapshot {
    pub instance_id: String,
    pub system_state: SystemState,
    pub can_operate: bool,
    pub paused_bees: Vec<String>,
    pub disabled_features: Vec<String>,
    pub circuit_breakers: BTreeMap<String, BreakerSnapshot>,
    /// Newest first
    pub recent_events: Vec<AuditRecord>,
}

/// Error type for state-machine transitions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("Cannot {action} from state {from}")]
    InvalidTransition {
        action: &'static str,
        from: SystemState,
    },
}

/// Result type for state-machine transitions
pub type ControlResult<T> = Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization_is_tagged() {
        let record = AuditRecord {
            timestamp: Utc::now(),
            event: EmergencyEvent::EmergencyShutdown {
                severity: EmergencyLevel::Critical,
                reason: "key leak".into(),
                triggered_by: "security_bee".into(),
                previous: SystemState::Normal,
            },
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["event"], "emergency_shutdown");
        assert_eq!(value["severity"], "critical");
        assert_eq!(value["previous"], "normal");
        assert!(value["timestamp"].is_string());

        let back: AuditRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back.event.event_type(), "emergency_shutdown");
    }

    #[test]
    fn test_override_carries_arbitrary_value() {
        let event = EmergencyEvent::DecisionOverride {
            decision_id: "d-1".into(),
            override_value: json!({"approve": false}),
            reason: "manual review".into(),
            overridden_by: "admin".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["override_value"]["approve"], false);
    }

    #[test]
    fn test_allows_operations() {
        assert!(SystemState::Normal.allows_operations());
        assert!(SystemState::Degraded.allows_operations());
        assert!(!SystemState::Paused.allows_operations());
        assert!(!SystemState::Emergency.allows_operations());
        assert!(!SystemState::Shutdown.allows_operations());
    }
}
