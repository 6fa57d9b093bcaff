//! Emergency controls
//!
//! One operating state per process plus per-agent pause flags, per-feature
//! kill switches and per-operation circuit breakers. Every path that starts
//! work consults [`EmergencyControls::can_operate`] first.
//!
//! # State machine
//!
//! | Action | From | To |
//! |---|---|---|
//! | `pause_system` | normal, degraded | paused |
//! | `resume_system` | paused | state held before the pause |
//! | `enter_degraded` | normal | degraded |
//! | `declare_emergency` | normal, degraded, paused | emergency |
//! | `trigger_emergency_shutdown` | any | shutdown |
//! | `force_recovery` | shutdown, emergency | degraded |
//! | `restore_normal` | degraded | normal |
//!
//! A breaker that opens also disables the feature of the same name. The
//! feature stays disabled after the breaker recovers until an operator
//! re-enables it.
//!
//! All of this is per instance. Nothing is propagated to other instances;
//! snapshots carry the instance id so operators can tell them apart.

pub mod breaker;
pub mod types;

pub use breaker::{BreakerSnapshot, CircuitBreakers, CircuitState, FailureOutcome};
pub use types::{
    AuditRecord, ControlError, ControlResult, EmergencyEvent, EmergencyLevel, EmergencySnapshot,
    SystemState,
};

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::EmergencyConfig;

/// Shared reference to EmergencyControls
pub type SharedEmergencyControls = Arc<EmergencyControls>;

struct Inner {
    state: SystemState,
    paused_from: Option<SystemState>,
    paused_bees: BTreeSet<String>,
    disabled_features: BTreeSet<String>,
    breakers: CircuitBreakers,
    log: VecDeque<AuditRecord>,
}

/// System state machine, kill switches and circuit breakers
pub struct EmergencyControls {
    instance_id: String,
    config: EmergencyConfig,
    inner: RwLock<Inner>,
}

impl EmergencyControls {
    pub fn new(instance_id: impl Into<String>, config: EmergencyConfig) -> Self {
        let breakers =
            CircuitBreakers::new(config.max_failures, config.circuit_breaker_timeout());
        Self {
            instance_id: instance_id.into(),
            config,
            inner: RwLock::new(Inner {
                state: SystemState::Normal,
                paused_from: None,
                paused_bees: BTreeSet::new(),
                disabled_features: BTreeSet::new(),
                breakers,
                log: VecDeque::new(),
            }),
        }
    }

    /// Create a shared reference to these controls
    pub fn shared(self) -> SharedEmergencyControls {
        Arc::new(self)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, inner: &mut Inner, event: EmergencyEvent) {
        inner.log.push_back(AuditRecord {
            timestamp: Utc::now(),
            event,
        });
        while inner.log.len() > self.config.event_log_capacity {
            inner.log.pop_front();
        }
    }

    fn refuse(&self, inner: &mut Inner, action: &'static str) -> ControlError {
        let from = inner.state;
        warn!(action, state = %from, "State transition refused");
        self.record(
            inner,
            EmergencyEvent::TransitionRefused {
                action: action.to_string(),
                state: from,
            },
        );
        ControlError::InvalidTransition { action, from }
    }

    // ========================================================================
    // System state
    // ========================================================================

    pub fn system_state(&self) -> SystemState {
        self.read().state
    }

    /// Whether new operations may start (normal or degraded)
    pub fn can_operate(&self) -> bool {
        self.read().state.allows_operations()
    }

    /// Stop new operations, keeping all other state
    pub fn pause_system(&self, reason: &str) -> ControlResult<()> {
        let mut inner = self.write();
        let previous = inner.state;
        if !matches!(previous, SystemState::Normal | SystemState::Degraded) {
            return Err(self.refuse(&mut inner, "pause"));
        }
        inner.paused_from = Some(previous);
        inner.state = SystemState::Paused;
        self.record(
            &mut inner,
            EmergencyEvent::SystemPaused {
                reason: reason.to_string(),
                previous,
            },
        );
        warn!(reason, previous = %previous, "System paused");
        Ok(())
    }

    /// Return from a pause to the state held before it
    pub fn resume_system(&self) -> ControlResult<SystemState> {
        let mut inner = self.write();
        if inner.state != SystemState::Paused {
            return Err(self.refuse(&mut inner, "resume"));
        }
        let restored = inner.paused_from.take().unwrap_or_default();
        inner.state = restored;
        self.record(&mut inner, EmergencyEvent::SystemResumed { restored });
        info!(state = %restored, "System resumed");
        Ok(restored)
    }

    /// Halt all operations until [`Self::force_recovery`]. Valid from any state.
    pub fn trigger_emergency_shutdown(
        &self,
        reason: &str,
        triggered_by: &str,
        severity: EmergencyLevel,
    ) {
        let mut inner = self.write();
        let previous = inner.state;
        inner.state = SystemState::Shutdown;
        inner.paused_from = None;
        self.record(
            &mut inner,
            EmergencyEvent::EmergencyShutdown {
                severity,
                reason: reason.to_string(),
                triggered_by: triggered_by.to_string(),
                previous,
            },
        );
        error!(
            reason,
            triggered_by,
            ?severity,
            previous = %previous,
            instance_id = %self.instance_id,
            "EMERGENCY SHUTDOWN TRIGGERED"
        );
    }

    /// Enter the emergency state; operations stop, recovery is the same as
    /// from shutdown
    pub fn declare_emergency(
        &self,
        reason: &str,
        declared_by: &str,
        severity: EmergencyLevel,
    ) -> ControlResult<()> {
        let mut inner = self.write();
        if !matches!(
            inner.state,
            SystemState::Normal | SystemState::Degraded | SystemState::Paused
        ) {
            return Err(self.refuse(&mut inner, "declare emergency"));
        }
        inner.state = SystemState::Emergency;
        inner.paused_from = None;
        self.record(
            &mut inner,
            EmergencyEvent::EmergencyDeclared {
                severity,
                reason: reason.to_string(),
                declared_by: declared_by.to_string(),
            },
        );
        error!(reason, declared_by, ?severity, "Emergency declared");
        Ok(())
    }

    /// Keep operating with reduced guarantees
    pub fn enter_degraded(&self, reason: &str) -> ControlResult<()> {
        let mut inner = self.write();
        if inner.state != SystemState::Normal {
            return Err(self.refuse(&mut inner, "enter degraded mode"));
        }
        inner.state = SystemState::Degraded;
        self.record(
            &mut inner,
            EmergencyEvent::DegradedEntered {
                reason: reason.to_string(),
            },
        );
        warn!(reason, "System degraded");
        Ok(())
    }

    /// Admin-only: leave shutdown or emergency into degraded mode.
    /// Never goes straight to normal; see [`Self::restore_normal`].
    pub fn force_recovery(&self) -> ControlResult<()> {
        let mut inner = self.write();
        let from = inner.state;
        if !matches!(from, SystemState::Shutdown | SystemState::Emergency) {
            return Err(self.refuse(&mut inner, "force recovery"));
        }
        inner.state = SystemState::Degraded;
        self.record(&mut inner, EmergencyEvent::ForcedRecovery { from });
        warn!(from = %from, "Forced recovery: system in degraded mode until restored");
        Ok(())
    }

    /// Operator step back to normal after recovery
    pub fn restore_normal(&self, restored_by: &str) -> ControlResult<()> {
        let mut inner = self.write();
        if inner.state != SystemState::Degraded {
            return Err(self.refuse(&mut inner, "restore normal"));
        }
        inner.state = SystemState::Normal;
        self.record(
            &mut inner,
            EmergencyEvent::NormalRestored {
                restored_by: restored_by.to_string(),
            },
        );
        info!(restored_by, "System restored to normal");
        Ok(())
    }

    // ========================================================================
    // Kill switches
    // ========================================================================

    pub fn pause_bee(&self, bee_name: &str, reason: &str) {
        let mut inner = self.write();
        inner.paused_bees.insert(bee_name.to_string());
        self.record(
            &mut inner,
            EmergencyEvent::BeePaused {
                bee_name: bee_name.to_string(),
                reason: reason.to_string(),
            },
        );
        warn!(bee = bee_name, reason, "Bee paused");
    }

    /// Returns `false` if the bee was not paused
    pub fn resume_bee(&self, bee_name: &str) -> bool {
        let mut inner = self.write();
        if !inner.paused_bees.remove(bee_name) {
            return false;
        }
        self.record(
            &mut inner,
            EmergencyEvent::BeeResumed {
                bee_name: bee_name.to_string(),
            },
        );
        info!(bee = bee_name, "Bee resumed");
        true
    }

    pub fn is_bee_paused(&self, bee_name: &str) -> bool {
        self.read().paused_bees.contains(bee_name)
    }

    pub fn disable_feature(&self, feature: &str, reason: &str) {
        let mut inner = self.write();
        self.disable_locked(&mut inner, feature, reason);
    }

    fn disable_locked(&self, inner: &mut Inner, feature: &str, reason: &str) {
        inner.disabled_features.insert(feature.to_string());
        self.record(
            inner,
            EmergencyEvent::FeatureDisabled {
                feature: feature.to_string(),
                reason: reason.to_string(),
            },
        );
        warn!(feature, reason, "Feature disabled");
    }

    /// Returns `false` if the feature was not disabled
    pub fn enable_feature(&self, feature: &str) -> bool {
        let mut inner = self.write();
        if !inner.disabled_features.remove(feature) {
            return false;
        }
        self.record(
            &mut inner,
            EmergencyEvent::FeatureEnabled {
                feature: feature.to_string(),
            },
        );
        info!(feature, "Feature enabled");
        true
    }

    pub fn is_feature_enabled(&self, feature: &str) -> bool {
        !self.read().disabled_features.contains(feature)
    }

    // ========================================================================
    // Circuit breakers
    // ========================================================================

    /// Count a failure of `operation`. Returns `true` when this failure
    /// opened the breaker (which also disables the same-named feature).
    pub fn record_failure(&self, operation: &str) -> bool {
        let mut inner = self.write();
        self.note_half_open(&mut inner, operation);
        let outcome = inner.breakers.record_failure(operation);
        let FailureOutcome::Tripped { failures } = outcome else {
            return false;
        };
        self.record(
            &mut inner,
            EmergencyEvent::CircuitOpened {
                operation: operation.to_string(),
                failures,
            },
        );
        error!(operation, failures, "CIRCUIT BREAKER TRIGGERED");
        self.disable_locked(&mut inner, operation, "Circuit breaker - too many failures");
        true
    }

    /// Count a success of `operation`. Returns `true` when a half-open
    /// breaker closed.
    pub fn record_success(&self, operation: &str) -> bool {
        let mut inner = self.write();
        self.note_half_open(&mut inner, operation);
        if !inner.breakers.record_success(operation) {
            return false;
        }
        self.record(
            &mut inner,
            EmergencyEvent::CircuitClosed {
                operation: operation.to_string(),
            },
        );
        info!(operation, "Circuit breaker recovered");
        true
    }

    fn note_half_open(&self, inner: &mut Inner, operation: &str) {
        if inner.breakers.note_half_open(operation) {
            self.record(
                inner,
                EmergencyEvent::CircuitHalfOpened {
                    operation: operation.to_string(),
                },
            );
            info!(operation, "Circuit breaker half-open");
        }
    }

    /// Admin override: force the breaker closed. The feature it disabled
    /// stays disabled.
    pub fn reset_circuit_breaker(&self, operation: &str) -> bool {
        let mut inner = self.write();
        if !inner.breakers.reset(operation) {
            return false;
        }
        self.record(
            &mut inner,
            EmergencyEvent::CircuitReset {
                operation: operation.to_string(),
            },
        );
        info!(operation, "Circuit breaker reset");
        true
    }

    pub fn circuit_state(&self, operation: &str) -> CircuitState {
        self.read().breakers.state(operation)
    }

    pub fn is_circuit_open(&self, operation: &str) -> bool {
        self.read().breakers.is_open(operation)
    }

    pub fn failure_count(&self, operation: &str) -> u32 {
        self.read().breakers.failure_count(operation)
    }

    // ========================================================================
    // Audit
    // ========================================================================

    /// Record a human override of an agent decision
    pub fn override_decision(
        &self,
        decision_id: &str,
        override_value: Value,
        reason: &str,
        overridden_by: &str,
    ) {
        let mut inner = self.write();
        self.record(
            &mut inner,
            EmergencyEvent::DecisionOverride {
                decision_id: decision_id.to_string(),
                override_value,
                reason: reason.to_string(),
                overridden_by: overridden_by.to_string(),
            },
        );
        warn!(decision_id, overridden_by, reason, "Decision overridden");
    }

    /// Up to `limit` events, newest first
    pub fn events(&self, limit: usize) -> Vec<AuditRecord> {
        self.read().log.iter().rev().take(limit).cloned().collect()
    }

    pub fn get_state(&self) -> EmergencySnapshot {
        let inner = self.read();
        EmergencySnapshot {
            instance_id: self.instance_id.clone(),
            system_state: inner.state,
            can_operate: inner.state.allows_operations(),
            paused_bees: inner.paused_bees.iter().cloned().collect(),
            disabled_features: inner.disabled_features.iter().cloned().collect(),
            circuit_breakers: inner.breakers.snapshot(),
            recent_events: inner
                .log
                .iter()
                .rev()
                .take(self.config.recent_events)
                .cloned()
                .collect(),
        }
    }
}
