//! Typed task dispatch to bees
//!
//! Before a handler runs, the dispatcher checks in order: the system state,
//! the bee's pause flag, the task kind's feature switch and its circuit
//! breaker. The handler's outcome is then fed back into the breaker.

pub mod task;

pub use task::{Task, TaskKind, TaskOutcome};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{Envelope, MessageKind, SharedMessageBus};
use crate::emergency::{SharedEmergencyControls, SystemState};

/// Error returned by a bee handler
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type for dispatch
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("System is not accepting work (state: {0})")]
    SystemUnavailable(SystemState),

    #[error("No bee registered under '{0}'")]
    UnknownBee(String),

    #[error("Bee '{bee}' does not handle {kind} tasks")]
    Unsupported { bee: String, kind: TaskKind },

    #[error("Bee '{0}' is paused")]
    BeePaused(String),

    #[error("Feature '{0}' is disabled")]
    FeatureDisabled(String),

    #[error("Circuit breaker open for '{0}'")]
    CircuitOpen(String),

    #[error("Bee '{bee}' failed: {source}")]
    HandlerFailed {
        bee: String,
        #[source]
        source: BoxError,
    },
}

impl DispatchError {
    /// Whether the task was refused before any handler ran
    pub fn is_refusal(&self) -> bool {
        !matches!(self, Self::HandlerFailed { .. })
    }
}

/// Result type for dispatch
pub type DispatchResult<T> = Result<T, DispatchError>;

/// A worker agent
#[async_trait]
pub trait BeeHandler: Send + Sync {
    /// Registry and mailbox name
    fn name(&self) -> &str;

    /// Task kinds this bee accepts
    fn handles(&self, _kind: TaskKind) -> bool {
        true
    }

    async fn handle(&self, task: &Task) -> Result<Value, BoxError>;
}

/// Shared reference to Dispatcher
pub type SharedDispatcher = Arc<Dispatcher>;

/// Registry of bees behind the emergency gates
pub struct Dispatcher {
    controls: SharedEmergencyControls,
    bees: RwLock<HashMap<String, Arc<dyn BeeHandler>>>,
}

impl Dispatcher {
    pub fn new(controls: SharedEmergencyControls) -> Self {
        Self {
            controls,
            bees: RwLock::new(HashMap::new()),
        }
    }

    /// Create a shared reference to this dispatcher
    pub fn shared(self) -> SharedDispatcher {
        Arc::new(self)
    }

    /// Add or replace a bee
    pub fn register(&self, bee: Arc<dyn BeeHandler>) {
        let name = bee.name().to_string();
        let mut bees = match self.bees.write() {
            Ok(bees) => bees,
            Err(poisoned) => poisoned.into_inner(),
        };
        bees.insert(name.clone(), bee);
        info!(bee = %name, "Bee registered with dispatcher");
    }

    fn bee(&self, name: &str) -> Option<Arc<dyn BeeHandler>> {
        let bees = match self.bees.read() {
            Ok(bees) => bees,
            Err(poisoned) => poisoned.into_inner(),
        };
        bees.get(name).cloned()
    }

    pub fn bee_names(&self) -> Vec<String> {
        let bees = match self.bees.read() {
            Ok(bees) => bees,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut names: Vec<String> = bees.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check every gate without running anything
    pub fn check(&self, task: &Task) -> DispatchResult<Arc<dyn BeeHandler>> {
        if !self.controls.can_operate() {
            return Err(DispatchError::SystemUnavailable(
                self.controls.system_state(),
            ));
        }
        let handler = self
            .bee(&task.bee)
            .ok_or_else(|| DispatchError::UnknownBee(task.bee.clone()))?;
        if !handler.handles(task.kind) {
            return Err(DispatchError::Unsupported {
                bee: task.bee.clone(),
                kind: task.kind,
            });
        }
        if self.controls.is_bee_paused(&task.bee) {
            return Err(DispatchError::BeePaused(task.bee.clone()));
        }
        if !self.controls.is_feature_enabled(task.kind.feature()) {
            return Err(DispatchError::FeatureDisabled(task.kind.feature().into()));
        }
        if self.controls.is_circuit_open(task.kind.operation()) {
            return Err(DispatchError::CircuitOpen(task.kind.operation().into()));
        }
        Ok(handler)
    }

    /// Run `task` on its bee if every gate allows it
    pub async fn dispatch(&self, task: &Task) -> DispatchResult<Value> {
        let handler = match self.check(task) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(task_id = %task.id, bee = %task.bee, kind = %task.kind, error = %e, "Task refused");
                return Err(e);
            }
        };

        let operation = task.kind.operation();
        match handler.handle(task).await {
            Ok(result) => {
                self.controls.record_success(operation);
                debug!(task_id = %task.id, bee = %task.bee, kind = %task.kind, "Task completed");
                Ok(result)
            }
            Err(source) => {
                self.controls.record_failure(operation);
                warn!(task_id = %task.id, bee = %task.bee, kind = %task.kind, error = %source, "Task failed");
                Err(DispatchError::HandlerFailed {
                    bee: task.bee.clone(),
                    source,
                })
            }
        }
    }

    /// Serve `bee`'s mailbox until `cancel` fires: every `task` envelope is
    /// decoded, dispatched and answered with a [`TaskOutcome`]. Other
    /// envelope kinds are skipped. Returns how many tasks were answered.
    pub async fn serve_mailbox(
        &self,
        bee: &str,
        bus: SharedMessageBus,
        window: Duration,
        cancel: CancellationToken,
    ) -> usize {
        if let Err(e) = bus.register(bee) {
            warn!(bee, error = %e, "Cannot serve mailbox");
            return 0;
        }
        let mut handled = 0;
        info!(bee, "Serving mailbox");
        while !cancel.is_cancelled() {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = bus.get_messages(bee, window) => batch,
            };
            for envelope in batch {
                if envelope.kind != MessageKind::Task {
                    debug!(bee, kind = %envelope.kind, "Ignoring non-task envelope");
                    continue;
                }
                let outcome = self.handle_envelope(bee, &envelope).await;
                bus.respond(&envelope, serde_json::to_value(outcome).unwrap_or_default());
                handled += 1;
            }
        }
        info!(bee, handled, "Mailbox service stopped");
        handled
    }

    async fn handle_envelope(&self, bee: &str, envelope: &Envelope) -> TaskOutcome {
        let mut task: Task = match serde_json::from_value(envelope.payload.clone()) {
            Ok(task) => task,
            Err(e) => {
                warn!(bee, message_id = %envelope.id, error = %e, "Undecodable task");
                return TaskOutcome::Refused {
                    task_id: envelope.id.clone(),
                    reason: format!("invalid task: {e}"),
                };
            }
        };
        if task.bee.is_empty() {
            task.bee = bee.to_string();
        }

        match self.dispatch(&task).await {
            Ok(result) => TaskOutcome::Completed {
                task_id: task.id,
                result,
            },
            Err(e) if e.is_refusal() => TaskOutcome::Refused {
                task_id: task.id,
                reason: e.to_string(),
            },
            Err(e) => TaskOutcome::Failed {
                task_id: task.id,
                error: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MessageBus, OutgoingMessage};
    use crate::config::{BusConfig, EmergencyConfig};
    use crate::emergency::{EmergencyControls, EmergencyLevel};
    use serde_json::json;

    struct MathsBee;

    #[async_trait]
    impl BeeHandler for MathsBee {
        fn name(&self) -> &str {
            "maths_bee"
        }

        fn handles(&self, kind: TaskKind) -> bool {
            kind == TaskKind::Calculation
        }

        async fn handle(&self, task: &Task) -> Result<Value, BoxError> {
            let x = task
                .payload
                .get("x")
                .and_then(Value::as_i64)
                .ok_or("missing x")?;
            Ok(json!({"square": x * x}))
        }
    }

    fn setup() -> (SharedEmergencyControls, Dispatcher) {
        let controls = EmergencyControls::new("test", EmergencyConfig::default()).shared();
        let dispatcher = Dispatcher::new(Arc::clone(&controls));
        dispatcher.register(Arc::new(MathsBee));
        (controls, dispatcher)
    }

    fn calc(x: Value) -> Task {
        Task::new("maths_bee", TaskKind::Calculation, json!({"x": x}))
    }

    #[tokio::test]
    async fn test_dispatch_runs_handler() {
        let (_, dispatcher) = setup();
        let out = dispatcher.dispatch(&calc(json!(7))).await.unwrap();
        assert_eq!(out, json!({"square": 49}));
    }

    #[tokio::test]
    async fn test_gates_in_order() {
        let (controls, dispatcher) = setup();

        let err = dispatcher
            .dispatch(&Task::new("ghost", TaskKind::Analysis, Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownBee(_)));

        let err = dispatcher
            .dispatch(&Task::new("maths_bee", TaskKind::Analysis, Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unsupported { .. }));

        controls.disable_feature("calculation", "audit");
        controls.pause_bee("maths_bee", "review");
        let err = dispatcher.dispatch(&calc(json!(1))).await.unwrap_err();
        assert!(matches!(err, DispatchError::BeePaused(_)));

        controls.resume_bee("maths_bee");
        let err = dispatcher.dispatch(&calc(json!(1))).await.unwrap_err();
        assert!(matches!(err, DispatchError::FeatureDisabled(_)));

        controls.trigger_emergency_shutdown("breach", "admin", EmergencyLevel::Shutdown);
        let err = dispatcher.dispatch(&calc(json!(1))).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::SystemUnavailable(SystemState::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_failures_trip_breaker() {
        let (controls, dispatcher) = setup();
        for _ in 0..5 {
            let err = dispatcher.dispatch(&calc(json!("nan"))).await.unwrap_err();
            assert!(!err.is_refusal());
        }
        assert!(controls.is_circuit_open("calculation"));

        let err = dispatcher.dispatch(&calc(json!(2))).await.unwrap_err();
        assert!(matches!(err, DispatchError::FeatureDisabled(_)));

        controls.enable_feature("calculation");
        let err = dispatcher.dispatch(&calc(json!(2))).await.unwrap_err();
        assert!(matches!(err, DispatchError::CircuitOpen(_)));
    }

    #[tokio::test]
    async fn test_serve_mailbox_answers_tasks() {
        let (_, dispatcher) = setup();
        let dispatcher = Arc::new(dispatcher);
        let bus = MessageBus::new(BusConfig::default()).shared();
        bus.initialize();
        bus.register("queen").unwrap();
        bus.register("maths_bee").unwrap();

        let cancel = CancellationToken::new();
        let worker = {
            let dispatcher = Arc::clone(&dispatcher);
            let bus = Arc::clone(&bus);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                dispatcher
                    .serve_mailbox("maths_bee", bus, Duration::from_millis(20), cancel)
                    .await
            })
        };

        let reply = bus
            .send(
                OutgoingMessage::new(
                    "queen",
                    "maths_bee",
                    MessageKind::Task,
                    json!({"kind": "calculation", "payload": {"x": 3}}),
                )
                .wait_for_response(),
            )
            .await
            .unwrap()
            .unwrap();
        let outcome: TaskOutcome = serde_json::from_value(reply).unwrap();
        assert!(matches!(
            outcome,
            TaskOutcome::Completed { ref result, .. } if *result == json!({"square": 9})
        ));

        cancel.cancel();
        assert_eq!(worker.await.unwrap(), 1);
    }
}
