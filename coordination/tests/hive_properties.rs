//! Cross-component behaviour of the hive coordination layer
//!
//! Several `DistributedLock`/`SessionManager` instances share one
//! `MemoryStore` to stand in for several service instances sharing the
//! backing store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use hive_coordination::bus::MessageKind;
use hive_coordination::config::{BusConfig, EmergencyConfig};
use hive_coordination::dispatch::{BoxError, TaskOutcome};
use hive_coordination::emergency::CircuitState;
use hive_coordination::store::KeySpace;
use hive_coordination::{
    AcquireOptions, BeeHandler, DistributedLock, EmergencyControls, EmergencyLevel, HiveConfig,
    HiveContext, LockError, MemoryStore, MessageBus, OutgoingMessage, SessionManager, SharedStore,
    SystemState, Task, TaskKind,
};

fn shared_store() -> SharedStore {
    MemoryStore::new().shared()
}

fn instances(store: &SharedStore, n: usize) -> Vec<Arc<DistributedLock>> {
    (0..n)
        .map(|_| DistributedLock::new(Arc::clone(store), KeySpace::new("hive")).shared())
        .collect()
}

fn payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

// ============================================================================
// Locks
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutual_exclusion_across_instances() {
    const INSTANCES: usize = 8;
    const ROUNDS: u64 = 5;

    let store = shared_store();
    let counter = Arc::new(AtomicU64::new(0));
    let opts = AcquireOptions::default()
        .with_retry_delay(Duration::from_millis(1))
        .with_max_retries(10_000);

    let workers = instances(&store, INSTANCES).into_iter().map(|lock| {
        let counter = Arc::clone(&counter);
        tokio::spawn(async move {
            for _ in 0..ROUNDS {
                let guard = lock.acquire("treasury", opts).await.unwrap();
                // Non-atomic read-modify-write; only exclusion keeps it exact.
                let seen = counter.load(Ordering::SeqCst);
                tokio::task::yield_now().await;
                counter.store(seen + 1, Ordering::SeqCst);
                assert!(guard.release().await);
            }
        })
    });
    for res in join_all(workers).await {
        res.unwrap();
    }

    assert_eq!(counter.load(Ordering::SeqCst), INSTANCES as u64 * ROUNDS);
}

#[tokio::test]
async fn test_foreign_token_cannot_release() {
    let store = shared_store();
    let locks = instances(&store, 2);

    let guard = locks[0].acquire_default("ledger").await.unwrap();
    assert!(!locks[1].release("ledger", "someone-else").await);
    assert!(locks[1].is_locked("ledger").await);

    let token = guard.token().unwrap().to_string();
    assert!(locks[1].release("ledger", &token).await);
    assert!(!locks[0].is_locked("ledger").await);
}

#[tokio::test(start_paused = true)]
async fn test_scenario_proposal_lock_handover() {
    let store = shared_store();
    let locks = instances(&store, 2);

    let holder = locks[0]
        .acquire(
            "proposal-42",
            AcquireOptions::default().with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    let contender = AcquireOptions::default()
        .with_timeout(Duration::from_secs(1))
        .with_max_retries(5);
    let err = locks[1].acquire("proposal-42", contender).await.unwrap_err();
    assert_eq!(
        err,
        LockError::Timeout {
            name: "proposal-42".into(),
            attempts: 5
        }
    );

    assert!(holder.release().await);
    let started = Instant::now();
    let guard = locks[1].acquire("proposal-42", contender).await.unwrap();
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert!(guard.release().await);
}

#[tokio::test(start_paused = true)]
async fn test_lapsed_holder_cannot_free_successor() {
    let store = shared_store();
    let locks = instances(&store, 2);
    let short = AcquireOptions::default().with_timeout(Duration::from_secs(1));

    let stale = locks[0].acquire("proposal-7", short).await.unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;

    let fresh = locks[1].acquire("proposal-7", short).await.unwrap();
    assert!(!stale.release().await);
    assert!(locks[0].is_locked("proposal-7").await);
    assert!(fresh.release().await);
}

// ============================================================================
// Sessions
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_sliding_session_ttl_shared_by_instances() {
    let store = shared_store();
    let ttl = Duration::from_secs(10);
    let queen_a = SessionManager::new(Arc::clone(&store), KeySpace::new("hive")).with_default_ttl(ttl);
    let queen_b = SessionManager::new(Arc::clone(&store), KeySpace::new("hive")).with_default_ttl(ttl);

    assert!(queen_a.create("user-1", payload(json!({"role": "treasurer"})), None).await);

    // Each read restarts the countdown, whichever instance serves it.
    tokio::time::advance(Duration::from_secs(8)).await;
    let session = queen_b.get("user-1").await.unwrap();
    assert_eq!(session.field("role"), Some(&json!("treasurer")));
    tokio::time::advance(Duration::from_secs(8)).await;
    assert!(queen_a.get("user-1").await.is_some());

    tokio::time::advance(Duration::from_secs(11)).await;
    assert!(queen_b.get("user-1").await.is_none());
}

#[tokio::test]
async fn test_update_never_creates() {
    let sessions = SessionManager::new(shared_store(), KeySpace::new("hive"));

    assert!(!sessions.update("ghost", payload(json!({"x": 1}))).await);
    assert!(sessions.get("ghost").await.is_none());
    assert_eq!(sessions.count().await, 0);
}

// ============================================================================
// Emergency controls
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_circuit_breaker_full_cycle() {
    let controls = EmergencyControls::new("queen-1", EmergencyConfig::default());

    for _ in 0..4 {
        assert!(!controls.record_failure("calculation"));
    }
    assert_eq!(controls.circuit_state("calculation"), CircuitState::Closed);
    assert!(controls.is_feature_enabled("calculation"));

    assert!(controls.record_failure("calculation"));
    assert_eq!(controls.circuit_state("calculation"), CircuitState::Open);
    assert!(!controls.is_feature_enabled("calculation"));

    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(controls.circuit_state("calculation"), CircuitState::HalfOpen);

    assert!(controls.record_success("calculation"));
    assert_eq!(controls.circuit_state("calculation"), CircuitState::Closed);
    assert_eq!(controls.failure_count("calculation"), 0);
    // Re-enabling the feature is an operator decision.
    assert!(!controls.is_feature_enabled("calculation"));
}

#[test]
fn test_shutdown_gate() {
    let controls = EmergencyControls::new("queen-1", EmergencyConfig::default());

    controls.trigger_emergency_shutdown("runaway spend", "ops", EmergencyLevel::Critical);
    assert!(!controls.can_operate());
    assert!(controls.restore_normal("ops").is_err());

    controls.force_recovery().unwrap();
    assert_eq!(controls.system_state(), SystemState::Degraded);
    assert!(controls.can_operate());

    controls.restore_normal("ops").unwrap();
    assert_eq!(controls.system_state(), SystemState::Normal);
}

// ============================================================================
// Message bus
// ============================================================================

fn active_bus() -> MessageBus {
    let bus = MessageBus::new(BusConfig::default());
    bus.initialize();
    bus
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_request_is_bounded() {
    let bus = active_bus();
    bus.register("queen").unwrap();
    bus.register("silent_bee").unwrap();

    let started = Instant::now();
    let reply = bus
        .send(
            OutgoingMessage::new("queen", "silent_bee", MessageKind::Query, json!({}))
                .wait_for_response(),
        )
        .await
        .unwrap();

    assert_eq!(reply, None);
    assert!(started.elapsed() >= Duration::from_secs(30));
}

#[tokio::test]
async fn test_scenario_single_delivery() {
    let bus = active_bus();
    bus.register("data_bee").unwrap();
    bus.register("maths_bee").unwrap();

    bus.send(OutgoingMessage::new(
        "data_bee",
        "maths_bee",
        MessageKind::Task,
        json!({"x": 1}),
    ))
    .await
    .unwrap();

    let first = bus.get_messages("maths_bee", Duration::ZERO).await;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].sender, "data_bee");
    assert_eq!(first[0].kind, MessageKind::Task);
    assert_eq!(first[0].payload, json!({"x": 1}));
    assert!(first[0].is_delivered());

    assert!(bus.get_messages("maths_bee", Duration::ZERO).await.is_empty());
}

// ============================================================================
// Queen -> bee round trip
// ============================================================================

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
        let a = task.payload["a"].as_i64().ok_or("missing a")?;
        let b = task.payload["b"].as_i64().ok_or("missing b")?;
        Ok(json!({ "sum": a + b }))
    }
}

#[tokio::test]
async fn test_queen_dispatches_task_over_bus() {
    let config = HiveConfig {
        instance_id: Some("queen-1".into()),
        ..HiveConfig::default()
    };
    let ctx = HiveContext::build(config, shared_store()).shared();
    ctx.dispatcher.register(Arc::new(MathsBee));
    ctx.bus.register("queen").unwrap();

    let cancel = CancellationToken::new();
    let server = {
        let ctx = Arc::clone(&ctx);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            ctx.dispatcher
                .serve_mailbox("maths_bee", Arc::clone(&ctx.bus), Duration::from_millis(20), cancel)
                .await
        })
    };
    while !ctx.bus.is_registered("maths_bee") {
        tokio::task::yield_now().await;
    }

    let task = Task::new("maths_bee", TaskKind::Calculation, json!({"a": 2, "b": 3}));
    let reply = ctx
        .bus
        .send(
            OutgoingMessage::new("queen", "maths_bee", MessageKind::Task, serde_json::to_value(&task).unwrap())
                .wait_for_response(),
        )
        .await
        .unwrap()
        .unwrap();
    let outcome: TaskOutcome = serde_json::from_value(reply).unwrap();
    assert_eq!(
        outcome,
        TaskOutcome::Completed {
            task_id: task.id.clone(),
            result: json!({"sum": 5})
        }
    );

    // A paused bee refuses instead of running the task.
    ctx.controls.pause_bee("maths_bee", "maintenance");
    let reply = ctx
        .bus
        .send(
            OutgoingMessage::new("queen", "maths_bee", MessageKind::Task, serde_json::to_value(&task).unwrap())
                .wait_for_response(),
        )
        .await
        .unwrap()
        .unwrap();
    let outcome: TaskOutcome = serde_json::from_value(reply).unwrap();
    assert!(matches!(outcome, TaskOutcome::Refused { .. }));

    cancel.cancel();
    assert_eq!(server.await.unwrap(), 2);
    ctx.shutdown().await;
}
