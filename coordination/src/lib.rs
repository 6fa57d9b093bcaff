//! Hive Coordination Library
//!
//! The coordination layer that lets many short-lived instances of the hive
//! service (a Queen coordinator dispatching work to bee agents) behave as
//! one system:
//!
//! - [`lock`]: cluster-wide mutual exclusion over the shared backing store
//! - [`session`]: cluster-wide sessions with sliding expiration
//! - [`bus`]: per-instance priority mailboxes between named agents
//! - [`emergency`]: system state machine, kill switches, circuit breakers
//! - [`dispatch`]: typed task dispatch gated by the emergency controls
//!
//! Locks and sessions live in the [`store`] and are shared by every
//! instance. The bus and the emergency controls are in-process only.
//!
//! # Usage
//!
//! ```no_run
//! use hive_coordination::{HiveConfig, HiveContext, store::MemoryStore};
//!
//! # async fn run() {
//! let ctx = HiveContext::build(HiveConfig::from_env(), MemoryStore::new().shared());
//! if ctx.controls.can_operate() {
//!     let guard = ctx.locks.acquire_default("proposal-42").await;
//!     // ...
//! #   drop(guard);
//! }
//! ctx.shutdown().await;
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod emergency;
pub mod lock;
pub mod session;
pub mod store;
pub mod telemetry;

pub use bus::{MessageBus, MessageKind, OutgoingMessage, Priority};
pub use config::HiveConfig;
pub use context::{HiveContext, SharedHiveContext};
pub use dispatch::{BeeHandler, Dispatcher, Task, TaskKind};
pub use emergency::{EmergencyControls, EmergencyLevel, SystemState};
pub use lock::{AcquireOptions, DistributedLock, LockError, LockGuard};
pub use session::{SessionManager, StoreFailurePolicy};
pub use store::{BackingStore, MemoryStore, SharedStore};
