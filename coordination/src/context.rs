//! Application context
//!
//! Built once at startup and passed by reference to whatever needs a
//! component. There are no process-global instances; tearing the context
//! down is the only shutdown path.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bus::{MessageBus, SharedMessageBus};
use crate::config::HiveConfig;
use crate::dispatch::{Dispatcher, SharedDispatcher};
use crate::emergency::{EmergencyControls, SharedEmergencyControls};
use crate::lock::{DistributedLock, SharedLock};
use crate::session::{SessionManager, SharedSessionManager};
use crate::store::{KeySpace, SharedStore};

/// Shared reference to HiveContext
pub type SharedHiveContext = Arc<HiveContext>;

/// Every coordination component for one instance
pub struct HiveContext {
    pub instance_id: String,
    pub config: HiveConfig,
    pub store: SharedStore,
    pub locks: SharedLock,
    pub sessions: SharedSessionManager,
    pub bus: SharedMessageBus,
    pub controls: SharedEmergencyControls,
    pub dispatcher: SharedDispatcher,
    shutdown: CancellationToken,
}

impl HiveContext {
    /// Construct all components over `store` and start the bus
    pub fn build(config: HiveConfig, store: SharedStore) -> Self {
        let instance_id = config.resolve_instance_id();
        let keys = KeySpace::new(config.store.namespace.clone());

        let locks = DistributedLock::new(Arc::clone(&store), keys.clone())
            .with_defaults(config.lock.acquire_options())
            .shared();
        let sessions = SessionManager::new(Arc::clone(&store), keys)
            .with_default_ttl(config.session.default_ttl())
            .with_write_retries(config.session.write_retries)
            .shared();
        let bus = MessageBus::new(config.bus.clone()).shared();
        bus.initialize();
        let controls = EmergencyControls::new(instance_id.clone(), config.emergency.clone()).shared();
        let dispatcher = Dispatcher::new(Arc::clone(&controls)).shared();

        info!(instance_id = %instance_id, namespace = %config.store.namespace, "Hive context built");

        Self {
            instance_id,
            config,
            store,
            locks,
            sessions,
            bus,
            controls,
            dispatcher,
            shutdown: CancellationToken::new(),
        }
    }

    /// Create a shared reference to this context
    pub fn shared(self) -> SharedHiveContext {
        Arc::new(self)
    }

    /// Token cancelled by [`Self::shutdown`]; long-running tasks should
    /// select on it
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop background work, shut the bus down and release every lock this
    /// instance still holds. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let discarded = self.bus.shutdown();
        let released = self.locks.release_all().await;
        info!(
            instance_id = %self.instance_id,
            discarded,
            released,
            "Hive context shut down"
        );
    }
}
