//! In-process message bus between named agents
//!
//! Each registered agent owns a mailbox. Mailboxes deliver by priority
//! (critical, then high, then normal) and in arrival order within one
//! priority. Sending to [`BROADCAST`] copies the envelope into every
//! mailbox except the sender's.
//!
//! A sender can wait for a response. The wait observes a shared reply slot
//! (a `tokio::sync::watch` channel) and ends when a recipient responds, the
//! configured ceiling elapses, or the caller's cancellation token fires.
//!
//! The bus is local to one instance; nothing here crosses process
//! boundaries.

mod mailbox;
pub mod types;

pub use types::{
    BusHealth, BusStats, Envelope, HealthStatus, HistoryFilter, MessageKind, OutgoingMessage,
    Priority, BROADCAST,
};

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BusConfig;
use mailbox::Mailbox;

/// Error type for message bus operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("Message bus is not active")]
    Inactive,

    #[error("Recipient not registered: {0}")]
    UnknownRecipient(String),

    #[error("'{0}' is a reserved name")]
    ReservedName(String),

    #[error("Response wait cancelled")]
    Cancelled,
}

/// Result type for message bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Shared reference to MessageBus
pub type SharedMessageBus = Arc<MessageBus>;

#[derive(Default)]
struct BusState {
    mailboxes: HashMap<String, Arc<Mailbox>>,
    history: VecDeque<Envelope>,
}

/// Mailbox registry with bounded send history
pub struct MessageBus {
    config: BusConfig,
    active: AtomicBool,
    state: Mutex<BusState>,
}

impl MessageBus {
    /// Create an inactive bus. Call [`Self::initialize`] before sending.
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            active: AtomicBool::new(false),
            state: Mutex::new(BusState::default()),
        }
    }

    /// Create a shared reference to this bus
    pub fn shared(self) -> SharedMessageBus {
        Arc::new(self)
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn initialize(&self) {
        self.active.store(true, Ordering::SeqCst);
        info!("Message bus initialized");
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop accepting sends and discard queued envelopes.
    /// Returns how many envelopes were discarded.
    pub fn shutdown(&self) -> usize {
        self.active.store(false, Ordering::SeqCst);
        let discarded: usize = self
            .state()
            .mailboxes
            .values()
            .map(|mailbox| mailbox.clear())
            .sum();
        info!(discarded, "Message bus shut down");
        discarded
    }

    /// Create a mailbox for `name`. Registering twice is a no-op;
    /// returns `true` when a new mailbox was created.
    pub fn register(&self, name: &str) -> BusResult<bool> {
        if name == BROADCAST {
            return Err(BusError::ReservedName(name.to_string()));
        }
        let mut state = self.state();
        if state.mailboxes.contains_key(name) {
            return Ok(false);
        }
        state
            .mailboxes
            .insert(name.to_string(), Arc::new(Mailbox::default()));
        info!(agent = name, "Agent registered");
        Ok(true)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.state().mailboxes.contains_key(name)
    }

    /// Registered agent names, sorted
    pub fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().mailboxes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Send a message. Returns the response when `wait_for_response` is set
    /// and a recipient answers in time, otherwise `None`.
    pub async fn send(&self, msg: OutgoingMessage) -> BusResult<Option<Value>> {
        self.send_with_cancel(msg, &CancellationToken::new()).await
    }

    /// [`Self::send`] with a cancellable response wait
    pub async fn send_with_cancel(
        &self,
        msg: OutgoingMessage,
        cancel: &CancellationToken,
    ) -> BusResult<Option<Value>> {
        if !self.is_active() {
            warn!(sender = %msg.sender, "Send refused: message bus not active");
            return Err(BusError::Inactive);
        }

        let (reply_tx, mut reply_rx) = watch::channel(None);
        let reply = Arc::new(reply_tx);
        let id = Uuid::new_v4().to_string();

        let delivered_to = {
            let mut state = self.state();
            let targets: Vec<(String, Arc<Mailbox>)> = if msg.is_broadcast() {
                state
                    .mailboxes
                    .iter()
                    .filter(|(name, _)| **name != msg.sender)
                    .map(|(name, mb)| (name.clone(), Arc::clone(mb)))
                    .collect()
            } else {
                match state.mailboxes.get(&msg.recipient) {
                    Some(mb) => vec![(msg.recipient.clone(), Arc::clone(mb))],
                    None => {
                        warn!(sender = %msg.sender, recipient = %msg.recipient, "Recipient not found");
                        return Err(BusError::UnknownRecipient(msg.recipient));
                    }
                }
            };

            for (name, mailbox) in &targets {
                let envelope = Envelope::new(
                    id.clone(),
                    &msg.sender,
                    name,
                    msg.kind,
                    msg.payload.clone(),
                    msg.priority,
                    Arc::clone(&reply),
                );
                state.history.push_back(envelope.clone());
                while state.history.len() > self.config.history_capacity {
                    state.history.pop_front();
                }
                mailbox.push(envelope);
            }
            targets.len()
        };

        if msg.is_broadcast() {
            info!(sender = %msg.sender, kind = %msg.kind, recipients = delivered_to, "Broadcast sent");
        } else {
            debug!(
                sender = %msg.sender,
                recipient = %msg.recipient,
                kind = %msg.kind,
                priority = msg.priority.as_u8(),
                "Message sent"
            );
        }

        if !msg.wait_for_response || delivered_to == 0 {
            return Ok(None);
        }
        drop(reply);

        let ceiling = self.config.response_timeout();
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(message_id = %id, "Response wait cancelled");
                Err(BusError::Cancelled)
            }
            res = tokio::time::timeout(ceiling, reply_rx.wait_for(Option::is_some)) => match res {
                Ok(Ok(value)) => Ok(value.clone()),
                Ok(Err(_)) => Ok(None),
                Err(_) => {
                    warn!(
                        message_id = %id,
                        recipient = %msg.recipient,
                        timeout_secs = ceiling.as_secs(),
                        "No response within timeout"
                    );
                    Ok(None)
                }
            },
        }
    }

    /// Drain everything queued for `name`, waiting up to `window` for a
    /// first envelope when the mailbox is empty. Drained envelopes are
    /// marked delivered; a second call returns only newer arrivals.
    pub async fn get_messages(&self, name: &str, window: Duration) -> Vec<Envelope> {
        let Some(mailbox) = self.state().mailboxes.get(name).cloned() else {
            return Vec::new();
        };

        let mut batch = mailbox.drain();
        if batch.is_empty() && !window.is_zero() {
            let arrived = mailbox.arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            batch = mailbox.drain();
            if batch.is_empty() {
                let _ = tokio::time::timeout(window, arrived).await;
                batch = mailbox.drain();
            }
        }

        for envelope in &batch {
            envelope.mark_delivered();
        }
        if !batch.is_empty() {
            debug!(agent = name, count = batch.len(), "Messages drained");
        }
        batch
    }

    /// [`Self::get_messages`] with the configured drain window
    pub async fn receive(&self, name: &str) -> Vec<Envelope> {
        self.get_messages(name, self.config.drain_window()).await
    }

    /// Answer an envelope. The first response wins; returns `false` if
    /// one was already recorded.
    pub fn respond(&self, envelope: &Envelope, value: Value) -> bool {
        envelope.mark_delivered();
        let accepted = envelope.reply.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        });
        debug!(
            message_id = %envelope.id,
            from = %envelope.recipient,
            to = %envelope.sender,
            accepted,
            "Response sent"
        );
        accepted
    }

    /// Most recent `limit` envelopes matching `filter`, oldest first
    pub fn history(&self, filter: &HistoryFilter, limit: usize) -> Vec<Envelope> {
        let state = self.state();
        let mut matched: Vec<Envelope> = state
            .history
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect();
        matched.reverse();
        matched
    }

    pub fn stats(&self) -> BusStats {
        let state = self.state();
        Self::compute_stats(&state)
    }

    fn compute_stats(state: &BusState) -> BusStats {
        let mut stats = BusStats {
            total_messages: state.history.len(),
            registered_agents: state.mailboxes.len(),
            ..Default::default()
        };
        for envelope in &state.history {
            if envelope.is_delivered() {
                stats.delivered_messages += 1;
            }
            *stats.by_sender.entry(envelope.sender.clone()).or_default() += 1;
            *stats.by_kind.entry(envelope.kind).or_default() += 1;
            *stats.by_priority.entry(envelope.priority).or_default() += 1;
        }
        if stats.total_messages > 0 {
            stats.delivery_rate = stats.delivered_messages as f64 / stats.total_messages as f64;
        }
        stats
    }

    /// Queue depths and delivery rate, summarised
    pub fn health_check(&self) -> BusHealth {
        let state = self.state();
        let stats = Self::compute_stats(&state);

        let queue_depths: BTreeMap<String, usize> = state
            .mailboxes
            .iter()
            .map(|(name, mb)| (name.clone(), mb.len()))
            .collect();
        let registered: Vec<String> = queue_depths.keys().cloned().collect();
        drop(state);

        let mut issues = Vec::new();
        let mut critical = false;
        for (name, depth) in &queue_depths {
            if *depth > self.config.backlog_threshold {
                issues.push(format!("{name} queue backlog: {depth} messages"));
            }
        }
        if stats.total_messages > self.config.min_messages_for_rate
            && stats.delivery_rate < self.config.min_delivery_rate
        {
            issues.push(format!(
                "Low delivery rate: {:.1}%",
                stats.delivery_rate * 100.0
            ));
            critical = true;
        }

        let status = if issues.is_empty() {
            HealthStatus::Healthy
        } else if critical || issues.len() >= 3 {
            HealthStatus::Critical
        } else {
            HealthStatus::Degraded
        };
        if status != HealthStatus::Healthy {
            warn!(?status, issues = issues.len(), "Message bus unhealthy");
        }

        BusHealth {
            status,
            active: self.is_active(),
            registered,
            queue_depths,
            stats,
            issues,
        }
    }
}
