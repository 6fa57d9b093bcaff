//! Per-agent priority mailbox

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

use super::types::Envelope;

/// Heap entry: higher priority first, then lower sequence (arrival) first
#[derive(Debug)]
struct Queued {
    seq: u64,
    envelope: Envelope,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.envelope
            .priority
            .cmp(&other.envelope.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct Queue {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
}

/// Inbound queue for one agent
#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    queue: Mutex<Queue>,
    pub(crate) arrived: Notify,
}

impl Mailbox {
    fn queue(&self) -> MutexGuard<'_, Queue> {
        match self.queue.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn push(&self, envelope: Envelope) {
        {
            let mut q = self.queue();
            let seq = q.next_seq;
            q.next_seq += 1;
            q.heap.push(Queued { seq, envelope });
        }
        self.arrived.notify_waiters();
    }

    /// Remove everything queued, in delivery order
    pub(crate) fn drain(&self) -> Vec<Envelope> {
        let mut q = self.queue();
        let mut out = Vec::with_capacity(q.heap.len());
        while let Some(item) = q.heap.pop() {
            out.push(item.envelope);
        }
        out
    }

    pub(crate) fn len(&self) -> usize {
        self.queue().heap.len()
    }

    pub(crate) fn clear(&self) -> usize {
        let mut q = self.queue();
        let n = q.heap.len();
        q.heap.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::types::{MessageKind, Priority};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::watch;

    fn envelope(id: &str, priority: Priority) -> Envelope {
        let (tx, _rx) = watch::channel(None);
        Envelope::new(
            id.into(),
            "queen",
            "bee",
            MessageKind::Task,
            json!(null),
            priority,
            Arc::new(tx),
        )
    }

    #[test]
    fn test_drain_orders_by_priority_then_arrival() {
        let mailbox = Mailbox::default();
        mailbox.push(envelope("n1", Priority::Normal));
        mailbox.push(envelope("c1", Priority::Critical));
        mailbox.push(envelope("n2", Priority::Normal));
        mailbox.push(envelope("h1", Priority::High));
        mailbox.push(envelope("c2", Priority::Critical));

        let ids: Vec<_> = mailbox.drain().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["c1", "c2", "h1", "n1", "n2"]);
        assert_eq!(mailbox.len(), 0);
    }

    #[test]
    fn test_clear() {
        let mailbox = Mailbox::default();
        mailbox.push(envelope("a", Priority::Normal));
        mailbox.push(envelope("b", Priority::Normal));
        assert_eq!(mailbox.clear(), 2);
        assert!(mailbox.drain().is_empty());
    }
}
