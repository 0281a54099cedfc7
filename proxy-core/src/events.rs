//! Live capture and rule-change feed
//!
//! Each subscriber owns a bounded queue. Publishing never blocks: a subscriber
//! whose queue is full or whose receiver is gone is detached and has to call
//! `snapshot()` after resubscribing to catch up.

use crate::capture::CaptureEntry;
use crate::rules::Rule;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyEvent {
    CaptureAppended { entry: CaptureEntry },
    CaptureCompleted { entry: CaptureEntry },
    CapturesCleared,
    RuleAdded { rule: Rule },
    RuleUpdated { rule: Rule },
    RuleDeleted { rule_id: String },
}

/// Receiving end of one subscription.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<ProxyEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<ProxyEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProxyEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn into_stream(self) -> ReceiverStream<ProxyEvent> {
        ReceiverStream::new(self.receiver)
    }
}

#[derive(Debug)]
pub struct EventBroadcaster {
    subscribers: DashMap<u64, mpsc::Sender<ProxyEvent>>,
    next_id: AtomicU64,
    queue_size: usize,
}

impl EventBroadcaster {
    pub fn new(queue_size: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue_size: queue_size.max(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_size);
        self.subscribers.insert(id, tx);
        debug!("Subscriber {} attached", id);
        Subscription { id, receiver: rx }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Push an event to every subscriber; returns how many received it.
    pub fn publish(&self, event: ProxyEvent) -> usize {
        let mut delivered = 0;
        let mut detached = Vec::new();

        for subscriber in self.subscribers.iter() {
            match subscriber.value().try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("Subscriber {} is not keeping up, detaching", subscriber.key());
                    detached.push(*subscriber.key());
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Subscriber {} went away", subscriber.key());
                    detached.push(*subscriber.key());
                }
            }
        }

        for id in detached {
            self.subscribers.remove(&id);
        }
        delivered
    }
}
