//! Bounded in-memory capture log

use crate::capture::{CaptureEntry, Completion};
use crate::events::{EventBroadcaster, ProxyEvent};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug)]
struct Entries {
    queue: VecDeque<CaptureEntry>,
    /// Never reused, even across `clear()`
    next_id: u64,
}

/// Retains the most recent `capacity` exchanges in insertion order.
///
/// Eviction is strict FIFO. Ids are assigned and events published while the
/// lock is held, so id order, buffer order and feed order agree.
#[derive(Debug)]
pub struct LogBuffer {
    entries: Mutex<Entries>,
    capacity: usize,
    events: Arc<EventBroadcaster>,
}

impl LogBuffer {
    pub fn new(capacity: usize, events: Arc<EventBroadcaster>) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(Entries {
                queue: VecDeque::with_capacity(capacity),
                next_id: 1,
            }),
            capacity,
            events,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().queue.is_empty()
    }

    /// Store a new entry and return the id assigned to it.
    pub fn append(&self, mut entry: CaptureEntry) -> u64 {
        let mut entries = self.entries.lock();
        let id = entries.next_id;
        entries.next_id += 1;
        entry.id = id;

        entries.queue.push_back(entry.clone());
        while entries.queue.len() > self.capacity {
            entries.queue.pop_front();
        }
        self.events.publish(ProxyEvent::CaptureAppended { entry });
        id
    }

    /// Fill in the completion fields of an entry.
    ///
    /// Returns false when the entry was evicted, is unknown, or is already complete.
    pub fn update(&self, entry_id: u64, patch: Completion) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.queue.iter_mut().find(|e| e.id == entry_id) else {
            return false;
        };
        if !entry.complete(patch) {
            return false;
        }
        let entry = entry.clone();
        self.events.publish(ProxyEvent::CaptureCompleted { entry });
        true
    }

    pub fn get(&self, entry_id: u64) -> Option<CaptureEntry> {
        self.entries
            .lock()
            .queue
            .iter()
            .find(|e| e.id == entry_id)
            .cloned()
    }

    /// Consistent copy of the buffer, oldest first.
    pub fn snapshot(&self) -> Vec<CaptureEntry> {
        self.entries.lock().queue.iter().cloned().collect()
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.queue.clear();
        self.events.publish(ProxyEvent::CapturesCleared);
    }
}
