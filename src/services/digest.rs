// src/services/digest.rs

//! Bounded digest queues keyed by (recipient, cadence).

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::models::{DigestCadence, NotificationRecord};
use crate::services::delivery::ChangeSummary;

/// A pending notification waiting for its digest.
#[derive(Debug, Clone)]
pub struct DigestItem {
    pub notification: NotificationRecord,
    pub address: String,
    pub summary: ChangeSummary,
}

type DigestKey = (String, DigestCadence);

/// Queued digest items, one bounded queue per (recipient, cadence).
///
/// Appends and drains take the same lock, so a drain never splits a
/// concurrent append.
pub struct DigestBuffer {
    capacity: usize,
    queues: Mutex<HashMap<DigestKey, VecDeque<DigestItem>>>,
}

impl DigestBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DigestKey, VecDeque<DigestItem>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an item.
    ///
    /// When the queue reaches capacity it is drained and its items are
    /// returned for an early flush.
    pub fn push(&self, item: DigestItem) -> Option<Vec<DigestItem>> {
        let key = (
            item.notification.recipient_id.clone(),
            item.notification.cadence,
        );
        let mut queues = self.lock();
        let queue = queues.entry(key.clone()).or_default();
        queue.push_back(item);
        if queue.len() >= self.capacity {
            return queues.remove(&key).map(Vec::from);
        }
        None
    }

    /// Put items back without regard to capacity.
    ///
    /// They go ahead of anything queued since, keeping their own order.
    pub fn requeue(&self, items: Vec<DigestItem>) {
        let mut queues = self.lock();
        for item in items.into_iter().rev() {
            let key = (
                item.notification.recipient_id.clone(),
                item.notification.cadence,
            );
            queues.entry(key).or_default().push_front(item);
        }
    }

    /// Remove and return every queue of the given cadence, by recipient.
    pub fn drain(&self, cadence: DigestCadence) -> Vec<(String, Vec<DigestItem>)> {
        let mut queues = self.lock();
        let keys: Vec<DigestKey> = queues
            .keys()
            .filter(|(_, c)| *c == cadence)
            .cloned()
            .collect();

        let mut drained: Vec<(String, Vec<DigestItem>)> = keys
            .into_iter()
            .filter_map(|key| {
                queues
                    .remove(&key)
                    .map(|queue| (key.0, Vec::from(queue)))
            })
            .collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        drained
    }

    /// Number of items queued for a recipient and cadence.
    pub fn len(&self, recipient_id: &str, cadence: DigestCadence) -> usize {
        self.lock()
            .get(&(recipient_id.to_string(), cadence))
            .map_or(0, VecDeque::len)
    }

    /// Whether the notification is already queued.
    pub fn contains(&self, notification_id: uuid::Uuid) -> bool {
        self.lock()
            .values()
            .flatten()
            .any(|item| item.notification.id == notification_id)
    }
}
