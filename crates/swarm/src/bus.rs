//! In-process event fan-out.
//!
//! Components and external observers subscribe and receive every published
//! event on their own channel. Publishing never blocks: each subscriber gets
//! an unbounded queue and drains it at its own pace (slow consumers only grow
//! their own queue). Subscribers that dropped their receiver are pruned on the
//! next publish. Delivery order matches publish order; publishers emit events
//! for one aggregate in mutation order, so per-aggregate order is preserved.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

use crate::events::EventRecord;

/// Fan-out hub for committed events.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<EventRecord>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> Receiver<EventRecord> {
        let (tx, rx) = channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Deliver `record` to every live subscriber.
    pub fn publish(&self, record: &EventRecord) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(record.clone()).is_ok());
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}
