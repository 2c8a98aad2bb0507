//! Bounded inbound message queue with drop-oldest overflow.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tile_proto::HalMessage;
use tokio::sync::Notify;

/// Bounded FIFO of parsed inbound messages. On overflow the oldest message is
/// discarded: for telemetry, staleness beats loss.
#[derive(Debug)]
pub struct InboundQueue {
    inner: Mutex<VecDeque<HalMessage>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl InboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, msg: HalMessage) {
        {
            let mut q = self.inner.lock();
            if q.len() >= self.capacity {
                q.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            q.push_back(msg);
        }
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<HalMessage> {
        self.inner.lock().pop_front()
    }

    /// Wait for the next message. Intended for a single consumer.
    pub async fn pop(&self) -> HalMessage {
        loop {
            let notified = self.notify.notified();
            if let Some(msg) = self.try_pop() {
                return msg;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Messages discarded by the drop-oldest policy since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
