/// Process-wide message stream.
///
/// Every isolation context posts into the same bus; each run registers
/// its own listener and filters by source and channel. Registration is a
/// `Listener` guard: dropping it unregisters, so a superseded run cannot
/// leave a handler dangling.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

use super::context::ContextId;

/// A message as seen by listeners: who posted it, and what.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub source: ContextId,
    pub data: Value,
}

type Listeners = HashMap<u64, mpsc::UnboundedSender<InboundMessage>>;

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    listeners: Mutex<Listeners>,
}

impl BusInner {
    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone, Default)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. Messages posted from now on are queued, in
    /// order, on the returned receiver until the `Listener` is dropped.
    pub fn listen(&self) -> (Listener, mpsc::UnboundedReceiver<InboundMessage>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.listeners().insert(id, tx);
        trace!("Bus listener {id} registered");

        let listener = Listener {
            id,
            bus: Arc::downgrade(&self.inner),
        };
        (listener, rx)
    }

    /// Dispatches `data` from `source` to every registered listener.
    /// Returns the number of listeners it reached.
    pub fn post(&self, source: ContextId, data: Value) -> usize {
        let listeners = self.inner.listeners();
        let mut delivered = 0;
        for tx in listeners.values() {
            let message = InboundMessage {
                source,
                data: data.clone(),
            };
            if tx.send(message).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners().len()
    }
}

/// Registration guard returned by [`MessageBus::listen`].
pub struct Listener {
    id: u64,
    bus: Weak<BusInner>,
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.listeners().remove(&self.id);
            trace!("Bus listener {} unregistered", self.id);
        }
    }
}
