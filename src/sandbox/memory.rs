//! In-memory platform used by the unit tests.
//!
//! `MemoryContext` records what was loaded into it and lets a test post
//! wire messages "from inside" the context, standing in for the capture
//! shim. `Recorder` is a `RunObserver` that forwards every callback to a
//! channel so tests can await them in order.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::bus::MessageBus;
use super::context::{Capabilities, ContextId, IsolationContext, Mount, SandboxError};
use super::protocol::{MessageKind, ReportedMessage};
use super::runner::RunObserver;

pub(crate) struct MemoryMount {
    bus: MessageBus,
    available: bool,
    fail_load: bool,
    contexts: Mutex<Vec<Arc<MemoryContext>>>,
}

impl MemoryMount {
    pub fn new(bus: MessageBus) -> Self {
        Self {
            bus,
            available: true,
            fail_load: false,
            contexts: Mutex::new(Vec::new()),
        }
    }

    /// A mount whose container is missing.
    pub fn unavailable(bus: MessageBus) -> Self {
        Self {
            available: false,
            ..Self::new(bus)
        }
    }

    /// A mount whose contexts refuse any document.
    pub fn failing_load(bus: MessageBus) -> Self {
        Self {
            fail_load: true,
            ..Self::new(bus)
        }
    }

    /// Most recently attached context.
    pub fn last(&self) -> Arc<MemoryContext> {
        self.contexts
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no context attached yet")
    }

    pub fn attached_count(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }
}

impl Mount for MemoryMount {
    fn attach(
        &self,
        capabilities: Capabilities,
    ) -> Result<Arc<dyn IsolationContext>, SandboxError> {
        if !self.available {
            return Err(SandboxError::MountUnavailable("no container".into()));
        }
        let mut contexts = self.contexts.lock().unwrap();
        if let Some(previous) = contexts.last() {
            previous.detach();
        }
        let context = Arc::new(MemoryContext {
            id: ContextId::new(),
            bus: self.bus.clone(),
            capabilities,
            fail_load: self.fail_load,
            document: Mutex::new(None),
            blanked: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        });
        contexts.push(Arc::clone(&context));
        Ok(context)
    }
}

pub(crate) struct MemoryContext {
    id: ContextId,
    bus: MessageBus,
    capabilities: Capabilities,
    fail_load: bool,
    document: Mutex<Option<String>>,
    blanked: AtomicBool,
    detached: AtomicBool,
}

impl MemoryContext {
    pub fn document(&self) -> Option<String> {
        self.document.lock().unwrap().clone()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Channel id embedded in the loaded document.
    pub fn channel(&self) -> Option<String> {
        let doc = self.document()?;
        let start = doc.find("const __channelId = \"")? + "const __channelId = \"".len();
        let end = doc[start..].find('"')?;
        Some(doc[start..start + end].to_string())
    }

    pub fn is_blanked(&self) -> bool {
        self.blanked.load(Ordering::SeqCst)
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Wire message on this context's channel.
    pub fn wire(&self, kind: &str, level: Option<&str>, payload: &str) -> Value {
        let mut msg = json!({
            "channelId": self.channel().unwrap_or_default(),
            "type": kind,
            "payload": payload,
        });
        if let Some(level) = level {
            msg["level"] = json!(level);
        }
        msg
    }

    /// Posts as the document would. A blanked or detached context has no
    /// script left to post anything.
    pub fn post(&self, data: Value) -> usize {
        if self.is_blanked() || self.is_detached() {
            return 0;
        }
        self.bus.post(self.id, data)
    }

    pub fn console(&self, level: &str, text: &str) {
        self.post(self.wire("console", Some(level), text));
    }

    pub fn error(&self, message: &str, stack: Option<&str>) {
        let mut msg = self.wire("error", None, message);
        if let Some(stack) = stack {
            msg["stack"] = json!(stack);
        }
        self.post(msg);
    }

    pub fn complete(&self) {
        self.post(self.wire("status", None, "completed"));
    }
}

impl IsolationContext for MemoryContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn load(&self, document: &str) -> Result<(), SandboxError> {
        if self.fail_load {
            return Err(SandboxError::Load("document not accessible".into()));
        }
        *self.document.lock().unwrap() = Some(document.to_string());
        Ok(())
    }

    fn blank(&self) {
        self.blanked.store(true, Ordering::SeqCst);
    }

    fn detach(&self) {
        self.blanked.store(true, Ordering::SeqCst);
        self.detached.store(true, Ordering::SeqCst);
    }
}

/// One observer callback, as seen by a test.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Seen {
    Message(MessageKind, String),
    Complete,
    Timeout,
    Error(String),
}

impl Seen {
    /// Next callback, failing the test if none arrives in time.
    pub async fn next(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
        tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("timed out waiting for an observer callback")
            .expect("recorder dropped")
    }
}

pub(crate) struct Recorder {
    tx: mpsc::UnboundedSender<Seen>,
    messages: AtomicUsize,
    completes: AtomicUsize,
    timeouts: AtomicUsize,
    errors: AtomicUsize,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Seen>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Self {
            tx,
            messages: AtomicUsize::new(0),
            completes: AtomicUsize::new(0),
            timeouts: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
        });
        (recorder, rx)
    }

    pub fn messages(&self) -> usize {
        self.messages.load(Ordering::SeqCst)
    }

    pub fn completes(&self) -> usize {
        self.completes.load(Ordering::SeqCst)
    }

    pub fn timeouts(&self) -> usize {
        self.timeouts.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.messages() + self.completes() + self.timeouts() + self.errors.load(Ordering::SeqCst)
    }
}

impl RunObserver for Recorder {
    fn on_message(&self, message: ReportedMessage) {
        self.messages.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(Seen::Message(message.kind, message.text));
    }

    fn on_complete(&self) {
        self.completes.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(Seen::Complete);
    }

    fn on_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(Seen::Timeout);
    }

    fn on_error(&self, error: &SandboxError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(Seen::Error(error.to_string()));
    }
}
