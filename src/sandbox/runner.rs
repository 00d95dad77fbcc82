//! Sandbox runner: owns the lifecycle of one execution.
//!
//! ```text
//! created → awaiting-load → running → completed
//!                │                  └→ timed-out
//!                └→ errored (setup failure)
//! ```
//!
//! Every run, whatever its outcome, is retired by `RunHandle::cleanup()`,
//! which is idempotent and also runs when the handle is dropped.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::bus::{InboundMessage, Listener, MessageBus};
use super::context::{Capabilities, IsolationContext, Mount, SandboxError};
use super::document;
use super::protocol::{ChannelId, ReportedMessage, SandboxEvent};

/// Wall-clock budget of a run before it is forcibly discarded.
pub const WATCHDOG: Duration = Duration::from_millis(5000);

/// Callbacks through which a run reports back.
///
/// For every run that gets past setup, exactly one of `on_complete` /
/// `on_timeout` is called, exactly once. Setup failures call `on_error`
/// and nothing else.
///
/// Once `cleanup()` has returned no further event is delivered. A callback
/// that another worker thread had already entered may still run to its end.
pub trait RunObserver: Send + Sync {
    /// Console output or an uncaught error, delivered as it arrives.
    fn on_message(&self, message: ReportedMessage);

    fn on_complete(&self);

    fn on_timeout(&self);

    fn on_error(&self, error: &SandboxError);
}

/// Code to execute: a bare script, or markup + style + script.
#[derive(Debug, Clone, PartialEq)]
pub enum RunRequest {
    Script(String),
    Preview {
        markup: String,
        style: String,
        script: String,
    },
}

impl RunRequest {
    pub fn script(code: impl Into<String>) -> Self {
        RunRequest::Script(code.into())
    }

    pub fn preview(
        markup: impl Into<String>,
        style: impl Into<String>,
        script: impl Into<String>,
    ) -> Self {
        RunRequest::Preview {
            markup: markup.into(),
            style: style.into(),
            script: script.into(),
        }
    }

    fn document(&self, channel: &ChannelId) -> String {
        match self {
            RunRequest::Script(script) => document::script_document(script, channel),
            RunRequest::Preview {
                markup,
                style,
                script,
            } => document::preview_document(markup, style, script, channel),
        }
    }
}

/// Where a run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    AwaitingLoad,
    Running,
    Completed,
    TimedOut,
    Errored,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunPhase::Completed | RunPhase::TimedOut | RunPhase::Errored
        )
    }
}

/// Everything cleanup has to release.
struct RunResources {
    context: Arc<dyn IsolationContext>,
    listener: Listener,
    task: Option<JoinHandle<()>>,
}

struct RunState {
    phase: RunPhase,
    retired: bool,
    resources: Option<RunResources>,
}

struct RunShared {
    channel: ChannelId,
    created_at: Instant,
    state: Mutex<RunState>,
}

impl RunShared {
    fn new(channel: ChannelId) -> Self {
        Self {
            channel,
            created_at: Instant::now(),
            state: Mutex::new(RunState {
                phase: RunPhase::AwaitingLoad,
                retired: false,
                resources: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves a live run from `Running` to `to`. Only the first caller
    /// wins, which is what makes complete/timeout mutually exclusive.
    fn finish(&self, to: RunPhase) -> bool {
        let mut state = self.lock();
        if state.retired || state.phase != RunPhase::Running {
            return false;
        }
        state.phase = to;
        true
    }

    /// Output is relayed while running and after completion (callbacks
    /// scheduled by user code), never after a timeout or cleanup.
    fn relays_output(&self) -> bool {
        let state = self.lock();
        !state.retired && matches!(state.phase, RunPhase::Running | RunPhase::Completed)
    }

    fn elapsed_ms(&self) -> u128 {
        self.created_at.elapsed().as_millis()
    }
}

/// Handle to a started run. Dropping it cleans the run up.
pub struct RunHandle {
    shared: Arc<RunShared>,
}

impl RunHandle {
    pub fn channel(&self) -> &ChannelId {
        &self.shared.channel
    }

    pub fn phase(&self) -> RunPhase {
        self.shared.lock().phase
    }

    /// Cancels the watchdog, unregisters the listener, detaches the
    /// context. Safe to call any number of times, at any point.
    pub fn cleanup(&self) {
        let resources = {
            let mut state = self.shared.lock();
            state.retired = true;
            state.resources.take()
        };
        let Some(resources) = resources else {
            return;
        };

        if let Some(task) = resources.task {
            task.abort();
        }
        drop(resources.listener);
        resources.context.detach();
        debug!(
            "Run {} cleaned up after {}ms",
            self.shared.channel,
            self.shared.elapsed_ms()
        );
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Starts runs against a mount, listening on a shared bus.
///
/// Must be used from within a Tokio runtime: each run spawns a task that
/// owns its inbox and watchdog.
#[derive(Clone)]
pub struct SandboxRunner {
    bus: MessageBus,
}

impl SandboxRunner {
    pub fn new(bus: MessageBus) -> Self {
        Self { bus }
    }

    pub fn start(
        &self,
        mount: &dyn Mount,
        request: RunRequest,
        observer: Arc<dyn RunObserver>,
    ) -> RunHandle {
        let channel = ChannelId::generate();
        let shared = Arc::new(RunShared::new(channel.clone()));

        let context = match mount.attach(Capabilities::scripts_only()) {
            Ok(context) => context,
            Err(e) => return fail(shared, observer.as_ref(), e),
        };

        // Registered before loading so nothing the document posts early is missed
        let (listener, inbox) = self.bus.listen();

        let document = request.document(&channel);
        if let Err(e) = context.load(&document) {
            drop(listener);
            context.detach();
            return fail(shared, observer.as_ref(), e);
        }

        info!("Run {channel} started in {}", context.id());

        {
            let mut state = shared.lock();
            state.phase = RunPhase::Running;
            state.resources = Some(RunResources {
                context: Arc::clone(&context),
                listener,
                task: None,
            });
        }

        let deadline = tokio::time::Instant::now() + WATCHDOG;
        let task = tokio::spawn(watch_run(
            Arc::clone(&shared),
            context,
            inbox,
            observer,
            deadline,
        ));
        if let Some(resources) = shared.lock().resources.as_mut() {
            resources.task = Some(task);
        }

        RunHandle { shared }
    }
}

fn fail(shared: Arc<RunShared>, observer: &dyn RunObserver, error: SandboxError) -> RunHandle {
    shared.lock().phase = RunPhase::Errored;
    warn!("Run {} failed during setup: {error}", shared.channel);
    observer.on_error(&error);
    RunHandle { shared }
}

/// Per-run task: relays inbound events and enforces the watchdog.
/// Ends when the run times out or its listener is retired.
async fn watch_run(
    shared: Arc<RunShared>,
    context: Arc<dyn IsolationContext>,
    mut inbox: mpsc::UnboundedReceiver<InboundMessage>,
    observer: Arc<dyn RunObserver>,
    deadline: tokio::time::Instant,
) {
    let context_id = context.id();
    let watchdog = tokio::time::sleep_until(deadline);
    tokio::pin!(watchdog);
    let mut armed = true;

    loop {
        tokio::select! {
            // An event already queued wins over a deadline firing in the same tick
            biased;

            inbound = inbox.recv() => {
                let Some(inbound) = inbound else {
                    break;
                };
                if inbound.source != context_id {
                    trace!("Run {}: ignoring message from {}", shared.channel, inbound.source);
                    continue;
                }
                let Some(event) = SandboxEvent::decode(&inbound.data, &shared.channel) else {
                    trace!("Run {}: ignoring foreign or malformed message", shared.channel);
                    continue;
                };

                match event {
                    SandboxEvent::Console { level, text } => {
                        if shared.relays_output() {
                            observer.on_message(ReportedMessage::now(level.into(), text));
                        }
                    }
                    SandboxEvent::UncaughtError { message, stack } => {
                        if let Some(stack) = stack {
                            debug!("Run {}: uncaught error stack:\n{stack}", shared.channel);
                        }
                        if shared.relays_output() {
                            observer.on_message(ReportedMessage::error(message));
                        }
                    }
                    SandboxEvent::Completed => {
                        if shared.finish(RunPhase::Completed) {
                            armed = false;
                            info!("Run {} completed in {}ms", shared.channel, shared.elapsed_ms());
                            observer.on_complete();
                        }
                    }
                }
            }

            _ = &mut watchdog, if armed => {
                if shared.finish(RunPhase::TimedOut) {
                    warn!(
                        "Run {} exceeded {}ms, blanking {context_id}",
                        shared.channel,
                        WATCHDOG.as_millis()
                    );
                    context.blank();
                    observer.on_timeout();
                }
                break;
            }
        }
    }
}
