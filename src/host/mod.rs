//! Host controller, the playground side of a run.
//!
//! Keeps at most one run alive per mount, turns observer callbacks into a
//! display log and publishes the run status (Ready → Running… →
//! Completed / Error) on a watch channel for the presentation layer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::sandbox::{
    MessageBus, Mount, ReportedMessage, RunHandle, RunObserver, RunRequest, SandboxError,
    SandboxRunner,
};

pub const STARTED_MESSAGE: &str = "Execution started";
pub const COMPLETED_MESSAGE: &str = "Execution completed";
pub const TIMEOUT_MESSAGE: &str = "Execution timed out after 5s and was terminated for safety.";

/// Shown in place of an empty log.
pub const EMPTY_LOG_MESSAGE: &str = "No output yet. Run your code to see results here.";

/// Status of the current run, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Error,
}

impl RunStatus {
    pub fn label(&self) -> &'static str {
        match self {
            RunStatus::Idle => "Ready",
            RunStatus::Running => "Running…",
            RunStatus::Completed => "Completed",
            RunStatus::Error => "Error",
        }
    }

    /// The run has finished one way or another.
    pub fn is_settled(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Error)
    }
}

/// Ordered, append-only log of what the current run reported.
#[derive(Clone, Default)]
pub struct DisplayLog {
    entries: Arc<Mutex<Vec<ReportedMessage>>>,
}

impl DisplayLog {
    fn lock(&self) -> MutexGuard<'_, Vec<ReportedMessage>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, entry: ReportedMessage) {
        self.lock().push(entry);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn entries(&self) -> Vec<ReportedMessage> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// One line per entry, or the empty-log placeholder.
    pub fn render(&self, timestamps: bool) -> String {
        let entries = self.lock();
        if entries.is_empty() {
            return format!("{:<6} {EMPTY_LOG_MESSAGE}", "status");
        }
        entries
            .iter()
            .map(|entry| render_entry(entry, timestamps))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Renders an entry as `[HH:MM:SS] kind   text` (local time).
pub fn render_entry(entry: &ReportedMessage, timestamps: bool) -> String {
    let kind = entry.kind.as_str();
    let time = DateTime::parse_from_rfc3339(&entry.timestamp)
        .ok()
        .map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string());

    match time {
        Some(time) if timestamps => format!("[{time}] {kind:<6} {}", entry.text),
        _ => format!("{kind:<6} {}", entry.text),
    }
}

/// Observer for one run. Ignores callbacks once a newer run has started.
///
/// The generation check and the write happen under the log lock, the same
/// lock a new run takes to reset the log, so a late callback from a
/// replaced run either lands before the reset or not at all.
struct HostObserver {
    generation: u64,
    current_generation: Arc<AtomicU64>,
    log: DisplayLog,
    status: Arc<watch::Sender<RunStatus>>,
}

impl HostObserver {
    fn deliver(&self, entry: ReportedMessage, settled: Option<RunStatus>) {
        let mut entries = self.log.lock();
        if self.current_generation.load(Ordering::SeqCst) != self.generation {
            return;
        }
        // Log first: whoever wakes on the status sees the final entry
        entries.push(entry);
        if let Some(status) = settled {
            self.status.send_replace(status);
        }
    }
}

impl RunObserver for HostObserver {
    fn on_message(&self, message: ReportedMessage) {
        self.deliver(message, None);
    }

    fn on_complete(&self) {
        let entry = ReportedMessage::status(COMPLETED_MESSAGE);
        self.deliver(entry, Some(RunStatus::Completed));
    }

    fn on_timeout(&self) {
        let entry = ReportedMessage::error(TIMEOUT_MESSAGE);
        self.deliver(entry, Some(RunStatus::Error));
    }

    fn on_error(&self, error: &SandboxError) {
        let entry = ReportedMessage::error(error.to_string());
        self.deliver(entry, Some(RunStatus::Error));
    }
}

/// Orchestrates repeated runs against one mount.
pub struct HostController<M: Mount> {
    mount: M,
    runner: SandboxRunner,
    current: Option<RunHandle>,
    generation: Arc<AtomicU64>,
    log: DisplayLog,
    status: Arc<watch::Sender<RunStatus>>,
}

impl<M: Mount> HostController<M> {
    pub fn new(mount: M, bus: MessageBus) -> Self {
        let (status, _) = watch::channel(RunStatus::Idle);
        Self {
            mount,
            runner: SandboxRunner::new(bus),
            current: None,
            generation: Arc::new(AtomicU64::new(0)),
            log: DisplayLog::default(),
            status: Arc::new(status),
        }
    }

    /// Runs a bare script. Any previous run is retired first.
    pub fn run_code(&mut self, script: &str) {
        self.run(RunRequest::script(script));
    }

    /// Runs a script against user markup and style.
    pub fn run_preview(&mut self, markup: &str, style: &str, script: &str) {
        self.run(RunRequest::preview(markup, style, script));
    }

    fn run(&mut self, request: RunRequest) {
        self.retire();

        let generation = {
            let mut entries = self.log.lock();
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            entries.clear();
            entries.push(ReportedMessage::status(STARTED_MESSAGE));
            self.status.send_replace(RunStatus::Running);
            generation
        };

        let observer = self.observer(generation);
        let handle = self.runner.start(&self.mount, request, observer);
        info!("Run #{generation} on channel {}", handle.channel());
        self.current = Some(handle);
    }

    fn observer(&self, generation: u64) -> Arc<HostObserver> {
        Arc::new(HostObserver {
            generation,
            current_generation: Arc::clone(&self.generation),
            log: self.log.clone(),
            status: Arc::clone(&self.status),
        })
    }

    /// Cleans up the current run, if any.
    fn retire(&mut self) {
        if let Some(run) = self.current.take() {
            debug!("Retiring run on channel {}", run.channel());
            run.cleanup();
        }
    }

    /// Tears the controller down: the current run is retired and the
    /// status goes back to Ready if it was still running.
    pub fn dispose(&mut self) {
        self.retire();
        let _entries = self.log.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.status.send_if_modified(|status| {
            if *status == RunStatus::Running {
                *status = RunStatus::Idle;
                true
            } else {
                false
            }
        });
    }

    pub fn clear_output(&self) {
        self.log.clear();
    }

    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<RunStatus> {
        self.status.subscribe()
    }

    pub fn log(&self) -> &DisplayLog {
        &self.log
    }

    pub fn mount(&self) -> &M {
        &self.mount
    }
}

impl<M: Mount> Drop for HostController<M> {
    fn drop(&mut self) {
        self.retire();
    }
}
