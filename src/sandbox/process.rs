/// Process-backed isolation contexts.
///
/// Each context is a renderer child process (for example a headless DOM
/// host such as `renderer/jsdom-host.js`). Protocol with the renderer:
///
/// - the document is written to its stdin, then stdin is closed
/// - every stdout line holding a JSON object is a message the document
///   posted to its parent; it is published on the bus under this
///   context's id
/// - any other stdout line, and everything on stderr, is diagnostics
/// - `PLAYGROUND_SANDBOX` holds the capability set (`allow-scripts`)
///
/// Blanking a context kills its renderer; there is nothing finer-grained
/// to stop a runaway script with.
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::bus::MessageBus;
use super::context::{Capabilities, ContextId, IsolationContext, Mount, SandboxError};
use crate::config::RendererConfig;

/// Environment variable carrying the capability set to the renderer.
pub const SANDBOX_ENV: &str = "PLAYGROUND_SANDBOX";

/// Mount point that hosts one renderer-backed context at a time.
pub struct ProcessMount {
    renderer: RendererConfig,
    bus: MessageBus,
    current: Mutex<Option<Arc<ProcessContext>>>,
}

impl ProcessMount {
    pub fn new(renderer: RendererConfig, bus: MessageBus) -> Self {
        Self {
            renderer,
            bus,
            current: Mutex::new(None),
        }
    }

    /// Context currently attached here, if any.
    pub fn current(&self) -> Option<Arc<ProcessContext>> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<ProcessContext>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Mount for ProcessMount {
    fn attach(
        &self,
        capabilities: Capabilities,
    ) -> Result<Arc<dyn IsolationContext>, SandboxError> {
        if self.renderer.command.trim().is_empty() {
            return Err(SandboxError::MountUnavailable(
                "no renderer command configured".into(),
            ));
        }

        let mut current = self.lock();
        if let Some(previous) = current.take() {
            debug!("Removing previous context {}", previous.id());
            previous.detach();
        }

        let context = Arc::new(ProcessContext::new(
            self.renderer.clone(),
            capabilities,
            self.bus.clone(),
        ));
        *current = Some(Arc::clone(&context));
        Ok(context)
    }
}

impl Drop for ProcessMount {
    fn drop(&mut self) {
        if let Some(context) = self.lock().take() {
            context.detach();
        }
    }
}

/// A running renderer and the tasks pumping its pipes.
struct RendererProcess {
    child: Child,
    io: Vec<JoinHandle<()>>,
}

impl RendererProcess {
    fn halt(mut self) {
        for task in &self.io {
            task.abort();
        }
        // Already exited is fine
        let _ = self.child.start_kill();
    }
}

pub struct ProcessContext {
    id: ContextId,
    renderer: RendererConfig,
    capabilities: Capabilities,
    bus: MessageBus,
    process: Mutex<Option<RendererProcess>>,
    loaded: AtomicBool,
    detached: AtomicBool,
}

impl ProcessContext {
    fn new(renderer: RendererConfig, capabilities: Capabilities, bus: MessageBus) -> Self {
        Self {
            id: ContextId::new(),
            renderer,
            capabilities,
            bus,
            process: Mutex::new(None),
            loaded: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        }
    }

    /// True while a renderer is live in this context.
    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Option<RendererProcess>> {
        self.process.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn(&self, document: &str) -> Result<RendererProcess, SandboxError> {
        let mut child = Command::new(&self.renderer.command)
            .args(&self.renderer.args)
            .env(SANDBOX_ENV, self.capabilities.sandbox_attribute())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SandboxError::Load(format!(
                    "cannot start renderer `{}`: {e}",
                    self.renderer.command_line()
                ))
            })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            return Err(SandboxError::Load("renderer pipes unavailable".into()));
        };

        let io = vec![
            tokio::spawn(write_document(stdin, document.to_string(), self.id)),
            tokio::spawn(relay_messages(stdout, self.id, self.bus.clone())),
            tokio::spawn(relay_diagnostics(stderr, self.id)),
        ];
        Ok(RendererProcess { child, io })
    }
}

impl IsolationContext for ProcessContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn load(&self, document: &str) -> Result<(), SandboxError> {
        if self.is_detached() {
            return Err(SandboxError::Load("context was detached".into()));
        }
        if self.loaded.swap(true, Ordering::SeqCst) {
            return Err(SandboxError::Load("context already used".into()));
        }

        let process = self.spawn(document)?;
        debug!(
            "{} loaded into renderer `{}` (pid {:?})",
            self.id,
            self.renderer.command_line(),
            process.child.id()
        );
        *self.lock() = Some(process);
        Ok(())
    }

    fn blank(&self) {
        if let Some(process) = self.lock().take() {
            debug!("Blanking {}", self.id);
            process.halt();
        }
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
        self.blank();
    }
}

async fn write_document(mut stdin: ChildStdin, document: String, id: ContextId) {
    if let Err(e) = stdin.write_all(document.as_bytes()).await {
        debug!("{id}: renderer stopped reading the document: {e}");
        return;
    }
    if let Err(e) = stdin.shutdown().await {
        debug!("{id}: closing renderer stdin: {e}");
    }
}

async fn relay_messages(stdout: ChildStdout, id: ContextId, bus: MessageBus) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match serde_json::from_str::<Value>(&line) {
                Ok(data) if data.is_object() => {
                    bus.post(id, data);
                }
                _ => trace!("{id} renderer: {line}"),
            },
            Ok(None) => {
                debug!("{id}: renderer closed its output");
                break;
            }
            Err(e) => {
                debug!("{id}: renderer output unreadable: {e}");
                break;
            }
        }
    }
}

async fn relay_diagnostics(stderr: ChildStderr, id: ContextId) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("{id} renderer stderr: {line}");
    }
}
