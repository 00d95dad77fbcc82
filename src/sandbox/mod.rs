//! Sandboxed execution of untrusted playground code.
//!
//! One run flows through these layers:
//!
//! 1. `document` builds a self-contained HTML payload that installs the
//!    console capture shim (`shim`) and wraps the user code in an
//!    error-catching envelope
//! 2. `runner` attaches a fresh isolation context to a mount (`context`),
//!    loads the payload and listens on the process-wide `bus`
//! 3. messages posted by the document are decoded once (`protocol`) and
//!    relayed to a `RunObserver`, bounded by a 5s watchdog
//!
//! The security model rests on the isolation context's capability set
//! (scripts only: no same-origin, no navigation, no popups), not on
//! content filtering. Runaway code cannot be interrupted from outside,
//! so a timed-out context is blanked and discarded wholesale.

pub mod bus;
pub mod context;
pub mod document;
#[cfg(test)]
pub(crate) mod memory;
pub mod process;
pub mod protocol;
pub mod runner;
pub mod shim;

pub use bus::MessageBus;
pub use context::{Capabilities, ContextId, IsolationContext, Mount, SandboxError};
pub use protocol::{ChannelId, MessageKind, ReportedMessage};
pub use runner::{RunHandle, RunObserver, RunRequest, SandboxRunner, WATCHDOG};
