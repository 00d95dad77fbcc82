/// Platform seams: mount points and isolation contexts.
///
/// A `Mount` is where isolation contexts live (one at a time). An
/// `IsolationContext` is a single-use, script-capable document surface:
/// load a document once, optionally blank it, then detach it.
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// Platform-assigned identity of an isolation context.
///
/// Stamped on every message the context posts. Sandboxed code cannot
/// choose it, which is what makes the source check meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0.simple())
    }
}

/// Capability set granted to an isolation context.
///
/// Anything not granted is denied. Playground runs only ever get
/// `scripts_only()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub scripts: bool,
    pub same_origin: bool,
    pub top_navigation: bool,
    pub popups: bool,
    pub forms: bool,
}

impl Capabilities {
    pub fn scripts_only() -> Self {
        Self {
            scripts: true,
            same_origin: false,
            top_navigation: false,
            popups: false,
            forms: false,
        }
    }

    /// Renders as an iframe `sandbox` attribute value (`allow-scripts`).
    pub fn sandbox_attribute(&self) -> String {
        let mut tokens = Vec::new();
        if self.scripts {
            tokens.push("allow-scripts");
        }
        if self.same_origin {
            tokens.push("allow-same-origin");
        }
        if self.top_navigation {
            tokens.push("allow-top-navigation");
        }
        if self.popups {
            tokens.push("allow-popups");
        }
        if self.forms {
            tokens.push("allow-forms");
        }
        tokens.join(" ")
    }
}

/// Setup failures reported through `RunObserver::on_error`.
#[derive(Debug)]
pub enum SandboxError {
    /// The mount point cannot host a context (missing, torn down, misconfigured).
    MountUnavailable(String),
    /// The document could not be loaded into the context.
    Load(String),
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxError::MountUnavailable(reason) => {
                write!(f, "Sandbox container not available: {reason}")
            }
            SandboxError::Load(reason) => write!(f, "Sandbox document not loaded: {reason}"),
        }
    }
}

impl std::error::Error for SandboxError {}

/// A single-use isolation context.
pub trait IsolationContext: Send + Sync {
    fn id(&self) -> ContextId;

    /// Replaces the context's content with `document` and starts it.
    fn load(&self, document: &str) -> Result<(), SandboxError>;

    /// Points the context at a blank, neutral destination, halting any
    /// script still running inside it. Idempotent.
    fn blank(&self);

    /// Removes the context from its mount and releases it. Idempotent.
    fn detach(&self);
}

/// Caller-supplied mount point for isolation contexts.
pub trait Mount: Send + Sync {
    /// Creates a fresh context with `capabilities`, first detaching any
    /// context previously attached here.
    fn attach(
        &self,
        capabilities: Capabilities,
    ) -> Result<Arc<dyn IsolationContext>, SandboxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_only_sandbox_attribute() {
        assert_eq!(Capabilities::scripts_only().sandbox_attribute(), "allow-scripts");
    }

    #[test]
    fn test_sandbox_attribute_lists_every_grant() {
        let caps = Capabilities {
            scripts: true,
            same_origin: true,
            top_navigation: true,
            popups: true,
            forms: true,
        };
        assert_eq!(
            caps.sandbox_attribute(),
            "allow-scripts allow-same-origin allow-top-navigation allow-popups allow-forms"
        );
    }

    #[test]
    fn test_context_ids_are_distinct() {
        assert_ne!(ContextId::new(), ContextId::new());
        assert!(ContextId::new().to_string().starts_with("ctx-"));
    }

    #[test]
    fn test_sandbox_error_display() {
        let err = SandboxError::MountUnavailable("no container".into());
        assert_eq!(err.to_string(), "Sandbox container not available: no container");
        let err = SandboxError::Load("broken pipe".into());
        assert_eq!(err.to_string(), "Sandbox document not loaded: broken pipe");
    }

    /// Compile-time verification that both seams are object-safe.
    #[test]
    fn test_traits_are_object_safe() {
        fn _assert_context(_: &dyn IsolationContext) {}
        fn _assert_mount(_: &dyn Mount) {}
    }
}
