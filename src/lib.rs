//! Sandboxed code playground runtime.
//!
//! `sandbox` runs untrusted JavaScript in single-use isolation contexts and
//! reports console output, uncaught errors and completion back over a
//! per-run channel. `host` drives repeated runs and keeps the display log.
//! The `sandbox-playground` binary is a terminal front end over both.

pub mod config;
pub mod host;
pub mod sandbox;
