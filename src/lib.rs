//! Process-1 init and service supervisor for Unix systems.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binary (src/bin/main.rs)
// Test dependencies are only used in test code
#[cfg(test)]
use assert_cmd as _;
#[cfg(test)]
use predicates as _;
use strum as _;
#[cfg(test)]
use tempfile as _;
use tracing_subscriber as _;

/// Client API server and wire protocol.
pub mod api;

/// Cgroup table and reconciliation.
pub mod cgroup;

/// CLI parsing.
pub mod cli;

/// Condition store.
pub mod cond;

/// Config parsing and watching.
pub mod conf;

/// Constants.
pub mod constants;

/// Errors.
pub mod error;

/// Event loop.
pub mod event;

/// Plugin dispatcher.
pub mod plugin;

/// Built-in plugins.
pub mod plugins;

/// Runtime paths and modes.
pub mod runtime;

/// Scheduler and state machine.
pub mod sched;

/// Signal controller.
pub mod sig;

/// Child process spawning.
pub mod spawn;

/// Supervisor wiring.
pub mod supervisor;

/// Service entities and registry.
pub mod svc;

/// Test utils.
#[doc(hidden)]
pub mod test_utils;
