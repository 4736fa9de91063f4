//! Process-isolated script execution.
//!
//! A [`SandboxManager`] owns a pool of runtime processes, each driven by a
//! supervisor task through the [`InstanceState`] machine. Scripts never run
//! in the host process.

mod error;
mod instance;
mod launcher;
mod manager;
#[cfg(test)]
pub(crate) mod mock;
mod queue;
mod state;
mod workspace;

pub use error::SandboxError;
pub use instance::{crash_reason, shutdown_reason, timeout_reason, unavailable_reason, SlotStatus};
pub use launcher::{
    probe_runtime, DenoLauncher, ProcessHandle, RuntimeLauncher, RuntimeOutput, RuntimeProcess,
    RuntimeStdin,
};
pub use manager::SandboxManager;
pub use state::{InstanceEvent, InstanceState, InvalidTransition, RestartPolicy};
pub use workspace::{InstanceWorkspace, SANDBOX_DIR};
