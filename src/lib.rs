//! Sandboxed execution of untrusted JavaScript.
//!
//! Scripts (HTML extractors, crawlers, their test suites) run inside a
//! separate Deno process with permissions scoped to a per-instance directory.
//! Every execution yields a stream of [`CodeExecutionMessage`]s that ends with
//! exactly one terminal status.
//!
//! ```no_run
//! use scriptbox::{Config, SandboxManager};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), scriptbox::SandboxError> {
//! let manager = SandboxManager::new("/tmp/scriptbox", Config::default())?;
//! manager.wait_for_ready().await?;
//!
//! let result = manager
//!     .execute_function_buffered(
//!         "export default (html) => html.length",
//!         vec![json!("<p>hi</p>")],
//!     )
//!     .await?;
//! assert_eq!(result.result, Some(json!(9)));
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod collector;
pub mod config;
pub mod execution;
pub mod imports;
pub mod protocol;
pub mod runtime;
pub mod sandbox;

pub use collector::{BufferedCollector, ExecutionResult, TestEvent};
pub use config::Config;
pub use execution::{ExecutionMode, ExecutionRequest, ExecutionStream};
pub use protocol::{
    CodeExecutionMessage, ErrorDetails, ExceptionPayload, ExecutionStatus, LogLevel, TestStatus,
};
pub use sandbox::{InstanceState, SandboxError, SandboxManager};
