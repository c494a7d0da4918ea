//! Parallel task execution across isolated worker units
//!
//! A farm distributes calls to the methods of a user-supplied
//! [`WorkerModule`] over a fixed-size pool of execution units (child
//! processes or dedicated threads), each running a long-lived host. Callers
//! get a future per call; the farm handles scheduling (load-based plus
//! sticky-key affinity), the wire protocol, crash detection, bounded
//! retries and transparent unit restarts.
//!
//! ```ignore
//! let farm = Farm::builder()
//!     .workers(4)
//!     .max_retries(2)
//!     .execution(ExecutionMode::thread(|| MathModule::default()))
//!     .build()?;
//!
//! farm.start().await?;
//! assert_eq!(farm.call("add", (2, 3)).await?, serde_json::json!(5));
//! farm.end(false).await?;
//! ```
//!
//! Process-mode farms point [`ExecutionMode::process`] at a worker binary
//! whose `main` calls [`taskfarm_host::run`] with the same module type.

pub mod config;
pub mod error;
pub mod farm;
pub mod retry;

mod scheduler;
mod task;
mod worker;

// Re-export main types
pub use config::{
    default_pool_size, ExecutionMode, FarmBuilder, FarmConfig, ModuleFactory, ProcessSpec,
    WorkerKeyFn,
};
pub use error::{FarmError, RemoteError};
pub use farm::{CallRequest, Farm};
pub use retry::RestartBackoff;
pub use task::PendingCall;
pub use worker::{SlotState, WorkerStats};

// Worker-module surface, so thread-mode users need only this crate
pub use taskfarm_host::{CallContext, MethodResult, ModuleError, WorkerModule};
