//! Worker-side runtime for taskfarm
//!
//! Each execution unit in a farm runs a long-lived host around a
//! user-supplied [`WorkerModule`]. The host performs the setup handshake,
//! reports the module's callable surface, then serves one call at a time
//! until it is told to shut down. Process-mode worker binaries call
//! [`run`] (or [`worker_main`] under their own runtime) from `main`:
//!
//! ```ignore
//! fn main() -> std::process::ExitCode {
//!     taskfarm_host::run(MyModule::default())
//! }
//! ```

pub mod host;
pub mod module;

pub use host::{worker_main, HostError, WorkerHost};
pub use module::{CallContext, MethodResult, ModuleError, WorkerModule};

/// Run a worker module over stdio under a freshly built runtime, returning
/// the process exit code. Abnormal host termination (setup failure, module
/// panic, broken pipe) exits non-zero so the coordinator sees a crash.
pub fn run<M: WorkerModule>(module: M) -> std::process::ExitCode {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("worker host: failed to build runtime: {}", e);
            return std::process::ExitCode::FAILURE;
        }
    };

    match runtime.block_on(worker_main(module)) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("worker host: {}", e);
            std::process::ExitCode::FAILURE
        }
    }
}
