//! Farm configuration and builder

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;

use taskfarm_host::WorkerModule;

use crate::error::FarmError;
use crate::farm::Farm;

/// Derives the sticky key for a call; `None` disables affinity for it
pub type WorkerKeyFn = Arc<dyn Fn(&str, &[JsonValue]) -> Option<String> + Send + Sync>;

/// Creates one module instance per thread-mode unit (and per restart)
pub type ModuleFactory = Arc<dyn Fn() -> Box<dyn WorkerModule> + Send + Sync>;

/// Pool size used when none is configured: host parallelism minus one, so
/// the coordinator keeps a core for itself.
pub fn default_pool_size() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

/// How to spawn a process-mode worker binary
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    current_dir: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    pub(crate) fn command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// The kind of execution unit backing each worker slot
#[derive(Clone)]
pub enum ExecutionMode {
    /// Spawn a worker binary per unit; frames travel over its piped stdio
    Process(ProcessSpec),
    /// Run a module instance on a dedicated thread per unit
    Thread(ModuleFactory),
}

impl ExecutionMode {
    pub fn process(spec: ProcessSpec) -> Self {
        ExecutionMode::Process(spec)
    }

    pub fn thread<F, M>(factory: F) -> Self
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: WorkerModule,
    {
        ExecutionMode::Thread(Arc::new(move || {
            Box::new(factory()) as Box<dyn WorkerModule>
        }))
    }
}

impl std::fmt::Debug for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Process(spec) => f.debug_tuple("Process").field(spec).finish(),
            ExecutionMode::Thread(_) => f.write_str("Thread(..)"),
        }
    }
}

/// Plain configuration options for a farm
#[derive(Debug, Clone)]
pub struct FarmConfig {
    /// Pool size; the number of worker slots never changes while running
    pub workers: usize,
    /// Crash-retry budget per task
    pub max_retries: u32,
    /// Restart budget per worker slot before it is marked failed
    pub max_unit_restarts: u32,
    /// Per-call deadline; expiry is treated exactly like a unit crash
    pub call_timeout: Option<Duration>,
    /// Opaque payload delivered to the module's setup hook
    pub setup_args: JsonValue,
    /// Restrict the callable surface to these method names
    pub exposed_methods: Option<Vec<String>>,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            workers: default_pool_size(),
            max_retries: 3,
            max_unit_restarts: 3,
            call_timeout: None,
            setup_args: JsonValue::Null,
            exposed_methods: None,
        }
    }
}

/// Builder for [`Farm`]. Construction validates the configuration; an
/// unresolvable setup is rejected here rather than surfacing per-call.
pub struct FarmBuilder {
    config: FarmConfig,
    execution: Option<ExecutionMode>,
    worker_key: Option<WorkerKeyFn>,
}

impl FarmBuilder {
    pub(crate) fn new() -> Self {
        Self {
            config: FarmConfig::default(),
            execution: None,
            worker_key: None,
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn max_unit_restarts(mut self, restarts: u32) -> Self {
        self.config.max_unit_restarts = restarts;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = Some(timeout);
        self
    }

    pub fn setup_args(mut self, args: JsonValue) -> Self {
        self.config.setup_args = args;
        self
    }

    pub fn exposed_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.exposed_methods = Some(methods.into_iter().map(Into::into).collect());
        self
    }

    /// Sticky routing: calls mapping to the same key run on one worker, in
    /// submission order, for as long as that worker lives.
    pub fn compute_worker_key<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &[JsonValue]) -> Option<String> + Send + Sync + 'static,
    {
        self.worker_key = Some(Arc::new(f));
        self
    }

    pub fn execution(mut self, mode: ExecutionMode) -> Self {
        self.execution = Some(mode);
        self
    }

    pub fn build(self) -> Result<Farm, FarmError> {
        if self.config.workers == 0 {
            return Err(FarmError::Config(
                "pool size must be at least 1".to_string(),
            ));
        }
        let execution = self
            .execution
            .ok_or_else(|| FarmError::Config("no execution mode configured".to_string()))?;
        if let Some(exposed) = &self.config.exposed_methods {
            if exposed.is_empty() {
                return Err(FarmError::Config(
                    "exposed_methods must not be empty".to_string(),
                ));
            }
        }

        // Thread mode can enumerate the module's exports right now; process
        // mode defers to the Ready report at start.
        let known_methods = match &execution {
            ExecutionMode::Thread(factory) => {
                let module = factory();
                let exported: HashSet<String> =
                    module.methods().iter().map(|m| m.to_string()).collect();
                if let Some(exposed) = &self.config.exposed_methods {
                    for name in exposed {
                        if !exported.contains(name) {
                            return Err(FarmError::Config(format!(
                                "exposed method `{}` is not exported by the worker module",
                                name
                            )));
                        }
                    }
                    Some(exposed.iter().cloned().collect())
                } else {
                    Some(exported)
                }
            }
            ExecutionMode::Process(_) => None,
        };

        Ok(Farm::new(
            self.config,
            execution,
            self.worker_key,
            known_methods,
        ))
    }
}
