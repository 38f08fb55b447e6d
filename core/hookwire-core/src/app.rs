//! [`HookApp`] bundles everything a hook binary registers: bindings,
//! middleware and background work, plus the [`EngineConfig`] they run under.

use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::decision::Decision;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::event::{self, Event, EventKind};
use crate::middleware::Middleware;
use crate::observe::{JsonlSink, NullSink, ObservabilitySink};
use crate::registry::{BindingBuilder, Blueprint, Registry};
use crate::state::StateStore;
use crate::tasks::{
    run_worker, ProcessLauncher, TaskManager, TaskStore, WorkRegistry, WorkerLauncher,
    WorkerReport,
};

pub struct HookApp {
    config: EngineConfig,
    registry: Registry,
    middleware: Vec<Arc<dyn Middleware>>,
    works: WorkRegistry,
    sink: Option<Arc<dyn ObservabilitySink>>,
    launcher: Option<Arc<dyn WorkerLauncher>>,
}

impl HookApp {
    pub fn new(config: EngineConfig) -> Self {
        HookApp {
            config,
            registry: Registry::new(),
            middleware: Vec::new(),
            works: WorkRegistry::new(),
            sink: None,
            launcher: None,
        }
    }

    /// Config from defaults, `config.json` and environment.
    pub fn from_env() -> Self {
        HookApp::new(EngineConfig::load())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn works(&self) -> &WorkRegistry {
        &self.works
    }

    /// Points state and task storage elsewhere; the worker process uses this
    /// to follow the directory its parent was configured with.
    pub fn set_state_dir(&mut self, dir: impl Into<PathBuf>) {
        self.config.state_dir = dir.into();
    }

    pub fn with_sink(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn pre_tool<I, S>(&mut self, tools: I) -> BindingBuilder<'_>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.registry.pre_tool(tools)
    }

    pub fn post_tool<I, S>(&mut self, tools: I) -> BindingBuilder<'_>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.registry.post_tool(tools)
    }

    pub fn on(&mut self, kind: EventKind) -> BindingBuilder<'_> {
        self.registry.on(kind)
    }

    pub fn include(&mut self, blueprint: Blueprint) -> Result<()> {
        let (name, registry) = blueprint.into_parts();
        self.registry.merge(registry, &name)
    }

    /// Appends a middleware; the first one added is outermost.
    pub fn middleware<M: Middleware + 'static>(&mut self, middleware: M) -> &mut Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Registers background work addressable by `name` from `tasks.schedule`.
    pub fn work<F, Fut>(&mut self, name: &str, work: F) -> Result<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.works.register(name, work)
    }

    fn task_store(&self) -> TaskStore {
        TaskStore::new(self.config.tasks_dir())
    }

    fn sink(&self) -> Arc<dyn ObservabilitySink> {
        match &self.sink {
            Some(sink) => Arc::clone(sink),
            None if self.config.observability => Arc::new(JsonlSink::new(&self.config.log_dir)),
            None => Arc::new(NullSink),
        }
    }

    fn launcher(&self) -> Arc<dyn WorkerLauncher> {
        match &self.launcher {
            Some(launcher) => Arc::clone(launcher),
            None => Arc::new(ProcessLauncher::new(
                self.config.worker_program.clone(),
                self.config.state_dir.clone(),
                self.task_store(),
            )),
        }
    }

    pub fn dispatcher(&self) -> Dispatcher<'_> {
        let tasks = TaskManager::new(
            self.task_store(),
            self.launcher(),
            self.config.task_ttl,
            self.works.names().map(str::to_string),
        );
        Dispatcher::new(
            &self.registry,
            &self.middleware,
            StateStore::new(self.config.sessions_dir()),
            tasks,
            self.sink(),
        )
    }

    pub async fn dispatch(&self, event: Event) -> Decision {
        self.dispatcher().dispatch(event).await
    }

    /// Parses and dispatches one raw payload. A malformed payload is returned
    /// as an error before any handler runs.
    pub async fn dispatch_bytes(&self, raw: &[u8]) -> Result<Decision> {
        let event = event::parse(raw)?;
        Ok(self.dispatch(event).await)
    }

    /// Drains the session's pending tasks in this process.
    pub async fn run_worker(&self, session_id: &str) -> Result<WorkerReport> {
        run_worker(&self.task_store(), &self.works, session_id).await
    }
}

impl std::fmt::Debug for HookApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookApp")
            .field("config", &self.config)
            .field("bindings", &self.registry.len())
            .field("middleware", &self.middleware.len())
            .field("works", &self.works)
            .finish()
    }
}
