//! One event in, one decision out.
//!
//! ```text
//! Event ─► housekeeping ─► hook_enter
//!          └─► middleware[0] ─► ... ─► middleware[n] ─► reduction ─┐
//!                                                                  │
//!   reduction: for each matched binding, in registration order     │
//!     guard false      → skip                                      │
//!     guard error      → error event, remember, continue           │
//!     handler Ok(Pass) → commit, continue                          │
//!     handler Ok(d)    → commit, decision event, stop with d       │
//!     handler Err/panic→ rollback, error event, stop with Deny     │
//!   a remembered guard error turns Allow/Passthrough into Deny     │
//!                                                                  ▼
//!          finalize tasks (launch worker if needed) ─► hook_exit ─► Decision
//! ```
//!
//! State saves and task schedules made by a handler are written only after
//! that handler returns normally.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use ulid::Ulid;

use crate::context::{Context, Emitter};
use crate::decision::{deny, Decision, GUARD_FAILURE_REASON, HANDLER_FAILURE_REASON};
use crate::deps;
use crate::error::{HookError, Result};
use crate::event::Event;
use crate::guard;
use crate::middleware::{Endpoint, Middleware, Next};
use crate::observe::{ObservabilityKind, ObservabilitySink};
use crate::registry::{Binding, Registry};
use crate::state::{State, StateStore};
use crate::tasks::TaskManager;
use crate::transcript::Transcript;

pub struct Dispatcher<'a> {
    registry: &'a Registry,
    middleware: &'a [Arc<dyn Middleware>],
    states: StateStore,
    tasks: TaskManager,
    sink: Arc<dyn ObservabilitySink>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        registry: &'a Registry,
        middleware: &'a [Arc<dyn Middleware>],
        states: StateStore,
        tasks: TaskManager,
        sink: Arc<dyn ObservabilitySink>,
    ) -> Self {
        Dispatcher {
            registry,
            middleware,
            states,
            tasks,
            sink,
        }
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    fn context(&self, event: Arc<Event>, request_id: &str) -> Context {
        let session_id = event.session_id.clone();
        Context {
            transcript: Arc::new(Transcript::new(
                &session_id,
                &event.cwd,
                event.transcript_path.as_deref(),
            )),
            state: State::new(session_id.clone(), self.states.clone()),
            tasks: self.tasks.handle(&session_id),
            emitter: Emitter::new(
                Arc::clone(&self.sink),
                &session_id,
                request_id,
                &event.hook_name(),
            ),
            event,
        }
    }

    pub async fn dispatch(&self, event: Event) -> Decision {
        let started = Instant::now();
        let event = Arc::new(event);
        let request_id = Ulid::new().to_string();
        let hook_name = event.hook_name();
        let session_id = event.session_id.clone();

        self.tasks.housekeeping(&session_id);

        let ctx = self.context(Arc::clone(&event), &request_id);
        let mut enter = ctx.emitter.record(ObservabilityKind::HookEnter);
        enter
            .payload
            .insert("event".to_string(), Value::from(event.kind.as_str()));
        if let Some(tool) = &event.tool_name {
            enter
                .payload
                .insert("tool_name".to_string(), Value::from(tool.as_str()));
        }
        ctx.emitter.emit(enter);

        let bindings = self.registry.match_event(&event);
        tracing::debug!(
            session = %session_id,
            hook = %hook_name,
            matched = bindings.len(),
            "Dispatching event"
        );

        let reduction = Reduction {
            bindings,
            ctx: &ctx,
        };
        let chain = Next::new(&event, self.middleware, &reduction).run();
        let decision = match AssertUnwindSafe(chain).catch_unwind().await {
            Ok(decision) => decision,
            Err(panic) => {
                let err = HookError::Handler {
                    binding: "middleware".to_string(),
                    message: panic_message(panic),
                };
                tracing::error!(session = %session_id, error = %err, "Middleware panicked");
                ctx.emitter.emit(
                    ctx.emitter
                        .record(ObservabilityKind::Error)
                        .with_error(err.kind(), &err.to_string()),
                );
                deny(HANDLER_FAILURE_REASON)
            }
        };

        match self.tasks.finalize(&session_id) {
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "Failed to start task worker")
            }
        }

        let mut exit = ctx
            .emitter
            .record(ObservabilityKind::HookExit)
            .with_decision(&decision);
        exit.duration_ms = Some(started.elapsed().as_secs_f64() * 1000.0);
        ctx.emitter.emit(exit);

        tracing::info!(
            session = %session_id,
            hook = %hook_name,
            decision = decision.label(),
            "Dispatch finished"
        );
        decision
    }
}

struct Reduction<'d> {
    bindings: Vec<&'d Binding>,
    ctx: &'d Context,
}

impl Endpoint for Reduction<'_> {
    fn call<'a>(&'a self, _event: &'a Event) -> BoxFuture<'a, Decision> {
        Box::pin(self.reduce())
    }
}

impl Reduction<'_> {
    async fn reduce(&self) -> Decision {
        let ctx = self.ctx;
        let mut guard_failed = false;
        let mut outcome = Decision::Passthrough;

        for binding in &self.bindings {
            match guard::evaluate(binding.guard.as_ref(), &ctx.event, &binding.name).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::trace!(binding = %binding.name, "Guard declined");
                    continue;
                }
                Err(err) => {
                    tracing::warn!(binding = %binding.name, error = %err, "Guard failed");
                    self.report_error(binding, &err);
                    guard_failed = true;
                    continue;
                }
            }

            match self.invoke(binding).await {
                Ok(decision) if decision.is_passthrough() => {}
                Ok(decision) => {
                    ctx.emitter.emit(
                        ctx.emitter
                            .record(ObservabilityKind::Decision)
                            .with_binding(&binding.name)
                            .with_decision(&decision),
                    );
                    outcome = decision;
                    break;
                }
                Err(err) => {
                    tracing::error!(binding = %binding.name, error = %err, "Handler failed");
                    self.report_error(binding, &err);
                    return deny(HANDLER_FAILURE_REASON);
                }
            }
        }

        if guard_failed && !outcome.is_restrictive() {
            return deny(GUARD_FAILURE_REASON);
        }
        outcome
    }

    async fn invoke(&self, binding: &Binding) -> Result<Decision> {
        let ctx = self.ctx;
        let deps = deps::resolve(&binding.params, ctx);

        let message = match AssertUnwindSafe((binding.handler)(deps))
            .catch_unwind()
            .await
        {
            Ok(Ok(decision)) => match commit(ctx) {
                Ok(()) => return Ok(decision),
                Err(e) => format!("failed to persist handler changes: {}", e),
            },
            Ok(Err(e)) => format!("{:#}", e),
            Err(panic) => panic_message(panic),
        };

        ctx.state.rollback();
        ctx.tasks.rollback();
        Err(HookError::Handler {
            binding: binding.name.clone(),
            message,
        })
    }

    fn report_error(&self, binding: &Binding, err: &HookError) {
        let message = match err {
            HookError::GuardEvaluation { message, .. } | HookError::Handler { message, .. } => {
                message.clone()
            }
            other => other.to_string(),
        };
        self.ctx.emitter.emit(
            self.ctx
                .emitter
                .record(ObservabilityKind::Error)
                .with_binding(&binding.name)
                .with_error(err.kind(), &message),
        );
    }
}

/// Task descriptors first, so a saved state never names a task that was not written.
fn commit(ctx: &Context) -> Result<()> {
    ctx.tasks.commit()?;
    ctx.state.commit()?;
    Ok(())
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{allow, block};
    use crate::event::parse;
    use crate::guard::Guard;
    use crate::observe::MemorySink;
    use crate::tasks::{RecordingLauncher, TaskStore};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _temp: TempDir,
        states: StateStore,
        store: TaskStore,
        sink: Arc<MemorySink>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempdir().unwrap();
            Fixture {
                states: StateStore::new(temp.path().join("sessions")),
                store: TaskStore::new(temp.path().join("tasks")),
                sink: Arc::new(MemorySink::new()),
                _temp: temp,
            }
        }

        fn dispatcher<'a>(
            &self,
            registry: &'a Registry,
            middleware: &'a [Arc<dyn Middleware>],
        ) -> Dispatcher<'a> {
            let tasks = TaskManager::new(
                self.store.clone(),
                Arc::new(RecordingLauncher::new()),
                Duration::from_secs(60),
                ["noop".to_string()],
            );
            Dispatcher::new(
                registry,
                middleware,
                self.states.clone(),
                tasks,
                Arc::clone(&self.sink) as Arc<dyn ObservabilitySink>,
            )
        }
    }

    fn bash(command: &str) -> Event {
        let raw = serde_json::json!({
            "hook_event_name": "PreToolUse",
            "session_id": "s1",
            "cwd": "/tmp",
            "transcript_path": "/nonexistent/t.jsonl",
            "tool_name": "Bash",
            "tool_input": {"command": command}
        });
        parse(raw.to_string().as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn test_first_non_passthrough_wins() {
        let fx = Fixture::new();
        let mut reg = Registry::new();
        reg.pre_tool([] as [&str; 0])
            .handle_sync(|_| Ok(Decision::Passthrough))
            .unwrap();
        reg.pre_tool(["Bash"]).handle_sync(|_| Ok(block("stop"))).unwrap();
        reg.pre_tool(["Bash"]).handle_sync(|_| Ok(allow())).unwrap();

        let decision = fx.dispatcher(&reg, &[]).dispatch(bash("ls")).await;
        assert_eq!(decision, block("stop"));
        assert_eq!(fx.sink.count(ObservabilityKind::Decision), 1);
        assert_eq!(fx.sink.count(ObservabilityKind::HookEnter), 1);
        assert_eq!(fx.sink.count(ObservabilityKind::HookExit), 1);
    }

    #[tokio::test]
    async fn test_guard_error_fails_closed_but_keeps_dispatching() {
        let fx = Fixture::new();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut reg = Registry::new();
        reg.pre_tool(["Bash"])
            .named("broken")
            .guard(Guard::sync(|_| Err(anyhow::anyhow!("lookup failed"))))
            .handle_sync(|_| Ok(allow()))
            .unwrap();
        let seen = Arc::clone(&ran);
        reg.pre_tool(["Bash"])
            .named("later")
            .handle_sync(move |_| {
                seen.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(allow())
            })
            .unwrap();

        let decision = fx.dispatcher(&reg, &[]).dispatch(bash("ls")).await;
        assert_eq!(decision, deny(GUARD_FAILURE_REASON));
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));

        let errors: Vec<_> = fx
            .sink
            .events()
            .into_iter()
            .filter(|e| e.event_type == ObservabilityKind::Error)
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].binding.as_deref(), Some("broken"));
        assert_eq!(errors[0].error_type.as_deref(), Some("GuardEvaluationError"));
        assert_eq!(errors[0].error_message.as_deref(), Some("lookup failed"));
    }

    #[tokio::test]
    async fn test_guard_error_keeps_a_later_deny() {
        let fx = Fixture::new();
        let mut reg = Registry::new();
        reg.pre_tool(["Bash"])
            .guard(Guard::from_fn(|_| panic!("oops")))
            .handle_sync(|_| Ok(allow()))
            .unwrap();
        reg.pre_tool(["Bash"])
            .handle_sync(|_| Ok(deny("specific reason")))
            .unwrap();

        let decision = fx.dispatcher(&reg, &[]).dispatch(bash("ls")).await;
        assert_eq!(decision, deny("specific reason"));
    }

    #[tokio::test]
    async fn test_failed_handler_changes_are_rolled_back() {
        let fx = Fixture::new();
        let mut reg = Registry::new();
        reg.pre_tool(["Bash"])
            .named("kept")
            .inject(["state"])
            .handle_sync(|deps| {
                let state = deps.state().ok_or_else(|| anyhow::anyhow!("no state"))?;
                state.set("seen", 1)?;
                state.save();
                Ok(Decision::Passthrough)
            })
            .unwrap();
        reg.pre_tool(["Bash"])
            .named("broken")
            .inject(["state", "tasks"])
            .handle_sync(|deps| {
                let state = deps.state().ok_or_else(|| anyhow::anyhow!("no state"))?;
                state.set("poisoned", true)?;
                state.save();
                deps.tasks()
                    .ok_or_else(|| anyhow::anyhow!("no tasks"))?
                    .schedule("noop", Value::Null)?;
                anyhow::bail!("database unreachable")
            })
            .unwrap();

        let decision = fx.dispatcher(&reg, &[]).dispatch(bash("ls")).await;
        assert_eq!(decision, deny(HANDLER_FAILURE_REASON));

        let stored = fx.states.load("s1").unwrap();
        assert_eq!(stored.get("seen"), Some(&Value::from(1)));
        assert!(!stored.contains_key("poisoned"));
        assert!(fx.store.list("s1").unwrap().is_empty());
        assert_eq!(fx.sink.count(ObservabilityKind::Error), 1);
        assert_eq!(fx.sink.count(ObservabilityKind::Decision), 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_denies() {
        let fx = Fixture::new();
        let mut reg = Registry::new();
        reg.pre_tool(["Bash"])
            .handle_sync(|_| -> anyhow::Result<Decision> { panic!("index out of bounds") })
            .unwrap();

        let decision = fx.dispatcher(&reg, &[]).dispatch(bash("ls")).await;
        assert_eq!(decision, deny(HANDLER_FAILURE_REASON));
        let events = fx.sink.events();
        let error = events
            .iter()
            .find(|e| e.event_type == ObservabilityKind::Error)
            .unwrap();
        assert_eq!(error.error_type.as_deref(), Some("HandlerError"));
        assert!(error
            .error_message
            .as_deref()
            .unwrap()
            .contains("index out of bounds"));
    }

    #[tokio::test]
    async fn test_records_share_request_id() {
        let fx = Fixture::new();
        let mut reg = Registry::new();
        reg.pre_tool(["Bash"])
            .handle_sync(|deps| {
                deps.emit("checked", serde_json::Map::new());
                Ok(deny("no"))
            })
            .unwrap();

        fx.dispatcher(&reg, &[]).dispatch(bash("ls")).await;
        let events = fx.sink.events();
        assert_eq!(events.len(), 4);
        assert!(events.iter().all(|e| e.request_id == events[0].request_id));
        assert!(events.iter().all(|e| e.hook_name == "pre_tool:Bash"));
        assert_eq!(events[1].custom_event_type.as_deref(), Some("checked"));
        assert!(events[3].duration_ms.is_some());
        assert_eq!(events[3].decision.as_deref(), Some("deny"));
    }
}
