//! End-to-end dispatch behavior through `HookApp`.

use hookwire_core::decision::HANDLER_FAILURE_REASON;
use hookwire_core::tasks::RecordingLauncher;
use hookwire_core::{
    allow, deny, BoxFuture, Decision, EngineConfig, Event, EventKind, HookApp, HookError,
    MemorySink, Middleware, Next, ObservabilityKind, ObservabilitySink, StateStore,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};

struct Harness {
    temp: TempDir,
    sink: Arc<MemorySink>,
    app: HookApp,
}

impl Harness {
    fn new() -> Self {
        let temp = tempdir().unwrap();
        let sink = Arc::new(MemorySink::new());
        let app = HookApp::new(EngineConfig::with_home(temp.path()))
            .with_sink(Arc::clone(&sink) as Arc<dyn ObservabilitySink>)
            .with_launcher(Arc::new(RecordingLauncher::new()));
        Harness { temp, sink, app }
    }

    async fn send(&self, payload: Value) -> Decision {
        self.app
            .dispatch_bytes(payload.to_string().as_bytes())
            .await
            .unwrap()
    }
}

fn pre_bash(command: &str) -> Value {
    json!({
        "hook_event_name": "PreToolUse",
        "session_id": "session-1",
        "cwd": "/work",
        "transcript_path": "/nonexistent/session-1.jsonl",
        "tool_name": "Bash",
        "tool_input": {"command": command}
    })
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

#[tokio::test]
async fn test_specific_deny_suppresses_wildcard_allow() {
    let mut h = Harness::new();
    let wildcard_calls = counter();

    h.app
        .pre_tool(["Bash"])
        .handle_sync(|_| Ok(deny("x")))
        .unwrap();
    let calls = Arc::clone(&wildcard_calls);
    h.app
        .pre_tool([] as [&str; 0])
        .handle_sync(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(allow())
        })
        .unwrap();

    assert_eq!(h.send(pre_bash("ls")).await, deny("x"));
    assert_eq!(wildcard_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_specific_and_wildcard_both_run_in_order() {
    let mut h = Harness::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    let seen = Arc::clone(&order);
    h.app
        .pre_tool(["Bash"])
        .handle_sync(move |_| {
            seen.lock().unwrap().push("specific");
            Ok(Decision::Passthrough)
        })
        .unwrap();
    let seen = Arc::clone(&order);
    h.app
        .pre_tool([] as [&str; 0])
        .handle_sync(move |_| {
            seen.lock().unwrap().push("wildcard");
            Ok(Decision::Passthrough)
        })
        .unwrap();

    assert_eq!(h.send(pre_bash("ls")).await, Decision::Passthrough);
    assert_eq!(*order.lock().unwrap(), vec!["specific", "wildcard"]);
}

#[tokio::test]
async fn test_no_matching_binding_is_passthrough() {
    let mut h = Harness::new();
    h.app
        .pre_tool(["Write"])
        .handle_sync(|_| Ok(deny("never")))
        .unwrap();

    assert_eq!(h.send(pre_bash("ls")).await, Decision::Passthrough);
    assert_eq!(h.sink.count(ObservabilityKind::Decision), 0);
    assert_eq!(h.sink.count(ObservabilityKind::HookEnter), 1);
    assert_eq!(h.sink.count(ObservabilityKind::HookExit), 1);
}

#[tokio::test]
async fn test_guard_false_is_like_no_binding() {
    let mut h = Harness::new();
    let calls = counter();

    let c = Arc::clone(&calls);
    h.app
        .pre_tool(["Bash"])
        .inject(["state"])
        .when(|e| e.command() == Some("rm -rf /"))
        .handle_sync(move |deps| {
            c.fetch_add(1, Ordering::SeqCst);
            let state = deps.state().ok_or_else(|| anyhow::anyhow!("no state"))?;
            state.set("touched", true)?;
            state.save();
            Ok(deny("no"))
        })
        .unwrap();

    assert_eq!(h.send(pre_bash("ls")).await, Decision::Passthrough);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.sink.count(ObservabilityKind::Decision), 0);
    assert_eq!(h.sink.count(ObservabilityKind::Error), 0);
    let store = StateStore::new(h.app.config().sessions_dir());
    assert!(store.load("session-1").unwrap().is_empty());
}

#[tokio::test]
async fn test_handler_error_denies_with_one_error_event() {
    let mut h = Harness::new();
    h.app
        .pre_tool(["Bash"])
        .named("flaky")
        .handle(|_| async { Err::<Decision, _>(anyhow::anyhow!("upstream timed out")) })
        .unwrap();
    let later = counter();
    let c = Arc::clone(&later);
    h.app
        .pre_tool(["Bash"])
        .handle_sync(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(allow())
        })
        .unwrap();

    let decision = h.send(pre_bash("ls")).await;
    assert_eq!(decision, deny(HANDLER_FAILURE_REASON));
    assert_eq!(later.load(Ordering::SeqCst), 0);

    let events = h.sink.events();
    let errors: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == ObservabilityKind::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].binding.as_deref(), Some("flaky"));
    assert_eq!(errors[0].error_type.as_deref(), Some("HandlerError"));
    assert!(events
        .iter()
        .all(|e| e.event_type != ObservabilityKind::Decision));
}

struct Trace {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl Middleware for Trace {
    fn handle<'a>(&'a self, _event: &'a Event, next: Next<'a>) -> BoxFuture<'a, Decision> {
        Box::pin(async move {
            self.log.lock().unwrap().push(format!("{}-enter", self.name));
            let decision = next.run().await;
            self.log.lock().unwrap().push(format!("{}-exit", self.name));
            decision
        })
    }
}

#[tokio::test]
async fn test_middleware_wraps_reduction_once() {
    let mut h = Harness::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    h.app
        .middleware(Trace {
            name: "A",
            log: Arc::clone(&log),
        })
        .middleware(Trace {
            name: "B",
            log: Arc::clone(&log),
        });
    for _ in 0..2 {
        let l = Arc::clone(&log);
        h.app
            .pre_tool(["Bash"])
            .handle_sync(move |_| {
                l.lock().unwrap().push("handler".to_string());
                Ok(Decision::Passthrough)
            })
            .unwrap();
    }

    h.send(pre_bash("ls")).await;
    assert_eq!(
        *log.lock().unwrap(),
        vec!["A-enter", "B-enter", "handler", "handler", "B-exit", "A-exit"]
    );
}

struct Maintenance;

impl Middleware for Maintenance {
    fn handle<'a>(&'a self, event: &'a Event, next: Next<'a>) -> BoxFuture<'a, Decision> {
        Box::pin(async move {
            if event.kind == EventKind::PreToolUse {
                return deny("maintenance");
            }
            next.run().await
        })
    }
}

#[tokio::test]
async fn test_middleware_short_circuit_runs_no_handler() {
    let mut h = Harness::new();
    let calls = counter();
    h.app.middleware(Maintenance);
    let c = Arc::clone(&calls);
    h.app
        .pre_tool(["Bash"])
        .handle_sync(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(allow())
        })
        .unwrap();

    assert_eq!(h.send(pre_bash("ls")).await, deny("maintenance"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_state_persists_only_after_save() {
    let mut h = Harness::new();
    h.app
        .pre_tool(["Bash"])
        .inject(["state", "event"])
        .handle_sync(|deps| {
            let state = deps.state().ok_or_else(|| anyhow::anyhow!("no state"))?;
            state.set("k", 1)?;
            if deps.event().and_then(|e| e.command()) == Some("save") {
                state.save();
            }
            Ok(Decision::Passthrough)
        })
        .unwrap();

    let store = StateStore::new(h.app.config().sessions_dir());

    h.send(pre_bash("no-save")).await;
    assert!(store.load("session-1").unwrap().is_empty());

    h.send(pre_bash("save")).await;
    assert_eq!(store.load("session-1").unwrap().get("k"), Some(&json!(1)));
}

#[tokio::test]
async fn test_transcript_is_shared_and_lazy() {
    let mut h = Harness::new();
    let addresses = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..2 {
        let seen = Arc::clone(&addresses);
        h.app
            .on(EventKind::Stop)
            .inject(["transcript"])
            .handle_sync(move |deps| {
                let transcript = deps
                    .transcript()
                    .ok_or_else(|| anyhow::anyhow!("no transcript"))?;
                seen.lock()
                    .unwrap()
                    .push((transcript as *const _ as usize, transcript.is_loaded()));
                Ok(Decision::Passthrough)
            })
            .unwrap();
    }

    let transcript = h.temp.path().join("t.jsonl");
    h.send(json!({
        "hook_event_name": "Stop",
        "session_id": "session-1",
        "cwd": "/work",
        "transcript_path": transcript.to_str().unwrap()
    }))
    .await;

    let seen = addresses.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0, seen[1].0);
    assert!(!seen[0].1 && !seen[1].1);
}

#[test]
fn test_unknown_parameter_fails_at_registration() {
    let mut h = Harness::new();
    let err = h
        .app
        .on(EventKind::SessionStart)
        .inject(["event", "settings"])
        .handle_sync(|_| Ok(Decision::Passthrough))
        .unwrap_err();
    assert!(matches!(err, HookError::Configuration(_)));
    assert!(h.app.registry().is_empty());
}

#[tokio::test]
async fn test_observability_jsonl_file_written() {
    let temp = tempdir().unwrap();
    let config = EngineConfig::with_home(temp.path());
    let mut app =
        HookApp::new(config.clone()).with_launcher(Arc::new(RecordingLauncher::new()));
    app.pre_tool(["Bash"])
        .handle_sync(|_| Ok(deny("nope")))
        .unwrap();

    app.dispatch_bytes(pre_bash("ls").to_string().as_bytes())
        .await
        .unwrap();

    let path = config.log_dir.join("observability-session-1.jsonl");
    let content = fs_err::read_to_string(path).unwrap();
    let kinds: Vec<String> = content
        .lines()
        .map(|l| serde_json::from_str::<Value>(l).unwrap()["event_type"].to_string())
        .collect();
    assert_eq!(kinds, vec!["\"hook_enter\"", "\"decision\"", "\"hook_exit\""]);
}
