//! Per-binding predicates.
//!
//! A guard that errors or panics is not swallowed: the caller receives a
//! [`HookError::GuardEvaluation`] and treats it as fail-closed.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::error::{HookError, Result};
use crate::event::Event;

type GuardFn = Arc<dyn Fn(Arc<Event>) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

#[derive(Clone)]
pub struct Guard(GuardFn);

impl Guard {
    /// A guard that may suspend.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        Guard(Arc::new(move |event| f(event).boxed()))
    }

    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&Event) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Guard(Arc::new(move |event: Arc<Event>| {
            let f = Arc::clone(&f);
            async move { f(&event) }.boxed()
        }))
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        Guard::sync(move |event| Ok(f(event)))
    }
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Guard(..)")
    }
}

/// `None` passes.
pub async fn evaluate(guard: Option<&Guard>, event: &Arc<Event>, binding: &str) -> Result<bool> {
    let Some(guard) = guard else {
        return Ok(true);
    };
    match AssertUnwindSafe((guard.0)(Arc::clone(event)))
        .catch_unwind()
        .await
    {
        Ok(Ok(pass)) => Ok(pass),
        Ok(Err(e)) => Err(HookError::GuardEvaluation {
            binding: binding.to_string(),
            message: format!("{:#}", e),
        }),
        Err(_) => Err(HookError::GuardEvaluation {
            binding: binding.to_string(),
            message: "guard panicked".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::parse;

    fn bash(command: &str) -> Arc<Event> {
        let raw = serde_json::json!({
            "hook_event_name": "PreToolUse",
            "session_id": "s1",
            "cwd": "/tmp",
            "tool_name": "Bash",
            "tool_input": {"command": command}
        });
        Arc::new(parse(raw.to_string().as_bytes()).unwrap())
    }

    #[tokio::test]
    async fn test_absent_guard_passes() {
        assert!(evaluate(None, &bash("ls"), "b").await.unwrap());
    }

    #[tokio::test]
    async fn test_sync_guard_reads_event() {
        let guard = Guard::from_fn(|e| e.command().is_some_and(|c| c.starts_with("git")));
        assert!(evaluate(Some(&guard), &bash("git status"), "b").await.unwrap());
        assert!(!evaluate(Some(&guard), &bash("ls"), "b").await.unwrap());
    }

    #[tokio::test]
    async fn test_async_guard() {
        let guard = Guard::new(|event: Arc<Event>| async move {
            tokio::task::yield_now().await;
            Ok(event.tool_name.as_deref() == Some("Bash"))
        });
        assert!(evaluate(Some(&guard), &bash("ls"), "b").await.unwrap());
    }

    #[tokio::test]
    async fn test_failing_guard_is_guard_evaluation_error() {
        let guard = Guard::sync(|_| Err(anyhow::anyhow!("no network")));
        let err = evaluate(Some(&guard), &bash("ls"), "check").await.unwrap_err();
        match err {
            HookError::GuardEvaluation { binding, message } => {
                assert_eq!(binding, "check");
                assert_eq!(message, "no network");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panicking_guard_is_contained() {
        let guard = Guard::from_fn(|_| panic!("bad guard"));
        assert!(matches!(
            evaluate(Some(&guard), &bash("ls"), "b").await,
            Err(HookError::GuardEvaluation { .. })
        ));
    }
}
