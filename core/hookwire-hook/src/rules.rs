//! Built-in guardrails.
//!
//! ```text
//! PreToolUse  Bash        destructive-shell   deny rm -rf /, force push to main, curl | sh
//! PreToolUse  Write|Edit  secret-files        deny writes to .env, keys, credentials
//! PostToolUse Write|Edit  line-count          schedule a background line count of the file
//! Stop                    collect-checks      collect finished counts, block once on huge files
//! Stop                    pending-checks      block while counts are still running
//! ```

use hookwire_core::{
    block, deny, Blueprint, Decision, Deps, Event, EventKind, HookApp, Result, TaskOutcome,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::path::Path;

pub const GUARDRAILS: &str = "guardrails";
pub const LINE_COUNT_WORK: &str = "line-count";

/// State key holding task ids scheduled but not yet collected.
const OUTSTANDING_KEY: &str = "outstanding_checks";
/// Files above this are reported when their count is collected.
const LARGE_FILE_LINES: u64 = 800;

static RM_ROOT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\brm\s+(-[a-zA-Z]*[rR][a-zA-Z]*\s+|--recursive\s+|--force\s+|-[a-zA-Z]*f[a-zA-Z]*\s+)*/(\*|\s|$)")
        .expect("valid regex")
});
static RM_RECURSIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\brm\s+.*(-[a-zA-Z]*[rR]|--recursive)").expect("valid regex"));
static GIT_PUSH: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bgit\s+push\b").expect("valid regex"));
static FORCE_FLAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(^|\s)(--force(-with-lease)?|-[a-zA-Z]*f[a-zA-Z]*)(\s|$)|\s\+\S")
        .expect("valid regex")
});
static PROTECTED_BRANCH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(main|master)\b").expect("valid regex"));
static PIPE_TO_SHELL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(curl|wget)\b[^|]*\|\s*(sudo\s+)?(ba|z|da)?sh\b").expect("valid regex")
});

/// Why a shell command is refused, if it is.
pub fn dangerous_command(command: &str) -> Option<&'static str> {
    if RM_ROOT.is_match(command) && RM_RECURSIVE.is_match(command) {
        return Some("recursive delete of the filesystem root is blocked");
    }
    if GIT_PUSH.is_match(command)
        && FORCE_FLAG.is_match(command)
        && PROTECTED_BRANCH.is_match(command)
    {
        return Some("force-pushing to main/master is blocked");
    }
    if PIPE_TO_SHELL.is_match(command) {
        return Some("piping a download straight into a shell is blocked");
    }
    None
}

pub fn is_secret_file(path: &str) -> bool {
    let name = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    if name == ".env.example" || name == ".env.sample" || name == ".env.template" {
        return false;
    }
    name == ".env"
        || name.starts_with(".env.")
        || name.ends_with(".pem")
        || name.ends_with(".key")
        || name.starts_with("id_rsa")
        || name.starts_with("id_ed25519")
        || name == "credentials"
        || name == "credentials.json"
        || name == ".netrc"
}

fn event(deps: &Deps) -> anyhow::Result<&Event> {
    deps.event().ok_or_else(|| anyhow::anyhow!("event not injected"))
}

pub fn guardrails() -> Result<Blueprint> {
    let mut bp = Blueprint::new(GUARDRAILS);

    bp.pre_tool(["Bash"])
        .named("destructive-shell")
        .handle_sync(|deps| {
            let command = event(&deps)?.command().unwrap_or_default();
            Ok(match dangerous_command(command) {
                Some(reason) => {
                    tracing::info!(command = %command, reason, "Refused shell command");
                    deny(reason)
                }
                None => Decision::Passthrough,
            })
        })?;

    bp.pre_tool(["Write|Edit"])
        .named("secret-files")
        .when(|e| e.file_path().is_some_and(is_secret_file))
        .handle_sync(|deps| {
            let path = event(&deps)?.file_path().unwrap_or_default();
            Ok(deny(format!(
                "{} looks like a secrets file; edit it by hand",
                path
            )))
        })?;

    bp.post_tool(["Write|Edit"])
        .named(LINE_COUNT_WORK)
        .inject(["event", "state", "tasks"])
        .when(|e| e.file_path().is_some())
        .handle_sync(|deps| {
            let path = event(&deps)?.file_path().unwrap_or_default().to_string();
            let state = deps.state().ok_or_else(|| anyhow::anyhow!("state not injected"))?;
            let tasks = deps.tasks().ok_or_else(|| anyhow::anyhow!("tasks not injected"))?;

            let task_id = tasks.schedule(LINE_COUNT_WORK, json!({ "file_path": path }))?;
            let mut outstanding: Vec<String> = state.get_as(OUTSTANDING_KEY).unwrap_or_default();
            outstanding.push(task_id);
            state.set(OUTSTANDING_KEY, &outstanding)?;
            state.save();
            Ok(Decision::Passthrough)
        })?;

    bp.on(EventKind::Stop)
        .named("collect-checks")
        .inject(["event", "state", "tasks"])
        .handle_sync(collect_checks)?;

    bp.on(EventKind::Stop)
        .named("pending-checks")
        .inject(["state"])
        .when(|e| !e.stop_hook_active())
        .handle_sync(|deps| {
            let state = deps.state().ok_or_else(|| anyhow::anyhow!("state not injected"))?;
            let outstanding: Vec<String> = state.get_as(OUTSTANDING_KEY).unwrap_or_default();
            if outstanding.is_empty() {
                return Ok(Decision::Passthrough);
            }
            Ok(block(format!(
                "{} background check(s) still running; wait for them to finish",
                outstanding.len()
            )))
        })?;

    Ok(bp)
}

fn collect_checks(deps: Deps) -> anyhow::Result<Decision> {
    let stop_hook_active = event(&deps)?.stop_hook_active();
    let state = deps.state().ok_or_else(|| anyhow::anyhow!("state not injected"))?;
    let tasks = deps.tasks().ok_or_else(|| anyhow::anyhow!("tasks not injected"))?;

    let outstanding: Vec<String> = state.get_as(OUTSTANDING_KEY).unwrap_or_default();
    if outstanding.is_empty() {
        return Ok(Decision::Passthrough);
    }

    let mut still_running = Vec::new();
    let mut large_files = Vec::new();
    for task_id in outstanding {
        match tasks.collect(&task_id)? {
            TaskOutcome::Pending | TaskOutcome::Running => still_running.push(task_id),
            TaskOutcome::Done(result) => {
                let lines = result["lines"].as_u64().unwrap_or(0);
                let path = result["file_path"].as_str().unwrap_or_default().to_string();
                let mut payload = serde_json::Map::new();
                payload.insert("file_path".to_string(), Value::from(path.clone()));
                payload.insert("lines".to_string(), Value::from(lines));
                deps.emit("line_count", payload);
                if lines > LARGE_FILE_LINES {
                    large_files.push(format!("{} ({} lines)", path, lines));
                }
            }
            TaskOutcome::Failed(error) => {
                tracing::warn!(task = %task_id, error = %error, "Line count failed");
            }
            TaskOutcome::AlreadyCollected | TaskOutcome::NotFound => {}
        }
    }

    state.set(OUTSTANDING_KEY, &still_running)?;
    state.save();

    if large_files.is_empty() || stop_hook_active {
        return Ok(Decision::Passthrough);
    }
    Ok(block(format!(
        "these files grew past {} lines, consider splitting them: {}",
        LARGE_FILE_LINES,
        large_files.join(", ")
    )))
}

/// Background work: counts the lines of `args.file_path`.
pub async fn line_count(args: Value) -> anyhow::Result<Value> {
    let path = args["file_path"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("missing file_path"))?;
    let content = fs_err::read_to_string(path)?;
    Ok(json!({
        "file_path": path,
        "lines": content.lines().count() as u64,
    }))
}

pub fn install(app: &mut HookApp) -> Result<()> {
    app.include(guardrails()?)?;
    app.work(LINE_COUNT_WORK, line_count)?;
    Ok(())
}
