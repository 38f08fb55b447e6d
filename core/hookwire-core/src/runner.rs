//! Process entry point for hook binaries.
//!
//! ```text
//! <bin>                                   read one event from stdin, print the decision
//! <bin> handle                            same, explicitly
//! <bin> task-worker --session-id <id>     drain background tasks (spawned by the hook)
//! ```
//!
//! stdout carries only the rendered decision. Diagnostics go to stderr and
//! the log file.

use clap::{Parser, Subcommand};
use std::io::{self, Read, Write};
use std::path::PathBuf;

use crate::app::HookApp;
use crate::decision::{render, ExitStatus};
use crate::error::{HookError, Result};
use crate::logging;

#[derive(Parser, Debug)]
#[command(name = "hookwire", version, about = "Claude Code hook dispatcher")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Read one hook event from stdin and print the decision (default)
    Handle,
    /// Drain pending background tasks for a session
    #[command(name = "task-worker", hide = true)]
    TaskWorker {
        #[arg(long)]
        session_id: String,
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
}

/// Parses the command line, builds the app from the environment, lets
/// `setup` register bindings and work, then runs.
pub fn main_with<F>(setup: F) -> ExitStatus
where
    F: FnOnce(&mut HookApp) -> Result<()>,
{
    let cli = Cli::parse();
    let mut app = HookApp::from_env();
    if let Some(Command::TaskWorker {
        state_dir: Some(dir),
        ..
    }) = &cli.command
    {
        app.set_state_dir(dir);
    }
    logging::init(app.config());

    if let Err(e) = setup(&mut app) {
        tracing::error!(error = %e, "Hook setup failed");
        eprintln!("hookwire: {}", e);
        return ExitStatus::Configuration;
    }
    run(&app, cli)
}

pub fn run(app: &HookApp, cli: Cli) -> ExitStatus {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start async runtime");
            eprintln!("hookwire: failed to start async runtime: {}", e);
            return ExitStatus::Configuration;
        }
    };

    match cli.command.unwrap_or(Command::Handle) {
        Command::Handle => {
            let mut input = Vec::new();
            if let Err(e) = io::stdin().read_to_end(&mut input) {
                tracing::error!(error = %e, "Failed to read stdin");
                eprintln!("hookwire: failed to read stdin: {}", e);
                return ExitStatus::MalformedPayload;
            }
            let stdout = io::stdout();
            let mut out = stdout.lock();
            runtime.block_on(handle(app, &input, &mut out))
        }
        Command::TaskWorker { session_id, .. } => {
            match runtime.block_on(app.run_worker(&session_id)) {
                Ok(report) => {
                    tracing::debug!(session = %session_id, ?report, "Worker exiting");
                }
                Err(e) => {
                    tracing::error!(session = %session_id, error = %e, "Worker failed");
                }
            }
            ExitStatus::Ok
        }
    }
}

/// Dispatches one payload and writes the response to `out`.
pub async fn handle<W: Write>(app: &HookApp, input: &[u8], out: &mut W) -> ExitStatus {
    if input.iter().all(u8::is_ascii_whitespace) {
        return ExitStatus::Ok;
    }

    match app.dispatch_bytes(input).await {
        Ok(decision) => {
            if let Some(line) = render(&decision) {
                if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
                    tracing::error!(error = %e, "Failed to write response");
                }
            }
            ExitStatus::Ok
        }
        Err(e @ HookError::MalformedPayload(_)) => {
            tracing::warn!(error = %e, "Rejected payload");
            eprintln!("hookwire: {}", e);
            ExitStatus::MalformedPayload
        }
        Err(e) => {
            tracing::error!(error = %e, "Dispatch failed");
            eprintln!("hookwire: {}", e);
            ExitStatus::Configuration
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::decision::deny;
    use crate::event::EventKind;
    use crate::observe::{MemorySink, ObservabilitySink};
    use crate::tasks::RecordingLauncher;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn app(home: &std::path::Path) -> HookApp {
        let mut app = HookApp::new(EngineConfig::with_home(home))
            .with_sink(Arc::new(MemorySink::new()) as Arc<dyn ObservabilitySink>)
            .with_launcher(Arc::new(RecordingLauncher::new()));
        app.on(EventKind::Stop)
            .handle_sync(|_| Ok(deny("not yet")))
            .unwrap();
        app
    }

    #[tokio::test]
    async fn test_handle_prints_rendered_decision() {
        let temp = tempdir().unwrap();
        let mut out = Vec::new();
        let status = handle(
            &app(temp.path()),
            br#"{"hook_event_name":"Stop","session_id":"s1","cwd":"/tmp"}"#,
            &mut out,
        )
        .await;
        assert_eq!(status, ExitStatus::Ok);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "{\"decision\":\"deny\",\"reason\":\"not yet\"}\n"
        );
    }

    #[tokio::test]
    async fn test_passthrough_prints_nothing() {
        let temp = tempdir().unwrap();
        let mut out = Vec::new();
        let status = handle(
            &app(temp.path()),
            br#"{"hook_event_name":"SessionEnd","session_id":"s1","cwd":"/tmp"}"#,
            &mut out,
        )
        .await;
        assert_eq!(status, ExitStatus::Ok);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_exit_code() {
        let temp = tempdir().unwrap();
        let mut out = Vec::new();
        let status = handle(&app(temp.path()), b"[1, 2", &mut out).await;
        assert_eq!(status, ExitStatus::MalformedPayload);
        assert_eq!(status.code(), 1);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_empty_input_is_a_no_op() {
        let temp = tempdir().unwrap();
        let mut out = Vec::new();
        assert_eq!(handle(&app(temp.path()), b"  \n", &mut out).await, ExitStatus::Ok);
        assert!(out.is_empty());
    }

    #[test]
    fn test_cli_parses_worker_subcommand() {
        let cli = Cli::try_parse_from([
            "hookwire-hook",
            "task-worker",
            "--session-id",
            "abc",
            "--state-dir",
            "/tmp/state",
        ])
        .unwrap();
        assert_eq!(
            cli.command,
            Some(Command::TaskWorker {
                session_id: "abc".to_string(),
                state_dir: Some(PathBuf::from("/tmp/state")),
            })
        );
        assert_eq!(Cli::try_parse_from(["hookwire-hook"]).unwrap().command, None);
    }
}
