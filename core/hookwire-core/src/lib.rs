//! # hookwire-core
//!
//! Event dispatch engine for Claude Code hooks.
//!
//! A hook process receives one JSON event on stdin and answers with one
//! decision. This crate turns that exchange into registered handlers:
//!
//! - **Events** are parsed into a typed [`Event`] ([`event`])
//! - **Bindings** route events to handlers by kind and tool name ([`registry`])
//! - **Guards** gate individual bindings ([`guard`]); **middleware** wraps the
//!   whole reduction ([`middleware`])
//! - **Dependencies** (event, transcript, state, tasks) are injected by name ([`deps`])
//! - The **dispatcher** reduces handler outcomes to one [`Decision`]: the first
//!   one that is not Passthrough wins ([`dispatch`])
//! - **Background tasks** outlive the hook process and are collected by a later
//!   invocation ([`tasks`])
//!
//! ## Quick start
//!
//! ```ignore
//! use hookwire_core::{deny, runner, Decision};
//!
//! fn main() {
//!     let status = runner::main_with(|app| {
//!         app.pre_tool(["Bash"])
//!             .when(|e| e.command().is_some_and(|c| c.contains("rm -rf /")))
//!             .handle_sync(|_| Ok(deny("refusing to delete /")))?;
//!         Ok(())
//!     });
//!     std::process::exit(status.code());
//! }
//! ```

pub mod app;
pub mod config;
pub mod context;
pub mod decision;
pub mod deps;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod guard;
pub mod logging;
pub mod middleware;
pub mod observe;
pub mod registry;
pub mod runner;
pub mod state;
pub mod storage;
pub mod tasks;
pub mod transcript;

pub use app::HookApp;
pub use config::EngineConfig;
pub use context::Context;
pub use decision::{allow, allow_with, block, deny, render, Decision, ExitStatus};
pub use deps::{Deps, Param, ParamSpec};
pub use dispatch::Dispatcher;
pub use error::{HookError, Result};
pub use event::{parse, Event, EventKind, EventPayload, ToolInput};
pub use guard::Guard;
pub use middleware::{Middleware, Next};
pub use observe::{
    JsonlSink, MemorySink, NullSink, ObservabilityEvent, ObservabilityKind, ObservabilitySink,
};
pub use registry::{Binding, BindingId, Blueprint, Registry, ToolFilter};
pub use state::{State, StateStore};
pub use tasks::{BackgroundTasks, TaskDescriptor, TaskOutcome, TaskStatus};
pub use transcript::{Transcript, TranscriptStats};

/// Re-exported so middleware implementations can name the boxed future type.
pub use futures::future::BoxFuture;
