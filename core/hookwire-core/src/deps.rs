//! Dependency injection for handlers.
//!
//! A handler declares the values it wants by name at registration time:
//!
//! | name         | value                                   |
//! |--------------|-----------------------------------------|
//! | `event`      | `Arc<Event>`                            |
//! | `transcript` | `Arc<Transcript>` (lazy, shared)        |
//! | `state`      | [`State`] for the event's session       |
//! | `tasks`      | [`BackgroundTasks`] for the session     |
//!
//! Unknown or repeated names are rejected when the binding is registered,
//! before any event is processed.

use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use crate::context::{Context, Emitter};
use crate::error::{HookError, Result};
use crate::event::Event;
use crate::state::State;
use crate::tasks::BackgroundTasks;
use crate::transcript::Transcript;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Param {
    Event,
    Transcript,
    State,
    Tasks,
}

impl Param {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "event" => Some(Param::Event),
            "transcript" => Some(Param::Transcript),
            "state" => Some(Param::State),
            "tasks" | "background_tasks" => Some(Param::Tasks),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Param::Event => "event",
            Param::Transcript => "transcript",
            Param::State => "state",
            Param::Tasks => "tasks",
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered, validated parameter list of one binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec(Vec<Param>);

impl Default for ParamSpec {
    fn default() -> Self {
        ParamSpec(vec![Param::Event])
    }
}

impl ParamSpec {
    pub fn parse<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut params = Vec::new();
        for name in names {
            let name = name.as_ref();
            let param = Param::from_name(name).ok_or_else(|| {
                HookError::config(format!(
                    "unknown handler parameter '{}' (expected one of: event, transcript, state, tasks)",
                    name
                ))
            })?;
            if params.contains(&param) {
                return Err(HookError::config(format!(
                    "handler parameter '{}' declared twice",
                    name
                )));
            }
            params.push(param);
        }
        Ok(ParamSpec(params))
    }

    pub fn params(&self) -> &[Param] {
        &self.0
    }

    pub fn wants(&self, param: Param) -> bool {
        self.0.contains(&param)
    }
}

/// One resolved value.
#[derive(Debug, Clone)]
pub enum Injected {
    Event(Arc<Event>),
    Transcript(Arc<Transcript>),
    State(State),
    Tasks(BackgroundTasks),
}

/// Values handed to a handler, in declaration order.
#[derive(Debug, Clone)]
pub struct Deps {
    values: Vec<Injected>,
    emitter: Emitter,
}

impl Deps {
    pub fn values(&self) -> &[Injected] {
        &self.values
    }

    pub fn event(&self) -> Option<&Event> {
        self.values.iter().find_map(|v| match v {
            Injected::Event(e) => Some(e.as_ref()),
            _ => None,
        })
    }

    pub fn transcript(&self) -> Option<&Transcript> {
        self.values.iter().find_map(|v| match v {
            Injected::Transcript(t) => Some(t.as_ref()),
            _ => None,
        })
    }

    pub fn state(&self) -> Option<&State> {
        self.values.iter().find_map(|v| match v {
            Injected::State(s) => Some(s),
            _ => None,
        })
    }

    pub fn tasks(&self) -> Option<&BackgroundTasks> {
        self.values.iter().find_map(|v| match v {
            Injected::Tasks(t) => Some(t),
            _ => None,
        })
    }

    /// Emits a `custom` observability record.
    pub fn emit(&self, custom_type: &str, payload: Map<String, Value>) {
        self.emitter.custom(custom_type, payload);
    }
}

/// Builds the argument set for one handler invocation. Shared values (the
/// transcript in particular) are cloned handles, never re-created.
pub fn resolve(spec: &ParamSpec, ctx: &Context) -> Deps {
    let values = spec
        .params()
        .iter()
        .map(|param| match param {
            Param::Event => Injected::Event(Arc::clone(&ctx.event)),
            Param::Transcript => Injected::Transcript(Arc::clone(&ctx.transcript)),
            Param::State => Injected::State(ctx.state.clone()),
            Param::Tasks => Injected::Tasks(ctx.tasks.clone()),
        })
        .collect();
    Deps {
        values,
        emitter: ctx.emitter.clone(),
    }
}
