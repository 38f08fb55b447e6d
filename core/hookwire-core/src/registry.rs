//! Handler bindings and how events are matched to them.
//!
//! Bindings are kept in registration order. Matching returns every binding
//! whose kind equals the event's and whose tool filter is a wildcard or names
//! the event's tool; specific and wildcard bindings both match, nothing is
//! ranked by specificity.
//!
//! ```ignore
//! let mut bp = Blueprint::new("safety");
//! bp.pre_tool(["Bash"])
//!     .named("no-sudo")
//!     .when(|e| e.command().is_some_and(|c| c.starts_with("sudo")))
//!     .handle_sync(|_| Ok(deny("sudo is not allowed")))?;
//! app.include(bp)?;
//! ```

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::decision::Decision;
use crate::deps::{Deps, ParamSpec};
use crate::error::{HookError, Result};
use crate::event::{Event, EventKind};
use crate::guard::Guard;

pub type HandlerFn = Arc<dyn Fn(Deps) -> BoxFuture<'static, anyhow::Result<Decision>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolFilter {
    Any,
    Tools(Vec<String>),
}

impl ToolFilter {
    /// Empty means wildcard. `"Edit|Write"` is split into two names.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tools: Vec<String> = names
            .into_iter()
            .flat_map(|n| {
                n.as_ref()
                    .split('|')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect();
        if tools.is_empty() || tools.iter().any(|t| t == "*") {
            ToolFilter::Any
        } else {
            ToolFilter::Tools(tools)
        }
    }

    pub fn matches(&self, tool_name: Option<&str>) -> bool {
        match self {
            ToolFilter::Any => true,
            ToolFilter::Tools(tools) => {
                tool_name.is_some_and(|name| tools.iter().any(|t| t == name))
            }
        }
    }
}

impl fmt::Display for ToolFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolFilter::Any => f.write_str("*"),
            ToolFilter::Tools(tools) => f.write_str(&tools.join("|")),
        }
    }
}

/// Opaque handle to a registered binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingId(String);

impl BindingId {
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone)]
pub struct Binding {
    pub kind: EventKind,
    pub filter: ToolFilter,
    pub guard: Option<Guard>,
    pub handler: HandlerFn,
    pub params: ParamSpec,
    pub name: String,
    /// Blueprint this binding was merged from, if any.
    pub source: Option<String>,
    pub order: usize,
}

impl Binding {
    pub fn matches(&self, event: &Event) -> bool {
        self.kind == event.kind && self.filter.matches(event.tool_name.as_deref())
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("kind", &self.kind)
            .field("filter", &self.filter)
            .field("name", &self.name)
            .field("source", &self.source)
            .field("order", &self.order)
            .field("params", &self.params)
            .field("guarded", &self.guard.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    bindings: Vec<Binding>,
    names: HashSet<String>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn get(&self, id: &BindingId) -> Option<&Binding> {
        self.bindings.iter().find(|b| b.name == id.0)
    }

    /// Appends a binding. `name: None` becomes `<kind>#<order>`.
    pub fn bind(
        &mut self,
        kind: EventKind,
        filter: ToolFilter,
        guard: Option<Guard>,
        handler: HandlerFn,
        params: ParamSpec,
        name: Option<String>,
    ) -> Result<BindingId> {
        if !kind.is_tool_event() && filter != ToolFilter::Any {
            return Err(HookError::config(format!(
                "{} is not a tool event; it cannot filter on tools '{}'",
                kind, filter
            )));
        }
        let order = self.bindings.len();
        let name = name.unwrap_or_else(|| format!("{}#{}", kind.hook_label(), order));
        if name.trim().is_empty() {
            return Err(HookError::config("binding name must not be empty"));
        }
        if self.names.contains(&name) {
            return Err(HookError::config(format!(
                "a binding named '{}' is already registered",
                name
            )));
        }

        self.names.insert(name.clone());
        self.bindings.push(Binding {
            kind,
            filter,
            guard,
            handler,
            params,
            name: name.clone(),
            source: None,
            order,
        });
        tracing::trace!(binding = %name, kind = %kind, "Binding registered");
        Ok(BindingId(name))
    }

    /// Bindings for `event`, in registration order.
    pub fn match_event(&self, event: &Event) -> Vec<&Binding> {
        self.bindings.iter().filter(|b| b.matches(event)).collect()
    }

    /// Appends every binding of `child`, keeping its relative order. Names
    /// are prefixed with `<source_name>.`. Nothing is added if any prefixed
    /// name collides.
    pub fn merge(&mut self, child: Registry, source_name: &str) -> Result<()> {
        let renamed: Vec<String> = child
            .bindings
            .iter()
            .map(|b| format!("{}.{}", source_name, b.name))
            .collect();
        if let Some(dup) = renamed.iter().find(|n| self.names.contains(*n)) {
            return Err(HookError::config(format!(
                "including '{}' would register '{}' twice",
                source_name, dup
            )));
        }

        let count = child.bindings.len();
        for (mut binding, name) in child.bindings.into_iter().zip(renamed) {
            binding.order = self.bindings.len();
            binding.source = Some(source_name.to_string());
            self.names.insert(name.clone());
            binding.name = name;
            self.bindings.push(binding);
        }
        tracing::debug!(source = %source_name, bindings = count, "Blueprint merged");
        Ok(())
    }

    pub fn pre_tool<I, S>(&mut self, tools: I) -> BindingBuilder<'_>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        BindingBuilder::new(self, EventKind::PreToolUse, ToolFilter::from_names(tools))
    }

    pub fn post_tool<I, S>(&mut self, tools: I) -> BindingBuilder<'_>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        BindingBuilder::new(self, EventKind::PostToolUse, ToolFilter::from_names(tools))
    }

    pub fn on(&mut self, kind: EventKind) -> BindingBuilder<'_> {
        BindingBuilder::new(self, kind, ToolFilter::Any)
    }
}

/// Accumulates options for one binding; [`handle`](Self::handle) registers it.
#[must_use = "nothing is registered until .handle() is called"]
pub struct BindingBuilder<'r> {
    registry: &'r mut Registry,
    kind: EventKind,
    filter: ToolFilter,
    name: Option<String>,
    params: Option<Vec<String>>,
    guard: Option<Guard>,
}

impl<'r> BindingBuilder<'r> {
    fn new(registry: &'r mut Registry, kind: EventKind, filter: ToolFilter) -> Self {
        BindingBuilder {
            registry,
            kind,
            filter,
            name: None,
            params: None,
            guard: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Declares the handler's parameters by name, in order.
    pub fn inject<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = Some(params.into_iter().map(Into::into).collect());
        self
    }

    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.guard = Some(Guard::from_fn(predicate));
        self
    }

    pub fn guard(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn handle<F, Fut>(self, handler: F) -> Result<BindingId>
    where
        F: Fn(Deps) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Decision>> + Send + 'static,
    {
        let handler: HandlerFn = Arc::new(move |deps: Deps| handler(deps).boxed());
        self.register(handler)
    }

    pub fn handle_sync<F>(self, handler: F) -> Result<BindingId>
    where
        F: Fn(Deps) -> anyhow::Result<Decision> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let handler: HandlerFn = Arc::new(move |deps: Deps| {
            let handler = Arc::clone(&handler);
            async move { handler(deps) }.boxed()
        });
        self.register(handler)
    }

    fn register(self, handler: HandlerFn) -> Result<BindingId> {
        let params = match self.params {
            Some(names) => ParamSpec::parse(names)?,
            None => ParamSpec::default(),
        };
        self.registry
            .bind(self.kind, self.filter, self.guard, handler, params, self.name)
    }
}

/// A named, mergeable group of bindings.
#[derive(Debug, Clone)]
pub struct Blueprint {
    name: String,
    registry: Registry,
}

impl Blueprint {
    pub fn new(name: impl Into<String>) -> Self {
        Blueprint {
            name: name.into(),
            registry: Registry::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn into_parts(self) -> (String, Registry) {
        (self.name, self.registry)
    }

    /// Nests another blueprint; its bindings become `<inner>.<name>` here.
    pub fn include(&mut self, blueprint: Blueprint) -> Result<()> {
        let (name, registry) = blueprint.into_parts();
        self.registry.merge(registry, &name)
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
}
