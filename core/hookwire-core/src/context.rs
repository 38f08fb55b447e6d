//! Per-invocation context shared by every handler of one dispatch.

use serde_json::{Map, Value};
use std::sync::Arc;

use crate::event::Event;
use crate::observe::{ObservabilityEvent, ObservabilityKind, ObservabilitySink};
use crate::state::State;
use crate::tasks::BackgroundTasks;
use crate::transcript::Transcript;

/// Lets handlers add `custom` records to the observability stream.
#[derive(Clone)]
pub struct Emitter {
    sink: Arc<dyn ObservabilitySink>,
    session_id: String,
    request_id: String,
    hook_name: String,
}

impl Emitter {
    pub fn new(
        sink: Arc<dyn ObservabilitySink>,
        session_id: &str,
        request_id: &str,
        hook_name: &str,
    ) -> Self {
        Emitter {
            sink,
            session_id: session_id.to_string(),
            request_id: request_id.to_string(),
            hook_name: hook_name.to_string(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub(crate) fn record(&self, kind: ObservabilityKind) -> ObservabilityEvent {
        ObservabilityEvent::new(kind, &self.session_id, &self.request_id, &self.hook_name)
    }

    pub(crate) fn emit(&self, event: ObservabilityEvent) {
        self.sink.emit(&event);
    }

    pub fn custom(&self, custom_type: &str, payload: Map<String, Value>) {
        let mut event = self.record(ObservabilityKind::Custom);
        event.custom_event_type = Some(custom_type.to_string());
        event.payload = payload;
        self.emit(event);
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("session_id", &self.session_id)
            .field("request_id", &self.request_id)
            .finish()
    }
}

/// Built once per invocation; nothing here is persisted directly.
#[derive(Debug, Clone)]
pub struct Context {
    pub event: Arc<Event>,
    pub transcript: Arc<Transcript>,
    pub state: State,
    pub tasks: BackgroundTasks,
    pub emitter: Emitter,
}

impl Context {
    pub fn session_id(&self) -> &str {
        &self.event.session_id
    }
}
