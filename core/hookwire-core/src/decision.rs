//! Handler outcomes and how they are rendered back to Claude Code.
//!
//! | Decision        | stdout                                      | exit |
//! |-----------------|---------------------------------------------|------|
//! | `Passthrough`   | nothing                                     | 0    |
//! | `Allow(None)`   | nothing                                     | 0    |
//! | `Allow(Some)`   | `{"decision":"approve","reason":...}`       | 0    |
//! | `Deny(reason)`  | `{"decision":"deny","reason":...}`          | 0    |
//! | `Block(msg)`    | `{"decision":"block","reason":...}`         | 0    |
//!
//! Fatal paths (malformed payload, bad configuration) never reach rendering;
//! they are reported through [`ExitStatus`] with a diagnostic on stderr.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow(Option<String>),
    Deny(String),
    Block(String),
    Passthrough,
}

/// Reason attached when a handler fails and the dispatcher fails closed.
pub const HANDLER_FAILURE_REASON: &str = "hook handler failed; action denied for safety";

/// Reason attached when a guard fails.
pub const GUARD_FAILURE_REASON: &str = "guard evaluation failed";

pub fn allow() -> Decision {
    Decision::Allow(None)
}

pub fn allow_with(message: impl Into<String>) -> Decision {
    Decision::Allow(Some(message.into()))
}

pub fn deny(reason: impl Into<String>) -> Decision {
    Decision::Deny(reason.into())
}

pub fn block(message: impl Into<String>) -> Decision {
    Decision::Block(message.into())
}

impl Decision {
    pub fn is_passthrough(&self) -> bool {
        matches!(self, Decision::Passthrough)
    }

    /// Deny and Block stop the host; Allow and Passthrough let it proceed.
    pub fn is_restrictive(&self) -> bool {
        matches!(self, Decision::Deny(_) | Decision::Block(_))
    }

    /// Label used on the wire and in observability records.
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Allow(_) => "approve",
            Decision::Deny(_) => "deny",
            Decision::Block(_) => "block",
            Decision::Passthrough => "passthrough",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Decision::Allow(message) => message.as_deref(),
            Decision::Deny(reason) | Decision::Block(reason) => Some(reason),
            Decision::Passthrough => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct WireResponse<'a> {
    decision: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

/// Renders the JSON line for stdout, or `None` when the host should proceed
/// with its default behavior.
pub fn render(decision: &Decision) -> Option<String> {
    match decision {
        Decision::Passthrough | Decision::Allow(None) => None,
        other => serde_json::to_string(&WireResponse {
            decision: other.label(),
            reason: other.reason(),
        })
        .ok(),
    }
}

/// Process exit status for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Ok,
    MalformedPayload,
    Configuration,
}

impl ExitStatus {
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Ok => 0,
            ExitStatus::MalformedPayload => 1,
            // EX_CONFIG from sysexits.h
            ExitStatus::Configuration => 78,
        }
    }
}
