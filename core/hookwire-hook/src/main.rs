//! Reference hook binary.
//!
//! Install in `~/.claude/settings.json` for every hook event:
//!
//! ```json
//! { "hooks": { "PreToolUse": [{ "matcher": "*", "hooks": [{ "type": "command", "command": "hookwire-hook" }] }] } }
//! ```
//!
//! The same executable is re-launched as `hookwire-hook task-worker` to run
//! background checks after the hook has answered.

mod rules;

use hookwire_core::runner;

fn main() {
    let status = runner::main_with(rules::install);
    std::process::exit(status.code());
}
