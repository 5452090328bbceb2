//! Spawn-time command guard.
//!
//! The shell tools must not become a side door for sending chat messages:
//! outbound delivery goes through the `chat_send` tool where the scheduler
//! can account for it. A command that shells out to the runtime's own send
//! surface is rejected before spawn.
//!
//! This is a footgun check, not a sandbox — matching is a substring scan
//! over the lowercased command, the same shape as the denylist the terminal
//! safety checker uses.

/// Patterns identifying a disguised chat-send helper, with the reason
/// reported to the model.
const CHAT_SEND_PATTERNS: &[(&str, &str)] = &[
    ("chat_send", "use the chat_send tool instead of invoking it from a shell"),
    ("ship send", "use the chat_send tool instead of the ship CLI send command"),
    ("ship chat", "use the chat_send tool instead of the ship CLI chat command"),
    ("sma_ctx_server", "do not hand-roll callbacks to the runtime server from a shell"),
];

/// Check that `command` is not a disguised chat-send helper.
///
/// Returns `Err(reason)` when blocked.
pub fn check_not_chat_send(command: &str) -> Result<(), String> {
    let lower = command.to_lowercase();
    for (pattern, reason) in CHAT_SEND_PATTERNS {
        if lower.contains(pattern) {
            return Err(format!("{reason} (matched pattern: `{pattern}`)"));
        }
    }
    Ok(())
}
