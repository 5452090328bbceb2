//! `ShellManager` — owns and multiplexes all active shell sessions.
//!
//! Callers interact exclusively through this struct. The manager is designed
//! to be owned by a single task and passed around behind a `Mutex` when
//! shared access is needed; capacity eviction and the quiescent cleanup
//! sweep run synchronously inside the calls that need them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use ship_core::RequestContext;

use crate::error::{Result, ShellError};
use crate::guard;
use crate::session::ShellSession;
use crate::types::{
    ExecRequest, OutputPage, PageBudget, ShellSessionInfo, CLEANUP_QUIET_SECS, EMPTY_POLL_MIN_MS,
    MAX_ACTIVE_SHELL_CONTEXTS,
};

/// Note attached to a page when more output remains buffered.
const MORE_OUTPUT_NOTE: &str =
    "More output is buffered. Poll with write_stdin(context_id, chars=\"\") to fetch the next page.";

/// Manages all live shell sessions for one runtime.
pub struct ShellManager {
    project_root: PathBuf,
    budget: PageBudget,
    sessions: HashMap<u64, ShellSession>,
    next_id: u64,
}

impl ShellManager {
    /// Create a manager rooted at `project_root` with the configured page
    /// budgets (`permissions.exec_command.*`).
    pub fn new(project_root: impl Into<PathBuf>, max_output_chars: usize, max_output_lines: usize) -> Self {
        Self {
            project_root: project_root.into(),
            budget: PageBudget {
                max_chars: max_output_chars,
                max_lines: max_output_lines,
            },
            sessions: HashMap::new(),
            next_id: 1,
        }
    }

    // -----------------------------------------------------------------------
    // exec_command
    // -----------------------------------------------------------------------

    /// Start a session, wait up to the yield window, and return the first
    /// output page.
    pub async fn exec_command(
        &mut self,
        req: ExecRequest,
        ctx: &RequestContext,
    ) -> Result<OutputPage> {
        guard::check_not_chat_send(&req.command)
            .map_err(|reason| ShellError::CommandBlocked { reason })?;

        self.sweep_quiescent();
        self.ensure_capacity()?;

        let id = self.next_id;
        self.next_id += 1;
        let session = ShellSession::spawn(id, &req, ctx, &self.project_root)?;
        self.sessions.insert(id, session);
        info!(session = id, command = %req.command, "shell session started");

        let state = std::sync::Arc::clone(&self.sessions[&id].state);
        state.wait_for_output(req.yield_time_ms).await;

        Ok(self.build_page(id, req.max_output_tokens))
    }

    // -----------------------------------------------------------------------
    // write_stdin
    // -----------------------------------------------------------------------

    /// Send input to a session (or poll it with empty `chars`) and return
    /// the next output page.
    ///
    /// Empty-input polls wait at least [`EMPTY_POLL_MIN_MS`] so the model
    /// cannot busy-loop.
    pub async fn write_stdin(
        &mut self,
        session_id: u64,
        chars: &str,
        yield_time_ms: u64,
        max_output_tokens: Option<u64>,
    ) -> Result<OutputPage> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(ShellError::UnknownSession { id: session_id })?;
        session.last_active = Instant::now();

        let effective_yield = if chars.is_empty() {
            yield_time_ms.max(EMPTY_POLL_MIN_MS)
        } else {
            session.write_stdin(chars).await?;
            yield_time_ms
        };

        let state = std::sync::Arc::clone(&session.state);
        // Skip the wait entirely when a full page is already buffered.
        if state.pending_len() < self.budget.max_chars {
            state.wait_for_output(effective_yield).await;
        }

        Ok(self.build_page(session_id, max_output_tokens))
    }

    // -----------------------------------------------------------------------
    // close_shell
    // -----------------------------------------------------------------------

    /// Terminate and forget a session. Unknown ids are idempotent success.
    pub async fn close_shell(&mut self, session_id: u64, force: bool) -> Result<()> {
        match self.sessions.remove(&session_id) {
            Some(session) => {
                session.kill(force);
                info!(session = session_id, force, "shell session closed");
                Ok(())
            }
            None => {
                debug!(session = session_id, "close_shell on unknown session (no-op)");
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn list(&self) -> Vec<ShellSessionInfo> {
        let mut infos: Vec<ShellSessionInfo> = self
            .sessions
            .values()
            .map(|s| ShellSessionInfo {
                id: s.id,
                command: s.command.clone(),
                shell: s.shell.clone(),
                cwd: s.cwd.display().to_string(),
                exited: s.state.exited(),
                pending_chars: s.state.pending_len(),
                dropped_chars: s.state.dropped_chars(),
            })
            .collect();
        infos.sort_by_key(|i| i.id);
        infos
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    /// Build the response page and auto-finalize the session when it exited
    /// with nothing left to read.
    fn build_page(&mut self, session_id: u64, max_output_tokens: Option<u64>) -> OutputPage {
        let budget = self.budget.with_max_output_tokens(max_output_tokens);
        let Some(session) = self.sessions.get(&session_id) else {
            // Session vanished between the wait and the page build.
            return OutputPage {
                context_id: None,
                output: String::new(),
                has_more_output: false,
                exited: true,
                exit_code: None,
                dropped_chars: 0,
                note: None,
            };
        };

        let (output, has_more) = session.state.take_page(budget);
        let exited = session.state.exited();
        let exit_code = session.state.exit_code();
        let dropped_chars = session.state.dropped_chars();

        let finalize = exited && !has_more && session.state.pending_len() == 0;
        if finalize {
            self.sessions.remove(&session_id);
            debug!(session = session_id, "shell session auto-finalized");
        }

        OutputPage {
            context_id: if finalize { None } else { Some(session_id) },
            output,
            has_more_output: has_more,
            exited,
            exit_code: if exited { exit_code } else { None },
            dropped_chars,
            note: if has_more {
                Some(MORE_OUTPUT_NOTE.to_string())
            } else {
                None
            },
        }
    }

    /// Remove exited-and-drained sessions idle past the quiescent period.
    fn sweep_quiescent(&mut self) {
        let cutoff = Duration::from_secs(CLEANUP_QUIET_SECS);
        let stale: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.drained() && s.last_active.elapsed() > cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            self.sessions.remove(&id);
            debug!(session = id, "quiescent shell session swept");
        }
    }

    /// Evict exited-and-drained sessions oldest-first until under the cap;
    /// fail when live sessions alone exceed it.
    fn ensure_capacity(&mut self) -> Result<()> {
        if self.sessions.len() < MAX_ACTIVE_SHELL_CONTEXTS {
            return Ok(());
        }

        let mut evictable: Vec<(Instant, u64)> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.drained())
            .map(|(id, s)| (s.last_active, *id))
            .collect();
        evictable.sort();

        for (_, id) in evictable {
            if self.sessions.len() < MAX_ACTIVE_SHELL_CONTEXTS {
                break;
            }
            self.sessions.remove(&id);
            debug!(session = id, "shell session evicted for capacity");
        }

        if self.sessions.len() >= MAX_ACTIVE_SHELL_CONTEXTS {
            return Err(ShellError::CapacityExceeded {
                max: MAX_ACTIVE_SHELL_CONTEXTS,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
