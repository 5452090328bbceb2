//! One live shell session: a piped child process plus the shared state its
//! reader tasks drain into.
//!
//! Blocking never happens here — stdout/stderr are pumped by detached tokio
//! tasks into a bounded pending buffer, and callers suspend on a `Notify`
//! until data or exit arrives.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use ship_core::RequestContext;

use crate::error::{Result, ShellError};
use crate::types::{ExecRequest, FOLLOW_ON_WAIT_MS, MAX_CONTEXT_PENDING_CHARS, MAX_YIELD_MS, MIN_YIELD_MS, PageBudget};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State shared between the session handle, its reader tasks, and waiters.
pub(crate) struct SessionState {
    pending: Mutex<String>,
    dropped_chars: AtomicU64,
    exited: AtomicBool,
    exit_code: Mutex<Option<i32>>,
    notify: Notify,
}

impl SessionState {
    fn new() -> Self {
        Self {
            pending: Mutex::new(String::new()),
            dropped_chars: AtomicU64::new(0),
            exited: AtomicBool::new(false),
            exit_code: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Append normalized output, dropping the oldest chars past the cap.
    pub(crate) fn push_output(&self, raw: &[u8]) {
        let text = normalize_output(raw);
        if text.is_empty() {
            return;
        }
        {
            let mut pending = self.pending.lock().unwrap();
            pending.push_str(&text);
            if pending.len() > MAX_CONTEXT_PENDING_CHARS {
                let mut cut = pending.len() - MAX_CONTEXT_PENDING_CHARS;
                while !pending.is_char_boundary(cut) {
                    cut += 1;
                }
                let dropped = pending[..cut].chars().count() as u64;
                pending.drain(..cut);
                self.dropped_chars.fetch_add(dropped, Ordering::Relaxed);
            }
        }
        self.notify.notify_waiters();
    }

    fn mark_exited(&self, code: Option<i32>) {
        *self.exit_code.lock().unwrap() = code;
        self.exited.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub(crate) fn exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub(crate) fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().unwrap()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub(crate) fn dropped_chars(&self) -> u64 {
        self.dropped_chars.load(Ordering::Relaxed)
    }

    /// Cut one page off the front of the pending buffer.
    ///
    /// The cut obeys both the character budget and the line budget; the
    /// remainder stays buffered. Returns `(page, has_more)`.
    pub(crate) fn take_page(&self, budget: PageBudget) -> (String, bool) {
        let mut pending = self.pending.lock().unwrap();
        if pending.is_empty() {
            return (String::new(), false);
        }

        let mut cut = 0usize;
        let mut chars = 0usize;
        let mut lines = 0usize;
        for (idx, ch) in pending.char_indices() {
            if chars >= budget.max_chars {
                break;
            }
            chars += 1;
            cut = idx + ch.len_utf8();
            if ch == '\n' {
                lines += 1;
                if lines >= budget.max_lines {
                    break;
                }
            }
        }

        let page: String = pending.drain(..cut).collect();
        let has_more = !pending.is_empty();
        (page, has_more)
    }

    /// Suspend until output is pending, the child exited, or the deadline
    /// passes. Once bytes are present a brief follow-on wait coalesces the
    /// next chunk to reduce fragmentation.
    pub(crate) async fn wait_for_output(&self, yield_time_ms: u64) {
        let yield_ms = yield_time_ms.clamp(MIN_YIELD_MS, MAX_YIELD_MS);
        let deadline = Instant::now() + Duration::from_millis(yield_ms);

        loop {
            if self.pending_len() > 0 {
                let follow_on = self.notify.notified();
                let _ = tokio::time::timeout(
                    Duration::from_millis(FOLLOW_ON_WAIT_MS),
                    follow_on,
                )
                .await;
                return;
            }
            if self.exited() {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            let notified = self.notify.notified();
            // Re-check after arming the waiter so a chunk that landed between
            // the check and the await is not missed.
            if self.pending_len() > 0 || self.exited() {
                continue;
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }
}

/// CRLF → LF, strip control characters except newline and tab.
fn normalize_output(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    // CRLF collapses to LF on the next iteration.
                    continue;
                }
                out.push('\n');
            }
            '\n' | '\t' => out.push(ch),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// ShellSession
// ---------------------------------------------------------------------------

/// Handle to one live (or recently exited) shell session.
pub(crate) struct ShellSession {
    pub(crate) id: u64,
    pub(crate) command: String,
    pub(crate) shell: String,
    pub(crate) cwd: PathBuf,
    pub(crate) pid: Option<u32>,
    pub(crate) last_active: Instant,
    pub(crate) state: Arc<SessionState>,
    stdin: Option<tokio::process::ChildStdin>,
}

impl ShellSession {
    /// Spawn `<shell> -lc <cmd>` (or `-c` for non-login) with piped stdio
    /// and the request context exported as `SMA_CTX_*` env vars.
    pub(crate) fn spawn(
        id: u64,
        req: &ExecRequest,
        ctx: &RequestContext,
        project_root: &Path,
    ) -> Result<ShellSession> {
        let shell = req
            .shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/bash".to_string());

        let cwd = match &req.workdir {
            Some(dir) => {
                let p = Path::new(dir);
                if p.is_absolute() {
                    p.to_path_buf()
                } else {
                    project_root.join(p)
                }
            }
            None => project_root.to_path_buf(),
        };

        let flag = if req.login { "-lc" } else { "-c" };
        let mut cmd = Command::new(&shell);
        cmd.arg(flag)
            .arg(&req.command)
            .current_dir(&cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("LANG", "C.UTF-8")
            .env("LC_ALL", "C.UTF-8");
        for (key, value) in ctx.env_vars() {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ShellError::Spawn(format!("{shell} {flag}: {e}")))?;

        let pid = child.id();
        let state = Arc::new(SessionState::new());
        let stdin = child.stdin.take();

        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, Arc::clone(&state));
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, Arc::clone(&state));
        }

        // The wait task owns the child; the session keeps only the pid.
        let wait_state = Arc::clone(&state);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => wait_state.mark_exited(status.code()),
                Err(e) => {
                    warn!(error = %e, "shell session wait failed");
                    wait_state.mark_exited(None);
                }
            }
        });

        debug!(session = id, %shell, cwd = %cwd.display(), "shell session spawned");
        Ok(ShellSession {
            id,
            command: req.command.clone(),
            shell,
            cwd,
            pid,
            last_active: Instant::now(),
            state,
            stdin,
        })
    }

    /// Write `chars` to the child's stdin.
    pub(crate) async fn write_stdin(&mut self, chars: &str) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let stdin = self
            .stdin
            .as_mut()
            .ok_or(ShellError::StdinClosed { id: self.id })?;
        let wrote = async {
            stdin.write_all(chars.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if wrote.is_err() {
            // Pipe broke (child exited); drop our half so later calls fail fast.
            self.stdin = None;
            return Err(ShellError::StdinClosed { id: self.id });
        }
        Ok(())
    }

    /// Signal the child: SIGTERM, or SIGKILL when forced.
    pub(crate) fn kill(&self, force: bool) {
        if let Some(pid) = self.pid {
            let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
            unsafe {
                libc::kill(pid as libc::pid_t, sig);
            }
        }
    }

    /// Exited with nothing left to page out.
    pub(crate) fn drained(&self) -> bool {
        self.state.exited() && self.state.pending_len() == 0
    }
}

fn spawn_reader(
    mut stream: impl AsyncReadExt + Unpin + Send + 'static,
    state: Arc<SessionState>,
) {
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => state.push_output(&buf[..n]),
                Err(e) => {
                    warn!(error = %e, "shell session reader error");
                    break;
                }
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_control_and_crlf() {
        let raw = b"line one\r\nline\ttwo\x1b[31mred\x07\rthree";
        let out = normalize_output(raw);
        assert_eq!(out, "line one\nline\ttwo[31mred\nthree");
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let state = SessionState::new();
        state.push_output("a".repeat(MAX_CONTEXT_PENDING_CHARS).as_bytes());
        assert_eq!(state.dropped_chars(), 0);

        state.push_output(b"bbbb");
        assert_eq!(state.pending_len(), MAX_CONTEXT_PENDING_CHARS);
        assert_eq!(state.dropped_chars(), 4);

        // The tail of the buffer is the newest data.
        let (page, _) = state.take_page(PageBudget {
            max_chars: MAX_CONTEXT_PENDING_CHARS,
            max_lines: usize::MAX,
        });
        assert!(page.ends_with("bbbb"));
    }

    #[test]
    fn take_page_respects_char_budget() {
        let state = SessionState::new();
        state.push_output("x".repeat(100).as_bytes());
        let (page, has_more) = state.take_page(PageBudget {
            max_chars: 40,
            max_lines: 200,
        });
        assert_eq!(page.len(), 40);
        assert!(has_more);
        let (rest, has_more) = state.take_page(PageBudget {
            max_chars: 100,
            max_lines: 200,
        });
        assert_eq!(rest.len(), 60);
        assert!(!has_more);
    }

    #[test]
    fn take_page_respects_line_budget() {
        let state = SessionState::new();
        let text: String = (0..50).map(|i| format!("line {i}\n")).collect();
        state.push_output(text.as_bytes());
        let (page, has_more) = state.take_page(PageBudget {
            max_chars: 1_000_000,
            max_lines: 10,
        });
        assert_eq!(page.lines().count(), 10);
        assert!(page.ends_with('\n'));
        assert!(has_more);
    }

    #[tokio::test]
    async fn wait_returns_at_deadline_without_output() {
        let state = Arc::new(SessionState::new());
        let started = Instant::now();
        state.wait_for_output(0).await; // clamps to 50 ms
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(50), "{waited:?}");
        assert!(waited < Duration::from_secs(2), "{waited:?}");
    }

    #[tokio::test]
    async fn wait_wakes_on_output() {
        let state = Arc::new(SessionState::new());
        let waiter = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            waiter.wait_for_output(MAX_YIELD_MS).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        state.push_output(b"data");
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("waiter should wake promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_wakes_on_exit() {
        let state = Arc::new(SessionState::new());
        let waiter = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            waiter.wait_for_output(MAX_YIELD_MS).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        state.mark_exited(Some(0));
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("waiter should wake on exit")
            .unwrap();
    }
}
