//! Forked-process handle and cookie-based tree kill
//!
//! Every forked child carries a unique cookie in its environment,
//! inherited by everything it spawns. Killing a task therefore means
//! killing every process whose environment carries the cookie, not
//! just the immediate child; a shell script that forked its own
//! children leaves nothing behind.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Environment variable carrying the per-task kill cookie
pub const COOKIE_ENV: &str = "TASKLINE_COOKIE";

/// Shared handle on a spawned task process
///
/// Cheap to clone; the supervisor keeps one and the node registry may
/// keep another. Termination through any clone is observed by all of
/// them, and killing an already-terminated handle is a no-op.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    cookie: String,
    grace: Duration,
    terminated: Arc<AtomicBool>,
}

impl ProcessHandle {
    /// Wraps a freshly spawned process; `grace` is the window between
    /// a termination request and the forced tree kill
    #[must_use]
    pub fn new(pid: u32, cookie: impl Into<String>, grace: Duration) -> Self {
        Self {
            pid,
            cookie: cookie.into(),
            grace,
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Operating-system process id of the direct child
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The kill cookie injected into the child's environment
    #[must_use]
    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    /// Records that the process exited on its own; later kills become
    /// no-ops
    pub fn mark_terminated(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    /// True once the process exited or was killed
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Asks the process to exit, waits up to the grace period, then
    /// force-kills whatever is left of the tree
    pub fn terminate(&self) {
        if self.is_terminated() {
            return;
        }
        tracing::info!(pid = self.pid, "Requesting task process termination");
        request_exit(self.pid);
        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            if !is_alive(self.pid) {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        self.kill_tree();
    }

    /// Kills the direct child and every descendant still carrying the
    /// cookie
    ///
    /// Idempotent: a handle already marked terminated does nothing, and
    /// signals to processes that are already gone are ignored.
    pub fn kill_tree(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(pid = self.pid, cookie = %self.cookie, "Killing task process tree");
        kill_by_pid(self.pid);
        kill_by_cookie(&self.cookie);
    }

    /// Kills every descendant still carrying the cookie, leaving the
    /// direct child alone
    ///
    /// Runs even after the child exited normally: a script that
    /// backgrounded its own children leaves them holding the cookie
    /// (and the output pipes) past the child's exit.
    pub fn sweep_descendants(&self) {
        kill_by_cookie(&self.cookie);
    }
}

#[cfg(unix)]
fn request_exit(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn request_exit(pid: u32) {
    tracing::warn!(pid, "Graceful termination is not supported on this platform");
}

#[cfg(unix)]
fn is_alive(pid: u32) -> bool {
    // Signal 0 probes for existence without delivering anything.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn is_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn kill_by_pid(pid: u32) {
    // The process may have exited between our check and the signal;
    // ESRCH is the expected answer then.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_by_pid(pid: u32) {
    tracing::warn!(pid, "Process kill is not supported on this platform");
}

/// Scans the process table for descendants carrying the cookie and
/// kills each one
#[cfg(unix)]
fn kill_by_cookie(cookie: &str) {
    let needle = format!("{COOKIE_ENV}={cookie}");
    let Ok(entries) = std::fs::read_dir("/proc") else {
        tracing::warn!("Could not scan /proc for cookie descendants");
        return;
    };

    let own_pid = std::process::id();
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        if pid == own_pid {
            continue;
        }
        // environ entries are NUL-separated; a plain byte search finds
        // the cookie without decoding.
        let environ_path = entry.path().join("environ");
        let Ok(environ) = std::fs::read(&environ_path) else {
            continue;
        };
        if environ
            .split(|b| *b == 0)
            .any(|entry| entry == needle.as_bytes())
        {
            tracing::debug!(pid, cookie, "Killing cookie descendant");
            kill_by_pid(pid);
        }
    }
}

#[cfg(not(unix))]
fn kill_by_cookie(cookie: &str) {
    tracing::warn!(cookie, "Cookie tree kill is not supported on this platform");
}
