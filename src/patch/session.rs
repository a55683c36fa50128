/*
 * SPDX-FileCopyrightText: 2024-2026 bootpatch contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Process-wide install session exclusivity and the per-session output sinks.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Exclusivity token for the one active install session. At most one may
/// exist process-wide; a second acquire while one is held fails immediately
/// with no blocking or queuing. The token is released when the guard is
/// dropped, on every exit path.
#[derive(Debug)]
pub struct SessionGuard(());

impl SessionGuard {
    pub fn acquire() -> Option<Self> {
        SESSION_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
            .then_some(Self(()))
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        SESSION_ACTIVE.store(false, Ordering::SeqCst);
    }
}

/// Single-writer, append-only output sinks for one session: a human-readable
/// console transcript and a diagnostic log. Only the active session's worker
/// appends, so no locking is needed.
#[derive(Debug, Default)]
pub struct Console {
    console: Vec<String>,
    log: Vec<String>,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line to the console transcript.
    pub fn say(&mut self, line: impl Into<String>) {
        let line = line.into();
        info!("{line}");
        self.console.push(line);
    }

    /// Append a line to the diagnostic log.
    pub fn log(&mut self, line: impl Into<String>) {
        let line = line.into();
        debug!("{line}");
        self.log.push(line);
    }

    pub fn into_parts(self) -> (Vec<String>, Vec<String>) {
        (self.console, self.log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusivity() {
        let first = SessionGuard::acquire().unwrap();
        assert!(SessionGuard::acquire().is_none());

        drop(first);
        let second = SessionGuard::acquire().unwrap();
        drop(second);
    }

    #[test]
    fn sinks_are_ordered() {
        let mut console = Console::new();
        console.say("a");
        console.log("detail");
        console.say("b");

        let (console, log) = console.into_parts();
        assert_eq!(console, ["a", "b"]);
        assert_eq!(log, ["detail"]);
    }
}
