//! Coarse progress reporting for long exports and imports.

use tracing::debug;

/// Logs at every 10% step of a known total.
pub(crate) struct Progress {
    what: &'static str,
    total: u64,
    done: u64,
    next_percent: u64,
}

impl Progress {
    pub(crate) fn new(what: &'static str, total: u64) -> Self {
        Self {
            what,
            total,
            done: 0,
            next_percent: 10,
        }
    }

    /// Add `n` units of work.
    pub(crate) fn advance(&mut self, n: u64) {
        self.set(self.done + n);
    }

    /// Set absolute progress (byte offset on import).
    pub(crate) fn set(&mut self, done: u64) {
        self.done = done;
        if self.total == 0 {
            return;
        }
        let percent = self.done.saturating_mul(100) / self.total;
        if percent >= self.next_percent {
            debug!(what = self.what, percent, done = self.done, total = self.total, "progress");
            self.next_percent = (percent / 10 + 1) * 10;
        }
    }

    pub(crate) fn percent(&self) -> u64 {
        if self.total == 0 {
            100
        } else {
            (self.done.saturating_mul(100) / self.total).min(100)
        }
    }
}
