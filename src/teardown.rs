//! Resource-acquisition ledger.
//!
//! Each acquired resource pushes a release action. [`TeardownStack::run`]
//! executes the actions in reverse order exactly once; dropping a stack that
//! was never run executes them then, so early returns and panics unwinding
//! through the launcher still release everything.
//!
//! Release actions report failures instead of panicking. A failure is
//! logged and the remaining actions still run.

use crate::error::Result;
use tracing::{debug, warn};

type ReleaseFn = Box<dyn FnOnce() -> Result<()> + Send>;

/// Reverse-order, run-once cleanup stack.
#[derive(Default)]
pub struct TeardownStack {
    entries: Vec<(String, ReleaseFn)>,
    ran: bool,
}

/// Outcome of a teardown run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    /// Labels released successfully, in execution order.
    pub released: Vec<String>,
    /// Labels whose release failed, with the error message.
    pub failed: Vec<(String, String)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl TeardownStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a release action for a resource that now exists.
    pub fn push<F>(&mut self, label: impl Into<String>, release: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let label = label.into();
        debug!(resource = %label, "resource acquired");
        self.entries.push((label, Box::new(release)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs every recorded action, newest first. Later calls do nothing.
    pub fn run(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.ran {
            return report;
        }
        self.ran = true;

        while let Some((label, release)) = self.entries.pop() {
            match release() {
                Ok(()) => {
                    debug!(resource = %label, "resource released");
                    report.released.push(label);
                }
                Err(e) => {
                    warn!(resource = %label, error = %e, "failed to release resource");
                    report.failed.push((label, e.to_string()));
                }
            }
        }
        report
    }
}

impl Drop for TeardownStack {
    fn drop(&mut self) {
        if !self.ran && !self.entries.is_empty() {
            debug!(pending = self.entries.len(), "teardown stack dropped without run");
            self.run();
        }
    }
}

impl std::fmt::Debug for TeardownStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeardownStack")
            .field("entries", &self.entries.iter().map(|(l, _)| l).collect::<Vec<_>>())
            .field("ran", &self.ran)
            .finish()
    }
}
