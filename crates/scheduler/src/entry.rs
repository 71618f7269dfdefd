//! In-memory record of one submission.

use worker::WorkerHandle;

use crate::status::Status;

/// One instance of a requested experiment execution, owned exclusively by
/// its pipeline. Mutated only by the pipeline's three tasks and the
/// deleter.
pub(crate) struct Entry {
    pub(crate) rid: u64,
    pub(crate) pipeline: String,
    pub(crate) priority: i64,
    pub(crate) due_date: Option<f64>,
    pub(crate) flush: bool,
    pub(crate) expid: serde_json::Value,
    pub(crate) repo_msg: Option<serde_json::Value>,
    pub(crate) status: Status,
    pub(crate) termination_requested: bool,
    /// Taken out (and restored) by whichever task is driving the current
    /// phase, so the phase call can be awaited without holding the entries
    /// lock. `None` only while a phase call is in flight, or after the
    /// deleter has taken it for the final `close`.
    pub(crate) worker: Option<Box<dyn WorkerHandle>>,
    /// Sequence number assigned when the entry enters `run_done`, used by
    /// the analyze task to preserve FIFO arrival order. `None` until then.
    pub(crate) run_done_seq: Option<u64>,
}

impl Entry {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        rid: u64,
        pipeline: String,
        priority: i64,
        due_date: Option<f64>,
        flush: bool,
        expid: serde_json::Value,
        worker: Box<dyn WorkerHandle>,
    ) -> Self {
        Self {
            rid,
            pipeline,
            priority,
            due_date,
            flush,
            expid,
            repo_msg: None,
            status: Status::Pending,
            termination_requested: false,
            worker: Some(worker),
            run_done_seq: None,
        }
    }

    /// Whether this entry's `due_date` makes it ready to be prepared at
    /// `now` (seconds since epoch). A null due date is always ready.
    pub(crate) fn ready_at(&self, now: f64) -> bool {
        self.due_date.map(|due| due <= now).unwrap_or(true)
    }
}
