//! The run entry status DAG.

use std::fmt::{Display, Formatter};

/// The lifecycle status of a run entry. See the module-level DAG in
/// [`crate`] for the transitions each status permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Status {
    /// Waiting to be selected for preparation.
    Pending,
    /// Selected, but waiting for the pipeline to drain before preparing
    /// (only reachable when the entry's `flush` flag is set).
    Flushing,
    /// The worker is constructing and preparing the experiment.
    Preparing,
    /// Prepared; waiting to be selected to run.
    PrepareDone,
    /// The worker is running the experiment.
    Running,
    /// The worker voluntarily yielded at a pause point; waiting to resume.
    Paused,
    /// The run phase completed; waiting to be analyzed.
    RunDone,
    /// The worker is analyzing the experiment's results.
    Analyzing,
    /// Terminal: awaiting worker close and removal from the notifier.
    Deleting,
}

impl Status {
    /// The exact wire string used in notifier change records, matching the
    /// submission record's `status` field.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Flushing => "flushing",
            Status::Preparing => "preparing",
            Status::PrepareDone => "prepare_done",
            Status::Running => "running",
            Status::Paused => "paused",
            Status::RunDone => "run_done",
            Status::Analyzing => "analyzing",
            Status::Deleting => "deleting",
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_strings_match_spec() {
        assert_eq!(Status::Pending.as_str(), "pending");
        assert_eq!(Status::Flushing.as_str(), "flushing");
        assert_eq!(Status::Preparing.as_str(), "preparing");
        assert_eq!(Status::PrepareDone.as_str(), "prepare_done");
        assert_eq!(Status::Running.as_str(), "running");
        assert_eq!(Status::Paused.as_str(), "paused");
        assert_eq!(Status::RunDone.as_str(), "run_done");
        assert_eq!(Status::Analyzing.as_str(), "analyzing");
        assert_eq!(Status::Deleting.as_str(), "deleting");
    }
}
