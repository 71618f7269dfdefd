#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Definition of the `WorkerHandle` trait: the seam between the scheduling
//! core and the (out of scope) subprocess that constructs, prepares, runs,
//! and analyzes one experiment. The core never talks to a subprocess
//! directly; it only calls through this trait, playing the same role that
//! async receiver/exporter traits play elsewhere: one object-safe trait per
//! external collaborator, with a factory to construct a fresh instance per
//! unit of work.

use async_trait::async_trait;

/// All the errors a worker phase can fail with.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The prepare phase failed.
    #[error("preparation failed (reason: {reason})")]
    PreparationFailed {
        /// The error reported by the worker.
        reason: String,
    },

    /// The run phase failed.
    #[error("run failed (reason: {reason})")]
    RunFailed {
        /// The error reported by the worker.
        reason: String,
    },

    /// The analyze phase failed.
    #[error("analysis failed (reason: {reason})")]
    AnalysisFailed {
        /// The error reported by the worker.
        reason: String,
    },

    /// The worker process died unexpectedly.
    #[error("worker died (reason: {reason})")]
    WorkerDied {
        /// The error reported by the worker, if any was observed.
        reason: String,
    },
}

/// Queried by a worker, cooperatively, while its experiment is running.
/// Implemented by the scheduler; answering must never suspend.
pub trait ControlOracle: Send + Sync {
    /// Returns true if the given run should yield at its next pause point.
    fn should_pause(&self, rid: u64) -> bool;
    /// Returns true if the given run should terminate at its next pause
    /// point.
    fn should_terminate(&self, rid: u64) -> bool;
}

/// The outcome of a single call to `WorkerHandle::run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum RunOutcome {
    /// The experiment reached its natural end.
    Completed,
    /// The experiment voluntarily yielded at a pause point; a later call to
    /// `run` resumes it.
    Paused,
    /// The experiment observed a termination request and shut down
    /// cooperatively.
    Terminated,
}

/// Mediates one experiment process through its full lifecycle. A single
/// instance is created per submission by a `WorkerFactory` and is driven
/// exclusively by its owning pipeline's tasks.
#[async_trait]
pub trait WorkerHandle: Send {
    /// Hands off the run identifier and the opaque experiment descriptor.
    /// Returns once the worker has constructed the experiment.
    async fn build(&mut self, rid: u64, expid: serde_json::Value) -> Result<(), Error>;

    /// Executes the prepare phase.
    async fn prepare(&mut self) -> Result<(), Error>;

    /// Executes (or resumes) the run phase, returning when the experiment
    /// reaches a pause point, completes, or terminates.
    async fn run(&mut self, oracle: &dyn ControlOracle) -> Result<RunOutcome, Error>;

    /// Executes the analyze phase.
    async fn analyze(&mut self) -> Result<(), Error>;

    /// Tears the worker down. Idempotent; failures are logged, never
    /// propagated — the deleter must make progress regardless.
    async fn close(&mut self);
}

/// Constructs a fresh `WorkerHandle` for each submission.
pub trait WorkerFactory: Send + Sync {
    /// Creates a new, unbuilt worker handle.
    fn create(&self) -> Box<dyn WorkerHandle>;
}
