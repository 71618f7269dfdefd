//! Top-level coordinator: creates pipelines lazily, allocates run
//! identifiers, routes submissions, and orchestrates startup/shutdown.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use config::SchedulerConfig;
use notifier::Notifier;
use task::TaskManager;
use tracing::info;
use worker::WorkerFactory;

use crate::pipeline::{self, Pipeline};

/// Errors reported to callers of the scheduler's public API. Phase failures
/// (preparation/run/analysis/worker death) are not represented here; they
/// are only observable through the notifier's status stream.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// No live entry has this run identifier.
    #[error("unknown run identifier {rid}")]
    UnknownRid {
        /// The run identifier that was looked up.
        rid: u64,
    },

    /// `submit` was called after `stop` had already been initiated.
    #[error("scheduler is shutting down, no new submissions accepted")]
    ShuttingDown,
}

/// The scheduling core's public entry point. Cheaply cloneable; every clone
/// shares the same pipelines, rid source, and notifier.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    notifier: Notifier,
    factory: Arc<dyn WorkerFactory>,
    pipelines: Mutex<HashMap<String, Arc<Pipeline>>>,
    task_manager: Mutex<TaskManager>,
    next_rid: AtomicU64,
    stopping: AtomicBool,
}

impl Scheduler {
    /// Creates a new scheduler. `factory` constructs the worker handle for
    /// every submission, regardless of which pipeline it lands on.
    pub fn new(config: SchedulerConfig, notifier: Notifier, factory: Arc<dyn WorkerFactory>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                notifier,
                factory,
                pipelines: Mutex::new(HashMap::new()),
                task_manager: Mutex::new(TaskManager::new()),
                next_rid: AtomicU64::new(0),
                stopping: AtomicBool::new(false),
            }),
        }
    }

    /// A read-only handle to the notifier backing this scheduler's state.
    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    /// Launches task machinery for every pipeline created so far. Pipelines
    /// created later (via `submit`) spawn their own tasks immediately.
    pub fn start(&self) {
        info!("starting scheduler");
        let pipelines = self.inner.pipelines.lock().expect("pipelines lock poisoned");
        let mut task_manager = self.inner.task_manager.lock().expect("task manager lock poisoned");
        for pipeline in pipelines.values() {
            pipeline::spawn(pipeline.clone(), &mut task_manager);
        }
    }

    /// Submits a new experiment to `pipeline`, creating it if this is its
    /// first submission. Returns the freshly-allocated run identifier.
    /// `priority` defaults to `config.default_priority` when `None`.
    pub fn submit(
        &self,
        pipeline: &str,
        expid: serde_json::Value,
        priority: Option<i64>,
        due_date: Option<f64>,
        flush: bool,
    ) -> Result<u64, Error> {
        if self.inner.stopping.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }

        let priority = priority.unwrap_or(self.inner.config.default_priority);
        let rid = self.inner.next_rid.fetch_add(1, Ordering::Relaxed);
        let pipeline = self.pipeline_for(pipeline);
        pipeline.submit(rid, priority, due_date, flush, expid);
        info!(%rid, pipeline = %pipeline.name, priority, "submitted");
        Ok(rid)
    }

    /// Returns the named pipeline, creating (and, if the scheduler has
    /// already started, spawning) it on first reference.
    fn pipeline_for(&self, name: &str) -> Arc<Pipeline> {
        let mut pipelines = self.inner.pipelines.lock().expect("pipelines lock poisoned");
        if let Some(pipeline) = pipelines.get(name) {
            return pipeline.clone();
        }

        let pipeline = Arc::new(Pipeline::new(name.to_string(), self.inner.notifier.clone(), self.inner.factory.clone()));
        let mut task_manager = self.inner.task_manager.lock().expect("task manager lock poisoned");
        pipeline::spawn(pipeline.clone(), &mut task_manager);
        let _ = pipelines.insert(name.to_string(), pipeline.clone());
        pipeline
    }

    /// Externally resolved repository message for `rid`, surfaced via the
    /// notifier without the core interpreting it.
    pub fn set_repo_msg(&self, rid: u64, value: serde_json::Value) -> Result<(), Error> {
        self.for_pipeline_with_rid(rid, |pipeline| pipeline.set_repo_msg(rid, value.clone()))
    }

    /// Transitions `rid` straight to `deleting`, regardless of its current
    /// status.
    pub fn delete(&self, rid: u64) -> Result<(), Error> {
        self.for_pipeline_with_rid(rid, |pipeline| pipeline.delete(rid))
    }

    /// Flags `rid` for cooperative termination.
    pub fn request_termination(&self, rid: u64) -> Result<(), Error> {
        self.for_pipeline_with_rid(rid, |pipeline| pipeline.request_termination(rid))
    }

    /// Host-side query served to a worker: should the run currently in
    /// progress for `rid` yield at its next pause point?
    pub fn check_pause(&self, rid: u64) -> Result<bool, Error> {
        self.find_pipeline_with_rid(rid)
            .map(|pipeline| worker::ControlOracle::should_pause(pipeline.as_ref(), rid))
    }

    /// Host-side query served to a worker: should the run currently in
    /// progress for `rid` terminate at its next pause point?
    pub fn check_termination(&self, rid: u64) -> Result<bool, Error> {
        self.find_pipeline_with_rid(rid)
            .map(|pipeline| worker::ControlOracle::should_terminate(pipeline.as_ref(), rid))
    }

    /// Begins shutdown: flags every live entry for termination, then waits
    /// (bounded by `shutdown_grace_ms`) for every pipeline task to join.
    /// Returns even if some worker close calls are still outstanding; worker
    /// close is best-effort and authoritative regardless.
    pub async fn stop(&self) {
        info!("stopping scheduler");
        self.inner.stopping.store(true, Ordering::Release);

        let pipelines: Vec<Arc<Pipeline>> = self
            .inner
            .pipelines
            .lock()
            .expect("pipelines lock poisoned")
            .values()
            .cloned()
            .collect();
        for pipeline in &pipelines {
            pipeline.begin_stop();
            pipeline.request_termination_all();
        }

        let task_manager = self.inner.task_manager.lock().expect("task manager lock poisoned").clone();
        let grace = std::time::Duration::from_millis(self.inner.config.shutdown_grace_ms);
        if tokio::time::timeout(grace, task_manager.join()).await.is_err() {
            tracing::warn!("shutdown grace period elapsed with pipeline tasks still joining");
        }
    }

    fn find_pipeline_with_rid(&self, rid: u64) -> Result<Arc<Pipeline>, Error> {
        let pipelines = self.inner.pipelines.lock().expect("pipelines lock poisoned");
        pipelines
            .values()
            .find(|pipeline| pipeline.contains(rid))
            .cloned()
            .ok_or(Error::UnknownRid { rid })
    }

    fn for_pipeline_with_rid(&self, rid: u64, op: impl FnOnce(&Arc<Pipeline>) -> bool) -> Result<(), Error> {
        let pipeline = self.find_pipeline_with_rid(rid)?;
        if op(&pipeline) {
            Ok(())
        } else {
            Err(Error::UnknownRid { rid })
        }
    }
}
