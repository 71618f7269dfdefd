//! One pipeline: a set of run entries sharing a hardware context, and the
//! three cooperating tasks (prepare, run, analyze) plus the deleter that
//! drive them through the status DAG.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use notifier::{Key, Notifier, Value};
use task::{labels::TaskLabels, TaskManager};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use worker::{ControlOracle, RunOutcome, WorkerFactory, WorkerHandle};

use crate::{
    entry::Entry,
    ordering::{outranks_for_run, prepare_order, run_order},
    status::Status,
};

/// Current wall-clock time, seconds since the epoch. The only clock source
/// the pipeline uses; `due_date` is meant to be a human-schedulable absolute
/// time, not a monotonic offset.
pub(crate) fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn entry_record(entry: &Entry) -> Value {
    let mut fields = HashMap::new();
    let _ = fields.insert(Key::Name("pipeline".into()), Value::String(entry.pipeline.clone()));
    let _ = fields.insert(Key::Name("status".into()), Value::String(entry.status.as_str().into()));
    let _ = fields.insert(Key::Name("priority".into()), Value::I64(entry.priority));
    let _ = fields.insert(Key::Name("expid".into()), Value::Opaque(entry.expid.clone()));
    let _ = fields.insert(
        Key::Name("due_date".into()),
        entry.due_date.map(Value::F64).unwrap_or(Value::Null),
    );
    let _ = fields.insert(Key::Name("flush".into()), Value::Bool(entry.flush));
    let _ = fields.insert(
        Key::Name("repo_msg".into()),
        entry.repo_msg.clone().map(Value::Opaque).unwrap_or(Value::Null),
    );
    Value::Object(fields)
}

/// A no-op task cleaner for pipeline loop tasks; cleanup is just a log line,
/// there is no per-task resource to release beyond what dropping handles.
#[derive(Debug)]
struct LoopCleaner {
    pipeline: String,
    loop_name: &'static str,
}

#[async_trait::async_trait]
impl task::TaskCleaner for LoopCleaner {
    async fn cleanup(&self) {
        debug!(pipeline = %self.pipeline, loop_name = %self.loop_name, "pipeline loop task joined");
    }
}

/// Owns a set of run entries and the tasks that drive them. Shared behind an
/// `Arc` by the four task kinds it spawns.
pub(crate) struct Pipeline {
    pub(crate) name: String,
    entries: Mutex<HashMap<u64, Entry>>,
    changed: Notify,
    stopping: AtomicBool,
    notifier: Notifier,
    factory: Arc<dyn WorkerFactory>,
    next_run_done_seq: AtomicU64,
}

impl Pipeline {
    pub(crate) fn new(name: String, notifier: Notifier, factory: Arc<dyn WorkerFactory>) -> Self {
        Self {
            name,
            entries: Mutex::new(HashMap::new()),
            changed: Notify::new(),
            stopping: AtomicBool::new(false),
            notifier,
            factory,
            next_run_done_seq: AtomicU64::new(0),
        }
    }

    /// Inserts a new entry in `pending` state and publishes its initial
    /// record. Wakes the prepare task.
    pub(crate) fn submit(
        &self,
        rid: u64,
        priority: i64,
        due_date: Option<f64>,
        flush: bool,
        expid: serde_json::Value,
    ) {
        let worker = self.factory.create();
        let entry = Entry::new(rid, self.name.clone(), priority, due_date, flush, expid, worker);
        let record = entry_record(&entry);

        {
            let mut entries = self.entries.lock().expect("entries lock poisoned");
            let _ = entries.insert(rid, entry);
        }
        if let Err(err) = self.notifier.set(&[], Key::Rid(rid), record) {
            warn!(%rid, error = %err, "failed to publish initial run entry record");
        }
        self.changed.notify_waiters();
    }

    /// Sets the (externally-resolved) repository message for an entry.
    /// A no-op if the rid is unknown or already gone.
    pub(crate) fn set_repo_msg(&self, rid: u64, value: serde_json::Value) -> bool {
        let found = {
            let mut entries = self.entries.lock().expect("entries lock poisoned");
            match entries.get_mut(&rid) {
                Some(entry) => {
                    entry.repo_msg = Some(value.clone());
                    true
                }
                None => false,
            }
        };
        if found {
            if let Err(err) = self
                .notifier
                .set(&[Key::Rid(rid)], Key::Name("repo_msg".into()), Value::Opaque(value))
            {
                warn!(%rid, error = %err, "failed to publish repo_msg update");
            }
        }
        found
    }

    /// Forces an entry straight to `deleting`, regardless of its current
    /// status, and spawns its deleter. Returns false if the rid is unknown.
    /// Also flags termination so a worker that is mid-phase notices via its
    /// next `check_termination` poll. If the worker is on loan to an
    /// in-flight phase call (the common case for a `running` entry), the
    /// deleter defers closing it until the owning loop hands it back,
    /// instead of skipping `close()` entirely.
    /// Requires `Arc<Self>` so it can hand itself to the spawned deleter,
    /// the same way the prepare/run/analyze loops do on phase
    /// failure/termination.
    pub(crate) fn delete(self: &Arc<Self>, rid: u64) -> bool {
        let transitioned = {
            let mut entries = self.entries.lock().expect("entries lock poisoned");
            match entries.get_mut(&rid) {
                Some(entry) if entry.status != Status::Deleting => {
                    entry.termination_requested = true;
                    entry.status = Status::Deleting;
                    Some(entry.worker.is_some())
                }
                Some(_) => None,
                None => return false,
            }
        };
        if let Some(worker_present) = transitioned {
            self.publish_status(rid, Status::Deleting);
            if worker_present {
                spawn_deleter(self, rid);
            } else {
                spawn_deferred_deleter(self, rid);
            }
        }
        self.changed.notify_waiters();
        true
    }

    /// Flags an entry for cooperative termination. A non-running entry is
    /// force-deleted immediately; a running one observes the flag at its
    /// next `check_termination` poll.
    pub(crate) fn request_termination(self: &Arc<Self>, rid: u64) -> bool {
        let should_force_delete = {
            let mut entries = self.entries.lock().expect("entries lock poisoned");
            match entries.get_mut(&rid) {
                Some(entry) => {
                    entry.termination_requested = true;
                    !matches!(entry.status, Status::Running | Status::Paused)
                }
                None => return false,
            }
        };
        self.changed.notify_waiters();
        if should_force_delete {
            self.delete(rid);
        }
        true
    }

    /// Flags every live entry for termination; used by `Scheduler::stop`.
    pub(crate) fn request_termination_all(self: &Arc<Self>) {
        let rids: Vec<u64> = {
            let mut entries = self.entries.lock().expect("entries lock poisoned");
            for entry in entries.values_mut() {
                entry.termination_requested = true;
            }
            entries.keys().copied().collect()
        };
        self.changed.notify_waiters();
        for rid in rids {
            let force = {
                let entries = self.entries.lock().expect("entries lock poisoned");
                entries
                    .get(&rid)
                    .map(|e| !matches!(e.status, Status::Running | Status::Paused))
                    .unwrap_or(false)
            };
            if force {
                let _ = self.delete(rid);
            }
        }
    }

    pub(crate) fn begin_stop(&self) {
        self.stopping.store(true, AtomicOrdering::Release);
        self.changed.notify_waiters();
    }

    pub(crate) fn contains(&self, rid: u64) -> bool {
        self.entries.lock().expect("entries lock poisoned").contains_key(&rid)
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.stopping.load(AtomicOrdering::Acquire) && self.entries.lock().expect("entries lock poisoned").is_empty()
    }

    fn publish_status(&self, rid: u64, status: Status) {
        debug!(pipeline = %self.name, %rid, status = %status, "run entry transitioned");
        if let Err(err) = self
            .notifier
            .set(&[Key::Rid(rid)], Key::Name("status".into()), Value::String(status.as_str().into()))
        {
            warn!(%rid, error = %err, "failed to publish status transition");
        }
    }

    /// Registers interest in the "pipeline state changed" condition, checks
    /// `predicate`, and waits only if it is still false. Registering before
    /// checking (rather than after) is what makes this race-free against a
    /// concurrent `notify_waiters` firing in between.
    async fn wait_until(&self, mut predicate: impl FnMut() -> bool) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if predicate() {
                return;
            }
            notified.await;
        }
    }

    /// As `wait_until`, but also returns (with `true`) once `deadline`
    /// elapses, even if `predicate` never became true.
    async fn wait_until_or_deadline(&self, deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if predicate() {
                return true;
            }
            tokio::select! {
                _ = &mut notified => continue,
                () = tokio::time::sleep(deadline) => return false,
            }
        }
    }

    /// Runs one phase call on `rid`'s worker without holding the entries
    /// lock across the `.await`: the worker is taken out, the call is made,
    /// and the worker is put back before this returns.
    async fn with_worker<F, Fut, T>(&self, rid: u64, call: F) -> Option<T>
    where
        F: FnOnce(Box<dyn WorkerHandle>) -> Fut,
        Fut: std::future::Future<Output = (Box<dyn WorkerHandle>, T)>,
    {
        let worker = {
            let mut entries = self.entries.lock().expect("entries lock poisoned");
            entries.get_mut(&rid).and_then(|entry| entry.worker.take())
        }?;

        let (worker, result) = call(worker).await;

        {
            let mut entries = self.entries.lock().expect("entries lock poisoned");
            if let Some(entry) = entries.get_mut(&rid) {
                entry.worker = Some(worker);
            }
        }
        // A deferred deleter may be waiting on exactly this worker becoming
        // available again (see `spawn_deferred_deleter`).
        self.changed.notify_waiters();
        Some(result)
    }

    /// Whether `rid` has already been forced to `deleting` by an external
    /// `delete()` call. A phase loop checks this right after a phase call
    /// returns, to avoid re-transitioning the entry or spawning a second
    /// deleter when a force-delete raced with its in-flight call.
    fn already_deleting(&self, rid: u64) -> bool {
        let entries = self.entries.lock().expect("entries lock poisoned");
        entries.get(&rid).map(|entry| entry.status == Status::Deleting).unwrap_or(true)
    }

    fn set_status(&self, rid: u64, status: Status) {
        {
            let mut entries = self.entries.lock().expect("entries lock poisoned");
            if let Some(entry) = entries.get_mut(&rid) {
                entry.status = status;
            }
        }
        self.publish_status(rid, status);
        self.changed.notify_waiters();
    }

    fn mark_failed(&self, rid: u64, phase: &'static str, err: &worker::Error) {
        error!(pipeline = %self.name, %rid, phase, error = %err, "worker phase failed");
        self.set_status(rid, Status::Deleting);
    }
}

impl ControlOracle for Pipeline {
    fn should_pause(&self, rid: u64) -> bool {
        let entries = self.entries.lock().expect("entries lock poisoned");
        let Some(this) = entries.get(&rid) else {
            return true;
        };
        if this.termination_requested {
            return true;
        }
        entries.values().any(|other| {
            other.rid != rid
                && matches!(other.status, Status::PrepareDone | Status::Paused)
                && outranks_for_run(other, this)
        })
    }

    fn should_terminate(&self, rid: u64) -> bool {
        let entries = self.entries.lock().expect("entries lock poisoned");
        entries.get(&rid).map(|e| e.termination_requested).unwrap_or(true)
    }
}

/// Spawns the four long-lived task kinds for `pipeline` and registers them
/// with `task_manager`. The deleter is spawned per-entry, on demand, inside
/// the other three loops whenever an entry reaches `deleting`.
pub(crate) fn spawn(pipeline: Arc<Pipeline>, task_manager: &mut TaskManager) {
    spawn_loop(pipeline.clone(), task_manager, "prepare", prepare_loop);
    spawn_loop(pipeline.clone(), task_manager, "run", run_loop);
    spawn_loop(pipeline, task_manager, "analyze", analyze_loop);
}

fn spawn_loop<F, Fut>(pipeline: Arc<Pipeline>, task_manager: &mut TaskManager, name: &'static str, body: F)
where
    F: FnOnce(Arc<Pipeline>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let pipeline_name = pipeline.name.clone();
    let handle = tokio::task::spawn(async move {
        body(pipeline).await;
        Box::new(LoopCleaner {
            pipeline: pipeline_name,
            loop_name: name,
        }) as Box<dyn task::TaskCleaner>
    });
    task_manager.register(handle, &TaskLabels::new(name, &pipeline.name, "scheduler"));
}

async fn prepare_loop(pipeline: Arc<Pipeline>) {
    loop {
        let now = now_secs();
        let decision = {
            let entries = pipeline.entries.lock().expect("entries lock poisoned");
            pick_to_prepare(&entries, now)
        };

        match decision {
            PrepareDecision::Ready(rid) => run_prepare_phase(&pipeline, rid).await,
            PrepareDecision::SleepUntil(due) => {
                let delay = Duration::from_secs_f64((due - now_secs()).max(0.0));
                let _ = pipeline
                    .wait_until_or_deadline(delay, || {
                        let entries = pipeline.entries.lock().expect("entries lock poisoned");
                        !matches!(pick_to_prepare(&entries, now_secs()), PrepareDecision::SleepUntil(d) if d == due)
                    })
                    .await;
            }
            PrepareDecision::Idle => {
                if pipeline.is_drained() {
                    return;
                }
                pipeline
                    .wait_until(|| {
                        let entries = pipeline.entries.lock().expect("entries lock poisoned");
                        !matches!(pick_to_prepare(&entries, now_secs()), PrepareDecision::Idle) || pipeline.is_drained()
                    })
                    .await;
            }
        }
    }
}

enum PrepareDecision {
    Ready(u64),
    SleepUntil(f64),
    Idle,
}

fn pick_to_prepare(entries: &HashMap<u64, Entry>, now: f64) -> PrepareDecision {
    let mut candidates: Vec<&Entry> = entries
        .values()
        .filter(|e| e.status == Status::Pending && e.ready_at(now))
        .collect();
    candidates.sort_by(|a, b| prepare_order(a, b));
    if let Some(entry) = candidates.first() {
        return PrepareDecision::Ready(entry.rid);
    }

    let earliest_future_due = entries
        .values()
        .filter(|e| e.status == Status::Pending)
        .filter_map(|e| e.due_date)
        .filter(|due| *due > now)
        .fold(None, |acc: Option<f64>, due| Some(acc.map_or(due, |a| a.min(due))));

    match earliest_future_due {
        Some(due) => PrepareDecision::SleepUntil(due),
        None => PrepareDecision::Idle,
    }
}

async fn run_prepare_phase(pipeline: &Arc<Pipeline>, rid: u64) {
    let flush = {
        let entries = pipeline.entries.lock().expect("entries lock poisoned");
        entries.get(&rid).map(|e| e.flush).unwrap_or(false)
    };

    if flush {
        pipeline.set_status(rid, Status::Flushing);
        pipeline
            .wait_until(|| {
                let entries = pipeline.entries.lock().expect("entries lock poisoned");
                entries.get(&rid).map(|e| e.status != Status::Flushing).unwrap_or(true)
                    || !entries.values().any(|other| {
                        other.rid != rid
                            && matches!(
                                other.status,
                                Status::Preparing
                                    | Status::PrepareDone
                                    | Status::Running
                                    | Status::Paused
                                    | Status::RunDone
                                    | Status::Analyzing
                            )
                    })
            })
            .await;
        if pipeline.already_deleting(rid) {
            return;
        }
    }

    pipeline.set_status(rid, Status::Preparing);

    let expid = {
        let entries = pipeline.entries.lock().expect("entries lock poisoned");
        entries.get(&rid).map(|e| e.expid.clone()).unwrap_or(serde_json::Value::Null)
    };

    let build_result = pipeline
        .with_worker(rid, move |mut worker| async move {
            let result = worker.build(rid, expid).await;
            (worker, result)
        })
        .await;

    if pipeline.already_deleting(rid) {
        return;
    }

    let prepare_result = match build_result {
        Some(Ok(())) => {
            pipeline
                .with_worker(rid, move |mut worker| async move {
                    let result = worker.prepare().await;
                    (worker, result)
                })
                .await
        }
        Some(Err(err)) => Some(Err(err)),
        None => return,
    };

    if pipeline.already_deleting(rid) {
        return;
    }

    match prepare_result {
        Some(Ok(())) => pipeline.set_status(rid, Status::PrepareDone),
        Some(Err(err)) => {
            pipeline.mark_failed(rid, "prepare", &err);
            spawn_deleter(pipeline, rid);
        }
        None => {}
    }
}

async fn run_loop(pipeline: Arc<Pipeline>) {
    loop {
        let candidate = {
            let entries = pipeline.entries.lock().expect("entries lock poisoned");
            pick_to_run(&entries)
        };

        let Some(rid) = candidate else {
            if pipeline.is_drained() {
                return;
            }
            pipeline
                .wait_until(|| {
                    let entries = pipeline.entries.lock().expect("entries lock poisoned");
                    pick_to_run(&entries).is_some() || pipeline.is_drained()
                })
                .await;
            continue;
        };

        pipeline.set_status(rid, Status::Running);

        let oracle = pipeline.clone();
        let outcome = pipeline
            .with_worker(rid, move |mut worker| async move {
                let result = worker.run(oracle.as_ref()).await;
                (worker, result)
            })
            .await;

        if pipeline.already_deleting(rid) {
            continue;
        }

        match outcome {
            Some(Ok(RunOutcome::Completed)) => {
                let seq = pipeline.next_run_done_seq.fetch_add(1, AtomicOrdering::Relaxed);
                {
                    let mut entries = pipeline.entries.lock().expect("entries lock poisoned");
                    if let Some(entry) = entries.get_mut(&rid) {
                        entry.run_done_seq = Some(seq);
                    }
                }
                pipeline.set_status(rid, Status::RunDone);
            }
            Some(Ok(RunOutcome::Paused)) => pipeline.set_status(rid, Status::Paused),
            Some(Ok(RunOutcome::Terminated)) => {
                info!(pipeline = %pipeline.name, %rid, "run terminated cooperatively");
                pipeline.set_status(rid, Status::Deleting);
                spawn_deleter(&pipeline, rid);
            }
            Some(Err(err)) => {
                pipeline.mark_failed(rid, "run", &err);
                spawn_deleter(&pipeline, rid);
            }
            None => {}
        }
    }
}

fn pick_to_run(entries: &HashMap<u64, Entry>) -> Option<u64> {
    let mut candidates: Vec<&Entry> = entries
        .values()
        .filter(|e| matches!(e.status, Status::PrepareDone | Status::Paused))
        .collect();
    candidates.sort_by(|a, b| run_order(a, b));
    candidates.first().map(|e| e.rid)
}

async fn analyze_loop(pipeline: Arc<Pipeline>) {
    loop {
        let candidate = {
            let entries = pipeline.entries.lock().expect("entries lock poisoned");
            pick_to_analyze(&entries)
        };

        let Some(rid) = candidate else {
            if pipeline.is_drained() {
                return;
            }
            pipeline
                .wait_until(|| {
                    let entries = pipeline.entries.lock().expect("entries lock poisoned");
                    pick_to_analyze(&entries).is_some() || pipeline.is_drained()
                })
                .await;
            continue;
        };

        // Claim it immediately so it is not picked again while the analyze
        // call for it runs concurrently with later iterations of this loop.
        pipeline.set_status(rid, Status::Analyzing);

        let pipeline = pipeline.clone();
        let _ = tokio::task::spawn(async move {
            let result = pipeline
                .with_worker(rid, move |mut worker| async move {
                    let result = worker.analyze().await;
                    (worker, result)
                })
                .await;

            if pipeline.already_deleting(rid) {
                return;
            }

            match result {
                Some(Ok(())) => pipeline.set_status(rid, Status::Deleting),
                Some(Err(err)) => pipeline.mark_failed(rid, "analyze", &err),
                None => return,
            }
            spawn_deleter(&pipeline, rid);
        });
    }
}

fn pick_to_analyze(entries: &HashMap<u64, Entry>) -> Option<u64> {
    entries
        .values()
        .filter(|e| e.status == Status::RunDone)
        .min_by_key(|e| e.run_done_seq.unwrap_or(u64::MAX))
        .map(|e| e.rid)
}

/// Spawns the short-lived, per-entry deleter: closes the worker (tolerating
/// failure) and removes the entry from the notifier. Multiple deleters may
/// run concurrently across a pipeline.
fn spawn_deleter(pipeline: &Arc<Pipeline>, rid: u64) {
    let pipeline = pipeline.clone();
    let _ = tokio::task::spawn(async move { close_and_remove(&pipeline, rid).await });
}

/// As [`spawn_deleter`], but first waits until the entry's worker is handed
/// back by whichever phase call currently holds it on loan. Used when an
/// entry is force-deleted while a phase call (most commonly `run`) is
/// in-flight: the worker cannot be taken and closed immediately, but it must
/// still be closed once the owning loop returns it, rather than silently
/// dropped.
fn spawn_deferred_deleter(pipeline: &Arc<Pipeline>, rid: u64) {
    let pipeline = pipeline.clone();
    let _ = tokio::task::spawn(async move {
        pipeline
            .wait_until(|| {
                let entries = pipeline.entries.lock().expect("entries lock poisoned");
                entries.get(&rid).map(|entry| entry.worker.is_some()).unwrap_or(true)
            })
            .await;
        close_and_remove(&pipeline, rid).await;
    });
}

async fn close_and_remove(pipeline: &Arc<Pipeline>, rid: u64) {
    let worker = {
        let mut entries = pipeline.entries.lock().expect("entries lock poisoned");
        entries.get_mut(&rid).and_then(|entry| entry.worker.take())
    };

    if let Some(mut worker) = worker {
        worker.close().await;
    }

    {
        let mut entries = pipeline.entries.lock().expect("entries lock poisoned");
        let _ = entries.remove(&rid);
    }
    if let Err(err) = pipeline.notifier.delete(&[], Key::Rid(rid)) {
        warn!(%rid, error = %err, "failed to publish run entry removal");
    }
    debug!(pipeline = %pipeline.name, %rid, "run entry deleted");
    pipeline.changed.notify_waiters();
}
