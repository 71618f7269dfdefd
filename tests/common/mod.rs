use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use notifier::ChangeRecord;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use worker::{ControlOracle, Error, RunOutcome, WorkerFactory, WorkerHandle};

/// Initializes tracing for a test process. Safe to call more than once; only
/// the first call actually installs a subscriber.
pub fn init() {
    static INSTALLED: std::sync::Once = std::sync::Once::new();
    INSTALLED.call_once(|| {
        let subscriber = FmtSubscriber::builder().with_max_level(Level::DEBUG).finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// A fake worker whose behavior is picked from its `expid`'s `"kind"` field
/// at `build` time: the scheduling core never interprets `expid`, but the
/// (external, test-only) worker is free to.
///
/// Recognized kinds: `"empty"` (completes the run phase immediately, the
/// default), `"background"` (loops, cooperatively honoring pause and
/// termination via the `ControlOracle`), `"fail_prepare"`, `"fail_run"`,
/// `"fail_analyze"` (fail the named phase once).
pub struct FakeWorker {
    rid: u64,
    kind: String,
    poll_interval: Duration,
    termination_ok: Arc<AtomicBool>,
    close_count: Arc<AtomicU64>,
}

impl FakeWorker {
    fn new(poll_interval: Duration, termination_ok: Arc<AtomicBool>, close_count: Arc<AtomicU64>) -> Self {
        Self {
            rid: 0,
            kind: "empty".to_string(),
            poll_interval,
            termination_ok,
            close_count,
        }
    }
}

#[async_trait]
impl WorkerHandle for FakeWorker {
    async fn build(&mut self, rid: u64, expid: serde_json::Value) -> Result<(), Error> {
        self.rid = rid;
        self.kind = expid.get("kind").and_then(|v| v.as_str()).unwrap_or("empty").to_string();
        Ok(())
    }

    async fn prepare(&mut self) -> Result<(), Error> {
        if self.kind == "fail_prepare" {
            return Err(Error::PreparationFailed {
                reason: "forced test failure".into(),
            });
        }
        Ok(())
    }

    async fn run(&mut self, oracle: &dyn ControlOracle) -> Result<RunOutcome, Error> {
        if self.kind == "fail_run" {
            return Err(Error::RunFailed {
                reason: "forced test failure".into(),
            });
        }

        if self.kind == "background" {
            loop {
                if oracle.should_terminate(self.rid) {
                    self.termination_ok.store(true, Ordering::SeqCst);
                    return Ok(RunOutcome::Terminated);
                }
                if oracle.should_pause(self.rid) {
                    return Ok(RunOutcome::Paused);
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        Ok(RunOutcome::Completed)
    }

    async fn analyze(&mut self) -> Result<(), Error> {
        if self.kind == "fail_analyze" {
            return Err(Error::AnalysisFailed {
                reason: "forced test failure".into(),
            });
        }
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Constructs a fresh [`FakeWorker`] per submission. Shares a
/// `termination_ok` flag and a `close_count` across every worker it
/// creates, so a test can observe the cooperative-termination side effect
/// and that every worker was closed exactly once.
#[derive(Clone)]
pub struct FakeWorkerFactory {
    poll_interval: Duration,
    pub termination_ok: Arc<AtomicBool>,
    pub close_count: Arc<AtomicU64>,
}

impl Default for FakeWorkerFactory {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            termination_ok: Arc::new(AtomicBool::new(false)),
            close_count: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl WorkerFactory for FakeWorkerFactory {
    fn create(&self) -> Box<dyn WorkerHandle> {
        Box::new(FakeWorker::new(self.poll_interval, self.termination_ok.clone(), self.close_count.clone()))
    }
}

/// A thread-safe sink that collects every notifier change record it is sent,
/// in order, for assertion after the fact.
#[derive(Clone, Default)]
pub struct RecordLog {
    records: Arc<Mutex<Vec<ChangeRecord>>>,
}

impl RecordLog {
    pub fn subscriber(&self) -> impl Fn(&ChangeRecord) + Send + Sync + 'static {
        let records = self.records.clone();
        move |record: &ChangeRecord| {
            records.lock().expect("record log lock poisoned").push(record.clone());
        }
    }

    pub fn snapshot(&self) -> Vec<ChangeRecord> {
        self.records.lock().expect("record log lock poisoned").clone()
    }

    /// Status values recorded for `rid`, in the order they were published.
    pub fn status_sequence(&self, rid: u64) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter_map(|record| {
                if record.path == [notifier::Key::Rid(rid)] && record.key == notifier::Key::Name("status".into()) {
                    match record.value {
                        Some(notifier::Value::String(status)) => Some(status),
                        _ => None,
                    }
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn was_deleted(&self, rid: u64) -> bool {
        self.snapshot()
            .into_iter()
            .any(|record| record.path.is_empty() && record.key == notifier::Key::Rid(rid) && record.action == notifier::Action::DelItem)
    }

    /// Index, within the full total order of every record seen so far, of
    /// `rid`'s transition to `status`.
    pub fn position_of_status(&self, rid: u64, status: &str) -> Option<usize> {
        self.snapshot().into_iter().position(|record| {
            record.path == [notifier::Key::Rid(rid)]
                && record.key == notifier::Key::Name("status".into())
                && record.value == Some(notifier::Value::String(status.to_string()))
        })
    }
}

/// Polls `predicate` every 10ms until it is true or `timeout` elapses,
/// panicking in the latter case. Real time is used throughout these tests
/// (not `tokio::time::pause`), consistent with waiting on real async I/O
/// rather than a simulated clock.
pub async fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition did not become true within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
