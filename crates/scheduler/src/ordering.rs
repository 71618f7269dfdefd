//! The two distinct orderings used by the pipeline, kept as explicit
//! comparators so prepare order and run order are never conflated.

use std::cmp::Ordering;

use crate::entry::Entry;

/// due_date, for sorting purposes: a null due date sorts after every set
/// due date (it loses to any ready, dated entry) but ties with other null
/// due dates.
fn due_sort_key(due_date: Option<f64>) -> f64 {
    due_date.unwrap_or(f64::INFINITY)
}

/// Orders entries for the *prepare* task: earliest due date first, then
/// highest priority, then lowest `rid`.
pub(crate) fn prepare_order(a: &Entry, b: &Entry) -> Ordering {
    due_sort_key(a.due_date)
        .partial_cmp(&due_sort_key(b.due_date))
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.rid.cmp(&b.rid))
}

/// Orders entries for the *run* task: highest priority first, then lowest
/// `rid`. Due date plays no role here — by the time an entry is a run
/// candidate it has already cleared the due-date gate in the prepare task.
pub(crate) fn run_order(a: &Entry, b: &Entry) -> Ordering {
    b.priority.cmp(&a.priority).then_with(|| a.rid.cmp(&b.rid))
}

/// True if `other` would be selected ahead of `this` under the run
/// ordering, i.e. `this` should yield to `other`.
pub(crate) fn outranks_for_run(other: &Entry, this: &Entry) -> bool {
    run_order(other, this) == Ordering::Less
}

#[cfg(test)]
mod test {
    use worker::WorkerHandle;

    use super::*;

    struct NoopWorker;

    #[async_trait::async_trait]
    impl WorkerHandle for NoopWorker {
        async fn build(&mut self, _rid: u64, _expid: serde_json::Value) -> Result<(), worker::Error> {
            Ok(())
        }
        async fn prepare(&mut self) -> Result<(), worker::Error> {
            Ok(())
        }
        async fn run(&mut self, _oracle: &dyn worker::ControlOracle) -> Result<worker::RunOutcome, worker::Error> {
            Ok(worker::RunOutcome::Completed)
        }
        async fn analyze(&mut self) -> Result<(), worker::Error> {
            Ok(())
        }
        async fn close(&mut self) {}
    }

    fn entry(rid: u64, priority: i64, due_date: Option<f64>) -> Entry {
        Entry::new(rid, "main".to_string(), priority, due_date, false, serde_json::Value::Null, Box::new(NoopWorker))
    }

    #[test]
    fn prepare_order_prefers_earlier_due_date_over_priority() {
        let high_priority_late = entry(1, 99, Some(1_000_000.0));
        let low_priority_early = entry(2, 0, Some(1.0));
        assert_eq!(prepare_order(&low_priority_early, &high_priority_late), Ordering::Less);
    }

    #[test]
    fn prepare_order_treats_null_due_date_as_losing_to_any_dated_entry() {
        let no_due_date = entry(1, 50, None);
        let dated = entry(2, 0, Some(f64::MAX / 2.0));
        assert_eq!(prepare_order(&dated, &no_due_date), Ordering::Less);
    }

    #[test]
    fn prepare_order_falls_back_to_priority_then_rid() {
        let a = entry(1, 5, None);
        let b = entry(2, 5, None);
        assert_eq!(prepare_order(&a, &b), Ordering::Less);

        let c = entry(3, 1, None);
        let d = entry(4, 9, None);
        assert_eq!(prepare_order(&d, &c), Ordering::Less);
    }

    #[test]
    fn run_order_ignores_due_date() {
        let a = entry(1, 3, Some(1.0));
        let b = entry(2, 3, None);
        assert_eq!(run_order(&a, &b), Ordering::Less);
    }

    #[test]
    fn outranks_for_run_matches_spec_precise_rule() {
        let higher_priority = entry(5, 10, None);
        let lower_priority = entry(6, 1, None);
        assert!(outranks_for_run(&higher_priority, &lower_priority));
        assert!(!outranks_for_run(&lower_priority, &higher_priority));

        let same_priority_lower_rid = entry(1, 5, None);
        let same_priority_higher_rid = entry(2, 5, None);
        assert!(outranks_for_run(&same_priority_lower_rid, &same_priority_higher_rid));
    }
}
