//! Process-wide probe sink.
//!
//! Instrumented code reports executed lines and branch arcs through
//! [`cover!`](crate::cover) / [`cover_branch!`](crate::cover_branch) or the
//! functions below. Each running [`LineTracker`](crate::tracker::LineTracker)
//! subscribes a [`HitLog`]; probes fired while nothing is subscribed are
//! dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use crate::report::BranchArc;

#[derive(Debug, Default)]
pub struct HitLog {
    track_branches: bool,
    lines: Mutex<BTreeMap<String, BTreeSet<u32>>>,
    arcs: Mutex<BTreeMap<String, BTreeSet<BranchArc>>>,
}

impl HitLog {
    pub fn new(track_branches: bool) -> Self {
        Self {
            track_branches,
            ..Self::default()
        }
    }

    pub fn record_line(&self, file: &str, line: u32) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.entry(file.to_string()).or_default().insert(line);
    }

    pub fn record_arc(&self, file: &str, arc: BranchArc) {
        if !self.track_branches {
            return;
        }
        let mut arcs = self.arcs.lock().unwrap_or_else(PoisonError::into_inner);
        arcs.entry(file.to_string()).or_default().insert(arc);
    }

    pub fn lines(&self) -> BTreeMap<String, BTreeSet<u32>> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn arcs(&self) -> BTreeMap<String, BTreeSet<BranchArc>> {
        self.arcs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

static SUBSCRIBERS: RwLock<Vec<Weak<HitLog>>> = RwLock::new(Vec::new());

pub fn subscribe(log: &Arc<HitLog>) {
    let mut subscribers = SUBSCRIBERS.write().unwrap_or_else(PoisonError::into_inner);
    subscribers.retain(|existing| existing.strong_count() > 0);
    subscribers.push(Arc::downgrade(log));
}

pub fn unsubscribe(log: &Arc<HitLog>) {
    let target = Arc::downgrade(log);
    let mut subscribers = SUBSCRIBERS.write().unwrap_or_else(PoisonError::into_inner);
    subscribers.retain(|existing| existing.strong_count() > 0 && !existing.ptr_eq(&target));
}

fn for_each_subscriber(mut visit: impl FnMut(&HitLog)) {
    let subscribers = SUBSCRIBERS.read().unwrap_or_else(PoisonError::into_inner);
    for log in subscribers.iter().filter_map(Weak::upgrade) {
        visit(&log);
    }
}

pub fn record_line(file: &str, line: u32) {
    for_each_subscriber(|log| log.record_line(file, line));
}

/// Records the line as executed and, when branch tracking is on, the arc
/// from it to `to` (negative for an exit from the enclosing function).
pub fn record_branch(file: &str, from: u32, to: i64) {
    for_each_subscriber(|log| {
        log.record_line(file, from);
        log.record_arc(file, (i64::from(from), to));
    });
}

#[macro_export]
macro_rules! cover {
    () => {
        $crate::probe::record_line(file!(), line!())
    };
}

#[macro_export]
macro_rules! cover_branch {
    ($to:expr) => {
        $crate::probe::record_branch(file!(), line!(), ($to) as i64)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribed_logs_receive_probes_until_unsubscribed() {
        let log = Arc::new(HitLog::new(true));
        subscribe(&log);
        record_line("probe_test/subscribed.rs", 7);
        record_branch("probe_test/subscribed.rs", 8, 12);
        unsubscribe(&log);
        record_line("probe_test/subscribed.rs", 99);

        let lines = log.lines();
        assert_eq!(
            lines["probe_test/subscribed.rs"],
            BTreeSet::from([7, 8])
        );
        assert_eq!(
            log.arcs()["probe_test/subscribed.rs"],
            BTreeSet::from([(8, 12)])
        );
    }

    #[test]
    fn arcs_are_ignored_without_branch_tracking() {
        let log = Arc::new(HitLog::new(false));
        subscribe(&log);
        record_branch("probe_test/no_branches.rs", 3, 4);
        unsubscribe(&log);

        assert!(log.arcs().is_empty());
        assert_eq!(
            log.lines()["probe_test/no_branches.rs"],
            BTreeSet::from([3])
        );
    }

    #[test]
    fn macro_records_call_site() {
        let log = Arc::new(HitLog::new(false));
        subscribe(&log);
        let line = line!() + 1;
        crate::cover!();
        unsubscribe(&log);

        assert!(log.lines()[file!()].contains(&line));
    }
}
