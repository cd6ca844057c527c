//! Quorum parameters and per-request quorum bookkeeping.
//!
//! A [`QuorumTracker`] is seeded with the tracking units of one logical
//! request (cells, rows, entries). Each in-flight replica call is registered
//! against the units it carries; when the call resolves, every one of those
//! units is credited with a success or a failure. A unit is decided once it
//! reaches the success threshold or the failure threshold, whichever comes
//! first, and its verdict never changes afterwards.

use ringkv_common::KvError;
use ringkv_config::QuorumConfig;
use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Replication factor plus the read and write quorum sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumParameters {
    replication_factor: usize,
    read_factor: usize,
    write_factor: usize,
}

impl QuorumParameters {
    pub fn new(
        replication_factor: usize,
        read_factor: usize,
        write_factor: usize,
    ) -> Result<Self, KvError> {
        if read_factor == 0 || read_factor > replication_factor {
            return Err(KvError::InvalidQuorum(format!(
                "read factor {} must be in 1..={}",
                read_factor, replication_factor
            )));
        }
        if write_factor == 0 || write_factor > replication_factor {
            return Err(KvError::InvalidQuorum(format!(
                "write factor {} must be in 1..={}",
                write_factor, replication_factor
            )));
        }
        Ok(Self {
            replication_factor,
            read_factor,
            write_factor,
        })
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    pub fn read_factor(&self) -> usize {
        self.read_factor
    }

    pub fn write_factor(&self) -> usize {
        self.write_factor
    }

    pub fn read_request_parameters(&self) -> QuorumRequestParameters {
        QuorumRequestParameters::new(self.replication_factor, self.read_factor)
    }

    pub fn write_request_parameters(&self) -> QuorumRequestParameters {
        QuorumRequestParameters::new(self.replication_factor, self.write_factor)
    }

    /// Every replica must succeed; a single failure decides the unit.
    pub fn no_failure_request_parameters(&self) -> QuorumRequestParameters {
        QuorumRequestParameters::new(self.replication_factor, self.replication_factor)
    }
}

impl TryFrom<&QuorumConfig> for QuorumParameters {
    type Error = KvError;

    fn try_from(config: &QuorumConfig) -> Result<Self, Self::Error> {
        Self::new(
            config.replication_factor,
            config.read_factor,
            config.write_factor,
        )
    }
}

/// Success and failure thresholds for one class of request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumRequestParameters {
    replication_factor: usize,
    success_factor: usize,
}

impl QuorumRequestParameters {
    fn new(replication_factor: usize, success_factor: usize) -> Self {
        Self {
            replication_factor,
            success_factor,
        }
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    /// Successes needed for a unit to succeed.
    pub fn success_factor(&self) -> usize {
        self.success_factor
    }

    /// Failures after which success is impossible for a unit.
    pub fn failure_factor(&self) -> usize {
        self.replication_factor - self.success_factor + 1
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// A handle to an in-flight replica call that can be asked to stop.
pub trait PendingRef: Eq + Hash {
    /// Best-effort cancellation. Must be safe to call on a finished call.
    fn cancel(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy)]
struct UnitCount {
    successes: usize,
    failures: usize,
    verdict: Verdict,
}

impl UnitCount {
    fn new() -> Self {
        Self {
            successes: 0,
            failures: 0,
            verdict: Verdict::Pending,
        }
    }
}

/// Quorum bookkeeping for one logical request.
///
/// Not shared between tasks: the coordinator drains completions one at a time
/// and is the only writer.
#[derive(Debug)]
pub struct QuorumTracker<H, U> {
    params: QuorumRequestParameters,
    units: HashMap<U, UnitCount>,
    refs: HashMap<H, Vec<U>>,
    undecided: usize,
    failed: bool,
    cancelled: bool,
}

impl<H: PendingRef, U: Eq + Hash + Clone> QuorumTracker<H, U> {
    /// A tracker with zero counts for each unit. Duplicate units collapse.
    pub fn of(units: impl IntoIterator<Item = U>, params: QuorumRequestParameters) -> Self {
        let units: HashMap<U, UnitCount> = units.into_iter().map(|u| (u, UnitCount::new())).collect();
        let undecided = units.len();
        Self {
            params,
            units,
            refs: HashMap::new(),
            undecided,
            failed: false,
            cancelled: false,
        }
    }

    pub fn params(&self) -> QuorumRequestParameters {
        self.params
    }

    /// Record that `handle`, once resolved, counts towards `units`.
    /// Units the tracker was not seeded with are ignored.
    pub fn register_ref(&mut self, handle: H, units: impl IntoIterator<Item = U>) {
        let covered: HashSet<U> = units
            .into_iter()
            .filter(|u| self.units.contains_key(u))
            .collect();
        self.refs.insert(handle, covered.into_iter().collect());
    }

    /// Whether `handle` is registered and has not resolved or been cancelled.
    pub fn is_outstanding<Q>(&self, handle: &Q) -> bool
    where
        H: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        !self.cancelled && self.refs.contains_key(handle)
    }

    /// Credit a success to every unit `handle` covers. Unknown, already
    /// resolved and cancelled handles are ignored.
    pub fn handle_success<Q>(&mut self, handle: &Q)
    where
        H: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.resolve(handle, true);
    }

    /// Credit a failure to every unit `handle` covers.
    pub fn handle_failure<Q>(&mut self, handle: &Q)
    where
        H: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.resolve(handle, false);
    }

    fn resolve<Q>(&mut self, handle: &Q, success: bool)
    where
        H: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        if self.cancelled {
            return;
        }
        let Some(covered) = self.refs.remove(handle) else {
            return;
        };
        let success_factor = self.params.success_factor();
        let failure_factor = self.params.failure_factor();
        for unit in covered {
            let Some(count) = self.units.get_mut(&unit) else {
                continue;
            };
            if success {
                count.successes += 1;
            } else {
                count.failures += 1;
            }
            if count.verdict != Verdict::Pending {
                continue;
            }
            if count.successes >= success_factor {
                count.verdict = Verdict::Succeeded;
                self.undecided -= 1;
            } else if count.failures >= failure_factor {
                count.verdict = Verdict::Failed;
                self.undecided -= 1;
                self.failed = true;
            }
        }
    }

    /// Every unit has reached a success or failure verdict.
    pub fn finished(&self) -> bool {
        self.undecided == 0
    }

    /// At least one unit can no longer reach its success threshold.
    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Calls registered but not yet resolved.
    pub fn outstanding(&self) -> usize {
        self.refs.len()
    }

    /// Mark the tracker terminal. With `interrupt`, every outstanding handle
    /// is cancelled. Returns how many handles were signalled. Idempotent.
    pub fn cancel(&mut self, interrupt: bool) -> usize {
        self.cancelled = true;
        if !interrupt {
            return 0;
        }
        let pending = std::mem::take(&mut self.refs);
        for handle in pending.keys() {
            handle.cancel();
        }
        pending.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell as Flag;
    use std::rc::Rc;

    /// Test handle: identity is the id, the flag records cancellation.
    #[derive(Debug, Clone)]
    struct Ref {
        id: u32,
        cancelled: Rc<Flag<bool>>,
    }

    impl Ref {
        fn new(id: u32) -> Self {
            Self {
                id,
                cancelled: Rc::new(Flag::new(false)),
            }
        }
    }

    impl PartialEq for Ref {
        fn eq(&self, other: &Self) -> bool {
            self.id == other.id
        }
    }
    impl Eq for Ref {}
    impl Hash for Ref {
        fn hash<S: std::hash::Hasher>(&self, state: &mut S) {
            self.id.hash(state);
        }
    }
    impl Borrow<u32> for Ref {
        fn borrow(&self) -> &u32 {
            &self.id
        }
    }
    impl PendingRef for Ref {
        fn cancel(&self) {
            self.cancelled.set(true);
        }
    }

    fn params(rf: usize, success: usize) -> QuorumRequestParameters {
        QuorumRequestParameters::new(rf, success)
    }

    #[test]
    fn test_parameters_reject_bad_factors() {
        assert!(QuorumParameters::new(3, 0, 2).is_err());
        assert!(QuorumParameters::new(3, 2, 4).is_err());
        let q = QuorumParameters::new(3, 2, 2).unwrap();
        assert_eq!(q.read_request_parameters().failure_factor(), 2);
        assert_eq!(q.no_failure_request_parameters().success_factor(), 3);
        assert_eq!(q.no_failure_request_parameters().failure_factor(), 1);
    }

    #[test]
    fn test_parameters_from_config() {
        let q = QuorumParameters::try_from(&QuorumConfig::default()).unwrap();
        assert_eq!(
            (q.replication_factor(), q.read_factor(), q.write_factor()),
            (3, 2, 2)
        );
    }

    #[test]
    fn test_zero_units_finishes_immediately() {
        let tracker: QuorumTracker<Ref, &str> = QuorumTracker::of([], params(3, 2));
        assert!(tracker.finished());
        assert!(!tracker.failed());
    }

    #[test]
    fn test_one_call_resolves_many_units() {
        let mut tracker = QuorumTracker::of(["a", "b", "c"], params(1, 1));
        tracker.register_ref(Ref::new(1), ["a", "b", "c"]);
        assert!(!tracker.finished());
        tracker.handle_success(&1u32);
        assert!(tracker.finished());
        assert!(!tracker.failed());
    }

    #[test]
    fn test_units_decide_independently() {
        let mut tracker = QuorumTracker::of(["a", "b"], params(3, 2));
        tracker.register_ref(Ref::new(1), ["a", "b"]);
        tracker.register_ref(Ref::new(2), ["a"]);
        tracker.register_ref(Ref::new(3), ["b"]);
        tracker.register_ref(Ref::new(4), ["b"]);

        tracker.handle_success(&1u32);
        tracker.handle_success(&2u32);
        // "a" has quorum, "b" has one success.
        assert!(!tracker.finished());
        tracker.handle_failure(&3u32);
        assert!(!tracker.finished() && !tracker.failed());
        tracker.handle_success(&4u32);
        assert!(tracker.finished());
        assert!(!tracker.failed());
    }

    #[test]
    fn test_failure_threshold_marks_failed() {
        let mut tracker = QuorumTracker::of(["a"], params(3, 2));
        for id in 1..=3 {
            tracker.register_ref(Ref::new(id), ["a"]);
        }
        tracker.handle_failure(&1u32);
        assert!(!tracker.failed());
        tracker.handle_failure(&2u32);
        assert!(tracker.failed());
        assert!(tracker.finished());
    }

    #[test]
    fn test_no_failure_policy_fails_on_first_error() {
        let q = QuorumParameters::new(3, 2, 2).unwrap();
        let mut tracker = QuorumTracker::of(["a"], q.no_failure_request_parameters());
        tracker.register_ref(Ref::new(1), ["a"]);
        tracker.register_ref(Ref::new(2), ["a"]);
        tracker.handle_success(&1u32);
        tracker.handle_failure(&2u32);
        assert!(tracker.failed());
    }

    #[test]
    fn test_handles_resolve_once() {
        let mut tracker = QuorumTracker::of(["a"], params(3, 2));
        tracker.register_ref(Ref::new(1), ["a"]);
        tracker.register_ref(Ref::new(2), ["a"]);
        tracker.handle_success(&1u32);
        tracker.handle_success(&1u32);
        tracker.handle_success(&99u32);
        assert!(!tracker.finished());
        assert!(!tracker.is_outstanding(&1u32));
        assert!(tracker.is_outstanding(&2u32));
    }

    #[test]
    fn test_cancel_interrupts_outstanding_and_ignores_late_results() {
        let mut tracker = QuorumTracker::of(["a"], params(3, 1));
        let slow = Ref::new(2);
        let flag = slow.cancelled.clone();
        tracker.register_ref(Ref::new(1), ["a"]);
        tracker.register_ref(slow, ["a"]);

        tracker.handle_success(&1u32);
        assert!(tracker.finished());
        assert_eq!(tracker.cancel(true), 1);
        assert!(flag.get());

        // A result racing the cancellation is not counted.
        tracker.handle_failure(&2u32);
        assert!(!tracker.failed());
        assert_eq!(tracker.cancel(true), 0);
    }

    #[test]
    fn test_cancel_without_interrupt_leaves_calls_running() {
        let mut tracker = QuorumTracker::of(["a"], params(2, 1));
        let r = Ref::new(1);
        let flag = r.cancelled.clone();
        tracker.register_ref(r, ["a"]);
        assert_eq!(tracker.cancel(false), 0);
        assert!(!flag.get());
        assert!(tracker.is_cancelled());
    }

    #[test]
    fn test_duplicate_units_in_one_ref_count_once() {
        let mut tracker = QuorumTracker::of(["a"], params(3, 2));
        tracker.register_ref(Ref::new(1), ["a", "a"]);
        tracker.handle_success(&1u32);
        assert!(!tracker.finished());
    }

    /// Drive one unit through every success/failure outcome sequence and
    /// check `finished` and `failed` against the thresholds after each step.
    #[test]
    fn test_finished_matches_thresholds_for_all_outcomes() {
        for rf in 1..=5usize {
            for success_factor in 1..=rf {
                let p = params(rf, success_factor);
                for outcomes in 0u32..(1 << rf) {
                    let mut tracker = QuorumTracker::of(["u"], p);
                    for id in 0..rf as u32 {
                        tracker.register_ref(Ref::new(id), ["u"]);
                    }
                    let (mut s, mut f) = (0usize, 0usize);
                    let mut first_verdict_failed = None;
                    for id in 0..rf as u32 {
                        if outcomes & (1 << id) != 0 {
                            tracker.handle_success(&id);
                            s += 1;
                        } else {
                            tracker.handle_failure(&id);
                            f += 1;
                        }
                        if first_verdict_failed.is_none() {
                            if s >= success_factor {
                                first_verdict_failed = Some(false);
                            } else if f > rf - success_factor {
                                first_verdict_failed = Some(true);
                            }
                        }
                        assert_eq!(
                            tracker.finished(),
                            first_verdict_failed.is_some(),
                            "rf={} success={} outcomes={:b} step={}",
                            rf,
                            success_factor,
                            outcomes,
                            id
                        );
                        assert_eq!(tracker.failed(), first_verdict_failed == Some(true));
                    }
                    assert!(tracker.finished());
                }
            }
        }
    }
}
