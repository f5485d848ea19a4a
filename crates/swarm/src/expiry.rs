//! Timer-driven scanner for time-dependent transitions.
//!
//! One driver wakes on a fixed tick and advances whatever the clock has made
//! due: claim expiry, inactivity release, stale/blocked/overload steal
//! marking, contest-window closure, and handoff expiry. Every transition goes
//! through the ordinary manager and steal-engine operations, so the scanner
//! obeys exactly the same invariants as caller-initiated work.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::ClaimStatus;
use crate::manager::ClaimManager;
use crate::steal::StealEngine;

/// What one scanner pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpirySummary {
    pub expired: usize,
    pub released_inactive: usize,
    pub marked_stealable: usize,
    pub contests_resolved: usize,
    pub handoffs_rejected: usize,
    /// Whether the load-index recount found and healed a divergence
    pub load_healed: bool,
}

/// The scanner.
pub struct ExpiryDriver {
    manager: Arc<ClaimManager>,
    steal: Arc<StealEngine>,
}

impl ExpiryDriver {
    /// Default scan period; fine enough for minute-granularity thresholds
    /// and the second-granularity TTLs the surface accepts.
    pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

    pub fn new(manager: Arc<ClaimManager>, steal: Arc<StealEngine>) -> Self {
        Self { manager, steal }
    }

    /// Run one full scanner pass against the current clock.
    pub fn run_once(&self) -> ExpirySummary {
        let m = &self.manager;
        let now = m.clock.now();
        let mut summary = ExpirySummary::default();

        // Claim expiry
        for claim in m.store.non_terminal() {
            if claim.expires_at.is_some_and(|at| now >= at) {
                match m.expire_claim(&claim.issue_id) {
                    Ok(Some(_)) => summary.expired += 1,
                    Ok(None) => {}
                    Err(err) => warn!(issue_id = %claim.issue_id, %err, "expiry pass failed"),
                }
            }
        }

        // Inactivity release (disabled at threshold 0)
        let inactivity_ms = m.config.get().auto_release_on_inactivity_ms;
        if inactivity_ms > 0 {
            let cutoff = chrono::Duration::milliseconds(inactivity_ms as i64);
            for claim in m.store.list_status(ClaimStatus::Active) {
                if now - claim.last_activity_at >= cutoff {
                    match m.release_inactive(&claim.issue_id) {
                        Ok(Some(_)) => summary.released_inactive += 1,
                        Ok(None) => {}
                        Err(err) => {
                            warn!(issue_id = %claim.issue_id, %err, "inactivity release failed")
                        }
                    }
                }
            }
        }

        // Steal marking and contest closure
        summary.marked_stealable = self.steal.run_auto_mark().len();
        summary.contests_resolved = self.steal.auto_resolve_expired();

        // Handoff expiry restores the prior status, as an explicit reject does
        for claim in m.store.list_status(ClaimStatus::HandoffPending) {
            let Some(handoff) = claim.handoff.as_ref() else {
                continue;
            };
            if handoff.expires_at.is_some_and(|at| now >= at) {
                match m.reject_handoff(&handoff.handoff_id, Some("expired".to_string())) {
                    Ok(_) => summary.handoffs_rejected += 1,
                    Err(err) => {
                        debug!(handoff_id = %handoff.handoff_id, %err, "handoff expiry skipped")
                    }
                }
            }
        }

        // Consistency sweep: the load index is derived and must agree with
        // the store
        summary.load_healed = m.load.recount_from(&m.store.all());

        summary
    }

    /// Start the scanner thread, ticking every `interval`.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> ExpiryHandle {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let stop_pair = Arc::clone(&stop);

        let handle = std::thread::spawn(move || loop {
            let (lock, condvar) = &*stop_pair;
            let stopped = lock.lock().unwrap();
            let (stopped, _) = condvar.wait_timeout(stopped, interval).unwrap();
            if *stopped {
                break;
            }
            drop(stopped);
            self.run_once();
        });

        ExpiryHandle {
            stop,
            handle: Some(handle),
        }
    }
}

/// Handle for the scanner thread; stops it on drop.
pub struct ExpiryHandle {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for ExpiryHandle {
    fn drop(&mut self) {
        let (lock, condvar) = &*self.stop;
        *lock.lock().unwrap() = true;
        condvar.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
