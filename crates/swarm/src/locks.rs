//! Per-issue critical sections.
//!
//! Mutations for a given issue are serialized through a keyed lock set:
//! acquiring an issue that is already held blocks until it frees up or the
//! operation's deadline passes. Multi-issue acquisition (rebalance passes)
//! always locks in lexicographic order, which rules out deadlock between
//! passes.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::errors::{CoordResult, CoordinatorError};

/// Keyed lock set guarding one critical section per issue.
#[derive(Debug, Default)]
pub struct IssueLocks {
    held: Mutex<HashSet<String>>,
    freed: Condvar,
}

/// RAII guard for one issue's critical section.
#[derive(Debug)]
pub struct IssueGuard<'a> {
    locks: &'a IssueLocks,
    issue_id: String,
}

impl IssueGuard<'_> {
    pub fn issue_id(&self) -> &str {
        &self.issue_id
    }
}

impl Drop for IssueGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().unwrap();
        held.remove(&self.issue_id);
        self.locks.freed.notify_all();
    }
}

impl IssueLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the critical section for `issue_id`, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// `Timeout` if the section could not be entered before the deadline; in
    /// that case nothing was acquired and nothing was mutated.
    pub fn acquire(&self, issue_id: &str, timeout: Duration) -> CoordResult<IssueGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock().unwrap();
        while held.contains(issue_id) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CoordinatorError::Timeout);
            }
            let (guard, wait) = self.freed.wait_timeout(held, remaining).unwrap();
            held = guard;
            if wait.timed_out() && held.contains(issue_id) {
                return Err(CoordinatorError::Timeout);
            }
        }
        held.insert(issue_id.to_string());
        Ok(IssueGuard {
            locks: self,
            issue_id: issue_id.to_string(),
        })
    }

    /// Enter the critical sections of several issues at once.
    ///
    /// Ids are deduplicated and locked in lexicographic order. On timeout,
    /// every section acquired so far is released before returning.
    pub fn acquire_many(
        &self,
        issue_ids: &[String],
        timeout: Duration,
    ) -> CoordResult<Vec<IssueGuard<'_>>> {
        let mut ordered: Vec<&String> = issue_ids.iter().collect();
        ordered.sort();
        ordered.dedup();

        let deadline = Instant::now() + timeout;
        let mut guards = Vec::with_capacity(ordered.len());
        for issue_id in ordered {
            let remaining = deadline.saturating_duration_since(Instant::now());
            guards.push(self.acquire(issue_id, remaining)?);
        }
        Ok(guards)
    }
}
