//! Error taxonomy for the merge bot.
//!
//! Every fallible operation in the core resolves to one of these kinds so the
//! driver and the jobs can decide *what to do next* (post a note and move on,
//! fall through to single-job, retry, or terminate the run) without deep
//! exception-chain sniffing — see the state machine's own transition table
//! for how each kind is routed.

use std::fmt;

use thiserror::Error;

/// A business condition that prevents a merge request from being merged in
/// this iteration. Not retried; results in a note + unassign.
#[derive(Debug, Error)]
#[error("cannot merge: {reason}")]
pub struct CannotMerge {
    pub reason: String,
}

impl CannotMerge {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A structural condition that prevents speculative pipelining. The caller
/// falls through to the single-job path on MR[0].
#[derive(Debug, Error)]
#[error("cannot batch: {reason}")]
pub struct CannotBatch {
    pub reason: String,
}

impl CannotBatch {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Top-level error kind shared by the REST client, git wrapper, and jobs.
#[derive(Debug, Error)]
pub enum Error {
    /// Business condition: WIP, unapproved, conflicts, CI failed, protected
    /// source branch, author not assignee, etc.
    #[error(transparent)]
    CannotMerge(#[from] CannotMerge),

    /// Structural condition: forks, mismatched merge methods, API-only mode.
    #[error(transparent)]
    CannotBatch(#[from] CannotBatch),

    /// HTTP 5xx, throttling, or a request timeout. Retried with bounded
    /// exponential backoff within the same state before being demoted.
    #[error("transient API error on attempt {attempt}: {source}")]
    TransientApi {
        source: anyhow::Error,
        attempt: u32,
    },

    /// A local git subprocess failed or timed out.
    #[error("git error: {source}")]
    GitError { source: anyhow::Error },

    /// The merge request's head moved under us due to an external push.
    #[error("superseded: head moved during processing")]
    Superseded,

    /// Misconfiguration, auth rejection, or a missing bot identity. Not
    /// recoverable; the run terminates.
    #[error("fatal: {reason}")]
    Fatal { reason: String },
}

impl Error {
    pub fn cannot_merge(reason: impl Into<String>) -> Self {
        Error::CannotMerge(CannotMerge::new(reason))
    }

    pub fn cannot_batch(reason: impl Into<String>) -> Self {
        Error::CannotBatch(CannotBatch::new(reason))
    }

    pub fn transient(source: anyhow::Error, attempt: u32) -> Self {
        Error::TransientApi { source, attempt }
    }

    pub fn git(source: anyhow::Error) -> Self {
        Error::GitError { source }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Error::Fatal {
            reason: reason.into(),
        }
    }

    /// True if this error kind should terminate the whole run rather than
    /// just the current merge request or batch.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal { .. })
    }

    /// A short, user-visible explanation suitable for a note posted on the
    /// merge request (§7: "a single explanatory note... citing which gate
    /// failed").
    pub fn user_note(&self) -> String {
        match self {
            Error::CannotMerge(e) => e.reason.clone(),
            Error::CannotBatch(e) => format!("batch aborted: {}", e.reason),
            Error::TransientApi { source, .. } => format!("transient API error: {source}"),
            Error::GitError { source } => format!("git error: {source}"),
            Error::Superseded => "merge request head changed during processing".to_string(),
            Error::Fatal { reason } => format!("fatal error: {reason}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Retry bound for a single state edge (§4.5: "at most M (default 3-5)").
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    attempts: u32,
    max: u32,
}

impl RetryBudget {
    pub fn new(max: u32) -> Self {
        Self { attempts: 0, max }
    }

    /// Record one attempt. Returns `true` if another attempt is still
    /// allowed, `false` if the budget is exhausted.
    pub fn record_attempt(&mut self) -> bool {
        self.attempts += 1;
        self.attempts <= self.max
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max
    }
}

impl fmt::Display for RetryBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.attempts, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_budget_allows_up_to_max() {
        let mut budget = RetryBudget::new(3);
        assert!(budget.record_attempt());
        assert!(budget.record_attempt());
        assert!(budget.record_attempt());
        assert!(!budget.record_attempt());
        assert!(budget.exhausted());
    }

    #[test]
    fn cannot_merge_note_is_the_reason() {
        let err = Error::cannot_merge("pipeline failed on rebased commit abc1234");
        assert_eq!(
            err.user_note(),
            "pipeline failed on rebased commit abc1234"
        );
        assert!(!err.is_fatal());
    }

    #[test]
    fn fatal_is_fatal() {
        let err = Error::fatal("missing bot identity");
        assert!(err.is_fatal());
    }
}
