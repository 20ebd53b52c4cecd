//! Per-ref audit task: deadline context, the error taxonomy the task
//! transport relies on, and the orchestration of one full pass
//! (fetch, classify, audit, write outcomes, notify).

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{debug, info};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Snapshot;
use crate::fetch::{self, FetchOutcome};
use crate::gitlog::{GitLog, LogError};
use crate::metrics::Metrics;
use crate::notify::{self, NotifyOutcome};
use crate::outcome;
use crate::pool;
use crate::scan;
use crate::store::{Store, StoreError};
use crate::tracker::{Tracker, TrackerError};

/// Deadline primitive propagated to every blocking operation of a task run.
/// Combines the wall-clock budget with explicit cancellation; a task observes
/// expiry, persists what it has, and returns cleanly.
#[derive(Clone)]
pub struct TaskContext {
    deadline: Instant,
    cancel: CancellationToken,
    /// Wall clock captured at task start. Stage logic compares stored times
    /// against this rather than sampling the clock, so tests can pin it.
    pub now: SystemTime,
}

impl TaskContext {
    pub fn with_budget(budget: Duration) -> Self {
        Self::new(Instant::now() + budget, SystemTime::now())
    }

    pub fn new(deadline: Instant, now: SystemTime) -> Self {
        Self {
            deadline,
            cancel: CancellationToken::new(),
            now,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn expired(&self) -> bool {
        self.cancel.is_cancelled() || Instant::now() >= self.deadline
    }

    /// Resolves when the deadline passes or the task is cancelled.
    pub async fn expiry(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep_until(self.deadline) => {}
        }
    }
}

/// The task's collaborators, bundled so stages take one handle.
#[derive(Clone)]
pub struct Deps {
    pub store: Arc<dyn Store>,
    pub gitlog: Arc<dyn GitLog>,
    pub tracker: Arc<dyn Tracker>,
    pub metrics: Arc<Metrics>,
}

/// Error taxonomy of one task run. The HTTP status mapping is part of the
/// task-transport contract; the transport retries on some codes and not
/// others, so the mapping must stay exact.
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("no state for ref {0}")]
    UnknownRef(String),
    #[error("no config named {0}")]
    UnknownConfig(String),
    #[error("ref is paused")]
    RefPaused,
    #[error("commit log: {0}")]
    Log(#[source] LogError),
    #[error("tracker: {0}")]
    Tracker(#[from] TrackerError),
    #[error("storage: {0}")]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AuditError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::UnknownRef(_) | Self::UnknownConfig(_) => 400,
            Self::RefPaused => 409,
            Self::Log(_) | Self::Tracker(_) => 502,
            Self::Storage(_) => 503,
            Self::Internal(_) => 500,
        }
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct AuditSummary {
    /// Set when the deadline cut the run short. Partial progress is
    /// persisted; the next scheduled pass resumes from it.
    pub truncated: bool,
    pub new_relevant: usize,
    pub audited: usize,
}

/// One full audit pass over one ref. Every stage checks the deadline before
/// starting; persistence is never gated, so expiry truncates rather than
/// discards.
pub async fn audit_ref(
    ctx: &TaskContext,
    deps: &Deps,
    snapshot: &Snapshot,
    ref_url: &str,
) -> Result<AuditSummary, AuditError> {
    let mut state = deps
        .store
        .load_ref(ref_url)
        .await?
        .ok_or_else(|| AuditError::UnknownRef(ref_url.to_owned()))?;
    let entry = snapshot
        .entry(&state.config_name)
        .ok_or_else(|| AuditError::UnknownConfig(state.config_name.clone()))?
        .clone();

    let mut summary = AuditSummary::default();

    let log = match fetch::fetch_new_commits(ctx, deps, &snapshot.tuning, &entry, &mut state).await?
    {
        FetchOutcome::Paused => return Err(AuditError::RefPaused),
        FetchOutcome::Log(log) => log,
    };
    debug!("{}: {} new commits", ref_url, log.len());

    let stats = scan::classify_and_store(ctx, deps, &entry, &mut state, &log).await?;
    summary.new_relevant = stats.relevant;
    summary.truncated |= stats.truncated;

    if ctx.expired() {
        summary.truncated = true;
        return Ok(summary);
    }
    let batch_cap = snapshot.tuning.max_workers * snapshot.tuning.commits_per_worker;
    let pending = deps.store.pending_commits(ref_url, batch_cap).await?;
    if !pending.is_empty() {
        let produced = pool::run_pool(ctx, &snapshot.tuning, &entry, &state, pending).await;
        summary.audited = produced.len();
        outcome::write_outcomes(ctx, deps, ref_url, produced).await?;
    }

    if ctx.expired() {
        summary.truncated = true;
        return Ok(summary);
    }
    if notify::notify_about_violations(ctx, deps, &entry, &state).await? == NotifyOutcome::Truncated
    {
        summary.truncated = true;
        return Ok(summary);
    }
    if notify::notify_about_audit_failures(ctx, deps, &entry, &state).await?
        == NotifyOutcome::Truncated
    {
        summary.truncated = true;
        return Ok(summary);
    }

    info!(
        "{}: audit pass done ({} new relevant, {} audited)",
        ref_url, summary.new_relevant, summary.audited
    );
    Ok(summary)
}
