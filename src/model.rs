use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Display;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

// Commit hashes are passed around as plain strings; they come straight out of
// the commit log collaborator and we never need to parse them.
pub type CommitHash = String;

/// Key into [`RelevantCommit::notification_state`] used for repeated-failure
/// tracker filings, as opposed to per-rule-set notifier state.
pub const AUDIT_FAILURE_KEY: &str = "AuditFailure";

/// Lifecycle of an audit work item.
///
/// `Scheduled` is the initial state. `Pending` means at least one rule came
/// back with a non-terminal verdict and the commit will be picked up again on
/// the next pass. `Completed`, `ActionRequired` and `Failed` are absorbing
/// once the commit has also been notified (`notified_all`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitStatus {
    Scheduled,
    Pending,
    Completed,
    ActionRequired,
    Failed,
}

impl CommitStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommitStatus::Completed | CommitStatus::ActionRequired | CommitStatus::Failed
        )
    }

    // Whether the worker pool may still pick this commit up.
    pub fn is_workable(self) -> bool {
        matches!(self, CommitStatus::Scheduled | CommitStatus::Pending)
    }
}

impl Display for CommitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Scheduled => "scheduled",
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::ActionRequired => "action-required",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Verdict of a single rule against a single commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleStatus {
    Passed,
    Failed,
    Pending,
    NotificationRequired,
    Skipped,
}

impl RuleStatus {
    // A terminal verdict is never re-evaluated; Pending is.
    pub fn is_terminal(self) -> bool {
        !matches!(self, RuleStatus::Pending)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleResult {
    pub rule_name: String,
    pub status: RuleStatus,
    pub message: String,
    pub metadata: Option<String>,
}

impl RuleResult {
    pub fn new(rule_name: impl Into<String>, status: RuleStatus, message: impl Into<String>) -> Self {
        Self {
            rule_name: rule_name.into(),
            status,
            message: message.into(),
            metadata: None,
        }
    }
}

/// Durable per-ref scan state. Root of the ref's entity group; everything
/// else hanging off the ref is keyed under it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefState {
    /// Canonical identifier, repo base plus branch. Primary key.
    pub ref_url: String,
    /// Which configured rule group this ref belongs to.
    pub config_name: String,
    /// Opaque per-config string, e.g. a milestone number.
    pub metadata: Option<String>,
    pub branch_name: String,
    /// Watermark: newest commit already scanned. Only moves forward through
    /// commits reachable from the tip, except via an operator override token.
    pub last_known_commit: CommitHash,
    pub last_known_commit_time: SystemTime,
    /// Newest commit found relevant; head of the per-ref linked list.
    pub last_relevant_commit: CommitHash,
    pub last_relevant_commit_time: SystemTime,
    /// Wall-clock time of the last complete scan pass.
    pub last_updated_time: SystemTime,
    /// Circuit breaker. While set, no fetching or auditing runs on this ref.
    pub paused: bool,
    /// The most recent operator override token honoured.
    pub accepted_overwrite_token: String,
}

impl RefState {
    /// State for a ref the scheduler sees for the first time. The configured
    /// starting commit doubles as the watermark and as the sentinel
    /// terminating the relevant-commit linked list.
    pub fn seeded(
        ref_url: impl Into<String>,
        config_name: impl Into<String>,
        branch_name: impl Into<String>,
        metadata: Option<String>,
        starting_commit: impl Into<String>,
        now: SystemTime,
    ) -> Self {
        let starting_commit = starting_commit.into();
        Self {
            ref_url: ref_url.into(),
            config_name: config_name.into(),
            metadata,
            branch_name: branch_name.into(),
            last_known_commit: starting_commit.clone(),
            last_known_commit_time: SystemTime::UNIX_EPOCH,
            last_relevant_commit: starting_commit,
            last_relevant_commit_time: SystemTime::UNIX_EPOCH,
            last_updated_time: now,
            paused: false,
            accepted_overwrite_token: String::new(),
        }
    }
}

/// A commit that at least one rule set claimed, persisted as an audit work
/// item under its ref's entity group and keyed by commit hash.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelevantCommit {
    pub ref_url: String,
    pub commit_hash: CommitHash,
    /// Hash of the next-older relevant commit on the same ref. The oldest
    /// relevant commit links to the ref's starting-commit sentinel.
    pub previous_relevant_commit: CommitHash,
    pub status: CommitStatus,
    pub commit_time: SystemTime,
    pub committer_account: String,
    pub author_account: String,
    pub commit_message: String,
    pub result: Vec<RuleResult>,
    /// Incremented on transient rule-evaluation errors; past the configured
    /// cap the commit transitions to `Failed`.
    pub retries: u32,
    /// Per-rule-set (or [`AUDIT_FAILURE_KEY`]) opaque delivery-progress
    /// strings, owned by the notifier dispatcher.
    pub notification_state: BTreeMap<String, String>,
    pub notified_all: bool,
}

impl RelevantCommit {
    pub fn result_for(&self, rule_name: &str) -> Option<&RuleResult> {
        self.result.iter().find(|r| r.rule_name == rule_name)
    }

    /// Records a rule result, replacing any earlier result for the same rule.
    pub fn set_result(&mut self, result: RuleResult) {
        match self.result.iter_mut().find(|r| r.rule_name == result.rule_name) {
            Some(existing) => *existing = result,
            None => self.result.push(result),
        }
    }

    /// Recomputes the status after a full, error-free rule pass.
    ///
    /// A violation found on this pass wins over everything else; otherwise an
    /// outstanding pending verdict keeps the commit re-auditable.
    pub fn recompute_status(&mut self, newly_actionable: bool) {
        if newly_actionable {
            self.status = CommitStatus::ActionRequired;
        } else if self.result.iter().any(|r| r.status == RuleStatus::Pending) {
            self.status = CommitStatus::Pending;
        } else {
            self.status = CommitStatus::Completed;
        }
    }

    /// Whether any future run may still mutate this commit.
    pub fn is_settled(&self) -> bool {
        self.status.is_terminal() && self.notified_all
    }
}

impl Display for RelevantCommit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.commit_hash, self.status)
    }
}
