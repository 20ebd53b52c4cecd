//! Rule sets and notifiers, the two capability sets the pipeline is
//! polymorphic over. A rule set claims commits via its account matcher,
//! evaluates an ordered rule list against each claimed commit, and owns one
//! notifier that is invoked when the commit ends up needing attention.
//! Concrete rules and notifiers are registered by the embedding binary; this
//! module ships a minimal built-in set so a local checkout plus a short TOML
//! file exercises the whole pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use itertools::Itertools as _;
use log::info;
use regex::Regex;

use crate::model::{RelevantCommit, RuleResult, RuleStatus};
use crate::tracker::{IssueId, IssueRequest, Tracker};

/// Per-evaluation context handed to rules and notifiers.
#[derive(Clone, Debug)]
pub struct RuleContext {
    /// The account the audit runs on behalf of: the rule set's configured
    /// account, or the commit author when the matcher is the wildcard.
    pub triggering_account: String,
    pub ref_url: String,
    /// The ref's opaque configured metadata, e.g. a milestone number.
    pub metadata: Option<String>,
}

/// A unit of policy. `run` returns a terminal verdict or `Pending`; an `Err`
/// means the evaluation itself failed transiently and will be retried.
#[async_trait]
pub trait Rule: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, ctx: &RuleContext, commit: &RelevantCommit) -> anyhow::Result<RuleResult>;
}

/// Side-effectful violation handler. `prev_state` is the opaque string the
/// previous delivery attempt returned; implementations use it to stay
/// idempotent across retries.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        ctx: &RuleContext,
        commit: &RelevantCommit,
        prev_state: Option<&str>,
    ) -> anyhow::Result<String>;
}

#[derive(Clone, Debug)]
pub enum AccountMatcher {
    /// Wildcard; claims every commit.
    Any,
    Exact(String),
    Matches(Regex),
}

impl AccountMatcher {
    pub fn matches(&self, email: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(account) => account == email,
            Self::Matches(re) => re.is_match(email),
        }
    }
}

/// A named bundle of account matcher, ordered rule list and notifier binding.
pub struct RuleSet {
    pub name: String,
    pub account: AccountMatcher,
    /// Optional extra commit-message filter, ANDed with the account match.
    pub commit_filter: Option<Regex>,
    /// Order matters: the first rule error short-circuits the rest.
    pub rules: Vec<Arc<dyn Rule>>,
    pub notifier: Arc<dyn Notifier>,
}

impl RuleSet {
    /// Whether this rule set claims the commit. Author and committer both
    /// count; auto-committed changes carry the interesting account in the
    /// committer field.
    pub fn matches_commit(&self, author: &str, committer: &str, message: &str) -> bool {
        if !(self.account.matches(author) || self.account.matches(committer)) {
            return false;
        }
        match &self.commit_filter {
            Some(re) => re.is_match(message),
            None => true,
        }
    }

    pub fn triggering_account(&self, author: &str) -> String {
        match &self.account {
            AccountMatcher::Exact(account) => account.clone(),
            AccountMatcher::Any | AccountMatcher::Matches(_) => author.to_owned(),
        }
    }
}

/// Dynamically expands a configured entry into concrete refs, e.g. one per
/// active release milestone.
#[async_trait]
pub trait RefResolver: Send + Sync {
    async fn resolve(&self) -> anyhow::Result<Vec<ConcreteRef>>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConcreteRef {
    pub branch: String,
    pub metadata: Option<String>,
}

/// Code-supplied lookup tables the TOML config resolves its rule-set and
/// resolver names against.
#[derive(Default)]
pub struct Registry {
    rule_sets: HashMap<String, Arc<RuleSet>>,
    resolvers: HashMap<String, Arc<dyn RefResolver>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in demo rule set.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register_rule_set(Arc::new(RuleSet {
            name: "no-fixups".to_owned(),
            account: AccountMatcher::Any,
            commit_filter: None,
            rules: vec![Arc::new(RejectMessagePattern::new(
                "reject-fixup",
                r"(?m)^(fixup|squash)!",
            ))],
            notifier: Arc::new(LogNotifier),
        }));
        registry
    }

    pub fn register_rule_set(&mut self, rule_set: Arc<RuleSet>) {
        self.rule_sets.insert(rule_set.name.clone(), rule_set);
    }

    pub fn register_resolver(&mut self, name: impl Into<String>, resolver: Arc<dyn RefResolver>) {
        self.resolvers.insert(name.into(), resolver);
    }

    pub fn rule_set(&self, name: &str) -> Option<Arc<RuleSet>> {
        self.rule_sets.get(name).cloned()
    }

    pub fn resolver(&self, name: &str) -> Option<Arc<dyn RefResolver>> {
        self.resolvers.get(name).cloned()
    }
}

/// Built-in rule failing any commit whose message matches a pattern.
pub struct RejectMessagePattern {
    name: String,
    pattern: Regex,
}

impl RejectMessagePattern {
    pub fn new(name: impl Into<String>, pattern: &str) -> Self {
        Self {
            name: name.into(),
            pattern: Regex::new(pattern).expect("invalid built-in rule pattern"),
        }
    }
}

#[async_trait]
impl Rule for RejectMessagePattern {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _ctx: &RuleContext, commit: &RelevantCommit) -> anyhow::Result<RuleResult> {
        if self.pattern.is_match(&commit.commit_message) {
            Ok(RuleResult::new(
                self.name.clone(),
                RuleStatus::Failed,
                format!("commit message matches {:?}", self.pattern.as_str()),
            ))
        } else {
            Ok(RuleResult::new(self.name.clone(), RuleStatus::Passed, "ok"))
        }
    }
}

/// Notifier that files a tracker issue the first time a commit needs
/// attention and comments on that issue for every later state change. The
/// issue id doubles as the opaque delivery state, which is what makes
/// redelivery after a partial failure safe.
pub struct IssueNotifier {
    tracker: Arc<dyn Tracker>,
    project: String,
}

impl IssueNotifier {
    pub fn new(tracker: Arc<dyn Tracker>, project: impl Into<String>) -> Self {
        Self {
            tracker,
            project: project.into(),
        }
    }
}

#[async_trait]
impl Notifier for IssueNotifier {
    async fn notify(
        &self,
        ctx: &RuleContext,
        commit: &RelevantCommit,
        prev_state: Option<&str>,
    ) -> anyhow::Result<String> {
        let violations = commit
            .result
            .iter()
            .filter(|r| {
                matches!(
                    r.status,
                    RuleStatus::Failed | RuleStatus::NotificationRequired
                )
            })
            .map(|r| format!("{}: {}", r.rule_name, r.message))
            .join("\n");
        match prev_state {
            None => {
                let issue = self
                    .tracker
                    .create_issue(IssueRequest {
                        project: self.project.clone(),
                        summary: format!(
                            "policy violation in {} on {}",
                            commit.commit_hash, ctx.ref_url
                        ),
                        description: format!(
                            "Commit {} by {} violates configured policy:\n{}",
                            commit.commit_hash, commit.author_account, violations
                        ),
                        components: vec![],
                        labels: vec!["commit-audit-violation".to_owned()],
                    })
                    .await?;
                Ok(issue.to_string())
            }
            Some(state) => {
                let issue = IssueId(
                    state
                        .parse()
                        .with_context(|| format!("bad notifier state {:?}", state))?,
                );
                self.tracker.comment(issue, &violations).await?;
                Ok(state.to_owned())
            }
        }
    }
}

/// Notifier that only logs. Returns a constant state string so repeat
/// deliveries are visibly idempotent.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        ctx: &RuleContext,
        commit: &RelevantCommit,
        prev_state: Option<&str>,
    ) -> anyhow::Result<String> {
        if prev_state == Some("logged") {
            return Ok("logged".to_owned());
        }
        info!(
            "violation on {} by {} (triggered for {}): {}",
            ctx.ref_url,
            commit.author_account,
            ctx.triggering_account,
            commit
        );
        Ok("logged".to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_matcher_variants() {
        assert!(AccountMatcher::Any.matches("anyone@example.com"));
        assert!(AccountMatcher::Exact("bot@example.com".into()).matches("bot@example.com"));
        assert!(!AccountMatcher::Exact("bot@example.com".into()).matches("human@example.com"));
        let re = AccountMatcher::Matches(Regex::new(r".*@rollers\.example\.com$").unwrap());
        assert!(re.matches("autoroll@rollers.example.com"));
        assert!(!re.matches("autoroll@example.com"));
    }

    #[test]
    fn rule_set_matches_committer_too() {
        let rs = RuleSet {
            name: "rs".into(),
            account: AccountMatcher::Exact("bot@example.com".into()),
            commit_filter: None,
            rules: vec![],
            notifier: Arc::new(LogNotifier),
        };
        assert!(rs.matches_commit("human@example.com", "bot@example.com", "msg"));
        assert!(!rs.matches_commit("human@example.com", "other@example.com", "msg"));
    }

    #[test]
    fn commit_filter_narrows_the_claim() {
        let rs = RuleSet {
            name: "rs".into(),
            account: AccountMatcher::Any,
            commit_filter: Some(Regex::new(r"^Revert ").unwrap()),
            rules: vec![],
            notifier: Arc::new(LogNotifier),
        };
        assert!(rs.matches_commit("a@x", "c@x", "Revert \"thing\""));
        assert!(!rs.matches_commit("a@x", "c@x", "thing"));
    }

    #[test_log::test(tokio::test)]
    async fn issue_notifier_files_then_comments() {
        use crate::model::{CommitStatus, RuleResult};
        use crate::tracker::LogTracker;

        let tracker = Arc::new(LogTracker::new());
        let notifier = IssueNotifier::new(tracker.clone(), "proj");
        let ctx = RuleContext {
            triggering_account: "a@x".into(),
            ref_url: "https://example.com/repo/+/main".into(),
            metadata: None,
        };
        let mut commit = RelevantCommit {
            ref_url: ctx.ref_url.clone(),
            commit_hash: "abc".into(),
            previous_relevant_commit: "".into(),
            status: CommitStatus::ActionRequired,
            commit_time: std::time::SystemTime::UNIX_EPOCH,
            committer_account: "a@x".into(),
            author_account: "a@x".into(),
            commit_message: "msg".into(),
            result: vec![],
            retries: 0,
            notification_state: Default::default(),
            notified_all: false,
        };
        commit.set_result(RuleResult::new("r1", RuleStatus::Failed, "bad change"));

        let state = notifier.notify(&ctx, &commit, None).await.unwrap();
        assert_eq!(state, "1");
        assert_eq!(tracker.issues().len(), 1);
        assert!(tracker.issues()[0].description.contains("bad change"));

        // Redelivery with recorded state comments instead of re-filing.
        let state = notifier.notify(&ctx, &commit, Some(&state)).await.unwrap();
        assert_eq!(state, "1");
        assert_eq!(tracker.issues().len(), 1);
    }

    #[test]
    fn triggering_account_override() {
        let exact = RuleSet {
            name: "rs".into(),
            account: AccountMatcher::Exact("bot@example.com".into()),
            commit_filter: None,
            rules: vec![],
            notifier: Arc::new(LogNotifier),
        };
        assert_eq!(exact.triggering_account("human@x"), "bot@example.com");
        let wildcard = RuleSet {
            name: "rs".into(),
            account: AccountMatcher::Any,
            commit_filter: None,
            rules: vec![],
            notifier: Arc::new(LogNotifier),
        };
        assert_eq!(wildcard.triggering_account("human@x"), "human@x");
    }
}
