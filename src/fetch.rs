//! Fetches the new commits on a ref, from the current tip down to the
//! persisted watermark. This stage owns the ref's circuit breaker: a stalled
//! scanner, an oversized backlog or a rewritten history all pause the ref and
//! file a tracker issue, and only a fresh operator override token resumes it.

use log::{info, warn};

use crate::config::{RefEntry, Tuning};
use crate::gitlog::{split_repo_url, Commit, LogError};
use crate::model::RefState;
use crate::store::StoreError;
use crate::task::{AuditError, Deps, TaskContext};
use crate::tracker::IssueRequest;

pub enum FetchOutcome {
    /// The ref is paused, either from before this run or because this run
    /// paused it. The task surfaces this as a conflict.
    Paused,
    /// New commits, newest first, possibly empty. Excludes the watermark.
    Log(Vec<Commit>),
}

pub async fn fetch_new_commits(
    ctx: &TaskContext,
    deps: &Deps,
    tuning: &Tuning,
    entry: &RefEntry,
    state: &mut RefState,
) -> Result<FetchOutcome, AuditError> {
    // A ref nobody has successfully scanned for too long is treated as stuck
    // rather than silently quiet; an operator gets a chance to look at it.
    if !state.paused {
        let stalled_for = ctx
            .now
            .duration_since(state.last_updated_time)
            .unwrap_or_default();
        if stalled_for > tuning.stuck_scanner_after {
            warn!(
                "{}: no complete scan pass for {:?}, pausing",
                state.ref_url, stalled_for
            );
            pause_ref(
                deps,
                state,
                &format!("scanner made no progress for {:?}", stalled_for),
            )
            .await?;
            return Ok(FetchOutcome::Paused);
        }
    }

    if state.paused {
        match &entry.overwrite_last_known_commit {
            Some(token) if *token != state.accepted_overwrite_token => {
                // Operator supplied a fresh override: reseat the watermark
                // there and resume scanning.
                info!(
                    "{}: honouring override token, watermark {} -> {}",
                    state.ref_url, state.last_known_commit, token
                );
                state.last_known_commit = token.clone();
                state.accepted_overwrite_token = token.clone();
                state.paused = false;
                state.last_updated_time = ctx.now;
                deps.store.save_ref(state.clone()).await?;
            }
            _ => return Ok(FetchOutcome::Paused),
        }
    }

    let (host, project) = split_repo_url(&entry.repo_url)?;
    let tip = deps
        .gitlog
        .branch_tip(&host, &project, &state.branch_name)
        .await
        .map_err(AuditError::Log)?
        .ok_or_else(|| {
            AuditError::Log(LogError::Transport(anyhow::anyhow!(
                "branch {:?} not found in {}",
                state.branch_name,
                entry.repo_url
            )))
        })?;

    match deps
        .gitlog
        .log(
            &host,
            &project,
            Some(&state.last_known_commit),
            &tip,
            tuning.max_commits_per_ref_update,
        )
        .await
    {
        Ok(log) if log.len() >= tuning.max_commits_per_ref_update => {
            warn!(
                "{}: {} or more unscanned commits, too far behind for one pass",
                state.ref_url,
                log.len()
            );
            pause_ref(
                deps,
                state,
                &format!(
                    "ref has at least {} unscanned commits, more than one pass can safely handle",
                    log.len()
                ),
            )
            .await?;
            Ok(FetchOutcome::Paused)
        }
        Ok(log) => Ok(FetchOutcome::Log(log)),
        Err(LogError::NotFound) => {
            // Either the tip vanished under us (transient) or the watermark
            // no longer exists (history was rewritten). Probe both ends to
            // tell the two apart.
            match deps.gitlog.log(&host, &project, None, &tip, 1).await {
                Err(e) => Err(AuditError::Log(e)),
                Ok(_) => match deps
                    .gitlog
                    .log(&host, &project, None, &state.last_known_commit, 1)
                    .await
                {
                    Err(LogError::NotFound) => {
                        warn!(
                            "{}: watermark {} unreachable, history was rewritten",
                            state.ref_url, state.last_known_commit
                        );
                        pause_ref(
                            deps,
                            state,
                            &format!(
                                "watermark {} is gone from the ref, likely a force push",
                                state.last_known_commit
                            ),
                        )
                        .await?;
                        Ok(FetchOutcome::Paused)
                    }
                    Err(e) => Err(AuditError::Log(e)),
                    // Both ends resolve individually; the range failure was a
                    // fluke. Let the scheduler retry.
                    Ok(_) => Err(AuditError::Log(LogError::Transport(anyhow::anyhow!(
                        "log of {}..{} failed but both ends exist",
                        state.last_known_commit,
                        tip
                    )))),
                },
            }
        }
        Err(e) => Err(AuditError::Log(e)),
    }
}

/// Pause protocol: persist the paused flag first, then file the tracker
/// issue. A tracker failure after the durable write still leaves the ref
/// safely paused.
async fn pause_ref(deps: &Deps, state: &mut RefState, reason: &str) -> Result<(), AuditError> {
    state.paused = true;
    let paused_at = state.clone();
    deps.store
        .transact(
            &state.ref_url,
            Box::new(move |txn| {
                let mut current = txn.ref_state()?;
                current.paused = true;
                current.accepted_overwrite_token = paused_at.accepted_overwrite_token.clone();
                txn.put_ref_state(current);
                Ok::<(), StoreError>(())
            }),
        )
        .await?;
    deps.metrics.inc("refs_paused");
    let issue = deps
        .tracker
        .create_issue(IssueRequest {
            project: state.config_name.clone(),
            summary: format!("commit audit paused on {}", state.ref_url),
            description: format!(
                "Auditing of {} is paused: {}.\n\n\
                 Resume it by setting overwrite_last_known_commit for this ref \
                 to a commit currently reachable from the tip.",
                state.ref_url, reason
            ),
            components: vec![],
            labels: vec!["commit-audit-paused".to_owned()],
        })
        .await?;
    info!("{}: paused, filed issue {}", state.ref_url, issue);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    use super::*;
    use crate::config::Tuning;
    use crate::gitlog::{Account, GitLog};
    use crate::metrics::Metrics;
    use crate::model::CommitHash;
    use crate::rules::Registry;
    use crate::store::{MemStore, Store};
    use crate::tracker::LogTracker;

    const REPO: &str = "https://example.com/repo";
    const REF: &str = "https://example.com/repo/+/main";

    // Scripted commit log: a linear history, newest first. NotFound is
    // reported the way a real backend does, based on whether the hashes are
    // known.
    struct FakeLog {
        history: Mutex<Vec<Commit>>,
    }

    impl FakeLog {
        fn linear(hashes: &[&str]) -> Self {
            let history = hashes
                .iter()
                .enumerate()
                .map(|(i, h)| Commit {
                    id: h.to_string(),
                    author: Account {
                        email: "author@example.com".into(),
                        time: SystemTime::UNIX_EPOCH + Duration::from_secs(1000 - i as u64),
                    },
                    committer: Account {
                        email: "committer@example.com".into(),
                        time: SystemTime::UNIX_EPOCH + Duration::from_secs(1000 - i as u64),
                    },
                    message: format!("commit {}", h),
                    parents: vec![],
                })
                .collect();
            Self {
                history: Mutex::new(history),
            }
        }
    }

    #[async_trait]
    impl GitLog for FakeLog {
        async fn log(
            &self,
            _host: &str,
            _project: &str,
            excluding_ancestors_of: Option<&str>,
            committish: &str,
            page_size: usize,
        ) -> Result<Vec<Commit>, LogError> {
            let history = self.history.lock();
            let from = history
                .iter()
                .position(|c| c.id == committish)
                .ok_or(LogError::NotFound)?;
            let until = match excluding_ancestors_of {
                Some(h) => history
                    .iter()
                    .position(|c| c.id == h)
                    .ok_or(LogError::NotFound)?,
                None => history.len(),
            };
            Ok(history[from..until].iter().take(page_size).cloned().collect())
        }

        async fn branch_tip(
            &self,
            _host: &str,
            _project: &str,
            branch: &str,
        ) -> Result<Option<CommitHash>, LogError> {
            if branch != "main" {
                return Ok(None);
            }
            Ok(self.history.lock().first().map(|c| c.id.clone()))
        }
    }

    struct Fixture {
        deps: Deps,
        tracker: Arc<LogTracker>,
        tuning: Tuning,
        entry: Arc<RefEntry>,
    }

    impl Fixture {
        async fn new(hashes: &[&str]) -> Self {
            let store = Arc::new(MemStore::new());
            let tracker = Arc::new(LogTracker::new());
            let deps = Deps {
                store: store.clone(),
                gitlog: Arc::new(FakeLog::linear(hashes)),
                tracker: tracker.clone(),
                metrics: Arc::new(Metrics::new()),
            };
            let registry = Registry::with_builtin();
            let entry = Arc::new(RefEntry {
                config_name: "cfg".into(),
                repo_url: REPO.into(),
                branch: "main".into(),
                starting_commit: "123456".into(),
                metadata: None,
                overwrite_last_known_commit: None,
                rule_sets: vec![registry.rule_set("no-fixups").unwrap()],
                resolver: None,
            });
            store
                .create_ref(RefState::seeded(
                    REF,
                    "cfg",
                    "main",
                    None,
                    "123456",
                    SystemTime::now(),
                ))
                .await
                .unwrap();
            Self {
                deps,
                tracker,
                tuning: Tuning::default(),
                entry,
            }
        }

        fn ctx(&self) -> TaskContext {
            TaskContext::new(Instant::now() + Duration::from_secs(60), SystemTime::now())
        }

        async fn state(&self) -> RefState {
            self.deps.store.load_ref(REF).await.unwrap().unwrap()
        }
    }

    #[test_log::test(tokio::test)]
    async fn fetches_down_to_watermark() {
        let fixture = Fixture::new(&["ccc", "bbb", "123456", "old"]).await;
        let mut state = fixture.state().await;
        let ctx = fixture.ctx();
        let outcome =
            fetch_new_commits(&ctx, &fixture.deps, &fixture.tuning, &fixture.entry, &mut state)
                .await
                .unwrap();
        let log = match outcome {
            FetchOutcome::Log(log) => log,
            FetchOutcome::Paused => panic!("unexpected pause"),
        };
        assert_eq!(
            log.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            vec!["ccc", "bbb"]
        );
    }

    #[test_log::test(tokio::test)]
    async fn empty_log_when_tip_is_watermark() {
        let fixture = Fixture::new(&["123456", "old"]).await;
        let mut state = fixture.state().await;
        let ctx = fixture.ctx();
        let outcome =
            fetch_new_commits(&ctx, &fixture.deps, &fixture.tuning, &fixture.entry, &mut state)
                .await
                .unwrap();
        assert!(matches!(outcome, FetchOutcome::Log(log) if log.is_empty()));
    }

    #[test_log::test(tokio::test)]
    async fn stalled_scanner_pauses_and_files_issue() {
        let fixture = Fixture::new(&["ccc", "123456"]).await;
        let mut state = fixture.state().await;
        let ctx = TaskContext::new(
            Instant::now() + Duration::from_secs(60),
            SystemTime::now() + Duration::from_secs(2 * 24 * 60 * 60),
        );
        let outcome =
            fetch_new_commits(&ctx, &fixture.deps, &fixture.tuning, &fixture.entry, &mut state)
                .await
                .unwrap();
        assert!(matches!(outcome, FetchOutcome::Paused));
        assert!(fixture.state().await.paused);
        let issues = fixture.tracker.issues();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].summary.contains(REF));
    }

    #[test_log::test(tokio::test)]
    async fn paused_ref_without_token_stays_idle() {
        let fixture = Fixture::new(&["ccc", "123456"]).await;
        let mut state = fixture.state().await;
        state.paused = true;
        fixture.deps.store.save_ref(state.clone()).await.unwrap();
        let ctx = fixture.ctx();
        let outcome =
            fetch_new_commits(&ctx, &fixture.deps, &fixture.tuning, &fixture.entry, &mut state)
                .await
                .unwrap();
        assert!(matches!(outcome, FetchOutcome::Paused));
        assert!(fixture.tracker.issues().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn fresh_override_token_unpauses_and_reseats() {
        let fixture = Fixture::new(&["ccc", "bbb", "123456"]).await;
        let mut state = fixture.state().await;
        state.paused = true;
        fixture.deps.store.save_ref(state.clone()).await.unwrap();
        let mut entry = RefEntry {
            config_name: "cfg".into(),
            repo_url: REPO.into(),
            branch: "main".into(),
            starting_commit: "123456".into(),
            metadata: None,
            overwrite_last_known_commit: Some("bbb".into()),
            rule_sets: fixture.entry.rule_sets.clone(),
            resolver: None,
        };
        let ctx = fixture.ctx();
        let outcome = fetch_new_commits(
            &ctx,
            &fixture.deps,
            &fixture.tuning,
            &entry,
            &mut state,
        )
        .await
        .unwrap();
        let log = match outcome {
            FetchOutcome::Log(log) => log,
            FetchOutcome::Paused => panic!("override token not honoured"),
        };
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].id, "ccc");
        let stored = fixture.state().await;
        assert!(!stored.paused);
        assert_eq!(stored.last_known_commit, "bbb");
        assert_eq!(stored.accepted_overwrite_token, "bbb");

        // The same token again does not unpause a second time.
        let mut stored = stored;
        stored.paused = true;
        fixture.deps.store.save_ref(stored.clone()).await.unwrap();
        entry.overwrite_last_known_commit = Some("bbb".into());
        let outcome = fetch_new_commits(
            &ctx,
            &fixture.deps,
            &fixture.tuning,
            &entry,
            &mut stored,
        )
        .await
        .unwrap();
        assert!(matches!(outcome, FetchOutcome::Paused));
    }

    #[test_log::test(tokio::test)]
    async fn force_push_pauses() {
        // Watermark "123456" is not in the rewritten history at all.
        let fixture = Fixture::new(&["ccc", "bbb"]).await;
        let mut state = fixture.state().await;
        let ctx = fixture.ctx();
        let outcome =
            fetch_new_commits(&ctx, &fixture.deps, &fixture.tuning, &fixture.entry, &mut state)
                .await
                .unwrap();
        assert!(matches!(outcome, FetchOutcome::Paused));
        assert!(fixture.state().await.paused);
        assert_eq!(fixture.tracker.issues().len(), 1);
        assert!(fixture.tracker.issues()[0]
            .description
            .contains("force push"));
    }

    #[test_log::test(tokio::test)]
    async fn oversized_backlog_pauses() {
        let fixture = Fixture::new(&["eee", "ddd", "ccc", "bbb", "123456"]).await;
        let mut state = fixture.state().await;
        let tuning = Tuning {
            max_commits_per_ref_update: 3,
            ..Tuning::default()
        };
        let ctx = fixture.ctx();
        let outcome =
            fetch_new_commits(&ctx, &fixture.deps, &tuning, &fixture.entry, &mut state)
                .await
                .unwrap();
        assert!(matches!(outcome, FetchOutcome::Paused));
        assert!(fixture.state().await.paused);
    }
}
