//! Periodic scheduler: expands every configured entry into concrete refs,
//! seeds state for refs it hasn't seen before and enqueues one audit task per
//! ref. One entry's failure never blocks the others; the transport delivers
//! at least once and the task handler is safe against duplicate delivery.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use log::{error, info};
use tokio::sync::mpsc;

use crate::config::{RefEntry, Snapshot};
use crate::model::RefState;
use crate::rules::ConcreteRef;
use crate::store::StoreError;
use crate::task::Deps;

/// Task transport contract: hand off a relative handler URI, at least once.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, relative_uri: &str, method: &str) -> anyhow::Result<()>;
}

/// Queue whose consumer side feeds the task handler in this process.
pub struct InProcessQueue {
    tx: mpsc::UnboundedSender<String>,
}

impl InProcessQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TaskQueue for InProcessQueue {
    async fn enqueue(&self, relative_uri: &str, _method: &str) -> anyhow::Result<()> {
        self.tx
            .send(relative_uri.to_owned())
            .map_err(|_| anyhow::anyhow!("task consumer is gone"))
    }
}

/// The ref identifier rides in the handler URI's query string.
pub fn audit_task_uri(ref_url: &str) -> String {
    let encoded: String = form_urlencoded::byte_serialize(ref_url.as_bytes()).collect();
    format!("/task/audit?ref={}", encoded)
}

pub fn ref_from_query(query: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "ref")
        .map(|(_, value)| value.into_owned())
}

pub fn ref_from_task_uri(uri: &str) -> Option<String> {
    ref_from_query(uri.split_once('?')?.1)
}

/// One scheduler pass over the whole configuration.
pub async fn tick(snapshot: &Snapshot, deps: &Deps, queue: &Arc<dyn TaskQueue>, now: SystemTime) {
    for entry in &snapshot.entries {
        let concrete = match entry.concrete_refs().await {
            Ok(refs) => refs,
            Err(e) => {
                deps.metrics.inc("resolver_failures");
                error!("{:#}", e);
                continue;
            }
        };
        for concrete_ref in concrete {
            match schedule_ref(entry, &concrete_ref, deps, queue, now).await {
                Ok(()) => deps.metrics.inc_with("scheduler_runs", "ok"),
                Err(e) => {
                    deps.metrics.inc_with("scheduler_runs", "error");
                    error!(
                        "couldn't schedule {}: {:#}",
                        entry.ref_url_for(&concrete_ref.branch),
                        e
                    );
                }
            }
        }
    }
}

async fn schedule_ref(
    entry: &Arc<RefEntry>,
    concrete_ref: &ConcreteRef,
    deps: &Deps,
    queue: &Arc<dyn TaskQueue>,
    now: SystemTime,
) -> anyhow::Result<()> {
    let ref_url = entry.ref_url_for(&concrete_ref.branch);
    if deps.store.load_ref(&ref_url).await?.is_none() {
        info!("seeding state for new ref {}", ref_url);
        let seeded = RefState::seeded(
            &ref_url,
            &entry.config_name,
            &concrete_ref.branch,
            concrete_ref.metadata.clone(),
            &entry.starting_commit,
            now,
        );
        match deps.store.create_ref(seeded).await {
            // A concurrent scheduler pass beat us to it, which is fine.
            Err(StoreError::AlreadyExists(_)) | Ok(()) => {}
            Err(e) => return Err(e.into()),
        }
    }
    queue.enqueue(&audit_task_uri(&ref_url), "POST").await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::metrics::Metrics;
    use crate::rules::{RefResolver, Registry};
    use crate::store::MemStore;
    use crate::tracker::LogTracker;

    fn deps() -> Deps {
        Deps {
            store: Arc::new(MemStore::new()),
            gitlog: Arc::new(PanicLog),
            tracker: Arc::new(LogTracker::new()),
            metrics: Arc::new(Metrics::new()),
        }
    }

    struct PanicLog;

    #[async_trait]
    impl crate::gitlog::GitLog for PanicLog {
        async fn log(
            &self,
            _: &str,
            _: &str,
            _: Option<&str>,
            _: &str,
            _: usize,
        ) -> Result<Vec<crate::gitlog::Commit>, crate::gitlog::LogError> {
            panic!("unexpected log call")
        }

        async fn branch_tip(
            &self,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<Option<String>, crate::gitlog::LogError> {
            panic!("unexpected branch_tip call")
        }
    }

    fn entry(config_name: &str, repo_url: &str) -> Arc<RefEntry> {
        let registry = Registry::with_builtin();
        Arc::new(RefEntry {
            config_name: config_name.into(),
            repo_url: repo_url.into(),
            branch: "main".into(),
            starting_commit: "123456".into(),
            metadata: None,
            overwrite_last_known_commit: None,
            rule_sets: vec![registry.rule_set("no-fixups").unwrap()],
            resolver: None,
        })
    }

    fn snapshot(entries: Vec<Arc<RefEntry>>) -> Snapshot {
        Snapshot {
            tuning: Default::default(),
            entries,
        }
    }

    #[test_log::test(tokio::test)]
    async fn seeds_state_and_enqueues_each_ref() {
        let deps = deps();
        let (queue, mut rx) = InProcessQueue::new();
        let queue: Arc<dyn TaskQueue> = Arc::new(queue);
        let snapshot = snapshot(vec![
            entry("a", "https://example.com/a"),
            entry("b", "https://example.com/b"),
        ]);
        tick(&snapshot, &deps, &queue, SystemTime::UNIX_EPOCH).await;

        let state = deps
            .store
            .load_ref("https://example.com/a/+/main")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.last_known_commit, "123456");
        assert_eq!(state.config_name, "a");

        let mut uris = vec![rx.try_recv().unwrap(), rx.try_recv().unwrap()];
        uris.sort();
        assert_eq!(
            uris,
            vec![
                "/task/audit?ref=https%3A%2F%2Fexample.com%2Fa%2F%2B%2Fmain",
                "/task/audit?ref=https%3A%2F%2Fexample.com%2Fb%2F%2B%2Fmain",
            ]
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(deps.metrics.get("scheduler_runs{ok}"), 2);
    }

    #[test_log::test(tokio::test)]
    async fn existing_state_is_left_alone() {
        let deps = deps();
        let (queue, mut rx) = InProcessQueue::new();
        let queue: Arc<dyn TaskQueue> = Arc::new(queue);
        let mut existing = RefState::seeded(
            "https://example.com/a/+/main",
            "a",
            "main",
            None,
            "123456",
            SystemTime::UNIX_EPOCH,
        );
        existing.last_known_commit = "fedcba".into();
        deps.store.create_ref(existing.clone()).await.unwrap();

        let snapshot = snapshot(vec![entry("a", "https://example.com/a")]);
        tick(&snapshot, &deps, &queue, SystemTime::UNIX_EPOCH + Duration::from_secs(5)).await;

        let state = deps
            .store
            .load_ref("https://example.com/a/+/main")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.last_known_commit, "fedcba");
        assert!(rx.try_recv().is_ok());
    }

    #[test_log::test(tokio::test)]
    async fn resolver_failure_doesnt_block_other_entries() {
        struct BrokenResolver;

        #[async_trait]
        impl RefResolver for BrokenResolver {
            async fn resolve(&self) -> anyhow::Result<Vec<ConcreteRef>> {
                anyhow::bail!("milestone service is down")
            }
        }

        let deps = deps();
        let (queue, mut rx) = InProcessQueue::new();
        let queue: Arc<dyn TaskQueue> = Arc::new(queue);
        let registry = Registry::with_builtin();
        let broken = Arc::new(RefEntry {
            config_name: "broken".into(),
            repo_url: "https://example.com/broken".into(),
            branch: "main".into(),
            starting_commit: "123456".into(),
            metadata: None,
            overwrite_last_known_commit: None,
            rule_sets: vec![registry.rule_set("no-fixups").unwrap()],
            resolver: Some(Arc::new(BrokenResolver)),
        });
        let snapshot = snapshot(vec![broken, entry("ok", "https://example.com/ok")]);
        tick(&snapshot, &deps, &queue, SystemTime::UNIX_EPOCH).await;

        assert_eq!(deps.metrics.get("resolver_failures"), 1);
        assert_eq!(
            ref_from_task_uri(&rx.try_recv().unwrap()).unwrap(),
            "https://example.com/ok/+/main"
        );
    }

    #[test_log::test(tokio::test)]
    async fn dynamic_resolver_expands_to_many_refs() {
        struct Milestones;

        #[async_trait]
        impl RefResolver for Milestones {
            async fn resolve(&self) -> anyhow::Result<Vec<ConcreteRef>> {
                Ok(vec![
                    ConcreteRef {
                        branch: "release-120".into(),
                        metadata: Some("120".into()),
                    },
                    ConcreteRef {
                        branch: "release-121".into(),
                        metadata: Some("121".into()),
                    },
                ])
            }
        }

        let deps = deps();
        let (queue, mut rx) = InProcessQueue::new();
        let queue: Arc<dyn TaskQueue> = Arc::new(queue);
        let registry = Registry::with_builtin();
        let snapshot = snapshot(vec![Arc::new(RefEntry {
            config_name: "releases".into(),
            repo_url: "https://example.com/r".into(),
            branch: "main".into(),
            starting_commit: "123456".into(),
            metadata: None,
            overwrite_last_known_commit: None,
            rule_sets: vec![registry.rule_set("no-fixups").unwrap()],
            resolver: Some(Arc::new(Milestones)),
        })]);
        tick(&snapshot, &deps, &queue, SystemTime::UNIX_EPOCH).await;

        let state = deps
            .store
            .load_ref("https://example.com/r/+/release-120")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.metadata.as_deref(), Some("120"));
        assert_eq!(state.branch_name, "release-120");
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn task_uri_roundtrips_the_ref() {
        let uri = audit_task_uri("https://example.com/a b/+/main");
        assert_eq!(ref_from_task_uri(&uri).unwrap(), "https://example.com/a b/+/main");
        assert_eq!(ref_from_task_uri("/task/audit"), None);
    }
}
