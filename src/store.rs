//! Durable per-ref state: one entity group per ref, rooted at the
//! [`RefState`] and owning its [`RelevantCommit`] children. All mutation of
//! child rows goes through [`Store::transact`]; the backing store is assumed
//! to rate-limit writes per entity group, so there is exactly one transaction
//! handle per ref at a time.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::model::{CommitHash, CommitStatus, RefState, RelevantCommit};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no state for ref {0}")]
    NoSuchRef(String),
    #[error("ref {0} already has state")]
    AlreadyExists(String),
    /// Transient backend failure; the task surfaces this as retryable.
    #[error("storage backend: {0}")]
    Backend(String),
}

/// Transaction handle scoped to one ref's entity group. Reads observe the
/// freshest stored state plus any writes buffered earlier in the same
/// transaction; writes become visible only if the closure returns `Ok`.
pub trait Txn: Send {
    fn ref_state(&mut self) -> Result<RefState, StoreError>;
    fn put_ref_state(&mut self, state: RefState);
    fn commit(&mut self, hash: &str) -> Result<Option<RelevantCommit>, StoreError>;
    fn put_commit(&mut self, commit: RelevantCommit);
}

pub type TxnFn<'a> = Box<dyn FnOnce(&mut dyn Txn) -> Result<(), StoreError> + Send + 'a>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn load_ref(&self, ref_url: &str) -> Result<Option<RefState>, StoreError>;
    /// Creates the entity group for a ref the scheduler hasn't seen before.
    async fn create_ref(&self, state: RefState) -> Result<(), StoreError>;
    /// Non-transactional save, permitted for watermark-style updates on the
    /// root entity only.
    async fn save_ref(&self, state: RefState) -> Result<(), StoreError>;
    async fn load_commit(
        &self,
        ref_url: &str,
        hash: &str,
    ) -> Result<Option<RelevantCommit>, StoreError>;
    /// Work-item queue: commits still workable (scheduled or pending),
    /// oldest first, capped at `limit`.
    async fn pending_commits(
        &self,
        ref_url: &str,
        limit: usize,
    ) -> Result<Vec<RelevantCommit>, StoreError>;
    /// Ancestor-scoped equality query used by the notifier passes.
    async fn commits_with_status(
        &self,
        ref_url: &str,
        status: CommitStatus,
        notified_all: bool,
    ) -> Result<Vec<RelevantCommit>, StoreError>;
    /// Batch existence check used by the classifier to de-duplicate.
    async fn existing_hashes(
        &self,
        ref_url: &str,
        hashes: &[CommitHash],
    ) -> Result<HashSet<CommitHash>, StoreError>;
    /// Runs `f` atomically within the ref's entity group.
    async fn transact(&self, ref_url: &str, f: TxnFn<'_>) -> Result<(), StoreError>;
}

#[derive(Clone)]
struct Group {
    state: RefState,
    commits: BTreeMap<CommitHash, RelevantCommit>,
}

/// In-process [`Store`] backing the local service and the test suite.
/// Transactions take the whole-map lock, run the closure against a scratch
/// copy of the group and swap it back in on success, which serialises writers
/// per ref and rolls back on error.
#[derive(Default)]
pub struct MemStore {
    groups: Mutex<HashMap<String, Group>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemTxn {
    group: Group,
}

impl Txn for MemTxn {
    fn ref_state(&mut self) -> Result<RefState, StoreError> {
        Ok(self.group.state.clone())
    }

    fn put_ref_state(&mut self, state: RefState) {
        self.group.state = state;
    }

    fn commit(&mut self, hash: &str) -> Result<Option<RelevantCommit>, StoreError> {
        Ok(self.group.commits.get(hash).cloned())
    }

    fn put_commit(&mut self, commit: RelevantCommit) {
        self.group.commits.insert(commit.commit_hash.clone(), commit);
    }
}

#[async_trait]
impl Store for MemStore {
    async fn load_ref(&self, ref_url: &str) -> Result<Option<RefState>, StoreError> {
        Ok(self.groups.lock().get(ref_url).map(|g| g.state.clone()))
    }

    async fn create_ref(&self, state: RefState) -> Result<(), StoreError> {
        let mut groups = self.groups.lock();
        if groups.contains_key(&state.ref_url) {
            return Err(StoreError::AlreadyExists(state.ref_url));
        }
        groups.insert(
            state.ref_url.clone(),
            Group {
                state,
                commits: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn save_ref(&self, state: RefState) -> Result<(), StoreError> {
        let mut groups = self.groups.lock();
        let group = groups
            .get_mut(&state.ref_url)
            .ok_or_else(|| StoreError::NoSuchRef(state.ref_url.clone()))?;
        group.state = state;
        Ok(())
    }

    async fn load_commit(
        &self,
        ref_url: &str,
        hash: &str,
    ) -> Result<Option<RelevantCommit>, StoreError> {
        let groups = self.groups.lock();
        let group = groups
            .get(ref_url)
            .ok_or_else(|| StoreError::NoSuchRef(ref_url.to_owned()))?;
        Ok(group.commits.get(hash).cloned())
    }

    async fn pending_commits(
        &self,
        ref_url: &str,
        limit: usize,
    ) -> Result<Vec<RelevantCommit>, StoreError> {
        let groups = self.groups.lock();
        let group = groups
            .get(ref_url)
            .ok_or_else(|| StoreError::NoSuchRef(ref_url.to_owned()))?;
        let mut pending: Vec<_> = group
            .commits
            .values()
            .filter(|c| c.status.is_workable())
            .cloned()
            .collect();
        pending.sort_by_key(|c| c.commit_time);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn commits_with_status(
        &self,
        ref_url: &str,
        status: CommitStatus,
        notified_all: bool,
    ) -> Result<Vec<RelevantCommit>, StoreError> {
        let groups = self.groups.lock();
        let group = groups
            .get(ref_url)
            .ok_or_else(|| StoreError::NoSuchRef(ref_url.to_owned()))?;
        let mut hits: Vec<_> = group
            .commits
            .values()
            .filter(|c| c.status == status && c.notified_all == notified_all)
            .cloned()
            .collect();
        hits.sort_by_key(|c| c.commit_time);
        Ok(hits)
    }

    async fn existing_hashes(
        &self,
        ref_url: &str,
        hashes: &[CommitHash],
    ) -> Result<HashSet<CommitHash>, StoreError> {
        let groups = self.groups.lock();
        let group = groups
            .get(ref_url)
            .ok_or_else(|| StoreError::NoSuchRef(ref_url.to_owned()))?;
        Ok(hashes
            .iter()
            .filter(|h| group.commits.contains_key(*h))
            .cloned()
            .collect())
    }

    async fn transact(&self, ref_url: &str, f: TxnFn<'_>) -> Result<(), StoreError> {
        let mut groups = self.groups.lock();
        let group = groups
            .get(ref_url)
            .ok_or_else(|| StoreError::NoSuchRef(ref_url.to_owned()))?;
        let mut txn = MemTxn {
            group: group.clone(),
        };
        f(&mut txn)?;
        groups.insert(ref_url.to_owned(), txn.group);
        Ok(())
    }
}
