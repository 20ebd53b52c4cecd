//! Commit-log collaborator interface. The pipeline only ever asks two
//! questions: "what is the tip of this branch" and "give me the log from a
//! committish down, excluding ancestors of the watermark". Implementations
//! must keep `NotFound` distinguishable from transport trouble; the fetcher's
//! force-push detection depends on it.

use std::time::SystemTime;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::CommitHash;

#[derive(Clone, Debug, PartialEq)]
pub struct Account {
    pub email: String,
    pub time: SystemTime,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Commit {
    pub id: CommitHash,
    pub author: Account,
    pub committer: Account,
    pub message: String,
    pub parents: Vec<CommitHash>,
}

#[derive(Error, Debug)]
pub enum LogError {
    /// The committish (or the excluded ancestor) is unknown to the remote.
    #[error("unknown ref or commit")]
    NotFound,
    #[error("commit log transport: {0}")]
    Transport(#[from] anyhow::Error),
}

#[async_trait]
pub trait GitLog: Send + Sync {
    /// Commits reachable from `committish` but not from
    /// `excluding_ancestors_of`, newest first, at most `page_size` entries.
    async fn log(
        &self,
        host: &str,
        project: &str,
        excluding_ancestors_of: Option<&str>,
        committish: &str,
        page_size: usize,
    ) -> Result<Vec<Commit>, LogError>;

    /// Current tip hash of a branch, or `None` if the branch doesn't exist.
    async fn branch_tip(
        &self,
        host: &str,
        project: &str,
        branch: &str,
    ) -> Result<Option<CommitHash>, LogError>;
}

/// Splits a configured repo base URL into the collaborator's (host, project)
/// pair. Plain filesystem paths (the local git-CLI backend) map to an empty
/// host with the path as the project.
pub fn split_repo_url(base: &str) -> anyhow::Result<(String, String)> {
    if let Some(scheme_end) = base.find("://") {
        let rest = &base[scheme_end + 3..];
        let slash = rest
            .find('/')
            .ok_or_else(|| anyhow::anyhow!("repo URL {:?} has no project path", base))?;
        let host = &base[..scheme_end + 3 + slash];
        let project = rest[slash + 1..].trim_end_matches('/');
        if project.is_empty() {
            anyhow::bail!("repo URL {:?} has an empty project path", base);
        }
        Ok((host.to_owned(), project.to_owned()))
    } else {
        Ok((String::new(), base.trim_end_matches('/').to_owned()))
    }
}

/// Canonical ref identifier for a branch of a repo, the primary key of its
/// [`crate::model::RefState`].
pub fn ref_url(base: &str, branch: &str) -> String {
    format!("{}/+/{}", base.trim_end_matches('/'), branch)
}
