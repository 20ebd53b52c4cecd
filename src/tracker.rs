//! Issue-tracker collaborator. The pipeline files issues in exactly two
//! situations: a ref got paused (stalled scanner, force push, oversized
//! backlog) and a commit exhausted its audit retries.

use std::fmt;
use std::fmt::Display;

use async_trait::async_trait;
use log::info;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IssueId(pub u64);

impl Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct IssueRequest {
    pub project: String,
    pub summary: String,
    pub description: String,
    pub components: Vec<String>,
    pub labels: Vec<String>,
}

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("tracker transport: {0}")]
    Transport(#[from] anyhow::Error),
}

#[async_trait]
pub trait Tracker: Send + Sync {
    async fn create_issue(&self, request: IssueRequest) -> Result<IssueId, TrackerError>;
    async fn comment(&self, issue: IssueId, body: &str) -> Result<(), TrackerError>;
}

/// Tracker that keeps filed issues in memory and logs them. Backs the local
/// binary and the test suite; real deployments plug in their tracker client.
#[derive(Default)]
pub struct LogTracker {
    issues: Mutex<Vec<IssueRequest>>,
}

impl LogTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issues(&self) -> Vec<IssueRequest> {
        self.issues.lock().clone()
    }
}

#[async_trait]
impl Tracker for LogTracker {
    async fn create_issue(&self, request: IssueRequest) -> Result<IssueId, TrackerError> {
        let mut issues = self.issues.lock();
        issues.push(request.clone());
        let id = IssueId(issues.len() as u64);
        info!(
            "filed issue {} in {}: {}",
            id, request.project, request.summary
        );
        Ok(id)
    }

    async fn comment(&self, issue: IssueId, body: &str) -> Result<(), TrackerError> {
        info!("comment on issue {}: {}", issue, body);
        Ok(())
    }
}
