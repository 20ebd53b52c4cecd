use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::Path,
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, bail, Context as _};
use serde::Deserialize;

use crate::gitlog;
use crate::rules::{ConcreteRef, RefResolver, Registry, RuleSet};

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub tuning: TuningFile,
    #[serde(default)]
    pub configs: BTreeMap<String, RefEntryFile>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct TuningFile {
    pub max_workers: Option<usize>,
    pub commits_per_worker: Option<usize>,
    pub max_retries_per_commit: Option<u32>,
    pub max_commits_per_ref_update: Option<usize>,
    pub stuck_scanner_s: Option<u64>,
    pub task_budget_s: Option<u64>,
    pub cadence_s: Option<u64>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct RefEntryFile {
    pub repo_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    pub starting_commit: String,
    pub metadata: Option<String>,
    /// Operator-supplied token that reseats the watermark of a paused ref.
    pub overwrite_last_known_commit: Option<String>,
    /// Ordered; evaluation order is significant.
    pub rule_sets: Vec<String>,
    /// Name of a registered dynamic ref resolver. Absent means the single
    /// static branch above.
    pub resolver: Option<String>,
}

fn default_branch() -> String {
    "main".to_owned()
}

/// Global knobs, resolved from [`TuningFile`] with service defaults.
#[derive(Clone, Debug)]
pub struct Tuning {
    pub max_workers: usize,
    pub commits_per_worker: usize,
    pub max_retries_per_commit: u32,
    pub max_commits_per_ref_update: usize,
    pub stuck_scanner_after: Duration,
    /// Wall-clock budget of one per-ref task. Strictly shorter than the
    /// cadence so a truncated task finishes before its successor starts.
    pub task_budget: Duration,
    pub cadence: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            max_workers: 8,
            commits_per_worker: 4,
            max_retries_per_commit: 6,
            max_commits_per_ref_update: 1000,
            stuck_scanner_after: Duration::from_secs(24 * 60 * 60),
            task_budget: Duration::from_secs(9 * 60 + 30),
            cadence: Duration::from_secs(10 * 60),
        }
    }
}

impl Tuning {
    fn from_file(file: &TuningFile) -> Self {
        let defaults = Self::default();
        Self {
            max_workers: file.max_workers.unwrap_or(defaults.max_workers),
            commits_per_worker: file.commits_per_worker.unwrap_or(defaults.commits_per_worker),
            max_retries_per_commit: file
                .max_retries_per_commit
                .unwrap_or(defaults.max_retries_per_commit),
            max_commits_per_ref_update: file
                .max_commits_per_ref_update
                .unwrap_or(defaults.max_commits_per_ref_update),
            stuck_scanner_after: file
                .stuck_scanner_s
                .map(Duration::from_secs)
                .unwrap_or(defaults.stuck_scanner_after),
            task_budget: file
                .task_budget_s
                .map(Duration::from_secs)
                .unwrap_or(defaults.task_budget),
            cadence: file
                .cadence_s
                .map(Duration::from_secs)
                .unwrap_or(defaults.cadence),
        }
    }
}

/// One configured entry: a repo base, a branch (or dynamic resolver) and the
/// ordered rule sets to audit its commits against.
pub struct RefEntry {
    pub config_name: String,
    pub repo_url: String,
    pub branch: String,
    pub starting_commit: String,
    pub metadata: Option<String>,
    pub overwrite_last_known_commit: Option<String>,
    pub rule_sets: Vec<Arc<RuleSet>>,
    pub resolver: Option<Arc<dyn RefResolver>>,
}

impl std::fmt::Debug for RefEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefEntry")
            .field("config_name", &self.config_name)
            .field("repo_url", &self.repo_url)
            .field("branch", &self.branch)
            .field("starting_commit", &self.starting_commit)
            .field("metadata", &self.metadata)
            .field("overwrite_last_known_commit", &self.overwrite_last_known_commit)
            .field("rule_sets", &self.rule_sets.iter().map(|rs| &rs.name).collect::<Vec<_>>())
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

impl RefEntry {
    /// Expands this entry into concrete refs: the static branch, or whatever
    /// the dynamic resolver currently reports.
    pub async fn concrete_refs(&self) -> anyhow::Result<Vec<ConcreteRef>> {
        match &self.resolver {
            Some(resolver) => resolver
                .resolve()
                .await
                .with_context(|| format!("resolving refs for config {:?}", self.config_name)),
            None => Ok(vec![ConcreteRef {
                branch: self.branch.clone(),
                metadata: self.metadata.clone(),
            }]),
        }
    }

    pub fn ref_url_for(&self, branch: &str) -> String {
        gitlog::ref_url(&self.repo_url, branch)
    }
}

/// Immutable configuration captured once per scheduler tick and passed by
/// `Arc` into every task run.
#[derive(Debug)]
pub struct Snapshot {
    pub tuning: Tuning,
    pub entries: Vec<Arc<RefEntry>>,
}

impl Snapshot {
    pub fn build(file: ConfigFile, registry: &Registry) -> anyhow::Result<Self> {
        let tuning = Tuning::from_file(&file.tuning);
        if tuning.task_budget >= tuning.cadence {
            bail!(
                "task budget ({:?}) must be shorter than the cadence ({:?})",
                tuning.task_budget,
                tuning.cadence
            );
        }
        let mut entries = Vec::new();
        for (config_name, entry) in file.configs {
            let mut seen = HashSet::new();
            let mut rule_sets = Vec::new();
            for name in &entry.rule_sets {
                if !seen.insert(name.as_str()) {
                    bail!(
                        "config {:?} references rule set {:?} twice",
                        config_name,
                        name
                    );
                }
                rule_sets.push(
                    registry
                        .rule_set(name)
                        .ok_or_else(|| anyhow!("undefined rule set {:?}", name))?,
                );
            }
            if rule_sets.is_empty() {
                bail!("config {:?} has no rule sets", config_name);
            }
            let resolver = match &entry.resolver {
                Some(name) => Some(
                    registry
                        .resolver(name)
                        .ok_or_else(|| anyhow!("undefined ref resolver {:?}", name))?,
                ),
                None => None,
            };
            entries.push(Arc::new(RefEntry {
                config_name,
                repo_url: entry.repo_url,
                branch: entry.branch,
                starting_commit: entry.starting_commit,
                metadata: entry.metadata,
                overwrite_last_known_commit: entry.overwrite_last_known_commit,
                rule_sets,
                resolver,
            }));
        }
        Ok(Self { tuning, entries })
    }

    pub fn entry(&self, config_name: &str) -> Option<&Arc<RefEntry>> {
        self.entries.iter().find(|e| e.config_name == config_name)
    }
}

pub fn load(path: &Path) -> anyhow::Result<ConfigFile> {
    let content = fs::read_to_string(path).context("couldn't read config")?;
    toml::from_str(&content).context("couldn't parse config")
}
