//! Grid configuration: partitioning, replication timing, per-object settings
//! and split-brain protection policies.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{GridError, Result};
use crate::quorum::QuorumScope;
use crate::types::{DEFAULT_PARTITION_COUNT, MAX_BACKUP_COUNT};

/// How many sync backup acknowledgements release a caller's response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Every sync replica must acknowledge.
    All,
    /// A strict majority of the sync replicas must acknowledge.
    Majority,
    /// At most this many sync replicas must acknowledge.
    Count(usize),
}

impl AckPolicy {
    /// Returns the number of acks required out of `sync_replicas` targets.
    pub fn required(&self, sync_replicas: usize) -> usize {
        match self {
            AckPolicy::All => sync_replicas,
            AckPolicy::Majority => {
                if sync_replicas == 0 {
                    0
                } else {
                    sync_replicas / 2 + 1
                }
            }
            AckPolicy::Count(n) => (*n).min(sync_replicas),
        }
    }
}

impl Default for AckPolicy {
    fn default() -> Self {
        AckPolicy::All
    }
}

/// Per-object settings, matched by exact name or a single-`*` pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectConfig {
    /// Object name or pattern such as `"orders-*"`.
    pub name: String,
    /// Number of backups whose acks a sync invocation waits for.
    #[serde(default = "default_backup_count")]
    pub backup_count: usize,
    /// Number of additional backups that are never waited for.
    #[serde(default)]
    pub async_backup_count: usize,
    /// Name of the quorum policy protecting this object.
    #[serde(default)]
    pub quorum: Option<String>,
    /// Capacity for bounded containers: queue length, or entries per map fragment.
    #[serde(default)]
    pub max_size: Option<usize>,
}

fn default_backup_count() -> usize {
    1
}

impl ObjectConfig {
    /// Creates a config for `name` with default replication settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backup_count: default_backup_count(),
            async_backup_count: 0,
            quorum: None,
            max_size: None,
        }
    }

    /// Sets the sync and async backup counts.
    pub fn with_backups(mut self, sync: usize, async_count: usize) -> Self {
        self.backup_count = sync;
        self.async_backup_count = async_count;
        self
    }

    /// Attaches a quorum policy by name.
    pub fn with_quorum(mut self, quorum: impl Into<String>) -> Self {
        self.quorum = Some(quorum.into());
        self
    }

    /// Bounds the container size.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    /// Sync plus async backup count.
    pub fn total_backup_count(&self) -> usize {
        self.backup_count + self.async_backup_count
    }

    /// Returns true if this config's name matches `object_name`.
    pub fn matches(&self, object_name: &str) -> bool {
        matches_pattern(&self.name, object_name)
    }
}

/// Declares a split-brain protection policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumConfig {
    /// Policy name referenced by [`ObjectConfig::quorum`].
    pub name: String,
    /// Minimum reachable members; `None` means the policy is a predicate
    /// registered at runtime under the same name.
    #[serde(default)]
    pub min_cluster_size: Option<usize>,
    /// Which operations the policy gates.
    #[serde(default)]
    pub scope: QuorumScope,
}

impl QuorumConfig {
    /// Creates a minimum-member-count policy.
    pub fn min_members(name: impl Into<String>, min: usize, scope: QuorumScope) -> Self {
        Self {
            name: name.into(),
            min_cluster_size: Some(min),
            scope,
        }
    }

    /// Declares a predicate policy whose function is registered separately.
    pub fn predicate(name: impl Into<String>, scope: QuorumScope) -> Self {
        Self {
            name: name.into(),
            min_cluster_size: None,
            scope,
        }
    }
}

/// Top-level configuration for a grid node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Number of partitions the keyspace is split into.
    pub partition_count: u32,
    /// Number of partition worker tasks.
    pub worker_count: usize,
    /// Bound on the wait for sync backup acknowledgements.
    pub backup_ack_timeout_ms: u64,
    /// How many sync acks release the caller.
    pub ack_policy: AckPolicy,
    /// Bound on a migration's snapshot transfer and catch-up.
    pub migration_timeout_ms: u64,
    /// Consecutive failed backup sends before a replica is reported unreachable.
    pub unreachable_threshold: u32,
    /// Per-object settings.
    pub objects: Vec<ObjectConfig>,
    /// Split-brain protection policies.
    pub quorums: Vec<QuorumConfig>,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            partition_count: DEFAULT_PARTITION_COUNT,
            worker_count: 4,
            backup_ack_timeout_ms: 5_000,
            ack_policy: AckPolicy::All,
            migration_timeout_ms: 10_000,
            unreachable_threshold: 3,
            objects: Vec::new(),
            quorums: Vec::new(),
        }
    }
}

impl GridConfig {
    /// Loads a config from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| GridError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Self::from_toml_str(&contents),
            "json" => serde_json::from_str(&contents)
                .map_err(|e| GridError::Config(format!("invalid JSON config: {}", e))),
            _ => Err(GridError::Config(format!(
                "unsupported config file extension: {}",
                ext
            ))),
        }
    }

    /// Parses a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| GridError::Config(format!("invalid TOML config: {}", e)))
    }

    /// Checks the structural invariants of the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.partition_count == 0 {
            return Err(GridError::Config("partition_count must be > 0".into()));
        }
        if self.worker_count == 0 {
            return Err(GridError::Config("worker_count must be > 0".into()));
        }

        let mut quorum_names = HashSet::new();
        for quorum in &self.quorums {
            if !quorum_names.insert(quorum.name.as_str()) {
                return Err(GridError::Config(format!(
                    "duplicate quorum name: {}",
                    quorum.name
                )));
            }
        }

        let mut object_names = HashSet::new();
        for object in &self.objects {
            if !object_names.insert(object.name.as_str()) {
                return Err(GridError::Config(format!(
                    "duplicate object config: {}",
                    object.name
                )));
            }
            if object.name.matches('*').count() > 1 {
                return Err(GridError::Config(format!(
                    "object pattern {} has more than one wildcard",
                    object.name
                )));
            }
            if object.total_backup_count() > MAX_BACKUP_COUNT {
                return Err(GridError::Config(format!(
                    "{}: total backup count {} exceeds {}",
                    object.name,
                    object.total_backup_count(),
                    MAX_BACKUP_COUNT
                )));
            }
            if let Some(quorum) = &object.quorum {
                if !quorum_names.contains(quorum.as_str()) {
                    return Err(GridError::Config(format!(
                        "{} references unknown quorum {}",
                        object.name, quorum
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolves the settings for an object name.
    ///
    /// Exact names win over patterns; among patterns the longest wins.
    /// Unmatched names get the defaults.
    pub fn object_config(&self, object_name: &str) -> ObjectConfig {
        if let Some(exact) = self.objects.iter().find(|o| o.name == object_name) {
            return exact.clone();
        }
        self.objects
            .iter()
            .filter(|o| o.name.contains('*') && o.matches(object_name))
            .max_by_key(|o| o.name.len())
            .map(|o| ObjectConfig {
                name: object_name.to_string(),
                ..o.clone()
            })
            .unwrap_or_else(|| ObjectConfig::new(object_name))
    }

    /// Looks up a quorum declaration by name.
    pub fn quorum_config(&self, name: &str) -> Option<&QuorumConfig> {
        self.quorums.iter().find(|q| q.name == name)
    }

    /// Replaces or inserts an object config, keyed by its name.
    pub fn upsert_object(&mut self, config: ObjectConfig) {
        match self.objects.iter_mut().find(|o| o.name == config.name) {
            Some(existing) => *existing = config,
            None => self.objects.push(config),
        }
    }

    /// Replaces or inserts a quorum declaration, keyed by its name.
    pub fn upsert_quorum(&mut self, config: QuorumConfig) {
        match self.quorums.iter_mut().find(|q| q.name == config.name) {
            Some(existing) => *existing = config,
            None => self.quorums.push(config),
        }
    }

    /// Sync backup acknowledgement timeout.
    pub fn backup_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.backup_ack_timeout_ms)
    }

    /// Migration transfer timeout.
    pub fn migration_timeout(&self) -> Duration {
        Duration::from_millis(self.migration_timeout_ms)
    }
}

/// Matches `name` against an exact name or a pattern with one `*`.
pub fn matches_pattern(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == name,
        Some((prefix, suffix)) => {
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        }
    }
}
