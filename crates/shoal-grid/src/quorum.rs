//! Split-brain protection gate.
//!
//! Before an operation is handed to a partition worker, the gate resolves the
//! target object's quorum policy and evaluates it against the current
//! membership view. Resolution is memoized per object name; evaluation is not.
//!
//! Every invalidation bumps a generation counter. Cached entries carry the
//! generation of the config they were built from, and an entry older than
//! the caller's generation is rebuilt, so a lookup racing a config change can
//! never pin the old policy.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::config::GridConfig;
use crate::error::{GridError, Result};
use crate::membership::MembershipView;
use crate::operation::OperationScope;

/// Which operations a quorum policy gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumScope {
    /// Only read operations are gated.
    Read,
    /// Only mutating operations are gated.
    Write,
    /// Every operation is gated.
    ReadWrite,
}

impl QuorumScope {
    /// Returns true if an operation of `scope` is subject to this policy.
    pub fn covers(&self, scope: OperationScope) -> bool {
        match self {
            QuorumScope::ReadWrite => true,
            QuorumScope::Read => scope == OperationScope::Read,
            QuorumScope::Write => scope == OperationScope::Write,
        }
    }
}

impl Default for QuorumScope {
    fn default() -> Self {
        QuorumScope::ReadWrite
    }
}

/// A custom health predicate over the membership view.
pub type QuorumPredicate = Arc<dyn Fn(&MembershipView) -> bool + Send + Sync>;

/// How a policy decides whether the cluster is healthy enough.
#[derive(Clone)]
pub enum QuorumFunction {
    /// Passes iff at least this many members are reachable.
    MinimumMembers(usize),
    /// Passes iff the predicate returns true.
    Predicate(QuorumPredicate),
}

impl fmt::Debug for QuorumFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuorumFunction::MinimumMembers(n) => write!(f, "MinimumMembers({})", n),
            QuorumFunction::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// A resolved split-brain protection policy.
#[derive(Debug, Clone)]
pub struct QuorumPolicy {
    /// Policy name.
    pub name: String,
    /// Operations gated by the policy.
    pub scope: QuorumScope,
    /// Decision function.
    pub function: QuorumFunction,
}

impl QuorumPolicy {
    /// Evaluates the policy against a membership snapshot.
    pub fn is_present(&self, view: &MembershipView) -> bool {
        match &self.function {
            QuorumFunction::MinimumMembers(min) => view.reachable_count() >= *min,
            QuorumFunction::Predicate(predicate) => predicate(view),
        }
    }
}

/// A memoized resolution and the config generation it was built from.
#[derive(Clone)]
struct CachedPolicy {
    generation: u64,
    policy: Option<Arc<QuorumPolicy>>,
}

/// Memoizing gate that rejects operations when their object's quorum is absent.
pub struct QuorumGate {
    /// Object name to resolved policy; `None` records "no policy".
    cache: DashMap<String, CachedPolicy>,
    /// Construction locks for names being resolved right now.
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Predicates registered at runtime, keyed by quorum name.
    predicates: RwLock<HashMap<String, QuorumPredicate>>,
    generation: AtomicU64,
}

impl QuorumGate {
    /// Creates an empty gate.
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
            locks: DashMap::new(),
            predicates: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Current config generation.
    ///
    /// Read it together with the config passed to [`QuorumGate::check_at`]:
    /// a config swap followed by an invalidation must not fall between the two.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Registers the predicate backing a quorum declared without a member count.
    pub fn register_predicate(&self, quorum: impl Into<String>, predicate: QuorumPredicate) {
        self.predicates.write().insert(quorum.into(), predicate);
        self.invalidate_all();
    }

    /// Drops the memoized policy for one object name.
    ///
    /// Also ages every other entry, which is rebuilt on its next lookup.
    pub fn invalidate(&self, object_name: &str) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cache.remove(object_name);
    }

    /// Drops every memoized policy.
    pub fn invalidate_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cache.clear();
    }

    /// Number of memoized object names.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Resolves the policy protecting `object_name` against the latest config.
    pub fn resolve(
        &self,
        object_name: &str,
        config: &GridConfig,
    ) -> Result<Option<Arc<QuorumPolicy>>> {
        self.resolve_at(self.generation(), object_name, config)
    }

    /// Resolves the policy protecting `object_name` from a config read at `generation`.
    pub fn resolve_at(
        &self,
        generation: u64,
        object_name: &str,
        config: &GridConfig,
    ) -> Result<Option<Arc<QuorumPolicy>>> {
        if let Some(policy) = self.cached(object_name, generation) {
            return Ok(policy);
        }

        let lock = self
            .locks
            .entry(object_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let resolved = {
            let _guard = lock.lock();
            match self.cached(object_name, generation) {
                Some(policy) => Ok(policy),
                None => self.build_policy(object_name, config).map(|policy| {
                    // a config read before the last invalidation is not memoized
                    if generation == self.generation() {
                        self.cache.insert(
                            object_name.to_string(),
                            CachedPolicy {
                                generation,
                                policy: policy.clone(),
                            },
                        );
                    }
                    policy
                }),
            }
        };
        self.locks
            .remove_if(object_name, |_, held| Arc::ptr_eq(held, &lock) && Arc::strong_count(held) <= 2);
        resolved
    }

    /// Construction locks currently held or awaited.
    pub fn pending_locks(&self) -> usize {
        self.locks.len()
    }

    fn cached(&self, object_name: &str, generation: u64) -> Option<Option<Arc<QuorumPolicy>>> {
        let entry = self.cache.get(object_name)?;
        if entry.generation < generation {
            return None;
        }
        Some(entry.policy.clone())
    }

    fn build_policy(
        &self,
        object_name: &str,
        config: &GridConfig,
    ) -> Result<Option<Arc<QuorumPolicy>>> {
        let quorum_name = match config.object_config(object_name).quorum {
            Some(name) => name,
            None => return Ok(None),
        };

        let declared = config.quorum_config(&quorum_name).ok_or_else(|| {
            GridError::Config(format!(
                "{} references unknown quorum {}",
                object_name, quorum_name
            ))
        })?;

        let function = match declared.min_cluster_size {
            Some(min) => QuorumFunction::MinimumMembers(min),
            None => {
                let predicate = self.predicates.read().get(&quorum_name).cloned();
                match predicate {
                    Some(p) => QuorumFunction::Predicate(p),
                    None => {
                        return Err(GridError::Config(format!(
                            "quorum {} has no member count and no registered predicate",
                            quorum_name
                        )))
                    }
                }
            }
        };

        Ok(Some(Arc::new(QuorumPolicy {
            name: quorum_name,
            scope: declared.scope,
            function,
        })))
    }

    /// Fails with `QuorumNotMet` if the object's policy covers `scope` and is absent.
    pub fn check(
        &self,
        object_name: &str,
        scope: OperationScope,
        view: &MembershipView,
        config: &GridConfig,
    ) -> Result<()> {
        self.check_at(self.generation(), object_name, scope, view, config)
    }

    /// Same as [`QuorumGate::check`] for a config read at `generation`.
    pub fn check_at(
        &self,
        generation: u64,
        object_name: &str,
        scope: OperationScope,
        view: &MembershipView,
        config: &GridConfig,
    ) -> Result<()> {
        let policy = match self.resolve_at(generation, object_name, config)? {
            Some(policy) => policy,
            None => return Ok(()),
        };
        if !policy.scope.covers(scope) {
            return Ok(());
        }
        if policy.is_present(view) {
            return Ok(());
        }

        debug!(
            object = object_name,
            quorum = %policy.name,
            reachable = view.reachable_count(),
            "rejecting operation: quorum not present"
        );
        Err(GridError::QuorumNotMet {
            object: object_name.to_string(),
            quorum: policy.name.clone(),
            reachable: view.reachable_count(),
        })
    }
}

impl Default for QuorumGate {
    fn default() -> Self {
        Self::new()
    }
}
