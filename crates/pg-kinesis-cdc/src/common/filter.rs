//! Table filtering for replication events
//!
//! A relation is streamed when the include list is empty or any include
//! pattern matches, and no exclude pattern matches. Excludes have strictly
//! higher precedence than includes. Decisions are memoized per relation
//! and never invalidated within a process lifetime, so `include()` is
//! deterministic for the whole run.

use crate::common::pattern::{PatternError, PatternSet};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Compiled include/exclude filter with a per-relation decision cache.
pub struct TableFilter {
    include: PatternSet,
    exclude: PatternSet,
    /// Relation → decision. Guarded by a parking_lot lock; never held
    /// across an `.await`.
    decisions: RwLock<HashMap<String, bool>>,
}

impl TableFilter {
    /// Compile a filter from include and exclude pattern lists.
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, PatternError> {
        Ok(Self {
            include: PatternSet::from_patterns(include)?,
            exclude: PatternSet::from_patterns(exclude)?,
            decisions: RwLock::new(HashMap::new()),
        })
    }

    /// Decide whether events on `relation` should be streamed.
    pub fn include(&self, relation: &str) -> bool {
        {
            let decisions = self.decisions.read();
            if let Some(&decision) = decisions.get(relation) {
                return decision;
            }
        }

        let mut decision = self.include.is_empty() || self.include.matches(relation);
        if self.exclude.matches(relation) {
            decision = false;
        }

        self.decisions.write().insert(relation.to_string(), decision);
        decision
    }

    /// Number of relations with a cached decision (for diagnostics).
    pub fn cached_relations(&self) -> usize {
        self.decisions.read().len()
    }
}
