//! Selector interning.
//!
//! Message selectors are compared by identity throughout the dispatch core.
//! The interner maps selector names to dense `SelectorId`s, so two sends of
//! `at:put:` always carry the same handle and cache keys can hash the
//! handle instead of the text.

use crate::ids::SelectorId;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Thread-safe selector interner.
///
/// Identities start at 1; `SelectorId(0)` is never handed out.
pub struct SelectorTable {
    maps: RwLock<SelectorMaps>,
}

struct SelectorMaps {
    by_name: FxHashMap<Arc<str>, SelectorId>,
    names: Vec<Arc<str>>,
}

impl SelectorMaps {
    #[inline]
    fn with_capacity(capacity: usize) -> Self {
        Self {
            by_name: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
            names: Vec::with_capacity(capacity),
        }
    }
}

impl SelectorTable {
    /// Create an empty selector table.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create a selector table with preallocated capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            maps: RwLock::new(SelectorMaps::with_capacity(capacity)),
        }
    }

    /// Intern a selector name, returning its identity.
    pub fn intern(&self, name: &str) -> SelectorId {
        {
            let maps = self.maps.read();
            if let Some(&id) = maps.by_name.get(name) {
                return id;
            }
        }

        let mut maps = self.maps.write();
        // Another writer may have won the race between the two locks.
        if let Some(&id) = maps.by_name.get(name) {
            return id;
        }
        let raw = u32::try_from(maps.names.len() + 1).unwrap_or(u32::MAX);
        let id = SelectorId::new(raw);
        let name: Arc<str> = Arc::from(name);
        maps.names.push(Arc::clone(&name));
        maps.by_name.insert(name, id);
        id
    }

    /// Look up a selector without interning it.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<SelectorId> {
        self.maps.read().by_name.get(name).copied()
    }

    /// Resolve a selector identity back to its name.
    #[must_use]
    pub fn name(&self, id: SelectorId) -> Option<Arc<str>> {
        let index = (id.raw() as usize).checked_sub(1)?;
        self.maps.read().names.get(index).cloned()
    }

    /// Number of interned selectors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.maps.read().names.len()
    }

    /// Check if no selector has been interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SelectorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SelectorTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectorTable")
            .field("len", &self.len())
            .finish()
    }
}
