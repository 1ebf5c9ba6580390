//! Code table for storing and indexing compiled units.
//!
//! The code table provides:
//! - O(1) lookup of the live compiled unit for a lookup key
//! - Lookup by (receiver type, method) for super sends
//! - Address-to-unit resolution for return addresses
//! - Zombie tracking: retired units stay addressable until no activation
//!   can still return into them

use crate::lookup::LookupKey;
use kestrel_core::{CodeId, KlassId, MethodId, SiteId};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::collections::BTreeMap;

// =============================================================================
// Compiled Unit
// =============================================================================

/// Lifecycle state of a compiled unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Callable; the authoritative code for its key.
    Alive,
    /// Retired: no new calls, reclaimed once unreferenced.
    Zombie,
}

/// A compiled machine-code body for one (receiver type, method) pair.
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    /// Identity of this unit.
    pub id: CodeId,
    /// Customization key the unit was compiled for.
    pub key: LookupKey,
    /// Source method.
    pub method: MethodId,
    /// Base (and entry) address of the body.
    entry: usize,
    /// Size of the body in bytes.
    code_size: usize,
    /// Bytecode footprint including inlined callees.
    footprint: u32,
    /// Optimization level the unit was compiled at.
    level: u8,
    /// Invocation counter driving recompilation.
    invocation_counter: u32,
    /// Inline caches embedded in the body.
    sites: SmallVec<[SiteId; 8]>,
    /// Lifecycle state.
    state: UnitState,
    /// Set when the unit hit an uncommon trap and must be rebuilt.
    uncommon_trapped: bool,
}

impl CompiledUnit {
    /// Entry-point address.
    #[inline]
    pub fn entry(&self) -> usize {
        self.entry
    }

    /// Size of the body in bytes.
    #[inline]
    pub fn code_size(&self) -> usize {
        self.code_size
    }

    /// Bytecode footprint, the cost estimate used by the policy.
    #[inline]
    pub fn footprint(&self) -> u32 {
        self.footprint
    }

    /// Optimization level.
    #[inline]
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Current invocation counter.
    #[inline]
    pub fn invocation_counter(&self) -> u32 {
        self.invocation_counter
    }

    /// Increment the invocation counter and return the new value.
    #[inline]
    pub fn increment_invocation_counter(&mut self) -> u32 {
        self.invocation_counter = self.invocation_counter.saturating_add(1);
        self.invocation_counter
    }

    /// Overwrite the invocation counter.
    #[inline]
    pub fn set_invocation_counter(&mut self, value: u32) {
        self.invocation_counter = value;
    }

    /// Inline caches owned by this unit.
    #[inline]
    pub fn sites(&self) -> &[SiteId] {
        &self.sites
    }

    /// Record an inline cache embedded in the body.
    #[inline]
    pub fn add_site(&mut self, site: SiteId) {
        self.sites.push(site);
    }

    /// Lifecycle state.
    #[inline]
    pub fn state(&self) -> UnitState {
        self.state
    }

    /// Check if the unit has been retired.
    #[inline]
    pub fn is_zombie(&self) -> bool {
        self.state == UnitState::Zombie
    }

    /// Check if the unit hit an uncommon trap.
    #[inline]
    pub fn is_uncommon_trapped(&self) -> bool {
        self.uncommon_trapped
    }

    /// Flag the unit as having hit an uncommon trap.
    #[inline]
    pub fn mark_uncommon_trap(&mut self) {
        self.uncommon_trapped = true;
    }

    /// Check if this code contains a given address.
    #[inline]
    pub fn contains_address(&self, addr: usize) -> bool {
        addr >= self.entry && addr < self.entry + self.code_size
    }
}

/// Everything the table needs to install a unit.
#[derive(Debug, Clone, Copy)]
pub struct UnitSpec {
    /// Customization key.
    pub key: LookupKey,
    /// Source method.
    pub method: MethodId,
    /// Entry address in code space.
    pub entry: usize,
    /// Body size in bytes.
    pub code_size: usize,
    /// Bytecode footprint.
    pub footprint: u32,
    /// Optimization level.
    pub level: u8,
}

// =============================================================================
// Code Table
// =============================================================================

/// Owner of all compiled units, live and zombie.
#[derive(Debug, Default)]
pub struct CodeTable {
    units: FxHashMap<CodeId, CompiledUnit>,
    by_key: FxHashMap<LookupKey, CodeId>,
    by_method: FxHashMap<(KlassId, MethodId), CodeId>,
    by_address: BTreeMap<usize, CodeId>,
    next_id: u32,
    stats: CodeTableStats,
}

impl CodeTable {
    /// Create an empty code table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a new live unit.
    ///
    /// Any previous live unit for the same key must already be a zombie.
    pub fn install(&mut self, spec: UnitSpec) -> CodeId {
        assert!(
            !self.by_key.contains_key(&spec.key),
            "installing a second live unit for {}",
            spec.key
        );
        self.next_id += 1;
        let id = CodeId::new(self.next_id);
        let unit = CompiledUnit {
            id,
            key: spec.key,
            method: spec.method,
            entry: spec.entry,
            code_size: spec.code_size,
            footprint: spec.footprint,
            level: spec.level,
            invocation_counter: 0,
            sites: SmallVec::new(),
            state: UnitState::Alive,
            uncommon_trapped: false,
        };
        self.by_key.insert(spec.key, id);
        self.by_method.insert((spec.key.klass, spec.method), id);
        self.by_address.insert(spec.entry, id);
        self.units.insert(id, unit);
        self.stats.installs += 1;
        id
    }

    /// Get a unit, live or zombie.
    #[inline]
    pub fn get(&self, id: CodeId) -> Option<&CompiledUnit> {
        self.units.get(&id)
    }

    /// Check that a unit exists and is not a zombie.
    #[inline]
    pub fn is_live(&self, id: CodeId) -> bool {
        self.get(id).is_some_and(|u| !u.is_zombie())
    }

    /// Get a unit mutably.
    #[inline]
    pub fn get_mut(&mut self, id: CodeId) -> Option<&mut CompiledUnit> {
        self.units.get_mut(&id)
    }

    /// The live unit for a key.
    #[inline]
    pub fn lookup(&self, key: &LookupKey) -> Option<&CompiledUnit> {
        self.by_key.get(key).and_then(|id| self.units.get(id))
    }

    /// The live unit compiled from `method` for receivers of `klass`.
    #[inline]
    pub fn lookup_customized(&self, klass: KlassId, method: MethodId) -> Option<&CompiledUnit> {
        self.by_method
            .get(&(klass, method))
            .and_then(|id| self.units.get(id))
    }

    /// Find the unit whose body contains `addr`.
    pub fn find_by_address(&self, addr: usize) -> Option<&CompiledUnit> {
        let (_, id) = self.by_address.range(..=addr).next_back()?;
        self.units.get(id).filter(|u| u.contains_address(addr))
    }

    /// Retire a unit: it stops being the answer for its key but stays
    /// addressable. Returns `false` if it was already a zombie.
    pub fn make_zombie(&mut self, id: CodeId) -> bool {
        let Some(unit) = self.units.get_mut(&id) else {
            return false;
        };
        if unit.state == UnitState::Zombie {
            return false;
        }
        unit.state = UnitState::Zombie;
        let key = unit.key;
        let method = unit.method;
        if self.by_key.get(&key) == Some(&id) {
            self.by_key.remove(&key);
        }
        if self.by_method.get(&(key.klass, method)) == Some(&id) {
            self.by_method.remove(&(key.klass, method));
        }
        self.stats.zombies_made += 1;
        true
    }

    /// Remove every zombie that contains none of `active` addresses.
    ///
    /// Returns the reclaimed units so the caller can release their code
    /// space and call sites.
    pub fn reclaim_zombies(&mut self, active: &[usize]) -> Vec<CompiledUnit> {
        let dead: Vec<CodeId> = self
            .units
            .values()
            .filter(|u| u.is_zombie() && !active.iter().any(|&a| u.contains_address(a)))
            .map(|u| u.id)
            .collect();
        let mut reclaimed = Vec::with_capacity(dead.len());
        for id in dead {
            if let Some(unit) = self.units.remove(&id) {
                self.by_address.remove(&unit.entry);
                reclaimed.push(unit);
            }
        }
        self.stats.reclaimed += reclaimed.len() as u64;
        reclaimed
    }

    /// Ids of all units (live or zombie) compiled from `method`.
    pub fn units_for_method(&self, method: MethodId) -> Vec<CodeId> {
        let mut ids: Vec<_> = self
            .units
            .values()
            .filter(|u| u.method == method)
            .map(|u| u.id)
            .collect();
        ids.sort();
        ids
    }

    /// Iterate over all units.
    pub fn iter(&self) -> impl Iterator<Item = &CompiledUnit> {
        self.units.values()
    }

    /// Number of units, live and zombie.
    #[inline]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Check if the table is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Number of zombies awaiting reclamation.
    pub fn zombie_count(&self) -> usize {
        self.units.values().filter(|u| u.is_zombie()).count()
    }

    /// Get table statistics.
    #[inline]
    pub fn stats(&self) -> CodeTableStats {
        self.stats
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics for the code table.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CodeTableStats {
    /// Units installed.
    pub installs: u64,
    /// Units retired to zombie state.
    pub zombies_made: u64,
    /// Zombies reclaimed.
    pub reclaimed: u64,
}

// =============================================================================
// Tests
// =============================================================================
