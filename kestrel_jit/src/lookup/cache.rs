//! Global method lookup cache.
//!
//! Memoizes (receiver type, selector) → `LookupResult`. Two tables are
//! addressed by different bits of the key hash:
//!
//! - a large direct-mapped **primary** table, checked first;
//! - a small **secondary** table holding entries evicted from primary.
//!
//! A secondary hit promotes the entry back into primary (demoting whatever
//! it displaces). A miss in both performs the full resolution (compiled
//! code first, then method-dictionary search) and inserts into primary.
//!
//! There is no per-entry expiry. The whole cache, or the entries for one
//! key, must be flushed whenever a method is compiled, a compiled unit is
//! retired, or a collection relocates objects.

use super::{LookupKey, LookupResult};
use crate::runtime::code_table::CodeTable;
use crate::runtime::collaborators::ObjectModel;
use kestrel_core::{CodeId, KlassId, MethodId, SelectorId};
use std::fmt;

// =============================================================================
// Constants
// =============================================================================

/// Size of the primary table (power of 2).
pub const PRIMARY_CACHE_SIZE: usize = 4 * 1024;

/// Size of the secondary table (power of 2).
pub const SECONDARY_CACHE_SIZE: usize = 512;

/// Shift selecting the secondary index bits.
const SECONDARY_SHIFT: u32 = 32;

// =============================================================================
// Lookup Cache
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    key: LookupKey,
    result: LookupResult,
}

/// The process-wide lookup cache.
///
/// All mutation happens while the rest of the system is stopped, so the
/// cache is a plain value handed around by `&mut`.
#[derive(Debug)]
pub struct LookupCache {
    primary: Box<[Option<CacheEntry>]>,
    secondary: Box<[Option<CacheEntry>]>,
    primary_mask: usize,
    secondary_mask: usize,
    primary_hits: u64,
    secondary_hits: u64,
    misses: u64,
}

impl LookupCache {
    /// Create a cache with the default table sizes.
    pub fn new() -> Self {
        Self::with_sizes(PRIMARY_CACHE_SIZE, SECONDARY_CACHE_SIZE)
    }

    /// Create a cache with explicit table sizes (powers of two).
    pub fn with_sizes(primary: usize, secondary: usize) -> Self {
        assert!(primary.is_power_of_two(), "primary size must be a power of 2");
        assert!(
            secondary.is_power_of_two(),
            "secondary size must be a power of 2"
        );
        Self {
            primary: vec![None; primary].into_boxed_slice(),
            secondary: vec![None; secondary].into_boxed_slice(),
            primary_mask: primary - 1,
            secondary_mask: secondary - 1,
            primary_hits: 0,
            secondary_hits: 0,
            misses: 0,
        }
    }

    #[inline]
    fn primary_index(&self, hash: u64) -> usize {
        hash as usize & self.primary_mask
    }

    #[inline]
    fn secondary_index(&self, hash: u64) -> usize {
        (hash >> SECONDARY_SHIFT) as usize & self.secondary_mask
    }

    /// Resolve a key, consulting and updating the cache.
    pub fn lookup(
        &mut self,
        key: &LookupKey,
        codes: &CodeTable,
        model: &dyn ObjectModel,
    ) -> LookupResult {
        let hash = key.hash_value();

        let p = self.primary_index(hash);
        if let Some(entry) = self.primary[p] {
            if entry.key == *key {
                self.primary_hits += 1;
                return entry.result;
            }
        }

        let s = self.secondary_index(hash);
        if let Some(entry) = self.secondary[s] {
            if entry.key == *key {
                self.secondary_hits += 1;
                self.secondary[s] = None;
                self.insert_primary(entry);
                return entry.result;
            }
        }

        self.misses += 1;
        let result = Self::resolve(key, codes, model);
        if !result.is_empty() {
            self.insert_primary(CacheEntry {
                key: *key,
                result,
            });
        }
        result
    }

    /// Lookup for an ordinary send.
    #[inline]
    pub fn ic_normal_lookup(
        &mut self,
        klass: KlassId,
        selector: SelectorId,
        codes: &CodeTable,
        model: &dyn ObjectModel,
    ) -> LookupResult {
        self.lookup(&LookupKey::new(klass, selector), codes, model)
    }

    /// Lookup for a super send.
    ///
    /// The method is searched from `ancestor` rather than from the
    /// receiver's type; compiled code is only used if it was customized
    /// for `receiver_klass` from that same method.
    pub fn ic_super_lookup(
        &mut self,
        receiver_klass: KlassId,
        ancestor: KlassId,
        selector: SelectorId,
        codes: &CodeTable,
        model: &dyn ObjectModel,
    ) -> LookupResult {
        let inherited = self.lookup(&LookupKey::new(ancestor, selector), codes, model);
        let Some(method) = inherited.method_or_none() else {
            return LookupResult::Empty;
        };
        match codes.lookup_customized(receiver_klass, method) {
            Some(unit) => LookupResult::entry_result(unit.id, method),
            None => LookupResult::method_result(method),
        }
    }

    /// Interpreter lookup: the method, ignoring compiled code.
    #[inline]
    pub fn method_lookup(
        &mut self,
        klass: KlassId,
        selector: SelectorId,
        codes: &CodeTable,
        model: &dyn ObjectModel,
    ) -> Option<MethodId> {
        self.ic_normal_lookup(klass, selector, codes, model)
            .method_or_none()
    }

    /// Lookup on behalf of the compiler.
    ///
    /// Fills the cache like `lookup` but leaves the hit/miss counters
    /// untouched, so compile-time look-ahead does not distort runtime
    /// statistics.
    pub fn compile_time_lookup(
        &mut self,
        key: &LookupKey,
        codes: &CodeTable,
        model: &dyn ObjectModel,
    ) -> LookupResult {
        if let Some(result) = self.peek(key) {
            return result;
        }
        let result = Self::resolve(key, codes, model);
        if !result.is_empty() {
            self.insert_primary(CacheEntry {
                key: *key,
                result,
            });
        }
        result
    }

    /// Check the cache without resolving or counting.
    pub fn peek(&self, key: &LookupKey) -> Option<LookupResult> {
        let hash = key.hash_value();
        [
            self.primary[self.primary_index(hash)],
            self.secondary[self.secondary_index(hash)],
        ]
        .into_iter()
        .flatten()
        .find(|e| e.key == *key)
        .map(|e| e.result)
    }

    /// Full resolution: live compiled code first, then method search.
    fn resolve(key: &LookupKey, codes: &CodeTable, model: &dyn ObjectModel) -> LookupResult {
        if let Some(unit) = codes.lookup(key) {
            debug_assert_eq!(
                model.lookup_method(key.klass, key.selector),
                Some(unit.method),
                "compiled and interpreted lookup disagree for {key}"
            );
            return LookupResult::entry_result(unit.id, unit.method);
        }
        match model.lookup_method(key.klass, key.selector) {
            Some(method) => LookupResult::method_result(method),
            None => LookupResult::Empty,
        }
    }

    fn insert_primary(&mut self, entry: CacheEntry) {
        let hash = entry.key.hash_value();
        let p = self.primary_index(hash);
        if let Some(victim) = self.primary[p].replace(entry) {
            if victim.key != entry.key {
                let s = self.secondary_index(victim.key.hash_value());
                self.secondary[s] = Some(victim);
            }
        }
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Drop any entry for `key`.
    pub fn flush(&mut self, key: &LookupKey) {
        let hash = key.hash_value();
        let p = self.primary_index(hash);
        if self.primary[p].is_some_and(|e| e.key == *key) {
            self.primary[p] = None;
        }
        let s = self.secondary_index(hash);
        if self.secondary[s].is_some_and(|e| e.key == *key) {
            self.secondary[s] = None;
        }
    }

    /// Drop every entry.
    pub fn flush_all(&mut self) {
        self.primary.fill(None);
        self.secondary.fill(None);
        log::debug!("lookup cache flushed");
    }

    /// Drop every entry whose result is the compiled unit `code`.
    pub fn flush_code(&mut self, code: CodeId) {
        self.retain(|e| !e.result.matches_code(code));
    }

    /// Drop every entry resolving to `method`, interpreted or compiled.
    pub fn flush_method(&mut self, method: MethodId) {
        self.retain(|e| e.result.method_or_none() != Some(method));
    }

    fn retain(&mut self, mut keep: impl FnMut(&CacheEntry) -> bool) {
        for slot in self.primary.iter_mut().chain(self.secondary.iter_mut()) {
            if slot.as_ref().is_some_and(|e| !keep(e)) {
                *slot = None;
            }
        }
    }

    // =========================================================================
    // Statistics and verification
    // =========================================================================

    /// Reset hit/miss counters.
    pub fn clear_statistics(&mut self) {
        self.primary_hits = 0;
        self.secondary_hits = 0;
        self.misses = 0;
    }

    /// Get statistics.
    pub fn stats(&self) -> LookupCacheStats {
        LookupCacheStats {
            primary_hits: self.primary_hits,
            secondary_hits: self.secondary_hits,
            misses: self.misses,
            occupied: self.occupancy(),
            capacity: self.primary.len() + self.secondary.len(),
        }
    }

    /// Log the statistics table.
    pub fn print_statistics(&self) {
        log::info!("{}", self.stats());
    }

    /// Number of occupied slots across both tables.
    pub fn occupancy(&self) -> usize {
        self.primary
            .iter()
            .chain(self.secondary.iter())
            .filter(|e| e.is_some())
            .count()
    }

    /// Check that every entry sits in the slot its key hashes to and that
    /// no key is cached twice.
    pub fn verify(&self) -> bool {
        let primary_ok = self.primary.iter().enumerate().all(|(i, e)| {
            e.is_none_or(|e| self.primary_index(e.key.hash_value()) == i)
        });
        let secondary_ok = self.secondary.iter().enumerate().all(|(i, e)| {
            e.is_none_or(|e| {
                self.secondary_index(e.key.hash_value()) == i
                    && !self.primary[self.primary_index(e.key.hash_value())]
                        .is_some_and(|p| p.key == e.key)
            })
        });
        primary_ok && secondary_ok
    }
}

impl Default for LookupCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Lookup cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupCacheStats {
    /// Hits in the primary table.
    pub primary_hits: u64,
    /// Hits in the secondary table.
    pub secondary_hits: u64,
    /// Full resolutions.
    pub misses: u64,
    /// Occupied slots.
    pub occupied: usize,
    /// Total slots.
    pub capacity: usize,
}

impl LookupCacheStats {
    /// Total number of lookups counted.
    #[inline]
    pub fn total(&self) -> u64 {
        self.primary_hits + self.secondary_hits + self.misses
    }

    /// Calculate hit rate.
    #[inline]
    pub fn hit_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            (self.primary_hits + self.secondary_hits) as f64 / total as f64
        }
    }
}

impl fmt::Display for LookupCacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pct = |n: u64| {
            if self.total() == 0 {
                0.0
            } else {
                n as f64 * 100.0 / self.total() as f64
            }
        };
        writeln!(f, "lookup cache: {} lookups", self.total())?;
        writeln!(
            f,
            "  primary hits   {:>10} ({:5.1}%)",
            self.primary_hits,
            pct(self.primary_hits)
        )?;
        writeln!(
            f,
            "  secondary hits {:>10} ({:5.1}%)",
            self.secondary_hits,
            pct(self.secondary_hits)
        )?;
        writeln!(
            f,
            "  misses         {:>10} ({:5.1}%)",
            self.misses,
            pct(self.misses)
        )?;
        write!(f, "  occupancy      {:>10} / {}", self.occupied, self.capacity)
    }
}

// =============================================================================
// Tests
// =============================================================================
