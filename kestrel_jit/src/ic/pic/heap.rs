//! PIC heap.
//!
//! Owns every PIC body, places it in code space, and carries out the
//! structural operations: `allocate` on a miss, `replace` after a target
//! is recompiled, and `cleanup` during sweeping.
//!
//! A PIC that is replaced by a new one is not freed: a suspended
//! activation may still be returning through it. It moves to the
//! graveyard and its code space is released by `reclaim` once no active
//! address lies inside it.

use super::contents::PicContents;
use super::{CleanupPlan, EmbeddedRef, PicTarget, PolymorphicInlineCache, layout};
use crate::lookup::LookupResult;
use crate::runtime::DispatchConfig;
use crate::runtime::code_space::CodeSpace;
use kestrel_core::{CodeId, DispatchError, DispatchResult, KlassId, PicId, SelectorId, SiteId};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

/// What a call site held before a miss grew it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviousTarget {
    /// Nothing cached.
    Empty,
    /// A single direct target.
    Monomorphic {
        /// Type the target was cached for.
        klass: KlassId,
        /// The cached target.
        target: PicTarget,
    },
    /// An existing PIC.
    Pic(PicId),
}

/// Result of `PicHeap::allocate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocateOutcome {
    /// A dispatch PIC holding the union of old and new entries.
    Polymorphic(PicId),
    /// The entry cap was exceeded; a megamorphic PIC.
    Megamorphic(PicId),
    /// The cap was exceeded and megamorphic caches are disabled: the site
    /// should call the generic lookup routine.
    Generic,
    /// No code space; the site keeps what it had.
    Exhausted,
}

/// Result of `PicHeap::cleanup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Same PIC object; `patched` targets were rewritten in place.
    Kept {
        /// Entries patched in place.
        patched: usize,
    },
    /// A smaller PIC replaced the old one.
    Rebuilt(PicId),
    /// One compiled entry remained; the site should call it directly.
    Collapsed(CodeId),
    /// No entries remained.
    Discarded,
}

// =============================================================================
// PIC Heap
// =============================================================================

/// Owner of all PIC bodies.
#[derive(Debug, Default)]
pub struct PicHeap {
    pics: FxHashMap<PicId, PolymorphicInlineCache>,
    by_address: BTreeMap<usize, PicId>,
    graveyard: Vec<PolymorphicInlineCache>,
    next_id: u32,
    stats: PicHeapStats,
}

impl PicHeap {
    /// Create an empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the next cache shape for a site that missed on `klass`.
    ///
    /// The new pair is seeded first, then whatever `previous` held is
    /// folded in. A stale entry for `klass` itself is superseded by the
    /// new result.
    #[allow(clippy::too_many_arguments)]
    pub fn allocate(
        &mut self,
        space: &mut CodeSpace,
        config: &DispatchConfig,
        site: SiteId,
        selector: SelectorId,
        previous: PreviousTarget,
        klass: KlassId,
        result: LookupResult,
    ) -> DispatchResult<AllocateOutcome> {
        let Some(target) = PicTarget::from_result(result) else {
            return Ok(AllocateOutcome::Generic);
        };

        let mut contents = PicContents::new();
        contents.append(klass, target);
        let mut old = None;
        match previous {
            PreviousTarget::Empty => {}
            PreviousTarget::Monomorphic { klass: k, target: t } => {
                if k != klass {
                    contents.append(k, t);
                }
            }
            PreviousTarget::Pic(id) => {
                let pic = self.pics.get(&id).ok_or(DispatchError::UnknownPic(id))?;
                if pic.is_megamorphic() {
                    return Ok(AllocateOutcome::Megamorphic(id));
                }
                for (k, t) in pic.entries() {
                    if k != klass {
                        contents.append(k, t);
                    }
                }
                old = Some(id);
            }
        }

        if contents.len() > config.pic_entry_cap() {
            if !config.use_megamorphic_caches {
                log::debug!("{site}: {} types exceed PIC cap, going generic", contents.len());
                if let Some(id) = old {
                    self.retire(id);
                }
                self.stats.generic += 1;
                return Ok(AllocateOutcome::Generic);
            }
            return Ok(match self.install_megamorphic(space, site, selector) {
                Ok(id) => {
                    log::debug!("{site}: {} types exceed PIC cap, megamorphic", contents.len());
                    if let Some(old) = old {
                        self.retire(old);
                    }
                    AllocateOutcome::Megamorphic(id)
                }
                Err(e) => self.exhausted(site, &e),
            });
        }

        Ok(match self.install(space, site, &contents) {
            Ok(id) => {
                if let Some(old) = old {
                    self.retire(old);
                }
                AllocateOutcome::Polymorphic(id)
            }
            Err(e) => self.exhausted(site, &e),
        })
    }

    fn exhausted(&mut self, site: SiteId, error: &DispatchError) -> AllocateOutcome {
        debug_assert!(error.is_resource_exhaustion());
        log::debug!("{site}: PIC allocation skipped: {error}");
        self.stats.exhausted += 1;
        AllocateOutcome::Exhausted
    }

    fn next_id(&mut self) -> PicId {
        self.next_id += 1;
        PicId::new(self.next_id)
    }

    fn insert(&mut self, pic: PolymorphicInlineCache) -> PicId {
        let id = pic.id();
        self.by_address.insert(pic.address(), id);
        self.pics.insert(id, pic);
        id
    }

    fn install(
        &mut self,
        space: &mut CodeSpace,
        site: SiteId,
        contents: &PicContents,
    ) -> DispatchResult<PicId> {
        let address = space.allocate(contents.code_size())?;
        let id = self.next_id();
        let pic = PolymorphicInlineCache::build(id, site, address, contents);
        self.stats.allocated += 1;
        Ok(self.insert(pic))
    }

    fn install_megamorphic(
        &mut self,
        space: &mut CodeSpace,
        site: SiteId,
        selector: SelectorId,
    ) -> DispatchResult<PicId> {
        let address = space.allocate(layout::MEGAMORPHIC_CODE_SIZE)?;
        let id = self.next_id();
        let pic = PolymorphicInlineCache::build_megamorphic(id, site, address, selector);
        self.stats.megamorphic += 1;
        Ok(self.insert(pic))
    }

    /// Point the entry for `klass` at the recompiled unit `code`.
    ///
    /// Returns the PIC the site should now call: the same one when the
    /// entry was patched in place, a fresh one when it had to be rebuilt.
    pub fn replace(
        &mut self,
        space: &mut CodeSpace,
        id: PicId,
        klass: KlassId,
        code: CodeId,
    ) -> DispatchResult<PicId> {
        let pic = self.pics.get_mut(&id).ok_or(DispatchError::UnknownPic(id))?;
        if pic.is_megamorphic() {
            return Ok(id);
        }
        if pic.patch_compiled(klass, code) {
            self.stats.patched += 1;
            return Ok(id);
        }

        let mut contents = pic.contents();
        if !contents.substitute(klass, PicTarget::Compiled(code)) {
            return Ok(id);
        }
        let owner = pic.owner();
        let new_id = self.install(space, owner, &contents)?;
        self.retire(id);
        self.stats.rebuilt += 1;
        debug_assert!(self.pics[&new_id].verify());
        Ok(new_id)
    }

    /// Re-validate a PIC against `resolve` and shrink it if entries died.
    ///
    /// If code space runs out while rebuilding, the PIC is discarded:
    /// the site falls back to an empty cache rather than keep a stale one.
    pub fn cleanup(
        &mut self,
        space: &mut CodeSpace,
        id: PicId,
        resolve: impl FnMut(KlassId) -> LookupResult,
    ) -> DispatchResult<CleanupOutcome> {
        let pic = self.pics.get_mut(&id).ok_or(DispatchError::UnknownPic(id))?;
        let owner = pic.owner();
        let outcome = match pic.cleanup(resolve) {
            CleanupPlan::Kept { patched } => {
                self.stats.patched += patched as u64;
                return Ok(CleanupOutcome::Kept { patched });
            }
            CleanupPlan::Rebuild(contents) => match self.install(space, owner, &contents) {
                Ok(new_id) => {
                    self.stats.rebuilt += 1;
                    CleanupOutcome::Rebuilt(new_id)
                }
                Err(e) => {
                    log::warn!("{owner}: rebuilding {id} failed ({e}), discarding it");
                    CleanupOutcome::Discarded
                }
            },
            CleanupPlan::Collapse(code) => CleanupOutcome::Collapsed(code),
            CleanupPlan::Discard => CleanupOutcome::Discarded,
        };
        self.retire(id);
        Ok(outcome)
    }

    /// Move a live PIC to the graveyard.
    pub fn retire(&mut self, id: PicId) {
        if let Some(pic) = self.pics.remove(&id) {
            self.by_address.remove(&pic.address());
            self.graveyard.push(pic);
            self.stats.retired += 1;
        }
    }

    /// Free every retired PIC that contains none of `active`.
    ///
    /// Returns the number of PICs reclaimed.
    pub fn reclaim(&mut self, space: &mut CodeSpace, active: &[usize]) -> usize {
        let before = self.graveyard.len();
        self.graveyard.retain(|pic| {
            if active.iter().any(|&a| pic.contains_address(a)) {
                return true;
            }
            space.free(pic.address(), pic.code_len());
            false
        });
        let reclaimed = before - self.graveyard.len();
        self.stats.reclaimed += reclaimed as u64;
        reclaimed
    }

    /// Get a live PIC.
    #[inline]
    pub fn get(&self, id: PicId) -> Option<&PolymorphicInlineCache> {
        self.pics.get(&id)
    }

    /// Find the PIC, live or retired, whose code contains `addr`.
    pub fn find(&self, addr: usize) -> Option<&PolymorphicInlineCache> {
        self.by_address
            .range(..=addr)
            .next_back()
            .and_then(|(_, id)| self.pics.get(id))
            .filter(|p| p.contains_address(addr))
            .or_else(|| self.graveyard.iter().find(|p| p.contains_address(addr)))
    }

    /// Visit the embedded references of every PIC, retired ones included.
    pub fn oops_do(&mut self, f: &mut dyn FnMut(&mut EmbeddedRef)) {
        for pic in self.pics.values_mut().chain(self.graveyard.iter_mut()) {
            pic.oops_do(f);
        }
    }

    /// Iterate over live PICs.
    pub fn iter(&self) -> impl Iterator<Item = &PolymorphicInlineCache> {
        self.pics.values()
    }

    /// Number of live PICs.
    #[inline]
    pub fn len(&self) -> usize {
        self.pics.len()
    }

    /// Check for no live PICs.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pics.is_empty()
    }

    /// Number of retired PICs awaiting reclamation.
    #[inline]
    pub fn graveyard_len(&self) -> usize {
        self.graveyard.len()
    }

    /// Check every live PIC.
    pub fn verify(&self) -> bool {
        self.pics.values().all(PolymorphicInlineCache::verify)
    }

    /// Get heap statistics.
    #[inline]
    pub fn stats(&self) -> PicHeapStats {
        self.stats
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics for the PIC heap.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PicHeapStats {
    /// Dispatch PICs built.
    pub allocated: u64,
    /// Megamorphic PICs built.
    pub megamorphic: u64,
    /// PICs rebuilt by `replace` or `cleanup`.
    pub rebuilt: u64,
    /// Targets patched in place.
    pub patched: u64,
    /// PICs moved to the graveyard.
    pub retired: u64,
    /// Retired PICs freed.
    pub reclaimed: u64,
    /// Sites sent to the generic routine at the cap.
    pub generic: u64,
    /// Allocations skipped for lack of code space.
    pub exhausted: u64,
}

impl PicHeapStats {
    /// Fraction of target changes handled without a rebuild.
    pub fn patch_rate(&self) -> f64 {
        let total = self.patched + self.rebuilt;
        if total == 0 {
            0.0
        } else {
            self.patched as f64 / total as f64
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::MethodId;

    fn setup() -> (PicHeap, CodeSpace, DispatchConfig) {
        (
            PicHeap::new(),
            CodeSpace::new(64 * 1024),
            DispatchConfig::for_testing().with_max_pic_entries(3),
        )
    }

    fn entry(code: u32) -> LookupResult {
        LookupResult::entry_result(CodeId::new(code), MethodId::new(code + 100))
    }

    fn method(m: u32) -> LookupResult {
        LookupResult::method_result(MethodId::new(m))
    }

    const SITE: SiteId = SiteId(1);
    const SEL: SelectorId = SelectorId(7);

    #[test]
    fn test_allocate_from_monomorphic() {
        let (mut heap, mut space, config) = setup();
        let previous = PreviousTarget::Monomorphic {
            klass: KlassId::new(5),
            target: PicTarget::Compiled(CodeId::new(1)),
        };
        let out = heap
            .allocate(&mut space, &config, SITE, SEL, previous, KlassId::new(6), entry(2))
            .unwrap();
        let AllocateOutcome::Polymorphic(id) = out else {
            panic!("expected a PIC, got {out:?}");
        };
        let pic = heap.get(id).unwrap();
        assert_eq!(pic.entry_count(), 2);
        assert_eq!(pic.owner(), SITE);
        assert!(pic.verify());
        assert!(space.used() >= pic.code_len());
    }

    #[test]
    fn test_grow_then_megamorphic() {
        let (mut heap, mut space, config) = setup();
        let mut previous = PreviousTarget::Empty;
        let mut outcomes = Vec::new();
        let mut sizes = Vec::new();
        for k in 10..14 {
            let out = heap
                .allocate(&mut space, &config, SITE, SEL, previous, KlassId::new(k), method(k))
                .unwrap();
            outcomes.push(out);
            previous = match out {
                AllocateOutcome::Polymorphic(id) => {
                    sizes.push(heap.get(id).unwrap().entry_count());
                    PreviousTarget::Pic(id)
                }
                AllocateOutcome::Megamorphic(id) => PreviousTarget::Pic(id),
                _ => unreachable!(),
            };
        }
        assert_eq!(sizes, vec![1, 2, 3]);
        let AllocateOutcome::Megamorphic(mega) = outcomes[3] else {
            panic!("expected megamorphic");
        };
        assert_eq!(heap.get(mega).and_then(|p| p.selector()), Some(SEL));
        assert_eq!(heap.len(), 1);
        assert_eq!(heap.graveyard_len(), 3);
    }

    #[test]
    fn test_cap_without_megamorphic_goes_generic() {
        let (mut heap, mut space, _) = setup();
        let config = DispatchConfig::for_testing()
            .with_max_pic_entries(2)
            .with_megamorphic_caches(false);
        let out = heap
            .allocate(
                &mut space,
                &config,
                SITE,
                SEL,
                PreviousTarget::Monomorphic {
                    klass: KlassId::new(5),
                    target: PicTarget::Interpreted(MethodId::new(5)),
                },
                KlassId::new(6),
                method(6),
            )
            .unwrap();
        let AllocateOutcome::Polymorphic(id) = out else {
            panic!("expected a PIC");
        };
        let out = heap
            .allocate(&mut space, &config, SITE, SEL, PreviousTarget::Pic(id), KlassId::new(7), method(7))
            .unwrap();
        assert_eq!(out, AllocateOutcome::Generic);
        assert!(heap.get(id).is_none());
        assert_eq!(heap.stats().generic, 1);
    }

    #[test]
    fn test_exhaustion_keeps_previous() {
        let mut heap = PicHeap::new();
        let mut space = CodeSpace::new(16);
        let config = DispatchConfig::for_testing();
        let first = heap
            .allocate(&mut space, &config, SITE, SEL, PreviousTarget::Empty, KlassId::new(5), method(5))
            .unwrap();
        let AllocateOutcome::Polymorphic(id) = first else {
            panic!("expected a PIC");
        };
        let second = heap
            .allocate(&mut space, &config, SITE, SEL, PreviousTarget::Pic(id), KlassId::new(6), method(6))
            .unwrap();
        assert_eq!(second, AllocateOutcome::Exhausted);
        assert!(heap.get(id).is_some());
        assert_eq!(heap.stats().exhausted, 1);
    }

    #[test]
    fn test_replace_patches_or_rebuilds() {
        let (mut heap, mut space, config) = setup();
        let previous = PreviousTarget::Monomorphic {
            klass: KlassId::new(5),
            target: PicTarget::Compiled(CodeId::new(1)),
        };
        let AllocateOutcome::Polymorphic(id) = heap
            .allocate(&mut space, &config, SITE, SEL, previous, KlassId::new(6), method(60))
            .unwrap()
        else {
            panic!("expected a PIC");
        };

        let same = heap.replace(&mut space, id, KlassId::new(5), CodeId::new(9)).unwrap();
        assert_eq!(same, id);
        assert_eq!(
            heap.get(id).unwrap().target_for(KlassId::new(5)),
            Some(PicTarget::Compiled(CodeId::new(9)))
        );

        let rebuilt = heap.replace(&mut space, id, KlassId::new(6), CodeId::new(10)).unwrap();
        assert_ne!(rebuilt, id);
        let pic = heap.get(rebuilt).unwrap();
        assert_eq!(pic.entry_count(), 2);
        assert_eq!(pic.target_for(KlassId::new(6)), Some(PicTarget::Compiled(CodeId::new(10))));
        assert_eq!(pic.target_for(KlassId::new(5)), Some(PicTarget::Compiled(CodeId::new(9))));
        assert_eq!(heap.stats().patched, 1);
        assert_eq!(heap.stats().rebuilt, 1);
    }

    #[test]
    fn test_find_live_and_retired() {
        let (mut heap, mut space, config) = setup();
        let AllocateOutcome::Polymorphic(a) = heap
            .allocate(&mut space, &config, SITE, SEL, PreviousTarget::Empty, KlassId::new(5), method(5))
            .unwrap()
        else {
            panic!("expected a PIC");
        };
        let addr = heap.get(a).unwrap().address();
        assert_eq!(heap.find(addr + 3).map(|p| p.id()), Some(a));
        heap.retire(a);
        assert_eq!(heap.find(addr + 3).map(|p| p.id()), Some(a));
        assert!(heap.find(addr + 1000).is_none());
    }

    #[test]
    fn test_reclaim_respects_active_addresses() {
        let (mut heap, mut space, config) = setup();
        let AllocateOutcome::Polymorphic(a) = heap
            .allocate(&mut space, &config, SITE, SEL, PreviousTarget::Empty, KlassId::new(5), method(5))
            .unwrap()
        else {
            panic!("expected a PIC");
        };
        let addr = heap.get(a).unwrap().address();
        heap.retire(a);
        assert_eq!(heap.reclaim(&mut space, &[addr + 2]), 0);
        assert_eq!(heap.reclaim(&mut space, &[]), 1);
        assert_eq!(space.used(), 0);
        assert!(heap.find(addr).is_none());
    }

    #[test]
    fn test_cleanup_outcomes() {
        let (mut heap, mut space, config) = setup();
        let previous = PreviousTarget::Monomorphic {
            klass: KlassId::new(5),
            target: PicTarget::Compiled(CodeId::new(1)),
        };
        let AllocateOutcome::Polymorphic(id) = heap
            .allocate(&mut space, &config, SITE, SEL, previous, KlassId::new(6), method(60))
            .unwrap()
        else {
            panic!("expected a PIC");
        };
        let out = heap
            .cleanup(&mut space, id, |k| {
                if k == KlassId::new(5) {
                    entry(1)
                } else {
                    LookupResult::Empty
                }
            })
            .unwrap();
        assert_eq!(out, CleanupOutcome::Collapsed(CodeId::new(1)));
        assert!(heap.get(id).is_none());
        assert_eq!(
            heap.cleanup(&mut space, id, |_| LookupResult::Empty),
            Err(DispatchError::UnknownPic(id))
        );
    }

    #[test]
    fn test_uncapped_config_stops_at_largest_stub() {
        let mut heap = PicHeap::new();
        let mut space = CodeSpace::new(1 << 22);
        let config = DispatchConfig {
            max_pic_entries: usize::MAX,
            ..DispatchConfig::for_testing()
        };
        let mut previous = PreviousTarget::Empty;
        let mut largest = 0;
        for k in 1..=layout::MAX_INTERPRETED_PIC_STUB as u32 + 1 {
            let out = heap
                .allocate(&mut space, &config, SITE, SEL, previous, KlassId::new(k), method(k))
                .unwrap();
            heap.reclaim(&mut space, &[]);
            match out {
                AllocateOutcome::Polymorphic(id) => {
                    largest = heap.get(id).unwrap().entry_count();
                    previous = PreviousTarget::Pic(id);
                }
                AllocateOutcome::Megamorphic(_) => {
                    assert_eq!(k as usize, layout::MAX_INTERPRETED_PIC_STUB + 1);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(largest, layout::MAX_INTERPRETED_PIC_STUB);
        assert!(heap.iter().any(|p| p.is_megamorphic()));
    }
}
