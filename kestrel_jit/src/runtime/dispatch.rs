//! The dispatch runtime context.
//!
//! `DispatchRuntime` owns every piece of mutable dispatch state: the
//! lookup cache, code space, compiled units, PIC bodies and call sites.
//! It is passed explicitly to whatever needs it; collectors and compilers
//! reach the caches only through the hooks defined here.
//!
//! The miss handler, the sweeper and recompilation extend this type from
//! their own modules.

use super::DispatchConfig;
use super::code_space::CodeSpace;
use super::code_table::{CodeTable, UnitSpec};
use super::collaborators::{CompiledCode, ObjectModel, StackWalker};
use crate::ic::{
    CleanupOutcome, EmbeddedRef, IcStats, PicDispatch, PicHeap, PicTarget, SendKind, SiteOwner,
    SiteTable, SiteTarget,
};
use crate::lookup::{LookupCache, LookupKey, LookupResult};
use crate::recompile::RecompilationStats;
use kestrel_core::{CodeId, DispatchError, DispatchResult, KlassId, MethodId, SelectorId, SiteId};
use smallvec::{SmallVec, smallvec};

/// What a reclamation pass freed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Zombie units freed.
    pub units: usize,
    /// Retired PICs freed.
    pub pics: usize,
}

/// Process-wide dispatch state.
#[derive(Debug)]
pub struct DispatchRuntime {
    pub(crate) config: DispatchConfig,
    pub(crate) cache: LookupCache,
    pub(crate) space: CodeSpace,
    pub(crate) codes: CodeTable,
    pub(crate) pics: PicHeap,
    pub(crate) sites: SiteTable,
    pub(crate) ic_stats: IcStats,
    pub(crate) recompilation_stats: RecompilationStats,
}

impl DispatchRuntime {
    /// Create a runtime with empty caches.
    pub fn new(config: DispatchConfig) -> Self {
        let space = CodeSpace::new(config.code_space_bytes);
        Self {
            config,
            cache: LookupCache::new(),
            space,
            codes: CodeTable::new(),
            pics: PicHeap::new(),
            sites: SiteTable::new(),
            ic_stats: IcStats::default(),
            recompilation_stats: RecompilationStats::default(),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Configuration.
    #[inline]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// The global lookup cache.
    #[inline]
    pub fn lookup_cache(&self) -> &LookupCache {
        &self.cache
    }

    /// The global lookup cache, mutably.
    #[inline]
    pub fn lookup_cache_mut(&mut self) -> &mut LookupCache {
        &mut self.cache
    }

    /// Executable code space.
    #[inline]
    pub fn code_space(&self) -> &CodeSpace {
        &self.space
    }

    /// Compiled units.
    #[inline]
    pub fn code_table(&self) -> &CodeTable {
        &self.codes
    }

    /// Compiled units, mutably.
    #[inline]
    pub fn code_table_mut(&mut self) -> &mut CodeTable {
        &mut self.codes
    }

    /// PIC bodies.
    #[inline]
    pub fn pic_heap(&self) -> &PicHeap {
        &self.pics
    }

    /// Call sites.
    #[inline]
    pub fn sites(&self) -> &SiteTable {
        &self.sites
    }

    /// Inline cache statistics.
    #[inline]
    pub fn ic_stats(&self) -> IcStats {
        self.ic_stats
    }

    /// Recompilation statistics.
    #[inline]
    pub fn recompilation_stats(&self) -> RecompilationStats {
        self.recompilation_stats
    }

    // =========================================================================
    // Sites and units
    // =========================================================================

    /// Register a send site in an interpreted method.
    pub fn register_interpreted_site(
        &mut self,
        method: MethodId,
        selector: SelectorId,
        kind: SendKind,
    ) -> SiteId {
        self.sites
            .register(SiteOwner::Interpreted(method), selector, kind)
    }

    /// Install freshly generated code for `key`.
    ///
    /// Any live unit for the key becomes a zombie first, and sites that
    /// called it are repointed at the new unit. The new unit's call sites
    /// are registered and the lookup cache forgets the key.
    pub fn install_compiled(
        &mut self,
        key: LookupKey,
        method: MethodId,
        level: u8,
        code: &CompiledCode,
    ) -> DispatchResult<CodeId> {
        self.install_unit(key, method, level, code).map(|(id, _)| id)
    }

    /// Install a unit, returning it and the number of sites moved off the
    /// unit it replaced.
    pub(crate) fn install_unit(
        &mut self,
        key: LookupKey,
        method: MethodId,
        level: u8,
        code: &CompiledCode,
    ) -> DispatchResult<(CodeId, usize)> {
        let entry = self.space.allocate(code.code_size)?;
        let replaced = self.codes.lookup(&key).map(|u| (u.id, u.method));
        if let Some((old, _)) = replaced {
            self.codes.make_zombie(old);
        }
        let id = self.codes.install(UnitSpec {
            key,
            method,
            entry,
            code_size: code.code_size,
            footprint: code.footprint,
            level,
        });
        for send in &code.sends {
            let site = self
                .sites
                .register(SiteOwner::Compiled(id), send.selector, send.kind);
            if let Some(unit) = self.codes.get_mut(id) {
                unit.add_site(site);
            }
        }
        // Callers only move over when the new unit runs the same method.
        let moved = match replaced {
            Some((old, old_method)) => {
                self.detach_zombie(old, (old_method == method).then_some(id))
            }
            None => 0,
        };
        self.cache.flush(&key);
        log::debug!("installed {id} for {key} at {entry:#x} (level {level})");
        Ok((id, moved))
    }

    /// Make a unit a zombie, clear its own call sites and unlink every
    /// site that still calls it.
    ///
    /// Returns `false` if the unit is unknown or already a zombie.
    pub fn retire_unit(&mut self, code: CodeId) -> bool {
        if !self.codes.make_zombie(code) {
            return false;
        }
        self.detach_zombie(code, None);
        true
    }

    fn detach_zombie(&mut self, code: CodeId, replacement: Option<CodeId>) -> usize {
        for pic in self.sites.clear_owner(SiteOwner::Compiled(code)) {
            self.pics.retire(pic);
        }
        let callers = self.unlink_callers(code, replacement);
        self.cache.flush_code(code);
        log::debug!("{code} is now a zombie ({callers} calling sites unlinked)");
        callers
    }

    /// Point every site entry that calls `old` at `replacement`, or drop
    /// the entry when there is none. Returns the number of sites changed.
    fn unlink_callers(&mut self, old: CodeId, replacement: Option<CodeId>) -> usize {
        let mut changed = 0;
        for site_id in self.sites.ids() {
            let Some(site) = self.sites.get(site_id) else {
                continue;
            };
            let stale: SmallVec<[KlassId; 2]> = match site.target() {
                SiteTarget::Monomorphic {
                    klass,
                    target: PicTarget::Compiled(c),
                } if c == old => smallvec![klass],
                SiteTarget::Pic(id) => self
                    .pics
                    .get(id)
                    .map(|pic| {
                        pic.entries()
                            .into_iter()
                            .filter(|&(_, t)| t == PicTarget::Compiled(old))
                            .map(|(k, _)| k)
                            .collect()
                    })
                    .unwrap_or_default(),
                _ => continue,
            };
            if stale.is_empty() {
                continue;
            }
            changed += 1;
            if let Some(new) = replacement {
                let repointed = stale
                    .iter()
                    .try_for_each(|&klass| self.repatch_site(site_id, klass, new).map(drop));
                match repointed {
                    Ok(()) => continue,
                    Err(e) => log::warn!("{site_id}: repointing {old} to {new} failed: {e}"),
                }
            }
            self.drop_callee(site_id, old);
        }
        changed
    }

    /// Remove the entries of a site that call `old`, shrinking its PIC.
    fn drop_callee(&mut self, site_id: SiteId, old: CodeId) {
        let Some(site) = self.sites.get(site_id) else {
            return;
        };
        let next = match site.target() {
            SiteTarget::Monomorphic {
                target: PicTarget::Compiled(c),
                ..
            } if c == old => SiteTarget::Empty,
            SiteTarget::Pic(id) => {
                let Some(entries) = self.pics.get(id).map(|p| p.entries()) else {
                    return;
                };
                let codes = &self.codes;
                let outcome = self.pics.cleanup(&mut self.space, id, |klass| {
                    match entries.iter().find(|&&(k, _)| k == klass).map(|&(_, t)| t) {
                        Some(PicTarget::Interpreted(method)) => LookupResult::method_result(method),
                        Some(PicTarget::Compiled(c)) if c != old && codes.is_live(c) => {
                            codes.get(c).map_or(LookupResult::Empty, |u| {
                                LookupResult::entry_result(c, u.method)
                            })
                        }
                        _ => LookupResult::Empty,
                    }
                });
                match outcome {
                    Ok(CleanupOutcome::Kept { .. }) => return,
                    Ok(CleanupOutcome::Rebuilt(new_id)) => SiteTarget::Pic(new_id),
                    Ok(CleanupOutcome::Collapsed(code)) => entries
                        .iter()
                        .find(|&&(_, t)| t == PicTarget::Compiled(code))
                        .map_or(SiteTarget::Empty, |&(klass, target)| {
                            SiteTarget::Monomorphic { klass, target }
                        }),
                    Ok(CleanupOutcome::Discarded) => SiteTarget::Empty,
                    Err(e) => {
                        log::warn!("{site_id}: dropping {old} from {id} failed ({e}), clearing");
                        SiteTarget::Empty
                    }
                }
            }
            _ => return,
        };
        if let Some(site) = self.sites.get_mut(site_id) {
            site.set_target(next);
        }
    }

    /// Flag a unit as having hit an uncommon trap.
    pub fn mark_uncommon_trap(&mut self, code: CodeId) -> DispatchResult<()> {
        self.codes
            .get_mut(code)
            .ok_or(DispatchError::UnknownCode(code))?
            .mark_uncommon_trap();
        Ok(())
    }

    // =========================================================================
    // Sends
    // =========================================================================

    /// Interpreter lookup through the global cache.
    pub fn lookup(
        &mut self,
        klass: KlassId,
        selector: SelectorId,
        model: &dyn ObjectModel,
    ) -> LookupResult {
        self.cache
            .ic_normal_lookup(klass, selector, &self.codes, model)
    }

    /// Execute a send through `site` for a receiver of type `klass`.
    ///
    /// Hits are answered from the site (directly or by running its PIC);
    /// misses go to the miss handler, which also advances the site.
    pub fn send(
        &mut self,
        site_id: SiteId,
        klass: KlassId,
        model: &dyn ObjectModel,
    ) -> DispatchResult<LookupResult> {
        let site = self.sites.site_mut(site_id)?;
        site.record_send();
        let (selector, kind, target) = (site.selector, site.kind, site.target());

        let hit = match target {
            SiteTarget::Monomorphic { klass: k, target } if k == klass => Some(target),
            SiteTarget::Pic(id) => {
                let pic = self.pics.get(id).ok_or(DispatchError::UnknownPic(id))?;
                match pic.dispatch(klass) {
                    PicDispatch::Compiled(code) => Some(PicTarget::Compiled(code)),
                    PicDispatch::Interpreted(method) => Some(PicTarget::Interpreted(method)),
                    PicDispatch::Miss => None,
                    PicDispatch::Megamorphic(_) => {
                        return self.generic_send(klass, selector, kind, model);
                    }
                }
            }
            SiteTarget::Generic => return self.generic_send(klass, selector, kind, model),
            _ => None,
        };

        match hit {
            Some(PicTarget::Compiled(code)) if self.codes.is_live(code) => {
                let unit = self
                    .codes
                    .get_mut(code)
                    .ok_or(DispatchError::UnknownCode(code))?;
                unit.increment_invocation_counter();
                self.ic_stats.hits += 1;
                Ok(LookupResult::entry_result(code, unit.method))
            }
            // A zombie entry counts as a miss; rebinding supersedes it.
            Some(PicTarget::Compiled(_)) => self.ic_miss(site_id, klass, model),
            Some(PicTarget::Interpreted(method)) => {
                self.ic_stats.hits += 1;
                Ok(LookupResult::method_result(method))
            }
            None => self.ic_miss(site_id, klass, model),
        }
    }

    fn generic_send(
        &mut self,
        klass: KlassId,
        selector: SelectorId,
        kind: SendKind,
        model: &dyn ObjectModel,
    ) -> DispatchResult<LookupResult> {
        self.ic_stats.megamorphic_lookups += 1;
        let result =
            crate::ic::resolve_send(&mut self.cache, &self.codes, model, kind, klass, selector);
        if result.is_empty() {
            return Err(DispatchError::MessageNotUnderstood { klass, selector });
        }
        Ok(result)
    }

    /// Point the entry for `klass` at `site` to the compiled unit `code`.
    ///
    /// Returns `false` when the site has no entry for `klass`.
    pub fn repatch_site(
        &mut self,
        site_id: SiteId,
        klass: KlassId,
        code: CodeId,
    ) -> DispatchResult<bool> {
        let site = self.sites.site(site_id)?;
        if site.cached_target(klass, &self.pics).is_none() {
            return Ok(false);
        }
        let next = match site.target() {
            SiteTarget::Pic(pic) => {
                SiteTarget::Pic(self.pics.replace(&mut self.space, pic, klass, code)?)
            }
            _ => SiteTarget::Monomorphic {
                klass,
                target: PicTarget::Compiled(code),
            },
        };
        self.sites.site_mut(site_id)?.set_target(next);
        Ok(true)
    }

    // =========================================================================
    // Collector hooks
    // =========================================================================

    /// Called by the collector before objects move.
    pub fn before_relocation(&mut self) {
        self.cache.flush_all();
    }

    /// Called by the collector after objects moved.
    pub fn after_relocation(&mut self) {
        self.cache.flush_all();
    }

    /// Visit every object reference embedded in PICs and call sites.
    pub fn relocate(&mut self, f: &mut dyn FnMut(&mut EmbeddedRef)) {
        self.pics.oops_do(f);
        for site in self.sites.iter_mut() {
            let mut r = EmbeddedRef::Selector(site.selector);
            f(&mut r);
            if let EmbeddedRef::Selector(moved) = r {
                site.selector = moved;
            }
            let SiteTarget::Monomorphic { klass, target } = site.target() else {
                continue;
            };
            let mut r = EmbeddedRef::Klass(klass);
            f(&mut r);
            let EmbeddedRef::Klass(klass) = r else {
                panic!("relocation changed the kind of a site reference");
            };
            let target = match target {
                PicTarget::Interpreted(method) => {
                    let mut r = EmbeddedRef::Method(method);
                    f(&mut r);
                    let EmbeddedRef::Method(method) = r else {
                        panic!("relocation changed the kind of a site reference");
                    };
                    PicTarget::Interpreted(method)
                }
                compiled => compiled,
            };
            site.set_target(SiteTarget::Monomorphic { klass, target });
        }
    }

    /// Invalidate everything derived from `method` after it changed.
    ///
    /// Returns the number of compiled units retired.
    pub fn method_changed(&mut self, method: MethodId, model: &mut dyn ObjectModel) -> usize {
        self.cache.flush_all();
        let mut retired = 0;
        for code in self.codes.units_for_method(method) {
            if self.retire_unit(code) {
                retired += 1;
            }
        }
        for pic in self.sites.clear_owner(SiteOwner::Interpreted(method)) {
            self.pics.retire(pic);
        }
        self.sweep_inline_caches(&*model);
        model.flush_perform_caches();
        log::info!("{method} changed: {retired} compiled units retired");
        retired
    }

    /// Free zombies and retired PICs no live activation can return into.
    ///
    /// The call sites of a freed unit are dropped with it.
    pub fn reclaim(&mut self, stack: &dyn StackWalker) -> ReclaimReport {
        let active = stack.active_addresses();
        let units = self.codes.reclaim_zombies(&active);
        for unit in &units {
            self.space.free(unit.entry(), unit.code_size());
            for pic in self.sites.remove_owner(SiteOwner::Compiled(unit.id)) {
                self.pics.retire(pic);
            }
        }
        let pics = self.pics.reclaim(&mut self.space, &active);
        if !units.is_empty() || pics > 0 {
            log::debug!("reclaimed {} zombie units and {pics} PICs", units.len());
        }
        ReclaimReport {
            units: units.len(),
            pics,
        }
    }

    // =========================================================================
    // Verification
    // =========================================================================

    /// Check cross-structure consistency.
    pub fn verify(&self) -> bool {
        let live = |t: PicTarget| match t {
            PicTarget::Compiled(code) => self.codes.is_live(code),
            PicTarget::Interpreted(_) => true,
        };
        let sites_ok = self.sites.iter().all(|site| match site.target() {
            SiteTarget::Pic(id) => self.pics.get(id).is_some_and(|p| {
                p.owner() == site.id && p.entries().into_iter().all(|(_, t)| live(t))
            }),
            SiteTarget::Monomorphic { target, .. } => live(target),
            _ => true,
        });
        sites_ok && self.cache.verify() && self.pics.verify()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedModel;

    fn sel(n: u32) -> SelectorId {
        SelectorId::new(n)
    }

    fn klass(n: u32) -> KlassId {
        KlassId::new(n)
    }

    fn code(size: usize) -> CompiledCode {
        CompiledCode {
            code_size: size,
            footprint: 20,
            sends: Vec::new(),
        }
    }

    #[test]
    fn test_install_retires_previous() {
        let mut rt = DispatchRuntime::new(DispatchConfig::for_testing());
        let key = LookupKey::new(klass(5), sel(1));
        let a = rt.install_compiled(key, MethodId::new(1), 1, &code(64)).unwrap();
        let b = rt.install_compiled(key, MethodId::new(1), 2, &code(64)).unwrap();
        assert!(rt.code_table().get(a).unwrap().is_zombie());
        assert_eq!(rt.code_table().lookup(&key).map(|u| u.id), Some(b));
        assert!(rt.verify());
    }

    #[test]
    fn test_install_with_other_method_clears_callers() {
        let mut model = ScriptedModel::new();
        model.define(klass(5), sel(1), MethodId::new(10), 30);
        let mut rt = DispatchRuntime::new(DispatchConfig::for_testing());
        let key = LookupKey::new(klass(5), sel(1));
        rt.install_compiled(key, MethodId::new(10), 1, &code(64)).unwrap();
        let site = rt.register_interpreted_site(MethodId::new(99), sel(1), SendKind::Normal);
        rt.send(site, klass(5), &model).unwrap();

        rt.install_compiled(key, MethodId::new(11), 1, &code(64)).unwrap();
        assert_eq!(rt.sites().get(site).unwrap().target(), SiteTarget::Empty);
        assert!(rt.verify());
    }

    #[test]
    fn test_zombie_hit_is_a_miss() {
        let mut model = ScriptedModel::new();
        model.define(klass(5), sel(1), MethodId::new(10), 30);
        let mut rt = DispatchRuntime::new(DispatchConfig::for_testing());
        let key = LookupKey::new(klass(5), sel(1));
        let unit = rt.install_compiled(key, MethodId::new(10), 1, &code(64)).unwrap();
        let site = rt.register_interpreted_site(MethodId::new(99), sel(1), SendKind::Normal);
        rt.send(site, klass(5), &model).unwrap();

        // Bypass retirement so the site still names the zombie.
        rt.code_table_mut().make_zombie(unit);
        rt.lookup_cache_mut().flush_all();
        assert!(!rt.verify());
        let r = rt.send(site, klass(5), &model).unwrap();
        assert_eq!(r, LookupResult::method_result(MethodId::new(10)));
        assert_eq!(rt.ic_stats().misses, 2);
        assert_eq!(rt.code_table().get(unit).unwrap().invocation_counter(), 0);
        assert!(rt.verify());
    }

    #[test]
    fn test_install_exhausted() {
        let mut rt =
            DispatchRuntime::new(DispatchConfig::for_testing().with_code_space_bytes(32));
        let key = LookupKey::new(klass(5), sel(1));
        let err = rt
            .install_compiled(key, MethodId::new(1), 1, &code(64))
            .unwrap_err();
        assert!(err.is_resource_exhaustion());
    }

    #[test]
    fn test_send_monomorphic_hit() {
        let mut model = ScriptedModel::new();
        model.define(klass(5), sel(1), MethodId::new(10), 30);
        let mut rt = DispatchRuntime::new(DispatchConfig::for_testing());
        let site = rt.register_interpreted_site(MethodId::new(99), sel(1), SendKind::Normal);

        let first = rt.send(site, klass(5), &model).unwrap();
        assert_eq!(first, LookupResult::method_result(MethodId::new(10)));
        let second = rt.send(site, klass(5), &model).unwrap();
        assert_eq!(second, first);
        assert_eq!(rt.ic_stats().misses, 1);
        assert_eq!(rt.ic_stats().hits, 1);
        assert_eq!(rt.sites().get(site).unwrap().send_count(), 2);
    }

    #[test]
    fn test_send_not_understood() {
        let model = ScriptedModel::new();
        let mut rt = DispatchRuntime::new(DispatchConfig::for_testing());
        let site = rt.register_interpreted_site(MethodId::new(99), sel(1), SendKind::Normal);
        assert_eq!(
            rt.send(site, klass(5), &model),
            Err(DispatchError::MessageNotUnderstood {
                klass: klass(5),
                selector: sel(1)
            })
        );
        assert_eq!(
            rt.send(SiteId::new(77), klass(5), &model),
            Err(DispatchError::UnknownSite(SiteId::new(77)))
        );
    }

    #[test]
    fn test_repatch_monomorphic_site() {
        let mut model = ScriptedModel::new();
        model.define(klass(5), sel(1), MethodId::new(10), 30);
        let mut rt = DispatchRuntime::new(DispatchConfig::for_testing());
        let site = rt.register_interpreted_site(MethodId::new(99), sel(1), SendKind::Normal);
        rt.send(site, klass(5), &model).unwrap();

        let key = LookupKey::new(klass(5), sel(1));
        let unit = rt.install_compiled(key, MethodId::new(10), 1, &code(32)).unwrap();
        assert!(rt.repatch_site(site, klass(5), unit).unwrap());
        assert!(!rt.repatch_site(site, klass(6), unit).unwrap());
        assert_eq!(
            rt.send(site, klass(5), &model).unwrap(),
            LookupResult::entry_result(unit, MethodId::new(10))
        );
        assert_eq!(rt.code_table().get(unit).unwrap().invocation_counter(), 1);
        assert!(rt.verify());
    }

    #[test]
    fn test_relocate_site_references() {
        let mut model = ScriptedModel::new();
        model.define(klass(5), sel(1), MethodId::new(10), 30);
        let mut rt = DispatchRuntime::new(DispatchConfig::for_testing());
        let site = rt.register_interpreted_site(MethodId::new(99), sel(1), SendKind::Normal);
        rt.send(site, klass(5), &model).unwrap();

        rt.before_relocation();
        rt.relocate(&mut |r| {
            if let EmbeddedRef::Klass(k) = r {
                *k = KlassId::new(k.raw() + 50);
            }
        });
        rt.after_relocation();
        assert_eq!(
            rt.sites().get(site).unwrap().target(),
            SiteTarget::Monomorphic {
                klass: klass(55),
                target: PicTarget::Interpreted(MethodId::new(10)),
            }
        );
        assert_eq!(rt.lookup_cache().occupancy(), 0);
    }

    #[test]
    fn test_mark_uncommon_trap_unknown() {
        let mut rt = DispatchRuntime::new(DispatchConfig::for_testing());
        assert_eq!(
            rt.mark_uncommon_trap(CodeId::new(3)),
            Err(DispatchError::UnknownCode(CodeId::new(3)))
        );
    }
}
