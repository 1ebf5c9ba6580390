//! Inline cache sweeping.
//!
//! Re-validates every call site against the current lookup results. Run
//! periodically, after a collection, and whenever a method changes.
//! Monomorphic sites are re-resolved directly; PIC sites go through
//! `PicHeap::cleanup`, which keeps, patches, shrinks, collapses or
//! discards the PIC.

use super::pic::{CleanupOutcome, PicTarget};
use super::{SiteOwner, SiteTarget, resolve_send};
use crate::lookup::LookupResult;
use crate::runtime::DispatchRuntime;
use crate::runtime::collaborators::ObjectModel;
use kestrel_core::KlassId;
use smallvec::SmallVec;

/// What a sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Sites examined.
    pub visited: usize,
    /// Sites whose cache was still valid.
    pub unchanged: usize,
    /// Sites retargeted without changing shape.
    pub patched: usize,
    /// PICs replaced by a smaller PIC.
    pub rebuilt: usize,
    /// PICs collapsed to a direct call.
    pub collapsed: usize,
    /// Sites reset to empty.
    pub cleared: usize,
}

impl DispatchRuntime {
    /// Re-validate every live call site.
    pub fn sweep_inline_caches(&mut self, model: &dyn ObjectModel) -> SweepReport {
        let mut report = SweepReport::default();
        for site_id in self.sites.ids() {
            let Some(site) = self.sites.get(site_id) else {
                continue;
            };
            if let SiteOwner::Compiled(code) = site.owner {
                if !self.codes.is_live(code) {
                    continue;
                }
            }
            let (selector, kind, target) = (site.selector, site.kind, site.target());
            let compiled_owner = site.in_compiled_code();
            report.visited += 1;

            let next = match target {
                SiteTarget::Empty | SiteTarget::Generic => {
                    report.unchanged += 1;
                    continue;
                }
                SiteTarget::Monomorphic { klass, target } => {
                    let result =
                        resolve_send(&mut self.cache, &self.codes, model, kind, klass, selector);
                    match PicTarget::from_result(result) {
                        Some(t) if t == target => {
                            report.unchanged += 1;
                            continue;
                        }
                        Some(t) if compiled_owner && !t.is_compiled() => {
                            report.cleared += 1;
                            SiteTarget::Empty
                        }
                        Some(t) => {
                            report.patched += 1;
                            SiteTarget::Monomorphic { klass, target: t }
                        }
                        None => {
                            report.cleared += 1;
                            SiteTarget::Empty
                        }
                    }
                }
                SiteTarget::Pic(id) => {
                    let cache = &mut self.cache;
                    let codes = &self.codes;
                    let mut resolved: SmallVec<[(KlassId, LookupResult); 8]> = SmallVec::new();
                    let outcome = self.pics.cleanup(&mut self.space, id, |klass| {
                        let result = resolve_send(cache, codes, model, kind, klass, selector);
                        resolved.push((klass, result));
                        result
                    });
                    match outcome {
                        Ok(CleanupOutcome::Kept { patched: 0 }) => {
                            report.unchanged += 1;
                            continue;
                        }
                        Ok(CleanupOutcome::Kept { .. }) => {
                            report.patched += 1;
                            continue;
                        }
                        Ok(CleanupOutcome::Rebuilt(new_id)) => {
                            report.rebuilt += 1;
                            SiteTarget::Pic(new_id)
                        }
                        Ok(CleanupOutcome::Collapsed(code)) => {
                            let klass = resolved
                                .iter()
                                .find(|(_, r)| r.entry() == Some(code))
                                .map(|&(k, _)| k);
                            match klass {
                                Some(klass) => {
                                    report.collapsed += 1;
                                    SiteTarget::Monomorphic {
                                        klass,
                                        target: PicTarget::Compiled(code),
                                    }
                                }
                                None => {
                                    report.cleared += 1;
                                    SiteTarget::Empty
                                }
                            }
                        }
                        Ok(CleanupOutcome::Discarded) => {
                            report.cleared += 1;
                            SiteTarget::Empty
                        }
                        Err(e) => {
                            log::warn!("{site_id}: sweeping {id} failed ({e}), clearing site");
                            report.cleared += 1;
                            SiteTarget::Empty
                        }
                    }
                }
            };

            if let Some(site) = self.sites.get_mut(site_id) {
                site.set_target(next);
            }
        }

        log::debug!(
            "swept {} sites: {} unchanged, {} patched, {} rebuilt, {} collapsed, {} cleared",
            report.visited,
            report.unchanged,
            report.patched,
            report.rebuilt,
            report.collapsed,
            report.cleared
        );
        report
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ic::{IcState, SendKind};
    use crate::lookup::LookupKey;
    use crate::runtime::{CompiledCode, DispatchConfig};
    use crate::testing::ScriptedModel;
    use kestrel_core::{MethodId, SelectorId};

    const SEL: SelectorId = SelectorId(3);

    fn klass(n: u32) -> KlassId {
        KlassId::new(n)
    }

    fn body() -> CompiledCode {
        CompiledCode {
            code_size: 48,
            footprint: 25,
            sends: Vec::new(),
        }
    }

    #[test]
    fn test_sweep_unchanged() {
        let mut model = ScriptedModel::new();
        model.define(klass(10), SEL, MethodId::new(100), 20);
        model.define(klass(11), SEL, MethodId::new(110), 20);
        let mut rt = DispatchRuntime::new(DispatchConfig::for_testing());
        let mono = rt.register_interpreted_site(MethodId::new(1), SEL, SendKind::Normal);
        let poly = rt.register_interpreted_site(MethodId::new(2), SEL, SendKind::Normal);
        rt.send(mono, klass(10), &model).unwrap();
        rt.send(poly, klass(10), &model).unwrap();
        rt.send(poly, klass(11), &model).unwrap();

        let report = rt.sweep_inline_caches(&model);
        assert_eq!(report.visited, 2);
        assert_eq!(report.unchanged, 2);
        assert_eq!(rt.sites().get(poly).unwrap().state(rt.pic_heap()), IcState::Polymorphic);
    }

    #[test]
    fn test_sweep_picks_up_new_compiled_code() {
        let mut model = ScriptedModel::new();
        model.define(klass(10), SEL, MethodId::new(100), 20);
        let mut rt = DispatchRuntime::new(DispatchConfig::for_testing());
        let site = rt.register_interpreted_site(MethodId::new(1), SEL, SendKind::Normal);
        rt.send(site, klass(10), &model).unwrap();

        let unit = rt
            .install_compiled(LookupKey::new(klass(10), SEL), MethodId::new(100), 1, &body())
            .unwrap();
        let report = rt.sweep_inline_caches(&model);
        assert_eq!(report.patched, 1);
        assert_eq!(
            rt.sites().get(site).unwrap().target(),
            SiteTarget::Monomorphic {
                klass: klass(10),
                target: PicTarget::Compiled(unit),
            }
        );
    }

    #[test]
    fn test_sweep_collapses_pic_to_surviving_compiled_entry() {
        let mut model = ScriptedModel::new();
        model.define(klass(10), SEL, MethodId::new(100), 20);
        model.define(klass(11), SEL, MethodId::new(110), 20);
        let mut rt = DispatchRuntime::new(DispatchConfig::for_testing());
        let unit = rt
            .install_compiled(LookupKey::new(klass(10), SEL), MethodId::new(100), 1, &body())
            .unwrap();
        let site = rt.register_interpreted_site(MethodId::new(1), SEL, SendKind::Normal);
        rt.send(site, klass(10), &model).unwrap();
        rt.send(site, klass(11), &model).unwrap();
        assert!(matches!(rt.sites().get(site).unwrap().target(), SiteTarget::Pic(_)));

        model.remove(klass(11), SEL);
        rt.lookup_cache_mut().flush_all();
        let report = rt.sweep_inline_caches(&model);
        assert_eq!(report.collapsed, 1);
        assert_eq!(
            rt.sites().get(site).unwrap().target(),
            SiteTarget::Monomorphic {
                klass: klass(10),
                target: PicTarget::Compiled(unit),
            }
        );
        assert!(rt.pic_heap().is_empty());
        assert!(rt.verify());
    }

    #[test]
    fn test_sweep_clears_dead_sites() {
        let mut model = ScriptedModel::new();
        model.define(klass(10), SEL, MethodId::new(100), 20);
        model.define(klass(11), SEL, MethodId::new(110), 20);
        let mut rt = DispatchRuntime::new(DispatchConfig::for_testing());
        let mono = rt.register_interpreted_site(MethodId::new(1), SEL, SendKind::Normal);
        let poly = rt.register_interpreted_site(MethodId::new(2), SEL, SendKind::Normal);
        rt.send(mono, klass(10), &model).unwrap();
        rt.send(poly, klass(10), &model).unwrap();
        rt.send(poly, klass(11), &model).unwrap();

        model.remove(klass(10), SEL);
        model.remove(klass(11), SEL);
        rt.lookup_cache_mut().flush_all();
        let report = rt.sweep_inline_caches(&model);
        assert_eq!(report.cleared, 2);
        assert_eq!(rt.sites().get(mono).unwrap().target(), SiteTarget::Empty);
        assert_eq!(rt.sites().get(poly).unwrap().target(), SiteTarget::Empty);
        assert_eq!(rt.pic_heap().len(), 0);
    }
}
