//! IC Miss Handler
//!
//! Slow path taken when a call site has no entry for the receiver's type.
//!
//! # Design
//!
//! The handler:
//! 1. Resolves the send through the lookup cache (normal or super)
//! 2. Decides the site's next shape from what it held before
//! 3. Returns the resolved target for the caller to invoke
//!
//! | Before        | After                                              |
//! |---------------|----------------------------------------------------|
//! | empty         | monomorphic (1-entry PIC for compiled → interpreted) |
//! | monomorphic   | PIC with 2 entries                                 |
//! | PIC (n < cap) | PIC with n + 1 entries                             |
//! | PIC (n = cap) | megamorphic PIC, or generic lookup                 |
//!
//! Running out of code space leaves the site unchanged; the send still
//! completes through the lookup cache.

use super::pic::{AllocateOutcome, PicTarget, PreviousTarget};
use super::{SendKind, SiteTarget};
use crate::lookup::{LookupCache, LookupResult};
use crate::runtime::DispatchRuntime;
use crate::runtime::code_table::CodeTable;
use crate::runtime::collaborators::ObjectModel;
use kestrel_core::{DispatchError, DispatchResult, KlassId, SelectorId, SiteId};

/// Resolve a send of `selector` to a receiver of type `klass`.
pub(crate) fn resolve_send(
    cache: &mut LookupCache,
    codes: &CodeTable,
    model: &dyn ObjectModel,
    kind: SendKind,
    klass: KlassId,
    selector: SelectorId,
) -> LookupResult {
    match kind {
        SendKind::Normal => cache.ic_normal_lookup(klass, selector, codes, model),
        SendKind::Super { ancestor } => {
            cache.ic_super_lookup(klass, ancestor, selector, codes, model)
        }
    }
}

impl DispatchRuntime {
    /// Handle a miss at `site` for a receiver of type `klass`.
    ///
    /// Returns the resolved target, or `MessageNotUnderstood` when no
    /// method implements the send (the site is left unchanged).
    #[inline(never)]
    pub fn ic_miss(
        &mut self,
        site_id: SiteId,
        klass: KlassId,
        model: &dyn ObjectModel,
    ) -> DispatchResult<LookupResult> {
        self.ic_stats.misses += 1;
        let site = self.sites.site_mut(site_id)?;
        site.record_miss();
        let selector = site.selector;
        let kind = site.kind;
        let previous = site.target();
        let compiled_owner = site.in_compiled_code();

        let result = resolve_send(&mut self.cache, &self.codes, model, kind, klass, selector);
        let Some(target) = PicTarget::from_result(result) else {
            return Err(DispatchError::MessageNotUnderstood { klass, selector });
        };

        let next = match previous {
            SiteTarget::Generic => None,
            SiteTarget::Empty => self.bind(site_id, selector, klass, target, result)?,
            SiteTarget::Monomorphic { klass: k, .. } if k == klass => {
                self.bind(site_id, selector, klass, target, result)?
            }
            SiteTarget::Monomorphic { klass: k, target: t } => self.grow(
                site_id,
                selector,
                PreviousTarget::Monomorphic { klass: k, target: t },
                klass,
                result,
            )?,
            SiteTarget::Pic(id) => {
                self.grow(site_id, selector, PreviousTarget::Pic(id), klass, result)?
            }
        };

        if let Some(next) = next {
            if next != previous {
                log::debug!("{site_id}: {previous:?} -> {next:?} on {klass}");
            }
            self.sites.site_mut(site_id)?.set_target(next);
        }
        debug_assert!(!compiled_owner || self.site_targets_compiled_or_pic(site_id));
        Ok(result)
    }

    /// First binding of a site: a direct call, except that compiled code
    /// cannot call an interpreted method directly and gets a 1-entry PIC.
    fn bind(
        &mut self,
        site_id: SiteId,
        selector: SelectorId,
        klass: KlassId,
        target: PicTarget,
        result: LookupResult,
    ) -> DispatchResult<Option<SiteTarget>> {
        let compiled_owner = self.sites.site(site_id)?.in_compiled_code();
        if compiled_owner && !target.is_compiled() {
            return self.grow(site_id, selector, PreviousTarget::Empty, klass, result);
        }
        self.ic_stats.to_monomorphic += 1;
        Ok(Some(SiteTarget::Monomorphic { klass, target }))
    }

    fn grow(
        &mut self,
        site_id: SiteId,
        selector: SelectorId,
        previous: PreviousTarget,
        klass: KlassId,
        result: LookupResult,
    ) -> DispatchResult<Option<SiteTarget>> {
        let outcome = self.pics.allocate(
            &mut self.space,
            &self.config,
            site_id,
            selector,
            previous,
            klass,
            result,
        )?;
        Ok(match outcome {
            AllocateOutcome::Polymorphic(id) => {
                self.ic_stats.to_polymorphic += 1;
                Some(SiteTarget::Pic(id))
            }
            AllocateOutcome::Megamorphic(id) => {
                if previous != PreviousTarget::Pic(id) {
                    self.ic_stats.to_megamorphic += 1;
                }
                Some(SiteTarget::Pic(id))
            }
            AllocateOutcome::Generic => {
                self.ic_stats.to_megamorphic += 1;
                Some(SiteTarget::Generic)
            }
            AllocateOutcome::Exhausted => None,
        })
    }

    fn site_targets_compiled_or_pic(&self, site_id: SiteId) -> bool {
        !matches!(
            self.sites.get(site_id).map(|s| s.target()),
            Some(SiteTarget::Monomorphic {
                target: PicTarget::Interpreted(_),
                ..
            })
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
