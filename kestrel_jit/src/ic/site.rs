//! Inline cache sites.
//!
//! A site is the per-send storage the dispatch core mutates. What it holds
//! decides how the send is dispatched:
//!
//! - `Empty`: call the miss handler;
//! - `Monomorphic`: compare one type, call its target directly;
//! - `Pic`: call a PIC body;
//! - `Generic`: call the lookup routine every time.
//!
//! Sites are indexed by the method or compiled unit whose code contains
//! them, so recompilation can clear a retired unit's sites and the policy
//! can count the sends a frame causes.

use super::pic::{PicHeap, PicTarget};
use super::{IcState, SendKind};
use kestrel_core::{
    CodeId, DispatchError, DispatchResult, KlassId, MethodId, PicId, SelectorId, SiteId,
};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Code that contains a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiteOwner {
    /// A bytecode send in an interpreted method.
    Interpreted(MethodId),
    /// A call in a compiled unit.
    Compiled(CodeId),
}

/// What a site currently calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SiteTarget {
    /// Nothing cached.
    #[default]
    Empty,
    /// One type, one direct target.
    Monomorphic {
        /// Cached receiver type.
        klass: KlassId,
        /// Direct target.
        target: PicTarget,
    },
    /// A PIC (polymorphic or megamorphic).
    Pic(PicId),
    /// Unspecialized lookup on every send.
    Generic,
}

/// One call site.
#[derive(Debug, Clone)]
pub struct InlineCacheSite {
    /// Identity of the site.
    pub id: SiteId,
    /// Code containing the site.
    pub owner: SiteOwner,
    /// Selector sent.
    pub selector: SelectorId,
    /// Normal or super send.
    pub kind: SendKind,
    target: SiteTarget,
    send_count: u32,
    miss_count: u32,
}

impl InlineCacheSite {
    /// Current target.
    #[inline]
    pub fn target(&self) -> SiteTarget {
        self.target
    }

    /// Repoint the site. A single word-sized store in real code.
    #[inline]
    pub fn set_target(&mut self, target: SiteTarget) {
        self.target = target;
    }

    /// Forget the cached target.
    #[inline]
    pub fn clear(&mut self) {
        self.target = SiteTarget::Empty;
    }

    /// Sends executed through the site.
    #[inline]
    pub fn send_count(&self) -> u32 {
        self.send_count
    }

    /// Count one send.
    #[inline]
    pub fn record_send(&mut self) {
        self.send_count = self.send_count.saturating_add(1);
    }

    /// Misses taken by the site.
    #[inline]
    pub fn miss_count(&self) -> u32 {
        self.miss_count
    }

    /// Count one miss.
    #[inline]
    pub fn record_miss(&mut self) {
        self.miss_count = self.miss_count.saturating_add(1);
    }

    /// Check if the owner is compiled code.
    #[inline]
    pub fn in_compiled_code(&self) -> bool {
        matches!(self.owner, SiteOwner::Compiled(_))
    }

    /// State of the site, consulting the PIC heap for PIC shapes.
    pub fn state(&self, pics: &PicHeap) -> IcState {
        match self.target {
            SiteTarget::Empty => IcState::Uninitialized,
            SiteTarget::Monomorphic { .. } => IcState::Monomorphic,
            SiteTarget::Pic(id) => match pics.get(id) {
                Some(pic) if !pic.is_megamorphic() => IcState::Polymorphic,
                _ => IcState::Megamorphic,
            },
            SiteTarget::Generic => IcState::Megamorphic,
        }
    }

    /// Target the site would use for `klass` without a miss.
    pub fn cached_target(&self, klass: KlassId, pics: &PicHeap) -> Option<PicTarget> {
        match self.target {
            SiteTarget::Monomorphic { klass: k, target } if k == klass => Some(target),
            SiteTarget::Pic(id) => pics.get(id).and_then(|p| p.target_for(klass)),
            _ => None,
        }
    }

    /// Check whether the site would send `klass` to `target`.
    pub fn targets(&self, klass: KlassId, target: PicTarget, pics: &PicHeap) -> bool {
        self.cached_target(klass, pics) == Some(target)
    }
}

// =============================================================================
// Site Table
// =============================================================================

/// Registry of all call sites.
#[derive(Debug, Default)]
pub struct SiteTable {
    /// Indexed by id; removed sites leave a hole so ids stay stable.
    sites: Vec<Option<InlineCacheSite>>,
    live: usize,
    by_owner: FxHashMap<SiteOwner, SmallVec<[SiteId; 4]>>,
}

impl SiteTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new, empty site.
    pub fn register(&mut self, owner: SiteOwner, selector: SelectorId, kind: SendKind) -> SiteId {
        let id = SiteId::new(self.sites.len() as u32 + 1);
        self.sites.push(Some(InlineCacheSite {
            id,
            owner,
            selector,
            kind,
            target: SiteTarget::Empty,
            send_count: 0,
            miss_count: 0,
        }));
        self.live += 1;
        self.by_owner.entry(owner).or_default().push(id);
        id
    }

    #[inline]
    fn index(id: SiteId) -> usize {
        (id.raw() as usize).wrapping_sub(1)
    }

    /// Get a site.
    #[inline]
    pub fn get(&self, id: SiteId) -> Option<&InlineCacheSite> {
        self.sites.get(Self::index(id))?.as_ref()
    }

    /// Get a site mutably.
    #[inline]
    pub fn get_mut(&mut self, id: SiteId) -> Option<&mut InlineCacheSite> {
        self.sites.get_mut(Self::index(id))?.as_mut()
    }

    /// Get a site, or report an unknown handle.
    #[inline]
    pub fn site(&self, id: SiteId) -> DispatchResult<&InlineCacheSite> {
        self.get(id).ok_or(DispatchError::UnknownSite(id))
    }

    /// Get a site mutably, or report an unknown handle.
    #[inline]
    pub fn site_mut(&mut self, id: SiteId) -> DispatchResult<&mut InlineCacheSite> {
        self.get_mut(id).ok_or(DispatchError::UnknownSite(id))
    }

    /// Sites contained in `owner`.
    pub fn sites_of(&self, owner: SiteOwner) -> &[SiteId] {
        self.by_owner
            .get(&owner)
            .map(|ids| ids.as_slice())
            .unwrap_or(&[])
    }

    /// Total sends executed through the sites of `owner`.
    pub fn sends_of(&self, owner: SiteOwner) -> u64 {
        self.sites_of(owner)
            .iter()
            .filter_map(|&id| self.get(id))
            .map(|s| u64::from(s.send_count))
            .sum()
    }

    /// Clear every site of `owner`, returning the PICs they held.
    pub fn clear_owner(&mut self, owner: SiteOwner) -> Vec<PicId> {
        let ids: SmallVec<[SiteId; 4]> = self.by_owner.get(&owner).cloned().unwrap_or_default();
        let mut pics = Vec::new();
        for id in ids {
            if let Some(site) = self.get_mut(id) {
                if let SiteTarget::Pic(pic) = site.target {
                    pics.push(pic);
                }
                site.clear();
            }
        }
        pics
    }

    /// Drop every site of `owner`, returning the PICs they held.
    ///
    /// Used once the owner's code is freed; the ids are not reused.
    pub fn remove_owner(&mut self, owner: SiteOwner) -> Vec<PicId> {
        let Some(ids) = self.by_owner.remove(&owner) else {
            return Vec::new();
        };
        let mut pics = Vec::new();
        for id in ids {
            let Some(site) = self.sites.get_mut(Self::index(id)).and_then(Option::take) else {
                continue;
            };
            if let SiteTarget::Pic(pic) = site.target {
                pics.push(pic);
            }
            self.live -= 1;
        }
        pics
    }

    /// Iterate over all sites.
    pub fn iter(&self) -> impl Iterator<Item = &InlineCacheSite> {
        self.sites.iter().flatten()
    }

    /// Iterate mutably over all sites.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut InlineCacheSite> {
        self.sites.iter_mut().flatten()
    }

    /// Ids of all sites.
    pub fn ids(&self) -> Vec<SiteId> {
        self.iter().map(|s| s.id).collect()
    }

    /// Number of sites.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    /// Check for no sites.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_index() {
        let mut table = SiteTable::new();
        let owner = SiteOwner::Interpreted(MethodId::new(3));
        let a = table.register(owner, SelectorId::new(1), SendKind::Normal);
        let b = table.register(owner, SelectorId::new(2), SendKind::Normal);
        assert_eq!(table.sites_of(owner), &[a, b]);
        assert!(table.sites_of(SiteOwner::Compiled(CodeId::new(1))).is_empty());
        assert_eq!(table.site(a).unwrap().selector, SelectorId::new(1));
        assert_eq!(
            table.site(SiteId::new(99)).unwrap_err(),
            DispatchError::UnknownSite(SiteId::new(99))
        );
        assert!(table.get(SiteId::new(0)).is_none());
    }

    #[test]
    fn test_send_counts() {
        let mut table = SiteTable::new();
        let owner = SiteOwner::Compiled(CodeId::new(4));
        let a = table.register(owner, SelectorId::new(1), SendKind::Normal);
        let b = table.register(owner, SelectorId::new(2), SendKind::Normal);
        for _ in 0..3 {
            table.get_mut(a).unwrap().record_send();
        }
        table.get_mut(b).unwrap().record_send();
        assert_eq!(table.sends_of(owner), 4);
    }

    #[test]
    fn test_monomorphic_cached_target() {
        let mut table = SiteTable::new();
        let pics = PicHeap::new();
        let id = table.register(
            SiteOwner::Interpreted(MethodId::new(1)),
            SelectorId::new(1),
            SendKind::Normal,
        );
        let site = table.get_mut(id).unwrap();
        assert_eq!(site.state(&pics), IcState::Uninitialized);
        let target = PicTarget::Compiled(CodeId::new(5));
        site.set_target(SiteTarget::Monomorphic {
            klass: KlassId::new(7),
            target,
        });
        assert_eq!(site.state(&pics), IcState::Monomorphic);
        assert!(site.targets(KlassId::new(7), target, &pics));
        assert_eq!(site.cached_target(KlassId::new(8), &pics), None);
    }

    #[test]
    fn test_clear_owner_returns_pics() {
        let mut table = SiteTable::new();
        let owner = SiteOwner::Compiled(CodeId::new(4));
        let a = table.register(owner, SelectorId::new(1), SendKind::Normal);
        let b = table.register(owner, SelectorId::new(2), SendKind::Normal);
        table.get_mut(a).unwrap().set_target(SiteTarget::Pic(PicId::new(9)));
        table.get_mut(b).unwrap().set_target(SiteTarget::Generic);
        assert_eq!(table.clear_owner(owner), vec![PicId::new(9)]);
        assert_eq!(table.get(a).unwrap().target(), SiteTarget::Empty);
        assert_eq!(table.get(b).unwrap().target(), SiteTarget::Empty);
    }

    #[test]
    fn test_remove_owner_keeps_other_ids() {
        let mut table = SiteTable::new();
        let gone = SiteOwner::Compiled(CodeId::new(4));
        let kept = SiteOwner::Interpreted(MethodId::new(1));
        let a = table.register(gone, SelectorId::new(1), SendKind::Normal);
        let b = table.register(kept, SelectorId::new(2), SendKind::Normal);
        table.get_mut(a).unwrap().set_target(SiteTarget::Pic(PicId::new(3)));

        assert_eq!(table.remove_owner(gone), vec![PicId::new(3)]);
        assert_eq!(table.len(), 1);
        assert!(table.get(a).is_none());
        assert!(table.sites_of(gone).is_empty());
        assert_eq!(table.site(b).unwrap().selector, SelectorId::new(2));
        assert_eq!(table.ids(), vec![b]);
        assert!(table.remove_owner(gone).is_empty());

        let c = table.register(gone, SelectorId::new(5), SendKind::Normal);
        assert_ne!(c, a);
        assert_eq!(table.len(), 2);
    }
}
