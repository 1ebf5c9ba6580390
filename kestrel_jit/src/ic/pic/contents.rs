//! PIC contents builder.
//!
//! Collects the (type → target) pairs a new PIC will dispatch over before
//! any code is emitted. Pairs are kept in three groups, matching the three
//! parts of the generated code:
//!
//! - the small-integer fast path (at most one pair, no type load needed);
//! - compiled targets, dispatched by an inline compare/jump chain;
//! - interpreted targets, handed to the shared interpreted-PIC stub.

use super::PicTarget;
use super::layout;
use crate::lookup::LookupResult;
use kestrel_core::{CodeId, KlassId, MethodId};
use smallvec::SmallVec;

/// Inline capacity of each entry group.
const INLINE_ENTRIES: usize = 4;

/// Transient builder for PIC contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PicContents {
    smi: Option<PicTarget>,
    compiled: SmallVec<[(KlassId, CodeId); INLINE_ENTRIES]>,
    interpreted: SmallVec<[(KlassId, MethodId); INLINE_ENTRIES]>,
}

impl PicContents {
    /// Create empty contents.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pair.
    ///
    /// # Panics
    ///
    /// Panics if `klass` is already present: a type may appear in at most
    /// one slot of a PIC.
    pub fn append(&mut self, klass: KlassId, target: PicTarget) {
        assert!(
            !self.contains(klass),
            "duplicate type {klass} in polymorphic inline cache"
        );
        if klass.is_small_integer() {
            self.smi = Some(target);
            return;
        }
        match target {
            PicTarget::Compiled(code) => self.compiled.push((klass, code)),
            PicTarget::Interpreted(method) => self.interpreted.push((klass, method)),
        }
    }

    /// Add a pair from a lookup result. Empty results are ignored.
    pub fn append_result(&mut self, klass: KlassId, result: LookupResult) {
        if let Some(target) = PicTarget::from_result(result) {
            self.append(klass, target);
        }
    }

    /// Replace the target for a type already present.
    ///
    /// Returns `false` if the type is absent.
    pub fn substitute(&mut self, klass: KlassId, target: PicTarget) -> bool {
        if !self.remove(klass) {
            return false;
        }
        self.append(klass, target);
        true
    }

    /// Remove a type. Returns `false` if absent.
    pub fn remove(&mut self, klass: KlassId) -> bool {
        if klass.is_small_integer() {
            return self.smi.take().is_some();
        }
        if let Some(i) = self.compiled.iter().position(|&(k, _)| k == klass) {
            self.compiled.remove(i);
            return true;
        }
        if let Some(i) = self.interpreted.iter().position(|&(k, _)| k == klass) {
            self.interpreted.remove(i);
            return true;
        }
        false
    }

    /// Check if a type is present.
    pub fn contains(&self, klass: KlassId) -> bool {
        self.target_for(klass).is_some()
    }

    /// Target for a type, if present.
    pub fn target_for(&self, klass: KlassId) -> Option<PicTarget> {
        if klass.is_small_integer() {
            return self.smi;
        }
        self.compiled
            .iter()
            .find(|&&(k, _)| k == klass)
            .map(|&(_, c)| PicTarget::Compiled(c))
            .or_else(|| {
                self.interpreted
                    .iter()
                    .find(|&&(k, _)| k == klass)
                    .map(|&(_, m)| PicTarget::Interpreted(m))
            })
    }

    /// Small-integer fast-path target.
    #[inline]
    pub fn smi_target(&self) -> Option<PicTarget> {
        self.smi
    }

    /// Compiled entries in emission order.
    #[inline]
    pub fn compiled(&self) -> &[(KlassId, CodeId)] {
        &self.compiled
    }

    /// Interpreted entries in emission order.
    #[inline]
    pub fn interpreted(&self) -> &[(KlassId, MethodId)] {
        &self.interpreted
    }

    /// Total number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        usize::from(self.smi.is_some()) + self.compiled.len() + self.interpreted.len()
    }

    /// Check for no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries in emission order: fast path, compiled, interpreted.
    pub fn entries(&self) -> Vec<(KlassId, PicTarget)> {
        let mut out = Vec::with_capacity(self.len());
        if let Some(t) = self.smi {
            out.push((KlassId::SMALL_INTEGER, t));
        }
        out.extend(
            self.compiled
                .iter()
                .map(|&(k, c)| (k, PicTarget::Compiled(c))),
        );
        out.extend(
            self.interpreted
                .iter()
                .map(|&(k, m)| (k, PicTarget::Interpreted(m))),
        );
        out
    }

    /// Exact code size of the dispatch shape for these contents.
    #[inline]
    pub fn code_size(&self) -> usize {
        layout::dispatch_code_size(
            self.smi.is_some(),
            self.compiled.len(),
            self.interpreted.len(),
        )
    }

    /// Check type uniqueness across all three groups.
    pub fn verify(&self) -> bool {
        let entries = self.entries();
        entries
            .iter()
            .enumerate()
            .all(|(i, (k, _))| entries[i + 1..].iter().all(|(other, _)| other != k))
            && self.compiled.iter().all(|(k, _)| !k.is_small_integer())
            && self.interpreted.iter().all(|(k, _)| !k.is_small_integer())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn klass(n: u32) -> KlassId {
        KlassId::new(n)
    }

    #[test]
    fn test_groups() {
        let mut c = PicContents::new();
        c.append(KlassId::SMALL_INTEGER, PicTarget::Compiled(CodeId::new(1)));
        c.append(klass(5), PicTarget::Compiled(CodeId::new(2)));
        c.append(klass(6), PicTarget::Interpreted(MethodId::new(3)));
        assert_eq!(c.len(), 3);
        assert_eq!(c.compiled().len(), 1);
        assert_eq!(c.interpreted().len(), 1);
        assert_eq!(c.smi_target(), Some(PicTarget::Compiled(CodeId::new(1))));
        assert!(c.verify());
    }

    #[test]
    #[should_panic(expected = "duplicate type")]
    fn test_duplicate_panics() {
        let mut c = PicContents::new();
        c.append(klass(5), PicTarget::Compiled(CodeId::new(2)));
        c.append(klass(5), PicTarget::Interpreted(MethodId::new(2)));
    }

    #[test]
    #[should_panic(expected = "duplicate type")]
    fn test_duplicate_smi_panics() {
        let mut c = PicContents::new();
        c.append(KlassId::SMALL_INTEGER, PicTarget::Interpreted(MethodId::new(2)));
        c.append(KlassId::SMALL_INTEGER, PicTarget::Compiled(CodeId::new(2)));
    }

    #[test]
    fn test_substitute_moves_between_groups() {
        let mut c = PicContents::new();
        c.append(klass(5), PicTarget::Interpreted(MethodId::new(9)));
        assert!(c.substitute(klass(5), PicTarget::Compiled(CodeId::new(4))));
        assert!(c.interpreted().is_empty());
        assert_eq!(c.compiled(), &[(klass(5), CodeId::new(4))]);
        assert!(!c.substitute(klass(6), PicTarget::Compiled(CodeId::new(4))));
    }

    #[test]
    fn test_remove_and_target_for() {
        let mut c = PicContents::new();
        c.append(klass(5), PicTarget::Interpreted(MethodId::new(9)));
        assert_eq!(
            c.target_for(klass(5)),
            Some(PicTarget::Interpreted(MethodId::new(9)))
        );
        assert!(c.remove(klass(5)));
        assert!(!c.remove(klass(5)));
        assert!(c.is_empty());
    }

    #[test]
    fn test_append_result_ignores_empty() {
        let mut c = PicContents::new();
        c.append_result(klass(3), LookupResult::Empty);
        assert!(c.is_empty());
        c.append_result(
            klass(3),
            LookupResult::entry_result(CodeId::new(8), MethodId::new(1)),
        );
        assert_eq!(c.target_for(klass(3)), Some(PicTarget::Compiled(CodeId::new(8))));
    }

    #[test]
    fn test_entries_order() {
        let mut c = PicContents::new();
        c.append(klass(6), PicTarget::Interpreted(MethodId::new(3)));
        c.append(klass(5), PicTarget::Compiled(CodeId::new(2)));
        c.append(KlassId::SMALL_INTEGER, PicTarget::Interpreted(MethodId::new(1)));
        let kinds: Vec<_> = c.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(kinds, vec![KlassId::SMALL_INTEGER, klass(5), klass(6)]);
    }
}
