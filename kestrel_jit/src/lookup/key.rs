//! Lookup keys.

use kestrel_core::{KlassId, SelectorId};
use rustc_hash::FxHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// The (receiver type, selector) pair a send resolves.
///
/// Both halves are canonical identities, so equality and hashing never look
/// past the handles.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LookupKey {
    /// Receiver type.
    pub klass: KlassId,
    /// Message selector.
    pub selector: SelectorId,
}

impl LookupKey {
    /// Create a new key.
    #[inline]
    #[must_use]
    pub const fn new(klass: KlassId, selector: SelectorId) -> Self {
        Self { klass, selector }
    }

    /// Reinitialize this key in place.
    ///
    /// Hot paths keep one key around and overwrite it per lookup.
    #[inline]
    pub fn initialize(&mut self, klass: KlassId, selector: SelectorId) {
        self.klass = klass;
        self.selector = selector;
    }

    /// Hash used to address lookup-cache tables.
    #[inline]
    #[must_use]
    pub fn hash_value(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.klass.raw().hash(&mut hasher);
        self.selector.raw().hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Debug for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}>>{}", self.klass, self.selector)
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_in_place() {
        let mut key = LookupKey::new(KlassId::new(1), SelectorId::new(2));
        key.initialize(KlassId::new(3), SelectorId::new(4));
        assert_eq!(key, LookupKey::new(KlassId::new(3), SelectorId::new(4)));
    }

    #[test]
    fn test_hash_is_stable() {
        let a = LookupKey::new(KlassId::new(10), SelectorId::new(20));
        let b = LookupKey::new(KlassId::new(10), SelectorId::new(20));
        assert_eq!(a.hash_value(), b.hash_value());
    }

    #[test]
    fn test_hash_distinguishes_halves() {
        let a = LookupKey::new(KlassId::new(1), SelectorId::new(2));
        let b = LookupKey::new(KlassId::new(2), SelectorId::new(1));
        assert_ne!(a, b);
        assert_ne!(a.hash_value(), b.hash_value());
    }

    #[test]
    fn test_display() {
        let key = LookupKey::new(KlassId::new(4), SelectorId::new(5));
        assert_eq!(key.to_string(), "klass#4>>sel#5");
    }
}
