//! Lookup results.
//!
//! A `LookupResult` is the currency passed between the lookup cache, the
//! inline-cache miss handler, PIC construction and recompilation. It says
//! which code implements a send: an interpretable method, or a compiled
//! unit's entry. Compiled entries remember their source method, so
//! `method()` never needs to consult the code table.

use kestrel_core::{CodeId, MethodId};

/// Outcome of resolving a (type, selector) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LookupResult {
    /// Nothing resolved (or cleared).
    #[default]
    Empty,
    /// An interpretable method.
    Method(MethodId),
    /// A compiled unit's entry point.
    Entry {
        /// The compiled unit.
        code: CodeId,
        /// The method the unit was compiled from.
        method: MethodId,
    },
}

impl LookupResult {
    /// Create a result naming an interpretable method.
    #[inline]
    #[must_use]
    pub const fn method_result(method: MethodId) -> Self {
        Self::Method(method)
    }

    /// Create a result naming a compiled unit.
    #[inline]
    #[must_use]
    pub const fn entry_result(code: CodeId, method: MethodId) -> Self {
        Self::Entry { code, method }
    }

    /// Overwrite with an interpretable method.
    #[inline]
    pub fn set_method(&mut self, method: MethodId) {
        *self = Self::Method(method);
    }

    /// Overwrite with a compiled unit.
    #[inline]
    pub fn set_entry(&mut self, code: CodeId, method: MethodId) {
        *self = Self::Entry { code, method };
    }

    /// Reset to the empty state.
    #[inline]
    pub fn clear(&mut self) {
        *self = Self::Empty;
    }

    /// Check for the empty state.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Check for an interpretable method.
    #[inline]
    #[must_use]
    pub const fn is_method(&self) -> bool {
        matches!(self, Self::Method(_))
    }

    /// Check for a compiled entry.
    #[inline]
    #[must_use]
    pub const fn is_entry(&self) -> bool {
        matches!(self, Self::Entry { .. })
    }

    /// The source method, looking through compiled entries.
    ///
    /// # Panics
    ///
    /// Panics on an empty result; callers must test `is_empty` first.
    #[inline]
    #[must_use]
    pub fn method(&self) -> MethodId {
        match *self {
            Self::Method(method) | Self::Entry { method, .. } => method,
            Self::Empty => panic!("method() of an empty lookup result"),
        }
    }

    /// The source method, or `None` when empty.
    #[inline]
    #[must_use]
    pub const fn method_or_none(&self) -> Option<MethodId> {
        match *self {
            Self::Method(method) | Self::Entry { method, .. } => Some(method),
            Self::Empty => None,
        }
    }

    /// The compiled unit, if this is an entry.
    #[inline]
    #[must_use]
    pub const fn entry(&self) -> Option<CodeId> {
        match *self {
            Self::Entry { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Check whether this result resolves to exactly `method` in
    /// interpreted form.
    #[inline]
    #[must_use]
    pub fn matches_method(&self, method: MethodId) -> bool {
        matches!(*self, Self::Method(m) if m == method)
    }

    /// Check whether this result resolves to the compiled unit `code`.
    #[inline]
    #[must_use]
    pub fn matches_code(&self, code: CodeId) -> bool {
        matches!(*self, Self::Entry { code: c, .. } if c == code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_empty() {
        let r = LookupResult::default();
        assert!(r.is_empty());
        assert!(!r.is_method());
        assert!(!r.is_entry());
        assert!(r.method_or_none().is_none());
    }

    #[test]
    fn test_exactly_one_state() {
        let mut r = LookupResult::Empty;
        r.set_method(MethodId::new(4));
        assert!(r.is_method() && !r.is_entry() && !r.is_empty());
        r.set_entry(CodeId::new(9), MethodId::new(4));
        assert!(r.is_entry() && !r.is_method() && !r.is_empty());
        r.clear();
        assert!(r.is_empty());
    }

    #[test]
    fn test_method_through_entry() {
        let r = LookupResult::entry_result(CodeId::new(1), MethodId::new(7));
        assert_eq!(r.method(), MethodId::new(7));
        assert_eq!(r.entry(), Some(CodeId::new(1)));
    }

    #[test]
    #[should_panic(expected = "empty lookup result")]
    fn test_method_of_empty_panics() {
        let _ = LookupResult::Empty.method();
    }

    #[test]
    fn test_matches() {
        let m = LookupResult::method_result(MethodId::new(2));
        assert!(m.matches_method(MethodId::new(2)));
        assert!(!m.matches_method(MethodId::new(3)));
        assert!(!m.matches_code(CodeId::new(2)));

        let e = LookupResult::entry_result(CodeId::new(5), MethodId::new(2));
        assert!(e.matches_code(CodeId::new(5)));
        assert!(!e.matches_method(MethodId::new(2)));
    }
}
