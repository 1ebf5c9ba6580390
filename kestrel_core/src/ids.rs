//! Identity handles for runtime objects.
//!
//! Types, selectors, methods and compiled code are canonical objects in the
//! runtime heap. The dispatch core never looks inside them; it only compares
//! and hashes their identities. Each handle is a 32-bit newtype so it can be
//! embedded directly into generated dispatch code.

use std::fmt;

macro_rules! identity {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(pub u32);

        impl $name {
            /// Create a handle from its raw identity.
            #[inline]
            #[must_use]
            pub const fn new(raw: u32) -> Self {
                Self(raw)
            }

            /// Get the raw identity.
            #[inline]
            #[must_use]
            pub const fn raw(self) -> u32 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }

        impl From<u32> for $name {
            #[inline]
            fn from(raw: u32) -> Self {
                Self(raw)
            }
        }
    };
}

identity!(
    /// Identity of a receiver type (klass).
    KlassId,
    "klass"
);

identity!(
    /// Identity of an interned message selector.
    SelectorId,
    "sel"
);

identity!(
    /// Identity of an interpretable method (bytecode method object).
    MethodId,
    "method"
);

identity!(
    /// Identity of a compiled unit (optimized machine-code body).
    CodeId,
    "code"
);

identity!(
    /// Identity of an inline-cache call site.
    SiteId,
    "site"
);

identity!(
    /// Identity of a polymorphic inline cache object.
    PicId,
    "pic"
);

impl KlassId {
    /// The privileged primitive type (tagged small integers).
    ///
    /// Receivers of this type are recognised by a tag test alone, without
    /// loading type metadata, so dispatch code gives them a fast path.
    pub const SMALL_INTEGER: KlassId = KlassId(1);

    /// Check if this is the privileged small-integer type.
    #[inline]
    #[must_use]
    pub const fn is_small_integer(self) -> bool {
        self.0 == Self::SMALL_INTEGER.0
    }
}

/// An untyped reference to a heap object (receiver, argument, block value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct ObjectRef(pub u64);

impl ObjectRef {
    /// The null reference.
    pub const NULL: ObjectRef = ObjectRef(0);

    /// Check for the null reference.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_roundtrip() {
        let k = KlassId::new(42);
        assert_eq!(k.raw(), 42);
        assert_eq!(KlassId::from(42), k);
    }

    #[test]
    fn test_small_integer() {
        assert!(KlassId::SMALL_INTEGER.is_small_integer());
        assert!(!KlassId::new(2).is_small_integer());
    }

    #[test]
    fn test_debug_format() {
        assert_eq!(format!("{:?}", SelectorId::new(7)), "sel#7");
        assert_eq!(format!("{}", CodeId::new(3)), "code#3");
    }

    #[test]
    fn test_object_ref_null() {
        assert!(ObjectRef::NULL.is_null());
        assert!(!ObjectRef(8).is_null());
    }
}
