//! Slot-representation tags shared between the interpreter and the
//! quickening machinery.
//!
//! A tag set describes which unboxed representations a bytecode site may
//! produce or a variable may hold. The front-end compiler emits one set
//! per instruction (the static permitted-output hint); the engine keeps
//! one mutable set per local variable and narrows it monotonically
//! toward [`TagSet::OBJECT`] as speculation fails.

/// Bitmask of slot representations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TagSet(u8);

impl TagSet {
    /// Boxed object representation. Always valid.
    pub const OBJECT: Self = Self(0b001);
    /// Unboxed machine integer.
    pub const INT: Self = Self(0b010);
    /// Unboxed boolean.
    pub const BOOL: Self = Self(0b100);
    /// Every representation.
    pub const ALL: Self = Self(0b111);

    /// Build from raw bits.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// Raw bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Union of two sets.
    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether `other` is fully contained.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether unboxed ints are permitted.
    #[inline]
    #[must_use]
    pub const fn allows_int(self) -> bool {
        self.contains(Self::INT)
    }

    /// Whether unboxed bools are permitted.
    #[inline]
    #[must_use]
    pub const fn allows_bool(self) -> bool {
        self.contains(Self::BOOL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains() {
        let t = TagSet::OBJECT.union(TagSet::INT);
        assert!(t.allows_int());
        assert!(!t.allows_bool());
        assert!(t.contains(TagSet::OBJECT));
        assert!(TagSet::ALL.contains(t));
    }

    #[test]
    fn test_from_bits_masks() {
        assert_eq!(TagSet::from_bits(0xFF), TagSet::ALL);
        assert_eq!(TagSet::from_bits(0), TagSet::default());
    }
}
