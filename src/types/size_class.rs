//! Size-class bucketing for page free space.
//!
//! Every page's free-byte count is mapped to one of eight exponentially
//! spaced buckets (spec.md §3, §4.2). The boundary table is pinned here as
//! fixed fractions of the page size `P`, per SPEC_FULL.md §11, and does not
//! vary across structure versions currently supported by this crate.

/// Coarse fullness/kind bucket stored in a page's common header and used by
/// the free-space map to pick an allocation target.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    /// 0 <= free < P/128
    Class0 = 0,
    /// P/128 <= free < P/64
    Class1 = 1,
    /// P/64 <= free < P/32
    Class2 = 2,
    /// P/32 <= free < P/16
    Class3 = 3,
    /// P/16 <= free < P/8
    Class4 = 4,
    /// P/8 <= free < P/4
    Class5 = 5,
    /// P/4 <= free < P/2
    Class6 = 6,
    /// free >= P/2
    Class7 = 7,
    /// The page is the head of a multi-page blob chain.
    MultiPage = 8,
    /// Size class does not apply to this page type.
    NotApplicable = 9,
}

impl SizeClass {
    /// Decode a size class from its on-disk byte value.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Class0),
            1 => Some(Self::Class1),
            2 => Some(Self::Class2),
            3 => Some(Self::Class3),
            4 => Some(Self::Class4),
            5 => Some(Self::Class5),
            6 => Some(Self::Class6),
            7 => Some(Self::Class7),
            8 => Some(Self::MultiPage),
            9 => Some(Self::NotApplicable),
            _ => None,
        }
    }

    /// Whether this is one of the eight numbered buckets (`Class0..Class7`).
    pub fn is_bucket(self) -> bool {
        (self as u8) <= 7
    }

    /// The bucket index (0..=7), if this is a numbered bucket.
    pub fn bucket_index(self) -> Option<u8> {
        self.is_bucket().then_some(self as u8)
    }

    /// Compute the size class for a page with `free` bytes free, out of a
    /// total page size `page_size`.
    pub fn for_free_space(free: usize, page_size: usize) -> Self {
        let free = free as u64;
        let page_size = page_size as u64;
        if free >= page_size / 2 {
            Self::Class7
        } else if free >= page_size / 4 {
            Self::Class6
        } else if free >= page_size / 8 {
            Self::Class5
        } else if free >= page_size / 16 {
            Self::Class4
        } else if free >= page_size / 32 {
            Self::Class3
        } else if free >= page_size / 64 {
            Self::Class2
        } else if free >= page_size / 128 {
            Self::Class1
        } else {
            Self::Class0
        }
    }

    /// Whether a page in this class is guaranteed to have at least
    /// `needed` bytes free (used by the FSM to satisfy `find_page`).
    pub fn covers(self, needed: usize, page_size: usize) -> bool {
        match self.bucket_index() {
            Some(idx) => Self::lower_bound(idx, page_size) as usize >= needed,
            None => false,
        }
    }

    fn lower_bound(bucket: u8, page_size: usize) -> u64 {
        let page_size = page_size as u64;
        match bucket {
            0 => 0,
            1 => page_size / 128,
            2 => page_size / 64,
            3 => page_size / 32,
            4 => page_size / 16,
            5 => page_size / 8,
            6 => page_size / 4,
            _ => page_size / 2,
        }
    }
}

/// The four-bit value the free-space map stores per data page (spec.md §3).
///
/// Distinct from [`SizeClass`]: the FSM never stores `NotApplicable`, and
/// collapses every multi-page fragment into `Full` (a multi-page chain's
/// class is carried in the blob reference, not in the FSM).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmClass {
    Class0 = 0,
    Class1 = 1,
    Class2 = 2,
    Class3 = 3,
    Class4 = 4,
    Class5 = 5,
    Class6 = 6,
    Class7 = 7,
    /// Page is allocated and has no meaningfully free space for reuse.
    Full = 8,
    /// Page is not currently part of any live structure.
    NotUsed = 9,
}

impl FsmClass {
    /// Decode a 4-bit FSM entry.
    pub fn from_nibble(n: u8) -> Option<Self> {
        match n & 0x0F {
            0 => Some(Self::Class0),
            1 => Some(Self::Class1),
            2 => Some(Self::Class2),
            3 => Some(Self::Class3),
            4 => Some(Self::Class4),
            5 => Some(Self::Class5),
            6 => Some(Self::Class6),
            7 => Some(Self::Class7),
            8 => Some(Self::Full),
            9 => Some(Self::NotUsed),
            _ => None,
        }
    }

    /// Encode as a 4-bit nibble.
    pub fn as_nibble(self) -> u8 {
        self as u8
    }

    /// Whether this class satisfies a request for at least `min_class`
    /// (higher class number means more free space). `Full` never satisfies
    /// a request — it has no reusable space. `NotUsed` only satisfies a
    /// request that is itself for `NotUsed` (a caller reclaiming a released
    /// page); it never stands in for a numbered bucket, since a page that
    /// has never been formatted carries no free-byte count to compare.
    pub fn satisfies(self, min_class: FsmClass) -> bool {
        match self {
            Self::Full => false,
            Self::NotUsed => min_class == Self::NotUsed,
            _ => (self as u8) >= (min_class as u8),
        }
    }

    /// Convert a page [`SizeClass`] (as computed from its current free
    /// space) into the FSM's four-bit representation.
    pub fn from_size_class(class: SizeClass) -> Self {
        match class {
            SizeClass::Class0 => Self::Class0,
            SizeClass::Class1 => Self::Class1,
            SizeClass::Class2 => Self::Class2,
            SizeClass::Class3 => Self::Class3,
            SizeClass::Class4 => Self::Class4,
            SizeClass::Class5 => Self::Class5,
            SizeClass::Class6 => Self::Class6,
            SizeClass::Class7 => Self::Class7,
            SizeClass::MultiPage => Self::Full,
            SizeClass::NotApplicable => Self::Full,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_span_exponential_ranges() {
        let p = 4096usize;
        assert_eq!(SizeClass::for_free_space(0, p), SizeClass::Class0);
        assert_eq!(SizeClass::for_free_space(31, p), SizeClass::Class0);
        assert_eq!(SizeClass::for_free_space(32, p), SizeClass::Class1);
        assert_eq!(SizeClass::for_free_space(2048, p), SizeClass::Class7);
        assert_eq!(SizeClass::for_free_space(4096, p), SizeClass::Class7);
    }

    #[test]
    fn covers_respects_lower_bound() {
        let p = 4096usize;
        assert!(SizeClass::Class7.covers(2000, p));
        assert!(!SizeClass::Class1.covers(100, p));
    }

    #[test]
    fn fsm_roundtrip() {
        for v in 0u8..=9 {
            let class = FsmClass::from_nibble(v).unwrap();
            assert_eq!(class.as_nibble(), v);
        }
        assert!(FsmClass::from_nibble(10).is_none());
    }

    #[test]
    fn fsm_satisfies_is_monotonic() {
        assert!(FsmClass::Class7.satisfies(FsmClass::Class3));
        assert!(!FsmClass::Class1.satisfies(FsmClass::Class3));
        assert!(!FsmClass::NotUsed.satisfies(FsmClass::Class0));
        assert!(!FsmClass::Full.satisfies(FsmClass::Class0));
    }

    #[test]
    fn not_used_only_satisfies_not_used_requests() {
        assert!(FsmClass::NotUsed.satisfies(FsmClass::NotUsed));
        assert!(!FsmClass::NotUsed.satisfies(FsmClass::Class7));
        assert!(!FsmClass::Full.satisfies(FsmClass::NotUsed));
    }
}
