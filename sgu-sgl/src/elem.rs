use std::fmt;

use serde::Serialize;

/// Number of blocks addressed by one element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockCount {
    /// A fixed count (0 makes the element degenerate)
    Bounded(u32),
    /// Until the end of the input/device (only valid for the last element)
    Unbounded,
}

impl BlockCount {
    /// Bounded block count, 0 for `Unbounded`
    pub fn blocks(&self) -> u64 {
        match self {
            BlockCount::Bounded(num) => *num as u64,
            BlockCount::Unbounded => 0,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, BlockCount::Unbounded)
    }
}

impl fmt::Display for BlockCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockCount::Bounded(num) => write!(f, "{}", num),
            BlockCount::Unbounded => write!(f, "-1"),
        }
    }
}

/// One contiguous range of blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SgElem {
    /// First block
    pub lba: u64,
    /// Number of blocks, starting with (and including) `lba`
    pub count: BlockCount,
}

impl SgElem {
    pub const fn new(lba: u64, num: u32) -> Self {
        Self {
            lba,
            count: BlockCount::Bounded(num),
        }
    }

    /// Element reaching until the end of the input
    pub const fn open_ended(lba: u64) -> Self {
        Self {
            lba,
            count: BlockCount::Unbounded,
        }
    }

    /// The reserved value marking a structurally invalid element
    pub const fn bad() -> Self {
        Self::new(u64::MAX, u32::MAX)
    }

    pub fn is_bad(&self) -> bool {
        self.lba == u64::MAX && self.count == BlockCount::Bounded(u32::MAX)
    }

    /// Bounded number of blocks (0 for open-ended elements)
    pub fn num_blks(&self) -> u64 {
        self.count.blocks()
    }

    /// Zero length element
    pub fn is_degenerate(&self) -> bool {
        self.count == BlockCount::Bounded(0)
    }

    pub fn is_unbounded(&self) -> bool {
        self.count.is_unbounded()
    }

    /// One past the last (bounded) block
    pub fn end_lba(&self) -> u64 {
        self.lba.saturating_add(self.num_blks())
    }
}

impl fmt::Display for SgElem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.lba, self.count)
    }
}

#[test]
fn test_elem_basics() {
    let elem = SgElem::new(20, 5);
    assert_eq!(elem.end_lba(), 25);
    assert_eq!(elem.to_string(), "20,5");
    assert!(!elem.is_degenerate());
    assert!(!elem.is_bad());

    let elem = SgElem::new(0, 0);
    assert!(elem.is_degenerate());
    assert_eq!(elem.end_lba(), 0);

    let elem = SgElem::open_ended(100);
    assert!(elem.is_unbounded());
    assert_eq!(elem.num_blks(), 0);
    assert_eq!(elem.to_string(), "100,-1");

    assert!(SgElem::bad().is_bad());
    assert!(!SgElem::new(u64::MAX, u32::MAX - 1).is_bad());
}
