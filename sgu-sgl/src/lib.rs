//! Scatter-gather lists
//!
//! A scatter-gather list describes a (possibly non-contiguous) block
//! transfer as an ordered sequence of `(lba, num)` ranges. The copy
//! tools build one list for the input side and one for the output
//! side, classify them with [`ScatterGatherList::sum_scan`], and walk
//! them with an [`SgIter`] to carve the logical stream into physically
//! contiguous transfers.
//!
//! Text form (command line or file):
//!
//! ```text
//! LBA0,NUM0,LBA1,NUM1 ...
//! ```
//!
//! Fields are separated by commas or whitespace, numbers are decimal
//! unless written as `0x..` or `..h`. A count of `-1` in the last pair
//! means "until the end of the input".

mod elem;
pub use elem::*;

mod list;
pub use list::*;

mod load;

mod iter;
pub use iter::*;

mod compare;
pub use compare::*;

/// Maximum number of elements in one list
pub const SG_SGL_MAX_ELEMENTS: usize = 16384;

#[derive(thiserror::Error, Debug)]
pub enum SglError {
    #[error("bad number '{token}' at field {index} - {reason}")]
    BadNumber {
        index: usize,
        token: String,
        reason: String,
    },
    #[error("{0}")]
    Syntax(String),
    #[error("expected LBA,NUM pairs, got an odd number of fields ({0})")]
    OddCount(usize),
    #[error("too many elements (more than {})", SG_SGL_MAX_ELEMENTS)]
    TooManyElements,
    #[error("block count {0} too large for one element")]
    CountTooLarge(u64),
    #[error("LBA {lba} plus {num} blocks overflows")]
    LbaOverflow { lba: u64, num: u64 },
    #[error("open-ended element is only allowed at the end of the list")]
    UnboundedNotLast,
    #[error("element {0} uses the reserved 'bad' value")]
    BadElement(usize),
    #[error("unable to read '{path}' - {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}
