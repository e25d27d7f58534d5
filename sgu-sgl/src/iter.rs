use std::fmt::Write as _;

use crate::{BlockCount, Linearity, ScatterGatherList, SgElem};

/// Cursor over the blocks of a [`ScatterGatherList`]
///
/// The position is kept both as `(elem_index, blk_offset)` and as the
/// flattened block index. Zero length elements are skipped, so while
/// not at the end the position always names a real block. Positions
/// past [`ScatterGatherList::sum`] are only reachable if the last
/// element is open-ended (`extend_last`), which then ends just before
/// LBA `u64::MAX`.
#[derive(Debug, Clone)]
pub struct SgIter<'a> {
    sgl: &'a ScatterGatherList,
    elem_idx: usize,
    blk_off: u64,
    blk_idx: u64,
    extend_last: bool,
}

// number of blocks an element spans, open-ended ones stop below u64::MAX
fn elem_span(elem: &SgElem) -> u64 {
    match elem.count {
        BlockCount::Bounded(num) => num as u64,
        BlockCount::Unbounded => u64::MAX - elem.lba,
    }
}

impl<'a> SgIter<'a> {
    pub fn new(sgl: &'a ScatterGatherList) -> Self {
        let mut iter = Self {
            sgl,
            elem_idx: 0,
            blk_off: 0,
            blk_idx: 0,
            extend_last: sgl.is_open_ended(),
        };
        iter.normalize();
        iter
    }

    pub fn sgl(&self) -> &'a ScatterGatherList {
        self.sgl
    }

    /// Index of the current element (`num_elems()` at the end)
    pub fn elem_index(&self) -> usize {
        self.elem_idx
    }

    /// Block offset inside the current element
    pub fn blk_offset(&self) -> u64 {
        self.blk_off
    }

    /// Flattened block index
    pub fn blk_idx(&self) -> u64 {
        self.blk_idx
    }

    pub fn extend_last(&self) -> bool {
        self.extend_last
    }

    // flattened block index of the end position
    fn end_idx(&self) -> u64 {
        let sum = self.sgl.sum();
        match self.sgl.elems().last() {
            Some(last) if self.extend_last => sum.saturating_add(elem_span(last)),
            _ => sum,
        }
    }

    // move forward over exhausted and zero length elements
    fn normalize(&mut self) {
        let elems = self.sgl.elems();
        while let Some(elem) = elems.get(self.elem_idx) {
            match elem.count {
                BlockCount::Unbounded => break,
                BlockCount::Bounded(num) => {
                    let num = num as u64;
                    if self.blk_off < num {
                        break;
                    }
                    self.blk_off -= num;
                    self.elem_idx += 1;
                }
            }
        }
    }

    fn set_to_end(&mut self) {
        self.elem_idx = self.sgl.num_elems();
        self.blk_off = 0;
        self.blk_idx = self.end_idx();
    }

    pub fn current_elem(&self) -> Option<SgElem> {
        if self.at_end() {
            return None;
        }
        self.sgl.elems().get(self.elem_idx).copied()
    }

    /// LBA of the current block, `None` at the end
    pub fn current_lba(&self) -> Option<u64> {
        self.current_elem()
            .and_then(|elem| elem.lba.checked_add(self.blk_off))
    }

    /// Current LBA plus the number of blocks left in the current element
    pub fn current_lba_rem_num(&self) -> Option<(u64, BlockCount)> {
        let elem = self.current_elem()?;
        let rem = match elem.count {
            BlockCount::Bounded(num) => BlockCount::Bounded(num - self.blk_off as u32),
            BlockCount::Unbounded => BlockCount::Unbounded,
        };
        Some((elem.lba.checked_add(self.blk_off)?, rem))
    }

    /// True once all blocks have been passed
    ///
    /// Open-ended lists end when the last element reaches LBA `u64::MAX`.
    pub fn at_end(&self) -> bool {
        self.blk_idx >= self.end_idx()
    }

    pub fn is_sgl_linear(&self) -> bool {
        self.sgl.linearity() == Linearity::Linear
    }

    /// Number of blocks (up to `max_n`) that can be transferred at once
    /// from the current position without leaving the current element
    pub fn linear_for_n_blks(&self, max_n: u32) -> u32 {
        if max_n == 0 {
            return 0;
        }
        match self.current_lba_rem_num() {
            Some((_, BlockCount::Bounded(rem))) => rem.min(max_n),
            Some((lba, BlockCount::Unbounded)) => {
                u32::try_from(u64::MAX - lba).map_or(max_n, |rem| rem.min(max_n))
            }
            None => 0,
        }
    }

    /// Position at the flattened block index `blk_idx`
    ///
    /// Returns false (and does not move) if `blk_idx` is past the end.
    pub fn set_by_blk_idx(&mut self, blk_idx: u64) -> bool {
        let end_idx = self.end_idx();
        if blk_idx > end_idx {
            return false;
        }
        if blk_idx == end_idx {
            self.set_to_end();
            return true;
        }
        self.elem_idx = 0;
        self.blk_off = blk_idx;
        self.blk_idx = blk_idx;
        self.normalize();
        true
    }

    /// Move forward `blk_count` blocks, stopping at the end
    ///
    /// Returns true if the end was reached.
    pub fn add_blks(&mut self, blk_count: u64) -> bool {
        let target = self.blk_idx.saturating_add(blk_count);

        if target >= self.end_idx() {
            self.set_to_end();
            return true;
        }

        self.blk_off = self.blk_off.saturating_add(blk_count);
        self.blk_idx = target;
        self.normalize();
        false
    }

    /// Move backward `blk_count` blocks, stopping at the start
    ///
    /// Returns true if the start was reached.
    pub fn sub_blks(&mut self, blk_count: u64) -> bool {
        if blk_count >= self.blk_idx {
            self.elem_idx = 0;
            self.blk_off = 0;
            self.blk_idx = 0;
            self.normalize();
            return true;
        }

        let elems = self.sgl.elems();
        let mut back = blk_count;
        while back > self.blk_off {
            back -= self.blk_off;
            self.elem_idx -= 1;
            self.blk_off = elem_span(&elems[self.elem_idx]);
        }
        self.blk_off -= back;
        self.blk_idx -= blk_count;
        self.normalize();
        false
    }

    pub fn dbg_print(&self, id_str: &str) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            "{}: elem_idx={}, blk_off={}, blk_idx={}, extend_last={}",
            if id_str.is_empty() { "iter" } else { id_str },
            self.elem_idx,
            self.blk_off,
            self.blk_idx,
            self.extend_last,
        );
        if let Some(lba) = self.current_lba() {
            let _ = write!(out, ", lba={:#x}", lba);
        } else {
            out.push_str(", at end");
        }
        out
    }
}

/// Signed distance (in blocks) between the positions of two iterators
pub fn diff_between_iters(left: &SgIter, right: &SgIter) -> i64 {
    left.blk_idx.wrapping_sub(right.blk_idx) as i64
}
