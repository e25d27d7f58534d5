use crate::{BlockCount, ScatterGatherList, SgElem, SgIter};

/// Position inside a list, normalized to a non-exhausted element
struct Run {
    elem_idx: usize,
    blk_off: u64,
    lba: u64,
    /// blocks left in the element, `None` if open-ended
    rem: Option<u64>,
}

fn next_run(elems: &[SgElem], mut elem_idx: usize, mut blk_off: u64) -> Option<Run> {
    while let Some(elem) = elems.get(elem_idx) {
        let rem = match elem.count {
            BlockCount::Unbounded => None,
            BlockCount::Bounded(num) if blk_off < num as u64 => Some(num as u64 - blk_off),
            BlockCount::Bounded(num) => {
                blk_off -= num as u64;
                elem_idx += 1;
                continue;
            }
        };
        // open-ended runs stop below LBA u64::MAX
        let lba = elem.lba.checked_add(blk_off).filter(|lba| *lba < u64::MAX)?;
        return Some(Run {
            elem_idx,
            blk_off,
            lba,
            rem,
        });
    }
    None
}

/// Compare the LBA sequences of two lists from the given positions
///
/// Both sides are walked block run by block run; they are equal if they
/// address the same LBAs in the same order and end together. With
/// `allow_partial` it is enough that the shorter side is a prefix of the
/// longer one.
pub fn sgls_eq_off(
    left: &ScatterGatherList,
    l_elem_idx: usize,
    l_blk_off: u64,
    right: &ScatterGatherList,
    r_elem_idx: usize,
    r_blk_off: u64,
    allow_partial: bool,
) -> bool {
    let (mut l_idx, mut l_off) = (l_elem_idx, l_blk_off);
    let (mut r_idx, mut r_off) = (r_elem_idx, r_blk_off);

    loop {
        let l_run = next_run(left.elems(), l_idx, l_off);
        let r_run = next_run(right.elems(), r_idx, r_off);

        let (l_run, r_run) = match (l_run, r_run) {
            (None, None) => return true,
            (None, Some(_)) | (Some(_), None) => return allow_partial,
            (Some(l_run), Some(r_run)) => (l_run, r_run),
        };

        if l_run.lba != r_run.lba {
            return false;
        }

        let step = match (l_run.rem, r_run.rem) {
            (None, None) => return true,
            (Some(rem), None) | (None, Some(rem)) => rem,
            (Some(l_rem), Some(r_rem)) => l_rem.min(r_rem),
        };

        l_idx = l_run.elem_idx;
        l_off = l_run.blk_off + step;
        r_idx = r_run.elem_idx;
        r_off = r_run.blk_off + step;
    }
}

/// [`sgls_eq_off`] starting at the current positions of two iterators
pub fn sgls_eq_from_iters(left: &SgIter, right: &SgIter, allow_partial: bool) -> bool {
    sgls_eq_off(
        left.sgl(),
        left.elem_index(),
        left.blk_offset(),
        right.sgl(),
        right.elem_index(),
        right.blk_offset(),
        allow_partial,
    )
}
