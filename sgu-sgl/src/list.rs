use std::fmt;
use std::fmt::Write as _;

use serde::Serialize;

use crate::{BlockCount, SgElem, SglError, SG_SGL_MAX_ELEMENTS};

/// Relationship between consecutive elements, strongest first
///
/// The ordering of the variants is the strength order: a list can only
/// ever be weakened (see [`ScatterGatherList::set_weaker_linearity`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Linearity {
    /// Each element starts where the previous one ends (empty and `0,0`
    /// lists are linear)
    Linear,
    /// Ascending with holes
    Monotonic,
    /// Ascending, but the same LBA is addressed by two elements
    MonoOverlap,
    /// At least one element starts before its predecessor
    NonMonotonic,
}

impl Linearity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Linearity::Linear => "linear",
            Linearity::Monotonic => "monotonic",
            Linearity::MonoOverlap => "monotonic, overlapping",
            Linearity::NonMonotonic => "non-monotonic",
        }
    }

    /// Classify `cur` relative to its predecessor `prev`
    pub fn between(prev: &SgElem, cur: &SgElem) -> Self {
        let prev_end = prev.end_lba();
        if cur.lba == prev_end {
            Linearity::Linear
        } else if cur.lba > prev_end {
            Linearity::Monotonic
        } else if cur.lba >= prev.lba {
            Linearity::MonoOverlap
        } else {
            Linearity::NonMonotonic
        }
    }
}

impl fmt::Display for Linearity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered list of block ranges plus the results of the last scan
#[derive(Debug, Clone)]
pub struct ScatterGatherList {
    pub(crate) sgl: Vec<SgElem>,
    linearity: Linearity,
    sum_hard: bool,
    pub(crate) m_errno: i32,
    high_lba_p1: u64,
    lowest_lba: u64,
    sum: u64,
}

impl Default for ScatterGatherList {
    fn default() -> Self {
        Self {
            sgl: Vec::new(),
            linearity: Linearity::Linear,
            sum_hard: false,
            m_errno: 0,
            high_lba_p1: 0,
            lowest_lba: 0,
            sum: 0,
        }
    }
}

/// Scan results, used for the JSON output of the tools
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SglSummary {
    pub num_elems: usize,
    pub sum: u64,
    pub sum_hard: bool,
    pub lowest_lba: u64,
    pub high_lba_p1: u64,
    pub linearity: Linearity,
    pub pipe_suitable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elements: Option<Vec<SgElem>>,
}

impl ScatterGatherList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a list from elements and scan it
    pub fn from_elems(elems: Vec<SgElem>) -> Result<Self, SglError> {
        let mut list = Self::new();
        list.set_elems(elems)?;
        Ok(list)
    }

    /// Drop all elements and scan results
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Replace the elements after validating them, then rescan
    pub(crate) fn set_elems(&mut self, elems: Vec<SgElem>) -> Result<(), SglError> {
        if elems.len() > SG_SGL_MAX_ELEMENTS {
            return Err(SglError::TooManyElements);
        }
        let last = elems.len().saturating_sub(1);
        for (index, elem) in elems.iter().enumerate() {
            if elem.is_bad() {
                return Err(SglError::BadElement(index));
            }
            if elem.is_unbounded() && index != last {
                return Err(SglError::UnboundedNotLast);
            }
            if elem.lba.checked_add(elem.num_blks()).is_none() {
                return Err(SglError::LbaOverflow {
                    lba: elem.lba,
                    num: elem.num_blks(),
                });
            }
        }
        self.sgl = elems;
        self.sum_scan("", false, false);
        Ok(())
    }

    pub fn elems(&self) -> &[SgElem] {
        &self.sgl
    }

    pub fn num_elems(&self) -> usize {
        self.sgl.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sgl.is_empty()
    }

    pub fn linearity(&self) -> Linearity {
        self.linearity
    }

    pub fn linearity_as_str(&self) -> &'static str {
        self.linearity.as_str()
    }

    /// True if the last element has a real (positive) block count
    pub fn sum_hard(&self) -> bool {
        self.sum_hard
    }

    /// Total number of (bounded) blocks
    pub fn sum(&self) -> u64 {
        self.sum
    }

    /// Highest LBA plus one
    pub fn high_lba_p1(&self) -> u64 {
        self.high_lba_p1
    }

    pub fn lowest_lba(&self) -> u64 {
        self.lowest_lba
    }

    /// OS error number of the last failed load, 0 if none
    pub fn os_errno(&self) -> i32 {
        self.m_errno
    }

    /// The last element reaches until the end of the input
    pub fn is_open_ended(&self) -> bool {
        self.sgl.last().map(SgElem::is_unbounded).unwrap_or(false)
    }

    /// Only ever weakens the stored classification
    pub fn set_weaker_linearity(&mut self, lin: Linearity) {
        if lin > self.linearity {
            self.linearity = lin;
        }
    }

    /// Recompute sum, bounds and linearity
    ///
    /// `id_str` prefixes the debug output, which is logged if `show_sgl`
    /// (elements) or `verbose` (meta data) is set.
    pub fn sum_scan(&mut self, id_str: &str, show_sgl: bool, verbose: bool) {
        let mut sum = 0u64;
        let mut high_lba_p1 = 0u64;
        let mut lowest_lba = 0u64;
        let mut prev: Option<&SgElem> = None;

        self.linearity = Linearity::Linear;

        let mut linearity = Linearity::Linear;
        for (index, elem) in self.sgl.iter().enumerate() {
            if index == 0 || elem.lba < lowest_lba {
                lowest_lba = elem.lba;
            }
            sum += elem.num_blks();
            high_lba_p1 = high_lba_p1.max(elem.end_lba());
            if let Some(prev) = prev {
                linearity = linearity.max(Linearity::between(prev, elem));
            }
            prev = Some(elem);
        }

        self.sum_hard = matches!(
            self.sgl.last(),
            Some(SgElem { count: BlockCount::Bounded(num), .. }) if *num > 0
        );
        self.sum = sum;
        self.high_lba_p1 = high_lba_p1;
        self.lowest_lba = lowest_lba;
        self.set_weaker_linearity(linearity);

        if show_sgl || verbose {
            log::info!("{}", self.dbg_print(!verbose, id_str, show_sgl).trim_end());
        }
    }

    /// Suitable for a sequential stream (no seeking required)
    pub fn is_pipe_suitable(&self) -> bool {
        self.linearity == Linearity::Linear || self.sgl.len() == 1
    }

    /// Find the element with the lowest LBA
    ///
    /// Returns `(index, lba)`. With `ignore_degen` zero length elements
    /// are skipped, `always_last` prefers the last of several elements
    /// sharing the lowest LBA (otherwise the first one wins).
    pub fn get_lowest_lba(&self, ignore_degen: bool, always_last: bool) -> Option<(usize, u64)> {
        let mut lowest: Option<(usize, u64)> = None;

        for (index, elem) in self.sgl.iter().enumerate() {
            if ignore_degen && elem.is_degenerate() {
                continue;
            }
            lowest = match lowest {
                Some((_, lba)) if elem.lba < lba || (always_last && elem.lba == lba) => {
                    Some((index, elem.lba))
                }
                Some(found) => Some(found),
                None => Some((index, elem.lba)),
            };
        }

        lowest
    }

    /// Lowest LBA of a linear list (the LBA of the first element)
    ///
    /// Must only be called if [`Self::linearity`] is `Linear`.
    pub fn get_low_lba_from_linear(&self) -> u64 {
        debug_assert_eq!(self.linearity, Linearity::Linear);
        self.sgl.first().map(|elem| elem.lba).unwrap_or(0)
    }

    /// Append `extra_blks` blocks starting at `start_lba` (default: high_lba_p1)
    ///
    /// An open-ended last element starting at `start_lba` gets its count
    /// filled in, a range continuing the last element is merged into it,
    /// and counts which do not fit into one element are split. Returns
    /// the new number of elements.
    pub fn append_1or(
        &mut self,
        extra_blks: u64,
        start_lba: Option<u64>,
    ) -> Result<usize, SglError> {
        let mut start = match start_lba {
            Some(lba) => lba,
            None if extra_blks == 0 => return Ok(self.sgl.len()),
            None => self.high_lba_p1,
        };
        let mut remaining = extra_blks;

        if start.checked_add(extra_blks).is_none() {
            return Err(SglError::LbaOverflow {
                lba: start,
                num: extra_blks,
            });
        }

        let mut absorb_last = 0u64;
        if let Some(last) = self.sgl.last() {
            match last.count {
                BlockCount::Unbounded if last.lba != start => {
                    return Err(SglError::UnboundedNotLast)
                }
                BlockCount::Unbounded => absorb_last = u32::MAX as u64,
                BlockCount::Bounded(num) if last.end_lba() == start => {
                    absorb_last = (u32::MAX - num) as u64;
                }
                BlockCount::Bounded(_) => (),
            }
        }
        let continues_last = self
            .sgl
            .last()
            .map(|elem| elem.end_lba() == start)
            .unwrap_or(false);

        let absorbed = remaining.min(absorb_last);
        let pushed = match remaining - absorbed {
            0 if absorb_last > 0 || continues_last => 0,
            0 => 1, // keeps a zero length range at a new position
            rest => {
                let max = u32::MAX as u64;
                (rest / max + u64::from(rest % max != 0)) as usize
            }
        };
        if self.sgl.len().saturating_add(pushed) > SG_SGL_MAX_ELEMENTS {
            return Err(SglError::TooManyElements);
        }

        if absorb_last > 0 {
            if let Some(last) = self.sgl.last_mut() {
                let num = match last.count {
                    BlockCount::Bounded(num) => num as u64 + absorbed,
                    BlockCount::Unbounded => absorbed,
                };
                last.count = BlockCount::Bounded(num as u32);
                self.high_lba_p1 = self.high_lba_p1.max(last.end_lba());
            }
            self.sum += absorbed;
            remaining -= absorbed;
            start += absorbed;
        }

        for _ in 0..pushed {
            let num = remaining.min(u32::MAX as u64) as u32;
            let elem = SgElem::new(start, num);

            match self.sgl.last() {
                Some(prev) => {
                    let lin = Linearity::between(prev, &elem);
                    self.set_weaker_linearity(lin);
                    self.lowest_lba = self.lowest_lba.min(start);
                }
                None => self.lowest_lba = start,
            }
            self.sgl.push(elem);

            self.sum += num as u64;
            self.high_lba_p1 = self.high_lba_p1.max(elem.end_lba());
            remaining -= num as u64;
            start += num as u64;
        }

        self.sum_hard = matches!(
            self.sgl.last(),
            Some(SgElem { count: BlockCount::Bounded(num), .. }) if *num > 0
        );

        Ok(self.sgl.len())
    }

    /// Summary of the scan results, optionally including the elements
    pub fn summary(&self, with_elements: bool) -> SglSummary {
        SglSummary {
            num_elems: self.sgl.len(),
            sum: self.sum,
            sum_hard: self.sum_hard,
            lowest_lba: self.lowest_lba,
            high_lba_p1: self.high_lba_p1,
            linearity: self.linearity,
            pipe_suitable: self.is_pipe_suitable(),
            elements: with_elements.then(|| self.sgl.clone()),
        }
    }

    /// Render meta data (unless `skip_meta`) and elements (if `show_sgl`)
    pub fn dbg_print(&self, skip_meta: bool, id_str: &str, show_sgl: bool) -> String {
        let mut out = String::new();
        let prefix = if id_str.is_empty() { "sgl" } else { id_str };

        if !skip_meta {
            let _ = writeln!(
                out,
                "{}: elements={}, sum={}, sum_hard={}, lowest_lba={}, high_lba_p1={}, linearity={}",
                prefix,
                self.sgl.len(),
                self.sum,
                self.sum_hard,
                self.lowest_lba,
                self.high_lba_p1,
                self.linearity,
            );
        }

        if show_sgl {
            for (index, elem) in self.sgl.iter().enumerate() {
                let _ = writeln!(out, "  {}[{}]: lba={:#x}, num={}", prefix, index, elem.lba, elem.count);
            }
        }

        out
    }
}

/// Canonical text form, parsable by `load_from_cli`
impl fmt::Display for ScatterGatherList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, elem) in self.sgl.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", elem)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(pairs: &[(u64, u32)]) -> ScatterGatherList {
        let elems = pairs.iter().map(|(lba, num)| SgElem::new(*lba, *num)).collect();
        ScatterGatherList::from_elems(elems).unwrap()
    }

    #[test]
    fn test_linearity_classes() {
        assert_eq!(list(&[]).linearity(), Linearity::Linear);
        assert_eq!(list(&[(0, 0)]).linearity(), Linearity::Linear);
        assert_eq!(list(&[(0, 10), (10, 5)]).linearity(), Linearity::Linear);
        assert_eq!(list(&[(0, 10), (20, 5)]).linearity(), Linearity::Monotonic);
        assert_eq!(list(&[(0, 10), (5, 10)]).linearity(), Linearity::MonoOverlap);
        assert_eq!(list(&[(10, 5), (0, 5)]).linearity(), Linearity::NonMonotonic);
    }

    #[test]
    fn test_weakening_is_sticky() {
        // overlap first, then a perfectly linear step
        let sgl = list(&[(0, 10), (5, 10), (15, 5)]);
        assert_eq!(sgl.linearity(), Linearity::MonoOverlap);

        // backward jump early, later gaps do not strengthen it again
        let sgl = list(&[(10, 5), (0, 5), (100, 1), (101, 1)]);
        assert_eq!(sgl.linearity(), Linearity::NonMonotonic);

        let mut sgl = list(&[(0, 1)]);
        sgl.set_weaker_linearity(Linearity::Monotonic);
        sgl.set_weaker_linearity(Linearity::Linear);
        assert_eq!(sgl.linearity(), Linearity::Monotonic);
    }

    #[test]
    fn test_sum_scan() {
        let mut sgl = list(&[(100, 4), (8, 2), (50, 0)]);
        assert_eq!(sgl.sum(), 6);
        assert_eq!(sgl.lowest_lba(), 8);
        assert_eq!(sgl.high_lba_p1(), 104);
        assert!(!sgl.sum_hard());

        let before = sgl.summary(true);
        sgl.sum_scan("test", true, true);
        let after = sgl.summary(true);
        assert_eq!(before.sum, after.sum);
        assert_eq!(before.linearity, after.linearity);
        assert_eq!(before.high_lba_p1, after.high_lba_p1);
        assert_eq!(before.lowest_lba, after.lowest_lba);
    }

    #[test]
    fn test_lowest_lba_tie_break() {
        let sgl = list(&[(7, 0), (9, 1), (7, 2), (7, 3)]);

        assert_eq!(sgl.get_lowest_lba(false, false), Some((0, 7)));
        assert_eq!(sgl.get_lowest_lba(false, true), Some((3, 7)));
        assert_eq!(sgl.get_lowest_lba(true, false), Some((2, 7)));
        assert_eq!(sgl.get_lowest_lba(true, true), Some((3, 7)));

        assert_eq!(list(&[(3, 0)]).get_lowest_lba(true, false), None);
        assert_eq!(list(&[]).get_lowest_lba(false, false), None);
    }

    #[test]
    fn test_append_coalesce_and_split() -> Result<(), SglError> {
        let mut sgl = list(&[(0, 20)]);
        assert_eq!(sgl.append_1or(5, None)?, 1);
        assert_eq!(sgl.elems(), &[SgElem::new(0, 25)]);
        assert_eq!(sgl.high_lba_p1(), 25);
        assert_eq!(sgl.sum(), 25);

        assert_eq!(sgl.append_1or(3, Some(40))?, 2);
        assert_eq!(sgl.linearity(), Linearity::Monotonic);
        assert_eq!(sgl.high_lba_p1(), 43);

        assert_eq!(sgl.append_1or(0, None)?, 2);

        let mut sgl = ScatterGatherList::new();
        let big = u32::MAX as u64 + 10;
        assert_eq!(sgl.append_1or(big, Some(0))?, 2);
        assert_eq!(sgl.elems()[1], SgElem::new(u32::MAX as u64, 10));
        assert_eq!(sgl.sum(), big);
        assert_eq!(sgl.linearity(), Linearity::Linear);

        Ok(())
    }

    #[test]
    fn test_append_fills_open_end() -> Result<(), SglError> {
        let mut sgl = ScatterGatherList::from_elems(vec![SgElem::new(0, 4), SgElem::open_ended(10)])?;
        assert!(!sgl.sum_hard());

        assert!(matches!(
            sgl.append_1or(2, Some(11)),
            Err(SglError::UnboundedNotLast)
        ));

        assert_eq!(sgl.append_1or(6, Some(10))?, 2);
        assert_eq!(sgl.elems()[1], SgElem::new(10, 6));
        assert!(sgl.sum_hard());
        assert_eq!(sgl.sum(), 10);
        assert_eq!(sgl.high_lba_p1(), 16);

        Ok(())
    }

    #[test]
    fn test_append_matches_rescan() -> Result<(), SglError> {
        let mut sgl = ScatterGatherList::new();
        sgl.append_1or(4, Some(30))?;
        sgl.append_1or(4, Some(2))?;
        sgl.append_1or(4, None)?;
        sgl.append_1or(1, Some(33))?;

        let incremental = sgl.summary(false);
        sgl.sum_scan("", false, false);
        let rescanned = sgl.summary(false);

        assert_eq!(incremental.sum, rescanned.sum);
        assert_eq!(incremental.lowest_lba, rescanned.lowest_lba);
        assert_eq!(incremental.high_lba_p1, rescanned.high_lba_p1);
        assert_eq!(incremental.linearity, rescanned.linearity);
        assert_eq!(incremental.sum_hard, rescanned.sum_hard);

        Ok(())
    }

    #[test]
    fn test_pipe_suitable() {
        assert!(list(&[]).is_pipe_suitable());
        assert!(list(&[(0, 0)]).is_pipe_suitable());
        assert!(list(&[(100, 8)]).is_pipe_suitable());
        assert!(list(&[(0, 8), (8, 8)]).is_pipe_suitable());
        assert!(!list(&[(0, 8), (16, 8)]).is_pipe_suitable());
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            ScatterGatherList::from_elems(vec![SgElem::open_ended(0), SgElem::new(5, 1)]),
            Err(SglError::UnboundedNotLast)
        ));
        assert!(matches!(
            ScatterGatherList::from_elems(vec![SgElem::bad()]),
            Err(SglError::BadElement(0))
        ));
        assert!(matches!(
            ScatterGatherList::from_elems(vec![SgElem::new(u64::MAX - 1, 2)]),
            Err(SglError::LbaOverflow { .. })
        ));
    }
}
