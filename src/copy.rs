//! dd style block copy driven by scatter-gather lists
//!
//! The input list names the blocks to read, the output list the blocks
//! to write. A planner walks both lists in lockstep and cuts the stream
//! into [`CopySegment`]s which are contiguous on both sides. Segments
//! are handed to a pool of worker threads, each with its own transfer
//! buffer and device handle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{bail, format_err, Error};
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;

use sgu_pt::PageAlignedBuffer;
use sgu_sgl::{diff_between_iters, ScatterGatherList, SgIter};

use crate::block_io::BlockIo;

pub const DEFAULT_BLOCK_SIZE: usize = 512;
pub const DEFAULT_CHUNK_BLOCKS: u32 = 128;
pub const DEFAULT_THREADS: usize = 4;
pub const MAX_THREADS: usize = 64;

/// Environment variable with the default number of worker threads
pub const THREADS_ENV: &str = "SGL_THREADS";

/// Worker thread count from `SGL_THREADS`, if set and valid
pub fn threads_from_env() -> Option<usize> {
    let value = std::env::var(THREADS_ENV).ok()?;
    match value.trim().parse::<usize>() {
        Ok(threads) if (1..=MAX_THREADS).contains(&threads) => Some(threads),
        _ => {
            log::warn!("ignoring invalid {}={:?}", THREADS_ENV, value);
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct CopyOptions {
    block_size: usize,
    chunk_blocks: u32,
    threads: usize,
    count: Option<u64>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            chunk_blocks: DEFAULT_CHUNK_BLOCKS,
            threads: threads_from_env().unwrap_or(DEFAULT_THREADS),
            count: None,
        }
    }
}

impl CopyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Maximum number of blocks per transfer
    pub fn chunk_blocks(mut self, chunk_blocks: u32) -> Self {
        self.chunk_blocks = chunk_blocks;
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Limit the number of blocks to copy
    pub fn count(mut self, count: Option<u64>) -> Self {
        self.count = count;
        self
    }

    fn check(&self) -> Result<(), Error> {
        if self.block_size == 0 {
            bail!("block size must be greater than zero");
        }
        if self.chunk_blocks == 0 {
            bail!("chunk size must be greater than zero");
        }
        if self.threads == 0 || self.threads > MAX_THREADS {
            bail!("thread count must be between 1 and {}", MAX_THREADS);
        }
        if (self.block_size as u64).saturating_mul(self.chunk_blocks as u64) > i32::MAX as u64 {
            bail!("transfer size too large (block size times chunk size)");
        }
        Ok(())
    }
}

/// One transfer, contiguous on the input and on the output side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopySegment {
    pub in_lba: u64,
    pub out_lba: u64,
    pub blocks: u32,
}

/// Cuts the block stream described by two lists into [`CopySegment`]s
pub struct CopyPlanner<'a> {
    in_iter: SgIter<'a>,
    out_iter: SgIter<'a>,
    remaining: u64,
    chunk_blocks: u32,
}

impl<'a> CopyPlanner<'a> {
    pub fn new(
        input: &'a ScatterGatherList,
        output: &'a ScatterGatherList,
        count: u64,
        chunk_blocks: u32,
    ) -> Self {
        Self {
            in_iter: SgIter::new(input),
            out_iter: SgIter::new(output),
            remaining: count,
            chunk_blocks,
        }
    }

    /// Blocks not yet planned
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Next segment, `None` once the count is reached or a list ends
    pub fn next_segment(&mut self) -> Result<Option<CopySegment>, Error> {
        if self.remaining == 0 {
            return Ok(None);
        }

        let max_n = self
            .chunk_blocks
            .min(u32::try_from(self.remaining).unwrap_or(u32::MAX));

        let in_n = self.in_iter.linear_for_n_blks(max_n);
        let out_n = self.out_iter.linear_for_n_blks(max_n);
        if in_n == 0 || out_n == 0 {
            return Ok(None);
        }
        let blocks = in_n.min(out_n);

        let (in_lba, out_lba) = match (self.in_iter.current_lba(), self.out_iter.current_lba()) {
            (Some(in_lba), Some(out_lba)) => (in_lba, out_lba),
            _ => bail!("copy planner lost its position"),
        };

        self.in_iter.add_blks(blocks as u64);
        self.out_iter.add_blks(blocks as u64);
        self.remaining -= blocks as u64;

        // both sides move by at most their linear run, so neither is clamped
        debug_assert_eq!(
            diff_between_iters(&self.in_iter, &self.out_iter),
            0,
            "{} / {}",
            self.in_iter.dbg_print("in"),
            self.out_iter.dbg_print("out"),
        );

        Ok(Some(CopySegment {
            in_lba,
            out_lba,
            blocks,
        }))
    }
}

impl<'a> Iterator for CopyPlanner<'a> {
    type Item = Result<CopySegment, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_segment().transpose()
    }
}

/// Number of blocks a list can address on a device of the given size
///
/// `None` means unlimited (open-ended list on a device of unknown size).
pub fn list_capacity(sgl: &ScatterGatherList, dev_blocks: Option<u64>) -> Option<u64> {
    if !sgl.is_open_ended() {
        return Some(sgl.sum());
    }
    let last_lba = sgl.elems().last()?.lba;
    dev_blocks.map(|dev_blocks| sgl.sum().saturating_add(dev_blocks.saturating_sub(last_lba)))
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CopyStats {
    /// Segments transferred
    pub segments: u64,
    /// Blocks copied
    pub blocks: u64,
    /// Bytes copied
    pub bytes: u64,
    /// Segments cut short by the end of the input
    pub short_reads: u64,
}

struct SegmentDone {
    segment: CopySegment,
    blocks: u32,
}

fn copy_segment(
    src: &mut dyn BlockIo,
    dst: &mut dyn BlockIo,
    segment: &CopySegment,
    buffer: &mut [u8],
) -> Result<SegmentDone, Error> {
    let blocks = src.read_blocks(segment.in_lba, segment.blocks, buffer)?;
    if blocks > 0 {
        dst.write_blocks(segment.out_lba, blocks, buffer)?;
    }
    Ok(SegmentDone {
        segment: *segment,
        blocks,
    })
}

struct WorkerState<'a> {
    abort: &'a AtomicBool,
    // sequence number of the first segment cut short by the end of the input
    eof_at: &'a AtomicU64,
}

fn copy_worker(
    id: usize,
    src: &mut dyn BlockIo,
    dst: &mut dyn BlockIo,
    chunk_blocks: u32,
    jobs: Receiver<(u64, CopySegment)>,
    results: Sender<Result<SegmentDone, Error>>,
    state: WorkerState,
) {
    let mut buffer = match PageAlignedBuffer::new(chunk_blocks as usize * src.block_size()) {
        Ok(buffer) => buffer,
        Err(err) => {
            state.abort.store(true, Ordering::SeqCst);
            let _ = results.send(Err(err));
            return;
        }
    };

    for (seq, segment) in jobs.iter() {
        if state.abort.load(Ordering::SeqCst) {
            break;
        }
        if seq > state.eof_at.load(Ordering::SeqCst) {
            continue;
        }

        let result = copy_segment(src, dst, &segment, &mut buffer);
        match &result {
            Err(_) => state.abort.store(true, Ordering::SeqCst),
            Ok(done) if done.blocks < segment.blocks => {
                state.eof_at.fetch_min(seq, Ordering::SeqCst);
            }
            Ok(_) => {}
        }

        if results.send(result).is_err() {
            break;
        }
    }

    log::debug!("copy worker {} finished", id);
}

/// Copy the blocks addressed by `in_sgl` on `input` to the blocks
/// addressed by `out_sgl` on `output`
pub fn copy_blocks(
    input: &mut dyn BlockIo,
    output: &mut dyn BlockIo,
    in_sgl: &ScatterGatherList,
    out_sgl: &ScatterGatherList,
    options: &CopyOptions,
) -> Result<CopyStats, Error> {
    options.check()?;

    if input.block_size() != options.block_size || output.block_size() != options.block_size {
        bail!(
            "block size mismatch (input {}, output {}, requested {})",
            input.block_size(),
            output.block_size(),
            options.block_size
        );
    }

    let mut threads = options.threads;
    for (name, dev, sgl) in [("input", &*input, in_sgl), ("output", &*output, out_sgl)] {
        if !dev.is_stream() {
            continue;
        }
        if !sgl.is_pipe_suitable() {
            bail!(
                "{} list is {}, which a stream cannot follow",
                name,
                sgl.linearity_as_str()
            );
        }
        // only the input side can skip leading blocks (by discarding them)
        if name == "output" && sgl.get_low_lba_from_linear() != 0 {
            bail!(
                "output list starts at LBA {}, but a stream starts at 0",
                sgl.get_low_lba_from_linear()
            );
        }
        if threads > 1 {
            log::info!("{} is a stream, using a single worker", name);
            threads = 1;
        }
    }

    let in_cap = list_capacity(in_sgl, input.num_blocks());
    let out_cap = list_capacity(out_sgl, output.num_blocks());
    if let (Some(in_cap), Some(out_cap)) = (in_cap, out_cap) {
        if in_cap != out_cap && options.count.is_none() {
            log::warn!(
                "input addresses {} blocks, output {} blocks, copying the smaller amount",
                in_cap,
                out_cap
            );
        }
    }

    let count = [options.count, in_cap, out_cap]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(u64::MAX);

    log::debug!(
        "copy {} blocks of {} bytes using {} worker(s)",
        count,
        options.block_size,
        threads
    );

    let mut handles = Vec::new();
    for _ in 1..threads {
        handles.push((input.try_clone()?, output.try_clone()?));
    }

    let (job_tx, job_rx) = crossbeam_channel::bounded::<(u64, CopySegment)>(threads * 2);
    let (result_tx, result_rx) = crossbeam_channel::unbounded::<Result<SegmentDone, Error>>();
    let abort = AtomicBool::new(false);
    let eof_at = AtomicU64::new(u64::MAX);

    let chunk_blocks = options.chunk_blocks;

    let mut stats = CopyStats::default();

    std::thread::scope(|scope| -> Result<(), Error> {
        let mut workers = Vec::with_capacity(threads);

        let (src, dst) = (&mut *input, &mut *output);
        let (jobs, results) = (job_rx.clone(), result_tx.clone());
        let state = WorkerState {
            abort: &abort,
            eof_at: &eof_at,
        };
        workers.push(
            scope.spawn(move || copy_worker(0, src, dst, chunk_blocks, jobs, results, state)),
        );

        for (id, (mut src, mut dst)) in handles.into_iter().enumerate() {
            let (jobs, results) = (job_rx.clone(), result_tx.clone());
            let state = WorkerState {
                abort: &abort,
                eof_at: &eof_at,
            };
            workers.push(scope.spawn(move || {
                copy_worker(
                    id + 1,
                    src.as_mut(),
                    dst.as_mut(),
                    chunk_blocks,
                    jobs,
                    results,
                    state,
                )
            }));
        }
        drop(job_rx);
        drop(result_tx);

        let mut planner = CopyPlanner::new(in_sgl, out_sgl, count, chunk_blocks);
        let mut plan_result = Ok(());
        for seq in 0u64.. {
            if abort.load(Ordering::SeqCst) || eof_at.load(Ordering::SeqCst) != u64::MAX {
                break;
            }
            match planner.next_segment() {
                Ok(Some(segment)) => {
                    if job_tx.send((seq, segment)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    abort.store(true, Ordering::SeqCst);
                    plan_result = Err(err);
                    break;
                }
            }
        }
        drop(job_tx);

        let mut copy_result = Ok(());
        for result in result_rx.iter() {
            match result {
                Ok(done) => {
                    stats.segments += 1;
                    stats.blocks += done.blocks as u64;
                    stats.bytes += done.blocks as u64 * options.block_size as u64;
                    if done.blocks < done.segment.blocks {
                        log::debug!(
                            "short read at input LBA {} ({} of {} blocks)",
                            done.segment.in_lba,
                            done.blocks,
                            done.segment.blocks
                        );
                        stats.short_reads += 1;
                    }
                }
                Err(err) => {
                    if copy_result.is_ok() {
                        copy_result = Err(err);
                    }
                }
            }
        }

        for worker in workers {
            worker
                .join()
                .map_err(|_| format_err!("copy worker panicked"))?;
        }

        plan_result?;
        copy_result
    })?;

    output.flush()?;

    if options.count.is_some() && stats.blocks < count {
        log::warn!("copied only {} of {} requested blocks", stats.blocks, count);
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(text: &str) -> ScatterGatherList {
        let mut sgl = ScatterGatherList::new();
        sgl.load_from_cli(text).unwrap();
        sgl
    }

    fn plan(input: &str, output: &str, count: u64, chunk: u32) -> Vec<CopySegment> {
        let (input, output) = (list(input), list(output));
        CopyPlanner::new(&input, &output, count, chunk)
            .collect::<Result<Vec<_>, Error>>()
            .unwrap()
    }

    fn seg(in_lba: u64, out_lba: u64, blocks: u32) -> CopySegment {
        CopySegment {
            in_lba,
            out_lba,
            blocks,
        }
    }

    #[test]
    fn test_plan_linear_chunks() {
        assert_eq!(
            plan("0,300", "1000,300", 300, 128),
            vec![seg(0, 1000, 128), seg(128, 1128, 128), seg(256, 1256, 44)]
        );
    }

    #[test]
    fn test_plan_split_at_element_boundaries() {
        assert_eq!(
            plan("0,10,100,10", "50,4,0,16", 20, 128),
            vec![
                seg(0, 50, 4),
                seg(4, 0, 6),
                seg(100, 6, 10),
            ]
        );
    }

    #[test]
    fn test_plan_count_and_open_end() {
        assert_eq!(plan("0,-1", "0,-1", 5, 2), vec![seg(0, 0, 2), seg(2, 2, 2), seg(4, 4, 1)]);
        assert_eq!(plan("0,10", "20,-1", u64::MAX, 64), vec![seg(0, 20, 10)]);
        assert!(plan("0,10", "0,0", 10, 8).is_empty());
    }

    #[test]
    fn test_plan_keeps_sides_in_step() {
        let (input, output) = (list("0,3,50,7,9,1,70,-1"), list("100,5,0,0,200,2,300,-1"));
        let mut planner = CopyPlanner::new(&input, &output, 40, 4);
        let mut planned = 0u64;
        while let Some(segment) = planner.next_segment().unwrap() {
            planned += segment.blocks as u64;
            assert_eq!(planner.in_iter.blk_idx(), planned);
            assert_eq!(diff_between_iters(&planner.in_iter, &planner.out_iter), 0);
        }
        assert_eq!(planned, 40);
        assert_eq!(planner.remaining(), 0);
    }

    #[test]
    fn test_list_capacity() {
        assert_eq!(list_capacity(&list("0,10,20,5"), None), Some(15));
        assert_eq!(list_capacity(&list("0,10,20,-1"), None), None);
        assert_eq!(list_capacity(&list("0,10,20,-1"), Some(100)), Some(90));
        assert_eq!(list_capacity(&list("0,10,200,-1"), Some(100)), Some(10));
    }

    #[test]
    fn test_options_check() {
        assert!(CopyOptions::new().threads(1).check().is_ok());
        assert!(CopyOptions::new().threads(0).check().is_err());
        assert!(CopyOptions::new().threads(1).block_size(0).check().is_err());
        assert!(CopyOptions::new().threads(1).chunk_blocks(0).check().is_err());
        assert!(CopyOptions::new()
            .threads(1)
            .block_size(1 << 20)
            .chunk_blocks(1 << 12)
            .check()
            .is_err());
    }
}
