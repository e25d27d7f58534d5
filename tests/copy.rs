use std::path::PathBuf;

use anyhow::Error;

use sgl_utils::block_io::{BlockIo, FileBlockIo, StreamBlockIo};
use sgl_utils::copy::{copy_blocks, CopyOptions};
use sgl_utils::ScatterGatherList;

const BS: usize = 512;

struct TestDir(PathBuf);

impl TestDir {
    fn new(name: &str) -> Result<Self, Error> {
        let path = std::env::temp_dir().join(format!("sgl-copy-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&path)?;
        Ok(Self(path))
    }

    fn file(&self, name: &str) -> PathBuf {
        self.0.join(name)
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

// every block is filled with its own block number
fn block_pattern(blocks: u64) -> Vec<u8> {
    (0..blocks)
        .flat_map(|blk| std::iter::repeat(blk as u8).take(BS))
        .collect()
}

fn block_at(data: &[u8], lba: u64) -> &[u8] {
    &data[lba as usize * BS..(lba as usize + 1) * BS]
}

fn parse(text: &str) -> Result<ScatterGatherList, Error> {
    let mut sgl = ScatterGatherList::new();
    sgl.load_from_cli(text)?;
    Ok(sgl)
}

fn run_copy(
    dir: &TestDir,
    blocks: u64,
    skip: &str,
    seek: &str,
    options: CopyOptions,
) -> Result<(Vec<u8>, sgl_utils::copy::CopyStats), Error> {
    let in_path = dir.file("input.img");
    let out_path = dir.file("output.img");
    std::fs::write(&in_path, block_pattern(blocks))?;
    let _ = std::fs::remove_file(&out_path);

    let mut input = FileBlockIo::open_input(&in_path, BS)?;
    let mut output = FileBlockIo::open_output(&out_path, BS)?;

    let stats = copy_blocks(
        &mut input,
        &mut output,
        &parse(skip)?,
        &parse(seek)?,
        &options,
    )?;

    Ok((std::fs::read(&out_path)?, stats))
}

#[test]
fn copy_whole_file() -> Result<(), Error> {
    let dir = TestDir::new("whole")?;
    let options = CopyOptions::new().chunk_blocks(16).threads(4);

    let (data, stats) = run_copy(&dir, 100, "0,-1", "0,-1", options)?;

    assert_eq!(data, block_pattern(100));
    assert_eq!(stats.blocks, 100);
    assert_eq!(stats.bytes, 100 * BS as u64);
    assert_eq!(stats.segments, 7);
    assert_eq!(stats.short_reads, 0);
    Ok(())
}

#[test]
fn copy_scattered_blocks() -> Result<(), Error> {
    let dir = TestDir::new("scatter")?;
    let options = CopyOptions::new().chunk_blocks(4).threads(3);

    // 10 blocks gathered from three places, scattered to two
    let (data, stats) = run_copy(&dir, 64, "40,5,2,3,60,2", "20,4,10,6", options)?;

    assert_eq!(stats.blocks, 10);
    assert_eq!(data.len(), 24 * BS);

    let expected_out = [
        (20, 40),
        (21, 41),
        (22, 42),
        (23, 43),
        (10, 44),
        (11, 2),
        (12, 3),
        (13, 4),
        (14, 60),
        (15, 61),
    ];
    for (out_lba, in_lba) in expected_out {
        assert_eq!(block_at(&data, out_lba), &[in_lba as u8; BS][..], "LBA {}", out_lba);
    }
    // untouched blocks are holes
    assert!(block_at(&data, 0).iter().all(|b| *b == 0));
    Ok(())
}

#[test]
fn copy_respects_count() -> Result<(), Error> {
    let dir = TestDir::new("count")?;
    let options = CopyOptions::new().threads(2).count(Some(5));

    let (data, stats) = run_copy(&dir, 32, "8,-1", "0,-1", options)?;

    assert_eq!(stats.blocks, 5);
    assert_eq!(data.len(), 5 * BS);
    assert_eq!(block_at(&data, 0), &[8u8; BS][..]);
    assert_eq!(block_at(&data, 4), &[12u8; BS][..]);
    Ok(())
}

#[test]
fn copy_stops_at_shorter_list() -> Result<(), Error> {
    let dir = TestDir::new("short")?;
    let options = CopyOptions::new().threads(1);

    let (data, stats) = run_copy(&dir, 32, "0,20", "0,6", options)?;

    assert_eq!(stats.blocks, 6);
    assert_eq!(data, block_pattern(6));
    Ok(())
}

#[test]
fn stream_requires_pipe_suitable_list() -> Result<(), Error> {
    let dir = TestDir::new("stream")?;
    let out_path = dir.file("output.img");

    let mut input = StreamBlockIo::reader(std::io::Cursor::new(block_pattern(16)), BS);
    let mut output = FileBlockIo::open_output(&out_path, BS)?;
    let options = CopyOptions::new().threads(4);

    let res = copy_blocks(
        &mut input,
        &mut output,
        &parse("0,4,8,4")?,
        &parse("0,-1")?,
        &options,
    );
    assert!(res.is_err());

    let stats = copy_blocks(
        &mut input,
        &mut output,
        &parse("4,-1")?,
        &parse("0,-1")?,
        &options,
    )?;
    assert_eq!(stats.blocks, 12);
    assert_eq!(stats.short_reads, 1);

    let data = std::fs::read(&out_path)?;
    assert_eq!(block_at(&data, 0), &[4u8; BS][..]);
    assert_eq!(block_at(&data, 11), &[15u8; BS][..]);
    assert_eq!(output.num_blocks(), None);
    Ok(())
}

#[test]
fn stream_output_starts_at_lba_zero() -> Result<(), Error> {
    let dir = TestDir::new("stream-out")?;
    let in_path = dir.file("input.img");
    let out_path = dir.file("output.img");
    std::fs::write(&in_path, block_pattern(16))?;

    let mut input = FileBlockIo::open_input(&in_path, BS)?;
    let options = CopyOptions::new().threads(4).chunk_blocks(4);

    for seek in ["100,4", "100,4,104,4"] {
        let mut output = StreamBlockIo::writer(std::fs::File::create(&out_path)?, BS);
        let res = copy_blocks(&mut input, &mut output, &parse("0,4")?, &parse(seek)?, &options);
        assert!(res.is_err(), "seek list {:?}", seek);
        drop(output);
        assert!(std::fs::read(&out_path)?.is_empty());
    }

    let mut output = StreamBlockIo::writer(std::fs::File::create(&out_path)?, BS);
    let stats = copy_blocks(
        &mut input,
        &mut output,
        &parse("2,6,10,-1")?,
        &parse("0,-1")?,
        &options,
    )?;
    drop(output);

    assert_eq!(stats.blocks, 12);
    assert_eq!(stats.segments, 4);
    let data = std::fs::read(&out_path)?;
    assert_eq!(data.len(), 12 * BS);
    assert_eq!(block_at(&data, 0), &[2u8; BS][..]);
    assert_eq!(block_at(&data, 5), &[7u8; BS][..]);
    assert_eq!(block_at(&data, 6), &[10u8; BS][..]);
    assert_eq!(block_at(&data, 11), &[15u8; BS][..]);
    Ok(())
}

#[test]
fn block_size_mismatch_is_an_error() -> Result<(), Error> {
    let dir = TestDir::new("bs")?;
    let in_path = dir.file("input.img");
    std::fs::write(&in_path, block_pattern(4))?;

    let mut input = FileBlockIo::open_input(&in_path, BS)?;
    let mut output = FileBlockIo::open_output(dir.file("output.img"), 4096)?;

    let res = copy_blocks(
        &mut input,
        &mut output,
        &parse("0,-1")?,
        &parse("0,-1")?,
        &CopyOptions::new().threads(1),
    );
    assert!(res.is_err());
    Ok(())
}
