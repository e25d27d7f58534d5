//! Block addressed I/O backends for the copy engine

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileExt, FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use nix::fcntl::{fcntl, FcntlArg, OFlag};

use sgu_pt::{
    scsi_inquiry, scsi_read_blocks, scsi_read_capacity, scsi_sync_cache, scsi_write_blocks,
    BlockDeviceCapacity,
};

/// Device or file accessed in units of logical blocks
pub trait BlockIo: Send {
    fn block_size(&self) -> usize;

    /// Number of readable blocks, `None` if unknown
    fn num_blocks(&self) -> Option<u64>;

    /// Read `blocks` blocks at `lba` into `buf`
    ///
    /// Returns the number of complete blocks read, which is less than
    /// `blocks` only at the end of the input.
    fn read_blocks(&mut self, lba: u64, blocks: u32, buf: &mut [u8]) -> Result<u32, Error>;

    fn write_blocks(&mut self, lba: u64, blocks: u32, buf: &[u8]) -> Result<(), Error>;

    fn flush(&mut self) -> Result<(), Error>;

    /// Open another handle for a parallel worker
    fn try_clone(&self) -> Result<Box<dyn BlockIo>, Error>;

    /// Streams only support strictly sequential access
    fn is_stream(&self) -> bool {
        false
    }
}

fn transfer_len(block_size: usize, blocks: u32, buf_len: usize) -> Result<usize, Error> {
    let len = block_size
        .checked_mul(blocks as usize)
        .ok_or_else(|| format_err!("transfer length overflow"))?;
    if len > buf_len {
        bail!("transfer buffer too small ({} < {})", buf_len, len);
    }
    Ok(len)
}

fn byte_offset(block_size: usize, lba: u64) -> Result<u64, Error> {
    lba.checked_mul(block_size as u64)
        .ok_or_else(|| format_err!("LBA {} out of range", lba))
}

/// Regular file or block device, accessed with `pread`/`pwrite`
pub struct FileBlockIo {
    file: File,
    path: PathBuf,
    block_size: usize,
    num_blocks: Option<u64>,
}

impl FileBlockIo {
    pub fn open_input<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self, Error> {
        let path = path.as_ref();
        let mut file = File::open(path)
            .map_err(|err| format_err!("unable to open input {:?} - {}", path, err))?;

        let file_type = file.metadata()?.file_type();
        let num_blocks = if file_type.is_file() || file_type.is_block_device() {
            let size = file.seek(SeekFrom::End(0))?;
            Some(size / block_size as u64)
        } else {
            None
        };

        Ok(Self {
            file,
            path: path.to_owned(),
            block_size,
            num_blocks,
        })
    }

    pub fn open_output<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(path)
            .map_err(|err| format_err!("unable to open output {:?} - {}", path, err))?;

        Ok(Self {
            file,
            path: path.to_owned(),
            block_size,
            num_blocks: None,
        })
    }
}

impl BlockIo for FileBlockIo {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn num_blocks(&self) -> Option<u64> {
        self.num_blocks
    }

    fn read_blocks(&mut self, lba: u64, blocks: u32, buf: &mut [u8]) -> Result<u32, Error> {
        let len = transfer_len(self.block_size, blocks, buf.len())?;
        let offset = byte_offset(self.block_size, lba)?;

        let mut done = 0;
        while done < len {
            match self.file.read_at(&mut buf[done..len], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => bail!("read {:?} at LBA {} failed - {}", self.path, lba, err),
            }
        }

        if done % self.block_size != 0 {
            log::warn!(
                "{:?}: ignoring partial block at end of input ({} bytes)",
                self.path,
                done % self.block_size
            );
        }

        Ok((done / self.block_size) as u32)
    }

    fn write_blocks(&mut self, lba: u64, blocks: u32, buf: &[u8]) -> Result<(), Error> {
        let len = transfer_len(self.block_size, blocks, buf.len())?;
        let offset = byte_offset(self.block_size, lba)?;

        self.file
            .write_all_at(&buf[..len], offset)
            .map_err(|err| format_err!("write {:?} at LBA {} failed - {}", self.path, lba, err))
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.file.sync_data()?;
        Ok(())
    }

    fn try_clone(&self) -> Result<Box<dyn BlockIo>, Error> {
        Ok(Box::new(Self {
            file: self.file.try_clone()?,
            path: self.path.clone(),
            block_size: self.block_size,
            num_blocks: self.num_blocks,
        }))
    }
}

/// SCSI device accessed through the `sg` driver
pub struct SgBlockIo {
    file: File,
    path: PathBuf,
    capacity: BlockDeviceCapacity,
}

impl SgBlockIo {
    pub fn open<P: AsRef<Path>>(path: P, write: bool, block_size: usize) -> Result<Self, Error> {
        let path = path.as_ref();

        // do not wait for media, use O_NONBLOCK
        let mut file = OpenOptions::new()
            .read(true)
            .write(write)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|err| format_err!("unable to open {:?} - {}", path, err))?;

        // then clear O_NONBLOCK
        let flags = fcntl(file.as_raw_fd(), FcntlArg::F_GETFL)?;

        let mut flags = OFlag::from_bits_truncate(flags);
        flags.remove(OFlag::O_NONBLOCK);

        fcntl(file.as_raw_fd(), FcntlArg::F_SETFL(flags))?;

        let info = scsi_inquiry(&mut file)?;
        log::info!(
            "{:?}: {} {} {} ({})",
            path,
            info.vendor,
            info.product,
            info.revision,
            info.peripheral_type_text
        );

        let capacity = scsi_read_capacity(&mut file)?;
        log::debug!(
            "{:?}: {} blocks of {} bytes",
            path,
            capacity.num_blocks,
            capacity.block_length
        );

        if capacity.block_length as usize != block_size {
            bail!(
                "{:?}: device block length {} does not match block size {}",
                path,
                capacity.block_length,
                block_size
            );
        }

        Ok(Self {
            file,
            path: path.to_owned(),
            capacity,
        })
    }
}

impl BlockIo for SgBlockIo {
    fn block_size(&self) -> usize {
        self.capacity.block_length as usize
    }

    fn num_blocks(&self) -> Option<u64> {
        Some(self.capacity.num_blocks)
    }

    fn read_blocks(&mut self, lba: u64, blocks: u32, buf: &mut [u8]) -> Result<u32, Error> {
        let block_size = self.block_size();
        let len = transfer_len(block_size, blocks, buf.len())?;

        let done = scsi_read_blocks(&mut self.file, lba, blocks, &mut buf[..len])
            .map_err(|err| format_err!("read {:?} at LBA {} failed - {}", self.path, lba, err))?;

        Ok((done / block_size) as u32)
    }

    fn write_blocks(&mut self, lba: u64, blocks: u32, buf: &[u8]) -> Result<(), Error> {
        let len = transfer_len(self.block_size(), blocks, buf.len())?;

        scsi_write_blocks(&mut self.file, lba, blocks, &buf[..len])
            .map_err(|err| format_err!("write {:?} at LBA {} failed - {}", self.path, lba, err))
    }

    fn flush(&mut self) -> Result<(), Error> {
        scsi_sync_cache(&mut self.file)
            .map_err(|err| format_err!("sync cache on {:?} failed - {}", self.path, err))
    }

    fn try_clone(&self) -> Result<Box<dyn BlockIo>, Error> {
        Ok(Box::new(Self {
            file: self.file.try_clone()?,
            path: self.path.clone(),
            capacity: self.capacity,
        }))
    }
}

enum Stream {
    Input(Box<dyn Read + Send>),
    Output(Box<dyn Write + Send>),
}

/// Standard input or output (or any other pipe)
///
/// Blocks are transferred in order. Reading ahead of the current
/// position discards the skipped input, everything else is an error.
pub struct StreamBlockIo {
    stream: Stream,
    block_size: usize,
    position: u64,
}

impl StreamBlockIo {
    pub fn reader<R: Read + Send + 'static>(reader: R, block_size: usize) -> Self {
        Self {
            stream: Stream::Input(Box::new(reader)),
            block_size,
            position: 0,
        }
    }

    pub fn writer<W: Write + Send + 'static>(writer: W, block_size: usize) -> Self {
        Self {
            stream: Stream::Output(Box::new(writer)),
            block_size,
            position: 0,
        }
    }

    pub fn stdin(block_size: usize) -> Self {
        Self::reader(std::io::stdin(), block_size)
    }

    pub fn stdout(block_size: usize) -> Self {
        Self::writer(std::io::stdout(), block_size)
    }

    // fill as much of buf as the stream provides, returns bytes read
    fn read_full(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let reader = match &mut self.stream {
            Stream::Input(reader) => reader,
            Stream::Output(_) => bail!("stream not open for reading"),
        };

        let mut done = 0;
        while done < buf.len() {
            match reader.read(&mut buf[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(done)
    }

    fn discard_until(&mut self, lba: u64) -> Result<bool, Error> {
        let mut scratch = vec![0u8; self.block_size];
        while self.position < lba {
            if self.read_full(&mut scratch)? < self.block_size {
                return Ok(false);
            }
            self.position += 1;
        }
        Ok(true)
    }
}

impl BlockIo for StreamBlockIo {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn num_blocks(&self) -> Option<u64> {
        None
    }

    fn read_blocks(&mut self, lba: u64, blocks: u32, buf: &mut [u8]) -> Result<u32, Error> {
        if lba < self.position {
            bail!(
                "cannot read LBA {} from stream, already at {}",
                lba,
                self.position
            );
        }
        let len = transfer_len(self.block_size, blocks, buf.len())?;

        if !self.discard_until(lba)? {
            return Ok(0);
        }

        let done = self.read_full(&mut buf[..len])?;
        let read = (done / self.block_size) as u32;
        self.position += u64::from(read);

        Ok(read)
    }

    fn write_blocks(&mut self, lba: u64, blocks: u32, buf: &[u8]) -> Result<(), Error> {
        let writer = match &mut self.stream {
            Stream::Output(writer) => writer,
            Stream::Input(_) => bail!("stream not open for writing"),
        };

        if lba != self.position {
            bail!(
                "cannot write LBA {} to stream, expected {}",
                lba,
                self.position
            );
        }

        let len = transfer_len(self.block_size, blocks, buf.len())?;
        writer.write_all(&buf[..len])?;
        self.position += u64::from(blocks);

        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        if let Stream::Output(writer) = &mut self.stream {
            writer.flush()?;
        }
        Ok(())
    }

    fn try_clone(&self) -> Result<Box<dyn BlockIo>, Error> {
        bail!("streams cannot be shared between workers");
    }

    fn is_stream(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn test_stream_sequential_access() -> Result<(), Error> {
        let data: Vec<u8> = (0..8u8).flat_map(|b| [b; 4]).collect();
        let mut stream = StreamBlockIo::reader(Cursor::new(data), 4);

        let mut buf = [0u8; 8];
        assert_eq!(stream.read_blocks(0, 2, &mut buf)?, 2);
        assert_eq!(buf, [0, 0, 0, 0, 1, 1, 1, 1]);

        // skip blocks 2 and 3
        assert_eq!(stream.read_blocks(4, 2, &mut buf)?, 2);
        assert_eq!(buf, [4, 4, 4, 4, 5, 5, 5, 5]);

        assert!(stream.read_blocks(1, 1, &mut buf).is_err());
        assert!(stream.write_blocks(6, 1, &buf).is_err());

        assert_eq!(stream.read_blocks(6, 2, &mut buf)?, 2);
        assert_eq!(stream.read_blocks(8, 2, &mut buf)?, 0);
        Ok(())
    }

    #[test]
    fn test_stream_write_order() -> Result<(), Error> {
        let path = std::env::temp_dir().join(format!("sgl-stream-{}.bin", std::process::id()));
        let file = File::create(&path)?;

        let mut stream = StreamBlockIo::writer(file, 2);
        stream.write_blocks(0, 2, &[1, 1, 2, 2])?;
        assert!(stream.write_blocks(3, 1, &[3, 3]).is_err());
        stream.write_blocks(2, 1, &[3, 3, 9, 9])?;
        stream.flush()?;
        assert!(stream.try_clone().is_err());
        drop(stream);

        let data = std::fs::read(&path)?;
        std::fs::remove_file(&path)?;
        assert_eq!(data, [1, 1, 2, 2, 3, 3]);
        Ok(())
    }

    #[test]
    fn test_file_short_read() -> Result<(), Error> {
        let path = std::env::temp_dir().join(format!("sgl-file-{}.bin", std::process::id()));
        std::fs::write(&path, [7u8; 10])?;

        let mut input = FileBlockIo::open_input(&path, 4)?;
        assert_eq!(input.num_blocks(), Some(2));

        let mut buf = [0u8; 16];
        assert_eq!(input.read_blocks(1, 4, &mut buf)?, 1);
        assert!(input.read_blocks(0, 5, &mut buf).is_err());

        std::fs::remove_file(&path)?;
        Ok(())
    }
}
