//! Block device commands (SBC)

use std::os::unix::io::AsRawFd;

use anyhow::{bail, format_err, Error};
use endian_trait::Endian;
use serde::Serialize;

use proxmox_io::ReadExt;

use crate::{sense_err_is_invalid_command, ScsiError, SgRaw};

const READ_CAPACITY_10: u8 = 0x25;
const SERVICE_ACTION_IN_16: u8 = 0x9e;
const SA_READ_CAPACITY_16: u8 = 0x10;
const READ_16: u8 = 0x88;
const WRITE_16: u8 = 0x8a;
const SYNCHRONIZE_CACHE_10: u8 = 0x35;

// data transfers can take a while on slow devices
const RW_TIMEOUT: usize = 60;

#[repr(C, packed)]
#[derive(Endian, Debug, Copy, Clone)]
struct ReadCapacity10Data {
    last_lba: u32,
    block_length: u32,
}

#[repr(C, packed)]
#[derive(Endian, Debug, Copy, Clone)]
struct ReadCapacity16Data {
    last_lba: u64,
    block_length: u32,
    prot_flags: u8,
    lbppbe: u8,
    lowest_aligned_lba: u16,
    reserved: [u8; 16],
}

/// Block device capacity
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct BlockDeviceCapacity {
    /// Number of logical blocks
    pub num_blocks: u64,
    /// Logical block length in bytes
    pub block_length: u32,
}

pub fn scsi_cmd_read_capacity10() -> [u8; 10] {
    [READ_CAPACITY_10, 0, 0, 0, 0, 0, 0, 0, 0, 0]
}

pub fn scsi_cmd_read_capacity16() -> [u8; 16] {
    let alloc_len = std::mem::size_of::<ReadCapacity16Data>() as u32;
    let mut cmd = [0u8; 16];
    cmd[0] = SERVICE_ACTION_IN_16;
    cmd[1] = SA_READ_CAPACITY_16;
    cmd[10..14].copy_from_slice(&alloc_len.to_be_bytes());
    cmd
}

fn rw16_cmd(opcode: u8, lba: u64, blocks: u32) -> [u8; 16] {
    let mut cmd = [0u8; 16];
    cmd[0] = opcode;
    cmd[2..10].copy_from_slice(&lba.to_be_bytes());
    cmd[10..14].copy_from_slice(&blocks.to_be_bytes());
    cmd
}

pub fn scsi_cmd_read16(lba: u64, blocks: u32) -> [u8; 16] {
    rw16_cmd(READ_16, lba, blocks)
}

pub fn scsi_cmd_write16(lba: u64, blocks: u32) -> [u8; 16] {
    rw16_cmd(WRITE_16, lba, blocks)
}

pub fn scsi_cmd_sync_cache10() -> [u8; 10] {
    [SYNCHRONIZE_CACHE_10, 0, 0, 0, 0, 0, 0, 0, 0, 0]
}

fn decode_read_capacity10(data: &[u8]) -> Result<BlockDeviceCapacity, Error> {
    proxmox_lang::try_block!({
        let mut reader = data;
        let page: ReadCapacity10Data = unsafe { reader.read_be_value()? };

        if page.last_lba == u32::MAX {
            bail!("device too large for READ CAPACITY(10)");
        }

        Ok(BlockDeviceCapacity {
            num_blocks: u64::from(page.last_lba) + 1,
            block_length: page.block_length,
        })
    })
    .map_err(|err: Error| format_err!("decode read capacity(10) data failed - {}", err))
}

fn decode_read_capacity16(data: &[u8]) -> Result<BlockDeviceCapacity, Error> {
    proxmox_lang::try_block!({
        let mut reader = data;
        let page: ReadCapacity16Data = unsafe { reader.read_be_value()? };

        let num_blocks = page
            .last_lba
            .checked_add(1)
            .ok_or_else(|| format_err!("got invalid last LBA"))?;

        Ok(BlockDeviceCapacity {
            num_blocks,
            block_length: page.block_length,
        })
    })
    .map_err(|err: Error| format_err!("decode read capacity(16) data failed - {}", err))
}

/// Read the device capacity
///
/// Uses READ CAPACITY(16) and falls back to READ CAPACITY(10) for
/// devices which do not support the former.
pub fn scsi_read_capacity<F: AsRawFd>(file: &mut F) -> Result<BlockDeviceCapacity, Error> {
    let mut sg_raw = SgRaw::new(file, 64)?;
    sg_raw.set_timeout(30);

    match sg_raw.do_command(&scsi_cmd_read_capacity16()) {
        Ok(data) => return decode_read_capacity16(data),
        Err(ScsiError::Sense(ref sense)) if sense_err_is_invalid_command(sense) => {
            log::debug!("READ CAPACITY(16) not supported, using READ CAPACITY(10)");
        }
        Err(err) => bail!("read capacity failed - {}", err),
    }

    let data = sg_raw
        .do_command(&scsi_cmd_read_capacity10())
        .map_err(|err| format_err!("read capacity failed - {}", err))?;

    decode_read_capacity10(data)
}

/// Read `blocks` logical blocks starting at `lba` into `data`
///
/// Returns the number of bytes transferred.
pub fn scsi_read_blocks<F: AsRawFd>(
    file: &mut F,
    lba: u64,
    blocks: u32,
    data: &mut [u8],
) -> Result<usize, ScsiError> {
    let mut sg_raw = SgRaw::new(file, 0)?;
    sg_raw.set_timeout(RW_TIMEOUT);

    let cmd = scsi_cmd_read16(lba, blocks);
    let data = sg_raw.do_in_command(&cmd, data)?;

    Ok(data.len())
}

/// Write `blocks` logical blocks starting at `lba`
///
/// `data` must be page aligned (see [`crate::PageAlignedBuffer`]).
pub fn scsi_write_blocks<F: AsRawFd>(
    file: &mut F,
    lba: u64,
    blocks: u32,
    data: &[u8],
) -> Result<(), ScsiError> {
    let mut sg_raw = SgRaw::new(file, 0)?;
    sg_raw.set_timeout(RW_TIMEOUT);

    let cmd = scsi_cmd_write16(lba, blocks);
    sg_raw.do_out_command(&cmd, data)
}

/// Flush the device write cache
pub fn scsi_sync_cache<F: AsRawFd>(file: &mut F) -> Result<(), ScsiError> {
    let mut sg_raw = SgRaw::new(file, 0)?;
    sg_raw.set_timeout(RW_TIMEOUT);

    sg_raw.do_no_data_command(&scsi_cmd_sync_cache10())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::is_scsi_cdb;

    #[test]
    fn test_rw16_cdb() {
        let cmd = scsi_cmd_read16(0x0102030405060708, 0x80);
        assert_eq!(
            cmd,
            [0x88, 0, 1, 2, 3, 4, 5, 6, 7, 8, 0, 0, 0, 0x80, 0, 0]
        );
        assert!(is_scsi_cdb(&cmd));

        let cmd = scsi_cmd_write16(0x10, 0x10000);
        assert_eq!(cmd[0], 0x8a);
        assert_eq!(&cmd[2..10], &[0, 0, 0, 0, 0, 0, 0, 0x10]);
        assert_eq!(&cmd[10..14], &[0, 1, 0, 0]);
        assert!(is_scsi_cdb(&cmd));
    }

    #[test]
    fn test_capacity_cdbs() {
        let cmd = scsi_cmd_read_capacity16();
        assert_eq!(cmd[0], 0x9e);
        assert_eq!(cmd[1], 0x10);
        assert_eq!(&cmd[10..14], &[0, 0, 0, 32]);
        assert!(is_scsi_cdb(&cmd));
        assert!(is_scsi_cdb(&scsi_cmd_read_capacity10()));
        assert!(is_scsi_cdb(&scsi_cmd_sync_cache10()));
    }

    #[test]
    fn test_decode_capacity() -> Result<(), Error> {
        let data = [0, 0, 0x0f, 0xff, 0, 0, 2, 0];
        assert_eq!(
            decode_read_capacity10(&data)?,
            BlockDeviceCapacity {
                num_blocks: 0x1000,
                block_length: 512
            }
        );
        assert!(decode_read_capacity10(&[0xff, 0xff, 0xff, 0xff, 0, 0, 2, 0]).is_err());

        let mut data = [0u8; 32];
        data[..8].copy_from_slice(&0x1_0000_0000u64.to_be_bytes());
        data[8..12].copy_from_slice(&4096u32.to_be_bytes());
        assert_eq!(
            decode_read_capacity16(&data)?,
            BlockDeviceCapacity {
                num_blocks: 0x1_0000_0001,
                block_length: 4096
            }
        );
        assert!(decode_read_capacity16(&data[..12]).is_err());
        Ok(())
    }
}
