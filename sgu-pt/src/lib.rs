//! SCSI generic pass-through for block devices

mod sg_io;
pub use sg_io::*;

pub mod block_cmds;
pub use block_cmds::{
    scsi_read_blocks, scsi_read_capacity, scsi_sync_cache, scsi_write_blocks, BlockDeviceCapacity,
};
