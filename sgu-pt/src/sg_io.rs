//! SCSI pass-through using the Linux `SG_IO` ioctl
//!
//! See: `/usr/include/scsi/sg.h`
//!
//! The SCSI Commands Reference Manual also contains some useful information.

use std::alloc::Layout;
use std::ops::{Deref, DerefMut};
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr::NonNull;

use anyhow::{bail, format_err, Error};
use endian_trait::Endian;
use libc::{c_int, c_uchar, c_uint, c_ushort, c_void};
use serde::{Deserialize, Serialize};

use proxmox_io::ReadExt;

#[derive(thiserror::Error, Debug)]
pub struct SenseInfo {
    pub sense_key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl std::fmt::Display for SenseInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sense_text = SENSE_KEY_DESCRIPTIONS
            .get(self.sense_key as usize)
            .map(|s| String::from(*s))
            .unwrap_or_else(|| format!("Invalid sense {:02X}", self.sense_key));

        if self.asc == 0 && self.ascq == 0 {
            write!(f, "{}", sense_text)
        } else {
            let additional_sense_text = get_asc_ascq_string(self.asc, self.ascq);
            write!(f, "{}, {}", sense_text, additional_sense_text)
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ScsiError {
    #[error("{0}")]
    Error(#[from] Error),
    #[error("{0}")]
    Sense(#[from] SenseInfo),
}

impl From<std::io::Error> for ScsiError {
    fn from(error: std::io::Error) -> Self {
        Self::Error(error.into())
    }
}

/// Peripheral device type text (see `inquiry` command)
///
/// see <https://en.wikipedia.org/wiki/SCSI_Peripheral_Device_Type>
pub const PERIPHERAL_DEVICE_TYPE_TEXT: [&str; 32] = [
    "Disk Drive",
    "Tape Drive",
    "Printer",
    "Processor",
    "Write-once",
    "CD-ROM", // 05h
    "Scanner",
    "Optical",
    "Medium Changer", // 08h
    "Communications",
    "ASC IT8",
    "ASC IT8",
    "RAID Array",
    "Enclosure Services",
    "Simplified direct-access",
    "Optical card reader/writer",
    "Bridging Expander",
    "Object-based Storage",
    "Automation/Drive Interface",
    "Security manager",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Unknown",
];

//  SENSE KEYS
pub const SENSE_KEY_NO_SENSE: u8 = 0x00;
pub const SENSE_KEY_RECOVERED_ERROR: u8 = 0x01;
pub const SENSE_KEY_NOT_READY: u8 = 0x02;
pub const SENSE_KEY_MEDIUM_ERROR: u8 = 0x03;
pub const SENSE_KEY_HARDWARE_ERROR: u8 = 0x04;
pub const SENSE_KEY_ILLEGAL_REQUEST: u8 = 0x05;
pub const SENSE_KEY_UNIT_ATTENTION: u8 = 0x06;
pub const SENSE_KEY_DATA_PROTECT: u8 = 0x07;
pub const SENSE_KEY_BLANK_CHECK: u8 = 0x08;
pub const SENSE_KEY_COPY_ABORTED: u8 = 0x0a;
pub const SENSE_KEY_ABORTED_COMMAND: u8 = 0x0b;
pub const SENSE_KEY_VOLUME_OVERFLOW: u8 = 0x0d;
pub const SENSE_KEY_MISCOMPARE: u8 = 0x0e;

// SAM STAT
const SAM_STAT_CHECK_CONDITION: u8 = 0x02;

/// Sense Key Descriptions
pub const SENSE_KEY_DESCRIPTIONS: [&str; 16] = [
    "No Sense",
    "Recovered Error",
    "Not Ready",
    "Medium Error",
    "Hardware Error",
    "Illegal Request",
    "Unit Attention",
    "Data Protect",
    "Blank Check",
    "Vendor specific",
    "Copy Aborted",
    "Aborted Command",
    "Equal",
    "Volume Overflow",
    "Miscompare",
    "Completed",
];

// Additional sense codes the block copy path runs into, see
// <https://www.t10.org/lists/asc-num.htm>
const ASC_ASCQ_TEXT: &[(u8, u8, &str)] = &[
    (0x04, 0x00, "Logical unit not ready, cause not reportable"),
    (0x04, 0x01, "Logical unit is in process of becoming ready"),
    (0x04, 0x02, "Logical unit not ready, initializing command required"),
    (0x11, 0x00, "Unrecovered read error"),
    (0x20, 0x00, "Invalid command operation code"),
    (0x21, 0x00, "Logical block address out of range"),
    (0x24, 0x00, "Invalid field in cdb"),
    (0x25, 0x00, "Logical unit not supported"),
    (0x27, 0x00, "Write protected"),
    (0x28, 0x00, "Not ready to ready change, medium may have changed"),
    (0x29, 0x00, "Power on, reset, or bus device reset occurred"),
    (0x3a, 0x00, "Medium not present"),
];

#[repr(C, packed)]
#[derive(Endian, Debug)]
pub struct RequestSenseFixed {
    pub response_code: u8,
    obsolete: u8,
    pub flags2: u8,
    pub information: [u8; 4],
    pub additional_sense_len: u8,
    pub command_specific_information: [u8; 4],
    pub additional_sense_code: u8,
    pub additional_sense_code_qualifier: u8,
    pub field_replaceable_unit_code: u8,
    pub sense_key_specific: [u8; 3],
}

#[repr(C, packed)]
#[derive(Endian, Debug)]
struct RequestSenseDescriptor {
    response_code: u8,
    sense_key: u8,
    additional_sense_code: u8,
    additional_sense_code_qualifier: u8,
    reserved: [u8; 4],
    additional_sense_len: u8,
}

#[repr(C, packed)]
#[derive(Endian)]
// Standard Inquiry page - 36 bytes
struct InquiryPage {
    peripheral_type: u8,
    rmb: u8,
    version: u8,
    flags3: u8,
    additional_length: u8,
    flags5: u8,
    flags6: u8,
    flags7: u8,
    vendor: [u8; 8],
    product: [u8; 16],
    revision: [u8; 4],
}

/// Inquiry result
#[derive(Serialize, Deserialize, Debug)]
pub struct InquiryInfo {
    /// Peripheral device type (0-31)
    pub peripheral_type: u8,
    /// Peripheral device type as string
    pub peripheral_type_text: String,
    /// Vendor
    pub vendor: String,
    /// Product
    pub product: String,
    /// Revision
    pub revision: String,
}

// see scsi/sg.h
const SG_IO: c_int = 0x2285;
const SG_DXFER_NONE: c_int = -1;
const SG_DXFER_TO_DEV: c_int = -2;
const SG_DXFER_FROM_DEV: c_int = -3;
const SG_INFO_OK_MASK: c_uint = 0x1;
const SG_INFO_OK: c_uint = 0x0;
const DRIVER_SENSE: c_ushort = 0x08;

const SCSI_DEFAULT_TIMEOUT: c_uint = 60; // seconds

/// Linux `sg_io_hdr`, argument of the SG_IO ioctl
#[repr(C)]
#[derive(Debug)]
pub struct SgIoHdr {
    interface_id: c_int,
    dxfer_direction: c_int,
    cmd_len: c_uchar,
    mx_sb_len: c_uchar,
    iovec_count: c_ushort,
    dxfer_len: c_uint,
    dxferp: *mut c_void,
    cmdp: *const c_uchar,
    sbp: *mut c_uchar,
    timeout: c_uint,
    flags: c_uint,
    pack_id: c_int,
    usr_ptr: *mut c_void,
    status: c_uchar,
    masked_status: c_uchar,
    msg_status: c_uchar,
    sb_len_wr: c_uchar,
    host_status: c_ushort,
    driver_status: c_ushort,
    resid: c_int,
    duration: c_uint,
    info: c_uint,
}

nix::ioctl_readwrite_bad!(sg_io_ioctl, SG_IO, SgIoHdr);

/// Page aligned transfer buffer
///
/// SG RAWIO commands needs page aligned transfer buffers.
pub struct PageAlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Option<Layout>,
}

// the buffer exclusively owns its allocation
unsafe impl Send for PageAlignedBuffer {}

impl PageAlignedBuffer {
    /// Allocate a zero initialized buffer
    pub fn new(len: usize) -> Result<Self, Error> {
        if len == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                len,
                layout: None,
            });
        }

        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let layout = Layout::from_size_align(len, page_size)?;
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
            .ok_or_else(|| format_err!("alloc SCSI transfer buffer failed"))?;

        Ok(Self {
            ptr,
            len,
            layout: Some(layout),
        })
    }
}

impl Drop for PageAlignedBuffer {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

impl Deref for PageAlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for PageAlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// Get the string associated with ASC/ASCQ values
pub fn get_asc_ascq_string(asc: u8, ascq: u8) -> String {
    ASC_ASCQ_TEXT
        .iter()
        .find(|(code, qualifier, _)| *code == asc && *qualifier == ascq)
        .map(|(_, _, text)| text.to_string())
        .unwrap_or_else(|| format!("ASC={:02x}x, ASCQ={:02x}x", asc, ascq))
}

/// Check the CDB length against the length implied by the opcode group
pub fn is_scsi_cdb(cmd: &[u8]) -> bool {
    let opcode = match cmd.first() {
        Some(opcode) => *opcode,
        None => return false,
    };
    match opcode >> 5 {
        0 => cmd.len() == 6,
        1 | 2 => cmd.len() == 10,
        4 => cmd.len() == 16,
        5 => cmd.len() == 12,
        // reserved and vendor specific groups
        _ => (6..=16).contains(&cmd.len()),
    }
}

/// Decode fixed or descriptor format sense data
pub fn decode_sense(sense: &[u8]) -> Result<SenseInfo, Error> {
    if sense.is_empty() {
        bail!("scsi command failed, but got no sense data");
    }

    let code = sense[0] & 0x7f;
    let mut reader = sense;

    let info = match code {
        0x70 => {
            let sense: RequestSenseFixed = unsafe { reader.read_be_value()? };
            SenseInfo {
                sense_key: sense.flags2 & 0xf,
                asc: sense.additional_sense_code,
                ascq: sense.additional_sense_code_qualifier,
            }
        }
        0x72 => {
            let sense: RequestSenseDescriptor = unsafe { reader.read_be_value()? };
            SenseInfo {
                sense_key: sense.sense_key & 0xf,
                asc: sense.additional_sense_code,
                ascq: sense.additional_sense_code_qualifier,
            }
        }
        0x71 | 0x73 => bail!("scsi command failed: received deferred Sense"),
        unknown => bail!(
            "scsi command failed: invalid Sense response code {:x}",
            unknown
        ),
    };

    Ok(info)
}

/// Data transfer of one command
enum Transfer {
    None,
    FromDevice(*mut u8, usize),
    ToDevice(*const u8, usize),
}

/// Safe interface to run RAW SCSI commands
pub struct SgRaw<'a, F> {
    file: &'a mut F,
    buffer: PageAlignedBuffer,
    sense_buffer: [u8; 32],
    timeout: i32,
}

impl<'a, F: AsRawFd> SgRaw<'a, F> {
    /// Create a new instance to run commands
    ///
    /// The file must be a handle to a SCSI device.
    pub fn new(file: &'a mut F, buffer_size: usize) -> Result<Self, Error> {
        let buffer = PageAlignedBuffer::new(buffer_size)?;

        let sense_buffer = [0u8; 32];

        Ok(Self {
            file,
            buffer,
            sense_buffer,
            timeout: 0,
        })
    }

    /// Set the command timeout in seconds (0 means default (60 seconds))
    pub fn set_timeout(&mut self, seconds: usize) {
        if seconds > (i32::MAX as usize) {
            self.timeout = i32::MAX; // don't care about larger values
        } else {
            self.timeout = seconds as i32;
        }
    }

    // run the command, returns the residual byte count
    fn do_sg_io(&mut self, cmd: &[u8], transfer: Transfer) -> Result<usize, ScsiError> {
        if !is_scsi_cdb(cmd) {
            return Err(format_err!("no valid SCSI command").into());
        }

        let (dxfer_direction, dxferp, dxfer_len) = match transfer {
            Transfer::None => (SG_DXFER_NONE, std::ptr::null_mut(), 0),
            Transfer::FromDevice(ptr, len) => (SG_DXFER_FROM_DEV, ptr as *mut c_void, len),
            Transfer::ToDevice(ptr, len) => (SG_DXFER_TO_DEV, ptr as *mut c_void, len),
        };
        let dxfer_len = c_uint::try_from(dxfer_len)
            .map_err(|_| format_err!("transfer length {} too large", dxfer_len))?;

        let timeout_secs = match self.timeout {
            0 => SCSI_DEFAULT_TIMEOUT,
            secs => secs as c_uint,
        };

        self.sense_buffer = [0u8; 32];

        let mut hdr = SgIoHdr {
            interface_id: 'S' as c_int,
            dxfer_direction,
            cmd_len: cmd.len() as c_uchar,
            mx_sb_len: self.sense_buffer.len() as c_uchar,
            iovec_count: 0,
            dxfer_len,
            dxferp,
            cmdp: cmd.as_ptr(),
            sbp: self.sense_buffer.as_mut_ptr(),
            timeout: timeout_secs.saturating_mul(1000),
            flags: 0,
            pack_id: 0,
            usr_ptr: std::ptr::null_mut(),
            status: 0,
            masked_status: 0,
            msg_status: 0,
            sb_len_wr: 0,
            host_status: 0,
            driver_status: 0,
            resid: 0,
            duration: 0,
            info: 0,
        };

        let fd: RawFd = self.file.as_raw_fd();
        unsafe { sg_io_ioctl(fd, &mut hdr) }
            .map_err(|err| format_err!("SG_IO ioctl failed - {}", err))?;

        log::trace!(
            "SG_IO opcode {:#04x}: status {:#x}, host {:#x}, driver {:#x}, resid {}, {} ms",
            cmd[0],
            hdr.status,
            hdr.host_status,
            hdr.driver_status,
            hdr.resid,
            hdr.duration,
        );

        if (hdr.info & SG_INFO_OK_MASK) == SG_INFO_OK {
            let resid = usize::try_from(hdr.resid).unwrap_or(0);
            if resid > dxfer_len as usize {
                return Err(
                    format_err!("do_scsi_pt failed - got strange resid (value too big)").into(),
                );
            }
            return Ok(resid);
        }

        if (hdr.status & 0x7e) == SAM_STAT_CHECK_CONDITION
            || (hdr.driver_status & 0x0f) == DRIVER_SENSE
        {
            let sense_len = (hdr.sb_len_wr as usize).min(self.sense_buffer.len());
            let sense = decode_sense(&self.sense_buffer[..sense_len])?;
            return Err(ScsiError::Sense(sense));
        }

        if hdr.host_status != 0 {
            return Err(format_err!(
                "scsi command failed: transport error (host status {:#x})",
                hdr.host_status
            )
            .into());
        }

        if hdr.driver_status != 0 {
            return Err(format_err!(
                "scsi command failed: driver error (driver status {:#x})",
                hdr.driver_status
            )
            .into());
        }

        Err(format_err!("unknown scsi error - status response {}", hdr.status).into())
    }

    /// Run the specified RAW SCSI command
    pub fn do_command(&mut self, cmd: &[u8]) -> Result<&[u8], ScsiError> {
        if self.buffer.len() < 16 {
            return Err(format_err!("input buffer too small").into());
        }

        let transfer = Transfer::FromDevice(self.buffer.as_mut_ptr(), self.buffer.len());
        let resid = self.do_sg_io(cmd, transfer)?;

        let data_len = self.buffer.len() - resid;

        Ok(&self.buffer[..data_len])
    }

    /// Run the specified RAW SCSI command, use data as input buffer
    pub fn do_in_command<'b>(
        &mut self,
        cmd: &[u8],
        data: &'b mut [u8],
    ) -> Result<&'b [u8], ScsiError> {
        if data.is_empty() {
            return Err(format_err!("got zero-sized input buffer").into());
        }

        let resid = self.do_sg_io(cmd, Transfer::FromDevice(data.as_mut_ptr(), data.len()))?;

        let data_len = data.len() - resid;

        Ok(&data[..data_len])
    }

    /// Run dataout command
    ///
    /// Note: use PageAlignedBuffer to alloc data transfer buffer
    pub fn do_out_command(&mut self, cmd: &[u8], data: &[u8]) -> Result<(), ScsiError> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        if ((data.as_ptr() as usize) & (page_size - 1)) != 0 {
            return Err(format_err!("wrong transfer buffer alignment").into());
        }

        self.do_sg_io(cmd, Transfer::ToDevice(data.as_ptr(), data.len()))?;

        Ok(())
    }

    /// Run a command without data transfer
    pub fn do_no_data_command(&mut self, cmd: &[u8]) -> Result<(), ScsiError> {
        self.do_sg_io(cmd, Transfer::None)?;
        Ok(())
    }
}

// Useful helpers

/// Converts SCSI ASCII text into String, trim zero and spaces
pub fn scsi_ascii_to_string(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_matches(char::from(0))
        .trim()
        .to_string()
}

/// Read SCSI Inquiry page
///
/// Returns Product/Vendor/Revision and device type.
pub fn scsi_inquiry<F: AsRawFd>(file: &mut F) -> Result<InquiryInfo, Error> {
    let allocation_len: u8 = std::mem::size_of::<InquiryPage>() as u8;

    let mut sg_raw = SgRaw::new(file, allocation_len as usize)?;
    sg_raw.set_timeout(30); // use short timeout

    let mut cmd = Vec::new();
    cmd.extend([0x12, 0, 0, 0, allocation_len, 0]); // INQUIRY

    let data = sg_raw
        .do_command(&cmd)
        .map_err(|err| format_err!("SCSI inquiry failed - {}", err))?;

    decode_inquiry_page(data)
}

fn decode_inquiry_page(data: &[u8]) -> Result<InquiryInfo, Error> {
    proxmox_lang::try_block!({
        let mut reader = data;

        let page: InquiryPage = unsafe { reader.read_be_value()? };

        let peripheral_type = page.peripheral_type & 31;

        let info = InquiryInfo {
            peripheral_type,
            peripheral_type_text: PERIPHERAL_DEVICE_TYPE_TEXT[peripheral_type as usize].to_string(),
            vendor: scsi_ascii_to_string(&page.vendor),
            product: scsi_ascii_to_string(&page.product),
            revision: scsi_ascii_to_string(&page.revision),
        };

        Ok(info)
    })
    .map_err(|err: Error| format_err!("decode inquiry page failed - {}", err))
}

/// True if the given sense info is INVALID COMMAND OPERATION CODE
/// means that the device does not know/support the command
/// <https://www.t10.org/lists/asc-num.htm#ASC_20>
pub fn sense_err_is_invalid_command(err: &SenseInfo) -> bool {
    err.sense_key == SENSE_KEY_ILLEGAL_REQUEST && err.asc == 0x20 && err.ascq == 0x00
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_fixed_sense() -> Result<(), Error> {
        let mut sense = [0u8; 18];
        sense[0] = 0x70;
        sense[2] = SENSE_KEY_ILLEGAL_REQUEST;
        sense[7] = 10;
        sense[12] = 0x21;
        sense[13] = 0x00;

        let info = decode_sense(&sense)?;
        assert_eq!(info.sense_key, SENSE_KEY_ILLEGAL_REQUEST);
        assert_eq!(info.asc, 0x21);
        assert_eq!(
            info.to_string(),
            "Illegal Request, Logical block address out of range"
        );
        Ok(())
    }

    #[test]
    fn test_decode_descriptor_sense() -> Result<(), Error> {
        let sense = [0x72, SENSE_KEY_ILLEGAL_REQUEST, 0x20, 0x00, 0, 0, 0, 0, 0];
        let info = decode_sense(&sense)?;
        assert!(sense_err_is_invalid_command(&info));

        let sense = [0x72, SENSE_KEY_UNIT_ATTENTION, 0x55, 0x01, 0, 0, 0, 0, 0];
        let info = decode_sense(&sense)?;
        assert_eq!(info.to_string(), "Unit Attention, ASC=55x, ASCQ=01x");
        Ok(())
    }

    #[test]
    fn test_decode_bad_sense() {
        assert!(decode_sense(&[]).is_err());
        assert!(decode_sense(&[0x71, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        assert!(decode_sense(&[0x70, 0, 0]).is_err());
    }

    #[test]
    fn test_cdb_length_check() {
        assert!(is_scsi_cdb(&[0x12, 0, 0, 0, 36, 0]));
        assert!(!is_scsi_cdb(&[0x12, 0, 0, 0, 36]));
        assert!(is_scsi_cdb(&[0x35; 10]));
        assert!(is_scsi_cdb(&[0x88; 16]));
        assert!(!is_scsi_cdb(&[0x88; 10]));
        assert!(!is_scsi_cdb(&[]));
    }

    #[test]
    fn test_decode_inquiry() -> Result<(), Error> {
        let mut page = [0u8; 36];
        page[0] = 0x00;
        page[8..16].copy_from_slice(b"ACME    ");
        page[16..32].copy_from_slice(b"DISK 9000\0\0\0\0\0\0\0");
        page[32..36].copy_from_slice(b"1.0 ");

        let info = decode_inquiry_page(&page)?;
        assert_eq!(info.peripheral_type_text, "Disk Drive");
        assert_eq!(info.vendor, "ACME");
        assert_eq!(info.product, "DISK 9000");
        assert_eq!(info.revision, "1.0");
        Ok(())
    }

    #[test]
    fn test_page_aligned_buffer() -> Result<(), Error> {
        let mut buffer = PageAlignedBuffer::new(8192)?;
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        assert_eq!(buffer.as_ptr() as usize % page_size, 0);
        assert!(buffer.iter().all(|b| *b == 0));
        buffer[8191] = 1;
        assert_eq!(buffer[8191], 1);

        let empty = PageAlignedBuffer::new(0)?;
        assert!(empty.is_empty());
        Ok(())
    }
}
