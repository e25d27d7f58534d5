//! Scatter-gather list toolkit
//!
//! Block I/O backends and the dd style copy engine built on top of the
//! [`sgu_sgl`] lists and the [`sgu_pt`] SCSI pass-through.

pub mod block_io;
pub mod copy;

pub use sgu_sgl::{ScatterGatherList, SglError, SgIter};
