//! Construction of the 128-byte framed `ublk_params` buffer sent to the
//! driver with SET_PARAMS before starting a device.

use crate::{sys, UblkError};
use bitflags::bitflags;

bitflags! {
    /// Attribute bits of the basic parameter record, mapped onto the
    /// block layer's queue attributes by the driver.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BasicAttrs: u32 {
        const READ_ONLY = sys::UBLK_ATTR_READ_ONLY;
        const ROTATIONAL = sys::UBLK_ATTR_ROTATIONAL;
        const VOLATILE_CACHE = sys::UBLK_ATTR_VOLATILE_CACHE;
        const FUA = sys::UBLK_ATTR_FUA;
    }
}

/// Largest single request we advertise to the block layer, in 512-byte
/// sectors. 1024 sectors is 512KB, matching the default io buffer size.
const DEF_MAX_SECTORS: u32 = 1024;

/// Build the parameter buffer for an ordinary device of `dev_size` bytes
/// with the given logical block size.
///
/// Only the basic sub-record is marked valid; the block size shift is used
/// for the logical, physical and minimum-io limits, the optimal-io shift is
/// left to the block layer, and `len` frames the full 128-byte buffer as
/// the driver expects.
///
/// `logical_block_size` must be a power of two of at least 512 and
/// `dev_size` a non-zero multiple of it.
pub fn basic_params(dev_size: u64, logical_block_size: u32) -> Result<sys::ublk_params, UblkError> {
    basic_params_with_attrs(dev_size, logical_block_size, BasicAttrs::empty())
}

/// Same as [`basic_params`] with explicit attribute bits, e.g.
/// `BasicAttrs::VOLATILE_CACHE` for targets that buffer writes in memory.
pub fn basic_params_with_attrs(
    dev_size: u64,
    logical_block_size: u32,
    attrs: BasicAttrs,
) -> Result<sys::ublk_params, UblkError> {
    if logical_block_size < 512 || !logical_block_size.is_power_of_two() {
        return Err(UblkError::InvalidVal);
    }
    if dev_size == 0 || dev_size % logical_block_size as u64 != 0 {
        return Err(UblkError::InvalidVal);
    }

    let bs_shift = logical_block_size.trailing_zeros() as u8;
    Ok(sys::ublk_params {
        len: core::mem::size_of::<sys::ublk_params>() as u32,
        types: sys::UBLK_PARAM_TYPE_BASIC,
        basic: sys::ublk_param_basic {
            attrs: attrs.bits(),
            logical_bs_shift: bs_shift,
            physical_bs_shift: bs_shift,
            io_opt_shift: 0,
            io_min_shift: bs_shift,
            max_sectors: DEF_MAX_SECTORS,
            dev_sectors: dev_size / logical_block_size as u64,
            ..Default::default()
        },
        ..Default::default()
    })
}

/// Mark the discard sub-record valid, advertising trim support with the
/// given granularity and per-request limit (both in bytes resp. sectors).
pub fn add_discard(params: &mut sys::ublk_params, granularity: u32, max_discard_sectors: u32) {
    params.types |= sys::UBLK_PARAM_TYPE_DISCARD;
    params.discard = sys::ublk_param_discard {
        discard_granularity: granularity,
        max_discard_sectors,
        max_write_zeroes_sectors: max_discard_sectors,
        max_discard_segments: 1,
        ..Default::default()
    };
}
