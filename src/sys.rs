//! Kernel ABI of the ublk driver: command records, command numbers and
//! the ioctl encoding used by modern kernels.
//!
//! Everything in this module mirrors `include/uapi/linux/ublk_cmd.h`. The
//! structures are shipped to the driver byte-for-byte through `URING_CMD`
//! submissions, so their layout is load-bearing and checked at compile
//! time below.

#![allow(non_camel_case_types)]

/// Admin commands, issued by the ublk server and handled by the ublk driver.
pub const UBLK_CMD_GET_QUEUE_AFFINITY: u32 = 1;
pub const UBLK_CMD_GET_DEV_INFO: u32 = 2;
pub const UBLK_CMD_ADD_DEV: u32 = 4;
pub const UBLK_CMD_DEL_DEV: u32 = 5;
pub const UBLK_CMD_START_DEV: u32 = 6;
pub const UBLK_CMD_STOP_DEV: u32 = 7;
pub const UBLK_CMD_SET_PARAMS: u32 = 8;
pub const UBLK_CMD_GET_PARAMS: u32 = 9;
pub const UBLK_CMD_START_USER_RECOVERY: u32 = 0x10;
pub const UBLK_CMD_END_USER_RECOVERY: u32 = 0x11;
pub const UBLK_CMD_GET_DEV_INFO2: u32 = 0x12;
pub const UBLK_CMD_GET_FEATURES: u32 = 0x13;

/// IO commands, issued via sqe(URING_CMD) against /dev/ublkcN.
///
/// FETCH_REQ: issued beforehand for fetching one IO request from the ublk
///      driver, should be issued only when starting the device. After the
///      associated cqe is returned, the request's tag can be retrieved via
///      cqe->user_data.
///
/// COMMIT_AND_FETCH_REQ: issued after the server handled this IO request;
///      the handling result is committed to the ublk driver and a FETCH_REQ
///      for the same tag is piggybacked.
pub const UBLK_IO_FETCH_REQ: u32 = 0x20;
pub const UBLK_IO_COMMIT_AND_FETCH_REQ: u32 = 0x21;
pub const UBLK_IO_NEED_GET_DATA: u32 = 0x22;

/// only ABORT means no re-fetch
pub const UBLK_IO_RES_OK: i32 = 0;
pub const UBLK_IO_RES_NEED_GET_DATA: i32 = 1;
pub const UBLK_IO_RES_ABORT: i32 = -libc::ENODEV;

pub const UBLKSRV_CMD_BUF_OFFSET: u64 = 0;
pub const UBLKSRV_IO_BUF_OFFSET: u64 = 0x8000_0000;

/// tag is 12bit wide, so at most 4096 IOs for each queue
pub const UBLK_MAX_QUEUE_DEPTH: u32 = 4096;
/// driver-side limit on hardware queues per device
pub const UBLK_MAX_NR_QUEUES: u32 = 32;

pub const UBLK_F_SUPPORT_ZERO_COPY: u64 = 1 << 0;
pub const UBLK_F_URING_CMD_COMP_IN_TASK: u64 = 1 << 1;
pub const UBLK_F_NEED_GET_DATA: u64 = 1 << 2;
pub const UBLK_F_USER_RECOVERY: u64 = 1 << 3;
pub const UBLK_F_USER_RECOVERY_REISSUE: u64 = 1 << 4;
pub const UBLK_F_UNPRIVILEGED_DEV: u64 = 1 << 5;
/// Commands are ioctl-encoded; required by kernels >= 6.11 and accepted
/// from 6.0 on. Every device this crate creates sets it.
pub const UBLK_F_CMD_IOCTL_ENCODE: u64 = 1 << 6;
pub const UBLK_F_USER_COPY: u64 = 1 << 7;
pub const UBLK_F_ZONED: u64 = 1 << 8;

/// device state, reported in `ublksrv_ctrl_dev_info.state`
pub const UBLK_S_DEV_DEAD: u16 = 0;
pub const UBLK_S_DEV_LIVE: u16 = 1;
pub const UBLK_S_DEV_QUIESCED: u16 = 2;

/// `queue_id` sentinel for control-scope commands
pub const UBLK_CTRL_QUEUE_ID: u16 = u16::MAX;
/// `dev_id` sentinel asking ADD_DEV to auto-assign an id
pub const UBLK_DEV_ID_AUTO: u32 = u32::MAX;

const UBLK_IOC_TYPE: u32 = b'u' as u32;

const IOC_READ: u32 = 2;
const IOC_WRITE: u32 = 1;

const fn ioc(dir: u32, nr: u32, size: u32) -> u32 {
    (dir << 30) | (size << 16) | (UBLK_IOC_TYPE << 8) | nr
}

const fn ublk_ior(nr: u32, size: u32) -> u32 {
    ioc(IOC_READ, nr, size)
}

const fn ublk_iowr(nr: u32, size: u32) -> u32 {
    ioc(IOC_READ | IOC_WRITE, nr, size)
}

const CTRL_CMD_SIZE: u32 = core::mem::size_of::<ublksrv_ctrl_cmd>() as u32;
const IO_CMD_SIZE: u32 = core::mem::size_of::<ublksrv_io_cmd>() as u32;

/// ioctl-encoded control command numbers, placed in the low 32 bits of
/// sqe->off. The read-only queries keep the `_IOR` direction the kernel
/// header gives them; the driver matches the full 32-bit value.
pub const UBLK_U_CMD_GET_QUEUE_AFFINITY: u32 = ublk_ior(UBLK_CMD_GET_QUEUE_AFFINITY, CTRL_CMD_SIZE);
pub const UBLK_U_CMD_GET_DEV_INFO: u32 = ublk_ior(UBLK_CMD_GET_DEV_INFO, CTRL_CMD_SIZE);
pub const UBLK_U_CMD_ADD_DEV: u32 = ublk_iowr(UBLK_CMD_ADD_DEV, CTRL_CMD_SIZE);
pub const UBLK_U_CMD_DEL_DEV: u32 = ublk_iowr(UBLK_CMD_DEL_DEV, CTRL_CMD_SIZE);
pub const UBLK_U_CMD_START_DEV: u32 = ublk_iowr(UBLK_CMD_START_DEV, CTRL_CMD_SIZE);
pub const UBLK_U_CMD_STOP_DEV: u32 = ublk_iowr(UBLK_CMD_STOP_DEV, CTRL_CMD_SIZE);
pub const UBLK_U_CMD_SET_PARAMS: u32 = ublk_iowr(UBLK_CMD_SET_PARAMS, CTRL_CMD_SIZE);
pub const UBLK_U_CMD_GET_PARAMS: u32 = ublk_ior(UBLK_CMD_GET_PARAMS, CTRL_CMD_SIZE);
/// Recovery command numbers are defined for completeness; this crate does
/// not drive user recovery.
pub const UBLK_U_CMD_START_USER_RECOVERY: u32 = ublk_iowr(UBLK_CMD_START_USER_RECOVERY, CTRL_CMD_SIZE);
pub const UBLK_U_CMD_END_USER_RECOVERY: u32 = ublk_iowr(UBLK_CMD_END_USER_RECOVERY, CTRL_CMD_SIZE);
pub const UBLK_U_CMD_GET_DEV_INFO2: u32 = ublk_ior(UBLK_CMD_GET_DEV_INFO2, CTRL_CMD_SIZE);
pub const UBLK_U_CMD_GET_FEATURES: u32 = ublk_ior(UBLK_CMD_GET_FEATURES, CTRL_CMD_SIZE);

pub const UBLK_U_IO_FETCH_REQ: u32 = ublk_iowr(UBLK_IO_FETCH_REQ, IO_CMD_SIZE);
pub const UBLK_U_IO_COMMIT_AND_FETCH_REQ: u32 = ublk_iowr(UBLK_IO_COMMIT_AND_FETCH_REQ, IO_CMD_SIZE);
pub const UBLK_U_IO_NEED_GET_DATA: u32 = ublk_iowr(UBLK_IO_NEED_GET_DATA, IO_CMD_SIZE);

/// shipped via sqe->cmd of io_uring command
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ublksrv_ctrl_cmd {
    /// sent to which device, must be valid
    pub dev_id: u32,
    /// sent to which queue, must be -1 if the cmd isn't for a queue
    pub queue_id: u16,
    /// cmd specific buffer length, can be IN or OUT
    pub len: u16,
    pub addr: u64,
    /// inline data
    pub data: [u64; 1],
    /// unprivileged mode only; always zero here
    pub dev_path_len: u16,
    pub pad: u16,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ublksrv_ctrl_dev_info {
    pub nr_hw_queues: u16,
    pub queue_depth: u16,
    pub state: u16,
    pub pad0: u16,
    pub max_io_buf_bytes: u32,
    pub dev_id: u32,
    pub ublksrv_pid: i32,
    pub pad1: u32,
    pub flags: u64,
    /// for server internal use, invisible to the ublk driver
    pub ublksrv_flags: u64,
    /// stored by the kernel
    pub owner_uid: u32,
    /// stored by the kernel
    pub owner_gid: u32,
    pub reserved1: u64,
    pub reserved2: u64,
}

/// One request descriptor, stored by the ublk driver in the shared memory
/// region mapped from /dev/ublkcN and read by the server after the fetch
/// command for its tag completes.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ublksrv_io_desc {
    /// op: bit 0-7, flags: bit 8-31
    pub op_flags: u32,
    pub nr_sectors: u32,
    /// start sector for this io
    pub start_sector: u64,
    /// buffer address in the server's vm space
    pub addr: u64,
}

/// issued to the ublk driver via /dev/ublkcN
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ublksrv_io_cmd {
    pub q_id: u16,
    /// for fetch/commit which request
    pub tag: u16,
    /// io result, valid for COMMIT* commands only
    pub result: i32,
    /// userspace buffer address of this tag, valid for FETCH* commands only
    pub addr: u64,
}

pub const UBLK_ATTR_READ_ONLY: u32 = 1 << 0;
pub const UBLK_ATTR_ROTATIONAL: u32 = 1 << 1;
pub const UBLK_ATTR_VOLATILE_CACHE: u32 = 1 << 2;
pub const UBLK_ATTR_FUA: u32 = 1 << 3;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ublk_param_basic {
    pub attrs: u32,
    pub logical_bs_shift: u8,
    pub physical_bs_shift: u8,
    pub io_opt_shift: u8,
    pub io_min_shift: u8,
    pub max_sectors: u32,
    pub chunk_sectors: u32,
    pub dev_sectors: u64,
    pub virt_boundary_mask: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ublk_param_discard {
    pub discard_alignment: u32,
    pub discard_granularity: u32,
    pub max_discard_sectors: u32,
    pub max_write_zeroes_sectors: u32,
    pub max_discard_segments: u16,
    pub reserved0: u16,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ublk_param_devt {
    pub char_major: u32,
    pub char_minor: u32,
    pub disk_major: u32,
    pub disk_minor: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ublk_param_zoned {
    pub max_open_zones: u32,
    pub max_active_zones: u32,
    pub max_zone_append_sectors: u32,
    pub reserved: [u8; 20],
}

pub const UBLK_PARAM_TYPE_BASIC: u32 = 1 << 0;
pub const UBLK_PARAM_TYPE_DISCARD: u32 = 1 << 1;
pub const UBLK_PARAM_TYPE_DEVT: u32 = 1 << 2;
pub const UBLK_PARAM_TYPE_ZONED: u32 = 1 << 3;

/// Framed parameter buffer for SET_PARAMS/GET_PARAMS. `types` is a bitmask
/// selecting which sub-records are valid; `len` has to be set by userspace
/// for both directions and the driver clamps it to its own notion of the
/// structure. The buffer is padded out to exactly 128 bytes.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ublk_params {
    pub len: u32,
    pub types: u32,
    pub basic: ublk_param_basic,
    pub discard: ublk_param_discard,
    pub devt: ublk_param_devt,
    pub zoned: ublk_param_zoned,
    pub reserved: [u8; 20],
}

const _: () = assert!(core::mem::size_of::<ublksrv_ctrl_cmd>() == 32);
const _: () = assert!(core::mem::size_of::<ublksrv_ctrl_dev_info>() == 64);
const _: () = assert!(core::mem::size_of::<ublksrv_io_desc>() == 24);
const _: () = assert!(core::mem::size_of::<ublksrv_io_cmd>() == 16);
const _: () = assert!(core::mem::size_of::<ublk_param_basic>() == 32);
const _: () = assert!(core::mem::size_of::<ublk_param_discard>() == 20);
const _: () = assert!(core::mem::size_of::<ublk_param_devt>() == 16);
const _: () = assert!(core::mem::size_of::<ublk_param_zoned>() == 32);
const _: () = assert!(core::mem::size_of::<ublk_params>() == 128);

/// Block operation carried in the low 8 bits of `ublksrv_io_desc.op_flags`.
///
/// Codes outside the known set decode as `Unknown` so a target can answer
/// them with -EOPNOTSUPP instead of misinterpreting the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UblkOp {
    Read,
    Write,
    Flush,
    Discard,
    WriteSame,
    WriteZeroes,
    ZoneOpen,
    ZoneClose,
    ZoneFinish,
    ZoneAppend,
    ZoneResetAll,
    ZoneReset,
    ReportZones,
    Unknown(u8),
}

impl UblkOp {
    pub const READ: u8 = 0;
    pub const WRITE: u8 = 1;
    pub const FLUSH: u8 = 2;
    pub const DISCARD: u8 = 3;
    pub const WRITE_SAME: u8 = 4;
    pub const WRITE_ZEROES: u8 = 5;
    pub const ZONE_OPEN: u8 = 10;
    pub const ZONE_CLOSE: u8 = 11;
    pub const ZONE_FINISH: u8 = 12;
    pub const ZONE_APPEND: u8 = 13;
    pub const ZONE_RESET_ALL: u8 = 14;
    pub const ZONE_RESET: u8 = 15;
    pub const REPORT_ZONES: u8 = 18;

    #[inline(always)]
    pub fn from_op_flags(op_flags: u32) -> UblkOp {
        match (op_flags & 0xff) as u8 {
            Self::READ => UblkOp::Read,
            Self::WRITE => UblkOp::Write,
            Self::FLUSH => UblkOp::Flush,
            Self::DISCARD => UblkOp::Discard,
            Self::WRITE_SAME => UblkOp::WriteSame,
            Self::WRITE_ZEROES => UblkOp::WriteZeroes,
            Self::ZONE_OPEN => UblkOp::ZoneOpen,
            Self::ZONE_CLOSE => UblkOp::ZoneClose,
            Self::ZONE_FINISH => UblkOp::ZoneFinish,
            Self::ZONE_APPEND => UblkOp::ZoneAppend,
            Self::ZONE_RESET_ALL => UblkOp::ZoneResetAll,
            Self::ZONE_RESET => UblkOp::ZoneReset,
            Self::REPORT_ZONES => UblkOp::ReportZones,
            other => UblkOp::Unknown(other),
        }
    }
}

/// Operation code of one request descriptor, bits 0-7 of `op_flags`.
#[inline(always)]
pub fn ublksrv_get_op(iod: &ublksrv_io_desc) -> u8 {
    (iod.op_flags & 0xff) as u8
}

/// Request flags of one descriptor, bits 8-31 of `op_flags`.
#[inline(always)]
pub fn ublksrv_get_flags(iod: &ublksrv_io_desc) -> u32 {
    iod.op_flags >> 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioctl_encoding() {
        // values from include/uapi/linux/ublk_cmd.h
        assert_eq!(UBLK_U_CMD_ADD_DEV, 0xc020_7504);
        assert_eq!(UBLK_U_CMD_DEL_DEV, 0xc020_7505);
        assert_eq!(UBLK_U_CMD_START_DEV, 0xc020_7506);
        assert_eq!(UBLK_U_CMD_STOP_DEV, 0xc020_7507);
        assert_eq!(UBLK_U_CMD_SET_PARAMS, 0xc020_7508);
        assert_eq!(UBLK_U_CMD_GET_DEV_INFO, 0x8020_7502);
        assert_eq!(UBLK_U_CMD_GET_PARAMS, 0x8020_7509);
        assert_eq!(UBLK_U_CMD_GET_FEATURES, 0x8020_7513);
        assert_eq!(UBLK_U_CMD_GET_QUEUE_AFFINITY, 0x8020_7501);
        assert_eq!(UBLK_U_IO_FETCH_REQ, 0xc010_7520);
        assert_eq!(UBLK_U_IO_COMMIT_AND_FETCH_REQ, 0xc010_7521);
    }

    #[test]
    fn test_ioctl_encoding_shape() {
        // every read-write command is (3 << 30) | (size << 16) | ('u' << 8) | nr
        for (cmd, nr) in [
            (UBLK_U_CMD_ADD_DEV, UBLK_CMD_ADD_DEV),
            (UBLK_U_CMD_DEL_DEV, UBLK_CMD_DEL_DEV),
            (UBLK_U_CMD_START_DEV, UBLK_CMD_START_DEV),
            (UBLK_U_CMD_STOP_DEV, UBLK_CMD_STOP_DEV),
            (UBLK_U_CMD_SET_PARAMS, UBLK_CMD_SET_PARAMS),
        ] {
            assert_eq!(cmd, (3 << 30) | (32 << 16) | (0x75 << 8) | nr);
        }
        for (cmd, nr) in [
            (UBLK_U_IO_FETCH_REQ, UBLK_IO_FETCH_REQ),
            (UBLK_U_IO_COMMIT_AND_FETCH_REQ, UBLK_IO_COMMIT_AND_FETCH_REQ),
        ] {
            assert_eq!(cmd, (3 << 30) | (16 << 16) | (0x75 << 8) | nr);
        }
    }

    #[test]
    fn test_op_decoding() {
        let iod = ublksrv_io_desc {
            op_flags: (0x2a << 8) | UblkOp::WRITE as u32,
            nr_sectors: 8,
            start_sector: 0,
            addr: 0,
        };
        assert_eq!(ublksrv_get_op(&iod), UblkOp::WRITE);
        assert_eq!(ublksrv_get_flags(&iod), 0x2a);
        assert_eq!(UblkOp::from_op_flags(iod.op_flags), UblkOp::Write);
    }

    #[test]
    fn test_unknown_op_is_distinct() {
        match UblkOp::from_op_flags(0xc7) {
            UblkOp::Unknown(0xc7) => {}
            other => panic!("expected Unknown(0xc7), got {:?}", other),
        }
        // flags in the upper bits never leak into the op
        assert_eq!(UblkOp::from_op_flags(0xffff_ff00), UblkOp::Read);
    }
}
