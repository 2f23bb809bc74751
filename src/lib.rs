//! # ublksrv
//!
//! A library for serving Linux ublk block devices from userspace, see the
//! kernel documentation in `Documentation/block/ublk.rst`.
//!
//! The kernel dispatches block requests for /dev/ublkbN through a pair of
//! character devices driven with `URING_CMD`: /dev/ublk-control for the
//! device lifecycle and /dev/ublkcN for per-queue IO. This crate provides
//! the pieces of that protocol:
//!
//! - [`uring::Ring`], an io_uring in the SQE128/CQE32 mode URING_CMD needs
//! - [`ctrl::UblkCtrl`], the lifecycle commands over /dev/ublk-control
//! - [`io::UblkQueue`], one hardware queue's fetch/commit machinery
//! - [`device::UblkDevice`], the multi-queue orchestration on top
//! - [`target::UblkTarget`], the storage contract, with null and RAM
//!   reference targets
//!
//! ```no_run
//! use std::sync::Arc;
//! use ublksrv::ctrl::UblkCtrl;
//! use ublksrv::device::DeviceBuilder;
//! use ublksrv::params::basic_params;
//! use ublksrv::target::RamTarget;
//!
//! fn main() -> Result<(), ublksrv::UblkError> {
//!     let mut ctrl = UblkCtrl::new()?;
//!     let params = basic_params(64 << 20, 512)?;
//!     let mut dev = DeviceBuilder::default()
//!         .nr_queues(1)
//!         .depth(64)
//!         .io_buf_bytes(64 << 10)
//!         .create(&mut ctrl, &params)?;
//!
//!     dev.start(Arc::new(RamTarget::new(64 << 20)))?;
//!     println!("serving {}", dev.bdev_path());
//!     std::thread::sleep(std::time::Duration::from_secs(30));
//!     dev.stop()?;
//!     Ok(())
//! }
//! ```
//!
//! Requires Linux 6.8+ with `ublk_drv` loaded and enough privilege to open
//! the control device (CAP_SYS_ADMIN or root).

pub mod ctrl;
pub mod device;
pub mod io;
pub mod params;
pub mod sys;
pub mod target;
pub mod uring;

pub use ctrl::UblkCtrl;
pub use device::{DeviceBuilder, UblkDevice};
pub use io::{UblkQueue, UblkQueueCtx};
pub use target::{NullTarget, RamTarget, UblkTarget};

use uring::RingError;

/// the char device and block device names may change according to system
/// policy, e.g. udev may rename them in its own namespaces
pub const CDEV_PATH: &str = "/dev/ublkc";
pub const BDEV_PATH: &str = "/dev/ublkb";

/// Path of the per-device char device the queues talk to.
pub fn cdev_path(dev_id: u32) -> String {
    format!("{}{}", CDEV_PATH, dev_id)
}

/// Path of the block device the kernel exposes once the device is started.
pub fn bdev_path(dev_id: u32) -> String {
    format!("{}{}", BDEV_PATH, dev_id)
}

#[derive(thiserror::Error, Debug)]
pub enum UblkError {
    #[error("ublk control device not found, run `modprobe ublk_drv` first")]
    DeviceNotFound,

    #[error("io_uring failure")]
    Ring(#[from] RingError),

    #[error("mmap failure")]
    Mmap(#[source] std::io::Error),

    #[error("ADD_DEV failed: {0}")]
    AddDeviceFailed(i32),

    #[error("GET_DEV_INFO failed: {0}")]
    GetDeviceInfoFailed(i32),

    #[error("SET_PARAMS failed: {0}")]
    SetParamsFailed(i32),

    #[error("GET_PARAMS failed: {0}")]
    GetParamsFailed(i32),

    #[error("GET_FEATURES failed: {0}")]
    GetFeaturesFailed(i32),

    #[error("GET_QUEUE_AFFINITY failed: {0}")]
    GetQueueAffinityFailed(i32),

    #[error("START_DEV failed: {0}")]
    StartDeviceFailed(i32),

    #[error("STOP_DEV failed: {0}")]
    StopDeviceFailed(i32),

    #[error("DEL_DEV failed: {0}")]
    DeleteDeviceFailed(i32),

    #[error("submit returned but no completion materialised")]
    NoCompletion,

    #[error("queue is down")]
    QueueIsDown,

    #[error("invalid value")]
    InvalidVal,

    #[error("other IO failure")]
    IOError(#[from] std::io::Error),

    #[error("other failure: {0}")]
    OtherError(i32),
}
