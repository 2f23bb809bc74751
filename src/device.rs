//! Multi-queue device lifecycle: creation, queue-thread startup in the
//! order the driver needs, START/STOP and teardown.

use crate::ctrl::{UblkCtrl, UblkQueueAffinity};
use crate::io::UblkQueue;
use crate::target::UblkTarget;
use crate::{cdev_path, sys, UblkError};
use derive_setters::Setters;
use log::trace;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

/// Device geometry and orchestration tunables.
///
/// The two tunables the protocol leaves open are exposed here:
/// `start_delay`, the settle time between the last queue arming and
/// START_DEV (kernels have needed between 100 and 500 ms to observe every
/// queue in the wait state), and `cdev_per_queue`, whether each queue opens
/// /dev/ublkcN itself or receives a duplicated descriptor.
#[derive(Setters, Debug, Clone, PartialEq, Eq)]
pub struct DeviceBuilder {
    /// device id; -1 asks the driver to allocate one
    id: i32,

    /// how many hardware queues, each with its own thread
    nr_queues: u16,

    /// per-queue depth; must be a power of two since it doubles as the
    /// queue ring size
    depth: u16,

    /// max bytes of a single IO, also the per-tag buffer size
    io_buf_bytes: u32,

    /// extra UBLK_F_* flags for the driver; IOCTL_ENCODE is always added
    ctrl_flags: u64,

    /// settle time between arming the last queue and START_DEV
    start_delay: Duration,

    /// true: every queue opens its own cdev handle; false: one open,
    /// duplicated per queue
    cdev_per_queue: bool,
}

impl Default for DeviceBuilder {
    fn default() -> Self {
        DeviceBuilder {
            id: -1,
            nr_queues: 1,
            depth: 64,
            io_buf_bytes: 512 << 10,
            ctrl_flags: 0,
            start_delay: Duration::from_millis(500),
            cdev_per_queue: true,
        }
    }
}

impl DeviceBuilder {
    fn validate(&self) -> Result<(), UblkError> {
        if self.nr_queues == 0 || self.nr_queues as u32 > sys::UBLK_MAX_NR_QUEUES {
            return Err(UblkError::InvalidVal);
        }
        if self.depth == 0
            || !self.depth.is_power_of_two()
            || self.depth as u32 > sys::UBLK_MAX_QUEUE_DEPTH
        {
            return Err(UblkError::InvalidVal);
        }
        let page_sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u32;
        if self.io_buf_bytes == 0 || (self.io_buf_bytes & (page_sz - 1)) != 0 {
            return Err(UblkError::InvalidVal);
        }
        Ok(())
    }

    fn dev_info(&self) -> sys::ublksrv_ctrl_dev_info {
        sys::ublksrv_ctrl_dev_info {
            nr_hw_queues: self.nr_queues,
            queue_depth: self.depth,
            max_io_buf_bytes: self.io_buf_bytes,
            dev_id: if self.id < 0 {
                sys::UBLK_DEV_ID_AUTO
            } else {
                self.id as u32
            },
            flags: self.ctrl_flags,
            ..Default::default()
        }
    }

    /// ADD_DEV + SET_PARAMS: create the kernel device and leave it
    /// configured, ready for [`UblkDevice::start`]. The kernel device is
    /// deleted again if SET_PARAMS fails.
    pub fn create<'a>(
        self,
        ctrl: &'a mut UblkCtrl,
        params: &sys::ublk_params,
    ) -> Result<UblkDevice<'a>, UblkError> {
        self.validate()?;

        let mut info = self.dev_info();
        ctrl.add_dev(&mut info)?;

        let mut dev = UblkDevice {
            ctrl,
            info,
            start_delay: self.start_delay,
            cdev_per_queue: self.cdev_per_queue,
            state: DevState::Created,
            deleted: false,
            stop_flag: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
        };

        // on failure the drop of `dev` deletes the kernel device again
        dev.ctrl.set_params(dev.info.dev_id, params)?;
        dev.state = DevState::Configured;
        Ok(dev)
    }
}

/// Linear lifecycle of an orchestrated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevState {
    Created,
    Configured,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// One ublk device plus its queue threads.
///
/// Borrows the controller for the device's whole life; owns the thread
/// handles and the shared stop flag. Dropping the device stops it if still
/// running and always attempts DEL_DEV.
pub struct UblkDevice<'a> {
    ctrl: &'a mut UblkCtrl,
    info: sys::ublksrv_ctrl_dev_info,
    start_delay: Duration,
    cdev_per_queue: bool,
    state: DevState,
    deleted: bool,
    stop_flag: Arc<AtomicBool>,
    threads: Vec<JoinHandle<Result<(), UblkError>>>,
}

/// The char device may take a moment to appear after ADD_DEV while udev
/// finishes its work, so the open is retried for up to 3 seconds.
fn open_cdev(path: &str) -> Result<fs::File, UblkError> {
    for _ in 0..300 {
        match fs::OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => return Ok(f),
            Err(_) => std::thread::sleep(Duration::from_millis(10)),
        }
    }
    Err(UblkError::IOError(std::io::Error::from_raw_os_error(
        libc::EACCES,
    )))
}

fn apply_affinity(affinity: &UblkQueueAffinity) {
    if affinity.is_empty() {
        return;
    }
    unsafe {
        libc::pthread_setaffinity_np(
            libc::pthread_self(),
            affinity.buf_len(),
            affinity.addr() as *const libc::cpu_set_t,
        );
    }
}

/// Body of one queue thread: pin to the queue's cpuset, build and arm the
/// queue, report readiness, then serve completions until told to stop or
/// the queue drains after an abort.
///
/// Setup failures are delivered through `ready` (the spawner is waiting on
/// it); failures after readiness travel through the join handle.
fn queue_worker<T: UblkTarget + ?Sized>(
    q_id: u16,
    info: sys::ublksrv_ctrl_dev_info,
    cdev: fs::File,
    affinity: UblkQueueAffinity,
    stop: Arc<AtomicBool>,
    ready: mpsc::Sender<Result<(), UblkError>>,
    target: Arc<T>,
) -> Result<(), UblkError> {
    apply_affinity(&affinity);

    let mut queue = match UblkQueue::new(q_id, &info, cdev) {
        Ok(q) => q,
        Err(e) => {
            let _ = ready.send(Err(e));
            return Ok(());
        }
    };
    if let Err(e) = queue.prime() {
        let _ = ready.send(Err(e));
        return Ok(());
    }
    let _ = ready.send(Ok(()));

    let mut handler = |ctx: &crate::io::UblkQueueCtx,
                       tag: u16,
                       iod: &sys::ublksrv_io_desc,
                       buf: &mut [u8]| target.handle_io(ctx, tag, iod, buf);

    loop {
        if stop.load(Ordering::Acquire) && queue.is_stopping() {
            break;
        }
        match queue.process_completions(&mut handler) {
            Ok(_) => {}
            Err(UblkError::QueueIsDown) => break,
            Err(e) => {
                log::error!("dev {} queue {} failed: {}", info.dev_id, q_id, e);
                return Err(e);
            }
        }
    }

    trace!("dev {} queue {} exits", info.dev_id, q_id);
    Ok(())
}

impl UblkDevice<'_> {
    pub fn dev_id(&self) -> u32 {
        self.info.dev_id
    }

    pub fn dev_info(&self) -> &sys::ublksrv_ctrl_dev_info {
        &self.info
    }

    pub fn state(&self) -> DevState {
        self.state
    }

    /// Path of the block device this kernel device exposes once running.
    pub fn bdev_path(&self) -> String {
        crate::bdev_path(self.info.dev_id)
    }

    /// Fresh device info from the driver (the controller is exclusively
    /// borrowed while the device exists, so queries go through here).
    pub fn read_dev_info(&mut self) -> Result<sys::ublksrv_ctrl_dev_info, UblkError> {
        self.ctrl.get_dev_info(self.info.dev_id)
    }

    /// The device's parameters as the driver holds them.
    pub fn read_params(&mut self) -> Result<sys::ublk_params, UblkError> {
        self.ctrl.get_params(self.info.dev_id)
    }

    /// Bring the device online with `target` serving its IO.
    ///
    /// Queues are built and armed strictly one after another - arming
    /// concurrently has been seen to race in the driver's queue
    /// registration - then the configured settle delay is honoured and
    /// START_DEV issued, which returns once the driver has seen every
    /// queue thread inside its io wait. Any failure tears down all spawned
    /// threads and deletes the kernel device.
    pub fn start<T: UblkTarget + 'static>(&mut self, target: Arc<T>) -> Result<(), UblkError> {
        if self.state != DevState::Configured {
            return Err(UblkError::InvalidVal);
        }
        self.state = DevState::Starting;

        let path = cdev_path(self.info.dev_id);
        let shared_cdev = if self.cdev_per_queue {
            None
        } else {
            Some(open_cdev(&path)?)
        };

        let (tx, rx) = mpsc::channel();
        for q in 0..self.info.nr_hw_queues {
            let affinity = match self.ctrl.get_queue_affinity(self.info.dev_id, q) {
                Ok(a) => a,
                Err(e) => {
                    self.teardown();
                    return Err(e);
                }
            };
            let cdev = {
                let opened = match &shared_cdev {
                    Some(f) => f.try_clone().map_err(UblkError::IOError),
                    None => open_cdev(&path),
                };
                match opened {
                    Ok(f) => f,
                    Err(e) => {
                        self.teardown();
                        return Err(e);
                    }
                }
            };

            let info = self.info;
            let stop = Arc::clone(&self.stop_flag);
            let tgt = Arc::clone(&target);
            let ready = tx.clone();
            self.threads.push(std::thread::spawn(move || {
                queue_worker(q, info, cdev, affinity, stop, ready, tgt)
            }));

            // wait for this queue to be armed before building the next one
            match rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.teardown();
                    return Err(e);
                }
                Err(_) => {
                    self.teardown();
                    return Err(UblkError::OtherError(-libc::EIO));
                }
            }
        }

        // let the driver observe every queue parked in io_uring_enter
        std::thread::sleep(self.start_delay);

        if let Err(e) = self.ctrl.start_dev(self.info.dev_id) {
            self.teardown();
            return Err(e);
        }

        self.state = DevState::Running;
        Ok(())
    }

    /// Take the device offline: signal the queue threads, issue STOP_DEV
    /// (which completes their pending waits), join them and surface the
    /// first error any of them hit.
    pub fn stop(&mut self) -> Result<(), UblkError> {
        match self.state {
            DevState::Running | DevState::Starting => {}
            _ => return Ok(()),
        }
        self.state = DevState::Stopping;

        self.stop_flag.store(true, Ordering::Release);
        let mut first_err = self.ctrl.stop_dev(self.info.dev_id).err();

        for handle in self.threads.drain(..) {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(_) => {
                    if first_err.is_none() {
                        first_err = Some(UblkError::OtherError(-libc::EIO));
                    }
                }
            }
        }

        self.state = DevState::Stopped;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Failure path while starting: make the queue threads give up,
    /// destroy the kernel device (which aborts their pending fetches) and
    /// join everything.
    fn teardown(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Err(e) = self.ctrl.stop_dev(self.info.dev_id) {
            trace!("teardown stop of dev {}: {}", self.info.dev_id, e);
        }
        self.delete();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.state = DevState::Stopped;
    }

    fn delete(&mut self) {
        if self.deleted {
            return;
        }
        self.deleted = true;
        if let Err(e) = self.ctrl.del_dev(self.info.dev_id) {
            // may already be gone via other tooling
            trace!("delete of dev {}: {}", self.info.dev_id, e);
        }
    }
}

impl Drop for UblkDevice<'_> {
    fn drop(&mut self) {
        if matches!(self.state, DevState::Running | DevState::Starting) {
            if let Err(e) = self.stop() {
                trace!("stop of dev {} on drop: {}", self.info.dev_id, e);
            }
        }
        self.delete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let b = DeviceBuilder::default();
        assert_eq!(b, DeviceBuilder::default().id(-1).nr_queues(1).depth(64));
        assert!(b.validate().is_ok());
    }

    #[test]
    fn test_builder_validation() {
        assert!(DeviceBuilder::default().nr_queues(0).validate().is_err());
        assert!(DeviceBuilder::default().nr_queues(64).validate().is_err());
        assert!(DeviceBuilder::default().depth(100).validate().is_err());
        assert!(DeviceBuilder::default()
            .io_buf_bytes(1000)
            .validate()
            .is_err());
        assert!(DeviceBuilder::default()
            .depth(128)
            .io_buf_bytes(64 << 10)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_builder_dev_info() {
        let info = DeviceBuilder::default()
            .nr_queues(4)
            .depth(128)
            .io_buf_bytes(64 << 10)
            .dev_info();
        assert_eq!(info.nr_hw_queues, 4);
        assert_eq!(info.queue_depth, 128);
        assert_eq!(info.max_io_buf_bytes, 64 << 10);
        assert_eq!(info.dev_id, sys::UBLK_DEV_ID_AUTO);

        let info = DeviceBuilder::default().id(7).dev_info();
        assert_eq!(info.dev_id, 7);
    }
}
