//! Per-queue IO path: the descriptor and buffer mappings, the
//! fetch/commit state machine and the completion loop that drives a
//! target.
//!
//! Each hardware queue is serviced by exactly one thread which owns the
//! whole queue: its ring, its char-device handle, both mappings and the
//! per-tag states. Nothing here is shared between queues, so no locking is
//! needed below the target itself.

use crate::uring::{Cqe32, Ring, RingError};
use crate::{sys, UblkError};
use log::trace;
use std::fs;
use std::os::unix::io::AsRawFd;
use std::ptr;

/// CQEs drained per loop iteration.
const CQES_BATCH: usize = 64;

/// Set in `user_data` when the command re-arms a tag after a commit, clear
/// for the initial fetch. Tag and queue id live in the low 32 bits.
const USER_DATA_COMMIT: u64 = 1 << 63;

#[inline(always)]
pub fn build_user_data(q_id: u16, tag: u16, commit: bool) -> u64 {
    tag as u64 | (q_id as u64) << 16 | if commit { USER_DATA_COMMIT } else { 0 }
}

#[inline(always)]
pub fn user_data_to_tag(user_data: u64) -> u16 {
    (user_data & 0xffff) as u16
}

#[inline(always)]
pub fn user_data_to_qid(user_data: u64) -> u16 {
    ((user_data >> 16) & 0xffff) as u16
}

#[inline(always)]
pub fn user_data_is_commit(user_data: u64) -> bool {
    (user_data & USER_DATA_COMMIT) != 0
}

/// State of one tag. Transitions happen only on the queue's own thread:
/// a fetch or commit completion moves the tag to `Owned` (or `Aborted` on a
/// negative result), dispatching the next command moves it back in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagState {
    /// FETCH_REQ (or the fetch half of a commit) submitted, no request yet
    FetchInFlight,
    /// descriptor valid, target running or about to run
    Owned,
    /// COMMIT_AND_FETCH_REQ submitted, result pending
    CommitInFlight,
    /// terminal: the kernel completed this tag with a negative result
    Aborted,
}

/// Identity of a queue, handed to targets alongside each request so they
/// can tell queues apart without borrowing the queue itself.
#[derive(Debug, Clone, Copy)]
pub struct UblkQueueCtx {
    pub dev_id: u32,
    pub q_id: u16,
    pub depth: u32,
    pub buf_bytes: usize,
}

/// Result of a target invocation: zero or positive for success, a negative
/// Linux errno for failure. Passed through to the driver unchanged on
/// failure.
pub type IoResult = i32;

#[inline(always)]
fn round_up(val: u32, rnd: u32) -> u32 {
    (val + rnd - 1) & !(rnd - 1)
}

fn page_size() -> u32 {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u32 }
}

/// One hardware queue of a ublk device.
///
/// Holds a ring of exactly the queue depth, the read-only descriptor
/// region mapped from /dev/ublkcN, one anonymous buffer region of
/// `depth * max_io_buf_bytes` whose addresses are lent to the kernel for
/// the queue's whole lifetime, and the per-tag state array.
pub struct UblkQueue {
    q_id: u16,
    q_depth: u32,
    dev_id: u32,
    cdev: fs::File,
    ring: Ring,

    io_cmd_buf: *const sys::ublksrv_io_desc,
    cmd_buf_len: usize,

    io_buf: *mut u8,
    io_buf_len: usize,
    /// fixed per-tag buffer stride, the device's max_io_buf_bytes
    buf_bytes: usize,

    tags: Vec<TagState>,
    cmd_inflight: u32,
    stopping: bool,
}

// All raw pointers target mappings owned by the queue; the queue moves to
// its thread once and stays there.
unsafe impl Send for UblkQueue {}

impl UblkQueue {
    /// Build the queue for `q_id` of the device described by `info`,
    /// taking ownership of an open /dev/ublkcN handle. Whether that handle
    /// is a fresh open or a duplicated descriptor is the caller's choice.
    pub fn new(
        q_id: u16,
        info: &sys::ublksrv_ctrl_dev_info,
        cdev: fs::File,
    ) -> Result<UblkQueue, UblkError> {
        if q_id >= info.nr_hw_queues || info.queue_depth == 0 {
            return Err(UblkError::InvalidVal);
        }
        let depth = info.queue_depth as u32;
        let buf_bytes = info.max_io_buf_bytes as usize;
        if buf_bytes == 0 {
            return Err(UblkError::InvalidVal);
        }

        let ring = Ring::new(depth)?;

        // each queue's descriptor slot in the char device is sized for the
        // maximum depth; ours only needs `depth` descriptors
        let page_sz = page_size();
        let desc_bytes = core::mem::size_of::<sys::ublksrv_io_desc>() as u32;
        let max_cmd_buf_sz = round_up(sys::UBLK_MAX_QUEUE_DEPTH * desc_bytes, page_sz);
        let cmd_buf_len = round_up(depth * desc_bytes, page_sz) as usize;
        let off = sys::UBLKSRV_CMD_BUF_OFFSET as libc::off_t
            + q_id as libc::off_t * max_cmd_buf_sz as libc::off_t;

        let io_cmd_buf = unsafe {
            libc::mmap(
                ptr::null_mut(),
                cmd_buf_len,
                libc::PROT_READ,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                cdev.as_raw_fd(),
                off,
            )
        };
        if io_cmd_buf == libc::MAP_FAILED {
            return Err(UblkError::Mmap(std::io::Error::last_os_error()));
        }

        let io_buf_len = depth as usize * buf_bytes;
        let io_buf = unsafe {
            libc::mmap(
                ptr::null_mut(),
                io_buf_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if io_buf == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            unsafe { libc::munmap(io_cmd_buf, cmd_buf_len) };
            return Err(UblkError::Mmap(err));
        }

        log::info!("dev {} queue {} created, depth {}", info.dev_id, q_id, depth);

        Ok(UblkQueue {
            q_id,
            q_depth: depth,
            dev_id: info.dev_id,
            cdev,
            ring,
            io_cmd_buf: io_cmd_buf as *const sys::ublksrv_io_desc,
            cmd_buf_len,
            io_buf: io_buf as *mut u8,
            io_buf_len,
            buf_bytes,
            tags: vec![TagState::FetchInFlight; depth as usize],
            cmd_inflight: 0,
            stopping: false,
        })
    }

    #[inline(always)]
    pub fn depth(&self) -> u32 {
        self.q_depth
    }

    #[inline(always)]
    pub fn q_id(&self) -> u16 {
        self.q_id
    }

    #[inline(always)]
    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    #[inline(always)]
    pub fn ctx(&self) -> UblkQueueCtx {
        UblkQueueCtx {
            dev_id: self.dev_id,
            q_id: self.q_id,
            depth: self.q_depth,
            buf_bytes: self.buf_bytes,
        }
    }

    #[inline(always)]
    pub fn tag_state(&self, tag: u16) -> TagState {
        self.tags[tag as usize]
    }

    #[inline(always)]
    fn buf_addr(&self, tag: u16) -> *mut u8 {
        debug_assert!((tag as u32) < self.q_depth);
        unsafe { self.io_buf.add(tag as usize * self.buf_bytes) }
    }

    /// The descriptor the kernel wrote for `tag`. The region is written by
    /// the kernel at any time while the tag is armed, so the read is
    /// volatile and only meaningful after the tag's completion was seen.
    #[inline(always)]
    pub fn read_iod(&self, tag: u16) -> sys::ublksrv_io_desc {
        debug_assert!((tag as u32) < self.q_depth);
        unsafe { ptr::read_volatile(self.io_cmd_buf.add(tag as usize)) }
    }

    /// Push one FETCH/COMMIT command. On a full submission queue the
    /// pending entries are flushed once and the push retried.
    fn queue_io_cmd(&mut self, tag: u16, cmd_op: u32, result: i32) -> Result<(), UblkError> {
        if self.stopping {
            return Ok(());
        }

        let io_cmd = sys::ublksrv_io_cmd {
            q_id: self.q_id,
            tag,
            result,
            addr: self.buf_addr(tag) as u64,
        };
        let data = build_user_data(
            self.q_id,
            tag,
            cmd_op == sys::UBLK_U_IO_COMMIT_AND_FETCH_REQ,
        );
        let cdev_fd = self.cdev.as_raw_fd();
        let buf = unsafe { core::mem::transmute::<sys::ublksrv_io_cmd, [u8; 16]>(io_cmd) };

        for _ in 0..2 {
            match self.ring.get_sqe() {
                Ok(sqe) => {
                    sqe.prep_uring_cmd(cdev_fd, cmd_op, data, &buf);
                    self.cmd_inflight += 1;
                    trace!(
                        "queue_io_cmd: qid {} tag {} cmd {:x} res {}",
                        self.q_id,
                        tag,
                        cmd_op,
                        result
                    );
                    return Ok(());
                }
                Err(RingError::SubmissionQueueFull) => {
                    self.ring.submit()?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(RingError::SubmissionQueueFull.into())
    }

    /// Arm every tag with a FETCH_REQ and flush them in one submit. Must
    /// run before START_DEV; the driver refuses to start a device whose
    /// queues are not fully armed.
    pub fn prime(&mut self) -> Result<(), UblkError> {
        for tag in 0..self.q_depth as u16 {
            self.tags[tag as usize] = TagState::FetchInFlight;
            self.queue_io_cmd(tag, sys::UBLK_U_IO_FETCH_REQ, 0)?;
        }
        self.ring.submit()?;
        log::info!("dev {} queue {} armed", self.dev_id, self.q_id);
        Ok(())
    }

    /// Commit `result` for an owned tag and re-arm it.
    fn commit_and_fetch(&mut self, tag: u16, result: i32) -> Result<(), UblkError> {
        self.queue_io_cmd(tag, sys::UBLK_U_IO_COMMIT_AND_FETCH_REQ, result)?;
        self.tags[tag as usize] = TagState::CommitInFlight;
        Ok(())
    }

    /// Block for at least one completion and handle the batch.
    ///
    /// For every completed tag the descriptor is read and the target is
    /// invoked with the tag's buffer; its result is committed back
    /// (`nr_sectors * 512` on success, the negative errno unchanged on
    /// failure) together with the re-arm of the tag. Zero-sized
    /// descriptors are keep-alives and are committed immediately without a
    /// target call; completions with a negative result leave their tag
    /// aborted.
    ///
    /// Returns the number of completions handled, or `QueueIsDown` once
    /// the queue is stopping and fully drained.
    pub fn process_completions<F>(&mut self, target: &mut F) -> Result<usize, UblkError>
    where
        F: FnMut(&UblkQueueCtx, u16, &sys::ublksrv_io_desc, &mut [u8]) -> IoResult,
    {
        if self.stopping && self.cmd_inflight == 0 {
            return Err(UblkError::QueueIsDown);
        }

        self.ring.submit_and_wait(1)?;

        let mut cqes = [Cqe32::default(); CQES_BATCH];
        let n = self.ring.copy_cqes(&mut cqes);
        if n == 0 {
            // the wait returned without any completion materialising
            return Err(UblkError::NoCompletion);
        }

        let ctx = self.ctx();
        for cqe in &cqes[..n] {
            let tag = user_data_to_tag(cqe.user_data);
            debug_assert_eq!(user_data_to_qid(cqe.user_data), self.q_id);
            self.cmd_inflight = self.cmd_inflight.saturating_sub(1);

            if cqe.res < 0 {
                // terminal for this tag; ENODEV means the device is going
                // away and nothing will be re-armed
                trace!(
                    "dev {} qid {} tag {}: res {}, aborted",
                    self.dev_id,
                    self.q_id,
                    tag,
                    cqe.res
                );
                self.tags[tag as usize] = TagState::Aborted;
                if cqe.res == sys::UBLK_IO_RES_ABORT {
                    self.stopping = true;
                }
                continue;
            }

            let iod = self.read_iod(tag);

            // zero-sized descriptor: keep-alive, commit success right away
            if (iod.op_flags & 0xff) == 0 && iod.nr_sectors == 0 {
                self.commit_and_fetch(tag, 0)?;
                continue;
            }

            self.tags[tag as usize] = TagState::Owned;
            // valid only for the duration of the call; the same memory is
            // re-lent to the kernel by the commit below
            let buf =
                unsafe { std::slice::from_raw_parts_mut(self.buf_addr(tag), self.buf_bytes) };
            let res = target(&ctx, tag, &iod, buf);

            let commit_res = if res >= 0 {
                (iod.nr_sectors << 9) as i32
            } else {
                res
            };
            self.commit_and_fetch(tag, commit_res)?;
        }

        self.ring.submit()?;
        Ok(n)
    }
}

impl Drop for UblkQueue {
    fn drop(&mut self) {
        trace!("dev {} queue {} dropped", self.dev_id, self.q_id);
        // unmap so the char device can be released
        unsafe {
            libc::munmap(self.io_buf as *mut libc::c_void, self.io_buf_len);
            libc::munmap(self.io_cmd_buf as *mut libc::c_void, self.cmd_buf_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_data_packing() {
        let data = build_user_data(3, 42, false);
        assert_eq!(user_data_to_tag(data), 42);
        assert_eq!(user_data_to_qid(data), 3);
        assert!(!user_data_is_commit(data));

        let data = build_user_data(0xffff, 0xffff, true);
        assert_eq!(user_data_to_tag(data), 0xffff);
        assert_eq!(user_data_to_qid(data), 0xffff);
        assert!(user_data_is_commit(data));
    }

    #[test]
    fn test_user_data_fields_do_not_overlap() {
        let a = build_user_data(1, 0, true);
        let b = build_user_data(0, 1, true);
        assert_ne!(a, b);
        assert_eq!(user_data_to_tag(a), 0);
        assert_eq!(user_data_to_qid(b), 0);
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
        // a 64-deep queue's descriptors fit one page
        assert_eq!(round_up(64 * 24, 4096), 4096);
    }

    #[test]
    fn test_commit_result_rule() {
        // success commits the request's byte count, failure the errno
        let iod = sys::ublksrv_io_desc {
            op_flags: sys::UblkOp::READ as u32,
            nr_sectors: 8,
            start_sector: 0,
            addr: 0,
        };
        let success: IoResult = 0;
        let failure: IoResult = -libc::EOPNOTSUPP;
        let commit = |res: IoResult| if res >= 0 { (iod.nr_sectors << 9) as i32 } else { res };
        assert_eq!(commit(success), 4096);
        assert_eq!(commit(failure), -95);
    }
}
