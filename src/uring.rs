//! Minimal io_uring ring in SQE128/CQE32 mode.
//!
//! `URING_CMD` submissions need 128-byte submission entries and 32-byte
//! completion entries, a geometry the common wrapper crates do not expose,
//! so the ring is driven directly: `io_uring_setup`/`io_uring_enter`
//! syscalls, one shared mapping for both rings (the kernel must report
//! `IORING_FEAT_SINGLE_MMAP`) and one mapping for the SQE array.
//!
//! Ordering with the kernel is expressed purely through the shared head and
//! tail counters: stores into an SQE slot and the SQ index array happen
//! before the Release store of the SQ tail, and CQEs are read only after an
//! Acquire load of the CQ tail, with the consumed head published by a
//! Release store. The counters are free-running u32 values; every index
//! computation wraps and masks.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

pub const IORING_SETUP_SQE128: u32 = 1 << 10;
pub const IORING_SETUP_CQE32: u32 = 1 << 11;
pub const IORING_FEAT_SINGLE_MMAP: u32 = 1 << 0;
pub const IORING_ENTER_GETEVENTS: u32 = 1 << 0;
pub const IORING_OP_URING_CMD: u8 = 46;

const IORING_OFF_SQ_RING: libc::off_t = 0;
const IORING_OFF_SQES: libc::off_t = 0x1000_0000;

/// 80-byte command area of a 128-byte SQE, bytes 48..128.
pub const URING_CMD_AREA: usize = 80;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RingError {
    #[error("ring entries must be a nonzero power of two")]
    InvalidArgument,

    #[error("per-process file descriptor limit reached")]
    ProcessFdQuotaExceeded,

    #[error("system-wide file descriptor limit reached")]
    SystemFdQuotaExceeded,

    #[error("kernel ran out of resources for the ring")]
    SystemResources,

    #[error("io_uring creation not permitted")]
    PermissionDenied,

    #[error("kernel too old: IORING_FEAT_SINGLE_MMAP not supported")]
    SystemOutdated,

    #[error("ring mmap failed: errno {0}")]
    MmapFailed(i32),

    #[error("submission queue is full")]
    SubmissionQueueFull,

    #[error("ring file descriptor is invalid")]
    FileDescriptorInvalid,

    #[error("completion queue overcommitted")]
    CompletionQueueOvercommitted,

    #[error("submission queue entry is invalid")]
    SubmissionQueueEntryInvalid,

    #[error("submission references a faulting buffer")]
    BufferInvalid,

    #[error("unexpected io_uring errno {0}")]
    Unexpected(i32),
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct io_sqring_offsets {
    head: u32,
    tail: u32,
    ring_mask: u32,
    ring_entries: u32,
    flags: u32,
    dropped: u32,
    array: u32,
    resv1: u32,
    user_addr: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct io_cqring_offsets {
    head: u32,
    tail: u32,
    ring_mask: u32,
    ring_entries: u32,
    overflow: u32,
    cqes: u32,
    flags: u32,
    resv1: u32,
    user_addr: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct io_uring_params {
    sq_entries: u32,
    cq_entries: u32,
    flags: u32,
    sq_thread_cpu: u32,
    sq_thread_idle: u32,
    features: u32,
    wq_fd: u32,
    resv: [u32; 3],
    sq_off: io_sqring_offsets,
    cq_off: io_cqring_offsets,
}

/// 128-byte submission queue entry. The first 48 bytes follow the classic
/// SQE layout; for `URING_CMD` the ioctl-encoded command number lives in
/// the low half of `off` and the command record in `cmd`.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct Sqe128 {
    pub opcode: u8,
    pub flags: u8,
    pub ioprio: u16,
    pub fd: i32,
    pub off: u64,
    pub addr: u64,
    pub len: u32,
    pub op_flags: u32,
    pub user_data: u64,
    pub buf_index: u16,
    pub personality: u16,
    pub splice_fd_in: i32,
    pub cmd: [u8; URING_CMD_AREA],
}

impl Sqe128 {
    /// Prepare this (already zeroed) entry as a URING_CMD against `fd`.
    /// `cmd_op` is the ioctl-encoded command number and `cmd` the command
    /// record for the 80-byte area; trailing bytes stay zero.
    pub fn prep_uring_cmd(&mut self, fd: RawFd, cmd_op: u32, user_data: u64, cmd: &[u8]) {
        debug_assert!(cmd.len() <= URING_CMD_AREA);
        self.opcode = IORING_OP_URING_CMD;
        self.fd = fd;
        self.off = cmd_op as u64;
        self.user_data = user_data;
        self.cmd[..cmd.len()].copy_from_slice(cmd);
    }
}

/// 32-byte completion queue entry: the classic 16 bytes plus the extended
/// pair that URING_CMD completions may carry.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct Cqe32 {
    pub user_data: u64,
    pub res: i32,
    pub flags: u32,
    pub big_cqe: [u64; 2],
}

const _: () = assert!(core::mem::size_of::<Sqe128>() == 128);
const _: () = assert!(core::mem::size_of::<Cqe32>() == 32);

/// One io_uring instance in large-entry mode.
///
/// The ring is single-owner: one thread prepares, submits and reaps. The
/// only party on the other side of the shared counters is the kernel.
pub struct Ring {
    fd: OwnedFd,

    ring_ptr: *mut libc::c_void,
    ring_len: usize,
    sqes_ptr: *mut Sqe128,
    sqes_len: usize,

    sq_head: *const AtomicU32,
    sq_tail: *const AtomicU32,
    sq_mask: u32,
    sq_entries: u32,
    sq_array: *mut u32,

    cq_head: *const AtomicU32,
    cq_tail: *const AtomicU32,
    cq_mask: u32,
    cqes: *const Cqe32,

    /// sqes handed out but not yet flushed to the kernel's index array
    local_head: u32,
    local_tail: u32,
}

// The raw pointers target the ring mappings owned by this struct; the
// shared counters are atomics. Moving the ring to its queue thread is fine,
// sharing it is not.
unsafe impl Send for Ring {}

fn setup_errno_to_error(errno: i32) -> RingError {
    match errno {
        libc::EINVAL => RingError::InvalidArgument,
        libc::EMFILE => RingError::ProcessFdQuotaExceeded,
        libc::ENFILE => RingError::SystemFdQuotaExceeded,
        libc::ENOMEM | libc::EAGAIN => RingError::SystemResources,
        libc::EPERM => RingError::PermissionDenied,
        other => RingError::Unexpected(other),
    }
}

fn enter_errno_to_error(errno: i32) -> RingError {
    match errno {
        libc::EAGAIN => RingError::SystemResources,
        libc::EBADF => RingError::FileDescriptorInvalid,
        libc::EBUSY => RingError::CompletionQueueOvercommitted,
        libc::EINVAL => RingError::SubmissionQueueEntryInvalid,
        libc::EFAULT => RingError::BufferInvalid,
        other => RingError::Unexpected(other),
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl Ring {
    /// Create a ring with `entries` submission slots. `entries` must be a
    /// nonzero power of two; the kernel must support SQE128/CQE32 and the
    /// single-mmap layout.
    pub fn new(entries: u32) -> Result<Ring, RingError> {
        if entries == 0 || !entries.is_power_of_two() {
            return Err(RingError::InvalidArgument);
        }

        let mut params = io_uring_params {
            flags: IORING_SETUP_SQE128 | IORING_SETUP_CQE32,
            ..Default::default()
        };

        let fd = unsafe {
            libc::syscall(
                libc::SYS_io_uring_setup,
                entries as libc::c_uint,
                &mut params as *mut io_uring_params,
            )
        };
        if fd < 0 {
            return Err(setup_errno_to_error(last_errno()));
        }
        // from_raw_fd takes ownership; the fd is closed on every early return
        let fd = unsafe { OwnedFd::from_raw_fd(fd as RawFd) };

        if (params.features & IORING_FEAT_SINGLE_MMAP) == 0 {
            return Err(RingError::SystemOutdated);
        }
        if !params.sq_entries.is_power_of_two() || !params.cq_entries.is_power_of_two() {
            return Err(RingError::InvalidArgument);
        }

        let sq_len = params.sq_off.array as usize + params.sq_entries as usize * 4;
        let cq_len =
            params.cq_off.cqes as usize + params.cq_entries as usize * core::mem::size_of::<Cqe32>();
        let ring_len = sq_len.max(cq_len);

        let ring_ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                ring_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd.as_raw_fd(),
                IORING_OFF_SQ_RING,
            )
        };
        if ring_ptr == libc::MAP_FAILED {
            return Err(RingError::MmapFailed(last_errno()));
        }

        let sqes_len = params.sq_entries as usize * core::mem::size_of::<Sqe128>();
        let sqes_ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                sqes_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd.as_raw_fd(),
                IORING_OFF_SQES,
            )
        };
        if sqes_ptr == libc::MAP_FAILED {
            let errno = last_errno();
            unsafe { libc::munmap(ring_ptr, ring_len) };
            return Err(RingError::MmapFailed(errno));
        }

        let base = ring_ptr as *const u8;
        let ring = unsafe {
            Ring {
                sq_head: base.add(params.sq_off.head as usize) as *const AtomicU32,
                sq_tail: base.add(params.sq_off.tail as usize) as *const AtomicU32,
                sq_mask: *(base.add(params.sq_off.ring_mask as usize) as *const u32),
                sq_entries: params.sq_entries,
                sq_array: base.add(params.sq_off.array as usize) as *mut u32,
                cq_head: base.add(params.cq_off.head as usize) as *const AtomicU32,
                cq_tail: base.add(params.cq_off.tail as usize) as *const AtomicU32,
                cq_mask: *(base.add(params.cq_off.ring_mask as usize) as *const u32),
                cqes: base.add(params.cq_off.cqes as usize) as *const Cqe32,
                fd,
                ring_ptr,
                ring_len,
                sqes_ptr: sqes_ptr as *mut Sqe128,
                sqes_len,
                local_head: 0,
                local_tail: 0,
            }
        };

        log::trace!(
            "ring created: fd {} sq {} cq {}",
            ring.fd.as_raw_fd(),
            params.sq_entries,
            params.cq_entries
        );
        Ok(ring)
    }

    #[inline(always)]
    pub fn entries(&self) -> u32 {
        self.sq_entries
    }

    /// Hand out the next free SQE slot, zero-filled. The entry becomes
    /// visible to the kernel only on the next submit.
    pub fn get_sqe(&mut self) -> Result<&mut Sqe128, RingError> {
        let head = unsafe { (*self.sq_head).load(Ordering::Acquire) };
        if self.local_tail.wrapping_sub(head) >= self.sq_entries {
            return Err(RingError::SubmissionQueueFull);
        }

        let idx = (self.local_tail & self.sq_mask) as usize;
        self.local_tail = self.local_tail.wrapping_add(1);
        unsafe {
            let slot = self.sqes_ptr.add(idx);
            ptr::write_bytes(slot as *mut u8, 0, core::mem::size_of::<Sqe128>());
            Ok(&mut *slot)
        }
    }

    /// Publish locally prepared SQEs: copy their indices into the shared
    /// array and Release-store the new tail. Returns how many entries the
    /// kernel has not consumed yet, the `to_submit` for io_uring_enter.
    fn flush_sq(&mut self) -> u32 {
        if self.local_head != self.local_tail {
            let mut tail = unsafe { (*self.sq_tail).load(Ordering::Relaxed) };
            while self.local_head != self.local_tail {
                unsafe {
                    ptr::write_volatile(
                        self.sq_array.add((tail & self.sq_mask) as usize),
                        self.local_head & self.sq_mask,
                    );
                }
                tail = tail.wrapping_add(1);
                self.local_head = self.local_head.wrapping_add(1);
            }
            // publication barrier: the entry and array stores above must be
            // visible before the kernel observes the new tail
            unsafe { (*self.sq_tail).store(tail, Ordering::Release) };
        }

        let tail = unsafe { (*self.sq_tail).load(Ordering::Relaxed) };
        let head = unsafe { (*self.sq_head).load(Ordering::Acquire) };
        tail.wrapping_sub(head)
    }

    /// Flush prepared SQEs to the kernel without waiting.
    pub fn submit(&mut self) -> Result<u32, RingError> {
        self.submit_and_wait(0)
    }

    /// Flush prepared SQEs and block until at least `wait_nr` completions
    /// are available. Returns the kernel-reported submit count. EINTR while
    /// waiting is retried in place; the kernel clamps `to_submit` to what
    /// is still unconsumed, so the retry cannot double-submit.
    pub fn submit_and_wait(&mut self, wait_nr: u32) -> Result<u32, RingError> {
        let to_submit = self.flush_sq();
        if to_submit == 0 && wait_nr == 0 {
            return Ok(0);
        }

        let flags = if wait_nr > 0 { IORING_ENTER_GETEVENTS } else { 0 };
        loop {
            let ret = unsafe {
                libc::syscall(
                    libc::SYS_io_uring_enter,
                    self.fd.as_raw_fd(),
                    to_submit as libc::c_uint,
                    wait_nr as libc::c_uint,
                    flags as libc::c_uint,
                    ptr::null::<libc::c_void>(),
                    0usize,
                )
            };
            if ret >= 0 {
                return Ok(ret as u32);
            }
            let errno = last_errno();
            if errno == libc::EINTR {
                continue;
            }
            return Err(enter_errno_to_error(errno));
        }
    }

    /// Completions ready to be reaped, wrap-safe.
    #[inline]
    pub fn cq_ready(&self) -> u32 {
        let tail = unsafe { (*self.cq_tail).load(Ordering::Acquire) };
        let head = unsafe { (*self.cq_head).load(Ordering::Relaxed) };
        tail.wrapping_sub(head)
    }

    /// Copy up to `out.len()` completions out of the ring and publish the
    /// consumed head. Returns the number copied.
    pub fn copy_cqes(&mut self, out: &mut [Cqe32]) -> usize {
        let tail = unsafe { (*self.cq_tail).load(Ordering::Acquire) };
        let head = unsafe { (*self.cq_head).load(Ordering::Relaxed) };
        let ready = tail.wrapping_sub(head) as usize;
        let count = ready.min(out.len());

        for (i, slot) in out.iter_mut().take(count).enumerate() {
            let idx = (head.wrapping_add(i as u32) & self.cq_mask) as usize;
            *slot = unsafe { ptr::read_volatile(self.cqes.add(idx)) };
        }

        if count > 0 {
            unsafe {
                (*self.cq_head).store(head.wrapping_add(count as u32), Ordering::Release);
            }
        }
        count
    }
}

impl AsRawFd for Ring {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.sqes_ptr as *mut libc::c_void, self.sqes_len);
            libc::munmap(self.ring_ptr, self.ring_len);
        }
        // fd closed by OwnedFd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IORING_OP_NOP: u8 = 0;

    fn test_ring(entries: u32) -> Option<Ring> {
        match Ring::new(entries) {
            Ok(r) => Some(r),
            Err(e) => {
                // io_uring may be unavailable (sysctl, old kernel, sandbox)
                eprintln!("skipping ring test: {}", e);
                None
            }
        }
    }

    #[test]
    fn test_entries_validation() {
        assert_eq!(Ring::new(0).err(), Some(RingError::InvalidArgument));
        assert_eq!(Ring::new(3).err(), Some(RingError::InvalidArgument));
    }

    #[test]
    fn test_sqe_layout() {
        let sqe = Sqe128 {
            opcode: 0,
            flags: 0,
            ioprio: 0,
            fd: 0,
            off: 0,
            addr: 0,
            len: 0,
            op_flags: 0,
            user_data: 0,
            buf_index: 0,
            personality: 0,
            splice_fd_in: 0,
            cmd: [0; URING_CMD_AREA],
        };
        let base = &sqe as *const Sqe128 as usize;
        assert_eq!(&sqe.off as *const u64 as usize - base, 8);
        assert_eq!(&sqe.user_data as *const u64 as usize - base, 32);
        assert_eq!(sqe.cmd.as_ptr() as usize - base, 48);
    }

    #[test]
    fn test_prep_uring_cmd() {
        let mut sqe: Sqe128 = unsafe { core::mem::zeroed() };
        sqe.prep_uring_cmd(7, 0xc020_7504, 0xdead_beef, &[0xaa; 32]);
        assert_eq!(sqe.opcode, IORING_OP_URING_CMD);
        assert_eq!(sqe.fd, 7);
        assert_eq!(sqe.off, 0xc020_7504);
        assert_eq!(sqe.user_data, 0xdead_beef);
        assert_eq!(sqe.cmd[31], 0xaa);
        assert_eq!(sqe.cmd[32], 0);
    }

    #[test]
    fn test_queue_full_and_nop_round_trip() {
        let depth = 8;
        let Some(mut ring) = test_ring(depth) else {
            return;
        };

        for i in 0..depth {
            let sqe = ring.get_sqe().expect("sqe within depth");
            sqe.opcode = IORING_OP_NOP;
            sqe.fd = -1;
            sqe.user_data = 0x100 + i as u64;
        }
        assert_eq!(ring.get_sqe().err(), Some(RingError::SubmissionQueueFull));

        let submitted = ring.submit_and_wait(depth).unwrap();
        assert_eq!(submitted, depth);

        let mut cqes = [Cqe32::default(); 16];
        let n = ring.copy_cqes(&mut cqes);
        assert_eq!(n, depth as usize);
        let mut seen: Vec<u64> = cqes[..n].iter().map(|c| c.user_data).collect();
        seen.sort_unstable();
        let expect: Vec<u64> = (0..depth as u64).map(|i| 0x100 + i).collect();
        assert_eq!(seen, expect);
        assert_eq!(ring.cq_ready(), 0);

        // the queue drains once completions are reaped
        assert!(ring.get_sqe().is_ok());
    }

    #[test]
    fn test_submit_without_entries() {
        let Some(mut ring) = test_ring(4) else {
            return;
        };
        assert_eq!(ring.submit().unwrap(), 0);
        assert_eq!(ring.cq_ready(), 0);
    }
}
