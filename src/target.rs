//! Target contract and the two reference targets.
//!
//! A target is the storage behind a ublk device: it is handed each request
//! descriptor together with the tag's buffer and answers with zero or a
//! positive count for success or a negative Linux errno for failure. The
//! runner owns result framing; targets never talk to the driver.

use crate::io::{IoResult, UblkQueueCtx};
use crate::sys::{self, UblkOp};
use std::sync::RwLock;

/// Storage implementation behind a device.
///
/// Called concurrently from every queue thread of the device, so
/// implementations serialise or shard internally as needed. The buffer
/// slice is only valid for the duration of the call; the runner re-lends
/// the same memory to the kernel afterwards.
pub trait UblkTarget: Send + Sync {
    fn handle_io(
        &self,
        ctx: &UblkQueueCtx,
        tag: u16,
        iod: &sys::ublksrv_io_desc,
        buf: &mut [u8],
    ) -> IoResult;
}

/// Discards writes, reads return whatever the tag buffer holds.
pub struct NullTarget;

impl UblkTarget for NullTarget {
    fn handle_io(
        &self,
        _ctx: &UblkQueueCtx,
        _tag: u16,
        iod: &sys::ublksrv_io_desc,
        buf: &mut [u8],
    ) -> IoResult {
        match UblkOp::from_op_flags(iod.op_flags) {
            UblkOp::Read | UblkOp::Write => {
                // data ops are bounded by the tag buffer
                if (iod.nr_sectors as usize) << 9 > buf.len() {
                    return -libc::EINVAL;
                }
                0
            }
            UblkOp::Flush | UblkOp::Discard | UblkOp::WriteSame | UblkOp::WriteZeroes => 0,
            _ => -libc::EOPNOTSUPP,
        }
    }
}

/// Shard granularity of [`RamTarget`].
const SHARD_BYTES: usize = 64 << 10;

/// Memory-backed target.
///
/// The byte space is split into 64 KiB shards, each behind its own rw
/// lock: a read takes the shared lock of every shard it touches, a write
/// the exclusive one. Disjoint ranges keep full parallelism across queue
/// threads while per-byte access stays serialised.
pub struct RamTarget {
    size: u64,
    shards: Vec<RwLock<Box<[u8]>>>,
}

impl RamTarget {
    pub fn new(size: u64) -> RamTarget {
        let nr_shards = (size as usize + SHARD_BYTES - 1) / SHARD_BYTES;
        let mut shards = Vec::with_capacity(nr_shards);
        for i in 0..nr_shards {
            let len = SHARD_BYTES.min(size as usize - i * SHARD_BYTES);
            shards.push(RwLock::new(vec![0u8; len].into_boxed_slice()));
        }
        RamTarget { size, shards }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn check_range(&self, iod: &sys::ublksrv_io_desc) -> Result<(u64, usize), i32> {
        let len = (iod.nr_sectors as usize) << 9;
        let start = match iod.start_sector.checked_mul(512) {
            Some(s) => s,
            None => return Err(-libc::EINVAL),
        };
        let end = match start.checked_add(len as u64) {
            Some(e) => e,
            None => return Err(-libc::EINVAL),
        };
        if end > self.size {
            return Err(-libc::EINVAL);
        }
        Ok((start, len))
    }

    /// Walk the shards a byte range touches, handing each local chunk to
    /// `f` as (shard index, offset in shard, range in the io buffer).
    fn for_each_shard<F>(&self, start: u64, len: usize, mut f: F)
    where
        F: FnMut(usize, usize, std::ops::Range<usize>),
    {
        let mut off = start as usize;
        let mut done = 0;
        while done < len {
            let shard = off / SHARD_BYTES;
            let within = off % SHARD_BYTES;
            let chunk = (SHARD_BYTES - within).min(len - done);
            f(shard, within, done..done + chunk);
            off += chunk;
            done += chunk;
        }
    }

    fn read(&self, start: u64, buf: &mut [u8]) {
        self.for_each_shard(start, buf.len(), |shard, within, range| {
            let guard = self.shards[shard]
                .read()
                .unwrap_or_else(|p| p.into_inner());
            let chunk = range.len();
            buf[range].copy_from_slice(&guard[within..within + chunk]);
        });
    }

    fn write(&self, start: u64, buf: &[u8]) {
        self.for_each_shard(start, buf.len(), |shard, within, range| {
            let mut guard = self.shards[shard]
                .write()
                .unwrap_or_else(|p| p.into_inner());
            let chunk = range.len();
            guard[within..within + chunk].copy_from_slice(&buf[range]);
        });
    }

    fn zero(&self, start: u64, len: usize) {
        self.for_each_shard(start, len, |shard, within, range| {
            let mut guard = self.shards[shard]
                .write()
                .unwrap_or_else(|p| p.into_inner());
            guard[within..within + range.len()].fill(0);
        });
    }
}

impl UblkTarget for RamTarget {
    fn handle_io(
        &self,
        _ctx: &UblkQueueCtx,
        _tag: u16,
        iod: &sys::ublksrv_io_desc,
        buf: &mut [u8],
    ) -> IoResult {
        match UblkOp::from_op_flags(iod.op_flags) {
            UblkOp::Read => match self.check_range(iod) {
                Ok((start, len)) if len <= buf.len() => {
                    self.read(start, &mut buf[..len]);
                    0
                }
                Ok(_) => -libc::EINVAL,
                Err(e) => e,
            },
            UblkOp::Write => match self.check_range(iod) {
                Ok((start, len)) if len <= buf.len() => {
                    self.write(start, &buf[..len]);
                    0
                }
                Ok(_) => -libc::EINVAL,
                Err(e) => e,
            },
            UblkOp::Flush => 0,
            // no data carried; only the device range bounds these
            UblkOp::Discard | UblkOp::WriteSame | UblkOp::WriteZeroes => {
                match self.check_range(iod) {
                    Ok((start, len)) => {
                        self.zero(start, len);
                        0
                    }
                    Err(e) => e,
                }
            }
            _ => -libc::EOPNOTSUPP,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> UblkQueueCtx {
        UblkQueueCtx {
            dev_id: 0,
            q_id: 0,
            depth: 64,
            buf_bytes: 64 << 10,
        }
    }

    fn iod(op: u8, start_sector: u64, nr_sectors: u32) -> sys::ublksrv_io_desc {
        sys::ublksrv_io_desc {
            op_flags: op as u32,
            nr_sectors,
            start_sector,
            addr: 0,
        }
    }

    #[test]
    fn test_ram_round_trip() {
        let ram = RamTarget::new(1 << 20);
        let mut buf = vec![0u8; 4096];

        buf[..30].copy_from_slice(b"UBLKSRV_RAM_DISK_TEST_12345678");
        assert_eq!(ram.handle_io(&ctx(), 0, &iod(UblkOp::WRITE, 0, 8), &mut buf), 0);

        let mut out = vec![0u8; 4096];
        assert_eq!(ram.handle_io(&ctx(), 0, &iod(UblkOp::READ, 0, 8), &mut out), 0);
        assert_eq!(&out[..30], b"UBLKSRV_RAM_DISK_TEST_12345678");
        assert_eq!(&out[30..], &buf[30..]);
    }

    #[test]
    fn test_ram_write_across_shards() {
        // one write spanning the first shard boundary
        let ram = RamTarget::new(256 << 10);
        let start_sector = ((SHARD_BYTES - 512) >> 9) as u64;
        let mut buf = vec![0xabu8; 1024];
        assert_eq!(
            ram.handle_io(&ctx(), 0, &iod(UblkOp::WRITE, start_sector, 2), &mut buf),
            0
        );

        let mut out = vec![0u8; 1024];
        assert_eq!(
            ram.handle_io(&ctx(), 0, &iod(UblkOp::READ, start_sector, 2), &mut out),
            0
        );
        assert_eq!(out, buf);
    }

    #[test]
    fn test_ram_discard_zeroes() {
        let ram = RamTarget::new(1 << 20);
        let mut buf = vec![0xffu8; 8192];
        assert_eq!(ram.handle_io(&ctx(), 0, &iod(UblkOp::WRITE, 0, 16), &mut buf), 0);
        assert_eq!(
            ram.handle_io(&ctx(), 0, &iod(UblkOp::DISCARD, 0, 8), &mut buf),
            0
        );

        let mut out = vec![0xeeu8; 8192];
        assert_eq!(ram.handle_io(&ctx(), 0, &iod(UblkOp::READ, 0, 16), &mut out), 0);
        assert!(out[..4096].iter().all(|&b| b == 0));
        assert!(out[4096..].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn test_ram_out_of_range() {
        let ram = RamTarget::new(64 << 10);
        let mut buf = vec![0u8; 4096];
        // starts beyond the end
        assert_eq!(
            ram.handle_io(&ctx(), 0, &iod(UblkOp::READ, 1 << 20, 8), &mut buf),
            -libc::EINVAL
        );
        // runs over the end
        assert_eq!(
            ram.handle_io(&ctx(), 0, &iod(UblkOp::WRITE, 127, 8), &mut buf),
            -libc::EINVAL
        );
    }

    #[test]
    fn test_unknown_op_rejected() {
        let ram = RamTarget::new(64 << 10);
        let null = NullTarget;
        let mut buf = vec![0u8; 4096];
        let bad = iod(0xc7, 0, 8);
        assert_eq!(ram.handle_io(&ctx(), 0, &bad, &mut buf), -libc::EOPNOTSUPP);
        assert_eq!(null.handle_io(&ctx(), 0, &bad, &mut buf), -libc::EOPNOTSUPP);
    }

    #[test]
    fn test_null_accepts_io() {
        let null = NullTarget;
        let mut buf = vec![0u8; 64 << 10];
        assert_eq!(null.handle_io(&ctx(), 0, &iod(UblkOp::READ, 0, 8), &mut buf), 0);
        assert_eq!(null.handle_io(&ctx(), 0, &iod(UblkOp::WRITE, 8, 8), &mut buf), 0);
        assert_eq!(null.handle_io(&ctx(), 0, &iod(UblkOp::FLUSH, 0, 0), &mut buf), 0);
        // request larger than the tag buffer
        let huge = iod(UblkOp::READ, 0, (buf.len() as u32 >> 9) + 1);
        assert_eq!(null.handle_io(&ctx(), 0, &huge, &mut buf), -libc::EINVAL);
    }
}
