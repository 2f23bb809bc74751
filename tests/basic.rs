//! Device-level tests against a live ublk driver. Every test skips unless
//! /dev/ublk-control exists and the process is privileged enough to use
//! it.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ublksrv::ctrl::UblkCtrl;
use ublksrv::device::{DeviceBuilder, UblkDevice};
use ublksrv::params::{basic_params, basic_params_with_attrs, BasicAttrs};
use ublksrv::target::{NullTarget, RamTarget};
use ublksrv::{sys, UblkError};

#[ctor::ctor]
fn init_logger() {
    let _ = env_logger::builder()
        .format_target(false)
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

fn ublk_available() -> bool {
    if !Path::new("/dev/ublk-control").exists() {
        eprintln!("skipping: /dev/ublk-control not present, run `modprobe ublk_drv`");
        return false;
    }
    if unsafe { libc::geteuid() } != 0 {
        eprintln!("skipping: not running as root");
        return false;
    }
    true
}

fn wait_for_path(path: &str, present: bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if Path::new(path).exists() == present {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

fn start_device<'a>(
    ctrl: &'a mut UblkCtrl,
    builder: DeviceBuilder,
    params: &sys::ublk_params,
    target: Arc<impl ublksrv::UblkTarget + 'static>,
) -> Result<UblkDevice<'a>, UblkError> {
    let mut dev = builder.create(ctrl, params)?;
    dev.start(target)?;
    Ok(dev)
}

#[test]
fn test_null_device_lifecycle() {
    if !ublk_available() {
        return;
    }

    let mut ctrl = UblkCtrl::new().unwrap();
    let params = basic_params(256 << 20, 512).unwrap();
    let builder = DeviceBuilder::default()
        .nr_queues(1)
        .depth(64)
        .io_buf_bytes(64 << 10);

    let mut dev = start_device(&mut ctrl, builder, &params, Arc::new(NullTarget)).unwrap();
    let bdev = dev.bdev_path();
    assert!(
        wait_for_path(&bdev, true, Duration::from_secs(5)),
        "{} did not appear",
        bdev
    );

    {
        let mut f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&bdev)
            .unwrap();

        let mut buf = vec![0xffu8; 4096];
        f.read_exact(&mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0), "null read must yield zeroes");

        // writes are accepted and discarded
        f.seek(SeekFrom::Start(0)).unwrap();
        f.write_all(&[0xabu8; 4096]).unwrap();
        f.sync_all().unwrap();
    }

    dev.stop().unwrap();
    drop(dev);
    assert!(
        wait_for_path(&bdev, false, Duration::from_secs(5)),
        "{} still present after delete",
        bdev
    );
}

#[test]
fn test_ram_disk_round_trip() {
    if !ublk_available() {
        return;
    }

    const DEV_SIZE: u64 = 64 << 20;
    let mut ctrl = UblkCtrl::new().unwrap();
    let params =
        basic_params_with_attrs(DEV_SIZE, 512, BasicAttrs::VOLATILE_CACHE).unwrap();
    let builder = DeviceBuilder::default()
        .nr_queues(1)
        .depth(64)
        .io_buf_bytes(64 << 10);

    let ram = Arc::new(RamTarget::new(DEV_SIZE));
    let mut dev = start_device(&mut ctrl, builder, &params, ram).unwrap();
    let bdev = dev.bdev_path();
    assert!(wait_for_path(&bdev, true, Duration::from_secs(5)));

    let literal = b"UBLKSRV_RAM_DISK_TEST_12345678";
    {
        let mut f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&bdev)
            .unwrap();

        let mut sector = vec![0u8; 512];
        sector[..literal.len()].copy_from_slice(literal);
        f.write_all(&sector).unwrap();
        f.sync_all().unwrap();

        f.seek(SeekFrom::Start(0)).unwrap();
        let mut back = vec![0u8; 512];
        f.read_exact(&mut back).unwrap();
        assert_eq!(&back[..literal.len()], literal);

        // a larger patterned write over the first megabyte
        let payload: Vec<u8> = (0..1 << 20).map(|i| (i * 31 % 251) as u8).collect();
        f.seek(SeekFrom::Start(0)).unwrap();
        f.write_all(&payload).unwrap();
        f.sync_all().unwrap();

        f.seek(SeekFrom::Start(0)).unwrap();
        let mut back = vec![0u8; 1 << 20];
        f.read_exact(&mut back).unwrap();
        assert_eq!(back, payload);
    }

    dev.stop().unwrap();
}

#[test]
fn test_multi_queue_start_stop() {
    if !ublk_available() {
        return;
    }

    let mut ctrl = UblkCtrl::new().unwrap();
    let params = basic_params(128 << 20, 512).unwrap();
    let builder = DeviceBuilder::default()
        .nr_queues(2)
        .depth(64)
        .io_buf_bytes(64 << 10);

    let mut dev = start_device(&mut ctrl, builder, &params, Arc::new(NullTarget)).unwrap();
    let bdev = dev.bdev_path();
    assert!(wait_for_path(&bdev, true, Duration::from_secs(5)));

    {
        let mut f = std::fs::File::open(&bdev).unwrap();
        let mut buf = vec![0u8; 1 << 20];
        f.read_exact(&mut buf).unwrap();
    }

    dev.stop().unwrap();
}

#[test]
fn test_device_info_and_params_readback() {
    if !ublk_available() {
        return;
    }

    let mut ctrl = UblkCtrl::new().unwrap();
    let params = basic_params(256 << 20, 512).unwrap();
    let builder = DeviceBuilder::default()
        .nr_queues(1)
        .depth(128)
        .io_buf_bytes(64 << 10);

    let mut dev = builder.create(&mut ctrl, &params).unwrap();
    let dev_id = dev.dev_id();

    // configured but not started: the driver already reports geometry
    let info = dev.read_dev_info().unwrap();
    assert_eq!(info.dev_id, dev_id);
    assert_eq!(info.nr_hw_queues, 1);
    assert_eq!(info.queue_depth, 128);
    assert_eq!(info.state, sys::UBLK_S_DEV_DEAD);
    assert_ne!(info.flags & sys::UBLK_F_CMD_IOCTL_ENCODE, 0);

    let p = dev.read_params().unwrap();
    assert_eq!(p.basic.logical_bs_shift, 9);
    assert_eq!(p.basic.dev_sectors, (256 << 20) / 512);

    drop(dev);

    // dropping deleted the kernel device
    let mut ctrl2 = UblkCtrl::new().unwrap();
    match ctrl2.get_dev_info(dev_id) {
        Err(UblkError::GetDeviceInfoFailed(res)) => assert!(res < 0),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(info) => panic!("device {} should be gone, got state {}", dev_id, info.state),
    }
}

#[test]
fn test_get_features_reports_ioctl_encode() {
    if !ublk_available() {
        return;
    }

    let ctrl = UblkCtrl::new().unwrap();
    // every kernel this crate supports has both GET_FEATURES and the
    // ioctl encoding
    let features = ctrl.driver_features().expect("kernel lacks GET_FEATURES");
    assert_ne!(features & sys::UBLK_F_CMD_IOCTL_ENCODE, 0);
}
