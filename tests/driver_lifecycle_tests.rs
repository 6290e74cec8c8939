//! End-to-end driver scenarios over the software device model

use std::sync::Arc;
use std::time::Duration;

use gpuforge::hal::sim::{SimDevice, SimPagePool};
use gpuforge::hal::{DeviceSharedMemory, PAGE_SIZE};
use gpuforge::mmu::Access;
use gpuforge::{
    ApertureConfig, ApertureKind, DeviceHardware, DriverConfig, DriverContext, DriverError,
};
use serial_test::serial;

const RING_WORDS: usize = 1024;

fn build(config: DriverConfig) -> (DriverContext, Arc<SimDevice>, Arc<SimPagePool>) {
    let shared = Arc::new(DeviceSharedMemory::new(RING_WORDS));
    let sim = SimDevice::new(shared.clone());
    let pool = SimPagePool::new();
    let hardware = DeviceHardware {
        registers: sim.clone(),
        interrupts: sim.clone(),
        shared,
    };
    let ctx = DriverContext::new(config, vec![hardware], pool.clone()).unwrap();
    (ctx, sim, pool)
}

fn started(config: DriverConfig) -> (DriverContext, Arc<SimDevice>, Arc<SimPagePool>) {
    let (ctx, sim, pool) = build(config);
    ctx.start_device(0).unwrap();
    (ctx, sim, pool)
}

#[test]
#[serial]
fn test_allocate_submit_wait_reclaim_round_trip() -> anyhow::Result<()> {
    let (ctx, _sim, pool) = started(DriverConfig::default());
    let virtual_size = 64 << 20;
    ctx.attach_process(1)?;

    let desc = ctx.allocate(ApertureKind::Virtual, 4096, 1)?;
    assert_eq!(desc.aperture, ApertureKind::Virtual);
    assert_eq!(pool.outstanding(), 1);

    let ts = ctx.submit_batch(0, &[0xc0de_0001, 0xc0de_0002], 1)?;
    assert_eq!(ts, 1);
    ctx.wait_timestamp(0, ts, Duration::from_millis(1000))?;
    assert!(ctx.is_idle(0)?);

    ctx.free_at_timestamp(0, desc, ts)?;
    assert_eq!(ctx.drain_reclaim(0)?, 1);
    assert_eq!(pool.outstanding(), 0);
    assert_eq!(
        ctx.largest_free_block(ApertureKind::Virtual, PAGE_SIZE)?,
        virtual_size
    );

    ctx.detach_process(1)?;
    ctx.shutdown()?;
    Ok(())
}

#[test]
#[serial]
fn test_context_switch_flushes_between_processes() {
    let (ctx, sim, _pool) = started(DriverConfig::default());
    ctx.attach_process(1).unwrap();
    ctx.attach_process(2).unwrap();
    assert_eq!(sim.tlb_flush_count(), 0);

    // First binding of each table flushes; staying on a table does not
    ctx.submit_batch(0, &[0x01], 1).unwrap();
    assert_eq!(sim.tlb_flush_count(), 1);
    ctx.submit_batch(0, &[0x02], 1).unwrap();
    assert_eq!(sim.tlb_flush_count(), 1);
    ctx.submit_batch(0, &[0x03], 2).unwrap();
    assert_eq!(sim.tlb_flush_count(), 2);
    ctx.submit_batch(0, &[0x04], 1).unwrap();
    assert_eq!(sim.tlb_flush_count(), 3);
}

#[test]
#[serial]
fn test_unmaps_batch_into_one_flush() {
    let (ctx, sim, _pool) = started(DriverConfig::default());
    ctx.attach_process(1).unwrap();
    ctx.submit_batch(0, &[0x01], 1).unwrap();
    let after_bind = sim.tlb_flush_count();

    // Several frees leave invalidations pending; the next submission pays
    // for all of them with a single flush.
    let descs: Vec<_> = (0..3)
        .map(|_| ctx.allocate(ApertureKind::Virtual, 8192, 1).unwrap())
        .collect();
    ctx.submit_batch(0, &[0x02], 1).unwrap();
    let after_maps = sim.tlb_flush_count();
    for desc in &descs {
        ctx.free(desc, 1).unwrap();
    }
    assert_eq!(sim.tlb_flush_count(), after_maps);

    ctx.submit_batch(0, &[0x03], 1).unwrap();
    assert_eq!(sim.tlb_flush_count(), after_maps + 1);
    ctx.submit_batch(0, &[0x04], 1).unwrap();
    assert_eq!(sim.tlb_flush_count(), after_maps + 1);
    assert!(after_bind >= 1);
}

#[test]
#[serial]
fn test_deferred_free_waits_for_retirement() {
    let (ctx, sim, pool) = started(DriverConfig::default());
    sim.set_auto_retire(false);
    ctx.attach_process(1).unwrap();

    let desc = ctx.allocate(ApertureKind::Virtual, 4096, 1).unwrap();
    let ts = ctx.submit_batch(0, &[0xaa], 1).unwrap();
    ctx.free_at_timestamp(0, desc, ts).unwrap();

    // The device has not retired the fence; nothing may be reclaimed
    assert_eq!(ctx.drain_reclaim(0).unwrap(), 0);
    assert_eq!(pool.outstanding(), 1);

    assert_eq!(sim.retire_next(), Some(ts));
    assert_eq!(ctx.drain_reclaim(0).unwrap(), 1);
    assert_eq!(pool.outstanding(), 0);
}

#[test]
#[serial]
fn test_wait_timeout_reports_device_stall() {
    let (ctx, sim, _pool) = started(DriverConfig::default());
    sim.set_auto_retire(false);
    ctx.attach_process(1).unwrap();
    let ts = ctx.submit_batch(0, &[0x55], 1).unwrap();
    let err = ctx.wait_timestamp(0, ts, Duration::from_millis(30));
    assert!(matches!(err, Err(DriverError::DeviceTimeout { .. })));
    assert!(!ctx.is_idle(0).unwrap());
}

#[test]
#[serial]
fn test_external_mapping_never_releases_client_pages() {
    let (ctx, _sim, pool) = started(DriverConfig::default());
    ctx.attach_process(1).unwrap();
    let external_size = 32 << 20;

    let client_pages: Vec<u64> = (0..4u64).map(|i| 0xdead_0000 + i * PAGE_SIZE).collect();
    let desc = ctx.map_external(&client_pages, Access::ReadOnly, 1).unwrap();
    assert!(desc.external);
    assert_eq!(desc.aperture, ApertureKind::External);
    assert_eq!(desc.size, 4 * PAGE_SIZE);
    assert_eq!(pool.outstanding(), 0);

    // Freeing unmaps and recycles the window but leaves the pages alone
    ctx.free(&desc, 1).unwrap();
    assert_eq!(pool.outstanding(), 0);
    assert_eq!(
        ctx.largest_free_block(ApertureKind::External, PAGE_SIZE).unwrap(),
        external_size
    );
}

#[test]
#[serial]
fn test_mmu_disabled_falls_back_to_contiguous() {
    let mut config = DriverConfig::default();
    config.mmu_enabled = false;
    let (ctx, _sim, pool) = started(config);

    let desc = ctx.allocate(ApertureKind::Virtual, 4096, 1).unwrap();
    assert_eq!(desc.aperture, ApertureKind::Contiguous);
    assert_eq!(pool.outstanding(), 0);
    ctx.free(&desc, 1).unwrap();

    assert!(matches!(
        ctx.map_external(&[0x1000], Access::ReadOnly, 1),
        Err(DriverError::InvalidArgument(_))
    ));
}

#[test]
#[serial]
fn test_exhaustion_strict_with_mmu_enabled() {
    let mut config = DriverConfig::default();
    // Shrink the virtual window so it exhausts quickly
    for aperture in &mut config.apertures {
        if aperture.kind == ApertureKind::Virtual {
            aperture.size = 4 * PAGE_SIZE;
        }
    }
    let (ctx, _sim, _pool) = started(config);
    ctx.attach_process(1).unwrap();

    let descs: Vec<_> = (0..4)
        .map(|_| ctx.allocate(ApertureKind::Virtual, PAGE_SIZE, 1).unwrap())
        .collect();
    // No silent fallback to another aperture while the MMU is live
    assert!(matches!(
        ctx.allocate(ApertureKind::Virtual, PAGE_SIZE, 1),
        Err(DriverError::ResourceExhausted(_))
    ));

    let released = descs[2].clone();
    ctx.free(&released, 1).unwrap();
    let again = ctx.allocate(ApertureKind::Virtual, PAGE_SIZE, 1).unwrap();
    assert_eq!(again.device_address, released.device_address);
}

#[test]
#[serial]
fn test_detach_releases_page_table_storage() {
    let (ctx, _sim, pool) = started(DriverConfig::default());
    let before = ctx
        .largest_free_block(ApertureKind::Contiguous, 1)
        .unwrap();

    ctx.attach_process(1).unwrap();
    let desc = ctx.allocate(ApertureKind::Virtual, 4096, 1).unwrap();
    ctx.free(&desc, 1).unwrap();
    ctx.detach_process(1).unwrap();

    assert_eq!(pool.outstanding(), 0);
    let after = ctx
        .largest_free_block(ApertureKind::Contiguous, 1)
        .unwrap();
    assert_eq!(before, after);
}

#[test]
#[serial]
fn test_destroy_process_contexts_forces_cleanup() {
    let (ctx, sim, pool) = started(DriverConfig::default());
    sim.set_auto_retire(false);
    ctx.attach_process(1).unwrap();

    // A stalled device holds a deferred free and a live mapping hostage
    let deferred = ctx.allocate(ApertureKind::Virtual, 4096, 1).unwrap();
    let leaked = ctx.allocate(ApertureKind::Virtual, 4096, 1).unwrap();
    let ts = ctx.submit_batch(0, &[0x99], 1).unwrap();
    ctx.free_at_timestamp(0, deferred, ts).unwrap();
    assert_eq!(pool.outstanding(), 2);

    ctx.destroy_process_contexts(1).unwrap();
    assert_eq!(pool.outstanding(), 0);
    assert_eq!(
        ctx.largest_free_block(ApertureKind::Virtual, PAGE_SIZE).unwrap(),
        64 << 20
    );
    // The stale handle cannot be freed twice
    assert!(ctx.free(&leaked, 1).is_err());
}

#[test]
#[serial]
fn test_reclaim_survives_a_stale_deferred_entry() {
    let (ctx, _sim, pool) = started(DriverConfig::default());
    ctx.attach_process(1).unwrap();

    let stale = ctx.allocate(ApertureKind::Virtual, 4096, 1).unwrap();
    let live = ctx.allocate(ApertureKind::Virtual, 4096, 1).unwrap();
    let ts = ctx.submit_batch(0, &[0x77], 1).unwrap();

    // The stale handle is freed immediately and then queued anyway, so its
    // deferred release must fail; the live entry sits behind it in the
    // queue and must still be reclaimed.
    ctx.free(&stale, 1).unwrap();
    ctx.free_at_timestamp(0, stale, ts).unwrap();
    ctx.free_at_timestamp(0, live, ts).unwrap();

    assert!(ctx.drain_reclaim(0).is_err());
    assert_eq!(pool.outstanding(), 0);
    assert_eq!(
        ctx.largest_free_block(ApertureKind::Virtual, PAGE_SIZE).unwrap(),
        64 << 20
    );
}

#[test]
#[serial]
fn test_device_stop_rejects_submissions() {
    let (ctx, _sim, _pool) = started(DriverConfig::default());
    ctx.attach_process(1).unwrap();
    ctx.submit_batch(0, &[0x01], 1).unwrap();
    ctx.stop_device(0).unwrap();
    assert!(matches!(
        ctx.submit_batch(0, &[0x02], 1),
        Err(DriverError::NotInitialized(_))
    ));
    // Stopped devices report idle and restart cleanly
    assert!(ctx.is_idle(0).unwrap());
    ctx.start_device(0).unwrap();
    assert_eq!(ctx.submit_batch(0, &[0x03], 1).unwrap(), 1);
}

#[test]
#[serial]
fn test_unknown_device_and_register_bounds() {
    let (ctx, _sim, _pool) = build(DriverConfig::default());
    assert!(matches!(
        ctx.start_device(7),
        Err(DriverError::NoSuchDevice(7))
    ));
    assert!(matches!(
        ctx.read_register(0, 0x100),
        Err(DriverError::InvalidArgument(_))
    ));
    ctx.write_register(0, 0x030, 0x1234).unwrap();
    assert_eq!(ctx.read_register(0, 0x030).unwrap(), 0x1234);
}
