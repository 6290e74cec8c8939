//! Arena allocator behavior through the aperture API

use gpuforge::memory::{Aperture, ApertureConfig, ApertureKind, MIN_ALIGNMENT};
use gpuforge::DriverError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn contiguous(size: u64) -> Aperture {
    Aperture::new(
        &ApertureConfig {
            kind: ApertureKind::Contiguous,
            host_base: Some(0x7f00_0000_0000),
            device_base: 0x8000_0000,
            size,
        },
        true,
    )
    .unwrap()
}

#[test]
fn test_exhaust_free_reuse_same_block() {
    let ap = contiguous(4 * 4096);
    let descs: Vec<_> = (0..4).map(|_| ap.allocate(4096, 1, 1).unwrap()).collect();
    assert!(matches!(
        ap.allocate(4096, 1, 1),
        Err(DriverError::ResourceExhausted(_))
    ));

    // Freeing one block makes exactly that block available again
    let released = descs[1].clone();
    ap.free(&released).unwrap();
    let again = ap.allocate(4096, 1, 1).unwrap();
    assert_eq!(again.device_address, released.device_address);

    ap.free(&again).unwrap();
    for desc in [&descs[0], &descs[2], &descs[3]] {
        ap.free(desc).unwrap();
    }
    assert_eq!(ap.free_bytes().unwrap(), 4 * 4096);
}

#[test]
fn test_alignment_honored_and_fragments_kept() {
    let ap = contiguous(1 << 20);
    // Burn an odd prefix so the next aligned request needs a fragment
    let head = ap.allocate(96, MIN_ALIGNMENT, 1).unwrap();
    let aligned = ap.allocate(8192, 4096, 1).unwrap();
    assert_eq!(aligned.device_address % 4096, 0);

    // The skipped bytes between the two stay allocatable
    let before = ap.free_bytes().unwrap();
    assert_eq!(before, (1 << 20) - head.size - aligned.size);

    ap.free(&aligned).unwrap();
    ap.free(&head).unwrap();
    assert_eq!(ap.free_bytes().unwrap(), 1 << 20);
    assert_eq!(ap.largest_free_block(MIN_ALIGNMENT).unwrap(), 1 << 20);
}

#[test]
fn test_double_free_rejected_without_corruption() {
    let ap = contiguous(1 << 16);
    let desc = ap.allocate(4096, 1, 1).unwrap();
    ap.free(&desc).unwrap();
    assert!(matches!(
        ap.free(&desc),
        Err(DriverError::InvalidArgument(_))
    ));
    // The list still works afterwards
    let again = ap.allocate(4096, 1, 1).unwrap();
    ap.free(&again).unwrap();
    assert_eq!(ap.free_bytes().unwrap(), 1 << 16);
}

#[test]
fn test_randomized_churn_conserves_capacity() {
    let capacity: u64 = 1 << 20;
    let ap = contiguous(capacity);
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut live = Vec::new();

    for _ in 0..2000 {
        if live.is_empty() || (rng.gen_bool(0.6) && live.len() < 64) {
            let size = rng.gen_range(32..16384);
            match ap.allocate(size, 1, 1) {
                Ok(desc) => live.push(desc),
                Err(DriverError::ResourceExhausted(_)) => {
                    let victim = live.swap_remove(rng.gen_range(0..live.len()));
                    ap.free(&victim).unwrap();
                }
                Err(err) => panic!("unexpected allocator error: {err}"),
            }
        } else {
            let victim = live.swap_remove(rng.gen_range(0..live.len()));
            ap.free(&victim).unwrap();
        }
        let in_use: u64 = live.iter().map(|d| d.size).sum();
        assert_eq!(ap.free_bytes().unwrap(), capacity - in_use);
    }

    for desc in live.drain(..) {
        ap.free(&desc).unwrap();
    }
    assert_eq!(ap.free_bytes().unwrap(), capacity);
    assert_eq!(ap.largest_free_block(1).unwrap(), capacity);
}

#[test]
fn test_free_order_independent_merging() {
    let ap = contiguous(8 * 4096);
    let descs: Vec<_> = (0..8).map(|_| ap.allocate(4096, 1, 1).unwrap()).collect();
    // Free in an order that exercises merge-left, merge-right and bridging
    for idx in [3, 5, 4, 0, 7, 1, 6, 2] {
        ap.free(&descs[idx]).unwrap();
    }
    assert_eq!(ap.largest_free_block(1).unwrap(), 8 * 4096);
}
