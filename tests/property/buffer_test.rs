// tests/property/buffer_test.rs

//! Property-based tests for the buffer pool and the stripe block.

use garnetfs::core::buffer::{BufferManager, RainBlock};
use proptest::prelude::*;
use std::sync::Arc;

const MIB: u64 = 1024 * 1024;

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        ..ProptestConfig::default()
    })]

    /// Any get/recycle sequence returns the accounting to the cached total,
    /// and the peak never exceeds the ceiling plus one oversize buffer.
    #[test]
    fn test_buffer_recycling_accounting(
        sizes in prop::collection::vec(1u64..(9 * 1024 * 1024), 1..16)
    ) {
        let pool = BufferManager::new(16 * MIB, 3, MIB);

        let buffers: Vec<_> = sizes
            .iter()
            .filter_map(|&s| pool.get_buffer(s))
            .collect();

        for buffer in buffers {
            pool.recycle(buffer);
        }

        // Whatever remains accounted is exactly what the slots cache.
        let mut cached_total = 0;
        let _ = pool.get_sorted_slot_sizes(&mut cached_total);
        prop_assert_eq!(pool.allocated_size(), cached_total);
        prop_assert!(cached_total <= 16 * MIB + 8 * MIB);
    }

    /// A write beyond the current end of data marks a hole; only a forced
    /// zero-fill completes a holed block.
    #[test]
    fn test_rainblock_holes(gap in 1u64..1024, len in 1usize..512) {
        let pool = Arc::new(BufferManager::new(16 * MIB, 2, MIB));
        let mut block = RainBlock::new(MIB, Arc::clone(&pool)).unwrap();

        let data = vec![0xabu8; len];
        prop_assert!(block.write(&data, 0));
        prop_assert!(!block.has_holes());

        // Leave a gap behind the written prefix.
        let hole_offset = len as u64 + gap;
        prop_assert!(block.write(&data, hole_offset));
        prop_assert!(block.has_holes());

        prop_assert!(!block.fill_with_zeros(false));
        prop_assert!(block.fill_with_zeros(true));
        prop_assert_eq!(block.last_offset(), block.capacity());
        prop_assert!(block.as_slice().iter().all(|&b| b == 0));
    }

    /// Sequential writes never mark holes and zero-fill completes the block.
    #[test]
    fn test_rainblock_sequential_writes(chunks in prop::collection::vec(1usize..2048, 1..16)) {
        let pool = Arc::new(BufferManager::new(16 * MIB, 2, MIB));
        let mut block = RainBlock::new(MIB, Arc::clone(&pool)).unwrap();

        let mut offset = 0u64;
        for len in chunks {
            let data = vec![0x5au8; len];
            prop_assert!(block.write(&data, offset));
            offset += len as u64;
        }

        prop_assert!(!block.has_holes());
        prop_assert_eq!(block.last_offset(), offset);
        prop_assert!(block.fill_with_zeros(false));
        prop_assert_eq!(block.last_offset(), block.capacity());

        // The filled tail is zero, the written prefix untouched.
        prop_assert!(block.as_slice()[..offset as usize].iter().all(|&b| b == 0x5a));
        prop_assert!(block.as_slice()[offset as usize..].iter().all(|&b| b == 0));
    }
}

/// Writes past the capacity are refused and leave the block unchanged.
#[test]
fn test_rainblock_bounds() {
    let pool = Arc::new(BufferManager::new(16 * MIB, 2, MIB));
    let mut block = RainBlock::new(4096, Arc::clone(&pool)).unwrap();

    assert!(!block.write(&[1, 2, 3], 4096));
    assert!(!block.write(&vec![0u8; 4097], 0));
    assert!(!block.write(&[1], 4095 + 1));
    assert_eq!(block.last_offset(), 0);
    assert!(!block.has_holes());

    // The last in-bounds byte is writable.
    assert!(block.write(&[9], 4095));
    assert_eq!(block.last_offset(), 4096);
}

/// Dropping a block recycles its buffer; moving the buffer out transfers
/// ownership to the caller.
#[test]
fn test_rainblock_buffer_ownership() {
    let pool = Arc::new(BufferManager::new(16 * MIB, 2, MIB));

    {
        let _block = RainBlock::new(MIB, Arc::clone(&pool)).unwrap();
        assert_eq!(pool.allocated_size(), MIB);
    }
    // Dropped block left its buffer cached in the pool.
    assert_eq!(pool.allocated_size(), MIB);

    let mut block = RainBlock::new(MIB, Arc::clone(&pool)).unwrap();
    let buffer = block.take_buffer().unwrap();
    drop(block);
    pool.recycle(buffer);
    assert_eq!(pool.allocated_size(), MIB);
}
