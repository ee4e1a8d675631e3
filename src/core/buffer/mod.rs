// src/core/buffer/mod.rs

//! The page-aligned buffer pool backing the erasure-coded I/O path.
//!
//! Buffers are bucketed into power-of-two slots. Callers obtain a buffer from
//! the pool, use it, and hand it back via [`BufferManager::recycle`]; buffers
//! are never freed directly.

pub mod rain;

use parking_lot::Mutex;
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

pub use rain::RainBlock;

/// Requests above this size are refused outright.
pub const MAX_BUFFER_SIZE: u64 = 512 * 1024 * 1024;

/// Returns the page size of the running system.
pub fn page_size() -> usize {
    static PAGE_SIZE: once_cell::sync::Lazy<usize> =
        once_cell::sync::Lazy::new(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize });
    *PAGE_SIZE
}

/// Returns the total amount of physical memory on this host in bytes.
pub fn system_memory_size() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    sys.total_memory()
}

/// A page-aligned byte region obtained from a [`BufferManager`].
#[derive(Debug)]
pub struct Buffer {
    capacity: u64,
    length: u64,
    data: NonNull<u8>,
    layout: Option<Layout>,
}

// The buffer owns its allocation exclusively.
unsafe impl Send for Buffer {}

impl Buffer {
    /// Allocates a new zeroed buffer aligned to the system page size.
    fn new(capacity: u64) -> Self {
        if capacity == 0 {
            return Self {
                capacity,
                length: 0,
                data: NonNull::dangling(),
                layout: None,
            };
        }

        let layout = Layout::from_size_align(capacity as usize, page_size())
            .expect("buffer capacity exceeds the addressable range");
        let ptr = unsafe { alloc_zeroed(layout) };
        let data = NonNull::new(ptr).expect("page-aligned allocation failed");

        Self {
            capacity,
            length: 0,
            data,
            layout: Some(layout),
        }
    }

    /// Available size of the buffer.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Length of the useful data.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Marks the first `len` bytes as useful data.
    pub fn set_len(&mut self, len: u64) {
        debug_assert!(len <= self.capacity);
        self.length = len.min(self.capacity);
    }

    /// The full capacity of the buffer as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        if self.capacity == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.capacity as usize) }
    }

    /// The full capacity of the buffer as a mutable byte slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.capacity == 0 {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.capacity as usize) }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(layout) = self.layout.take() {
            unsafe { dealloc(self.data.as_ptr(), layout) };
        }
    }
}

/// A bucket holding recycled buffers of one fixed capacity.
#[derive(Debug)]
struct BufferSlot {
    buff_size: u64,
    available: Mutex<Vec<Buffer>>,
    num_buffers: AtomicU64,
}

impl BufferSlot {
    fn new(buff_size: u64) -> Self {
        Self {
            buff_size,
            available: Mutex::new(Vec::new()),
            num_buffers: AtomicU64::new(0),
        }
    }

    /// Returns a buffer and whether it is a fresh allocation.
    fn get(&self) -> (Buffer, bool) {
        {
            let mut available = self.available.lock();

            if let Some(buff) = available.pop() {
                return (buff, false);
            }
        }

        self.num_buffers.fetch_add(1, Ordering::Relaxed);
        (Buffer::new(self.buff_size), true)
    }

    /// Stores the buffer for reuse or drops it from the slot accounting.
    fn recycle(&self, mut buffer: Buffer, keep: bool) {
        if keep {
            buffer.length = 0;
            self.available.lock().push(buffer);
        } else {
            self.num_buffers.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Drops one cached buffer from the slot, if any is available.
    fn pop(&self) {
        let mut available = self.available.lock();

        if available.pop().is_some() {
            self.num_buffers.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Total bytes currently accounted to this slot.
    fn used_bytes(&self) -> u64 {
        self.num_buffers.load(Ordering::Relaxed) * self.buff_size
    }
}

/// A slot-bucketed pool of page-aligned buffers with a global retention ceiling.
///
/// Slot `i` serves buffers of `base_size * 2^i`. Requests bigger than the last
/// slot get an ad-hoc buffer accounted against the global total; requests are
/// refused when the pool already retains more than half of system memory or
/// when a single buffer would exceed [`MAX_BUFFER_SIZE`].
#[derive(Debug)]
pub struct BufferManager {
    max_size: AtomicU64,
    allocated_size: AtomicU64,
    num_slots: u32,
    slot_base_size: u64,
    system_memory: u64,
    slots: Vec<BufferSlot>,
}

impl BufferManager {
    pub fn new(max_size: u64, slots: u32, slot_base_size: u64) -> Self {
        let slot_list = (0..=slots)
            .map(|i| BufferSlot::new((1u64 << i) * slot_base_size))
            .collect();

        Self {
            max_size: AtomicU64::new(max_size),
            allocated_size: AtomicU64::new(0),
            num_slots: slots,
            slot_base_size,
            system_memory: system_memory_size(),
            slots: slot_list,
        }
    }

    /// Get a buffer with capacity at least `size`.
    pub fn get_buffer(&self, size: u64) -> Option<Buffer> {
        // No new buffer if we already hold more than half of system memory.
        if self.allocated_size.load(Ordering::Relaxed) > (self.system_memory >> 1) {
            return None;
        }

        let slot = self.slot_for_size(size);

        let Some(slot) = slot else {
            // No slot big enough for the given request.
            if size > MAX_BUFFER_SIZE {
                return None;
            }

            self.allocated_size.fetch_add(size, Ordering::Relaxed);
            return Some(Buffer::new(size));
        };

        let (buffer, new_alloc) = self.slots[slot].get();

        if new_alloc {
            self.allocated_size
                .fetch_add(buffer.capacity(), Ordering::Relaxed);
        }

        Some(buffer)
    }

    /// Return a buffer to the pool.
    pub fn recycle(&self, buffer: Buffer) {
        let capacity = buffer.capacity();
        let slot = (0..=self.num_slots as usize)
            .find(|i| capacity == (1u64 << i) * self.slot_base_size);

        // Buffer larger than our biggest slot, just deallocate.
        let Some(slot) = slot else {
            self.allocated_size.fetch_sub(capacity, Ordering::Relaxed);
            return;
        };

        let mut total_size = 0u64;
        let sorted_slots = self.get_sorted_slot_sizes(&mut total_size);
        let keep = total_size <= self.max_size.load(Ordering::Relaxed);

        if !keep {
            debug!(
                "msg=\"buffer pool is full\" max_size={}",
                self.max_size.load(Ordering::Relaxed)
            );

            // Free space in the other slots, preferring the fullest one. A
            // bigger slot gives back one buffer, a smaller one gives back the
            // byte equivalent of one buffer from the current slot.
            for (slot_id, _) in sorted_slots.iter().rev() {
                if *slot_id > slot {
                    self.drop_cached(*slot_id, 1);
                    break;
                }

                if *slot_id < slot {
                    let free_blocks = 1usize << (slot - *slot_id);
                    self.drop_cached(*slot_id, free_blocks);
                    break;
                }
            }
        }

        self.slots[slot].recycle(buffer, keep);

        if !keep {
            self.allocated_size.fetch_sub(capacity, Ordering::Relaxed);
        }
    }

    /// Slot usage sorted ascending by the bytes each slot currently accounts.
    pub fn get_sorted_slot_sizes(&self, total_size: &mut u64) -> Vec<(usize, u64)> {
        *total_size = 0;
        let mut elem: Vec<(usize, u64)> = Vec::with_capacity(self.slots.len());

        for (i, slot) in self.slots.iter().enumerate() {
            let used = slot.used_bytes();
            *total_size += used;
            elem.push((i, used));
        }

        elem.sort_by_key(|&(_, used)| used);
        elem
    }

    /// Number of slots handled by this manager, excluding slot 0.
    pub fn num_slots(&self) -> u32 {
        self.num_slots
    }

    /// Retention ceiling in bytes.
    pub fn max_size(&self) -> u64 {
        self.max_size.load(Ordering::Relaxed)
    }

    /// Total bytes currently accounted to the pool, cached or in flight.
    pub fn allocated_size(&self) -> u64 {
        self.allocated_size.load(Ordering::Relaxed)
    }

    fn slot_for_size(&self, size: u64) -> Option<usize> {
        (0..=self.num_slots as usize).find(|i| size <= (1u64 << i) * self.slot_base_size)
    }

    fn drop_cached(&self, slot: usize, count: usize) {
        for _ in 0..count {
            let before = self.slots[slot].num_buffers.load(Ordering::Relaxed);
            self.slots[slot].pop();

            if self.slots[slot].num_buffers.load(Ordering::Relaxed) < before {
                self.allocated_size
                    .fetch_sub(self.slots[slot].buff_size, Ordering::Relaxed);
            }
        }
    }
}
