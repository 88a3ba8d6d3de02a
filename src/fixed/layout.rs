//! On-file layout of the fixed-length engine.
//!
//! ```text
//! [ Header 40B | LockRegion 64B | Stamps 256×8B | RecycleRing 65536×4B
//!   | BucketTable N×4B | Slots (capacity+65536)×item_size ]
//! ```
//!
//! A slot's first four bytes are one link word: the bucket-chain `next`
//! while the node is live, the free-list pointer while it is free. The
//! key and value bytes follow at offset 4.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU8};

use crate::lock::MUTEX_AREA;

pub(crate) const MAGIC: u16 = 0xE888;

pub(crate) const MAX_KEY_LEN: usize = u8::MAX as usize;
pub(crate) const MAX_VAL_LEN: usize = u16::MAX as usize + 1;
pub(crate) const MIN_CAPACITY: u32 = u16::MAX as u32 + 1;
pub(crate) const MAX_CAPACITY: u32 = u32::MAX - (u16::MAX as u32 + 1);
pub(crate) const MAX_LOAD_FACTOR: u32 = 2;

/// Chain/free-list terminator.
pub(crate) const END: u32 = u32::MAX;

pub(crate) const RECYCLE_CAPACITY: usize = u16::MAX as usize + 1;
pub(crate) const RECYCLE_BIN_SIZE: usize = u8::MAX as usize + 1;
pub(crate) const RECYCLE_DELAY_MS: i64 = 50;
pub(crate) const STAMP_COUNT: usize = RECYCLE_CAPACITY / RECYCLE_BIN_SIZE;

const _: () = assert!(RECYCLE_DELAY_MS > 0);
const _: () = assert!(
    RECYCLE_BIN_SIZE < RECYCLE_CAPACITY && RECYCLE_BIN_SIZE & (RECYCLE_BIN_SIZE - 1) == 0
);

/// Slot stride: link word + key + value, rounded to 4 bytes.
pub(crate) const fn item_size(key_len: usize, val_len: usize) -> usize {
    (4 + key_len + val_len + 3) & !3
}

/// File header at offset 0. Fields a lock-free reader may observe are
/// atomics; the rest changes only under the master mutex or offline.
#[repr(C)]
pub(crate) struct Header {
    pub magic: u16,
    pub writing: AtomicU8,
    pub key_len: u8,
    pub val_len: u32,
    pub total_entry: u32,
    pub capacity: u32,
    pub seed: u64,
    pub item: AtomicU32,
    pub recycle_r: AtomicU16,
    pub recycle_w: AtomicU16,
    pub free_head: AtomicU32,
    pub free_tail: AtomicU32,
}

pub(crate) const HEADER_SIZE: usize = std::mem::size_of::<Header>();
const _: () = assert!(HEADER_SIZE == 40);

/// Master mutex bytes, aligned for `pthread_mutex_t`.
#[repr(C, align(8))]
pub(crate) struct LockRegion {
    area: [u8; MUTEX_AREA],
}

impl LockRegion {
    #[inline]
    pub(crate) fn mutex_ptr(&self) -> *mut u8 {
        self.area.as_ptr() as *mut u8
    }
}

pub(crate) const LOCK_OFF: usize = HEADER_SIZE;
pub(crate) const STAMPS_OFF: usize = LOCK_OFF + MUTEX_AREA;
pub(crate) const RECYCLE_OFF: usize = STAMPS_OFF + 8 * STAMP_COUNT;
pub(crate) const TABLE_OFF: usize = RECYCLE_OFF + 4 * RECYCLE_CAPACITY;
const _: () = assert!(STAMPS_OFF % 8 == 0 && TABLE_OFF % 4 == 0);

pub(crate) const fn data_off(total_entry: u32) -> usize {
    TABLE_OFF + total_entry as usize * 4
}

pub(crate) const fn file_size(total_entry: u32, capacity: u32, item_size: usize) -> usize {
    data_off(total_entry) + (capacity as usize + RECYCLE_CAPACITY) * item_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_stride() {
        assert_eq!(item_size(1, 0), 8);
        assert_eq!(item_size(4, 0), 8);
        assert_eq!(item_size(8, 32), 44);
        assert_eq!(item_size(8, 33), 48);
        // The link word always fits.
        assert!(item_size(1, 0) >= 8);
    }

    #[test]
    fn region_offsets() {
        assert_eq!(LOCK_OFF, 40);
        assert_eq!(STAMPS_OFF, 104);
        assert_eq!(RECYCLE_OFF, 104 + 2048);
        assert_eq!(TABLE_OFF, RECYCLE_OFF + 262144);
        assert_eq!(data_off(10), TABLE_OFF + 40);
        assert_eq!(
            file_size(2, 1, 8) - data_off(2),
            (1 + RECYCLE_CAPACITY) * 8
        );
    }
}
