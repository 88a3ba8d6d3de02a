//! Variable-length engine.
//!
//! Items of varying size live in a circular arena of 8-byte blocks,
//! indexed by an open-addressing table of packed 64-bit entries. Reads
//! are lock-free: a probe filters on the cached tag byte, confirms the
//! key bytes, and double-checks the entry word around the body copy so
//! a concurrent replacement is always detected. Writes are serialized
//! by the process-shared master mutex and reclaim space with an
//! in-place table sweep and a relocating block allocator.

mod builder;
mod layout;
mod table;
mod writer;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::divisor::Divisor;
use crate::hash::hash;
use crate::lock::{destroy_mutex, init_mutex};
use crate::mmap::ResourceMap;
use crate::prefetch::prefetch_for_future;
use crate::LoadPolicy;

pub use builder::Config;

use layout::{
    data_off, file_size, record_blocks, Entry, Header, LockRegion, Mark, BLOCK_SIZE,
    DATA_BLOCK_LIMIT, DATA_RESERVE_FACTOR, HEADER_SIZE, LOCK_OFF, MAGIC, MAX_ENTRY, MIN_ENTRY,
};
use table::search;

/// In-probe re-reads of a contended entry before giving up on the slot.
const ENTRY_RELOAD_LIMIT: u32 = 4;

/// Handle to a loaded variable-length dictionary.
pub struct Estuary {
    res: ResourceMap,
    lock: *const LockRegion,
    table: *const AtomicU64,
    data: *mut u8,
    max_key_len: usize,
    max_val_len: usize,
    reserved_block: u64,
    seed: u64,
    total_block: u64,
    total_entry: Divisor<u64>,
    monopoly_extra: Option<Box<LockRegion>>,
}

// All shared mutable state lives in the mapping and is accessed through
// atomics; writers serialize on the in-map master mutex.
unsafe impl Send for Estuary {}
unsafe impl Sync for Estuary {}

impl Drop for Estuary {
    fn drop(&mut self) {
        if let Some(extra) = &self.monopoly_extra {
            unsafe { destroy_mutex(extra.mutex_ptr()) };
        }
    }
}

impl Estuary {
    /// Attach to a dictionary file.
    pub fn load(path: &Path, policy: LoadPolicy) -> Option<Estuary> {
        let res = match policy {
            LoadPolicy::Shared => ResourceMap::open(path, true, false)?,
            LoadPolicy::Monopoly => ResourceMap::open(path, true, true)?,
            LoadPolicy::CopyData => ResourceMap::load_by_copy(path)?,
        };
        Self::init(res, policy != LoadPolicy::Shared, &path.display().to_string())
    }

    /// Attach to a dictionary image produced by `fill` (e.g. streamed
    /// from a remote blob) in private anonymous memory.
    pub fn load_with(size: usize, fill: impl FnOnce(&mut [u8]) -> bool) -> Option<Estuary> {
        let res = ResourceMap::anonymous(size, fill)?;
        Self::init(res, true, "<memory>")
    }

    fn init(res: ResourceMap, monopoly: bool, name: &str) -> Option<Estuary> {
        if res.len() < HEADER_SIZE {
            log::error!("broken file: {name}");
            return None;
        }
        let hdr = unsafe { &*(res.base_ptr() as *const Header) };
        let total_entry = hdr.total_entry;
        let total_block = hdr.total_block;
        if hdr.magic != MAGIC
            || !(MIN_ENTRY..=MAX_ENTRY).contains(&total_entry)
            || total_block < total_entry
            || total_block > DATA_BLOCK_LIMIT
            || res.len() < file_size(total_entry, total_block)
        {
            log::error!("broken file: {name}");
            return None;
        }

        let mut monopoly_extra = None;
        let lock: *const LockRegion;
        if monopoly {
            if hdr.writing.load(Ordering::Relaxed) != 0 {
                log::error!("file is not saved correctly: {name}");
                return None;
            }
            let boxed: Box<LockRegion> = Box::new(unsafe { std::mem::zeroed() });
            if !unsafe { init_mutex(boxed.mutex_ptr(), false) } {
                log::error!("fail to reset locks in: {name}");
                return None;
            }
            lock = &*boxed;
            monopoly_extra = Some(boxed);
        } else {
            lock = unsafe { res.base_ptr().add(LOCK_OFF) } as *const LockRegion;
        }

        let limits = Mark(hdr.kv_limit as u64);
        let reserved_block = record_blocks(limits.klen(), limits.vlen()) * 2;
        if total_block <= reserved_block {
            log::error!("broken file: {name}");
            return None;
        }
        let table = unsafe { res.base_ptr().add(layout::TABLE_OFF) } as *const AtomicU64;
        let data = unsafe { res.base_ptr().add(data_off(total_entry)) };
        Some(Estuary {
            seed: hdr.seed,
            max_key_len: limits.klen(),
            max_val_len: limits.vlen(),
            reserved_block,
            total_block,
            total_entry: Divisor::<u64>::new(total_entry),
            lock,
            table,
            data,
            monopoly_extra,
            res,
        })
    }

    /// Fetch the value for `key` into `out`. Lock-free.
    pub fn fetch(&self, key: &[u8], out: &mut Vec<u8>) -> bool {
        self.fetch_code(hash(key, self.seed), key, out)
    }

    /// Hash `key` and prefetch its bucket; pair with [`fetch_code`] to
    /// hide the table-line stall across independent lookups.
    ///
    /// [`fetch_code`]: Estuary::fetch_code
    pub fn touch(&self, key: &[u8]) -> u64 {
        let code = hash(key, self.seed);
        let pos = self.total_entry.rem(code);
        prefetch_for_future(unsafe { self.table.add(pos as usize) } as *const u8);
        code
    }

    /// Probe to the first tag match for `code` and prefetch that
    /// record's first block.
    pub fn touch_code(&self, code: u64) {
        let tag = (code >> 56) as u8;
        unsafe {
            search(
                self.table,
                self.total_entry.value(),
                self.total_entry.rem(code),
                |slot, _, _| {
                    let e = Entry(slot.load(Ordering::Relaxed));
                    if e.is_empty() {
                        return e.is_clean();
                    }
                    if e.tag() == tag {
                        prefetch_for_future(self.blk_ptr(e.blk()));
                        return true;
                    }
                    false
                },
            );
        }
    }

    /// [`fetch`](Estuary::fetch) with a precomputed hash code.
    pub fn fetch_code(&self, code: u64, key: &[u8], out: &mut Vec<u8>) -> bool {
        let mut done = self.fetch_once(code, key, out);
        // An entry moves at most twice during a sweep, always forward in
        // probe order. Retrying under the read side of its tag's shard
        // keeps the re-probes from interleaving with those moves.
        if !done && self.lock().sweeping.load(Ordering::Relaxed) != 0 {
            let shard = self.lock().shard((code >> 56) as u8);
            shard.read_lock();
            done = self.fetch_once(code, key, out) || self.fetch_once(code, key, out);
            shard.read_unlock();
        }
        done
    }

    fn fetch_once(&self, code: u64, key: &[u8], out: &mut Vec<u8>) -> bool {
        let tag = (code >> 56) as u8;
        let mut done = false;
        unsafe {
            search(
                self.table,
                self.total_entry.value(),
                self.total_entry.rem(code),
                |slot, _, _| {
                    let mut e = Entry(slot.load(Ordering::Acquire));
                    for _ in 0..ENTRY_RELOAD_LIMIT {
                        if e.is_empty() {
                            return e.is_clean();
                        }
                        if e.tag() != tag {
                            return false;
                        }
                        let block = self.blk_ptr(e.blk());
                        let mark = Mark(self.mark_ref(e.blk()).load(Ordering::Acquire));
                        let t = Entry(slot.load(Ordering::Acquire));
                        if !t.same(e) {
                            e = t;
                            continue;
                        }
                        if !key_match(key, mark, block) {
                            return false;
                        }
                        out.clear();
                        out.extend_from_slice(std::slice::from_raw_parts(
                            block.add(4 + mark.klen()),
                            mark.vlen(),
                        ));
                        let t = Entry(slot.load(Ordering::Acquire));
                        if !t.same(e) {
                            e = t;
                            continue;
                        }
                        done = true;
                        return true;
                    }
                    false
                },
            );
        }
        done
    }

    /// Live item count.
    pub fn item(&self) -> u64 {
        self.header().item.load(Ordering::Relaxed)
    }

    /// Bytes of data capacity still admissible for new records.
    pub fn data_free(&self) -> usize {
        let free = self.header().free_block.load(Ordering::Relaxed);
        free.saturating_sub(self.total_reserved()) as usize * BLOCK_SIZE
    }

    /// Admission ceiling on the item count.
    pub fn item_limit(&self) -> u64 {
        layout::item_limit(self.total_entry.value())
    }

    pub fn max_key_len(&self) -> usize {
        self.max_key_len
    }

    pub fn max_val_len(&self) -> usize {
        self.max_val_len
    }

    /// Write the whole dictionary image to a new file.
    pub fn dump(&self, path: &Path) -> bool {
        self.res.dump(path)
    }

    // --- internal accessors shared with the writer ---

    #[inline]
    pub(crate) fn header(&self) -> &Header {
        unsafe { &*(self.res.base_ptr() as *const Header) }
    }

    #[inline]
    pub(crate) fn lock(&self) -> &LockRegion {
        unsafe { &*self.lock }
    }

    #[inline]
    pub(crate) fn table(&self) -> *const AtomicU64 {
        self.table
    }

    #[inline]
    pub(crate) fn seed(&self) -> u64 {
        self.seed
    }

    #[inline]
    pub(crate) fn total_block(&self) -> u64 {
        self.total_block
    }

    #[inline]
    pub(crate) fn reserved_block(&self) -> u64 {
        self.reserved_block
    }

    #[inline]
    pub(crate) fn entry_divisor(&self) -> &Divisor<u64> {
        &self.total_entry
    }

    #[inline]
    pub(crate) fn total_reserved(&self) -> u64 {
        self.reserved_block + (self.total_block - self.reserved_block) / DATA_RESERVE_FACTOR
    }

    /// Pointer to the first byte of block `idx`.
    ///
    /// The index must come from a validated entry or cursor; all callers
    /// stay inside `total_block`.
    #[inline]
    pub(crate) fn blk_ptr(&self, idx: u64) -> *mut u8 {
        unsafe { self.data.add(idx as usize * BLOCK_SIZE) }
    }

    /// The record/free-run mark of block `idx` as an atomic word.
    #[inline]
    pub(crate) fn mark_ref(&self, idx: u64) -> &AtomicU64 {
        unsafe { &*(self.blk_ptr(idx) as *const AtomicU64) }
    }
}

/// Compare `key` against the record bytes behind `mark` at `block`.
/// Eight-byte keys compare as a single word.
#[inline]
pub(crate) fn key_match(key: &[u8], mark: Mark, block: *const u8) -> bool {
    if mark.klen() != key.len() {
        return false;
    }
    unsafe {
        if key.len() == 8 {
            std::ptr::read_unaligned(block.add(4) as *const u64)
                == std::ptr::read_unaligned(key.as_ptr() as *const u64)
        } else {
            std::slice::from_raw_parts(block.add(4), key.len()) == key
        }
    }
}

/// Compare `val` against the value bytes behind `mark` at `block`.
#[inline]
pub(crate) fn val_match(val: &[u8], mark: Mark, block: *const u8) -> bool {
    mark.vlen() == val.len()
        && unsafe { std::slice::from_raw_parts(block.add(4 + mark.klen()), val.len()) == val }
}
