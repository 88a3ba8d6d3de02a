//! Fixed-length engine.
//!
//! Key and value lengths are constants chosen at creation, so records
//! become equal-size slots chained per bucket. Readers walk chains
//! lock-free; the writer replaces nodes copy-on-write and parks
//! unlinked slots in a time-delayed recycle ring, so a reader that is
//! mid-copy on an unlinked node keeps seeing stable bytes for at least
//! the quarantine interval.

mod builder;
mod layout;
mod recycle;

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::divisor::Divisor;
use crate::hash::hash;
use crate::lock::{destroy_mutex, init_mutex, MasterGuard};
use crate::mmap::ResourceMap;
use crate::prefetch::{prefetch_for_future, prefetch_for_next, CACHE_LINE};
use crate::{consistency_assert, DataSource, Error, LoadPolicy, Result};

pub use builder::Config;

use layout::{
    data_off, file_size, item_size, Header, LockRegion, END, HEADER_SIZE, LOCK_OFF, MAGIC,
    MAX_CAPACITY, MAX_LOAD_FACTOR, MAX_VAL_LEN, MIN_CAPACITY, RECYCLE_OFF, STAMPS_OFF, TABLE_OFF,
};

/// Software-pipeline depth of [`FixedEstuary::batch_fetch`].
const WINDOW_SIZE: usize = 16;

/// Handle to a loaded fixed-length dictionary.
pub struct FixedEstuary {
    res: ResourceMap,
    lock: *const LockRegion,
    stamps: *mut i64,
    recycle: *const AtomicU32,
    table: *const AtomicU32,
    data: *mut u8,
    key_len: usize,
    val_len: usize,
    item_size: usize,
    capacity: u32,
    seed: u64,
    total_entry: Divisor<u64>,
    monopoly_extra: Option<Box<LockRegion>>,
}

// All shared mutable state lives in the mapping and is accessed through
// atomics; writers serialize on the in-map master mutex.
unsafe impl Send for FixedEstuary {}
unsafe impl Sync for FixedEstuary {}

impl Drop for FixedEstuary {
    fn drop(&mut self) {
        if let Some(extra) = &self.monopoly_extra {
            unsafe { destroy_mutex(extra.mutex_ptr()) };
        }
    }
}

impl FixedEstuary {
    /// Attach to a dictionary file.
    pub fn load(path: &Path, policy: LoadPolicy) -> Option<FixedEstuary> {
        let res = match policy {
            LoadPolicy::Shared => ResourceMap::open(path, true, false)?,
            LoadPolicy::Monopoly => ResourceMap::open(path, true, true)?,
            LoadPolicy::CopyData => ResourceMap::load_by_copy(path)?,
        };
        Self::init(res, policy != LoadPolicy::Shared, &path.display().to_string())
    }

    /// Attach to a dictionary image produced by `fill` in private
    /// anonymous memory.
    pub fn load_with(size: usize, fill: impl FnOnce(&mut [u8]) -> bool) -> Option<FixedEstuary> {
        let res = ResourceMap::anonymous(size, fill)?;
        Self::init(res, true, "<memory>")
    }

    fn init(res: ResourceMap, monopoly: bool, name: &str) -> Option<FixedEstuary> {
        if res.len() < HEADER_SIZE {
            log::error!("broken file: {name}");
            return None;
        }
        let hdr = unsafe { &*(res.base_ptr() as *const Header) };
        let item_size = item_size(hdr.key_len as usize, hdr.val_len as usize);
        if hdr.magic != MAGIC
            || hdr.key_len == 0
            || hdr.val_len as usize > MAX_VAL_LEN
            || hdr.capacity < MIN_CAPACITY
            || hdr.capacity > MAX_CAPACITY
            || hdr.total_entry == 0
            || hdr.capacity / hdr.total_entry > MAX_LOAD_FACTOR
            || res.len() < file_size(hdr.total_entry, hdr.capacity, item_size)
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

        Some(FixedEstuary {
            stamps: unsafe { res.base_ptr().add(STAMPS_OFF) } as *mut i64,
            recycle: unsafe { res.base_ptr().add(RECYCLE_OFF) } as *const AtomicU32,
            table: unsafe { res.base_ptr().add(TABLE_OFF) } as *const AtomicU32,
            data: unsafe { res.base_ptr().add(data_off(hdr.total_entry)) },
            key_len: hdr.key_len as usize,
            val_len: hdr.val_len as usize,
            item_size,
            capacity: hdr.capacity,
            seed: hdr.seed,
            total_entry: Divisor::<u64>::new(hdr.total_entry as u64),
            lock,
            monopoly_extra,
            res,
        })
    }

    /// Fetch the value for `key` into `val`. Lock-free. `key` must be
    /// exactly `key_len()` bytes and `val` at least `val_len()`.
    pub fn fetch(&self, key: &[u8], val: &mut [u8]) -> bool {
        if key.len() != self.key_len || val.len() < self.val_len {
            return false;
        }
        let mut idx = self.bucket(self.entry_of(key)).load(Ordering::Acquire);
        while idx != END {
            let node = self.node_ptr(idx);
            if self.node_key_eq(node, key) {
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        node.add(4 + self.key_len),
                        val.as_mut_ptr(),
                        self.val_len,
                    );
                }
                return true;
            }
            idx = self.link_at(idx).load(Ordering::Acquire);
        }
        false
    }

    /// Fetch many keys through a 16-deep software pipeline: every probe
    /// in the window advances one step per round, so the prefetch issued
    /// for its next node has landed by the time it is dereferenced.
    ///
    /// `keys` is `n × key_len()` bytes, `out` is `n × val_len()`. A
    /// missing key leaves its line untouched, or copies `default` when
    /// given. Returns the hit count.
    pub fn batch_fetch(&self, keys: &[u8], out: &mut [u8], default: Option<&[u8]>) -> usize {
        let batch = keys.len() / self.key_len;
        assert!(out.len() >= batch * self.val_len);
        if let Some(d) = default {
            assert!(d.len() >= self.val_len);
        }

        #[derive(Clone, Copy)]
        struct Probe {
            idx: usize,
            ent: u32,
            node: Option<u32>,
        }
        let mut probes = [Probe { idx: 0, ent: 0, node: None }; WINDOW_SIZE];

        let prime = |idx: usize| {
            let key = &keys[idx * self.key_len..(idx + 1) * self.key_len];
            let ent = self.entry_of(key);
            prefetch_for_next(self.bucket(ent) as *const AtomicU32 as *const u8);
            Probe { idx, ent, node: None }
        };

        let mut hit = 0;
        let mut window = batch.min(WINDOW_SIZE);
        for (i, probe) in probes.iter_mut().take(window).enumerate() {
            *probe = prime(i);
        }
        let mut feed = window;

        while window > 0 {
            let mut i = 0;
            while i < window {
                let cur = probes[i];
                let key = &keys[cur.idx * self.key_len..(cur.idx + 1) * self.key_len];
                let mut matched = false;
                let next = match cur.node {
                    None => self.bucket(cur.ent).load(Ordering::Acquire),
                    Some(at) => {
                        let node = self.node_ptr(at);
                        if self.node_key_eq(node, key) {
                            let line = cur.idx * self.val_len;
                            unsafe {
                                std::ptr::copy_nonoverlapping(
                                    node.add(4 + self.key_len),
                                    out[line..line + self.val_len].as_mut_ptr(),
                                    self.val_len,
                                );
                            }
                            hit += 1;
                            matched = true;
                            END
                        } else {
                            self.link_at(at).load(Ordering::Acquire)
                        }
                    }
                };
                if !matched {
                    if next != END {
                        probes[i].node = Some(next);
                        let node = self.node_ptr(next);
                        prefetch_for_next(node);
                        // A key or value straddling the cache-line
                        // boundary wants the following line too.
                        let off = node as usize & (CACHE_LINE - 1);
                        let edge = ((node as usize & !(CACHE_LINE - 1)) + CACHE_LINE) as *const u8;
                        if off + 4 + self.key_len > CACHE_LINE {
                            prefetch_for_next(edge);
                        } else if off + 4 + self.key_len + self.val_len > CACHE_LINE {
                            prefetch_for_future(edge);
                        }
                        i += 1;
                        continue;
                    }
                    if let Some(d) = default {
                        let line = cur.idx * self.val_len;
                        out[line..line + self.val_len].copy_from_slice(&d[..self.val_len]);
                    }
                }
                // This probe is finished; feed the next key into its
                // window slot, or shrink the window.
                if feed < batch {
                    probes[i] = prime(feed);
                    feed += 1;
                    i += 1;
                } else {
                    window -= 1;
                    probes[i] = probes[window];
                }
            }
        }
        hit
    }

    /// Insert or replace `key`. `Ok(false)` when the dictionary is at
    /// capacity; `Err` only on lock failure or detected corruption.
    pub fn update(&self, key: &[u8], val: &[u8]) -> Result<bool> {
        if key.len() != self.key_len || val.len() != self.val_len {
            return Ok(false);
        }
        let _master = unsafe { MasterGuard::lock(self.lock().mutex_ptr()) }?;
        let hdr = self.header();
        if hdr.writing.load(Ordering::Relaxed) != 0 {
            return Err(Error::Data);
        }
        hdr.writing.store(1, Ordering::Relaxed);
        let done = self.do_update(key, val);
        if done.is_ok() {
            hdr.writing.store(0, Ordering::Relaxed);
        }
        done
    }

    /// Remove `key`. `Ok(false)` when absent.
    pub fn erase(&self, key: &[u8]) -> Result<bool> {
        if key.len() != self.key_len {
            return Ok(false);
        }
        let _master = unsafe { MasterGuard::lock(self.lock().mutex_ptr()) }?;
        let hdr = self.header();
        if hdr.writing.load(Ordering::Relaxed) != 0 {
            return Err(Error::Data);
        }
        hdr.writing.store(1, Ordering::Relaxed);
        let done = self.do_erase(key);
        if done.is_ok() {
            hdr.writing.store(0, Ordering::Relaxed);
        }
        done
    }

    /// Apply every record of `source` under one mutex acquisition,
    /// stopping at the first rejected record. Returns the count applied.
    pub fn batch_update(&self, source: &mut dyn DataSource) -> Result<usize> {
        let total = source.total();
        if total == 0 {
            return Ok(0);
        }
        source.reset();
        let _master = unsafe { MasterGuard::lock(self.lock().mutex_ptr()) }?;
        let hdr = self.header();
        if hdr.writing.load(Ordering::Relaxed) != 0 {
            return Err(Error::Data);
        }
        hdr.writing.store(1, Ordering::Relaxed);
        let mut applied = 0;
        while applied < total {
            let rec = source.read();
            if rec.key.len() != self.key_len || rec.val.len() != self.val_len {
                break;
            }
            match self.do_update(rec.key, rec.val) {
                Ok(true) => applied += 1,
                Ok(false) => break,
                Err(err) => return Err(err),
            }
        }
        hdr.writing.store(0, Ordering::Relaxed);
        Ok(applied)
    }

    fn do_update(&self, key: &[u8], val: &[u8]) -> Result<bool> {
        let hdr = self.header();
        consistency_assert(hdr.free_head.load(Ordering::Relaxed) != END)?;

        let ent = self.entry_of(key);
        let mut knot = self.bucket(ent);
        loop {
            let idx = knot.load(Ordering::Relaxed);
            if idx == END {
                break;
            }
            let node = self.node_ptr(idx);
            if self.node_key_eq(node, key) {
                let old_val =
                    unsafe { std::slice::from_raw_parts(node.add(4 + self.key_len), self.val_len) };
                if old_val != val {
                    // Copy-on-write: a reader may be mid-copy on this
                    // node, so it is replaced, never edited.
                    let neo = self.alloc_node(key, val);
                    let next = self.link_at(idx).load(Ordering::Relaxed);
                    self.link_at(neo).store(next, Ordering::Relaxed);
                    knot.store(neo, Ordering::Release);
                    self.quarantine(idx)?;
                }
                return Ok(true);
            }
            knot = self.link_at(idx);
        }

        if hdr.item.load(Ordering::Relaxed) >= self.capacity {
            return Ok(false);
        }
        let neo = self.alloc_node(key, val);
        self.link_at(neo)
            .store(self.bucket(ent).load(Ordering::Relaxed), Ordering::Relaxed);
        self.bucket(ent).store(neo, Ordering::Release);
        hdr.item.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn do_erase(&self, key: &[u8]) -> Result<bool> {
        let hdr = self.header();
        let mut knot = self.bucket(self.entry_of(key));
        loop {
            let idx = knot.load(Ordering::Relaxed);
            if idx == END {
                return Ok(false);
            }
            let node = self.node_ptr(idx);
            if self.node_key_eq(node, key) {
                let next = self.link_at(idx).load(Ordering::Relaxed);
                knot.store(next, Ordering::Release);
                self.quarantine(idx)?;
                hdr.item.fetch_sub(1, Ordering::Relaxed);
                return Ok(true);
            }
            knot = self.link_at(idx);
        }
    }

    /// Pop a free slot and fill it. The caller links it in afterwards.
    fn alloc_node(&self, key: &[u8], val: &[u8]) -> u32 {
        let hdr = self.header();
        let id = hdr.free_head.load(Ordering::Relaxed);
        let next_free = self.link_at(id).load(Ordering::Relaxed);
        hdr.free_head.store(next_free, Ordering::Relaxed);
        if next_free == END {
            hdr.free_tail.store(END, Ordering::Relaxed);
        }
        let node = self.node_ptr(id);
        unsafe {
            std::ptr::copy_nonoverlapping(key.as_ptr(), node.add(4), self.key_len);
            std::ptr::copy_nonoverlapping(val.as_ptr(), node.add(4 + self.key_len), self.val_len);
        }
        id
    }

    pub fn key_len(&self) -> usize {
        self.key_len
    }

    pub fn val_len(&self) -> usize {
        self.val_len
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Live item count.
    pub fn item(&self) -> u32 {
        self.header().item.load(Ordering::Relaxed)
    }

    /// Write the whole dictionary image to a new file.
    pub fn dump(&self, path: &Path) -> bool {
        self.res.dump(path)
    }

    // --- internal accessors ---

    #[inline]
    pub(crate) fn header(&self) -> &Header {
        unsafe { &*(self.res.base_ptr() as *const Header) }
    }

    #[inline]
    fn lock(&self) -> &LockRegion {
        unsafe { &*self.lock }
    }

    #[inline]
    fn entry_of(&self, key: &[u8]) -> u32 {
        self.total_entry.rem(hash(key, self.seed)) as u32
    }

    #[inline]
    pub(crate) fn bucket(&self, ent: u32) -> &AtomicU32 {
        unsafe { &*self.table.add(ent as usize) }
    }

    #[inline]
    pub(crate) fn node_ptr(&self, idx: u32) -> *mut u8 {
        unsafe { self.data.add(idx as usize * self.item_size) }
    }

    /// The slot's link word: chain `next` while live, free-list pointer
    /// while free.
    #[inline]
    pub(crate) fn link_at(&self, idx: u32) -> &AtomicU32 {
        unsafe { &*(self.node_ptr(idx) as *const AtomicU32) }
    }

    #[inline]
    fn node_key_eq(&self, node: *const u8, key: &[u8]) -> bool {
        unsafe {
            if self.key_len == 8 {
                std::ptr::read_unaligned(node.add(4) as *const u64)
                    == std::ptr::read_unaligned(key.as_ptr() as *const u64)
            } else {
                std::slice::from_raw_parts(node.add(4), self.key_len) == key
            }
        }
    }

    #[inline]
    pub(crate) fn stamp_at(&self, bin: usize) -> *mut i64 {
        unsafe { self.stamps.add(bin) }
    }

    #[inline]
    pub(crate) fn recycle_slot(&self, i: usize) -> &AtomicU32 {
        unsafe { &*self.recycle.add(i) }
    }
}
