//! Offline construction of fixed-length dictionary files: `create` with
//! optional bulk ingestion, and `extend` to grow slot capacity of an
//! existing file in place.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::lock::init_mutex;
use crate::mmap::ResourceMap;
use crate::DataSource;

use super::layout::{
    data_off, file_size, item_size, Header, END, HEADER_SIZE, LOCK_OFF, MAGIC, MAX_CAPACITY,
    MAX_KEY_LEN, MAX_LOAD_FACTOR, MAX_VAL_LEN, MIN_CAPACITY, RECYCLE_CAPACITY,
};
use super::FixedEstuary;

/// Sizing of a new fixed-length dictionary file. Key and value lengths
/// are frozen into the file; every record must match them exactly.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bucket count; immutable for the life of the file.
    pub entry: u32,
    /// Item capacity: 65536 ..= 2^32 − 65536, at most `2 × entry`.
    pub capacity: u32,
    /// 1 ..= 255.
    pub key_len: usize,
    /// 0 ..= 65536.
    pub val_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            entry: MIN_CAPACITY,
            capacity: MIN_CAPACITY,
            key_len: 8,
            val_len: 0,
        }
    }
}

fn new_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

impl FixedEstuary {
    /// Build a dictionary file at `path`, optionally ingesting `source`.
    pub fn create(path: &Path, config: &Config, source: Option<&mut dyn DataSource>) -> bool {
        if config.capacity < MIN_CAPACITY
            || config.capacity > MAX_CAPACITY
            || config.entry == 0
            || config.capacity / config.entry > MAX_LOAD_FACTOR
            || config.key_len == 0
            || config.key_len > MAX_KEY_LEN
            || config.val_len > MAX_VAL_LEN
        {
            log::error!("bad arguments");
            return false;
        }

        let item_size = item_size(config.key_len, config.val_len);
        // Quarantined slots stay allocated past `capacity`, so the slab
        // over-provisions by one full recycle ring.
        let slots = config.capacity as usize + RECYCLE_CAPACITY;
        let Some(res) = ResourceMap::create(path, file_size(config.entry, config.capacity, item_size))
        else {
            return false;
        };

        let header = Header {
            magic: MAGIC,
            writing: AtomicU8::new(0),
            key_len: config.key_len as u8,
            val_len: config.val_len as u32,
            total_entry: config.entry,
            capacity: config.capacity,
            seed: new_seed(),
            item: AtomicU32::new(0),
            recycle_r: AtomicU16::new(0),
            recycle_w: AtomicU16::new(0),
            free_head: AtomicU32::new(0),
            free_tail: AtomicU32::new(0),
        };
        unsafe {
            std::ptr::write(res.base_ptr() as *mut Header, header);
            if !init_mutex(res.base_ptr().add(LOCK_OFF), true) {
                log::error!("fail to init");
                return false;
            }
        }

        let name = path.display().to_string();
        let Some(dict) = Self::init(res, false, &name) else {
            log::error!("fail to init");
            return false;
        };
        for i in 0..RECYCLE_CAPACITY {
            dict.recycle_slot(i).store(END, Ordering::Relaxed);
        }
        for ent in 0..config.entry {
            dict.bucket(ent).store(END, Ordering::Relaxed);
        }

        let mut cnt: u32 = 0;
        if let Some(src) = source {
            src.reset();
            let total = src.total();
            if total > config.capacity as usize {
                log::error!("too many items");
                return false;
            }
            for _ in 0..total {
                let rec = src.read();
                if rec.key.len() != config.key_len || rec.val.len() != config.val_len {
                    log::error!("broken item");
                    return false;
                }
                dict.build_insert(rec.key, rec.val, &mut cnt);
            }
        }

        // Nodes cnt.. form the initial free list.
        let hdr = dict.header();
        hdr.item.store(cnt, Ordering::Relaxed);
        hdr.free_head.store(cnt, Ordering::Relaxed);
        hdr.free_tail.store(slots as u32 - 1, Ordering::Relaxed);
        for i in cnt..slots as u32 - 1 {
            dict.link_at(i).store(i + 1, Ordering::Relaxed);
        }
        dict.link_at(slots as u32 - 1).store(END, Ordering::Relaxed);
        true
    }

    /// Chain-insert during ingestion; a repeated key overwrites its
    /// value in place.
    fn build_insert(&self, key: &[u8], val: &[u8], cnt: &mut u32) {
        let ent = self.entry_of(key);
        let mut idx = self.bucket(ent).load(Ordering::Relaxed);
        while idx != END {
            let node = self.node_ptr(idx);
            if unsafe { std::slice::from_raw_parts(node.add(4), key.len()) } == key {
                unsafe {
                    std::ptr::copy_nonoverlapping(val.as_ptr(), node.add(4 + key.len()), val.len());
                }
                return;
            }
            idx = self.link_at(idx).load(Ordering::Relaxed);
        }
        let id = *cnt;
        *cnt += 1;
        let node = self.node_ptr(id);
        self.link_at(id)
            .store(self.bucket(ent).load(Ordering::Relaxed), Ordering::Relaxed);
        unsafe {
            std::ptr::copy_nonoverlapping(key.as_ptr(), node.add(4), key.len());
            std::ptr::copy_nonoverlapping(val.as_ptr(), node.add(4 + key.len()), val.len());
        }
        self.bucket(ent).store(id, Ordering::Relaxed);
    }

    /// Grow the slot capacity of a closed dictionary file by `percent`
    /// (1–100). The bucket count is immutable; the grown capacity must
    /// stay within `2 × entry`. `out` receives the configuration
    /// describing the grown file.
    pub fn extend(path: &Path, percent: u32, out: Option<&mut Config>) -> bool {
        if percent == 0 || percent > 100 {
            log::error!("illegal parameters");
            return false;
        }
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => f,
            Err(e) => {
                log::error!("fail to open file: {} ({e})", path.display());
                return false;
            }
        };
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_NB | libc::LOCK_EX) } != 0 {
            log::error!("fail to lock file: {}", path.display());
            return false;
        }
        let size = file.metadata().map(|m| m.len()).unwrap_or(0) as usize;

        let mut head = [0u8; HEADER_SIZE];
        if file.read_exact_at(&mut head, 0).is_err() {
            log::error!("fail to read file: {}", path.display());
            return false;
        }
        let magic = u16::from_le_bytes([head[0], head[1]]);
        let writing = head[2];
        let key_len = head[3] as usize;
        let val_len = u32::from_le_bytes(head[4..8].try_into().unwrap()) as usize;
        let entries = u32::from_le_bytes(head[8..12].try_into().unwrap());
        let capacity = u32::from_le_bytes(head[12..16].try_into().unwrap());
        let free_tail = u32::from_le_bytes(head[36..40].try_into().unwrap());

        let item_size = item_size(key_len, val_len);
        let ext = ((capacity as u64 * percent as u64 + 99) / 100) as u32;
        if magic != MAGIC
            || writing != 0
            || key_len == 0
            || val_len > MAX_VAL_LEN
            || entries == 0
            || capacity < MIN_CAPACITY
            || size < file_size(entries, capacity, item_size)
        {
            log::error!("broken data: {}", path.display());
            return false;
        }
        if capacity.checked_add(ext).is_none()
            || capacity + ext > MAX_CAPACITY
            || (capacity + ext) / entries > MAX_LOAD_FACTOR
        {
            log::error!("illegal parameters");
            return false;
        }

        let old_slots = capacity + RECYCLE_CAPACITY as u32;
        if file
            .set_len((size + ext as usize * item_size) as u64)
            .is_err()
        {
            log::error!("fail to write file: {}", path.display());
            return false;
        }

        // Chain the appended slots and splice them onto the free list.
        let slot_off = |idx: u32| (data_off(entries) + idx as usize * item_size) as u64;
        for i in 0..ext {
            let next = if i + 1 < ext { old_slots + i + 1 } else { END };
            if file
                .write_all_at(&next.to_le_bytes(), slot_off(old_slots + i))
                .is_err()
            {
                log::error!("fail to write file: {}", path.display());
                return false;
            }
        }
        let attach = if free_tail == END {
            // Empty free list: the new run becomes the whole list.
            file.write_all_at(&old_slots.to_le_bytes(), 32)
        } else {
            file.write_all_at(&old_slots.to_le_bytes(), slot_off(free_tail))
        };
        if attach.is_err()
            || file
                .write_all_at(&(old_slots + ext - 1).to_le_bytes(), 36)
                .is_err()
            || file
                .write_all_at(&(capacity + ext).to_le_bytes(), 12)
                .is_err()
        {
            log::error!("fail to write file: {}", path.display());
            return false;
        }

        if let Some(cfg) = out {
            cfg.entry = entries;
            cfg.capacity = capacity + ext;
            cfg.key_len = key_len;
            cfg.val_len = val_len;
        }
        true
    }
}
