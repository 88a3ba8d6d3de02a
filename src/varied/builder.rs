//! Offline construction of variable-length dictionary files: `create`
//! with optional bulk ingestion, and `extend` to grow the data region
//! of an existing file in place.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::hash::hash;
use crate::lock::init_mutex;
use crate::mmap::ResourceMap;
use crate::DataSource;

use super::layout::{
    data_off, file_size, item_limit, record_blocks, total_entry, Entry, Header, Mark, BLOCK_SIZE,
    DATA_BLOCK_LIMIT, DATA_RESERVE_FACTOR, HEADER_SIZE, LOCK_OFF, MAGIC, MAX_ENTRY, MAX_KEY_LEN,
    MAX_VAL_LEN, MIN_ENTRY, TABLE_OFF,
};
use super::table::search;
use super::Estuary;

/// Sizing of a new dictionary file.
///
/// `avg_item_size` is advisory: the data region is provisioned for
/// `item_limit` records of that average size plus reserve, so a
/// heavy-tailed value distribution needs a larger figure than the
/// arithmetic mean.
#[derive(Debug, Clone)]
pub struct Config {
    /// Admission ceiling on the item count (85 ..= 2^34 × 2/3).
    pub item_limit: u64,
    /// 1 ..= 255.
    pub max_key_len: usize,
    /// 1 ..= 2^24 − 1.
    pub max_val_len: usize,
    /// 2 ..= max_key_len + max_val_len.
    pub avg_item_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            item_limit: 1000,
            max_key_len: 32,
            max_val_len: 1 << 20,
            avg_item_size: 2048,
        }
    }
}

fn new_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

impl Estuary {
    /// Build a dictionary file at `path`, optionally ingesting `source`.
    /// Returns false (with a logged reason) on bad arguments, I/O
    /// trouble, or a source that outgrows the configured capacity.
    pub fn create(path: &Path, config: &Config, source: Option<&mut dyn DataSource>) -> bool {
        let te = total_entry(config.item_limit);
        if !(MIN_ENTRY..=MAX_ENTRY).contains(&te)
            || config.max_key_len == 0
            || config.max_key_len > MAX_KEY_LEN
            || config.max_val_len == 0
            || config.max_val_len > MAX_VAL_LEN
            || config.avg_item_size < 2
            || config.avg_item_size > config.max_key_len + config.max_val_len
        {
            log::error!("bad arguments");
            return false;
        }

        // Provision for item_limit average-size records, then the 1/10
        // admission reserve and two worst-case records for relocation.
        let block_per_item = (config.avg_item_size + 4).div_ceil(BLOCK_SIZE) as u64;
        let mut total_block = block_per_item * (config.item_limit + 1);
        let init_end = total_block;
        total_block += total_block / (DATA_RESERVE_FACTOR - 1) + 1;
        total_block += record_blocks(config.max_key_len, config.max_val_len) * 2;
        if total_block > DATA_BLOCK_LIMIT {
            log::error!("too big");
            return false;
        }

        let Some(res) = ResourceMap::create(path, file_size(te, total_block)) else {
            return false;
        };

        let header = Header {
            magic: MAGIC,
            _pad: 0,
            writing: AtomicU8::new(0),
            kv_limit: Mark::limits(config.max_key_len, config.max_val_len),
            seed: new_seed(),
            item: AtomicU64::new(0),
            total_entry: te,
            clean_entry: AtomicU64::new(te),
            total_block,
            free_block: AtomicU64::new(total_block),
            block_cursor: AtomicU64::new(0),
        };
        unsafe {
            std::ptr::write(res.base_ptr() as *mut Header, header);
            if !init_mutex(res.base_ptr().add(LOCK_OFF), true) {
                log::error!("fail to init");
                return false;
            }
            let table = res.base_ptr().add(TABLE_OFF) as *mut u64;
            for i in 0..te as usize {
                *table.add(i) = Entry::CLEAN.0;
            }
        }

        let name = path.display().to_string();
        let Some(dict) = Self::init(res, false, &name) else {
            log::error!("fail to init");
            return false;
        };

        if let Some(src) = source {
            src.reset();
            let total = src.total();
            if total as u64 > config.item_limit {
                log::error!("too many items");
                return false;
            }
            for _ in 0..total {
                let rec = src.read();
                if rec.key.is_empty()
                    || rec.key.len() > config.max_key_len
                    || rec.val.len() > config.max_val_len
                {
                    log::error!("broken item");
                    return false;
                }
                if !dict.build_insert(rec.key, rec.val, init_end) {
                    return false;
                }
            }
        }

        let hdr = dict.header();
        let cursor = hdr.block_cursor.load(Ordering::Relaxed);
        dict.mark_ref(cursor)
            .store(Mark::for_empty(total_block - cursor).0, Ordering::Release);
        true
    }

    /// Simplified insert for ingestion: no sweep, no wrap, and the
    /// cursor must stay within `init_end`. A repeated key overwrites its
    /// earlier value, freeing the earlier blocks.
    fn build_insert(&self, key: &[u8], val: &[u8], init_end: u64) -> bool {
        let hdr = self.header();
        let code = hash(key, self.seed());
        let tag = (code >> 56) as u8;
        let mut done = false;
        unsafe {
            search(
                self.table(),
                self.entry_divisor().value(),
                self.entry_divisor().rem(code),
                |slot, _, dist| {
                    let e = Entry(slot.load(Ordering::Relaxed));
                    if e.is_empty() {
                        hdr.item.fetch_add(1, Ordering::Relaxed);
                        hdr.clean_entry.fetch_sub(1, Ordering::Relaxed);
                    } else if e.tag() == tag {
                        let mark = Mark(self.mark_ref(e.blk()).load(Ordering::Relaxed));
                        if !super::key_match(key, mark, self.blk_ptr(e.blk())) {
                            return false;
                        }
                        let bcnt = mark.blocks();
                        self.mark_ref(e.blk())
                            .store(Mark::for_empty(bcnt).0, Ordering::Relaxed);
                        hdr.free_block.fetch_add(bcnt, Ordering::Relaxed);
                    } else {
                        return false;
                    }
                    let bcnt = record_blocks(key.len(), val.len());
                    let neo = hdr.block_cursor.load(Ordering::Relaxed);
                    hdr.block_cursor.store(neo + bcnt, Ordering::Relaxed);
                    if neo + bcnt > init_end {
                        log::error!("out of data capacity");
                        return true;
                    }
                    hdr.free_block.fetch_sub(bcnt, Ordering::Relaxed);
                    let tip = self.fill_record(neo, key, val);
                    slot.store(Entry::new(neo, tip, tag, dist).0, Ordering::Relaxed);
                    done = true;
                    true
                },
            );
        }
        done
    }

    /// Grow the data region of a closed dictionary file by `percent`
    /// (1–100) of its non-reserved block count. The entry table is
    /// immutable; only data capacity changes. `out` receives the
    /// configuration describing the grown file.
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
        let writing = head[3];
        let kv_limit = u32::from_le_bytes(head[4..8].try_into().unwrap());
        let entries = u64::from_le_bytes(head[24..32].try_into().unwrap());
        let total_block = u64::from_le_bytes(head[40..48].try_into().unwrap());
        let free_block = u64::from_le_bytes(head[48..56].try_into().unwrap());

        let limits = Mark(kv_limit as u64);
        let reserved = record_blocks(limits.klen(), limits.vlen()) * 2;
        if magic != MAGIC
            || writing != 0
            || !(MIN_ENTRY..=MAX_ENTRY).contains(&entries)
            || total_block <= reserved
            || size < file_size(entries, total_block)
        {
            log::error!("broken data: {}", path.display());
            return false;
        }
        let bcnt = total_block - reserved;
        let ext = (bcnt * percent as u64 + 99) / 100;
        if total_block + ext > DATA_BLOCK_LIMIT {
            log::error!("broken data: {}", path.display());
            return false;
        }

        if file.set_len((size + ext as usize * BLOCK_SIZE) as u64).is_err() {
            log::error!("fail to write file: {}", path.display());
            return false;
        }
        // The zero-filled extension becomes one free run headed at the
        // old arena end; the header then accounts for it.
        let run_off = (data_off(entries) + total_block as usize * BLOCK_SIZE) as u64;
        if file
            .write_all_at(&Mark::for_empty(ext).0.to_le_bytes(), run_off)
            .is_err()
            || file
                .write_all_at(&(total_block + ext).to_le_bytes(), 40)
                .is_err()
            || file
                .write_all_at(&(free_block + ext).to_le_bytes(), 48)
                .is_err()
        {
            log::error!("fail to write file: {}", path.display());
            return false;
        }

        if let Some(cfg) = out {
            cfg.max_key_len = limits.klen();
            cfg.max_val_len = limits.vlen();
            cfg.item_limit = item_limit(entries);
            let mut usable = bcnt + ext;
            usable -= usable / DATA_RESERVE_FACTOR;
            cfg.avg_item_size = (((usable * BLOCK_SIZE as u64)
                .saturating_sub(cfg.item_limit * (BLOCK_SIZE as u64 / 2))
                / cfg.item_limit) as usize)
                .saturating_sub(4);
        }
        true
    }
}
