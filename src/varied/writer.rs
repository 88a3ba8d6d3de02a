//! Write path of the variable-length engine: erase, update, the
//! tombstone sweep, and the relocating block allocator.
//!
//! Everything here runs under the master mutex, with the `writing` flag
//! set so a crash mid-write is detected at the next load. Entries and
//! marks that readers can observe are published with release stores;
//! writer-private bookkeeping uses relaxed operations.

use std::sync::atomic::{fence, Ordering};

use crate::hash::hash;
use crate::lock::MasterGuard;
use crate::{consistency_assert, Error, Result};

use super::layout::{
    item_limit, record_blocks, Entry, Mark, ENTRY_RESERVE_FACTOR, MAX_OFF_MARK,
};
use super::table::search;
use super::{key_match, val_match, Estuary};

impl Estuary {
    /// Remove `key`. `Ok(false)` when absent; `Err` only on lock
    /// failure or detected corruption.
    pub fn erase(&self, key: &[u8]) -> Result<bool> {
        if key.is_empty() || key.len() > self.max_key_len() {
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
            // A failed invariant leaves the flag set: the file is no
            // longer trustworthy and the next load must reject it.
            hdr.writing.store(0, Ordering::Relaxed);
        }
        done
    }

    /// Insert or replace `key`. `Ok(false)` when admission fails; `Err`
    /// only on lock failure or detected corruption.
    pub fn update(&self, key: &[u8], val: &[u8]) -> Result<bool> {
        if key.is_empty() || key.len() > self.max_key_len() || val.len() > self.max_val_len() {
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

    fn do_erase(&self, key: &[u8]) -> Result<bool> {
        let hdr = self.header();
        let code = hash(key, self.seed());
        let tag = (code >> 56) as u8;
        let mut result = Ok(false);
        unsafe {
            search(
                self.table(),
                self.entry_divisor().value(),
                self.entry_divisor().rem(code),
                |slot, _, _| {
                    let e = Entry(slot.load(Ordering::Relaxed));
                    if e.is_empty() {
                        return e.is_clean();
                    }
                    if e.tag() != tag {
                        return false;
                    }
                    let block = self.blk_ptr(e.blk());
                    let mark = Mark(self.mark_ref(e.blk()).load(Ordering::Relaxed));
                    if let Err(err) =
                        consistency_assert(!mark.is_free() && mark.vlen() <= self.max_val_len())
                    {
                        result = Err(err);
                        return true;
                    }
                    if !key_match(key, mark, block) {
                        return false;
                    }
                    slot.store(Entry::DELETED.0, Ordering::Release);
                    if let Err(err) = consistency_assert(hdr.item.load(Ordering::Relaxed) != 0) {
                        result = Err(err);
                        return true;
                    }
                    hdr.item.fetch_sub(1, Ordering::Relaxed);
                    let bcnt = mark.blocks();
                    self.mark_ref(e.blk())
                        .store(Mark::for_empty(bcnt).0, Ordering::Release);
                    let free = hdr.free_block.fetch_add(bcnt, Ordering::Relaxed) + bcnt;
                    result = consistency_assert(free <= self.total_block()).map(|_| true);
                    true
                },
            );
        }
        result
    }

    fn do_update(&self, key: &[u8], val: &[u8]) -> Result<bool> {
        let hdr = self.header();
        let total = self.entry_divisor().value();
        let new_block = record_blocks(key.len(), val.len());
        let code = hash(key, self.seed());

        // Admission: enough free blocks past the reserve, and at the
        // item ceiling only a replacement may proceed.
        if hdr.free_block.load(Ordering::Relaxed) < new_block + self.total_reserved() {
            return Ok(false);
        }
        if hdr.item.load(Ordering::Relaxed) >= item_limit(total) && !self.probe_contains(code, key)
        {
            return Ok(false);
        }
        consistency_assert(
            hdr.block_cursor.load(Ordering::Relaxed) < self.total_block()
                && hdr.free_block.load(Ordering::Relaxed) <= self.total_block()
                && hdr.clean_entry.load(Ordering::Relaxed) <= total,
        )?;

        if hdr.clean_entry.load(Ordering::Relaxed) <= total / ENTRY_RESERVE_FACTOR {
            self.sweep()?;
        }

        {
            let cur = hdr.block_cursor.load(Ordering::Relaxed);
            let m = Mark(self.mark_ref(cur).load(Ordering::Relaxed));
            consistency_assert(m.is_free() && cur + m.bcnt() <= self.total_block())?;
            consistency_assert(m.bcnt() >= self.reserved_block())?;
        }

        // An entry observed while its record was relocated; used to
        // force a distinct word if the final publish would replay it.
        let mut origin = Entry::CLEAN;

        self.defragment(new_block, code, key, &mut origin)?;

        // Claim `new_block` blocks at the cursor and materialize the
        // record there; the remainder of the run keeps the cursor
        // invariant alive.
        hdr.free_block.fetch_sub(new_block, Ordering::Relaxed);
        let neo = hdr.block_cursor.load(Ordering::Relaxed);
        let run = Mark(self.mark_ref(neo).load(Ordering::Relaxed)).bcnt();
        let next = neo + new_block;
        self.mark_ref(next)
            .store(Mark::for_empty(run - new_block).0, Ordering::Release);
        self.mark_ref(neo)
            .store(Mark::for_empty(new_block).0, Ordering::Release);
        hdr.block_cursor.store(next, Ordering::Relaxed);
        let tip = self.fill_record(neo, key, val);

        // Publish: replace in place if the key exists anywhere on its
        // probe path, otherwise claim the first empty slot seen.
        let tag = (code >> 56) as u8;
        let mut bookmark: Option<(u64, Entry)> = None;
        let mut result: Option<Result<bool>> = None;
        unsafe {
            search(
                self.table(),
                total,
                self.entry_divisor().rem(code),
                |slot, pos, dist| {
                    let e = Entry(slot.load(Ordering::Relaxed));
                    if e.is_empty() {
                        if bookmark.is_none() {
                            bookmark = Some((pos, Entry::new(neo, tip, tag, dist)));
                        }
                        return e.is_clean();
                    }
                    if e.tag() != tag {
                        return false;
                    }
                    let block = self.blk_ptr(e.blk());
                    let mark = Mark(self.mark_ref(e.blk()).load(Ordering::Relaxed));
                    if let Err(err) =
                        consistency_assert(!mark.is_free() && mark.vlen() <= self.max_val_len())
                    {
                        result = Some(Err(err));
                        return true;
                    }
                    if !key_match(key, mark, block) {
                        return false;
                    }
                    let bcnt = mark.blocks();
                    if val_match(val, mark, block) {
                        // No-op rewrite: merge the fresh allocation back
                        // into the cursor run instead of republishing,
                        // which would open an ABA window for readers.
                        let cur = hdr.block_cursor.load(Ordering::Relaxed);
                        let tail = Mark(self.mark_ref(cur).load(Ordering::Relaxed)).bcnt();
                        hdr.block_cursor.store(neo, Ordering::Relaxed);
                        self.mark_ref(neo)
                            .store(Mark::for_empty(bcnt + tail).0, Ordering::Release);
                    } else {
                        let mut entry = Entry::new(neo, tip, tag, dist);
                        if entry.same(origin) {
                            entry = entry.flip_tip();
                        }
                        slot.store(entry.0, Ordering::Release);
                        self.mark_ref(e.blk())
                            .store(Mark::for_empty(bcnt).0, Ordering::Release);
                    }
                    let free = hdr.free_block.fetch_add(bcnt, Ordering::Relaxed) + bcnt;
                    result = Some(consistency_assert(free <= self.total_block()).map(|_| true));
                    true
                },
            );
        }
        if let Some(result) = result {
            return result;
        }
        if let Some((pos, entry)) = bookmark {
            let slot = unsafe { &*self.table().add(pos as usize) };
            if Entry(slot.load(Ordering::Relaxed)).is_clean() {
                hdr.clean_entry.fetch_sub(1, Ordering::Relaxed);
            }
            slot.store(entry.0, Ordering::Release);
            hdr.item.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        }
        Ok(false)
    }

    /// Writer-side existence probe, used only when the item count sits
    /// at its ceiling.
    fn probe_contains(&self, code: u64, key: &[u8]) -> bool {
        let tag = (code >> 56) as u8;
        let mut found = false;
        unsafe {
            search(
                self.table(),
                self.entry_divisor().value(),
                self.entry_divisor().rem(code),
                |slot, _, _| {
                    let e = Entry(slot.load(Ordering::Relaxed));
                    if e.is_empty() {
                        return e.is_clean();
                    }
                    if e.tag() == tag {
                        let mark = Mark(self.mark_ref(e.blk()).load(Ordering::Relaxed));
                        if key_match(key, mark, self.blk_ptr(e.blk())) {
                            found = true;
                            return true;
                        }
                    }
                    false
                },
            );
        }
        found
    }

    /// Grow the free run at the cursor until it holds `need` blocks plus
    /// the reserve: absorb the following free run, relocate the
    /// following live record, or wrap to block 0 once.
    fn defragment(&self, need: u64, code: u64, key: &[u8], origin: &mut Entry) -> Result<()> {
        let hdr = self.header();
        let mut overflow = false;
        loop {
            let cur = hdr.block_cursor.load(Ordering::Relaxed);
            let run = Mark(self.mark_ref(cur).load(Ordering::Relaxed)).bcnt();
            if run >= need + self.reserved_block() {
                return Ok(());
            }
            let nxt = cur + run;
            if nxt == self.total_block() {
                consistency_assert(
                    !overflow && hdr.free_block.load(Ordering::Relaxed) >= run,
                )?;
                overflow = true;
                // Clear the head of the arena: walk forward from block 0
                // relocating live records into the tail run until the
                // prefix is long enough for this update.
                let mut vic = 0u64;
                while vic < cur {
                    let vm = Mark(self.mark_ref(vic).load(Ordering::Relaxed));
                    if vm.is_free() {
                        vic += vm.bcnt();
                    } else if vic < need + self.reserved_block() {
                        let bcnt = vm.blocks();
                        let tail_cur = hdr.block_cursor.load(Ordering::Relaxed);
                        if Mark(self.mark_ref(tail_cur).load(Ordering::Relaxed)).bcnt() < bcnt {
                            break;
                        }
                        self.move_record(vic, code, key, origin)?;
                        vic += bcnt;
                        if hdr.block_cursor.load(Ordering::Relaxed) == self.total_block() {
                            break;
                        }
                    } else {
                        break;
                    }
                }
                consistency_assert(vic <= cur)?;
                self.mark_ref(0)
                    .store(Mark::for_empty(vic).0, Ordering::Release);
                hdr.block_cursor.store(0, Ordering::Relaxed);
            } else {
                let nm = Mark(self.mark_ref(nxt).load(Ordering::Relaxed));
                let bcnt;
                if nm.is_free() {
                    consistency_assert(nxt + nm.bcnt() <= self.total_block())?;
                    bcnt = nm.bcnt();
                } else {
                    bcnt = nm.blocks();
                    consistency_assert(bcnt <= run)?;
                    self.move_record(nxt, code, key, origin)?;
                }
                // The record (if any) now sits where the run began; the
                // freed span merges into the run either way.
                let cur = hdr.block_cursor.load(Ordering::Relaxed);
                let m = Mark(self.mark_ref(cur).load(Ordering::Relaxed));
                self.mark_ref(cur)
                    .store(Mark::for_empty(m.bcnt() + bcnt).0, Ordering::Release);
            }
        }
    }

    /// Relocate the live record at `vic` to the cursor, rewriting its
    /// entry. If the record is the one `key` is updating, its observed
    /// entry is captured in `origin` for the ABA fix-up.
    fn move_record(&self, vic: u64, code: u64, key: &[u8], origin: &mut Entry) -> Result<()> {
        let hdr = self.header();
        let vic_mark = Mark(self.mark_ref(vic).load(Ordering::Relaxed));
        debug_assert!(!vic_mark.is_free());
        let bcnt = vic_mark.blocks();
        let cur = hdr.block_cursor.load(Ordering::Relaxed);

        // Body first; the destination mark publishes after the copy.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.blk_ptr(vic).add(8),
                self.blk_ptr(cur).add(8),
                (bcnt as usize) * 8 - 8,
            );
        }

        let vkey =
            unsafe { std::slice::from_raw_parts(self.blk_ptr(vic).add(4), vic_mark.klen()) };
        let bcode = hash(vkey, self.seed());
        let track_origin = bcode == code && key_match(key, vic_mark, self.blk_ptr(vic));
        if track_origin {
            consistency_assert(origin.is_clean())?;
        }

        let mut done = false;
        let mut failure = None;
        unsafe {
            search(
                self.table(),
                self.entry_divisor().value(),
                self.entry_divisor().rem(bcode),
                |slot, _, _| {
                    let e = Entry(slot.load(Ordering::Relaxed));
                    if e.is_empty() {
                        return e.is_clean();
                    }
                    if e.blk() != vic {
                        return false;
                    }
                    if track_origin {
                        *origin = e;
                    }
                    hdr.free_block.fetch_sub(bcnt, Ordering::Relaxed);
                    let next = cur + bcnt;
                    if next != self.total_block() {
                        if let Err(err) = consistency_assert(next < self.total_block()) {
                            failure = Some(err);
                            return true;
                        }
                        let run = Mark(self.mark_ref(cur).load(Ordering::Relaxed)).bcnt();
                        self.mark_ref(next)
                            .store(Mark::for_empty(run - bcnt).0, Ordering::Release);
                    }
                    self.mark_ref(cur).store(vic_mark.0, Ordering::Release);
                    slot.store(e.with_blk(cur).0, Ordering::Release);
                    self.mark_ref(vic)
                        .store(Mark::for_empty(bcnt).0, Ordering::Release);
                    hdr.block_cursor.store(next, Ordering::Relaxed);
                    hdr.free_block.fetch_add(bcnt, Ordering::Relaxed);
                    done = true;
                    true
                },
            );
        }
        if let Some(err) = failure {
            return Err(err);
        }
        if !done {
            // No entry points here (the record was erased after its
            // blocks were scanned); just reclaim the span.
            self.mark_ref(vic)
                .store(Mark::for_empty(bcnt).0, Ordering::Release);
            let free = hdr.free_block.fetch_add(bcnt, Ordering::Relaxed) + bcnt;
            consistency_assert(free <= self.total_block())?;
        }
        Ok(())
    }

    /// Write `key`/`val` into the blocks at `neo` and publish the mark.
    /// Returns the record's `tip`.
    pub(super) fn fill_record(&self, neo: u64, key: &[u8], val: &[u8]) -> u64 {
        let block = self.blk_ptr(neo);
        // The first four payload bytes ride in the mark word so they
        // become visible atomically with the lengths.
        let mut part = [0u8; 4];
        let mut k = key;
        let mut v = val;
        for b in part.iter_mut() {
            if !k.is_empty() {
                *b = k[0];
                k = &k[1..];
            } else if !v.is_empty() {
                *b = v[0];
                v = &v[1..];
            }
        }
        unsafe {
            let mut dst = block.add(8);
            if !k.is_empty() {
                std::ptr::copy_nonoverlapping(k.as_ptr(), dst, k.len());
                dst = dst.add(k.len());
            }
            if !v.is_empty() {
                std::ptr::copy_nonoverlapping(v.as_ptr(), dst, v.len());
            }
        }
        let mark = Mark(
            Mark::limits(key.len(), val.len()) as u64 | (u32::from_le_bytes(part) as u64) << 32,
        );
        self.mark_ref(neo).store(mark.0, Ordering::Release);
        self.calc_tip(neo)
    }

    /// Secondary hash of the record body, seeded by its length word.
    fn calc_tip(&self, blk: u64) -> u64 {
        let mark = Mark(self.mark_ref(blk).load(Ordering::Relaxed));
        let body = unsafe {
            std::slice::from_raw_parts(self.blk_ptr(blk).add(4), mark.klen() + mark.vlen())
        };
        hash(body, mark.0 as u32 as u64)
    }

    /// Two-pass table compaction reclaiming tombstones. Runs with the
    /// `sweeping` flag raised so readers know to retry a miss.
    fn sweep(&self) -> Result<()> {
        let hdr = self.header();
        let total = self.entry_divisor().value();

        self.lock().sweeping.store(1, Ordering::Relaxed);
        fence(Ordering::SeqCst);

        // Each entry moves at most twice, so a second pass converges.
        if self.sweep_pass(false)? {
            self.sweep_pass(true)?;
        }

        // Final scan: tombstones become CLEAN, except ones vacated in
        // pass two ("dirty") that an in-flight probe may still need to
        // walk across.
        let mut dirty = 0u64;
        let mut item = 0u64;
        for i in 0..total {
            let slot = unsafe { &*self.table().add(i as usize) };
            let e = Entry(slot.load(Ordering::Relaxed));
            if e.is_empty() {
                if e.fit() {
                    dirty += 1;
                    slot.store(e.clear_fit().0, Ordering::Release);
                } else {
                    slot.store(Entry::CLEAN.0, Ordering::Release);
                }
            } else {
                item += 1;
                if e.fit() {
                    slot.store(e.clear_fit().0, Ordering::Release);
                }
            }
        }

        // Keep the sweeping status visible a little longer than the
        // stores above.
        std::thread::yield_now();
        fence(Ordering::SeqCst);
        self.lock().sweeping.store(0, Ordering::Relaxed);

        consistency_assert(item == hdr.item.load(Ordering::Relaxed))?;
        hdr.clean_entry.store(total - item - dirty, Ordering::Relaxed);
        Ok(())
    }

    /// One linear pass moving every unfit entry toward its ideal bucket.
    /// Returns whether anything moved.
    fn sweep_pass(&self, end: bool) -> Result<bool> {
        let total = self.entry_divisor().value();
        let mut moved = false;
        for i in 0..total {
            let slot_i = unsafe { &*self.table().add(i as usize) };
            let e = Entry(slot_i.load(Ordering::Relaxed));
            if e.is_empty() || e.fit() {
                continue;
            }
            let home = if e.off() < MAX_OFF_MARK {
                if i < e.off() {
                    total + i - e.off()
                } else {
                    i - e.off()
                }
            } else {
                // Probe distance overflowed the hint; recompute from the
                // record's key.
                let mark = Mark(self.mark_ref(e.blk()).load(Ordering::Relaxed));
                let rkey = unsafe {
                    std::slice::from_raw_parts(self.blk_ptr(e.blk()).add(4), mark.klen())
                };
                let code = hash(rkey, self.seed());
                consistency_assert(e.tag() == (code >> 56) as u8)?;
                self.entry_divisor().rem(code)
            };
            let mut fit = true;
            let mut failure = None;
            unsafe {
                search(self.table(), total, home, |slot, pos, dist| {
                    let v = Entry(slot.load(Ordering::Relaxed));
                    if v.is_empty() {
                        moved = true;
                        if let Err(err) = consistency_assert(!v.is_clean()) {
                            failure = Some(err);
                            return true;
                        }
                        let mut neo = e.with_off(dist);
                        if fit {
                            neo = neo.set_fit();
                        }
                        let tomb = if end {
                            // Dirty: the final scan must not turn this
                            // tombstone CLEAN under an in-flight probe.
                            Entry::DELETED.set_fit()
                        } else {
                            Entry::DELETED
                        };
                        // Relocation pair under the tag shard's write
                        // lock, pairing with the read-locked re-probe of
                        // a missing fetch.
                        let shard = self.lock().shard(e.tag());
                        shard.write_lock();
                        slot.store(neo.0, Ordering::Release);
                        slot_i.store(tomb.0, Ordering::Release);
                        shard.write_unlock();
                        return true;
                    }
                    if !v.fit() {
                        if pos == i {
                            if fit {
                                slot_i.store(e.set_fit().0, Ordering::Relaxed);
                            }
                            return true;
                        }
                        fit = false;
                    }
                    false
                });
            }
            if let Some(err) = failure {
                return Err(err);
            }
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::super::layout::{Entry, Mark};
    use super::super::{Config, Estuary};
    use crate::hash::hash;
    use crate::{DataSource, LoadPolicy, Record};

    struct VariedSource {
        current: u64,
        begin: u64,
        total: usize,
        shift: u64,
        key: [u8; 8],
        val: [u8; 255],
    }

    impl VariedSource {
        fn new(begin: u64, total: usize, shift: u64) -> Self {
            VariedSource {
                current: begin.wrapping_sub(1),
                begin,
                total,
                shift,
                key: [0; 8],
                val: [0; 255],
            }
        }
    }

    impl DataSource for VariedSource {
        fn reset(&mut self) {
            self.current = self.begin.wrapping_sub(1);
        }

        fn total(&self) -> usize {
            self.total
        }

        fn read(&mut self) -> Record<'_> {
            self.current = self.current.wrapping_add(1);
            let len = self.current.wrapping_add(self.shift) as u8;
            self.key = self.current.to_le_bytes();
            self.val[..len as usize].fill(len);
            Record {
                key: &self.key,
                val: &self.val[..len as usize],
            }
        }
    }

    /// Walk the arena: free runs plus live record spans must tile it
    /// exactly, and the free total must match the header.
    fn check_block_accounting(d: &Estuary) {
        let mut pos = 0u64;
        let mut free = 0u64;
        while pos < d.total_block() {
            let m = Mark(d.mark_ref(pos).load(Ordering::Relaxed));
            let span = if m.is_free() {
                free += m.bcnt();
                m.bcnt()
            } else {
                m.blocks()
            };
            assert!(span > 0, "empty span at block {pos}");
            pos += span;
        }
        assert_eq!(pos, d.total_block(), "arena not tiled");
        assert_eq!(free, d.header().free_block.load(Ordering::Relaxed));
    }

    /// Every live entry must be reachable from its key's home bucket
    /// without crossing a CLEAN sentinel, and the table's live count
    /// must match the header.
    fn check_probe_reachability(d: &Estuary) {
        let total = d.entry_divisor().value();
        let mut live = 0u64;
        for i in 0..total {
            let e = Entry(unsafe { &*d.table().add(i as usize) }.load(Ordering::Relaxed));
            if e.is_empty() {
                continue;
            }
            live += 1;
            let mark = Mark(d.mark_ref(e.blk()).load(Ordering::Relaxed));
            let key = unsafe {
                std::slice::from_raw_parts(d.blk_ptr(e.blk()).add(4), mark.klen())
            };
            let code = hash(key, d.seed());
            assert_eq!(e.tag(), (code >> 56) as u8);
            let mut pos = d.entry_divisor().rem(code);
            while pos != i {
                let v = Entry(unsafe { &*d.table().add(pos as usize) }.load(Ordering::Relaxed));
                assert!(!v.is_clean(), "entry {i} cut off by CLEAN at {pos}");
                pos += 1;
                if pos >= total {
                    pos = 0;
                }
            }
        }
        assert_eq!(live, d.header().item.load(Ordering::Relaxed));
    }

    fn small_config() -> Config {
        Config {
            item_limit: 100,
            max_key_len: 8,
            max_val_len: 255,
            avg_item_size: 136,
        }
    }

    fn scratch(name: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        (dir, path)
    }

    #[test]
    fn erase_reclaims_blocks_and_counts() {
        let (_dir, path) = scratch("erase.es");
        let mut src = VariedSource::new(0, 100, 5);
        assert!(Estuary::create(&path, &small_config(), Some(&mut src)));
        let dict = Estuary::load(&path, LoadPolicy::Monopoly).unwrap();

        check_block_accounting(&dict);
        check_probe_reachability(&dict);

        src.reset();
        for _ in 0..50 {
            let key = {
                let rec = src.read();
                rec.key.to_vec()
            };
            assert!(dict.erase(&key).unwrap());
            assert!(!dict.erase(&key).unwrap());
        }
        assert_eq!(dict.item(), 50);
        check_block_accounting(&dict);
        check_probe_reachability(&dict);
    }

    #[test]
    fn noop_update_rolls_back_allocation() {
        let (_dir, path) = scratch("noop.es");
        assert!(Estuary::create(&path, &small_config(), None));
        let dict = Estuary::load(&path, LoadPolicy::Monopoly).unwrap();

        assert!(dict.update(b"anchor", b"harbor").unwrap());
        let free = dict.header().free_block.load(Ordering::Relaxed);
        let cursor = dict.header().block_cursor.load(Ordering::Relaxed);

        // Same bytes again: the fresh allocation must merge back.
        assert!(dict.update(b"anchor", b"harbor").unwrap());
        assert_eq!(dict.header().free_block.load(Ordering::Relaxed), free);
        assert_eq!(dict.header().block_cursor.load(Ordering::Relaxed), cursor);
        assert_eq!(dict.item(), 1);
        check_block_accounting(&dict);

        let mut out = Vec::new();
        assert!(dict.fetch(b"anchor", &mut out));
        assert_eq!(out, b"harbor");
    }

    #[test]
    fn churn_forces_sweep_and_wrap() {
        let (_dir, path) = scratch("churn.es");
        assert!(Estuary::create(&path, &small_config(), None));
        let dict = Estuary::load(&path, LoadPolicy::Monopoly).unwrap();

        // Rounds of fill-then-drain with fresh keys: tombstones burn the
        // clean-entry reserve (forcing sweeps) and the cursor laps the
        // arena (forcing wraps and relocations).
        let mut val = [0u8; 255];
        for round in 0u64..30 {
            for i in 0..100u64 {
                let key = (round * 1000 + i).to_le_bytes();
                let len = (i % 250 + 5) as usize;
                val[..len].fill(len as u8);
                assert!(dict.update(&key, &val[..len]).unwrap(), "round {round} key {i}");
            }
            assert_eq!(dict.item(), 100);
            check_block_accounting(&dict);
            check_probe_reachability(&dict);
            for i in 0..100u64 {
                let key = (round * 1000 + i).to_le_bytes();
                assert!(dict.erase(&key).unwrap());
            }
            assert_eq!(dict.item(), 0);
        }
        check_block_accounting(&dict);
        check_probe_reachability(&dict);

        // A final fill must still be fully readable.
        let mut out = Vec::new();
        for i in 0..100u64 {
            let key = (900_000 + i).to_le_bytes();
            val[..64].fill(i as u8);
            assert!(dict.update(&key, &val[..64]).unwrap());
        }
        for i in 0..100u64 {
            let key = (900_000 + i).to_le_bytes();
            assert!(dict.fetch(&key, &mut out), "key {i}");
            assert_eq!(out.len(), 64);
            assert!(out.iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    fn admission_allows_replacement_at_ceiling() {
        let (_dir, path) = scratch("full.es");
        let mut src = VariedSource::new(0, 100, 5);
        assert!(Estuary::create(&path, &small_config(), Some(&mut src)));
        let dict = Estuary::load(&path, LoadPolicy::Monopoly).unwrap();
        assert_eq!(dict.item(), dict.item_limit());

        // A fresh key is refused, an existing key still rewrites.
        assert!(!dict.update(b"newcomer", b"x").unwrap());
        assert_eq!(dict.item(), 100);
        assert!(dict.update(&0u64.to_le_bytes(), b"replacement").unwrap());
        let mut out = Vec::new();
        assert!(dict.fetch(&0u64.to_le_bytes(), &mut out));
        assert_eq!(out, b"replacement");
    }
}
