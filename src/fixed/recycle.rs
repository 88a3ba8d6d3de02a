//! Time-delayed reuse of unlinked slots.
//!
//! Freed slot indices queue in a fixed ring of 256-entry bins; each bin
//! records a millisecond stamp when it fills. A bin is spliced onto the
//! free list only once it is at least [`RECYCLE_DELAY_MS`] old —
//! sleeping out the difference if the ring wraps sooner — so a reader
//! that loaded a node pointer just before the unlink has a full
//! quarantine window to finish copying from it.

use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{consistency_assert, Result};

use super::layout::{END, RECYCLE_BIN_SIZE, RECYCLE_CAPACITY, RECYCLE_DELAY_MS};
use super::FixedEstuary;

pub(super) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl FixedEstuary {
    /// Park the unlinked slot `vic` in the recycle ring, draining the
    /// oldest bin to the free list first when the ring is full.
    pub(super) fn quarantine(&self, vic: u32) -> Result<()> {
        debug_assert_ne!(vic, END);
        let hdr = self.header();

        let w = hdr.recycle_w.load(Ordering::Relaxed);
        let r = hdr.recycle_r.load(Ordering::Relaxed);
        if w.wrapping_add(1) == r {
            // Ring full: the oldest bin must leave. Honor its
            // quarantine first.
            let stamp = unsafe { *self.stamp_at(r as usize / RECYCLE_BIN_SIZE) };
            let now = now_ms();
            consistency_assert(now > stamp)?;
            let shortfall = RECYCLE_DELAY_MS - (now - stamp);
            if shortfall > 0 {
                std::thread::sleep(Duration::from_millis(shortfall as u64));
            }
            consistency_assert(r as usize % RECYCLE_BIN_SIZE == 0)?;

            let begin = r as usize;
            let end = begin + RECYCLE_BIN_SIZE;
            hdr.recycle_r
                .store((end % RECYCLE_CAPACITY) as u16, Ordering::Relaxed);

            // Chain the bin's slots together and splice them onto the
            // free-list tail. Overwriting the link word is safe now:
            // no reader has held these nodes for a full window.
            let mut head = END;
            let mut tail = END;
            for i in begin..end {
                let idx = self.recycle_slot(i).load(Ordering::Relaxed);
                debug_assert_ne!(idx, END);
                self.recycle_slot(i).store(END, Ordering::Relaxed);
                if tail == END {
                    head = idx;
                } else {
                    self.link_at(tail).store(idx, Ordering::Relaxed);
                }
                tail = idx;
            }
            self.link_at(tail).store(END, Ordering::Relaxed);

            let old_tail = hdr.free_tail.load(Ordering::Relaxed);
            if old_tail == END {
                debug_assert_eq!(hdr.free_head.load(Ordering::Relaxed), END);
                hdr.free_head.store(head, Ordering::Relaxed);
            } else {
                self.link_at(old_tail).store(head, Ordering::Relaxed);
            }
            hdr.free_tail.store(tail, Ordering::Relaxed);
        }

        let w = hdr.recycle_w.load(Ordering::Relaxed);
        self.recycle_slot(w as usize).store(vic, Ordering::Relaxed);
        let next_w = w.wrapping_add(1);
        hdr.recycle_w.store(next_w, Ordering::Relaxed);
        if next_w as usize % RECYCLE_BIN_SIZE == 0 {
            // The bin just filled; its age is measured from now.
            unsafe { *self.stamp_at(w as usize / RECYCLE_BIN_SIZE) = now_ms() };
        }
        Ok(())
    }
}
