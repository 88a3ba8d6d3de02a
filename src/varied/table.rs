//! Linear probing over the entry table.
//!
//! Every operation of the engine walks the table the same way: start at
//! `code % total_entry`, step forward with wraparound, and let a
//! visitor decide per slot whether the walk is finished. The visitor
//! sees the slot as an `AtomicU64` plus its index and probe distance;
//! interpretation of the word is the visitor's business.

use std::sync::atomic::AtomicU64;

/// Walk the table from `start`, calling `visit(slot, index, distance)`
/// until it returns `true` or every slot was seen.
///
/// # Safety
/// `table` must point to `total` valid entry words.
#[inline]
pub(crate) unsafe fn search<F>(table: *const AtomicU64, total: u64, start: u64, mut visit: F)
where
    F: FnMut(&AtomicU64, u64, u64) -> bool,
{
    let mut pos = start;
    for dist in 0..total {
        if visit(&*table.add(pos as usize), pos, dist) {
            return;
        }
        pos += 1;
        if pos >= total {
            pos = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn wraps_and_reports_distance() {
        let table: Vec<AtomicU64> = (0..8u64).map(AtomicU64::new).collect();
        let mut seen = Vec::new();
        unsafe {
            search(table.as_ptr(), 8, 6, |slot, pos, dist| {
                seen.push((slot.load(Ordering::Relaxed), pos, dist));
                false
            });
        }
        assert_eq!(seen.len(), 8);
        assert_eq!(seen[0], (6, 6, 0));
        assert_eq!(seen[1], (7, 7, 1));
        assert_eq!(seen[2], (0, 0, 2));
        assert_eq!(seen[7], (5, 5, 7));
    }

    #[test]
    fn stops_when_told() {
        let table: Vec<AtomicU64> = (0..8u64).map(AtomicU64::new).collect();
        let mut count = 0;
        unsafe {
            search(table.as_ptr(), 8, 0, |_, _, dist| {
                count += 1;
                dist == 2
            });
        }
        assert_eq!(count, 3);
    }
}
