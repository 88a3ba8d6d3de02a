//! CPU prefetch hints used by the pipeline fetch paths.
//!
//! Hints only; correctness never depends on them. On targets without a
//! stable prefetch intrinsic they compile to nothing.

/// The line will be dereferenced within a few instructions.
#[inline(always)]
pub(crate) fn prefetch_for_next(ptr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_mm_prefetch::<{ core::arch::x86_64::_MM_HINT_T0 }>(ptr as *const i8);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = ptr;
}

/// The line will be needed after other independent work completes.
#[inline(always)]
pub(crate) fn prefetch_for_future(ptr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_mm_prefetch::<{ core::arch::x86_64::_MM_HINT_NTA }>(ptr as *const i8);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = ptr;
}

/// Bytes per cache line assumed by the pipeline prefetch planning.
pub(crate) const CACHE_LINE: usize = 64;
