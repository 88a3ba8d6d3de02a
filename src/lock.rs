//! Locking primitives living inside the shared mapping.
//!
//! The master mutex is a POSIX mutex initialized with
//! `PTHREAD_PROCESS_SHARED` so that every process mapping the file
//! serializes its writers through the same bytes. The spin RW locks are
//! two-byte atomics used as a sharded pool of reader micro-locks; they
//! also live in the mapping and need no initialization beyond zeroing.

use std::sync::atomic::{AtomicU16, Ordering};

use crate::{Error, Result};

/// Bytes reserved for the master mutex in every lock region.
/// `pthread_mutex_t` is 40 bytes on x86_64 Linux; one cache line covers
/// every platform we map on.
pub(crate) const MUTEX_AREA: usize = 64;

const _: () = assert!(std::mem::size_of::<libc::pthread_mutex_t>() <= MUTEX_AREA);

/// Initialize a master mutex at `ptr`. `shared` selects the
/// process-shared attribute; monopoly handles rebuild the mutex
/// process-private in their own memory.
///
/// # Safety
/// `ptr` must point to at least [`MUTEX_AREA`] writable bytes, aligned
/// for `pthread_mutex_t`, with no thread currently using the old value.
pub(crate) unsafe fn init_mutex(ptr: *mut u8, shared: bool) -> bool {
    let mutex = ptr as *mut libc::pthread_mutex_t;
    let pshared = if shared {
        libc::PTHREAD_PROCESS_SHARED
    } else {
        libc::PTHREAD_PROCESS_PRIVATE
    };
    let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
    if libc::pthread_mutexattr_init(&mut attr) != 0
        || libc::pthread_mutexattr_setpshared(&mut attr, pshared) != 0
        || libc::pthread_mutex_init(mutex, &attr) != 0
    {
        return false;
    }
    libc::pthread_mutexattr_destroy(&mut attr);
    true
}

/// Tear down a mutex previously set up with [`init_mutex`].
///
/// # Safety
/// No thread may hold or wait on the mutex.
pub(crate) unsafe fn destroy_mutex(ptr: *mut u8) {
    libc::pthread_mutex_destroy(ptr as *mut libc::pthread_mutex_t);
}

/// RAII acquisition of the master mutex.
pub(crate) struct MasterGuard {
    mutex: *mut libc::pthread_mutex_t,
}

impl MasterGuard {
    /// # Safety
    /// `ptr` must point to a mutex initialized by [`init_mutex`] that
    /// outlives the guard.
    pub(crate) unsafe fn lock(ptr: *mut u8) -> Result<Self> {
        let mutex = ptr as *mut libc::pthread_mutex_t;
        if libc::pthread_mutex_lock(mutex) != 0 {
            return Err(Error::Lock);
        }
        Ok(MasterGuard { mutex })
    }
}

impl Drop for MasterGuard {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.mutex);
        }
    }
}

/// Exponential pause-then-yield backoff for the spin locks.
struct NanoSleeper {
    cnt: u32,
}

impl NanoSleeper {
    fn new() -> Self {
        NanoSleeper { cnt: 1 }
    }

    fn sleep(&mut self) {
        if self.cnt <= 16 {
            for _ in 0..self.cnt {
                std::hint::spin_loop();
            }
            self.cnt *= 2;
            return;
        }
        std::thread::yield_now();
        self.reset();
    }

    fn reset(&mut self) {
        self.cnt = 1;
    }
}

const ONE: u16 = 1;
const BIT_WIDTH: u16 = 16;
const WRITING: u16 = ONE << (BIT_WIDTH - 1);
const WAIT_TO_WRITE: u16 = ONE << (BIT_WIDTH - 2);
const READ_GUARD: u16 = ONE << (BIT_WIDTH - 3);

/// Writer-preferring spin RW lock in two bytes.
///
/// Lives zero-initialized inside the mapping; the low bits count
/// readers, the top bits flag an active or waiting writer. Readers back
/// out and retry if a writer sneaks in between their optimistic check
/// and increment.
#[repr(transparent)]
pub(crate) struct SpinRwLock(AtomicU16);

impl SpinRwLock {
    pub(crate) fn read_lock(&self) {
        let mut sleeper = NanoSleeper::new();
        loop {
            const MASK: u16 = WRITING | WAIT_TO_WRITE | READ_GUARD;
            let state = self.0.load(Ordering::Relaxed);
            if state & MASK == 0 {
                let state = self.0.fetch_add(1, Ordering::AcqRel);
                if state & MASK == 0 {
                    return;
                }
                self.0.fetch_sub(1, Ordering::Relaxed);
            }
            sleeper.sleep();
        }
    }

    pub(crate) fn read_unlock(&self) {
        let state = self.0.fetch_sub(1, Ordering::Release);
        debug_assert_ne!(state & !(WRITING | WAIT_TO_WRITE), 0);
    }

    pub(crate) fn write_lock(&self) {
        let mut sleeper = NanoSleeper::new();
        loop {
            let state = self.0.load(Ordering::Relaxed);
            if state & !WAIT_TO_WRITE == 0 {
                if self
                    .0
                    .compare_exchange(state, WRITING, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                sleeper.reset();
            } else if state & (WRITING | WAIT_TO_WRITE) == 0 {
                self.0.fetch_or(WAIT_TO_WRITE, Ordering::Relaxed);
            }
            sleeper.sleep();
        }
    }

    pub(crate) fn write_unlock(&self) {
        let state = self.0.fetch_and(!(WRITING | WAIT_TO_WRITE), Ordering::Release);
        debug_assert_ne!(state & WRITING, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    #[test]
    fn master_mutex_round_trip() {
        let mut area = vec![0u64; MUTEX_AREA / 8];
        let ptr = area.as_mut_ptr() as *mut u8;
        unsafe {
            assert!(init_mutex(ptr, false));
            drop(MasterGuard::lock(ptr).unwrap());
            drop(MasterGuard::lock(ptr).unwrap());
            destroy_mutex(ptr);
        }
    }

    #[test]
    fn spin_rwlock_excludes_writers() {
        struct Shared {
            lock: SpinRwLock,
            value: AtomicU64,
        }
        let shared = Arc::new(Shared {
            lock: SpinRwLock(AtomicU16::new(0)),
            value: AtomicU64::new(0),
        });

        // Writers bump the value by an odd amount then restore it;
        // readers must never observe the intermediate state.
        let writers: Vec<_> = (0..2)
            .map(|_| {
                let s = Arc::clone(&shared);
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        s.lock.write_lock();
                        s.value.fetch_add(1, Ordering::Relaxed);
                        s.value.fetch_add(1, Ordering::Relaxed);
                        s.lock.write_unlock();
                    }
                })
            })
            .collect();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let s = Arc::clone(&shared);
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        s.lock.read_lock();
                        let v = s.value.load(Ordering::Relaxed);
                        assert_eq!(v % 2, 0);
                        s.lock.read_unlock();
                    }
                })
            })
            .collect();
        for t in writers.into_iter().chain(readers) {
            t.join().unwrap();
        }
        assert_eq!(shared.value.load(Ordering::Relaxed), 40_000);
    }
}
