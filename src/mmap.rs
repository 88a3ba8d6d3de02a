//! File-backed and anonymous mappings with advisory locking.
//!
//! A `ResourceMap` owns the whole dictionary image: either a shared
//! mapping of the file (holding a `flock` for as long as the mapping
//! lives) or a private anonymous copy of its bytes. All higher layers
//! work through raw pointers into this region.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

fn lock_file(file: &File, exclusive: bool) -> bool {
    let op = libc::LOCK_NB | if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
    unsafe { libc::flock(file.as_raw_fd(), op) == 0 }
}

/// A mapped dictionary image.
pub struct ResourceMap {
    mmap: MmapMut,
    // Keeps the advisory lock alive for file-backed mappings.
    _file: Option<File>,
}

impl ResourceMap {
    /// Map an existing file read-write. `exclusive` decides between an
    /// exclusive and a shared `flock`; `populate` pre-faults the pages.
    pub fn open(path: &Path, populate: bool, exclusive: bool) -> Option<Self> {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => f,
            Err(e) => {
                log::error!("fail to open file: {} ({e})", path.display());
                return None;
            }
        };
        if !lock_file(&file, exclusive) {
            log::error!("fail to lock file: {}", path.display());
            return None;
        }
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            log::error!("fail to read file: {}", path.display());
            return None;
        }
        let mut opts = MmapOptions::new();
        #[cfg(target_os = "linux")]
        if populate {
            opts.populate();
        }
        #[cfg(not(target_os = "linux"))]
        let _ = populate;
        let mmap = match unsafe { opts.map_mut(&file) } {
            Ok(m) => m,
            Err(e) => {
                log::error!("fail to mmap: {} ({e})", path.display());
                return None;
            }
        };
        Some(ResourceMap { mmap, _file: Some(file) })
    }

    /// Create (or truncate) a file of exactly `size` zeroed bytes and
    /// map it with an exclusive lock.
    pub fn create(path: &Path, size: usize) -> Option<Self> {
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
        {
            Ok(f) => f,
            Err(e) => {
                log::error!("fail to open file: {} ({e})", path.display());
                return None;
            }
        };
        if !lock_file(&file, true) {
            log::error!("fail to lock file: {}", path.display());
            return None;
        }
        // Truncate to zero first so stale contents never leak into the
        // zero-extended image.
        if file.set_len(0).is_err() || file.set_len(size as u64).is_err() {
            log::error!("fail to write file: {}", path.display());
            return None;
        }
        let mmap = match unsafe { MmapOptions::new().map_mut(&file) } {
            Ok(m) => m,
            Err(e) => {
                log::error!("fail to mmap: {} ({e})", path.display());
                return None;
            }
        };
        Some(ResourceMap { mmap, _file: Some(file) })
    }

    /// Allocate `size` bytes of private anonymous memory (huge pages
    /// first, regular pages on failure) and let `fill` initialize them.
    pub fn anonymous(size: usize, fill: impl FnOnce(&mut [u8]) -> bool) -> Option<Self> {
        if size == 0 {
            log::error!("unexpected size 0");
            return None;
        }
        #[cfg(target_os = "linux")]
        let mapped = MmapOptions::new()
            .len(size)
            .huge(None)
            .map_anon()
            .or_else(|_| MmapOptions::new().len(size).map_anon());
        #[cfg(not(target_os = "linux"))]
        let mapped = MmapOptions::new().len(size).map_anon();
        let mut mmap = match mapped {
            Ok(m) => m,
            Err(e) => {
                log::error!("fail to mmap {size} anonymous bytes ({e})");
                return None;
            }
        };
        if !fill(&mut mmap) {
            return None;
        }
        Some(ResourceMap { mmap, _file: None })
    }

    /// Copy a file into private anonymous memory. The file is locked
    /// exclusively during the copy and released afterwards.
    pub fn load_by_copy(path: &Path) -> Option<Self> {
        let mut file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => f,
            Err(e) => {
                log::error!("fail to open file: {} ({e})", path.display());
                return None;
            }
        };
        if !lock_file(&file, true) {
            log::error!("fail to lock file: {}", path.display());
            return None;
        }
        let size = file.metadata().map(|m| m.len()).unwrap_or(0) as usize;
        if size == 0 {
            log::error!("fail to read file: {}", path.display());
            return None;
        }
        Self::anonymous(size, |space| {
            if file.read_exact(space).is_err() {
                log::error!("fail to read file: {}", path.display());
                return false;
            }
            true
        })
    }

    /// Write the whole image to a new file.
    pub fn dump(&self, path: &Path) -> bool {
        let mut file = match File::create(path) {
            Ok(f) => f,
            Err(e) => {
                log::error!("fail to open file: {} ({e})", path.display());
                return false;
            }
        };
        file.write_all(&self.mmap).is_ok()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.len() == 0
    }

    #[inline]
    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }
}
