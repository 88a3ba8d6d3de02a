//! Persistent, fixed-capacity key→value dictionary for read-mostly
//! workloads.
//!
//! The whole dictionary lives in one memory-mapped file: header, lock
//! region, open-addressing entry table, and a data region. Any number of
//! reader threads (or processes sharing the file) fetch lock-free; a
//! single writer at a time mutates under a process-shared master mutex,
//! publishing with release stores so in-flight readers always observe a
//! consistent record.
//!
//! Two engines share the substrate:
//!
//! * [`Estuary`] — variable-length items; open addressing over a
//!   circular arena of 8-byte blocks, with in-place tombstone sweeping
//!   and record relocation to keep a contiguous free run available.
//! * [`FixedEstuary`] — fixed-length items; per-bucket chains over
//!   equal-size slots with a time-delayed free-list so readers never
//!   observe a slot being rewritten mid-copy.
//!
//! Diagnostics go through the [`log`] facade; without an installed
//! logger the crate is silent.

#[cfg(not(target_endian = "little"))]
compile_error!("little endian only");

mod divisor;
mod hash;
mod lock;
mod mmap;
mod prefetch;

pub mod fixed;
pub mod varied;

pub use divisor::Divisor;
pub use fixed::FixedEstuary;
pub use mmap::ResourceMap;
pub use varied::Estuary;

use thiserror::Error;

/// Fatal failures surfaced out of band. Ordinary misses and admission
/// refusals are values, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The master mutex could not be acquired or released.
    #[error("fail to handle lock")]
    Lock,
    /// An on-file invariant does not hold; the file is corrupt.
    #[error("broken data")]
    Data,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Invariant check on the write path, compiled in by the
/// `consistency-check` feature. A failed check surfaces as
/// [`Error::Data`] instead of corrupting the file further.
#[inline(always)]
pub(crate) fn consistency_assert(cond: bool) -> Result<()> {
    #[cfg(feature = "consistency-check")]
    if !cond {
        return Err(Error::Data);
    }
    #[cfg(not(feature = "consistency-check"))]
    let _ = cond;
    Ok(())
}

/// How to attach to an existing dictionary file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPolicy {
    /// Shared file lock; multiple reader processes may map the file and
    /// one of them may write through the in-file master mutex.
    Shared,
    /// Exclusive file lock; the master mutex is rebuilt in handle-local
    /// memory instead of trusting the on-file lock state.
    Monopoly,
    /// Read the whole file into private anonymous memory (huge pages
    /// when available). The handle owns the data exclusively.
    CopyData,
}

/// One key/value pair yielded by a [`DataSource`].
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    pub key: &'a [u8],
    pub val: &'a [u8],
}

/// Bulk input for `create` and `batch_update`: a rewindable stream of
/// records. `read` is called exactly `total()` times per pass.
pub trait DataSource {
    fn reset(&mut self);
    fn total(&self) -> usize;
    fn read(&mut self) -> Record<'_>;
}
