//! Loading and verifying the cached code region.

use std::fmt;
use std::io::{Read, Seek, SeekFrom};

use crate::error::{CacheError, CacheErrorKind};
use crate::raw;

/// Reserves fixed memory ranges for cached code regions.
///
/// Implemented by the execution environment. The cached code was compiled
/// for one specific address, so the reader only ever asks for the exact
/// range recorded in the cache file and gives up if it cannot be had.
pub trait ContextAllocator {
    /// The system page size in bytes. Must be nonzero.
    fn page_size(&self) -> usize;

    /// Reserves `size` bytes starting exactly at `addr`.
    ///
    /// Returns `None` if the range cannot be made available. The returned
    /// memory must span exactly `size` bytes.
    fn reserve(&mut self, addr: usize, size: usize) -> Option<Box<dyn ContextMemory>>;
}

/// A reserved memory range holding a cached code region.
///
/// Dropping the handle returns the range to the environment.
pub trait ContextMemory {
    /// The address the range starts at.
    fn addr(&self) -> usize;
    /// Read access to the range.
    fn bytes(&self) -> &[u8];
    /// Write access to the range.
    fn bytes_mut(&mut self) -> &mut [u8];
}

/// The cached code region of a script, loaded at its recorded address.
///
/// The region has already passed parity verification and is not touched
/// again by this crate; executing it is the loader's business.
pub struct Context {
    memory: Box<dyn ContextMemory>,
}

impl Context {
    /// Reserves the recorded address range, fills it from the cache file,
    /// and verifies the parity word.
    pub(crate) fn load<R>(
        file: &mut R,
        header: &raw::Header,
        allocator: &mut dyn ContextAllocator,
    ) -> Result<Self, CacheError>
    where
        R: Read + Seek,
    {
        let addr = header.context_cached_addr;
        let mut memory = allocator.reserve(addr, raw::CONTEXT_SIZE).ok_or_else(|| {
            tracing::warn!(addr, "context load address unavailable");
            CacheError::from(CacheErrorKind::LoadAddressUnavailable)
        })?;

        file.seek(SeekFrom::Start(header.context_offset as u64))?;
        file.read_exact(memory.bytes_mut())?;

        if parity(memory.bytes(), header.context_parity_checksum) != 0 {
            tracing::warn!(
                checksum = header.context_parity_checksum,
                "context fails parity verification"
            );
            return Err(CacheErrorKind::ChecksumMismatch.into());
        }
        tracing::debug!("context passed parity verification");

        Ok(Self { memory })
    }

    /// The address the region was loaded at.
    pub fn addr(&self) -> usize {
        self.memory.addr()
    }

    /// The raw contents of the region.
    pub fn bytes(&self) -> &[u8] {
        self.memory.bytes()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("addr", &self.addr())
            .field("size", &self.bytes().len())
            .finish()
    }
}

/// XOR-folds `bytes` word by word on top of `seed`.
///
/// A region matching its recorded parity word folds to zero. Trailing bytes
/// of a region that is not a multiple of the word size do not participate;
/// cached code regions always are.
fn parity(bytes: &[u8], seed: u32) -> u32 {
    bytes.chunks_exact(4).fold(seed, |sum, chunk| {
        sum ^ u32::from_ne_bytes(chunk.try_into().unwrap())
    })
}
