use std::slice;

use crate::error::{CacheError, CacheErrorKind};

/// An owned, zero-initialized byte buffer aligned to the machine word.
///
/// Section contents are read from the cache file into these buffers so that
/// the word-sized records inside can be viewed in place. A plain `Vec<u8>`
/// gives no alignment guarantee; the backing store here is a `Vec<usize>`
/// with the byte length tracked separately.
pub(crate) struct AlignedBuf {
    words: Vec<usize>,
    len: usize,
}

impl AlignedBuf {
    /// Reserves a zeroed buffer of `len` bytes.
    ///
    /// The length is attacker controlled (it comes from a section header),
    /// so reservation failure is reported instead of aborting.
    pub(crate) fn new(len: usize) -> Result<Self, CacheError> {
        let num_words = len.div_ceil(std::mem::size_of::<usize>());
        let mut words = Vec::new();
        words
            .try_reserve_exact(num_words)
            .map_err(|e| CacheError::new(CacheErrorKind::OutOfMemory, e))?;
        words.resize(num_words, 0);
        Ok(Self { words, len })
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        // SAFETY: the backing words hold at least `len` initialized bytes,
        // and any byte is valid inside a usize.
        unsafe { slice::from_raw_parts(self.words.as_ptr().cast::<u8>(), self.len) }
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: same as `bytes`, and the borrow is exclusive.
        unsafe { slice::from_raw_parts_mut(self.words.as_mut_ptr().cast::<u8>(), self.len) }
    }

    /// Copies `bytes` into a fresh aligned buffer.
    #[cfg(test)]
    pub(crate) fn of_bytes(bytes: &[u8]) -> Self {
        let mut buf = Self::new(bytes.len()).unwrap();
        buf.bytes_mut().copy_from_slice(bytes);
        buf
    }
}
