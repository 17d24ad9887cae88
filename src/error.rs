use thiserror::Error;

/// The kind of a [`CacheError`].
///
/// Kinds deliberately carry no payload; which section, offset, or value
/// failed a check is logged where the check runs. Callers only branch on
/// whether the cache is usable, and if not, fall back to recompilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CacheErrorKind {
    /// Reading or seeking the cache file failed.
    #[error("cache file io failed")]
    Io,
    /// The cache was written by an incompatible format version.
    #[error("cache version mismatch")]
    VersionMismatch,
    /// The cache was written on a machine with different byte order.
    #[error("cache endianness mismatch")]
    EndiannessMismatch,
    /// The cache was written on a machine with different word sizes.
    #[error("cache machine abi mismatch")]
    AbiMismatch,
    /// The cache file is structurally invalid.
    #[error("corrupt cache file")]
    CorruptCache,
    /// The cache records a different number of dependencies than expected.
    #[error("dependency count mismatch")]
    DependencyCountMismatch,
    /// A recorded dependency diverges from its expected fingerprint.
    #[error("dependency mismatch")]
    DependencyMismatch,
    /// The cached code region fails parity verification.
    #[error("context checksum mismatch")]
    ChecksumMismatch,
    /// The recorded load address cannot be reserved.
    #[error("context load address unavailable")]
    LoadAddressUnavailable,
    /// A section buffer could not be allocated.
    #[error("out of memory")]
    OutOfMemory,
}

/// An error encountered while reading a script cache.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct CacheError {
    pub(crate) kind: CacheErrorKind,
    #[source]
    pub(crate) source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl CacheError {
    /// Creates a new cache error from a known kind of error as well as an
    /// arbitrary error payload.
    pub(crate) fn new<E>(kind: CacheErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let source = Some(source.into());
        Self { kind, source }
    }

    /// Returns the corresponding [`CacheErrorKind`] for this error.
    pub fn kind(&self) -> CacheErrorKind {
        self.kind
    }
}

impl From<CacheErrorKind> for CacheError {
    fn from(kind: CacheErrorKind) -> Self {
        Self { kind, source: None }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        Self::new(CacheErrorKind::Io, e)
    }
}
