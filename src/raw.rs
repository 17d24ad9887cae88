//! The raw on-disk layout of script cache files.
//!
//! All integers are stored in the byte order and word width of the machine
//! that produced the cache. A consumer on a different machine is expected to
//! reject the file, not to convert it; the header carries an endianness tag
//! and the producer's word sizes for exactly that purpose.

use watto::Pod;

/// The magic file preamble to identify script cache files.
///
/// The leading NUL keeps cache files from being mistaken for text.
pub const SCRIPTCACHE_MAGIC: [u8; 4] = *b"\0scc";

/// The current format version.
///
/// # Version History
///
/// - `001`: Initial version
pub const SCRIPTCACHE_VERSION: [u8; 4] = *b"001\0";

/// Endianness tag written by little-endian producers.
pub const ENDIANNESS_LITTLE: u8 = b'e';
/// Endianness tag written by big-endian producers.
pub const ENDIANNESS_BIG: u8 = b'E';
/// The endianness tag matching the running machine.
pub const ENDIANNESS_NATIVE: u8 = if cfg!(target_endian = "little") {
    ENDIANNESS_LITTLE
} else {
    ENDIANNESS_BIG
};

/// Size in bytes of the cached code region.
///
/// The region holds the code and data halves of a compiled script and is
/// loaded in one piece at the address recorded in the header.
pub const CONTEXT_SIZE: usize = 256 * 1024;

/// The location of one section within the cache file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Section {
    /// Absolute file offset of the section, word aligned.
    pub offset: usize,
    /// Size of the section in bytes.
    pub size: usize,
}

/// The script cache binary header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Header {
    /// The file magic identifying the format.
    pub magic: [u8; 4],
    /// The format version.
    pub version: [u8; 4],

    /// Byte order of the producer, [`ENDIANNESS_LITTLE`] or [`ENDIANNESS_BIG`].
    pub endianness: u8,
    /// The producer's file offset width in bytes.
    pub sizeof_offset: u8,
    /// The producer's size width in bytes.
    pub sizeof_size: u8,
    /// The producer's pointer width in bytes.
    pub sizeof_ptr: u8,
    /// Explicit padding so the section table below starts word aligned.
    pub _pad: [u8; 4],

    /// The string pool section.
    pub str_pool: Section,
    /// The dependency table section.
    pub depend_tab: Section,
    /// The relocation table section. Reserved, never read back.
    pub reloc_tab: Section,
    /// The exported variable address list section.
    pub export_var_list: Section,
    /// The exported function address list section.
    pub export_func_list: Section,
    /// The pragma list section.
    pub pragma_list: Section,
    /// The function table section.
    pub func_table: Section,

    /// Absolute file offset of the cached code region, page aligned.
    pub context_offset: usize,
    /// Virtual address the code region was compiled for, page aligned.
    pub context_cached_addr: usize,
    /// XOR parity word over the code region.
    pub context_parity_checksum: u32,
    /// Some reserved space for future extensions that would not require a
    /// completely new parsing method.
    pub _reserved: [u8; 4],
}

/// The leading record count of a count-prefixed section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TableHeader {
    /// Number of records following this header.
    pub count: usize,
}

/// One interned string in the string pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct StringEntry {
    /// Offset of the string inside the character blob.
    pub offset: usize,
    /// Length of the string in bytes, excluding the NUL terminator.
    pub length: usize,
}

/// One build input the cached script was compiled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Dependency {
    /// The dependency name (index into the string pool).
    pub name_idx: usize,
    /// The resource kind, see [`ResourceKind`](crate::ResourceKind).
    pub kind: u32,
    /// SHA-1 digest of the dependency's content.
    pub sha1: [u8; 20],
}

/// One pragma recorded for the script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Pragma {
    /// The pragma key (index into the string pool).
    pub key_idx: usize,
    /// The pragma value (index into the string pool).
    pub value_idx: usize,
}

/// One compiled function inside the cached code region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct FuncInfo {
    /// The function name (index into the string pool).
    pub name_idx: usize,
    /// Address of the compiled function.
    pub cached_addr: usize,
    /// Size of the compiled function in bytes.
    pub size: usize,
}

/// A cached address recorded for an exported symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CachedAddr(pub usize);

unsafe impl Pod for Section {}
unsafe impl Pod for Header {}
unsafe impl Pod for TableHeader {}
unsafe impl Pod for StringEntry {}
unsafe impl Pod for Dependency {}
unsafe impl Pod for Pragma {}
unsafe impl Pod for FuncInfo {}
unsafe impl Pod for CachedAddr {}

/// Splits a count-prefixed section into its records.
///
/// Trailing bytes after the records are ignored. Returns `None` if the
/// recorded count does not fit the section.
pub fn table_from_bytes<T: Pod>(bytes: &[u8]) -> Option<&[T]> {
    let (header, rest) = TableHeader::ref_from_prefix(bytes)?;
    let (records, _) = T::slice_from_prefix(rest, header.count)?;
    Some(records)
}
