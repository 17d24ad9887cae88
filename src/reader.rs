//! Reading and validating cache files.

use std::io::{Read, Seek, SeekFrom};
use std::mem;

use indexmap::IndexMap;
use watto::Pod;

use crate::buf::AlignedBuf;
use crate::context::{Context, ContextAllocator};
use crate::error::{CacheError, CacheErrorKind};
use crate::raw;
use crate::script::{self, CachedScript, StringPool};

/// The kind of resource a cached script may depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResourceKind {
    /// A resource packaged inside an application bundle.
    Bundle = 0,
    /// A plain file on disk.
    File = 1,
}

#[derive(Debug)]
struct ExpectedDependency {
    kind: ResourceKind,
    sha1: [u8; 20],
}

/// Reads validated scripts back from cache files.
///
/// Expected build inputs are declared up front via
/// [`add_dependency`](Self::add_dependency). [`read`](Self::read) then
/// accepts a cache only if it was produced on a compatible machine, is
/// structurally sound, records exactly the declared inputs, and its code
/// region passes parity verification. Any failure aborts the whole read;
/// there is no partially usable result.
#[derive(Debug, Default)]
pub struct CacheReader {
    dependencies: IndexMap<String, ExpectedDependency>,
}

impl CacheReader {
    /// Creates a reader with no expected dependencies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a build input the cache must have been compiled from.
    ///
    /// Dependencies are matched against the cache in declaration order; a
    /// name declared twice keeps its position and the later fingerprint.
    pub fn add_dependency(&mut self, name: impl Into<String>, kind: ResourceKind, sha1: [u8; 20]) {
        self.dependencies
            .insert(name.into(), ExpectedDependency { kind, sha1 });
    }

    /// Reads a script from an open cache file.
    ///
    /// The file must stay untouched by others for the duration of the call.
    /// The code region is reserved through `allocator` at the address
    /// recorded in the cache; on any error the reservation is released
    /// again.
    #[tracing::instrument(level = "trace", name = "CacheReader::read", skip_all)]
    pub fn read<R, A>(&self, file: &mut R, allocator: &mut A) -> Result<CachedScript, CacheError>
    where
        R: Read + Seek,
        A: ContextAllocator,
    {
        let file_len = file.seek(SeekFrom::End(0))?;
        if file_len < mem::size_of::<raw::Header>() as u64 || file_len < raw::CONTEXT_SIZE as u64 {
            tracing::warn!(file_len, "cache file too small");
            return Err(CacheErrorKind::Io.into());
        }

        let header = read_header(file)?;
        check_header(&header)?;
        check_machine_word(&header)?;
        check_bounds(&header, file_len, allocator.page_size())?;

        let string_pool = StringPool::parse(load_section(file, &header.str_pool, "str_pool")?)?;
        string_pool.check_terminators()?;

        {
            let buf = load_section(file, &header.depend_tab, "depend_tab")?;
            let cached = raw::table_from_bytes::<raw::Dependency>(buf.bytes()).ok_or_else(|| {
                tracing::warn!("dependency table count overflows section");
                CacheError::from(CacheErrorKind::CorruptCache)
            })?;
            self.check_dependencies(&string_pool, cached)?;
        }

        let export_vars = {
            let buf = load_section(file, &header.export_var_list, "export_var_list")?;
            script::read_addresses(buf.bytes()).ok_or_else(|| {
                tracing::warn!("export variable list count overflows section");
                CacheError::from(CacheErrorKind::CorruptCache)
            })?
        };

        let export_funcs = {
            let buf = load_section(file, &header.export_func_list, "export_func_list")?;
            script::read_addresses(buf.bytes()).ok_or_else(|| {
                tracing::warn!("export function list count overflows section");
                CacheError::from(CacheErrorKind::CorruptCache)
            })?
        };

        let pragmas = {
            let buf = load_section(file, &header.pragma_list, "pragma_list")?;
            script::read_pragmas(&string_pool, buf.bytes())?
        };

        let functions = {
            let buf = load_section(file, &header.func_table, "func_table")?;
            script::read_functions(&string_pool, buf.bytes())?
        };

        let context = Context::load(file, &header, allocator)?;

        Ok(CachedScript::new(
            string_pool,
            export_vars,
            export_funcs,
            pragmas,
            functions,
            context,
        ))
    }

    fn check_dependencies(
        &self,
        pool: &StringPool,
        cached: &[raw::Dependency],
    ) -> Result<(), CacheError> {
        if cached.len() != self.dependencies.len() {
            tracing::warn!(
                expected = self.dependencies.len(),
                found = cached.len(),
                "dependency count mismatch"
            );
            return Err(CacheErrorKind::DependencyCountMismatch.into());
        }

        for (dep, (name, expected)) in cached.iter().zip(&self.dependencies) {
            let cached_name = pool.get(dep.name_idx).ok_or_else(|| {
                tracing::warn!(idx = dep.name_idx, "dependency name does not resolve");
                CacheError::from(CacheErrorKind::CorruptCache)
            })?;
            if cached_name != name {
                tracing::warn!(
                    expected = %name,
                    found = cached_name,
                    "dependency name mismatch"
                );
                return Err(CacheErrorKind::DependencyMismatch.into());
            }
            if dep.sha1 != expected.sha1 {
                tracing::warn!(
                    name = %name,
                    expected = %sha1_hex(&expected.sha1),
                    found = %sha1_hex(&dep.sha1),
                    "dependency fingerprint mismatch"
                );
                return Err(CacheErrorKind::DependencyMismatch.into());
            }
            if dep.kind != expected.kind as u32 {
                tracing::warn!(
                    name = %name,
                    expected = ?expected.kind,
                    found = dep.kind,
                    "dependency resource kind mismatch"
                );
                return Err(CacheErrorKind::DependencyMismatch.into());
            }
        }
        Ok(())
    }
}

fn read_header<R: Read + Seek>(file: &mut R) -> Result<raw::Header, CacheError> {
    let mut buf = AlignedBuf::new(mem::size_of::<raw::Header>())?;
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(buf.bytes_mut())?;

    let (header, _) = raw::Header::ref_from_prefix(buf.bytes()).ok_or_else(|| {
        tracing::warn!("cache header is unreadable");
        CacheError::from(CacheErrorKind::CorruptCache)
    })?;
    Ok(*header)
}

fn check_header(header: &raw::Header) -> Result<(), CacheError> {
    if header.magic != raw::SCRIPTCACHE_MAGIC {
        tracing::warn!(magic = ?header.magic, "not a script cache file");
        return Err(CacheErrorKind::CorruptCache.into());
    }
    if header.version != raw::SCRIPTCACHE_VERSION {
        tracing::warn!(
            version = ?header.version,
            expected = ?raw::SCRIPTCACHE_VERSION,
            "cache version is not understood"
        );
        return Err(CacheErrorKind::VersionMismatch.into());
    }
    if header.endianness != raw::ENDIANNESS_NATIVE {
        tracing::warn!(
            endianness = header.endianness,
            "cache was written with different byte order"
        );
        return Err(CacheErrorKind::EndiannessMismatch.into());
    }
    Ok(())
}

fn check_machine_word(header: &raw::Header) -> Result<(), CacheError> {
    let sizeof_word = mem::size_of::<usize>() as u8;
    let sizeof_ptr = mem::size_of::<*const ()>() as u8;
    if header.sizeof_offset != sizeof_word
        || header.sizeof_size != sizeof_word
        || header.sizeof_ptr != sizeof_ptr
    {
        tracing::warn!(
            sizeof_offset = header.sizeof_offset,
            sizeof_size = header.sizeof_size,
            sizeof_ptr = header.sizeof_ptr,
            "cache was written for a different machine word size"
        );
        return Err(CacheErrorKind::AbiMismatch.into());
    }
    Ok(())
}

/// Bounds-checks every section descriptor against the file before any
/// section content is read.
///
/// The function table carries no descriptor check here; its load is bounded
/// by the record parser.
fn check_bounds(header: &raw::Header, file_len: u64, page_size: usize) -> Result<(), CacheError> {
    let sections = [
        ("str_pool", &header.str_pool),
        ("depend_tab", &header.depend_tab),
        ("reloc_tab", &header.reloc_tab),
        ("export_var_list", &header.export_var_list),
        ("export_func_list", &header.export_func_list),
        ("pragma_list", &header.pragma_list),
    ];
    for (name, section) in sections {
        check_section(section, name, file_len)?;
    }

    let context_end = (header.context_offset as u64).checked_add(raw::CONTEXT_SIZE as u64);
    if header.context_offset as u64 > file_len || context_end.map_or(true, |end| end > file_len) {
        tracing::warn!(
            offset = header.context_offset,
            "context overflows the cache file"
        );
        return Err(CacheErrorKind::CorruptCache.into());
    }
    if header.context_offset % page_size != 0 {
        tracing::warn!(
            offset = header.context_offset,
            page_size,
            "context offset is not page aligned"
        );
        return Err(CacheErrorKind::CorruptCache.into());
    }
    if header.context_cached_addr % page_size != 0 {
        tracing::warn!(
            addr = header.context_cached_addr,
            page_size,
            "context load address is not page aligned"
        );
        return Err(CacheErrorKind::CorruptCache.into());
    }
    Ok(())
}

fn check_section(section: &raw::Section, name: &str, file_len: u64) -> Result<(), CacheError> {
    let end = (section.offset as u64).checked_add(section.size as u64);
    if section.offset as u64 > file_len || end.map_or(true, |end| end > file_len) {
        tracing::warn!(
            section = name,
            offset = section.offset,
            size = section.size,
            "section overflows the cache file"
        );
        return Err(CacheErrorKind::CorruptCache.into());
    }
    if section.offset % mem::size_of::<usize>() != 0 {
        tracing::warn!(
            section = name,
            offset = section.offset,
            "section offset is not word aligned"
        );
        return Err(CacheErrorKind::CorruptCache.into());
    }
    if section.size < mem::size_of::<usize>() {
        tracing::warn!(
            section = name,
            size = section.size,
            "section too small to hold its record count"
        );
        return Err(CacheErrorKind::CorruptCache.into());
    }
    Ok(())
}

/// Reads one section into an owned, word-aligned buffer.
fn load_section<R: Read + Seek>(
    file: &mut R,
    section: &raw::Section,
    name: &str,
) -> Result<AlignedBuf, CacheError> {
    let mut buf = AlignedBuf::new(section.size).map_err(|e| {
        tracing::warn!(
            section = name,
            size = section.size,
            "unable to allocate section buffer"
        );
        e
    })?;
    file.seek(SeekFrom::Start(section.offset as u64))?;
    file.read_exact(buf.bytes_mut())?;
    Ok(buf)
}

fn sha1_hex(sha1: &[u8; 20]) -> String {
    use std::fmt::Write;
    sha1.iter().fold(String::with_capacity(40), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}
