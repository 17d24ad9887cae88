//! The in-memory representation of a successfully read cache.

use std::fmt;

use indexmap::IndexMap;
use watto::Pod;

use crate::buf::AlignedBuf;
use crate::context::Context;
use crate::error::{CacheError, CacheErrorKind};
use crate::raw;

/// The interned strings of a cached script.
///
/// Other sections refer to strings by index into this pool. The pool owns
/// the raw section buffer; lookups borrow from it.
pub struct StringPool {
    buf: AlignedBuf,
    // absolute (start, end) byte ranges into `buf`, one per entry; the NUL
    // terminator sits at `end`
    spans: Vec<(usize, usize)>,
}

impl StringPool {
    /// Parses a raw string pool section.
    pub(crate) fn parse(buf: AlignedBuf) -> Result<Self, CacheError> {
        let bytes = buf.bytes();
        let (table, rest) = raw::TableHeader::ref_from_prefix(bytes).ok_or_else(|| {
            tracing::warn!("string pool too small for its header");
            CacheError::from(CacheErrorKind::CorruptCache)
        })?;
        let (entries, blob) =
            raw::StringEntry::slice_from_prefix(rest, table.count).ok_or_else(|| {
                tracing::warn!(count = table.count, "string pool count overflows section");
                CacheError::from(CacheErrorKind::CorruptCache)
            })?;

        let blob_base = bytes.len() - blob.len();
        let mut spans = Vec::with_capacity(entries.len());
        for (idx, entry) in entries.iter().enumerate() {
            let end = entry
                .offset
                .checked_add(entry.length)
                .filter(|&end| end <= blob.len())
                .ok_or_else(|| {
                    tracing::warn!(
                        idx,
                        offset = entry.offset,
                        length = entry.length,
                        "string overflows the pool blob"
                    );
                    CacheError::from(CacheErrorKind::CorruptCache)
                })?;
            spans.push((blob_base + entry.offset, blob_base + end));
        }

        Ok(Self { buf, spans })
    }

    /// Checks that every pool entry is NUL terminated.
    ///
    /// Run once before any entry is used; a missing terminator means the
    /// producer wrote a truncated or damaged pool.
    pub(crate) fn check_terminators(&self) -> Result<(), CacheError> {
        for (idx, span) in self.spans.iter().enumerate() {
            if self.buf.bytes().get(span.1) != Some(&0) {
                tracing::warn!(idx, "cached string is not NUL terminated");
                return Err(CacheErrorKind::CorruptCache.into());
            }
        }
        Ok(())
    }

    /// Resolves a string by pool index.
    ///
    /// Returns `None` for an out-of-range index or a non-UTF-8 entry.
    pub fn get(&self, idx: usize) -> Option<&str> {
        let &(start, end) = self.spans.get(idx)?;
        std::str::from_utf8(&self.buf.bytes()[start..end]).ok()
    }

    /// The number of strings in the pool.
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Whether the pool holds no strings.
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

impl fmt::Debug for StringPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StringPool")
            .field("strings", &self.spans.len())
            .finish()
    }
}

/// Address and extent of one compiled function in the code region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Function {
    /// Address of the compiled function.
    pub addr: usize,
    /// Size of the compiled function in bytes.
    pub size: usize,
}

/// A fully validated script read back from a cache file.
///
/// Only produced by [`CacheReader::read`](crate::CacheReader::read) once
/// every check has passed; there is no partially loaded state.
pub struct CachedScript {
    string_pool: StringPool,
    export_vars: Vec<usize>,
    export_funcs: Vec<usize>,
    pragmas: Vec<(String, String)>,
    functions: IndexMap<String, Function>,
    context: Context,
}

impl CachedScript {
    pub(crate) fn new(
        string_pool: StringPool,
        export_vars: Vec<usize>,
        export_funcs: Vec<usize>,
        pragmas: Vec<(String, String)>,
        functions: IndexMap<String, Function>,
        context: Context,
    ) -> Self {
        Self {
            string_pool,
            export_vars,
            export_funcs,
            pragmas,
            functions,
            context,
        }
    }

    /// The script's interned strings.
    pub fn string_pool(&self) -> &StringPool {
        &self.string_pool
    }

    /// Cached addresses of the script's exported variables, in file order.
    pub fn export_vars(&self) -> &[usize] {
        &self.export_vars
    }

    /// Cached addresses of the script's exported functions, in file order.
    pub fn export_funcs(&self) -> &[usize] {
        &self.export_funcs
    }

    /// The script's pragmas as key/value pairs, in file order.
    pub fn pragmas(&self) -> &[(String, String)] {
        &self.pragmas
    }

    /// Looks up a compiled function by name.
    pub fn function(&self, name: &str) -> Option<Function> {
        self.functions.get(name).copied()
    }

    /// Iterates over all compiled functions in file order.
    pub fn functions(&self) -> impl Iterator<Item = (&str, Function)> {
        self.functions.iter().map(|(name, func)| (name.as_str(), *func))
    }

    /// The loaded code region.
    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl fmt::Debug for CachedScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedScript")
            .field("strings", &self.string_pool.len())
            .field("export_vars", &self.export_vars.len())
            .field("export_funcs", &self.export_funcs.len())
            .field("pragmas", &self.pragmas.len())
            .field("functions", &self.functions.len())
            .field("context", &self.context)
            .finish()
    }
}

/// Materializes an export list section into its cached addresses.
pub(crate) fn read_addresses(bytes: &[u8]) -> Option<Vec<usize>> {
    let addrs: &[raw::CachedAddr] = raw::table_from_bytes(bytes)?;
    Some(addrs.iter().map(|addr| addr.0).collect())
}

/// Materializes the pragma list into owned key/value pairs.
pub(crate) fn read_pragmas(
    pool: &StringPool,
    bytes: &[u8],
) -> Result<Vec<(String, String)>, CacheError> {
    let records: &[raw::Pragma] = raw::table_from_bytes(bytes).ok_or_else(|| {
        tracing::warn!("pragma list count overflows section");
        CacheError::from(CacheErrorKind::CorruptCache)
    })?;

    let mut pragmas = Vec::with_capacity(records.len());
    for record in records {
        let key = resolve(pool, record.key_idx, "pragma key")?;
        let value = resolve(pool, record.value_idx, "pragma value")?;
        pragmas.push((key.to_owned(), value.to_owned()));
    }
    Ok(pragmas)
}

/// Materializes the function table into a name-keyed map.
///
/// A name recorded twice keeps its first entry.
pub(crate) fn read_functions(
    pool: &StringPool,
    bytes: &[u8],
) -> Result<IndexMap<String, Function>, CacheError> {
    let records: &[raw::FuncInfo] = raw::table_from_bytes(bytes).ok_or_else(|| {
        tracing::warn!("function table count overflows section");
        CacheError::from(CacheErrorKind::CorruptCache)
    })?;

    let mut functions = IndexMap::with_capacity(records.len());
    for record in records {
        let name = resolve(pool, record.name_idx, "function name")?;
        functions.entry(name.to_owned()).or_insert(Function {
            addr: record.cached_addr,
            size: record.size,
        });
    }
    Ok(functions)
}

fn resolve<'p>(pool: &'p StringPool, idx: usize, what: &str) -> Result<&'p str, CacheError> {
    pool.get(idx).ok_or_else(|| {
        tracing::warn!(idx, what, "string pool index does not resolve");
        CacheErrorKind::CorruptCache.into()
    })
}
