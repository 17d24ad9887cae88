//! Shared test support: an in-memory cache image builder, a read/seek
//! counting wrapper, and a heap-backed context allocator.

use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::mem;

use scriptcache::raw;
use scriptcache::{ContextAllocator, ContextMemory, ResourceKind};
use watto::Pod;

/// Page size the fake allocator reports; cache images are laid out with it.
pub const PAGE_SIZE: usize = 4096;

/// Load address recorded in built cache images.
pub const CACHED_ADDR: usize = 0x2000_0000;

/// The deterministic contents written into the code region of built images.
pub fn context_pattern() -> Vec<u8> {
    (0..raw::CONTEXT_SIZE).map(|i| (i % 251) as u8).collect()
}

/// Builds cache file images in memory.
///
/// Plays the role of the compiler-side cache writer: sections are collected
/// through the `add_*` methods and [`build`](Self::build) lays them out
/// with a valid header, correct section offsets, and a matching parity
/// word. Tests then damage the image or the header to provoke failures.
pub struct CacheBuilder {
    strings: Vec<Vec<u8>>,
    dependencies: Vec<raw::Dependency>,
    export_vars: Vec<usize>,
    export_funcs: Vec<usize>,
    pragmas: Vec<raw::Pragma>,
    functions: Vec<raw::FuncInfo>,
    context: Vec<u8>,
}

impl CacheBuilder {
    pub fn new() -> Self {
        Self {
            strings: Vec::new(),
            dependencies: Vec::new(),
            export_vars: Vec::new(),
            export_funcs: Vec::new(),
            pragmas: Vec::new(),
            functions: Vec::new(),
            context: context_pattern(),
        }
    }

    /// Adds a string to the pool, returning its index.
    pub fn intern(&mut self, s: &str) -> usize {
        self.strings.push(s.as_bytes().to_vec());
        self.strings.len() - 1
    }

    pub fn add_dependency(&mut self, name: &str, kind: ResourceKind, sha1: [u8; 20]) {
        let name_idx = self.intern(name);
        self.dependencies.push(raw::Dependency {
            name_idx,
            kind: kind as u32,
            sha1,
        });
    }

    pub fn add_export_var(&mut self, addr: usize) {
        self.export_vars.push(addr);
    }

    pub fn add_export_func(&mut self, addr: usize) {
        self.export_funcs.push(addr);
    }

    pub fn add_pragma(&mut self, key: &str, value: &str) {
        let key_idx = self.intern(key);
        let value_idx = self.intern(value);
        self.pragmas.push(raw::Pragma { key_idx, value_idx });
    }

    pub fn add_function(&mut self, name: &str, addr: usize, size: usize) {
        let name_idx = self.intern(name);
        self.functions.push(raw::FuncInfo {
            name_idx,
            cached_addr: addr,
            size,
        });
    }

    pub fn build(&self) -> BuiltCache {
        let mut entries = Vec::new();
        let mut blob = Vec::new();
        for s in &self.strings {
            entries.push(raw::StringEntry {
                offset: blob.len(),
                length: s.len(),
            });
            blob.extend_from_slice(s);
            blob.push(0);
        }
        let mut str_pool = table_bytes(&entries);
        str_pool.extend_from_slice(&blob);

        let depend_tab = table_bytes(&self.dependencies);
        let reloc_tab = table_bytes::<raw::CachedAddr>(&[]);
        let export_var_list = table_bytes(&to_addrs(&self.export_vars));
        let export_func_list = table_bytes(&to_addrs(&self.export_funcs));
        let pragma_list = table_bytes(&self.pragmas);
        let func_table = table_bytes(&self.functions);

        let mut bytes = vec![0u8; mem::size_of::<raw::Header>()];
        let str_pool_sec = place(&mut bytes, &str_pool);
        let depend_tab_sec = place(&mut bytes, &depend_tab);
        let reloc_tab_sec = place(&mut bytes, &reloc_tab);
        let export_var_sec = place(&mut bytes, &export_var_list);
        let export_func_sec = place(&mut bytes, &export_func_list);
        let pragma_sec = place(&mut bytes, &pragma_list);
        let func_table_sec = place(&mut bytes, &func_table);

        while bytes.len() % PAGE_SIZE != 0 {
            bytes.push(0);
        }
        let context_offset = bytes.len();
        bytes.extend_from_slice(&self.context);
        // spare page so tests can misalign offsets without also overflowing
        // the file
        bytes.resize(bytes.len() + PAGE_SIZE, 0);

        let header = raw::Header {
            magic: raw::SCRIPTCACHE_MAGIC,
            version: raw::SCRIPTCACHE_VERSION,
            endianness: raw::ENDIANNESS_NATIVE,
            sizeof_offset: mem::size_of::<usize>() as u8,
            sizeof_size: mem::size_of::<usize>() as u8,
            sizeof_ptr: mem::size_of::<*const ()>() as u8,
            _pad: [0; 4],
            str_pool: str_pool_sec,
            depend_tab: depend_tab_sec,
            reloc_tab: reloc_tab_sec,
            export_var_list: export_var_sec,
            export_func_list: export_func_sec,
            pragma_list: pragma_sec,
            func_table: func_table_sec,
            context_offset,
            context_cached_addr: CACHED_ADDR,
            context_parity_checksum: parity(&self.context),
            _reserved: [0; 4],
        };

        let mut built = BuiltCache { bytes, header };
        built.write_header();
        built
    }
}

/// A finished cache image plus the header that was written into it.
pub struct BuiltCache {
    pub bytes: Vec<u8>,
    pub header: raw::Header,
}

impl BuiltCache {
    fn write_header(&mut self) {
        let size = mem::size_of::<raw::Header>();
        self.bytes[..size].copy_from_slice(self.header.as_bytes());
    }

    /// Mutates the header and rewrites it into the image.
    pub fn patch_header(&mut self, patch: impl FnOnce(&mut raw::Header)) {
        patch(&mut self.header);
        self.write_header();
    }

    pub fn cursor(&self) -> Cursor<&[u8]> {
        Cursor::new(self.bytes.as_slice())
    }
}

fn table_bytes<T: Pod>(records: &[T]) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(
        raw::TableHeader {
            count: records.len(),
        }
        .as_bytes(),
    );
    for record in records {
        bytes.extend_from_slice(record.as_bytes());
    }
    bytes
}

fn to_addrs(addrs: &[usize]) -> Vec<raw::CachedAddr> {
    addrs.iter().map(|&addr| raw::CachedAddr(addr)).collect()
}

fn place(bytes: &mut Vec<u8>, section: &[u8]) -> raw::Section {
    while bytes.len() % mem::size_of::<usize>() != 0 {
        bytes.push(0);
    }
    let offset = bytes.len();
    bytes.extend_from_slice(section);
    raw::Section {
        offset,
        size: section.len(),
    }
}

fn parity(bytes: &[u8]) -> u32 {
    bytes.chunks_exact(4).fold(0, |sum, chunk| {
        sum ^ u32::from_ne_bytes(chunk.try_into().unwrap())
    })
}

/// Wraps a reader and counts `read` and `seek` calls.
pub struct CountingReader<R> {
    inner: R,
    pub reads: usize,
    pub seeks: usize,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            reads: 0,
            seeks: 0,
        }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reads += 1;
        self.inner.read(buf)
    }
}

impl<R: Seek> Seek for CountingReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.seeks += 1;
        self.inner.seek(pos)
    }
}

/// A context allocator backed by plain heap memory.
///
/// It hands out heap buffers while reporting the requested address, which
/// is all the reader needs; nothing in the tests executes the region.
pub struct FakeAllocator {
    refuse: bool,
}

impl FakeAllocator {
    pub fn new() -> Self {
        Self { refuse: false }
    }

    /// An allocator whose reservations always fail.
    pub fn refusing() -> Self {
        Self { refuse: true }
    }
}

struct FakeMemory {
    addr: usize,
    bytes: Vec<u8>,
}

impl ContextMemory for FakeMemory {
    fn addr(&self) -> usize {
        self.addr
    }

    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl ContextAllocator for FakeAllocator {
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn reserve(&mut self, addr: usize, size: usize) -> Option<Box<dyn ContextMemory>> {
        if self.refuse {
            return None;
        }
        Some(Box::new(FakeMemory {
            addr,
            bytes: vec![0; size],
        }))
    }
}
