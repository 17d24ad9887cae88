//! Reading and validation of binary caches of precompiled scripts.
//!
//! A compiler back end writes the native code it produced for a script,
//! together with the metadata needed to run it again, into a cache file.
//! On the next run this crate loads that file back instead of recompiling,
//! but only after proving that the cache is intact, was produced on a
//! compatible machine, and still matches the build inputs it was compiled
//! from. A cache that fails any check is rejected as a whole and the caller
//! falls back to recompilation.
//!
//! # Structure of a cache file
//!
//! A cache file contains a fixed-size header followed by seven sections and
//! the raw code region:
//!
//! 1. String pool: interned strings referenced by index from other sections
//! 2. Dependency table: name, resource kind and SHA-1 fingerprint of every
//!    build input
//! 3. Relocation table: reserved, never read back
//! 4. Exported variable address list
//! 5. Exported function address list
//! 6. Pragma list: key/value string pairs
//! 7. Function table: name, address and size of every compiled function
//! 8. Context: the code region itself, loaded at the page-aligned address
//!    recorded in the header and verified by an XOR parity word
//!
//! All integers are stored in the producer's native byte order and word
//! width; the header carries an endianness tag and the producer's word
//! sizes so that an incompatible consumer rejects the file instead of
//! misreading it. Section offsets and sizes are validated against the file
//! bounds before any section is read. The exact record layouts live in
//! [`raw`].
//!
//! # Reading
//!
//! Declare the expected build inputs on a [`CacheReader`], then hand it an
//! open cache file and a [`ContextAllocator`] for reserving the code
//! region. On success the resulting [`CachedScript`] owns everything a
//! loader needs: the string pool, export address lists, pragmas, function
//! table, and the verified code region.

#![warn(missing_docs)]

mod buf;
mod context;
mod error;
pub mod raw;
mod reader;
mod script;

pub use context::{Context, ContextAllocator, ContextMemory};
pub use error::{CacheError, CacheErrorKind};
pub use reader::{CacheReader, ResourceKind};
pub use script::{CachedScript, Function, StringPool};
