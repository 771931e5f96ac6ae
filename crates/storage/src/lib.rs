//! Block storage for ISAAC nodes.
//!
//! - [`database`]: staging and permanent block databases, with in-memory
//!   implementations
//! - [`localfs`]: block item files on the local filesystem, written into a
//!   temporary directory and published by rename

pub mod database;
pub mod localfs;

pub use database::{
    BlockWriteDatabase, DatabaseError, MemoryBlockWriteDatabase, MemoryPermanentDatabase,
    PermanentDatabase, WrittenBlock,
};
pub use localfs::{BlockItem, LocalFsError, LocalFsImporter, LocalFsReader, LocalFsWriter};
