//! Block sync for ISAAC nodes.
//!
//! A node that falls behind imports the missing blocks from a peer:
//!
//! - [`BlockImporter`]: streams the items of one block into the local block
//!   directory and a block write database, checking every checksum
//! - [`ImportBlocks`]: imports a height range in batches and merges the
//!   result into the permanent database
//! - [`BlockSyncer`]: a [`isaac_core::Syncer`] that keeps importing up to a
//!   moving target height
//! - [`BlockFetcher`]: where blocks come from

mod config;
mod error;
mod fetcher;
mod import;
mod importer;
mod syncer;

pub use config::SyncConfig;
pub use error::ImportError;
pub use fetcher::{BlockFetcher, ItemReader, LocalFsFetcher};
pub use import::{ImportBlocks, NewWriteDatabase, SetLastVoteproofs};
pub use importer::BlockImporter;
pub use syncer::BlockSyncer;
