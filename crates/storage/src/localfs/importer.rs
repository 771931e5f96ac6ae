//! Stages the raw item files of a remote block.

use super::path::{block_directory, item_file_name, temp_directory};
use super::LocalFsError;
use isaac_core::{Encoder, JsonEncoder};
use isaac_types::{BlockItemType, BlockMap, Height};
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Default)]
struct State {
    saved: bool,
    canceled: bool,
}

/// Writes already encoded item files for a block and publishes them with
/// the same directory rename as [`super::LocalFsWriter`].
pub struct LocalFsImporter<E: Encoder = JsonEncoder> {
    root: PathBuf,
    map: BlockMap,
    enc: E,
    temp: PathBuf,
    state: Mutex<State>,
}

impl<E: Encoder> LocalFsImporter<E> {
    /// Create the temporary directory and write the block map into it.
    pub fn new(root: impl AsRef<Path>, map: BlockMap, enc: E) -> Result<Self, LocalFsError> {
        let root = root.as_ref().to_path_buf();
        let temp = temp_directory(&root, map.height());
        fs::create_dir_all(&temp)?;
        fs::write(
            temp.join(item_file_name(&enc, BlockItemType::Map)),
            enc.marshal(&map)?,
        )?;

        Ok(Self {
            root,
            map,
            enc,
            temp,
            state: Mutex::new(State::default()),
        })
    }

    pub fn height(&self) -> Height {
        self.map.height()
    }

    pub fn map(&self) -> &BlockMap {
        &self.map
    }

    /// File to copy the raw bytes of item `t` into.
    pub fn item_writer(&self, t: BlockItemType) -> Result<BufWriter<File>, LocalFsError> {
        let state = self.state.lock();
        if state.canceled {
            return Err(LocalFsError::Canceled);
        }
        if self.map.item(t).is_none() {
            return Err(LocalFsError::Invalid(format!("{t} not in block map")));
        }

        let f = File::create(self.temp.join(item_file_name(&self.enc, t)))?;
        Ok(BufWriter::new(f))
    }

    /// Publish the block. Saving twice is a no-op.
    pub fn save(&self) -> Result<(), LocalFsError> {
        let mut state = self.state.lock();
        if state.canceled {
            return Err(LocalFsError::Canceled);
        }
        if state.saved {
            return Ok(());
        }

        let target = block_directory(&self.root, self.height());
        if target.exists() {
            return Err(LocalFsError::AlreadyExists(target));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&self.temp, &target)?;
        state.saved = true;

        debug!(height = self.height().0, "imported block saved");
        Ok(())
    }

    /// Remove the temporary directory. Idempotent.
    pub fn cancel(&self) -> Result<(), LocalFsError> {
        let mut state = self.state.lock();
        if state.saved || state.canceled {
            return Ok(());
        }
        state.canceled = true;

        match fs::remove_dir_all(&self.temp) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::localfs::LocalFsReader;
    use isaac_test_helpers::make_manifest;
    use isaac_types::BlockMapItem;
    use std::io::Write;
    use tempfile::TempDir;

    fn map() -> BlockMap {
        let mut map = BlockMap::new(make_manifest(33));
        map.set_item(
            BlockItemType::Proposal,
            BlockMapItem {
                checksum: "00".into(),
                count: 1,
                compressed: false,
            },
        );
        map
    }

    #[test]
    fn test_save_publishes_block() {
        let dir = TempDir::new().unwrap();
        let importer = LocalFsImporter::new(dir.path(), map(), JsonEncoder).unwrap();

        let mut w = importer.item_writer(BlockItemType::Proposal).unwrap();
        w.write_all(b"{}\n").unwrap();
        w.flush().unwrap();
        assert!(importer.item_writer(BlockItemType::States).is_err());

        importer.save().unwrap();
        importer.save().unwrap();

        let reader = LocalFsReader::new(dir.path(), Height(33), JsonEncoder).unwrap();
        assert_eq!(reader.map().unwrap(), map());
    }

    #[test]
    fn test_cancel_removes_temp() {
        let dir = TempDir::new().unwrap();
        let importer = LocalFsImporter::new(dir.path(), map(), JsonEncoder).unwrap();
        importer.cancel().unwrap();
        importer.cancel().unwrap();

        assert!(matches!(importer.save(), Err(LocalFsError::Canceled)));
        assert!(matches!(
            LocalFsReader::new(dir.path(), Height(33), JsonEncoder),
            Err(LocalFsError::NotFound(_))
        ));
        assert_eq!(fs::read_dir(dir.path().join("temp")).unwrap().count(), 0);
    }
}
