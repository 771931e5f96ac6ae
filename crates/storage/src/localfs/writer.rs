//! Writes a block into its temporary directory and publishes it.

use super::path::{block_directory, item_file_name, temp_directory};
use super::{ItemFile, LocalFsError};
use isaac_core::{Encoder, JsonEncoder};
use isaac_types::{
    BlockItemType, BlockMap, BlockMapItem, FixedTree, Height, LocalNode, Manifest, NetworkId,
    Operation, ProposalSignFact, State, Voteproof, FIXED_TREE_HINT,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Default)]
struct Inner {
    manifest: Option<Manifest>,
    items: BTreeMap<BlockItemType, BlockMapItem>,
    operations: Option<ItemFile>,
    states: Option<ItemFile>,
    operations_tree: Option<FixedTree>,
    states_tree: Option<FixedTree>,
    ivp: Option<Voteproof>,
    avp: Option<Voteproof>,
    saved: bool,
    canceled: bool,
}

impl Inner {
    fn check_open(&self) -> Result<(), LocalFsError> {
        if self.canceled {
            return Err(LocalFsError::Canceled);
        }
        if self.saved {
            return Err(LocalFsError::Invalid("already saved".into()));
        }
        Ok(())
    }
}

/// Writer of one block.
///
/// Items are written under `root/temp/<height>-<ulid>` as they are set;
/// [`LocalFsWriter::save`] signs the block map and renames the directory to
/// the block's final place.
pub struct LocalFsWriter<E: Encoder = JsonEncoder> {
    root: PathBuf,
    height: Height,
    enc: E,
    local: LocalNode,
    network_id: NetworkId,
    temp: PathBuf,
    inner: Mutex<Inner>,
}

impl<E: Encoder> LocalFsWriter<E> {
    /// Create the writer and its temporary directory.
    pub fn new(
        root: impl AsRef<Path>,
        height: Height,
        enc: E,
        local: LocalNode,
        network_id: NetworkId,
    ) -> Result<Self, LocalFsError> {
        let root = root.as_ref().to_path_buf();
        let temp = temp_directory(&root, height);
        fs::create_dir_all(&temp)?;

        Ok(Self {
            root,
            height,
            enc,
            local,
            network_id,
            temp,
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn height(&self) -> Height {
        self.height
    }

    /// Temporary directory of the block.
    pub fn temp_directory(&self) -> &Path {
        &self.temp
    }

    fn item_path(&self, t: BlockItemType) -> PathBuf {
        self.temp.join(item_file_name(&self.enc, t))
    }

    pub fn set_manifest(&self, manifest: Manifest) -> Result<(), LocalFsError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        if manifest.height != self.height {
            return Err(LocalFsError::Invalid(format!(
                "manifest of {} in writer of {}",
                manifest.height, self.height
            )));
        }
        inner.manifest = Some(manifest);
        Ok(())
    }

    pub fn set_proposal(&self, proposal: &ProposalSignFact) -> Result<(), LocalFsError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;

        let b = self.enc.marshal(proposal)?;
        let item = self.write_single(BlockItemType::Proposal, &b)?;
        inner.items.insert(BlockItemType::Proposal, item);
        Ok(())
    }

    /// Append the operation at `index`.
    pub fn set_operation(&self, index: u64, op: &Operation) -> Result<(), LocalFsError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;

        if inner.operations.is_none() {
            inner.operations = Some(ItemFile::create(
                self.item_path(BlockItemType::Operations),
                true,
            )?);
        }
        if let Some(f) = inner.operations.as_mut() {
            f.write_indexed(&self.enc, index, op)?;
        }
        Ok(())
    }

    /// Append the state at `index`.
    pub fn set_state(&self, index: u64, st: &State) -> Result<(), LocalFsError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;

        if inner.states.is_none() {
            inner.states = Some(ItemFile::create(
                self.item_path(BlockItemType::States),
                true,
            )?);
        }
        if let Some(f) = inner.states.as_mut() {
            f.write_indexed(&self.enc, index, st)?;
        }
        Ok(())
    }

    pub fn set_operations_tree(&self, tree: FixedTree) -> Result<(), LocalFsError> {
        self.set_tree(BlockItemType::OperationsTree, tree)
    }

    pub fn set_states_tree(&self, tree: FixedTree) -> Result<(), LocalFsError> {
        self.set_tree(BlockItemType::StatesTree, tree)
    }

    fn set_tree(&self, t: BlockItemType, tree: FixedTree) -> Result<(), LocalFsError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;

        let mut f = ItemFile::create(self.item_path(t), true)?;
        f.write_raw_line(FIXED_TREE_HINT.as_bytes())?;
        for node in tree.nodes() {
            f.write_indexed(&self.enc, node.index, node)?;
        }
        inner.items.insert(t, f.finish()?);

        match t {
            BlockItemType::OperationsTree => inner.operations_tree = Some(tree),
            _ => inner.states_tree = Some(tree),
        }
        Ok(())
    }

    pub fn set_init_voteproof(&self, ivp: &Voteproof) -> Result<(), LocalFsError> {
        if !ivp.is_init() {
            return Err(LocalFsError::Invalid("not init voteproof".into()));
        }
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.ivp = Some(ivp.clone());
        self.write_voteproofs(&mut inner)
    }

    pub fn set_accept_voteproof(&self, avp: &Voteproof) -> Result<(), LocalFsError> {
        if avp.is_init() {
            return Err(LocalFsError::Invalid("not accept voteproof".into()));
        }
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.avp = Some(avp.clone());
        self.write_voteproofs(&mut inner)
    }

    fn write_voteproofs(&self, inner: &mut Inner) -> Result<(), LocalFsError> {
        let (Some(ivp), Some(avp)) = (&inner.ivp, &inner.avp) else {
            return Ok(());
        };

        let mut f = ItemFile::create(self.item_path(BlockItemType::Voteproofs), false)?;
        f.write_line(&self.enc, ivp)?;
        f.write_line(&self.enc, avp)?;
        let item = f.finish()?;
        inner.items.insert(BlockItemType::Voteproofs, item);
        Ok(())
    }

    fn write_single(&self, t: BlockItemType, b: &[u8]) -> Result<BlockMapItem, LocalFsError> {
        let mut f = ItemFile::create(self.item_path(t), t.is_compressed())?;
        f.write_raw_line(b)?;
        let mut item = f.finish()?;
        item.count = 1;
        Ok(item)
    }

    /// Sign the block map and publish the block.
    ///
    /// Fails with [`LocalFsError::AlreadyExists`] when the block directory is
    /// already there.
    pub fn save(&self) -> Result<BlockMap, LocalFsError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;

        let target = block_directory(&self.root, self.height);
        if target.exists() {
            return Err(LocalFsError::AlreadyExists(target));
        }

        let manifest = inner
            .manifest
            .clone()
            .ok_or_else(|| LocalFsError::Invalid("empty manifest".into()))?;
        for t in [BlockItemType::Proposal, BlockItemType::Voteproofs] {
            if !inner.items.contains_key(&t) {
                return Err(LocalFsError::Invalid(format!("{t} not set")));
            }
        }
        check_tree_root(
            "operations",
            manifest.operations_tree,
            inner.operations_tree.as_ref(),
        )?;
        check_tree_root("states", manifest.states_tree, inner.states_tree.as_ref())?;

        for (t, file) in [
            (BlockItemType::Operations, inner.operations.take()),
            (BlockItemType::States, inner.states.take()),
        ] {
            let Some(file) = file else {
                continue;
            };
            if file.count() < 1 {
                let path = file.path().to_path_buf();
                drop(file);
                fs::remove_file(path)?;
                continue;
            }
            inner.items.insert(t, file.finish()?);
        }

        let mut map = BlockMap::new(manifest);
        for (t, item) in &inner.items {
            map.set_item(*t, item.clone());
        }
        map.sign(&self.local, &self.network_id);

        fs::write(
            self.item_path(BlockItemType::Map),
            self.enc.marshal(&map)?,
        )?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&self.temp, &target)?;
        inner.saved = true;

        debug!(height = self.height.0, path = %target.display(), "block saved");
        Ok(map)
    }

    /// Remove the temporary directory. Idempotent; a saved block is kept.
    pub fn cancel(&self) -> Result<(), LocalFsError> {
        let mut inner = self.inner.lock();
        if inner.saved || inner.canceled {
            return Ok(());
        }
        inner.canceled = true;
        inner.operations = None;
        inner.states = None;

        match fs::remove_dir_all(&self.temp) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(path = %self.temp.display(), error = %e, "failed to remove temp directory");
                Err(e.into())
            }
        }
    }
}

fn check_tree_root(
    what: &str,
    expected: Option<isaac_types::Hash>,
    tree: Option<&FixedTree>,
) -> Result<(), LocalFsError> {
    let got = tree.map(FixedTree::root);
    if expected != got {
        return Err(LocalFsError::Invalid(format!(
            "{what} tree root does not match manifest"
        )));
    }
    Ok(())
}
