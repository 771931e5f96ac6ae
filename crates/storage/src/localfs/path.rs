//! Block directory layout.

use isaac_core::Encoder;
use isaac_types::{BlockItemType, Height};
use std::path::{Path, PathBuf};

/// Directory holding blocks being written.
pub const TEMP_DIR: &str = "temp";

const HEIGHT_WIDTH: usize = 12;
const SEGMENT: usize = 3;

/// Relative directory of a block: the height zero-padded to 12 characters
/// and split into 3-character segments, `-` replaced by `_`. Longer heights
/// are padded to the next multiple of 3.
///
/// ```
/// # use isaac_storage::localfs::height_directory;
/// # use isaac_types::Height;
/// assert_eq!(height_directory(Height(33)).to_str(), Some("000/000/000/033"));
/// ```
pub fn height_directory(height: Height) -> PathBuf {
    let digits = height.0.to_string().len();
    let width = HEIGHT_WIDTH.max(digits.div_ceil(SEGMENT) * SEGMENT);
    let padded = format!("{:0width$}", height.0, width = width).replace('-', "_");

    let mut path = PathBuf::new();
    for chunk in padded.as_bytes().chunks(SEGMENT) {
        path.push(String::from_utf8_lossy(chunk).as_ref());
    }
    path
}

/// Absolute directory of a block under `root`.
pub fn block_directory(root: &Path, height: Height) -> PathBuf {
    root.join(height_directory(height))
}

/// File name of an item: the type name, the encoder extension and `.gz`
/// for compressed types.
pub fn item_file_name<E: Encoder>(enc: &E, t: BlockItemType) -> String {
    let mut name = format!("{}{}", t.name(), enc.extension(t.is_list()));
    if t.is_compressed() {
        name.push_str(".gz");
    }
    name
}

/// New temporary directory for `height`.
pub fn temp_directory(root: &Path, height: Height) -> PathBuf {
    root.join(TEMP_DIR)
        .join(format!("{}-{}", height.0, ulid::Ulid::new()))
}
