use crate::seq_files::{has_sequence_files_directly, has_sequence_files_in_children, list_subdirectories};
use crate::HandlerError;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Where the instrument is putting read files under the watch root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// Read files directly inside the root.
    Flat,
    /// Read files one level down, one subdirectory per barcode.
    Sharded,
    /// Nothing yet.
    Empty,
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layout::Flat => write!(f, "flat"),
            Layout::Sharded => write!(f, "sharded"),
            Layout::Empty => write!(f, "empty"),
        }
    }
}

/// Classifies `root`. Files directly present always win over subdirectories.
pub fn detect_layout(root: &Path) -> Result<Layout, HandlerError> {
    if has_sequence_files_directly(root)? {
        Ok(Layout::Flat)
    } else if has_sequence_files_in_children(root)? {
        Ok(Layout::Sharded)
    } else {
        Ok(Layout::Empty)
    }
}

/// Concrete directories to process for a detected layout.
pub fn directories_for(root: &Path, layout: Layout) -> Result<Vec<PathBuf>, HandlerError> {
    match layout {
        Layout::Flat => Ok(vec![root.to_path_buf()]),
        Layout::Sharded => list_subdirectories(root),
        Layout::Empty => Ok(Vec::new()),
    }
}
