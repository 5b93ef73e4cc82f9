//! Availability of frame-capture blobs at export time.

use std::path::{Component, Path, PathBuf};

use crate::domain::BlobAvailability;

pub trait BlobIndex: Send + Sync {
    fn availability(&self, blob_ref: &str, recorded: BlobAvailability) -> BlobAvailability;
}

/// Trusts the availability recorded when the evidence was ingested
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordedAvailability;

impl BlobIndex for RecordedAvailability {
    fn availability(&self, _blob_ref: &str, recorded: BlobAvailability) -> BlobAvailability {
        recorded
    }
}

/// Blobs stored as files under a root directory
#[derive(Debug, Clone)]
pub struct DirectoryBlobIndex {
    root: PathBuf,
}

impl DirectoryBlobIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BlobIndex for DirectoryBlobIndex {
    fn availability(&self, blob_ref: &str, recorded: BlobAvailability) -> BlobAvailability {
        if recorded == BlobAvailability::Expired {
            return BlobAvailability::Expired;
        }
        // only plain relative paths below the root
        let relative = Path::new(blob_ref);
        let contained = relative.components().next().is_some()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if contained && self.root.join(relative).is_file() {
            BlobAvailability::Present
        } else {
            BlobAvailability::Expired
        }
    }
}
