//! Destination handles.

use beak_tools::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageType {
    FileSystemStorage,
    RCloneStorage,
    RSyncStorage,
}

/// An opaque destination: where archives go, and which driver ships
/// them.
#[derive(Clone, Copy, Debug)]
pub struct Storage {
    /// Local directory or remote prefix, e.g. `backup:bucket/host`.
    pub storage_location: Path,
    pub storage_type: StorageType,
}

impl Storage {
    pub fn new(storage_location: Path, storage_type: StorageType) -> Storage {
        Storage {
            storage_location,
            storage_type,
        }
    }
}
