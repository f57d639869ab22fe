//! Packing driver and replication drivers for beak.

pub mod pack;
pub mod progress;
pub mod rclone;
pub mod storage;

pub use pack::{pack_tree, PackOptions, PackResult};
pub use progress::StoreProgress;
pub use rclone::{fetch_files, list_files, send_files, RemoteListing};
pub use storage::{Storage, StorageType};
