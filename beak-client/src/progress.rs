//! Tracker for progress of store operations.

use std::collections::HashMap;
use std::fmt;

use beak_tools::path::Path;

/// Counts files and bytes confirmed stored by the copy tool, keyed by
/// the sizes of the source files handed to it.
#[derive(Debug, Default)]
pub struct StoreProgress {
    file_sizes: HashMap<Path, u64>,
    /// Total files handed to the copy tool
    pub num_files: u64,
    /// Total bytes handed to the copy tool
    pub size_files: u64,
    /// Files confirmed stored
    pub num_files_stored: u64,
    /// Bytes confirmed stored
    pub size_files_stored: u64,
}

impl StoreProgress {
    pub fn new() -> StoreProgress {
        Default::default()
    }

    /// Announce a file that is about to be shipped.
    pub fn track(&mut self, path: Path, size: u64) {
        if self.file_sizes.insert(path, size).is_none() {
            self.num_files += 1;
            self.size_files += size;
        }
    }

    /// Record a copy confirmation for `path`. Unknown paths are counted
    /// nowhere.
    pub fn register_stored(&mut self, path: Path) -> bool {
        match self.file_sizes.get(&path) {
            Some(&size) => {
                self.num_files_stored += 1;
                self.size_files_stored += size;
                log::debug!("stored {} ({} bytes), {}", path.as_str(), size, self);
                true
            }
            None => {
                log::debug!("copy tool reported unknown file {}", path.as_str());
                false
            }
        }
    }

    pub fn percentage(&self) -> f64 {
        if self.size_files == 0 {
            return 0.0;
        }
        (self.size_files_stored as f64) / (self.size_files as f64)
    }
}

impl fmt::Display for StoreProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2}% ({}/{} files)",
            self.percentage() * 100.0,
            self.num_files_stored,
            self.num_files,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn progress_counts_only_tracked_files() {
        let mut progress = StoreProgress::new();
        let a = Path::lookup("pool/a.tar").unwrap();
        let b = Path::lookup("pool/b.tar").unwrap();
        progress.track(a, 600);
        progress.track(b, 400);
        assert_eq!(progress.num_files, 2);
        assert_eq!(progress.size_files, 1000);

        assert!(progress.register_stored(a));
        assert_eq!(progress.num_files_stored, 1);
        assert_eq!(progress.size_files_stored, 600);
        assert!((progress.percentage() - 0.6).abs() < 1e-9);

        let unknown = Path::lookup("pool/zz.tar").unwrap();
        assert!(!progress.register_stored(unknown));
        assert_eq!(progress.num_files_stored, 1);

        assert_eq!(format!("{}", progress), "60.00% (1/2 files)");
    }
}
