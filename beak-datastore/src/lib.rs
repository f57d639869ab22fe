//! The beak archive layer.
//!
//! # Data format
//!
//! A snapshot of a source tree is a set of deterministically named tar
//! archives. Small files of a directory are packed together, medium
//! files get their own shared archive, and each large file is stored as
//! a single-entry archive that may be split into equally sized parts.
//! Every part but the first starts with one GNU multi-volume header
//! recording where in the original file the part resumes.
//!
//! Names are content addresses: each archive name embeds the archive
//! mtime, its size, its part numbering and a SHA-256 that depends on
//! every other archive of the snapshot plus the catalogue text, so any
//! change anywhere in the source tree renames every file of the
//! snapshot.
//!
//! Archives never have to exist as files. [`TarFile::copy`] produces any
//! byte range of any part on demand, synthesising header blocks and
//! reading payload bytes from the source files through the filesystem
//! capability. This is what the reverse mount serves reads from.

pub mod file_name;
pub mod index;
pub mod tar_entry;
pub mod tar_file;
pub mod tar_header;

pub use file_name::{NameError, TarFileName, TarFileType};
pub use index::IndexFile;
pub use tar_entry::TarEntry;
pub use tar_file::{TarFile, TarFileId, TarHeaderStyle};
pub use tar_header::{HeaderError, TarHeader};
