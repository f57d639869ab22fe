//! The packing driver: partition a source tree into archives.
//!
//! Every directory is packed on its own: files below the small limit
//! share one archive, files below the medium limit share another, and
//! each file beyond that becomes a single-entry archive that
//! [`TarFile::fix_size`] may split into parts. The directory's own entry
//! is placed in front of the contents of its first archive. Once all
//! archives are finalised and content-hashed, the catalogue text is
//! rendered, the snapshot-wide hashes computed, and the version 2 names
//! assigned.

use anyhow::{bail, Error};

use beak_datastore::file_name::{TarFileName, TarFileType};
use beak_datastore::index::IndexFile;
use beak_datastore::tar_entry::TarEntry;
use beak_datastore::tar_file::{calculate_global_hashes, TarFile, TarHeaderStyle};
use beak_tools::fs::FileSystem;
use beak_tools::order;
use beak_tools::path::Path;

pub struct PackOptions {
    /// Archives larger than this are cut into parts of this size.
    pub split_size: u64,
    /// Files below this share the directory's small-files archive.
    pub small_file_limit: u64,
    /// Files below this share the directory's medium-files archive;
    /// everything beyond is stored alone.
    pub medium_file_limit: u64,
    pub header_style: TarHeaderStyle,
}

impl Default for PackOptions {
    fn default() -> Self {
        PackOptions {
            split_size: 50 * 1024 * 1024,
            small_file_limit: 100 * 1024,
            medium_file_limit: 10 * 1024 * 1024,
            header_style: TarHeaderStyle::Full,
        }
    }
}

/// The name of one stored part and where its bytes come from.
pub struct PackedPart {
    pub name: TarFileName,
    pub tar_index: usize,
    pub part_nr: u64,
}

pub struct PackResult {
    pub tars: Vec<TarFile>,
    pub index: IndexFile,
    pub parts: Vec<PackedPart>,
    pub index_name: TarFileName,
}

fn collect_dirs(fs: &dyn FileSystem, dir: Path, dirs: &mut Vec<Path>) -> Result<(), Error> {
    dirs.push(dir);
    for child in fs.readdir(dir)? {
        if fs.stat(child)?.is_directory() {
            collect_dirs(fs, child, dirs)?;
        }
    }
    Ok(())
}

fn tarpath_below(root: Path, p: Path) -> Result<Path, Error> {
    match p.subpath(root.depth()) {
        Some(relative) => Ok(relative),
        None => bail!("{} is not below {}", p.as_str(), root.as_str()),
    }
}

struct DirPacker<'a> {
    fs: &'a dyn FileSystem,
    root: Path,
    tars: Vec<TarFile>,
}

impl<'a> DirPacker<'a> {
    fn entry(&self, p: Path) -> Result<TarEntry, Error> {
        let stat = self.fs.stat(p)?;
        let link = if stat.is_symbolic_link() {
            Some(self.fs.readlink(p)?)
        } else {
            None
        };
        TarEntry::new(p, tarpath_below(self.root, p)?, stat, link)
    }

    fn pack_dir(&mut self, dir: Path, opts: &PackOptions) -> Result<(), Error> {
        let mut children = self.fs.readdir(dir)?;
        children.sort_by(|a, b| order::tar_cmp(*a, *b));

        let mut smalls: Option<TarFile> = None;
        let mut mediums: Option<TarFile> = None;
        let mut singles: Vec<TarFile> = Vec::new();

        for child in children {
            let stat = self.fs.stat(child)?;
            if stat.is_directory() {
                continue;
            }
            if stat.is_socket() {
                log::debug!("skipping socket {}", child.as_str());
                continue;
            }
            let entry = self.entry(child)?;
            if stat.is_regular_file() && stat.size >= opts.medium_file_limit {
                let mut single = TarFile::new(TarFileType::RegFile);
                single.add_entry_last(entry);
                singles.push(single);
            } else if stat.is_regular_file() && stat.size >= opts.small_file_limit {
                mediums
                    .get_or_insert_with(|| TarFile::new(TarFileType::MediumFilesTar))
                    .add_entry_last(entry);
            } else {
                smalls
                    .get_or_insert_with(|| TarFile::new(TarFileType::SmallFilesTar))
                    .add_entry_last(entry);
            }
        }

        // the directory's own header goes in front of its contents
        if !dir.is_root() && dir != self.root {
            let dir_entry = self.entry(dir)?;
            if let Some(tar) = smalls.as_mut() {
                tar.add_entry_first(dir_entry);
            } else if let Some(tar) = mediums.as_mut() {
                tar.add_entry_first(dir_entry);
            } else {
                let mut dir_tar = TarFile::new(TarFileType::DirTar);
                dir_tar.add_entry_first(dir_entry);
                smalls = Some(dir_tar);
            }
        }

        self.tars.extend(smalls);
        self.tars.extend(mediums);
        self.tars.extend(singles);
        Ok(())
    }
}

/// Pack the tree below `root` into archives, hash everything and assign
/// the final names.
pub fn pack_tree(
    fs: &dyn FileSystem,
    root: Path,
    opts: &PackOptions,
) -> Result<PackResult, Error> {
    let mut dirs = Vec::new();
    collect_dirs(fs, root, &mut dirs)?;
    // deepest directories first, so archives exist before the
    // directories containing them are packed
    dirs.sort_by(|a, b| order::depth_first_cmp(*a, *b));

    let mut packer = DirPacker {
        fs,
        root,
        tars: Vec::new(),
    };
    for dir in dirs {
        packer.pack_dir(dir, opts)?;
    }
    let mut tars = packer.tars;

    for tar in &mut tars {
        tar.fix_size(opts.split_size, opts.header_style);
        tar.calculate_hash(fs)?;
    }

    let index = IndexFile::create(&tars)?;
    calculate_global_hashes(&mut tars, index.text.as_bytes())?;

    let mut parts = Vec::new();
    for (tar_index, tar) in tars.iter().enumerate() {
        for part_nr in 0..tar.num_parts() {
            parts.push(PackedPart {
                name: tar.file_name(part_nr)?,
                tar_index,
                part_nr,
            });
        }
    }
    let index_name = index.file_name();

    log::debug!(
        "packed {} archives in {} parts plus catalogue",
        tars.len(),
        parts.len()
    );

    Ok(PackResult {
        tars,
        index,
        parts,
        index_name,
    })
}
