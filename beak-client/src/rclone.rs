//! The rclone replication driver.
//!
//! The driver never speaks any network protocol itself; it wraps the
//! external `rclone` binary through the [`System`] capability with three
//! operations: list the archives already present at a destination,
//! fetch a set of archives, and send a set of archives while following
//! rclone's verbose output to keep a progress counter moving.

use std::collections::HashMap;

use anyhow::{bail, Error};
use lazy_static::lazy_static;
use regex::Regex;

use beak_datastore::file_name::{NameError, TarFileName, TarFileType};
use beak_tools::fs::{FileStat, FileSystem, TimeSpec};
use beak_tools::path::Path;
use beak_tools::system::{CaptureMode, System};

use crate::progress::StoreProgress;
use crate::storage::{Storage, StorageType};

const RCLONE: &str = "rclone";

/// What a destination holds.
#[derive(Default)]
pub struct RemoteListing {
    /// Archives present and intact.
    pub files: Vec<TarFileName>,
    /// Archives whose remote size contradicts their name; they need to
    /// be transmitted again.
    pub bad_files: Vec<TarFileName>,
    /// Names that do not parse as archives.
    pub other_files: Vec<String>,
    /// Stat index of the accepted archives, keyed by their full remote
    /// path.
    pub contents: HashMap<Path, FileStat>,
}

/// List the archives stored at `storage`.
///
/// Every line of `rclone ls` is `<size> <path>`. Unparseable names are
/// collected, not fatal; size mismatches mark the archive bad.
pub fn list_files(storage: &Storage, sys: &dyn System) -> Result<RemoteListing, Error> {
    if storage.storage_type != StorageType::RCloneStorage {
        bail!("not an rclone storage: {}", storage.storage_location.as_str());
    }

    let mut out = Vec::new();
    sys.invoke(
        RCLONE,
        &["ls", storage.storage_location.as_str()],
        &mut out,
        CaptureMode::Stdout,
        None,
    )?;

    let mut listing = RemoteListing::default();
    for raw in out.split(|&b| b == b'\n') {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // 12288 s02_1501080787.579054757_3b5e…f71_07-f_1119232.tar
        let (size, file_name) = match line.split_once(' ') {
            Some((size_field, rest)) => match size_field.parse::<u64>() {
                Ok(size) => (size, rest.trim_start()),
                Err(_) => {
                    listing.other_files.push(line.to_string());
                    continue;
                }
            },
            None => {
                listing.other_files.push(line.to_string());
                continue;
            }
        };

        let tfn = match TarFileName::parse(file_name) {
            Ok(tfn) => tfn,
            Err(err @ NameError::UnsupportedVersion(_)) => return Err(err.into()),
            Err(_) => {
                listing.other_files.push(file_name.to_string());
                continue;
            }
        };

        // TODO: revisit this acceptance rule; for single large files the
        // remote size is ignored unless the declared size is zero.
        let intact = (tfn.file_type != TarFileType::RegFile && tfn.size == size)
            || (tfn.file_type == TarFileType::RegFile && tfn.size == 0);
        if intact {
            if let Some(p) = tfn.path {
                let full = p.prepend(storage.storage_location);
                let stat = FileStat {
                    mode: libc::S_IFREG | libc::S_IRUSR,
                    nlink: 1,
                    size,
                    mtim: TimeSpec::new(tfn.sec, tfn.nsec),
                    ..Default::default()
                };
                listing.contents.insert(full, stat);
            }
            listing.files.push(tfn);
        } else {
            listing.bad_files.push(tfn);
        }
    }
    Ok(listing)
}

/// One relative path per line; rclone rejects leading slashes.
fn include_list(files: &[Path]) -> Vec<u8> {
    let mut out = Vec::new();
    for p in files {
        if let Some(relative) = p.subpath(1) {
            out.extend_from_slice(relative.as_str().as_bytes());
            out.push(b'\n');
        }
    }
    out
}

/// Fetch `files` from `storage` into `dir`.
pub fn fetch_files(
    storage: &Storage,
    files: &[Path],
    dir: Path,
    sys: &dyn System,
    local_fs: &dyn FileSystem,
) -> Result<(), Error> {
    let target_dir = storage.storage_location.prepend(dir);
    let tmp = local_fs.mk_temp_file("beak_fetching_", &include_list(files))?;

    let mut out = Vec::new();
    let result = sys.invoke(
        RCLONE,
        &[
            "copy",
            "--include-from",
            tmp.as_str(),
            storage.storage_location.as_str(),
            target_dir.as_str(),
        ],
        &mut out,
        CaptureMode::Stdout,
        None,
    );

    local_fs.delete_file(tmp)?;
    result?;
    Ok(())
}

// 2018/01/29 20:05:36 INFO  : pool/s02_…tar: Copied (new)
fn parse_verbose_copy_line(progress: &mut StoreProgress, storage: &Storage, line: &str) {
    lazy_static! {
        static ref COPIED: Regex = Regex::new(r"INFO\s+: (.+): Copied \(new\)").unwrap();
    }
    let captures = match COPIED.captures(line) {
        Some(captures) => captures,
        None => return,
    };
    let full = format!("{}/{}", storage.storage_location.as_str(), &captures[1]);
    if let Ok(tfn) = TarFileName::parse(&full) {
        if let Some(path) = tfn.path {
            progress.register_stored(path);
        }
    }
}

/// Ship `files` from the local `dir` to `storage`, advancing `progress`
/// as rclone confirms copies.
pub fn send_files(
    storage: &Storage,
    files: &[Path],
    dir: Path,
    progress: &mut StoreProgress,
    local_fs: &dyn FileSystem,
    sys: &dyn System,
) -> Result<(), Error> {
    let tmp = local_fs.mk_temp_file("beak_sending_", &include_list(files))?;

    let mut out = Vec::new();
    let mut on_line = |line: &str| parse_verbose_copy_line(progress, storage, line);
    let result = sys.invoke(
        RCLONE,
        &[
            "copy",
            "-v",
            "--include-from",
            tmp.as_str(),
            dir.as_str(),
            storage.storage_location.as_str(),
        ],
        &mut out,
        CaptureMode::Both,
        Some(&mut on_line),
    );

    local_fs.delete_file(tmp)?;
    result?;
    Ok(())
}
