//! The snapshot catalogue.
//!
//! A snapshot is described by one plain-text listing of all its archives
//! and their entries. The text is deterministic: building the same tree
//! twice renders byte-identical output, which in turn keeps the snapshot
//! hash stable. Compression of the stored catalogue is the caller's
//! concern; hashing always covers the uncompressed text.
//!
//! Archives are identified by ordinal and content hash here, not by
//! their final file names: the file names embed the snapshot-wide hash,
//! which itself covers this text.

use std::fmt::Write as _;

use anyhow::{format_err, Error};

use beak_tools::fs::TimeSpec;

use crate::file_name::{TarFileName, TarFileType};
use crate::tar_file::{snapshot_hash, TarFile};

/// Render the catalogue text for a finalised, content-hashed set of
/// archives.
pub fn render_index_text(tars: &[TarFile]) -> Result<String, Error> {
    let mut out = String::new();
    out.push_str("#beak catalogue\n");
    for (ordinal, tar) in tars.iter().enumerate() {
        let content = tar
            .content_hash()
            .ok_or_else(|| format_err!("archive content hash missing in catalogue rendering"))?;
        let _ = writeln!(
            out,
            "#tar {} {} {:x} {} {}",
            ordinal,
            tar.tar_type().type_char(),
            tar.num_parts(),
            tar.total_size(),
            hex::encode(content)
        );
        for entry in tar.entries() {
            let stat = entry.stat();
            let _ = write!(
                out,
                "{:o} {} {} {} {}.{:09} {}",
                stat.mode,
                stat.uid,
                stat.gid,
                stat.size,
                stat.mtim.sec,
                stat.mtim.nsec,
                entry.archive_name()
            );
            if let Some(target) = entry.link() {
                let _ = write!(out, " -> {}", target);
            }
            out.push('\n');
        }
    }
    Ok(out)
}

/// The catalogue file of one snapshot: the rendered text, the mtime of
/// the newest archive and the snapshot hash.
pub struct IndexFile {
    pub text: String,
    pub mtim: TimeSpec,
    pub hash: [u8; 32],
}

impl IndexFile {
    pub fn create(tars: &[TarFile]) -> Result<IndexFile, Error> {
        let text = render_index_text(tars)?;
        let mut mtim = TimeSpec::default();
        for tar in tars {
            tar.update_mtim(&mut mtim);
        }
        let hash = snapshot_hash(tars, text.as_bytes())?;
        Ok(IndexFile { text, mtim, hash })
    }

    /// The catalogue's own file name. Catalogues keep the version 1
    /// grammar; `is_index_file` and existing stores look for the
    /// `z01_` prefix.
    pub fn file_name(&self) -> TarFileName {
        TarFileName {
            file_type: TarFileType::IndexFile,
            version: 1,
            sec: self.mtim.sec,
            nsec: self.mtim.nsec,
            size: self.text.len() as u64,
            header_hash: hex::encode(self.hash),
            part_nr: 0,
            num_parts: 1,
            path: None,
        }
    }
}
