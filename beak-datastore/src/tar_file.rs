//! An archive: an ordered collection of tar entries with splitting,
//! hashing and on-demand byte extraction.
//!
//! An archive is built by appending entries, finalised once with
//! [`TarFile::fix_size`] (which decides the part layout), hashed, and
//! from then on served: any `(part_nr, offset)` range can be produced
//! without the archive ever existing on disk, by synthesising header
//! bytes and reading payload bytes from the source files.

use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{bail, format_err, Error};
use openssl::sha::Sha256;

use beak_tools::fs::{FileStat, FileSystem, TimeSpec};
use beak_tools::path::Path;

use crate::file_name::{TarFileName, TarFileType};
use crate::tar_entry::TarEntry;
use crate::tar_header::{TarHeader, BLOCK_SIZE};

/// Whether split parts carry a multi-volume continuation header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TarHeaderStyle {
    None,
    Full,
}

/// Weak reference from an entry back to the archive holding it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TarFileId(u32);

static NEXT_TAR_FILE_ID: AtomicU32 = AtomicU32::new(0);

/// Part layout for an archive of `file_size` bytes cut into parts of at
/// most `part_size` bytes, each part but the first led by a multi-volume
/// header of `mv_header_size` bytes.
///
/// The first part has no continuation header, so its whole budget holds
/// content; every later part loses `mv_header_size` bytes to the header.
/// With size 13, part size 5 and header size 1 the content fits three
/// parts exactly: `[c c c c c] [H c c c c] [H c c c c]`. With size 14 a
/// fourth part `[H c]` is needed.
///
/// Returns `(num_parts, last_part_size)`.
pub fn split_parts_with_header(
    file_size: u64,
    part_size: u64,
    mv_header_size: u64,
) -> (u64, u64) {
    assert!(part_size > mv_header_size);
    assert!(file_size >= mv_header_size);

    let mut num_parts = (file_size - mv_header_size) / (part_size - mv_header_size);
    let stores = part_size + (num_parts - 1) * (part_size - mv_header_size);
    let last_part_size;
    if stores == file_size {
        last_part_size = part_size;
        log::debug!(
            "splitting into {} equal parts, part size {}",
            num_parts,
            part_size
        );
    } else {
        num_parts += 1;
        last_part_size = mv_header_size + file_size - stores;
        log::debug!(
            "splitting {} bytes into {} parts, part size {}, last part {}",
            file_size,
            num_parts,
            part_size,
            last_part_size
        );
    }
    (num_parts, last_part_size)
}

fn mv_header_size(style: TarHeaderStyle) -> u64 {
    match style {
        TarHeaderStyle::None => 0,
        TarHeaderStyle::Full => BLOCK_SIZE as u64,
    }
}

/// An archive under construction or being served.
pub struct TarFile {
    id: TarFileId,
    tar_type: TarFileType,
    entries: Vec<TarEntry>,
    offsets: Vec<u64>,
    current_tar_offset: u64,
    size: u64,
    num_parts: u64,
    part_size: u64,
    last_part_size: u64,
    header_size: u64,
    mtim: TimeSpec,
    content_hash: Option<[u8; 32]>,
    hash: Option<[u8; 32]>,
}

impl TarFile {
    pub fn new(tar_type: TarFileType) -> TarFile {
        TarFile {
            id: TarFileId(NEXT_TAR_FILE_ID.fetch_add(1, Ordering::SeqCst)),
            tar_type,
            entries: Vec::new(),
            offsets: Vec::new(),
            current_tar_offset: 0,
            size: 0,
            num_parts: 1,
            part_size: 0,
            last_part_size: 0,
            header_size: 0,
            mtim: TimeSpec::default(),
            content_hash: None,
            hash: None,
        }
    }

    pub fn id(&self) -> TarFileId {
        self.id
    }

    pub fn tar_type(&self) -> TarFileType {
        self.tar_type
    }

    pub fn entries(&self) -> &[TarEntry] {
        &self.entries
    }

    pub fn mtim(&self) -> TimeSpec {
        self.mtim
    }

    /// Append an entry at the current end of the archive.
    pub fn add_entry_last(&mut self, mut entry: TarEntry) {
        entry.update_mtim(&mut self.mtim);
        entry.register_tar_file(self.id, self.current_tar_offset);
        log::debug!(
            "added {} at {}",
            entry.path().as_str(),
            self.current_tar_offset
        );
        self.offsets.push(self.current_tar_offset);
        self.current_tar_offset += entry.blocked_size();
        self.entries.push(entry);
    }

    /// Prepend an entry, re-basing every offset behind it. Used to put a
    /// directory's own header in front of the directory's contents.
    pub fn add_entry_first(&mut self, mut entry: TarEntry) {
        entry.update_mtim(&mut self.mtim);
        entry.register_tar_file(self.id, 0);
        let blocked = entry.blocked_size();
        for (existing, offset) in self.entries.iter_mut().zip(self.offsets.iter_mut()) {
            *offset += blocked;
            existing.register_tar_file(self.id, *offset);
        }
        log::debug!("added {} first, re-based {} entries", entry.path().as_str(), self.entries.len());
        self.entries.insert(0, entry);
        self.offsets.insert(0, 0);
        self.current_tar_offset += blocked;
    }

    /// Keep `mtim` at the maximum of itself and this archive's mtime.
    /// An archive mtime in the future is ignored.
    pub fn update_mtim(&self, mtim: &mut TimeSpec) {
        if self.mtim.is_in_the_future() {
            log::warn!("archive has a timestamp in the future, ignoring it");
        } else if self.mtim > *mtim {
            *mtim = self.mtim;
        }
    }

    /// Fix the archive size and part layout. Must be called once, after
    /// the last entry was added.
    pub fn fix_size(&mut self, split_size: u64, style: TarHeaderStyle) {
        self.size = self.current_tar_offset;
        if self.size <= split_size {
            self.num_parts = 1;
            self.part_size = self.size;
            self.last_part_size = self.size;
            self.header_size = 0;
            return;
        }
        let header_size = mv_header_size(style);
        let (num_parts, last_part_size) =
            split_parts_with_header(self.size, split_size, header_size);
        self.num_parts = num_parts;
        self.part_size = split_size;
        self.last_part_size = last_part_size;
        self.header_size = header_size;
    }

    /// Total size of the logical, unsplit archive.
    pub fn total_size(&self) -> u64 {
        self.size
    }

    pub fn num_parts(&self) -> u64 {
        self.num_parts
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Size of the multi-volume header leading every part but the first.
    pub fn header_size(&self) -> u64 {
        self.header_size
    }

    /// Size of one part.
    pub fn size(&self, part_nr: u64) -> u64 {
        assert!(part_nr < self.num_parts);
        if self.num_parts == 1 {
            return self.size;
        }
        if part_nr < self.num_parts - 1 {
            self.part_size
        } else {
            self.last_part_size
        }
    }

    /// Map an offset within a part to its position in the logical
    /// archive stream. Offsets inside the multi-volume header of a part
    /// have no origin position.
    pub fn calculate_origin_tar_offset(&self, part_nr: u64, offset: u64) -> u64 {
        assert!(part_nr < self.num_parts);
        if part_nr == 0 {
            return offset;
        }
        assert!(offset >= self.header_size);
        // Part 0 stores part_size content bytes, every later part
        // part_size - header_size. With size 14, part size 5, header 1:
        // [c c c c c] [H c c c c] [H c c c c] [H c]
        // part 2 offset 3 lands at (3-1) + 5 + 1*(5-1) = 11.
        (offset - self.header_size)
            + self.part_size
            + (part_nr - 1) * (self.part_size - self.header_size)
    }

    /// The entry whose framed range contains `offset`, and the offset at
    /// which that entry starts.
    // The end-of-stream offset still resolves to the last entry instead
    // of nothing; a read there produces zero bytes either way.
    pub fn find_tar_entry(&self, offset: u64) -> Option<(&TarEntry, u64)> {
        if offset > self.size || self.offsets.is_empty() {
            return None;
        }
        let i = self.offsets.partition_point(|&o| o <= offset);
        let i = i.saturating_sub(1);
        Some((&self.entries[i], self.offsets[i]))
    }

    fn multivol_header(&self, part_nr: u64) -> Result<[u8; BLOCK_SIZE], Error> {
        let resume = self.calculate_origin_tar_offset(part_nr, self.header_size);
        let (entry, entry_offset) = self
            .find_tar_entry(resume)
            .ok_or_else(|| format_err!("no entry at origin offset {}", resume))?;
        let payload_start = entry_offset + entry.header_size();
        if resume < payload_start {
            bail!("part {} resumes inside an entry header", part_nr);
        }
        let file_offset = resume - payload_start;
        let mut th = TarHeader::new();
        th.set_multivol_type(entry.archive_name(), file_offset)?;
        th.set_size(entry.stat().size.saturating_sub(file_offset));
        th.calculate_checksum();
        Ok(*th.as_bytes())
    }

    /// Serve bytes of one part. Offsets inside the continuation header
    /// of a non-first part produce freshly synthesised header bytes; all
    /// other offsets are mapped back to the logical stream and served by
    /// the containing entry. Returns the number of bytes produced; zero
    /// means end of part.
    pub fn copy(
        &self,
        buf: &mut [u8],
        offset: u64,
        fs: &dyn FileSystem,
        part_nr: u64,
    ) -> Result<usize, Error> {
        if part_nr >= self.num_parts {
            bail!("part {} of {} requested", part_nr, self.num_parts);
        }
        if offset >= self.size(part_nr) {
            return Ok(0);
        }
        let mut copied = 0usize;
        let mut from = offset;
        while copied < buf.len() {
            if part_nr > 0 && from < self.header_size {
                let block = self.multivol_header(part_nr)?;
                let want = std::cmp::min((self.header_size - from) as usize, buf.len() - copied);
                let start = from as usize;
                buf[copied..copied + want].copy_from_slice(&block[start..start + want]);
                copied += want;
                from += want as u64;
            } else {
                let origin_from = self.calculate_origin_tar_offset(part_nr, from);
                let (entry, entry_offset) = match self.find_tar_entry(origin_from) {
                    Some(found) => found,
                    None => break,
                };
                let n = entry.copy(&mut buf[copied..], origin_from - entry_offset, fs)?;
                if n == 0 {
                    break;
                }
                copied += n;
                from += n as u64;
            }
        }
        Ok(copied)
    }

    /// Materialise one part as a file in `dst_fs`, pulling bytes through
    /// [`copy`](Self::copy) starting at `off`.
    pub fn create_file(
        &self,
        file: Path,
        stat: &FileStat,
        part_nr: u64,
        src_fs: &dyn FileSystem,
        dst_fs: &dyn FileSystem,
        off: u64,
        update_progress: &mut dyn FnMut(u64),
    ) -> Result<u64, Error> {
        let part_size = self.size(part_nr);
        let mut producer = |offset: u64, buf: &mut [u8]| -> Result<usize, Error> {
            let pos = off + offset;
            if pos >= part_size {
                return Ok(0);
            }
            let want = std::cmp::min(buf.len() as u64, part_size - pos) as usize;
            let n = self.copy(&mut buf[..want], pos, src_fs, part_nr)?;
            update_progress(n as u64);
            Ok(n)
        };
        dst_fs.create_file(file, stat, &mut producer)
    }

    /// SHA-256 over the hashes of the contained entries, in offset
    /// order.
    pub fn calculate_hash(&mut self, fs: &dyn FileSystem) -> Result<(), Error> {
        let mut hasher = Sha256::new();
        for entry in &self.entries {
            hasher.update(entry.hash(fs)?);
        }
        self.content_hash = Some(hasher.finish());
        Ok(())
    }

    /// Hash over the entry hashes alone; input to the snapshot-wide
    /// hashing pass.
    pub fn content_hash(&self) -> Option<&[u8; 32]> {
        self.content_hash.as_ref()
    }

    /// The content address embedded in this archive's file names.
    pub fn hash(&self) -> Option<&[u8; 32]> {
        self.hash.as_ref()
    }

    /// The self-describing name of one part of this archive.
    pub fn file_name(&self, part_nr: u64) -> Result<TarFileName, Error> {
        let hash = self
            .hash
            .ok_or_else(|| format_err!("archive hash has not been calculated yet"))?;
        Ok(TarFileName {
            file_type: self.tar_type,
            version: 2,
            sec: self.mtim.sec,
            nsec: self.mtim.nsec,
            size: self.size(part_nr),
            header_hash: hex::encode(hash),
            part_nr,
            num_parts: self.num_parts,
            path: None,
        })
    }
}

/// Give every archive its final, snapshot-wide hash: SHA-256 over the
/// content hashes of all *other* archives followed by the index text.
/// Any change anywhere in the snapshot therefore changes every archive
/// name. All content hashes must be fixed before this pass runs.
pub fn calculate_global_hashes(tars: &mut [TarFile], index_text: &[u8]) -> Result<(), Error> {
    let contents: Vec<[u8; 32]> = tars
        .iter()
        .map(|t| {
            t.content_hash.ok_or_else(|| {
                format_err!("archive content hash missing before snapshot hashing")
            })
        })
        .collect::<Result<_, Error>>()?;
    for (i, tar) in tars.iter_mut().enumerate() {
        let mut hasher = Sha256::new();
        for (j, digest) in contents.iter().enumerate() {
            if j != i {
                hasher.update(digest);
            }
        }
        hasher.update(index_text);
        tar.hash = Some(hasher.finish());
    }
    Ok(())
}

/// The snapshot hash over *all* archives plus the index text; this is
/// the content address of the index file itself.
pub fn snapshot_hash(tars: &[TarFile], index_text: &[u8]) -> Result<[u8; 32], Error> {
    let mut hasher = Sha256::new();
    for tar in tars {
        let digest = tar
            .content_hash
            .ok_or_else(|| format_err!("archive content hash missing before snapshot hashing"))?;
        hasher.update(&digest);
    }
    hasher.update(index_text);
    Ok(hasher.finish())
}
