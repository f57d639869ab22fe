//! A single source file, directory or link framed for an archive.

use anyhow::{bail, Error};
use once_cell::sync::OnceCell;
use openssl::sha::Sha256;

use beak_tools::fs::{FileStat, FileSystem, TimeSpec};
use beak_tools::path::Path;

use crate::tar_file::TarFileId;
use crate::tar_header::{
    self, TarHeader, BLOCK_SIZE, BLKTYPE, CHRTYPE, DIRTYPE, FIFOTYPE, LNKTYPE, REGTYPE, SYMTYPE,
};

fn round_up_block(n: u64) -> u64 {
    (n + BLOCK_SIZE as u64 - 1) & !(BLOCK_SIZE as u64 - 1)
}

/// One entry of an archive.
///
/// The entry knows where its bytes live in the source filesystem
/// (`path`), the name it carries inside the archive (`tarpath`), and,
/// once registered, which archive holds it at which offset. Header bytes
/// are rendered at construction time; payload bytes are never held in
/// memory, they are read through the filesystem capability on demand.
///
/// Entries are immutable after registration.
pub struct TarEntry {
    path: Path,
    tarpath: Path,
    name: String,
    stat: FileStat,
    link: Option<String>,
    header: Vec<u8>,
    payload: u64,
    registered: Option<(TarFileId, u64)>,
    hash: OnceCell<[u8; 32]>,
}

fn build_header_bytes(
    tarpath: Path,
    stat: &FileStat,
    link: Option<&str>,
) -> Result<(String, Vec<u8>, u64), Error> {
    let mut name = tarpath.as_str().trim_start_matches('/').to_string();
    if stat.is_directory() && !name.ends_with('/') {
        name.push('/');
    }

    let mut out = Vec::with_capacity(BLOCK_SIZE);

    if tar_header::num_long_path_blocks(&name) > 0 {
        let mut lh = TarHeader::new();
        lh.set_long_path_type(&name)?;
        lh.calculate_checksum();
        out.extend_from_slice(lh.as_bytes());
        let payload_len = round_up_block(name.len() as u64 + 1) as usize;
        let mut payload = vec![0u8; payload_len];
        payload[..name.len()].copy_from_slice(name.as_bytes());
        out.extend_from_slice(&payload);
    }

    if let Some(target) = link {
        if tar_header::num_long_link_blocks(target) > 0 {
            let mut kh = TarHeader::new();
            kh.set_long_link_type(target)?;
            kh.calculate_checksum();
            out.extend_from_slice(kh.as_bytes());
            let payload_len = round_up_block(target.len() as u64 + 1) as usize;
            let mut payload = vec![0u8; payload_len];
            payload[..target.len()].copy_from_slice(target.as_bytes());
            out.extend_from_slice(&payload);
        }
    }

    let mut h = TarHeader::new();
    h.set_path(&name);
    h.set_mode(stat.mode);
    h.set_uid(stat.uid);
    h.set_gid(stat.gid);
    h.set_mtime(stat.mtim.sec);
    h.set_atime(stat.atim.sec);
    h.set_ctime(stat.ctim.sec);

    let payload;
    if stat.is_directory() {
        h.set_type_flag(DIRTYPE);
        h.set_size(0);
        payload = 0;
    } else if stat.is_symbolic_link() {
        h.set_type_flag(SYMTYPE);
        h.set_size(0);
        h.set_link_name(link.unwrap_or(""));
        payload = 0;
    } else if stat.is_character_device() {
        h.set_type_flag(CHRTYPE);
        h.set_size(0);
        h.set_dev(stat.rdev >> 8, stat.rdev & 0xff);
        payload = 0;
    } else if stat.is_block_device() {
        h.set_type_flag(BLKTYPE);
        h.set_size(0);
        h.set_dev(stat.rdev >> 8, stat.rdev & 0xff);
        payload = 0;
    } else if stat.is_fifo() {
        h.set_type_flag(FIFOTYPE);
        h.set_size(0);
        payload = 0;
    } else if link.is_some() {
        // second and later links to an already stored file
        h.set_type_flag(LNKTYPE);
        h.set_size(0);
        h.set_link_name(link.unwrap_or(""));
        payload = 0;
    } else {
        h.set_type_flag(REGTYPE);
        h.set_size(stat.size);
        payload = stat.size;
    }
    h.calculate_checksum();
    out.extend_from_slice(h.as_bytes());

    Ok((name, out, payload))
}

impl TarEntry {
    pub fn new(
        path: Path,
        tarpath: Path,
        stat: FileStat,
        link: Option<String>,
    ) -> Result<TarEntry, Error> {
        let (name, header, payload) = build_header_bytes(tarpath, &stat, link.as_deref())?;
        Ok(TarEntry {
            path,
            tarpath,
            name,
            stat,
            link,
            header,
            payload,
            registered: None,
            hash: OnceCell::new(),
        })
    }

    pub fn path(&self) -> Path {
        self.path
    }

    pub fn tarpath(&self) -> Path {
        self.tarpath
    }

    /// The name recorded in the entry's header block.
    pub fn archive_name(&self) -> &str {
        &self.name
    }

    pub fn stat(&self) -> &FileStat {
        &self.stat
    }

    pub fn link(&self) -> Option<&str> {
        self.link.as_deref()
    }

    /// Header bytes, long-name stages included.
    pub fn header_size(&self) -> u64 {
        self.header.len() as u64
    }

    /// Payload bytes before padding; zero for everything but regular
    /// files.
    pub fn payload_size(&self) -> u64 {
        self.payload
    }

    /// Header plus payload padded to the next block boundary.
    pub fn blocked_size(&self) -> u64 {
        self.header_size() + round_up_block(self.payload)
    }

    /// Keep `mtim` at the maximum of itself and this entry's mtime.
    pub fn update_mtim(&self, mtim: &mut TimeSpec) {
        if self.stat.mtim > *mtim {
            *mtim = self.stat.mtim;
        }
    }

    pub(crate) fn register_tar_file(&mut self, tar: TarFileId, offset: u64) {
        self.registered = Some((tar, offset));
    }

    /// The archive this entry was placed in.
    pub fn tar_file(&self) -> Option<TarFileId> {
        self.registered.map(|(id, _)| id)
    }

    /// Offset of this entry inside its archive.
    pub fn tar_offset(&self) -> Option<u64> {
        self.registered.map(|(_, offset)| offset)
    }

    /// SHA-256 over the header bytes followed by the payload, computed
    /// on first use and cached.
    pub fn hash(&self, fs: &dyn FileSystem) -> Result<&[u8; 32], Error> {
        self.hash.get_or_try_init(|| {
            let mut hasher = Sha256::new();
            hasher.update(&self.header);
            let mut buf = vec![0u8; 64 * 1024];
            let mut offset = 0u64;
            while offset < self.payload {
                let want = std::cmp::min(buf.len() as u64, self.payload - offset) as usize;
                let n = fs.pread(self.path, &mut buf[..want], offset)?;
                if n == 0 {
                    bail!(
                        "short read hashing {:?} at offset {}",
                        self.path.as_str(),
                        offset
                    );
                }
                hasher.update(&buf[..n]);
                offset += n as u64;
            }
            Ok(hasher.finish())
        })
    }

    /// Serve `buf.len()` bytes of the framed entry starting at `offset`
    /// within it: header bytes first, then file payload read through
    /// `fs`, then NUL padding up to the block boundary. Returns the
    /// number of bytes produced; zero past the end.
    pub fn copy(&self, buf: &mut [u8], offset: u64, fs: &dyn FileSystem) -> Result<usize, Error> {
        let total = self.blocked_size();
        let header_size = self.header_size();
        let mut copied = 0usize;
        let mut from = offset;

        while copied < buf.len() && from < total {
            if from < header_size {
                let want =
                    std::cmp::min((header_size - from) as usize, buf.len() - copied);
                let start = from as usize;
                buf[copied..copied + want].copy_from_slice(&self.header[start..start + want]);
                copied += want;
                from += want as u64;
            } else if from < header_size + self.payload {
                let payload_offset = from - header_size;
                let want = std::cmp::min(
                    (self.payload - payload_offset) as usize,
                    buf.len() - copied,
                );
                let n = fs.pread(self.path, &mut buf[copied..copied + want], payload_offset)?;
                if n == 0 {
                    bail!(
                        "short read serving {:?} at offset {}",
                        self.path.as_str(),
                        payload_offset
                    );
                }
                copied += n;
                from += n as u64;
            } else {
                let want = std::cmp::min((total - from) as usize, buf.len() - copied);
                buf[copied..copied + want].fill(0);
                copied += want;
                from += want as u64;
            }
        }
        Ok(copied)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use beak_tools::fs::MemFileSystem;

    fn reg_stat(size: u64, mtime: i64) -> FileStat {
        FileStat {
            mode: libc::S_IFREG | 0o644,
            nlink: 1,
            size,
            mtim: TimeSpec::new(mtime, 0),
            ..Default::default()
        }
    }

    #[test]
    fn blocked_size_rounds_payload_to_blocks() {
        let p = Path::lookup("/src/notes.txt").unwrap();
        let t = Path::lookup("src/notes.txt").unwrap();
        let e = TarEntry::new(p, t, reg_stat(700, 1000), None).unwrap();
        assert_eq!(e.header_size(), 512);
        assert_eq!(e.blocked_size(), 512 + 1024);
        let empty = TarEntry::new(p, t, reg_stat(0, 1000), None).unwrap();
        assert_eq!(empty.blocked_size(), 512);
    }

    #[test]
    fn long_names_add_header_blocks() {
        let long = "d/".repeat(70) + "leaf";
        let p = Path::lookup(&format!("/{}", long)).unwrap();
        let t = Path::lookup(&long).unwrap();
        let e = TarEntry::new(p, t, reg_stat(10, 1000), None).unwrap();
        // one L block, one payload block, one main header
        assert_eq!(e.header_size(), 3 * 512);
    }

    #[test]
    fn copy_serves_header_payload_and_padding() {
        let fs = MemFileSystem::new();
        let p = Path::lookup("/src/data.bin").unwrap();
        let data: Vec<u8> = (0..700u32).map(|i| (i % 251) as u8).collect();
        fs.add_file(p, data.clone(), TimeSpec::new(1234, 0));
        let stat = fs.stat(p).unwrap();
        let t = Path::lookup("src/data.bin").unwrap();
        let e = TarEntry::new(p, t, stat, None).unwrap();

        let mut whole = vec![0u8; e.blocked_size() as usize];
        let n = e.copy(&mut whole, 0, &fs).unwrap();
        assert_eq!(n, whole.len());

        // header block parses back
        let mut block = [0u8; 512];
        block.copy_from_slice(&whole[..512]);
        let h = TarHeader::from_bytes(&block);
        assert!(h.verify_checksum());
        assert_eq!(h.path(), "src/data.bin");
        assert_eq!(h.size(), 700);

        assert_eq!(&whole[512..512 + 700], &data[..]);
        assert!(whole[512 + 700..].iter().all(|&b| b == 0));

        // a ranged read straddling header and payload
        let mut ranged = vec![0u8; 100];
        let n = e.copy(&mut ranged, 462, &fs).unwrap();
        assert_eq!(n, 100);
        assert_eq!(&ranged[..], &whole[462..562]);

        // past the end
        let mut past = [0u8; 8];
        assert_eq!(e.copy(&mut past, e.blocked_size(), &fs).unwrap(), 0);
    }

    #[test]
    fn hash_is_cached_and_covers_header_and_payload() {
        let fs = MemFileSystem::new();
        let p = Path::lookup("/src/hashme").unwrap();
        fs.add_file(p, b"abcdef".to_vec(), TimeSpec::new(99, 0));
        let stat = fs.stat(p).unwrap();
        let t = Path::lookup("src/hashme").unwrap();
        let e = TarEntry::new(p, t, stat, None).unwrap();

        let first = *e.hash(&fs).unwrap();
        let again = *e.hash(&fs).unwrap();
        assert_eq!(first, again);

        // identical input produces an identical digest
        let e2 = TarEntry::new(p, t, stat, None).unwrap();
        assert_eq!(first, *e2.hash(&fs).unwrap());

        // different payload, different digest
        let q = Path::lookup("/src/hashme2").unwrap();
        fs.add_file(q, b"abcdeg".to_vec(), TimeSpec::new(99, 0));
        let e3 = TarEntry::new(q, Path::lookup("src/hashme2").unwrap(), fs.stat(q).unwrap(), None)
            .unwrap();
        assert_ne!(first, *e3.hash(&fs).unwrap());
    }

    #[test]
    fn directory_entry_has_no_payload_and_trailing_slash() {
        let p = Path::lookup("/src/sub").unwrap();
        let stat = FileStat {
            mode: libc::S_IFDIR | 0o755,
            nlink: 1,
            mtim: TimeSpec::new(500, 0),
            ..Default::default()
        };
        let e = TarEntry::new(p, Path::lookup("src/sub").unwrap(), stat, None).unwrap();
        assert_eq!(e.blocked_size(), 512);
        let mut block = [0u8; 512];
        let fs = MemFileSystem::new();
        e.copy(&mut block, 0, &fs).unwrap();
        let h = TarHeader::from_bytes(&block);
        assert_eq!(h.type_flag(), DIRTYPE);
        assert_eq!(h.path(), "src/sub/");
    }

    #[test]
    fn symlink_entry_records_target() {
        let p = Path::lookup("/src/link").unwrap();
        let stat = FileStat {
            mode: libc::S_IFLNK | 0o777,
            nlink: 1,
            size: 6,
            mtim: TimeSpec::new(500, 0),
            ..Default::default()
        };
        let e = TarEntry::new(
            p,
            Path::lookup("src/link").unwrap(),
            stat,
            Some("target".to_string()),
        )
        .unwrap();
        assert_eq!(e.blocked_size(), 512);
        let mut block = [0u8; 512];
        let fs = MemFileSystem::new();
        e.copy(&mut block, 0, &fs).unwrap();
        let h = TarHeader::from_bytes(&block);
        assert_eq!(h.type_flag(), SYMTYPE);
        assert_eq!(h.link_name(), "target");
        assert_eq!(h.size(), 0);
    }
}
