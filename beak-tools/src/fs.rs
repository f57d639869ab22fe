//! The file system capability.
//!
//! All operating system file access goes through the [`FileSystem`]
//! trait so the archive layer can be driven against the local disk
//! ([`StdFileSystem`]) or against a synthetic tree ([`MemFileSystem`]).

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::os::unix::fs::{FileExt, MetadataExt, PermissionsExt};
use std::os::unix::io::FromRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, format_err, Error};

use crate::path::Path;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: i64,
}

impl TimeSpec {
    pub fn new(sec: i64, nsec: i64) -> TimeSpec {
        TimeSpec { sec, nsec }
    }

    pub fn is_in_the_future(&self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.sec > now
    }
}

/// File metadata as recorded in archives: type and permission bits,
/// ownership, device numbers, size and the three timestamps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileStat {
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub atim: TimeSpec,
    pub mtim: TimeSpec,
    pub ctim: TimeSpec,
}

impl FileStat {
    pub fn from_metadata(md: &std::fs::Metadata) -> FileStat {
        FileStat {
            mode: md.mode(),
            nlink: md.nlink(),
            uid: md.uid(),
            gid: md.gid(),
            rdev: md.rdev(),
            size: md.size(),
            atim: TimeSpec::new(md.atime(), md.atime_nsec()),
            mtim: TimeSpec::new(md.mtime(), md.mtime_nsec()),
            ctim: TimeSpec::new(md.ctime(), md.ctime_nsec()),
        }
    }

    fn is_type(&self, ifmt: u32) -> bool {
        self.mode & libc::S_IFMT == ifmt
    }

    pub fn is_regular_file(&self) -> bool {
        self.is_type(libc::S_IFREG)
    }

    pub fn is_directory(&self) -> bool {
        self.is_type(libc::S_IFDIR)
    }

    pub fn is_symbolic_link(&self) -> bool {
        self.is_type(libc::S_IFLNK)
    }

    pub fn is_character_device(&self) -> bool {
        self.is_type(libc::S_IFCHR)
    }

    pub fn is_block_device(&self) -> bool {
        self.is_type(libc::S_IFBLK)
    }

    pub fn is_fifo(&self) -> bool {
        self.is_type(libc::S_IFIFO)
    }

    pub fn is_socket(&self) -> bool {
        self.is_type(libc::S_IFSOCK)
    }

    /// Permission bits including set-uid, set-gid and sticky.
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// Pull-based byte producer driven by [`FileSystem::create_file`]. It is
/// called with increasing offsets until it produces zero bytes.
pub type Producer<'a> = dyn FnMut(u64, &mut [u8]) -> Result<usize, Error> + 'a;

pub trait FileSystem: Send + Sync {
    /// Directory entries as full paths, sorted by name.
    fn readdir(&self, p: Path) -> Result<Vec<Path>, Error>;
    /// Metadata without following symlinks.
    fn stat(&self, p: Path) -> Result<FileStat, Error>;
    /// Read up to `buf.len()` bytes at `offset`.
    fn pread(&self, p: Path, buf: &mut [u8], offset: u64) -> Result<usize, Error>;
    fn readlink(&self, p: Path) -> Result<String, Error>;
    fn mk_temp_file(&self, prefix: &str, contents: &[u8]) -> Result<Path, Error>;
    fn mk_temp_dir(&self, prefix: &str) -> Result<Path, Error>;
    fn mk_dir(&self, parent: Path, name: &str) -> Result<Path, Error>;
    /// Create `p` and fill it by driving `producer` to completion.
    /// Returns the number of bytes written.
    fn create_file(&self, p: Path, stat: &FileStat, producer: &mut Producer) -> Result<u64, Error>;
    fn delete_file(&self, p: Path) -> Result<(), Error>;
}

/// The local file system.
pub struct StdFileSystem;

const COPY_BUF_SIZE: usize = 128 * 1024;

impl FileSystem for StdFileSystem {
    fn readdir(&self, p: Path) -> Result<Vec<Path>, Error> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(p.as_str())? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name
                .to_str()
                .ok_or_else(|| format_err!("non utf8 file name below {:?}", p.as_str()))?;
            paths.push(p.append(name)?);
        }
        paths.sort_by_key(|p| p.as_str());
        Ok(paths)
    }

    fn stat(&self, p: Path) -> Result<FileStat, Error> {
        let md = std::fs::symlink_metadata(p.as_str())?;
        Ok(FileStat::from_metadata(&md))
    }

    fn pread(&self, p: Path, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        let file = File::open(p.as_str())?;
        Ok(file.read_at(buf, offset)?)
    }

    fn readlink(&self, p: Path) -> Result<String, Error> {
        let target = std::fs::read_link(p.as_str())?;
        match target.to_str() {
            Some(s) => Ok(s.to_string()),
            None => bail!("non utf8 symlink target at {:?}", p.as_str()),
        }
    }

    fn mk_temp_file(&self, prefix: &str, contents: &[u8]) -> Result<Path, Error> {
        let template = std::env::temp_dir().join(format!("{}XXXXXX", prefix));
        let (fd, tmp_path) = nix::unistd::mkstemp(&template)?;
        let mut file = unsafe { File::from_raw_fd(fd) };
        file.write_all(contents)?;
        let s = tmp_path
            .to_str()
            .ok_or_else(|| format_err!("non utf8 temp path {:?}", tmp_path))?;
        Ok(Path::lookup(s)?)
    }

    fn mk_temp_dir(&self, prefix: &str) -> Result<Path, Error> {
        let template = std::env::temp_dir().join(format!("{}XXXXXX", prefix));
        let dir = nix::unistd::mkdtemp(&template)?;
        let s = dir
            .to_str()
            .ok_or_else(|| format_err!("non utf8 temp path {:?}", dir))?;
        Ok(Path::lookup(s)?)
    }

    fn mk_dir(&self, parent: Path, name: &str) -> Result<Path, Error> {
        let p = parent.append(name)?;
        std::fs::create_dir(p.as_str())?;
        Ok(p)
    }

    fn create_file(&self, p: Path, stat: &FileStat, producer: &mut Producer) -> Result<u64, Error> {
        let mut file = File::create(p.as_str())?;
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut offset = 0u64;
        loop {
            let n = producer(offset, &mut buf)?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
            offset += n as u64;
        }
        file.set_permissions(std::fs::Permissions::from_mode(stat.permissions()))?;
        Ok(offset)
    }

    fn delete_file(&self, p: Path) -> Result<(), Error> {
        std::fs::remove_file(p.as_str())?;
        Ok(())
    }
}

#[derive(Clone, Default)]
struct MemNode {
    stat: FileStat,
    data: Vec<u8>,
    link: Option<String>,
}

/// An in-memory tree used by test scaffolds. Directories must be added
/// before their contents.
#[derive(Default)]
pub struct MemFileSystem {
    nodes: Mutex<HashMap<Path, MemNode>>,
    tmp_counter: AtomicUsize,
}

impl MemFileSystem {
    pub fn new() -> MemFileSystem {
        let fs = MemFileSystem::default();
        let root_stat = FileStat {
            mode: libc::S_IFDIR | 0o755,
            nlink: 1,
            ..Default::default()
        };
        fs.nodes.lock().unwrap().insert(
            Path::root(),
            MemNode {
                stat: root_stat,
                ..Default::default()
            },
        );
        fs
    }

    pub fn add_dir(&self, p: Path, mtim: TimeSpec) {
        let stat = FileStat {
            mode: libc::S_IFDIR | 0o755,
            nlink: 1,
            mtim,
            ..Default::default()
        };
        self.nodes.lock().unwrap().insert(
            p,
            MemNode {
                stat,
                ..Default::default()
            },
        );
    }

    pub fn add_file(&self, p: Path, data: Vec<u8>, mtim: TimeSpec) {
        let stat = FileStat {
            mode: libc::S_IFREG | 0o644,
            nlink: 1,
            size: data.len() as u64,
            mtim,
            ..Default::default()
        };
        self.nodes.lock().unwrap().insert(
            p,
            MemNode {
                stat,
                data,
                link: None,
            },
        );
    }

    pub fn add_symlink(&self, p: Path, target: &str, mtim: TimeSpec) {
        let stat = FileStat {
            mode: libc::S_IFLNK | 0o777,
            nlink: 1,
            size: target.len() as u64,
            mtim,
            ..Default::default()
        };
        self.nodes.lock().unwrap().insert(
            p,
            MemNode {
                stat,
                data: Vec::new(),
                link: Some(target.to_string()),
            },
        );
    }

    pub fn file_data(&self, p: Path) -> Option<Vec<u8>> {
        self.nodes.lock().unwrap().get(&p).map(|n| n.data.clone())
    }
}

impl FileSystem for MemFileSystem {
    fn readdir(&self, p: Path) -> Result<Vec<Path>, Error> {
        let nodes = self.nodes.lock().unwrap();
        if !nodes.contains_key(&p) {
            bail!("no such directory {:?}", p.as_str());
        }
        let mut children: Vec<Path> = nodes
            .keys()
            .filter(|c| c.parent() == Some(p))
            .copied()
            .collect();
        children.sort_by_key(|c| c.as_str());
        Ok(children)
    }

    fn stat(&self, p: Path) -> Result<FileStat, Error> {
        match self.nodes.lock().unwrap().get(&p) {
            Some(node) => Ok(node.stat),
            None => bail!("no such file {:?}", p.as_str()),
        }
    }

    fn pread(&self, p: Path, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        let nodes = self.nodes.lock().unwrap();
        let node = match nodes.get(&p) {
            Some(node) => node,
            None => bail!("no such file {:?}", p.as_str()),
        };
        let len = node.data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let n = std::cmp::min(buf.len() as u64, len - offset) as usize;
        let from = offset as usize;
        buf[..n].copy_from_slice(&node.data[from..from + n]);
        Ok(n)
    }

    fn readlink(&self, p: Path) -> Result<String, Error> {
        match self.nodes.lock().unwrap().get(&p).and_then(|n| n.link.clone()) {
            Some(target) => Ok(target),
            None => bail!("not a symlink {:?}", p.as_str()),
        }
    }

    fn mk_temp_file(&self, prefix: &str, contents: &[u8]) -> Result<Path, Error> {
        let nr = self.tmp_counter.fetch_add(1, Ordering::SeqCst);
        let p = Path::lookup(&format!("/tmp/{}{:06}", prefix, nr))?;
        self.add_file(p, contents.to_vec(), TimeSpec::default());
        Ok(p)
    }

    fn mk_temp_dir(&self, prefix: &str) -> Result<Path, Error> {
        let nr = self.tmp_counter.fetch_add(1, Ordering::SeqCst);
        let p = Path::lookup(&format!("/tmp/{}{:06}", prefix, nr))?;
        self.add_dir(p, TimeSpec::default());
        Ok(p)
    }

    fn mk_dir(&self, parent: Path, name: &str) -> Result<Path, Error> {
        let p = parent.append(name)?;
        self.add_dir(p, TimeSpec::default());
        Ok(p)
    }

    fn create_file(&self, p: Path, stat: &FileStat, producer: &mut Producer) -> Result<u64, Error> {
        let mut data = Vec::new();
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut offset = 0u64;
        loop {
            let n = producer(offset, &mut buf)?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            offset += n as u64;
        }
        let mut stored = *stat;
        stored.size = offset;
        self.nodes.lock().unwrap().insert(
            p,
            MemNode {
                stat: stored,
                data,
                link: None,
            },
        );
        Ok(offset)
    }

    fn delete_file(&self, p: Path) -> Result<(), Error> {
        match self.nodes.lock().unwrap().remove(&p) {
            Some(_) => Ok(()),
            None => bail!("no such file {:?}", p.as_str()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mem_fs_round_trip() {
        let fs = MemFileSystem::new();
        let dir = Path::lookup("/data").unwrap();
        fs.add_dir(dir, TimeSpec::new(1000, 0));
        let file = Path::lookup("/data/hello.txt").unwrap();
        fs.add_file(file, b"hello world".to_vec(), TimeSpec::new(1001, 5));

        let listed = fs.readdir(dir).unwrap();
        assert_eq!(listed, vec![file]);

        let st = fs.stat(file).unwrap();
        assert!(st.is_regular_file());
        assert_eq!(st.size, 11);
        assert_eq!(st.mtim, TimeSpec::new(1001, 5));

        let mut buf = [0u8; 5];
        let n = fs.pread(file, &mut buf, 6).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"world");
        assert_eq!(fs.pread(file, &mut buf, 11).unwrap(), 0);
    }

    #[test]
    fn create_file_drives_producer_to_completion() {
        let fs = MemFileSystem::new();
        let p = Path::lookup("/out.bin").unwrap();
        let payload = vec![7u8; 300_000];
        let source = payload.clone();
        let mut producer = move |offset: u64, buf: &mut [u8]| -> Result<usize, Error> {
            let from = offset as usize;
            if from >= source.len() {
                return Ok(0);
            }
            let n = std::cmp::min(buf.len(), source.len() - from);
            buf[..n].copy_from_slice(&source[from..from + n]);
            Ok(n)
        };
        let stat = FileStat {
            mode: libc::S_IFREG | 0o644,
            ..Default::default()
        };
        let written = fs.create_file(p, &stat, &mut producer).unwrap();
        assert_eq!(written, 300_000);
        assert_eq!(fs.file_data(p).unwrap(), payload);
    }

    #[test]
    fn temp_files_are_created_and_deleted() {
        let fs = MemFileSystem::new();
        let tmp = fs.mk_temp_file("beak_sending_", b"a\nb\n").unwrap();
        assert_eq!(fs.file_data(tmp).unwrap(), b"a\nb\n".to_vec());
        fs.delete_file(tmp).unwrap();
        assert!(fs.stat(tmp).is_err());
    }
}
