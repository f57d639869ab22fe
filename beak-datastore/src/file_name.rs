//! The archive filename grammar.
//!
//! Archive names are self describing: the archive kind, a format
//! version, the archive mtime, the content address, the part numbering
//! and the byte size are all encoded in the file name. Two versions are
//! in the wild:
//!
//! ```text
//! s01_001501080787.579054757_1119232_<sha256 hex>_0.tar
//! s02_1501080787.579054757_<sha256 hex>_07-f_1119232.tar
//! ```
//!
//! Version 1 predates archive splitting and always emits part zero.
//! Version 2 carries `partnr-numparts` in hex. Parsing is strict; any
//! field holding a character outside its class rejects the whole name.

use std::fmt;

use beak_tools::path::{Path, PathError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TarFileType {
    /// One large source file stored alone, possibly split.
    RegFile,
    /// Many small files of one directory packed together.
    SmallFilesTar,
    /// Medium sized files of one directory.
    MediumFilesTar,
    /// Directory metadata.
    DirTar,
    /// The snapshot catalogue.
    IndexFile,
}

impl TarFileType {
    pub fn type_char(self) -> char {
        match self {
            TarFileType::RegFile => 'l',
            TarFileType::SmallFilesTar => 's',
            TarFileType::MediumFilesTar => 'm',
            TarFileType::DirTar => 'y',
            TarFileType::IndexFile => 'z',
        }
    }

    pub fn from_char(c: char) -> Option<TarFileType> {
        Some(match c {
            'l' => TarFileType::RegFile,
            's' => TarFileType::SmallFilesTar,
            'm' => TarFileType::MediumFilesTar,
            'y' => TarFileType::DirTar,
            'z' => TarFileType::IndexFile,
            _ => return None,
        })
    }

    pub fn suffix(self) -> &'static str {
        match self {
            TarFileType::IndexFile => "gz",
            _ => "tar",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum NameError {
    #[error("bad archive name {0:?}")]
    BadArchiveName(String),
    #[error("unsupported archive name version {0}")]
    UnsupportedVersion(u32),
}

/// A decoded archive identity. Round-trips through its string form
/// byte-exactly.
#[derive(Clone, Debug)]
pub struct TarFileName {
    pub file_type: TarFileType,
    pub version: u32,
    pub sec: i64,
    pub nsec: i64,
    pub size: u64,
    /// Lowercase hex SHA-256.
    pub header_hash: String,
    pub part_nr: u64,
    pub num_parts: u64,
    /// The interned form of the parsed input; `None` on constructed
    /// names.
    pub path: Option<Path>,
}

impl PartialEq for TarFileName {
    fn eq(&self, other: &TarFileName) -> bool {
        self.file_type == other.file_type
            && self.version == other.version
            && self.sec == other.sec
            && self.nsec == other.nsec
            && self.size == other.size
            && self.header_hash == other.header_hash
            && self.part_nr == other.part_nr
            && self.num_parts == other.num_parts
    }
}

impl Eq for TarFileName {}

fn decimal(s: &str, whole: &str) -> Result<u64, NameError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(NameError::BadArchiveName(whole.to_string()));
    }
    s.parse()
        .map_err(|_| NameError::BadArchiveName(whole.to_string()))
}

fn hexadecimal(s: &str, whole: &str) -> Result<u64, NameError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(NameError::BadArchiveName(whole.to_string()));
    }
    u64::from_str_radix(s, 16).map_err(|_| NameError::BadArchiveName(whole.to_string()))
}

fn hex_field<'a>(s: &'a str, whole: &str) -> Result<&'a str, NameError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(NameError::BadArchiveName(whole.to_string()));
    }
    Ok(s)
}

/// Position of `needle` in `s` at or after `from`.
fn find_from(s: &str, from: usize, needle: char) -> Option<usize> {
    s[from..].find(needle).map(|i| i + from)
}

impl TarFileName {
    /// Parse a file name, with or without a directory prefix.
    pub fn parse(name: &str) -> Result<TarFileName, NameError> {
        Ok(TarFileName::parse_with_dir(name)?.0)
    }

    /// Parse a file name, also returning the directory prefix (empty
    /// when the input is a bare name).
    pub fn parse_with_dir(name: &str) -> Result<(TarFileName, &str), NameError> {
        let bad = || NameError::BadArchiveName(name.to_string());

        let base_start = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let dir = &name[..base_start];
        let base = &name[base_start..];

        let type_char = base.chars().next().ok_or_else(bad)?;
        let file_type = TarFileType::from_char(type_char).ok_or_else(bad)?;

        let p1 = base.find('_').ok_or_else(bad)?;
        let version = decimal(&base[1..p1], name)? as u32;

        let mut parsed = match version {
            1 => Self::parse_version1(base, p1, file_type.suffix(), name)?,
            2 => Self::parse_version2(base, p1, file_type.suffix(), name)?,
            v => return Err(NameError::UnsupportedVersion(v)),
        };
        parsed.file_type = file_type;
        parsed.version = version;
        parsed.path = Path::lookup(name).ok();
        Ok((parsed, dir))
    }

    // (l)01_(001501080787).(579054757)_(1119232)_(hash)_(0).(tar)
    fn parse_version1(
        base: &str,
        p1: usize,
        suffix: &str,
        whole: &str,
    ) -> Result<TarFileName, NameError> {
        let bad = || NameError::BadArchiveName(whole.to_string());
        let p2 = find_from(base, p1 + 1, '.').ok_or_else(bad)?;
        let p3 = find_from(base, p2 + 1, '_').ok_or_else(bad)?;
        let p4 = find_from(base, p3 + 1, '_').ok_or_else(bad)?;
        let p5 = find_from(base, p4 + 1, '_').ok_or_else(bad)?;
        let p6 = find_from(base, p5 + 1, '.').ok_or_else(bad)?;
        if &base[p6 + 1..] != suffix {
            return Err(bad());
        }

        Ok(TarFileName {
            file_type: TarFileType::RegFile, // overwritten by the caller
            version: 1,
            sec: decimal(&base[p1 + 1..p2], whole)? as i64,
            nsec: decimal(&base[p2 + 1..p3], whole)? as i64,
            size: decimal(&base[p3 + 1..p4], whole)?,
            header_hash: hex_field(&base[p4 + 1..p5], whole)?.to_string(),
            part_nr: hexadecimal(&base[p5 + 1..p6], whole)?,
            num_parts: 1,
            path: None,
        })
    }

    // (l)02_(1501080787).(579054757)_(hash)_(07-f)_(1119232).(tar)
    fn parse_version2(
        base: &str,
        p1: usize,
        suffix: &str,
        whole: &str,
    ) -> Result<TarFileName, NameError> {
        let bad = || NameError::BadArchiveName(whole.to_string());
        let p2 = find_from(base, p1 + 1, '.').ok_or_else(bad)?;
        let p3 = find_from(base, p2 + 1, '_').ok_or_else(bad)?;
        let p4 = find_from(base, p3 + 1, '_').ok_or_else(bad)?;
        let p5 = find_from(base, p4 + 1, '-').ok_or_else(bad)?;
        let p6 = find_from(base, p5 + 1, '_').ok_or_else(bad)?;
        let p7 = find_from(base, p6 + 1, '.').ok_or_else(bad)?;
        if &base[p7 + 1..] != suffix {
            return Err(bad());
        }

        Ok(TarFileName {
            file_type: TarFileType::RegFile, // overwritten by the caller
            version: 2,
            sec: decimal(&base[p1 + 1..p2], whole)? as i64,
            nsec: decimal(&base[p2 + 1..p3], whole)? as i64,
            header_hash: hex_field(&base[p3 + 1..p4], whole)?.to_string(),
            part_nr: hexadecimal(&base[p4 + 1..p5], whole)?,
            num_parts: hexadecimal(&base[p5 + 1..p6], whole)?,
            size: decimal(&base[p6 + 1..p7], whole)?,
            path: None,
        })
    }

    /// Whether a path names a snapshot catalogue file.
    pub fn is_index_file(p: Path) -> bool {
        let name = p.name().as_str();
        name.len() >= 20 && name.starts_with("z01_") && name.ends_with(".gz")
    }

    pub fn to_string_with_dir(&self, dir: Option<Path>) -> String {
        match dir {
            Some(dir) if !dir.is_root() => format!("{}/{}", dir.as_str(), self),
            _ => self.to_string(),
        }
    }

    pub fn as_path_with_dir(&self, dir: Option<Path>) -> Result<Path, PathError> {
        Path::lookup(&self.to_string_with_dir(dir))
    }
}

impl fmt::Display for TarFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = self.file_type.type_char();
        let suffix = self.file_type.suffix();
        match self.version {
            1 => write!(
                f,
                // version 1 cannot express parts, emit part zero
                "{}01_{:012}.{:09}_{}_{}_0.{}",
                c, self.sec, self.nsec, self.size, self.header_hash, suffix
            ),
            2 => {
                let num = format!("{:x}", self.num_parts);
                let width = std::cmp::max(2, num.len());
                write!(
                    f,
                    "{}02_{}.{:09}_{}_{:0width$x}-{}_{}.{}",
                    c,
                    self.sec,
                    self.nsec,
                    self.header_hash,
                    self.part_nr,
                    num,
                    self.size,
                    suffix,
                    width = width
                )
            }
            v => panic!("unsupported archive name version {}", v),
        }
    }
}
