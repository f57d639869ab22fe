//! Encoder/decoder for single 512-byte tar header blocks.
//!
//! The format is GNU ustar: the usual regular/directory/link blocks plus
//! the GNU extensions used here, long name (`L`), long link name (`K`)
//! and multi-volume continuation (`M`). An `M` block records the path of
//! the entry being continued and the byte offset within the original
//! file at which the part resumes; its size field holds the bytes that
//! remain from that offset.

pub const BLOCK_SIZE: usize = 512;

/// Largest path accepted into the name field of a single block.
pub const NAME_FIELD_SIZE: usize = 100;

/// Cap on the payload of a long-name block.
pub const LONG_NAME_MAX: usize = 4096;

const LONG_NAME_MARKER: &[u8] = b"././@LongLink";

pub const REGTYPE: u8 = b'0';
pub const LNKTYPE: u8 = b'1';
pub const SYMTYPE: u8 = b'2';
pub const CHRTYPE: u8 = b'3';
pub const BLKTYPE: u8 = b'4';
pub const DIRTYPE: u8 = b'5';
pub const FIFOTYPE: u8 = b'6';
pub const GNU_LONGLINK: u8 = b'K';
pub const GNU_LONGNAME: u8 = b'L';
pub const GNU_MULTIVOL: u8 = b'M';

// field offsets, GNU layout
const NAME: usize = 0;
const MODE: usize = 100;
const UID: usize = 108;
const GID: usize = 116;
const SIZE: usize = 124;
const MTIME: usize = 136;
const CHKSUM: usize = 148;
const TYPEFLAG: usize = 156;
const LINKNAME: usize = 157;
const MAGIC: usize = 257;
const DEVMAJOR: usize = 329;
const DEVMINOR: usize = 337;
const ATIME: usize = 345;
const CTIME: usize = 357;
const OFFSET: usize = 369;

#[derive(thiserror::Error, Debug)]
pub enum HeaderError {
    #[error("path {path:?} does not fit in {limit} header bytes")]
    HeaderTooLong { path: String, limit: usize },
}

/// One 512-byte header block.
pub struct TarHeader {
    buf: [u8; BLOCK_SIZE],
}

impl Default for TarHeader {
    fn default() -> Self {
        TarHeader::new()
    }
}

impl TarHeader {
    pub fn new() -> TarHeader {
        let mut h = TarHeader {
            buf: [0u8; BLOCK_SIZE],
        };
        h.buf[MAGIC..MAGIC + 8].copy_from_slice(b"ustar  \0");
        h.set_type_flag(REGTYPE);
        h
    }

    pub fn as_bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.buf
    }

    fn set_octal(&mut self, start: usize, field_len: usize, value: u64) {
        let digits = field_len - 1;
        let s = format!("{:0width$o}", value, width = digits);
        let bytes = s.as_bytes();
        let from = bytes.len().saturating_sub(digits);
        self.buf[start..start + digits].copy_from_slice(&bytes[from..]);
        self.buf[start + digits] = 0;
    }

    fn octal_field(&self, start: usize, field_len: usize) -> u64 {
        let mut v = 0u64;
        for &b in &self.buf[start..start + field_len] {
            match b {
                b'0'..=b'7' => v = v * 8 + (b - b'0') as u64,
                _ => break,
            }
        }
        v
    }

    fn set_string(&mut self, start: usize, field_len: usize, s: &str) {
        let bytes = s.as_bytes();
        let n = std::cmp::min(bytes.len(), field_len);
        self.buf[start..start + n].copy_from_slice(&bytes[..n]);
    }

    fn string_field(&self, start: usize, field_len: usize) -> &str {
        let field = &self.buf[start..start + field_len];
        let end = field.iter().position(|&b| b == 0).unwrap_or(field_len);
        std::str::from_utf8(&field[..end]).unwrap_or("")
    }

    /// Write the name field. Longer paths are truncated here and carried
    /// in full by a preceding long-name block.
    pub fn set_path(&mut self, path: &str) {
        self.set_string(NAME, NAME_FIELD_SIZE, path);
    }

    pub fn path(&self) -> &str {
        self.string_field(NAME, NAME_FIELD_SIZE)
    }

    pub fn set_link_name(&mut self, target: &str) {
        self.set_string(LINKNAME, NAME_FIELD_SIZE, target);
    }

    pub fn link_name(&self) -> &str {
        self.string_field(LINKNAME, NAME_FIELD_SIZE)
    }

    pub fn set_mode(&mut self, mode: u32) {
        self.set_octal(MODE, 8, (mode & 0o7777) as u64);
    }

    pub fn mode(&self) -> u32 {
        self.octal_field(MODE, 8) as u32
    }

    pub fn set_uid(&mut self, uid: u32) {
        self.set_octal(UID, 8, uid as u64);
    }

    pub fn set_gid(&mut self, gid: u32) {
        self.set_octal(GID, 8, gid as u64);
    }

    pub fn set_size(&mut self, size: u64) {
        if size <= 0o77777777777 {
            self.set_octal(SIZE, 12, size);
        } else {
            // base-256 for sizes that octal digits cannot hold
            self.buf[SIZE] = 0x80;
            for b in &mut self.buf[SIZE + 1..SIZE + 4] {
                *b = 0;
            }
            self.buf[SIZE + 4..SIZE + 12].copy_from_slice(&size.to_be_bytes());
        }
    }

    pub fn size(&self) -> u64 {
        if self.buf[SIZE] & 0x80 != 0 {
            let mut be = [0u8; 8];
            be.copy_from_slice(&self.buf[SIZE + 4..SIZE + 12]);
            u64::from_be_bytes(be)
        } else {
            self.octal_field(SIZE, 12)
        }
    }

    pub fn set_mtime(&mut self, sec: i64) {
        self.set_octal(MTIME, 12, sec.max(0) as u64);
    }

    pub fn mtime(&self) -> i64 {
        self.octal_field(MTIME, 12) as i64
    }

    pub fn set_atime(&mut self, sec: i64) {
        self.set_octal(ATIME, 12, sec.max(0) as u64);
    }

    pub fn set_ctime(&mut self, sec: i64) {
        self.set_octal(CTIME, 12, sec.max(0) as u64);
    }

    pub fn set_dev(&mut self, major: u64, minor: u64) {
        self.set_octal(DEVMAJOR, 8, major);
        self.set_octal(DEVMINOR, 8, minor);
    }

    pub fn set_type_flag(&mut self, flag: u8) {
        self.buf[TYPEFLAG] = flag;
    }

    pub fn type_flag(&self) -> u8 {
        self.buf[TYPEFLAG]
    }

    /// Turn this block into a GNU long-name block announcing `len` path
    /// bytes (the NUL included) in the payload blocks that follow.
    pub fn set_long_path_type(&mut self, path: &str) -> Result<(), HeaderError> {
        if path.len() + 1 > LONG_NAME_MAX {
            return Err(HeaderError::HeaderTooLong {
                path: path.to_string(),
                limit: LONG_NAME_MAX,
            });
        }
        self.buf[NAME..NAME + LONG_NAME_MARKER.len()].copy_from_slice(LONG_NAME_MARKER);
        self.set_type_flag(GNU_LONGNAME);
        self.set_size(path.len() as u64 + 1);
        Ok(())
    }

    /// Same as [`set_long_path_type`](Self::set_long_path_type) for a
    /// symlink target (`K`).
    pub fn set_long_link_type(&mut self, target: &str) -> Result<(), HeaderError> {
        if target.len() + 1 > LONG_NAME_MAX {
            return Err(HeaderError::HeaderTooLong {
                path: target.to_string(),
                limit: LONG_NAME_MAX,
            });
        }
        self.buf[NAME..NAME + LONG_NAME_MARKER.len()].copy_from_slice(LONG_NAME_MARKER);
        self.set_type_flag(GNU_LONGLINK);
        self.set_size(target.len() as u64 + 1);
        Ok(())
    }

    /// Turn this block into a multi-volume continuation block. The path
    /// has to fit the plain name field, a continuation cannot carry its
    /// own long-name stage.
    pub fn set_multivol_type(&mut self, path: &str, file_offset: u64) -> Result<(), HeaderError> {
        if path.len() >= NAME_FIELD_SIZE {
            return Err(HeaderError::HeaderTooLong {
                path: path.to_string(),
                limit: NAME_FIELD_SIZE - 1,
            });
        }
        self.set_path(path);
        self.set_type_flag(GNU_MULTIVOL);
        self.set_octal(OFFSET, 12, file_offset);
        Ok(())
    }

    pub fn multivol_offset(&self) -> u64 {
        self.octal_field(OFFSET, 12)
    }

    pub fn calculate_checksum(&mut self) {
        self.buf[CHKSUM..CHKSUM + 8].fill(b' ');
        let sum: u32 = self.buf.iter().map(|&b| b as u32).sum();
        let s = format!("{:06o}", sum);
        self.buf[CHKSUM..CHKSUM + 6].copy_from_slice(s.as_bytes());
        self.buf[CHKSUM + 6] = 0;
        self.buf[CHKSUM + 7] = b' ';
    }

    pub fn verify_checksum(&self) -> bool {
        let stored = self.octal_field(CHKSUM, 8) as u32;
        let mut sum: u32 = self.buf.iter().map(|&b| b as u32).sum();
        for &b in &self.buf[CHKSUM..CHKSUM + 8] {
            sum -= b as u32;
        }
        sum += 8 * b' ' as u32;
        sum == stored
    }

    pub fn from_bytes(block: &[u8; BLOCK_SIZE]) -> TarHeader {
        TarHeader { buf: *block }
    }
}

/// Number of 512-byte blocks a long-name stage for `path` occupies
/// before the main header; zero when the name field suffices.
pub fn num_long_path_blocks(path: &str) -> usize {
    if path.len() < NAME_FIELD_SIZE {
        return 0;
    }
    1 + (path.len() + 1).div_ceil(BLOCK_SIZE)
}

/// Blocks for a long link-target stage (`K`).
pub fn num_long_link_blocks(target: &str) -> usize {
    if target.len() < NAME_FIELD_SIZE {
        return 0;
    }
    1 + (target.len() + 1).div_ceil(BLOCK_SIZE)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn regular_header_round_trips() {
        let mut h = TarHeader::new();
        h.set_path("TEXTS/filter");
        h.set_mode(0o100644);
        h.set_uid(1000);
        h.set_gid(100);
        h.set_size(1119232);
        h.set_mtime(1501080787);
        h.calculate_checksum();

        assert_eq!(h.path(), "TEXTS/filter");
        assert_eq!(h.mode(), 0o644);
        assert_eq!(h.size(), 1119232);
        assert_eq!(h.mtime(), 1501080787);
        assert_eq!(h.type_flag(), REGTYPE);
        assert!(h.verify_checksum());

        let parsed = TarHeader::from_bytes(h.as_bytes());
        assert!(parsed.verify_checksum());
        assert_eq!(parsed.size(), 1119232);
    }

    #[test]
    fn checksum_detects_corruption() {
        let mut h = TarHeader::new();
        h.set_path("a");
        h.set_size(1);
        h.calculate_checksum();
        let mut bytes = *h.as_bytes();
        bytes[0] ^= 0xff;
        assert!(!TarHeader::from_bytes(&bytes).verify_checksum());
    }

    #[test]
    fn large_sizes_use_base256() {
        let mut h = TarHeader::new();
        let big = 9_000_000_000u64;
        h.set_size(big);
        assert_eq!(h.size(), big);
    }

    #[test]
    fn long_path_blocks() {
        let short = "a/b";
        assert_eq!(num_long_path_blocks(short), 0);
        let exactly_99 = "x".repeat(99);
        assert_eq!(num_long_path_blocks(&exactly_99), 0);
        let long = "d/".repeat(60) + "file";
        assert!(long.len() > NAME_FIELD_SIZE);
        // one L block plus one payload block while len+1 <= 512
        assert_eq!(num_long_path_blocks(&long), 2);
        let very_long = "d/".repeat(300) + "file";
        assert_eq!(num_long_path_blocks(&very_long), 3);
    }

    #[test]
    fn long_name_header_carries_length() {
        let long = "d/".repeat(60) + "file";
        let mut h = TarHeader::new();
        h.set_long_path_type(&long).unwrap();
        h.calculate_checksum();
        assert_eq!(h.type_flag(), GNU_LONGNAME);
        assert_eq!(h.size(), long.len() as u64 + 1);
        assert_eq!(h.path(), "././@LongLink");
    }

    #[test]
    fn oversized_long_name_is_rejected() {
        let monster = "m".repeat(LONG_NAME_MAX);
        let mut h = TarHeader::new();
        assert!(matches!(
            h.set_long_path_type(&monster),
            Err(HeaderError::HeaderTooLong { .. })
        ));
    }

    #[test]
    fn multivol_header_records_resume_point() {
        let mut h = TarHeader::new();
        h.set_multivol_type("big/blob.bin", 4096).unwrap();
        h.set_size(10000 - 4096);
        h.calculate_checksum();
        assert_eq!(h.type_flag(), GNU_MULTIVOL);
        assert_eq!(h.path(), "big/blob.bin");
        assert_eq!(h.multivol_offset(), 4096);
        assert_eq!(h.size(), 5904);
        assert!(h.verify_checksum());
    }

    #[test]
    fn multivol_path_must_fit_name_field() {
        let long = "p/".repeat(60);
        let mut h = TarHeader::new();
        assert!(matches!(
            h.set_multivol_type(&long, 0),
            Err(HeaderError::HeaderTooLong { .. })
        ));
    }
}
