use beak_datastore::tar_entry::TarEntry;
use beak_datastore::tar_file::{TarFile, TarHeaderStyle};
use beak_datastore::tar_header::{TarHeader, GNU_MULTIVOL};
use beak_datastore::TarFileType;
use beak_tools::fs::{FileSystem, MemFileSystem, TimeSpec};
use beak_tools::path::Path;

/// A two-part archive around one large file.
fn two_part_archive() -> (MemFileSystem, TarFile) {
    let fs = MemFileSystem::new();
    let dir = Path::lookup("/data").unwrap();
    fs.add_dir(dir, TimeSpec::new(100, 0));
    let file = dir.append("blob.bin").unwrap();
    let payload: Vec<u8> = (0..6000usize).map(|i| (i * 17 % 255) as u8).collect();
    fs.add_file(file, payload, TimeSpec::new(7777, 0));

    let stat = fs.stat(file).unwrap();
    let entry = TarEntry::new(file, file.subpath(0).unwrap(), stat, None).unwrap();
    let mut tar = TarFile::new(TarFileType::RegFile);
    tar.add_entry_last(entry);
    // blocked size 512 + 6144 = 6656; split at 4096 gives two parts
    tar.fix_size(4096, TarHeaderStyle::Full);
    (fs, tar)
}

#[test]
fn reading_across_a_split_boundary() {
    let (fs, tar) = two_part_archive();
    assert_eq!(tar.num_parts(), 2);
    let entry_header_size = tar.entries()[0].header_size();

    // the second part leads with a continuation header whose recorded
    // file offset is exactly the payload already served by part 0
    let mut block = [0u8; 512];
    let n = tar.copy(&mut block, 0, &fs, 1).unwrap();
    assert_eq!(n, 512);
    let header = TarHeader::from_bytes(&block);
    assert!(header.verify_checksum());
    assert_eq!(header.type_flag(), GNU_MULTIVOL);
    assert_eq!(
        header.multivol_offset(),
        tar.part_size() - entry_header_size
    );
    assert_eq!(header.path(), "data/blob.bin");

    // behind the continuation header the part replays the logical
    // stream from where part 0 stopped
    let mut logical = vec![0u8; tar.total_size() as usize];
    let n = tar.copy(&mut logical, 0, &fs, 0).unwrap();
    assert_eq!(n as u64, tar.total_size());
    let mut through_part = [0u8; 512];
    let n = tar.copy(&mut through_part, 512, &fs, 1).unwrap();
    assert_eq!(n, 512);
    let origin = tar.part_size() as usize;
    assert_eq!(&through_part[..], &logical[origin..origin + 512]);
}

#[test]
fn reads_past_the_end_of_a_part_return_zero() {
    let (fs, tar) = two_part_archive();
    let mut buf = [0u8; 64];
    let last = tar.num_parts() - 1;
    assert_eq!(tar.copy(&mut buf, tar.size(last), &fs, last).unwrap(), 0);
    assert_eq!(
        tar.copy(&mut buf, tar.size(last) + 1000, &fs, last).unwrap(),
        0
    );
}

#[test]
fn parts_stitch_back_into_the_logical_stream() {
    let (fs, tar) = two_part_archive();

    let mut straight = vec![0u8; tar.total_size() as usize];
    let n = tar.copy(&mut straight, 0, &fs, 0).unwrap();
    assert_eq!(n as u64, tar.total_size());

    // read every part in odd-sized chunks, drop the continuation
    // headers, and the concatenation is the logical stream again
    let mut stitched = Vec::new();
    for part in 0..tar.num_parts() {
        let part_size = tar.size(part);
        let skip = if part == 0 { 0 } else { tar.header_size() };
        let mut offset = skip;
        for chunk in [1usize, 511, 512, 513, 37, 4096].iter().cycle() {
            if offset >= part_size {
                break;
            }
            let want = std::cmp::min(*chunk as u64, part_size - offset) as usize;
            let mut buf = vec![0u8; want];
            let n = tar.copy(&mut buf, offset, &fs, part).unwrap();
            assert_eq!(n, want);
            stitched.extend_from_slice(&buf);
            offset += n as u64;
        }
    }
    assert_eq!(stitched, straight);
}
