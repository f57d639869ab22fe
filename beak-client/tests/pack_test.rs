use beak_client::pack::{pack_tree, PackOptions};
use beak_datastore::file_name::{TarFileName, TarFileType};
use beak_datastore::tar_file::TarHeaderStyle;
use beak_datastore::tar_header::TarHeader;
use beak_tools::fs::{FileStat, MemFileSystem, TimeSpec};
use beak_tools::path::Path;

fn options() -> PackOptions {
    PackOptions {
        split_size: 4096,
        small_file_limit: 100,
        medium_file_limit: 1000,
        header_style: TarHeaderStyle::Full,
    }
}

/// A tree with small files, a medium file, a large (splitting) file, a
/// symlink and a subdirectory.
fn sample_tree(tweak: bool) -> MemFileSystem {
    let fs = MemFileSystem::new();
    let root = Path::lookup("/src").unwrap();
    fs.add_dir(root, TimeSpec::new(1000, 0));
    fs.add_file(
        root.append("readme").unwrap(),
        b"tiny".to_vec(),
        TimeSpec::new(1100, 0),
    );
    fs.add_file(
        root.append("notes").unwrap(),
        vec![b'n'; 40],
        TimeSpec::new(1150, 0),
    );
    fs.add_symlink(
        root.append("latest").unwrap(),
        "readme",
        TimeSpec::new(1160, 0),
    );
    fs.add_file(
        root.append("middle.bin").unwrap(),
        vec![b'm'; 500],
        TimeSpec::new(1200, 0),
    );
    let mut big: Vec<u8> = (0..20_000usize).map(|i| (i * 13 % 251) as u8).collect();
    if tweak {
        big[12_345] ^= 0x01;
    }
    fs.add_file(root.append("huge.bin").unwrap(), big, TimeSpec::new(1300, 0));

    let sub = root.append("sub").unwrap();
    fs.add_dir(sub, TimeSpec::new(1400, 0));
    fs.add_file(
        sub.append("leaf").unwrap(),
        b"leaf data".to_vec(),
        TimeSpec::new(1450, 0),
    );
    fs
}

fn part_names(fs: &MemFileSystem) -> Vec<String> {
    let result = pack_tree(fs, Path::lookup("/src").unwrap(), &options()).unwrap();
    let mut names: Vec<String> = result.parts.iter().map(|p| p.name.to_string()).collect();
    names.push(result.index_name.to_string());
    names
}

#[test]
fn archives_are_partitioned_by_directory_and_size() {
    let fs = sample_tree(false);
    let result = pack_tree(&fs, Path::lookup("/src").unwrap(), &options()).unwrap();

    let mut smalls = 0;
    let mut mediums = 0;
    let mut singles = 0;
    for tar in &result.tars {
        match tar.tar_type() {
            TarFileType::SmallFilesTar => smalls += 1,
            TarFileType::MediumFilesTar => mediums += 1,
            TarFileType::RegFile => singles += 1,
            t => panic!("unexpected archive type {:?}", t),
        }
    }
    // one small archive per directory, one medium archive and one
    // single-file archive in the root
    assert_eq!(smalls, 2);
    assert_eq!(mediums, 1);
    assert_eq!(singles, 1);

    // the subdirectory's archive starts with the directory's own header
    let sub_tar = result
        .tars
        .iter()
        .find(|t| {
            t.entries()
                .iter()
                .any(|e| e.tarpath().as_str() == "sub/leaf")
        })
        .expect("archive holding sub/leaf");
    assert!(sub_tar.entries()[0].stat().is_directory());
    assert_eq!(sub_tar.entries()[0].tarpath().as_str(), "sub");
    assert_eq!(sub_tar.entries()[0].tar_offset().unwrap(), 0);

    // the large file was split and its parts are numbered
    let huge_tar_index = result
        .tars
        .iter()
        .position(|t| t.tar_type() == TarFileType::RegFile)
        .unwrap();
    let huge = &result.tars[huge_tar_index];
    assert!(huge.num_parts() > 1);
    let huge_parts: Vec<_> = result
        .parts
        .iter()
        .filter(|p| p.tar_index == huge_tar_index)
        .collect();
    assert_eq!(huge_parts.len() as u64, huge.num_parts());
    for (i, part) in huge_parts.iter().enumerate() {
        assert_eq!(part.part_nr, i as u64);
        assert_eq!(part.name.part_nr, i as u64);
        assert_eq!(part.name.num_parts, huge.num_parts());
        assert_eq!(part.name.size, huge.size(part.part_nr));
    }
}

#[test]
fn every_part_name_parses_back() {
    let fs = sample_tree(false);
    let result = pack_tree(&fs, Path::lookup("/src").unwrap(), &options()).unwrap();
    for part in &result.parts {
        let rendered = part.name.to_string();
        let parsed = TarFileName::parse(&rendered).unwrap();
        assert_eq!(parsed, part.name);
    }
    let index_rendered = result.index_name.to_string();
    assert!(index_rendered.starts_with("z01_"));
    assert_eq!(
        TarFileName::parse(&index_rendered).unwrap(),
        result.index_name
    );
}

#[test]
fn packing_twice_yields_identical_names() {
    let names_a = part_names(&sample_tree(false));
    let names_b = part_names(&sample_tree(false));
    assert_eq!(names_a, names_b);
}

#[test]
fn one_changed_byte_renames_every_archive() {
    let names_a = part_names(&sample_tree(false));
    let names_b = part_names(&sample_tree(true));
    assert_eq!(names_a.len(), names_b.len());
    for (a, b) in names_a.iter().zip(&names_b) {
        assert_ne!(a, b);
    }
}

#[test]
fn materialised_parts_carry_valid_tar_framing() {
    let fs = sample_tree(false);
    let result = pack_tree(&fs, Path::lookup("/src").unwrap(), &options()).unwrap();
    let dst = MemFileSystem::new();
    let out_dir = Path::lookup("/out").unwrap();
    dst.add_dir(out_dir, TimeSpec::default());

    for part in &result.parts {
        let tar = &result.tars[part.tar_index];
        let out = out_dir.append(&part.name.to_string()).unwrap();
        let stat = FileStat {
            mode: libc::S_IFREG | 0o644,
            size: tar.size(part.part_nr),
            ..Default::default()
        };
        let mut written = 0u64;
        let n = tar
            .create_file(out, &stat, part.part_nr, &fs, &dst, 0, &mut |n| {
                written += n
            })
            .unwrap();
        assert_eq!(n, tar.size(part.part_nr));
        assert_eq!(written, n);

        // every materialised part starts with a checksummed header block
        let bytes = dst.file_data(out).unwrap();
        assert_eq!(bytes.len() as u64, tar.size(part.part_nr));
        let mut block = [0u8; 512];
        block.copy_from_slice(&bytes[..512]);
        let header = TarHeader::from_bytes(&block);
        assert!(header.verify_checksum());
        if part.part_nr > 0 {
            assert_eq!(header.type_flag(), beak_datastore::tar_header::GNU_MULTIVOL);
        }
    }
}
