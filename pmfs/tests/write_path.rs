//! Copy-on-write path seen from the public API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;

use pmfs::filelog::{read_entry, ENTRY_SIZE};
use pmfs::{InodeFlags, MountFlags, PmemRegion, Pmfs, PmfsConfig, BLOCK_SIZE, ROOT_INO};

fn format_with(config: PmfsConfig) -> Pmfs {
    let region = Arc::new(PmemRegion::new(1024 * BLOCK_SIZE).unwrap());
    Pmfs::format(region, config).unwrap()
}

fn remount(fs: &Pmfs) -> Pmfs {
    let region = Arc::new(PmemRegion::from_image(&fs.crash_image()).unwrap());
    Pmfs::mount(region, *fs.config()).unwrap()
}

fn block_bytes(fs: &Pmfs, ino: u64, pgoff: u64) -> Vec<u8> {
    let m = fs.get_blocks(ino, pgoff, 1, false).unwrap().unwrap();
    let mut buf = vec![0u8; BLOCK_SIZE];
    fs.region().read(fs.layout().block_off(m.block), &mut buf).unwrap();
    buf
}

#[test]
fn test_unaligned_write_across_block_boundary() {
    let fs = format_with(PmfsConfig::new());
    let ino = fs.create_inode(ROOT_INO, InodeFlags::empty()).unwrap();
    let payload = b"ABCDEFGHIJ";

    assert_eq!(fs.write(ino, payload, 4090).unwrap(), 10);
    assert_eq!(fs.file_size(ino).unwrap(), 4100);

    let b0 = block_bytes(&fs, ino, 0);
    assert!(b0[..4090].iter().all(|&b| b == 0));
    assert_eq!(&b0[4090..], &payload[..6]);
    let b1 = block_bytes(&fs, ino, 1);
    assert_eq!(&b1[..4], &payload[6..]);
    assert!(b1[4..].iter().all(|&b| b == 0));

    for pgoff in 0..2 {
        let m = fs.get_blocks(ino, pgoff, 1, false).unwrap().unwrap();
        assert!(fs.verify_block(m.block).unwrap());
    }

    // One entry covers both pages.
    let pi = fs.inode(ino).unwrap();
    assert_eq!(pi.log_tail, pi.log_head + ENTRY_SIZE as u64);
    let e = read_entry(fs.region(), pi.log_head).unwrap();
    assert_eq!(e.pgoff, 0);
    assert_eq!(e.num_pages, 2);
    assert_eq!(e.size, 4100);
    assert_eq!(pi.blocks, 2);
}

#[test]
fn test_append_grows_file() {
    let fs = format_with(PmfsConfig::new());
    let ino = fs.create_inode(ROOT_INO, InodeFlags::empty()).unwrap();
    let mut expected = Vec::new();
    for i in 0..20u8 {
        let chunk = vec![i; 700];
        assert_eq!(fs.append(ino, &chunk).unwrap(), chunk.len());
        expected.extend_from_slice(&chunk);
    }

    let again = remount(&fs);
    let mut buf = vec![0u8; expected.len() + 10];
    assert_eq!(again.read(ino, &mut buf, 0).unwrap(), expected.len());
    assert_eq!(&buf[..expected.len()], &expected[..]);
}

#[test]
fn test_concurrent_writers_on_distinct_inodes() {
    let fs = format_with(PmfsConfig::new().with_cpus(4));
    let inos: Vec<u64> = (0..4)
        .map(|_| fs.create_inode(ROOT_INO, InodeFlags::empty()).unwrap())
        .collect();

    thread::scope(|s| {
        for (i, &ino) in inos.iter().enumerate() {
            let fs = &fs;
            s.spawn(move || {
                for round in 0..16u64 {
                    let data = vec![i as u8 + 1; 1500];
                    fs.write(ino, &data, round * 1000).unwrap();
                }
            });
        }
    });

    let again = remount(&fs);
    for (i, &ino) in inos.iter().enumerate() {
        let size = again.file_size(ino).unwrap() as usize;
        assert_eq!(size, 15 * 1000 + 1500);
        let mut buf = vec![0u8; size];
        again.read(ino, &mut buf, 0).unwrap();
        assert!(buf.iter().all(|&b| b == i as u8 + 1));
    }
    assert_eq!(again.free_blocks(), fs.free_blocks());
}

#[test]
fn test_reader_never_sees_torn_write() {
    let fs = format_with(PmfsConfig::new());
    let ino = fs.create_inode(ROOT_INO, InodeFlags::empty()).unwrap();
    let len = 2 * BLOCK_SIZE;
    fs.write(ino, &vec![0u8; len], 0).unwrap();

    let done = AtomicBool::new(false);
    thread::scope(|s| {
        s.spawn(|| {
            for v in 1..=64u8 {
                fs.write(ino, &vec![v; len], 0).unwrap();
            }
            done.store(true, Ordering::Release);
        });
        s.spawn(|| {
            let mut buf = vec![0u8; len];
            while !done.load(Ordering::Acquire) {
                assert_eq!(fs.read(ino, &mut buf, 0).unwrap(), len);
                let first = buf[0];
                assert!(buf.iter().all(|&b| b == first), "mixed generations in one read");
                thread::yield_now();
            }
        });
    });

    let mut buf = vec![0u8; len];
    fs.read(ino, &mut buf, 0).unwrap();
    assert!(buf.iter().all(|&b| b == 64));
}

#[test]
fn test_mapped_store_survives_remount() {
    let fs = format_with(PmfsConfig::new());
    let ino = fs.create_inode(ROOT_INO, InodeFlags::empty()).unwrap();
    fs.write(ino, b"second page", BLOCK_SIZE as u64).unwrap();

    {
        let map = fs.mmap(ino).unwrap();
        map.store(100, b"through the mapping").unwrap();
    }

    let again = remount(&fs);
    let block = again.get_blocks(ino, 0, 1, false).unwrap().unwrap().block;
    assert!(again.verify_block(block).unwrap());
    let mut buf = [0u8; 19];
    again.read(ino, &mut buf, 100).unwrap();
    assert_eq!(&buf, b"through the mapping");
    assert_eq!(again.file_size(ino).unwrap(), BLOCK_SIZE as u64 + 11);
}

#[test]
fn test_write_without_integrity_metadata() {
    let flags = MountFlags::REPLICA_INODE | MountFlags::WPROTECT;
    let fs = format_with(PmfsConfig::new().with_flags(flags));
    let ino = fs.create_inode(ROOT_INO, InodeFlags::empty()).unwrap();
    fs.write(ino, &[9u8; 3000], 2000).unwrap();

    let again = remount(&fs);
    let mut buf = vec![0u8; 5000];
    assert_eq!(again.read(ino, &mut buf, 0).unwrap(), 5000);
    assert!(buf[..2000].iter().all(|&b| b == 0));
    assert!(buf[2000..].iter().all(|&b| b == 9));
}

#[test]
fn test_truncate_survives_remount() {
    let fs = format_with(PmfsConfig::new());
    let ino = fs.create_inode(ROOT_INO, InodeFlags::empty()).unwrap();
    fs.write(ino, &vec![0x42u8; 4 * BLOCK_SIZE], 0).unwrap();
    fs.truncate(ino, BLOCK_SIZE as u64 + 7).unwrap();

    let again = remount(&fs);
    assert_eq!(again.file_size(ino).unwrap(), BLOCK_SIZE as u64 + 7);
    assert_eq!(again.free_blocks(), fs.free_blocks());
    assert_eq!(again.get_blocks(ino, 2, 1, false).unwrap(), None);

    again.truncate(ino, 3 * BLOCK_SIZE as u64).unwrap();
    let mut buf = vec![0xFFu8; 3 * BLOCK_SIZE];
    assert_eq!(again.read(ino, &mut buf, 0).unwrap(), buf.len());
    assert!(buf[..BLOCK_SIZE + 7].iter().all(|&b| b == 0x42));
    assert!(buf[BLOCK_SIZE + 7..].iter().all(|&b| b == 0));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_writes_match_model_across_remount(
        ops in proptest::collection::vec((0u64..8 * BLOCK_SIZE as u64, 1usize..3 * BLOCK_SIZE, any::<u8>()), 1..10)
    ) {
        let fs = format_with(PmfsConfig::new());
        let ino = fs.create_inode(ROOT_INO, InodeFlags::empty()).unwrap();
        let mut model: Vec<u8> = Vec::new();

        for (pos, len, byte) in ops {
            fs.write(ino, &vec![byte; len], pos).unwrap();
            let end = pos as usize + len;
            if model.len() < end {
                model.resize(end, 0);
            }
            model[pos as usize..end].fill(byte);
        }

        let again = remount(&fs);
        prop_assert_eq!(again.file_size(ino).unwrap(), model.len() as u64);
        let mut buf = vec![0u8; model.len()];
        again.read(ino, &mut buf, 0).unwrap();
        prop_assert_eq!(&buf, &model);
        prop_assert_eq!(again.free_blocks(), fs.free_blocks());
    }
}
