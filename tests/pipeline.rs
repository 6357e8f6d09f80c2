//! End-to-end coverage of the engine: mkfs, transactions over the COW
//! B-tree, commit ordering against injected crashes, and the root forest.

use btrfs_toolbox::blockdev::{self, ImageFile};
use btrfs_toolbox::check::{check_fs, CheckOptions};
use btrfs_toolbox::core::roots::{self, SubvolOptions};
use btrfs_toolbox::core::tree::{self, Key};
use btrfs_toolbox::core::{item_type, objectid, FsError, FsInfo, OpenOptions, SUPER_INFO_OFFSET};
use btrfs_toolbox::mkfs::{format_device, MkfsConfig};
use std::sync::Arc;

const IMAGE_SIZE: u64 = 128 * 1024 * 1024;

fn mkfs_image() -> tempfile::NamedTempFile {
    let temp = tempfile::NamedTempFile::new().unwrap();
    let dev = ImageFile::create(temp.path(), IMAGE_SIZE).unwrap();
    let cfg = MkfsConfig {
        label: "pipeline".to_string(),
        sectorsize: 4096,
        ..Default::default()
    };
    format_device(&dev, &cfg).unwrap();
    temp
}

fn open_rw(path: &std::path::Path) -> Arc<FsInfo> {
    FsInfo::open(
        path,
        OpenOptions {
            write: true,
            super_bytenr: None,
        },
    )
    .unwrap()
}

fn open_ro(path: &std::path::Path) -> Arc<FsInfo> {
    FsInfo::open(path, OpenOptions::default()).unwrap()
}

/// Deterministic shuffle so failures reproduce
fn shuffled(n: u64) -> Vec<u64> {
    let mut out: Vec<u64> = (0..n).collect();
    let mut state = 0x9E37_79B9_7F4A_7C15u64;
    for i in (1..out.len()).rev() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.swap(i, (state % (i as u64 + 1)) as usize);
    }
    out
}

fn test_key(i: u64) -> Key {
    Key::new(100_000 + i, item_type::STRING_ITEM, 0)
}

fn test_value(i: u64) -> Vec<u8> {
    let len = 16 + (i % 300) as usize;
    let mut v = vec![(i % 251) as u8; len];
    v[..8].copy_from_slice(&i.to_le_bytes());
    v
}

#[test]
fn insert_search_iterate_roundtrip() {
    let temp = mkfs_image();
    let count = 400u64;

    {
        let fs = open_rw(temp.path());
        let fs_root = fs.read_root(objectid::FS_TREE).unwrap();
        let trans = fs.begin_transaction().unwrap();
        for i in shuffled(count) {
            tree::insert_item(&trans, &fs_root, &test_key(i), &test_value(i)).unwrap();
        }
        trans.commit().unwrap();
    }

    // Every key resolves to its value after a cold reopen.
    let fs = open_ro(temp.path());
    let fs_root = fs.read_root(objectid::FS_TREE).unwrap();
    for i in 0..count {
        let mut path = tree::Path::new();
        let found = tree::search_slot(None, &fs, &fs_root, &test_key(i), 0, false, &mut path).unwrap();
        assert!(found, "key {} lost", i);
        assert_eq!(path.leaf().unwrap().item_data(path.slots[0]), test_value(i));
    }

    // Iteration yields the inserted keys in lexicographic order.
    let mut path = tree::Path::new();
    tree::search_slot(None, &fs, &fs_root, &test_key(0), 0, false, &mut path).unwrap();
    let mut seen = Vec::new();
    loop {
        let leaf = path.leaf().unwrap().clone();
        if path.slots[0] < leaf.nritems() as usize {
            let key = leaf.item_key(path.slots[0]);
            if key.item_type == item_type::STRING_ITEM {
                seen.push(key);
            }
        }
        if !tree::next_item(&fs, &fs_root, &mut path).unwrap() {
            break;
        }
    }
    assert_eq!(seen.len(), count as usize);
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "iteration out of order");
}

#[test]
fn duplicate_insert_rejected() {
    let temp = mkfs_image();
    let fs = open_rw(temp.path());
    let fs_root = fs.read_root(objectid::FS_TREE).unwrap();
    let trans = fs.begin_transaction().unwrap();

    tree::insert_item(&trans, &fs_root, &test_key(1), b"first").unwrap();
    match tree::insert_item(&trans, &fs_root, &test_key(1), b"second") {
        Err(FsError::Exists(_)) => (),
        other => panic!("expected Exists, got {:?}", other.map(|_| ())),
    }
    trans.commit().unwrap();
}

#[test]
fn delete_rebalances_and_stays_clean() {
    let temp = mkfs_image();
    let count = 500u64;

    {
        let fs = open_rw(temp.path());
        let fs_root = fs.read_root(objectid::FS_TREE).unwrap();
        let trans = fs.begin_transaction().unwrap();
        for i in 0..count {
            tree::insert_item(&trans, &fs_root, &test_key(i), &test_value(i)).unwrap();
        }
        trans.commit().unwrap();
    }

    {
        let fs = open_rw(temp.path());
        let fs_root = fs.read_root(objectid::FS_TREE).unwrap();
        let trans = fs.begin_transaction().unwrap();
        for i in 0..count {
            if i % 7 == 0 {
                continue;
            }
            let mut path = tree::Path::new();
            let found =
                tree::search_slot(Some(&trans), &fs, &fs_root, &test_key(i), 0, true, &mut path)
                    .unwrap();
            assert!(found);
            tree::del_item(&trans, &fs_root, &mut path).unwrap();
        }
        trans.commit().unwrap();
    }

    let fs = open_ro(temp.path());
    let fs_root = fs.read_root(objectid::FS_TREE).unwrap();
    for i in 0..count {
        let mut path = tree::Path::new();
        let found = tree::search_slot(None, &fs, &fs_root, &test_key(i), 0, false, &mut path).unwrap();
        assert_eq!(found, i % 7 == 0, "wrong survivor set at {}", i);
    }

    let report = check_fs(&fs, &CheckOptions::default()).unwrap();
    assert!(report.is_clean(), "check found: {:?}", report.errors);
}

#[test]
fn cow_isolation_until_commit() {
    let temp = mkfs_image();

    let fs = open_rw(temp.path());
    let fs_root = fs.read_root(objectid::FS_TREE).unwrap();
    let trans = fs.begin_transaction().unwrap();
    tree::insert_item(&trans, &fs_root, &test_key(42), b"pending").unwrap();

    // A reader of the committed generation sees nothing of the open
    // transaction.
    {
        let reader = open_ro(temp.path());
        assert_eq!(reader.generation(), 1);
        let reader_root = reader.read_root(objectid::FS_TREE).unwrap();
        let mut path = tree::Path::new();
        let found =
            tree::search_slot(None, &reader, &reader_root, &test_key(42), 0, false, &mut path)
                .unwrap();
        assert!(!found);
    }

    trans.commit().unwrap();

    let reader = open_ro(temp.path());
    assert_eq!(reader.generation(), 2);
    let reader_root = reader.read_root(objectid::FS_TREE).unwrap();
    let mut path = tree::Path::new();
    let found =
        tree::search_slot(None, &reader, &reader_root, &test_key(42), 0, false, &mut path).unwrap();
    assert!(found);
}

#[test]
fn abort_leaves_no_trace() {
    let temp = mkfs_image();

    {
        let fs = open_rw(temp.path());
        let fs_root = fs.read_root(objectid::FS_TREE).unwrap();
        let trans = fs.begin_transaction().unwrap();
        tree::insert_item(&trans, &fs_root, &test_key(7), b"doomed").unwrap();
        drop(trans); // no commit
    }

    let fs = open_ro(temp.path());
    assert_eq!(fs.generation(), 1);
    let fs_root = fs.read_root(objectid::FS_TREE).unwrap();
    let mut path = tree::Path::new();
    let found = tree::search_slot(None, &fs, &fs_root, &test_key(7), 0, false, &mut path).unwrap();
    assert!(!found);

    let report = check_fs(&fs, &CheckOptions::default()).unwrap();
    assert!(report.is_clean());
}

#[test]
fn single_writer_enforced() {
    let temp = mkfs_image();
    let fs = open_rw(temp.path());

    let trans = fs.begin_transaction().unwrap();
    match fs.begin_transaction() {
        Err(FsError::Invariant(_)) => (),
        other => panic!("expected Invariant, got {:?}", other.map(|_| ())),
    }
    trans.commit().unwrap();

    // After the commit a new transaction may start.
    let trans = fs.begin_transaction().unwrap();
    trans.commit().unwrap();
}

#[test]
fn crash_ordering_of_super_mirrors() {
    let temp = mkfs_image();

    // Snapshot the primary super before and after one committed change.
    let primary_before = {
        let dev = ImageFile::open(temp.path(), true).unwrap();
        let mut buf = vec![0u8; 4096];
        blockdev::read_exact_at(&dev, SUPER_INFO_OFFSET, &mut buf).unwrap();
        buf
    };

    {
        let fs = open_rw(temp.path());
        let fs_root = fs.read_root(objectid::FS_TREE).unwrap();
        let trans = fs.begin_transaction().unwrap();
        tree::insert_item(&trans, &fs_root, &test_key(1), b"generation-two").unwrap();
        trans.commit().unwrap();
    }

    let primary_after = {
        let dev = ImageFile::open(temp.path(), true).unwrap();
        let mut buf = vec![0u8; 4096];
        blockdev::read_exact_at(&dev, SUPER_INFO_OFFSET, &mut buf).unwrap();
        buf
    };

    // Crash injected between the secondary writes and the primary write:
    // the old primary is still in place, so the filesystem presents the
    // previous generation and still opens.
    {
        let dev = ImageFile::open(temp.path(), false).unwrap();
        blockdev::write_all_at(&dev, SUPER_INFO_OFFSET, &primary_before).unwrap();
    }
    {
        let fs = open_ro(temp.path());
        assert_eq!(fs.generation(), 1);
        let fs_root = fs.read_root(objectid::FS_TREE).unwrap();
        let mut path = tree::Path::new();
        let found =
            tree::search_slot(None, &fs, &fs_root, &test_key(1), 0, false, &mut path).unwrap();
        assert!(!found, "uncommitted change visible after torn commit");
    }

    // Crash after the primary write: the new generation is the one seen.
    {
        let dev = ImageFile::open(temp.path(), false).unwrap();
        blockdev::write_all_at(&dev, SUPER_INFO_OFFSET, &primary_after).unwrap();
    }
    let fs = open_ro(temp.path());
    assert_eq!(fs.generation(), 2);
}

#[test]
fn subvolume_snapshot_and_received_uuid() {
    let temp = mkfs_image();

    let (subvol_uuid, snap_id, received_uuid) = {
        let fs = open_rw(temp.path());
        let fs_root = fs.read_root(objectid::FS_TREE).unwrap();
        let trans = fs.begin_transaction().unwrap();

        let subvol =
            roots::create_subvolume(&trans, &fs_root, b"subvol1", &SubvolOptions::default())
                .unwrap();
        let subvol_uuid = subvol.item().uuid;

        let snap = roots::create_snapshot(
            &trans,
            &fs_root,
            &subvol,
            b"snap1",
            &SubvolOptions {
                readonly: true,
                ..Default::default()
            },
        )
        .unwrap();

        let received_uuid = *uuid::Uuid::new_v4().as_bytes();
        roots::set_received(&trans, &snap, received_uuid, 77, trans.transid).unwrap();

        let snap_id = snap.objectid();
        trans.commit().unwrap();
        (subvol_uuid, snap_id, received_uuid)
    };

    let fs = open_ro(temp.path());
    let fs_root = fs.read_root(objectid::FS_TREE).unwrap();

    let subvol_id = roots::lookup_subvolume(&fs, &fs_root, 256, b"subvol1").unwrap();
    let found_snap_id = roots::lookup_subvolume(&fs, &fs_root, 256, b"snap1").unwrap();
    assert_eq!(found_snap_id, snap_id);
    assert_ne!(subvol_id, snap_id);

    // The snapshot remembers its parent and its received identity.
    let snap_root = fs.read_root(snap_id).unwrap();
    let item = snap_root.item();
    assert_eq!(item.parent_uuid, subvol_uuid);
    assert_eq!(item.received_uuid, received_uuid);
    assert_eq!({ item.stransid }, 77);
    assert!(item.is_readonly());

    // Both uuid-tree directions resolve.
    let by_uuid =
        roots::lookup_uuid_entry(&fs, item_type::UUID_SUBVOL, &subvol_uuid).unwrap();
    assert_eq!(by_uuid, subvol_id);
    let by_received =
        roots::lookup_uuid_entry(&fs, item_type::UUID_RECEIVED_SUBVOL, &received_uuid).unwrap();
    assert_eq!(by_received, snap_id);

    let report = check_fs(&fs, &CheckOptions::default()).unwrap();
    assert!(report.is_clean(), "check found: {:?}", report.errors);
}

#[test]
fn reserved_ranges_stay_pure_under_load() {
    let temp = mkfs_image();

    {
        let fs = open_rw(temp.path());
        let fs_root = fs.read_root(objectid::FS_TREE).unwrap();
        let trans = fs.begin_transaction().unwrap();
        for i in 0..1000u64 {
            tree::insert_item(&trans, &fs_root, &test_key(i), &test_value(i)).unwrap();
        }
        trans.commit().unwrap();
    }

    let fs = open_ro(temp.path());
    for chunk in fs.chunks().iter() {
        for stripe in &chunk.stripes {
            for (start, len) in btrfs_toolbox::core::reserved_ranges() {
                assert!(
                    stripe.offset >= start + len || stripe.offset + chunk.length <= start,
                    "stripe [{:#x}, +{:#x}) overlaps reserved [{:#x}, +{:#x})",
                    stripe.offset,
                    chunk.length,
                    start,
                    len
                );
            }
        }
    }
}
