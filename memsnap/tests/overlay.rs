use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use memsnap::base::BaseMemory;
use memsnap::delta::{self, RefKind};
use memsnap::differ::{self, OverlayOptions};
use memsnap::error::SnapshotError;
use memsnap::hashlist::{self, hash_page, HashEntry};
use memsnap::recover;
use memsnap::stream::{RamSaveFlags, PAGE_SIZE, RAM_ID, RAM_MAGIC, RAM_VERSION};


const WRAPPER_MAGIC: &[u8; 16] = b"LibvirtQemudSave";
const WRAPPER_HEADER_LEN: u64 = 16 + 19 * 4;

/// File page index at which the RAM block data starts: the wrapper header
/// occupies page 0 and the migration metadata page 1.
const RAM_START_PFN: u64 = 2;


fn patterned_page(seed: u8) -> Vec<u8> {
    (0..PAGE_SIZE as usize)
        .map(|i| seed.wrapping_mul(31).wrapping_add((i % 251) as u8).wrapping_add(1))
        .collect()
}

fn snapshot_bytes(ram_pages: &[Vec<u8>]) -> Vec<u8> {
    let ram_size = (ram_pages.len() as u64) * PAGE_SIZE;

    let mut out = Vec::new();
    out.extend_from_slice(WRAPPER_MAGIC);
    let xml_length = (PAGE_SIZE - WRAPPER_HEADER_LEN) as u32;
    for word in [2u32, xml_length, 1, 0] {
        out.extend_from_slice(&word.to_le_bytes());
    }
    out.extend_from_slice(&[0u8; 15 * 4]);
    out.resize(PAGE_SIZE as usize, b' ');

    out.extend_from_slice(&RAM_MAGIC.to_be_bytes());
    out.extend_from_slice(&RAM_VERSION.to_be_bytes());
    out.extend_from_slice(&(ram_size | RamSaveFlags::MEM_SIZE.bits()).to_be_bytes());
    out.push(RAM_ID.len() as u8);
    out.extend_from_slice(RAM_ID);
    out.extend_from_slice(&ram_size.to_be_bytes());
    out.extend_from_slice(&RamSaveFlags::RAW.bits().to_be_bytes());
    out.push(RAM_ID.len() as u8);
    out.extend_from_slice(RAM_ID);
    let padding = PAGE_SIZE as usize - (out.len() & (PAGE_SIZE as usize - 1));
    out.resize(out.len() + padding, 0);
    assert_eq!(out.len() as u64, RAM_START_PFN * PAGE_SIZE);

    for page in ram_pages {
        assert_eq!(page.len() as u64, PAGE_SIZE);
        out.extend_from_slice(page);
    }
    // trailer standing in for device state
    out.resize(out.len() + PAGE_SIZE as usize, 0xE5);
    out
}

fn write_snapshot(path: &Path, ram_pages: &[Vec<u8>]) {
    fs::write(path, snapshot_bytes(ram_pages)).unwrap();
}

fn prepare_base(dir: &Path, ram_pages: &[Vec<u8>]) -> (PathBuf, PathBuf) {
    let base_path = dir.join("base");
    write_snapshot(&base_path, ram_pages);
    let hash_list = hashlist::hash_snapshot(&base_path).unwrap();
    let meta_path = dir.join("base.meta");
    hashlist::export_hashlist(&hash_list, &meta_path).unwrap();
    (base_path, meta_path)
}


#[test]
fn base_hash_index_covers_every_page() {
    let dir = tempfile::tempdir().unwrap();
    let pages: Vec<Vec<u8>> = (0..8).map(|i| patterned_page(i as u8)).collect();
    let base_path = dir.path().join("base");
    write_snapshot(&base_path, &pages);

    let hash_list = hashlist::hash_snapshot(&base_path).unwrap();
    let file_size = fs::metadata(&base_path).unwrap().len();
    assert_eq!(hash_list.len() as u64, file_size / PAGE_SIZE);
    for (i, entry) in hash_list.iter().enumerate() {
        assert_eq!(entry.offset, (i as i64) * PAGE_SIZE as i64);
        assert_eq!(entry.length, PAGE_SIZE as u32);
    }
}

#[test]
fn identity_diff_is_empty_and_recovers_the_base() {
    let dir = tempfile::tempdir().unwrap();
    let pages: Vec<Vec<u8>> = (0..8).map(|i| patterned_page(i as u8)).collect();
    let (base_path, meta_path) = prepare_base(dir.path(), &pages);

    let mut base = BaseMemory::import_from_meta(&meta_path, &base_path).unwrap();
    let outcome = differ::create_memory_overlay(&base_path, &mut base, &OverlayOptions::default()).unwrap();
    assert!(outcome.delta_list.is_empty());
    assert_eq!(outcome.freed_pages, 0);

    let delta_path = dir.path().join("base.delta");
    delta::write_overlay(&outcome.delta_list, &delta_path).unwrap();
    let out_path = dir.path().join("base.recover");
    let overlay_map = recover::recover_memory(&base_path, None, &delta_path, &out_path, Some(&base_path)).unwrap();
    assert_eq!(overlay_map, "");
    assert_eq!(fs::read(&out_path).unwrap(), fs::read(&base_path).unwrap());
}

#[test]
fn modified_pages_round_trip_through_the_overlay() {
    let dir = tempfile::tempdir().unwrap();
    let pages: Vec<Vec<u8>> = (0..8).map(|i| patterned_page(i as u8)).collect();
    let (base_path, meta_path) = prepare_base(dir.path(), &pages);

    // change two pages, zero out a third
    let mut modified_pages = pages.clone();
    modified_pages[1] = patterned_page(0x91);
    modified_pages[5] = patterned_page(0x95);
    modified_pages[6] = vec![0u8; PAGE_SIZE as usize];
    let modified_path = dir.path().join("modified");
    write_snapshot(&modified_path, &modified_pages);

    let mut base = BaseMemory::import_from_meta(&meta_path, &base_path).unwrap();
    let outcome = differ::create_memory_overlay(&modified_path, &mut base, &OverlayOptions::default()).unwrap();
    let items = &outcome.delta_list;

    assert_eq!(items.len(), 3);
    let expected_offsets: Vec<u64> = [1u64, 5, 6]
        .iter()
        .map(|pfn| (RAM_START_PFN + pfn) * PAGE_SIZE)
        .collect();
    let offsets: Vec<u64> = items.iter().map(|item| item.offset).collect();
    assert_eq!(offsets, expected_offsets);
    assert!(offsets.windows(2).all(|pair| pair[0] < pair[1]));

    // payload-carrying encodings obey the patch-size rule
    for item in &items[..2] {
        match &item.kind {
            RefKind::Raw(data) => assert_eq!(data.len() as u64, PAGE_SIZE),
            RefKind::Xdelta(patch) => assert!((patch.len() as u64) < PAGE_SIZE),
            other => panic!("unexpected ref kind: {:?}", other),
        }
    }
    // the zeroed page must be tagged as a zero reference, not base memory
    assert_eq!(items[2].kind, RefKind::Zeros);
    assert_eq!(items[2].hash, hash_page(&vec![0u8; PAGE_SIZE as usize]));

    let delta_path = dir.path().join("modified.delta");
    delta::write_overlay(items, &delta_path).unwrap();
    let out_path = dir.path().join("base.recover");
    let overlay_map = recover::recover_memory(&base_path, None, &delta_path, &out_path, Some(&modified_path)).unwrap();
    assert_eq!(overlay_map, "3:1,7:1,8:1");
    assert_eq!(fs::read(&out_path).unwrap(), fs::read(&modified_path).unwrap());
}

#[test]
fn duplicate_new_pages_self_deduplicate() {
    let dir = tempfile::tempdir().unwrap();
    let pages: Vec<Vec<u8>> = (0..8).map(|i| patterned_page(i as u8)).collect();
    let (base_path, meta_path) = prepare_base(dir.path(), &pages);

    let mut modified_pages = pages.clone();
    modified_pages[2] = patterned_page(0xC3);
    modified_pages[4] = patterned_page(0xC3);
    let modified_path = dir.path().join("modified");
    write_snapshot(&modified_path, &modified_pages);

    let mut base = BaseMemory::import_from_meta(&meta_path, &base_path).unwrap();
    let outcome = differ::create_memory_overlay(&modified_path, &mut base, &OverlayOptions::default()).unwrap();
    let items = &outcome.delta_list;
    assert_eq!(items.len(), 2);
    assert!(matches!(items[0].kind, RefKind::Raw(_) | RefKind::Xdelta(_)));
    assert_eq!(items[1].kind, RefKind::SelfRef { source: items[0].offset });

    let delta_path = dir.path().join("modified.delta");
    delta::write_overlay(items, &delta_path).unwrap();
    let out_path = dir.path().join("base.recover");
    recover::recover_memory(&base_path, None, &delta_path, &out_path, Some(&modified_path)).unwrap();
    assert_eq!(fs::read(&out_path).unwrap(), fs::read(&modified_path).unwrap());
}

#[test]
fn disk_pages_are_referenced_and_resolved() {
    let dir = tempfile::tempdir().unwrap();
    let pages: Vec<Vec<u8>> = (0..8).map(|i| patterned_page(i as u8)).collect();
    let (base_path, meta_path) = prepare_base(dir.path(), &pages);

    // one modified page happens to exist in the base disk image
    let disk_page = patterned_page(0xD7);
    let disk_path = dir.path().join("disk");
    fs::write(&disk_path, &disk_page).unwrap();
    let disk_hashes = [HashEntry {
        offset: 0,
        length: PAGE_SIZE as u32,
        hash: hash_page(&disk_page),
    }];

    let mut modified_pages = pages.clone();
    modified_pages[3] = disk_page.clone();
    let modified_path = dir.path().join("modified");
    write_snapshot(&modified_path, &modified_pages);

    let mut base = BaseMemory::import_from_meta(&meta_path, &base_path).unwrap();
    let options = OverlayOptions {
        base_disk_hashes: Some(&disk_hashes),
        free_scan: None,
    };
    let outcome = differ::create_memory_overlay(&modified_path, &mut base, &options).unwrap();
    let items = &outcome.delta_list;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].kind, RefKind::BaseDisk { source: 0 });

    let delta_path = dir.path().join("modified.delta");
    delta::write_overlay(items, &delta_path).unwrap();
    let out_path = dir.path().join("base.recover");

    // without the disk the overlay cannot be resolved
    assert!(matches!(
        recover::recover_memory(&base_path, None, &delta_path, &out_path, None),
        Err(SnapshotError::BaseDiskRequired { .. })
    ));

    recover::recover_memory(&base_path, Some(&disk_path), &delta_path, &out_path, Some(&modified_path)).unwrap();
    assert_eq!(fs::read(&out_path).unwrap(), fs::read(&modified_path).unwrap());
}

#[test]
fn single_changed_page_of_a_raw_image() {
    let dir = tempfile::tempdir().unwrap();
    let base_path = dir.path().join("base.raw");
    let base_data = vec![0u8; 1024 * PAGE_SIZE as usize];
    fs::write(&base_path, &base_data).unwrap();

    let mut modified_data = base_data.clone();
    modified_data[..PAGE_SIZE as usize].fill(0x41);
    let modified_path = dir.path().join("modified.raw");
    fs::write(&modified_path, &modified_data).unwrap();

    let mut base = BaseMemory::open_raw(&base_path).unwrap();
    base.hash_list = hashlist::hash_region(
        &mut File::open(&base_path).unwrap(),
        0,
        base_data.len() as u64,
    ).unwrap();

    let mut modified = File::open(&modified_path).unwrap();
    let (items, freed) = differ::scan_modified_pages(
        &mut modified,
        modified_data.len() as u64,
        &mut base,
        None,
        differ::MAX_DELTA_ITEMS,
    ).unwrap();

    assert_eq!(freed, 0);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].offset, 0);
    assert_eq!(items[0].hash, hash_page(&vec![0x41u8; PAGE_SIZE as usize]));
    assert!(matches!(items[0].kind, RefKind::Raw(_) | RefKind::Xdelta(_)));
}

#[test]
fn freed_pages_are_suppressed_and_counted() {
    let dir = tempfile::tempdir().unwrap();
    let base_path = dir.path().join("base.raw");
    let mut base_data = Vec::new();
    for i in 0..256u32 {
        base_data.extend_from_slice(&patterned_page(i as u8));
    }
    fs::write(&base_path, &base_data).unwrap();

    let mut modified_data = base_data.clone();
    for pfn in 10..110u64 {
        let start = (pfn * PAGE_SIZE) as usize;
        modified_data[start..start + PAGE_SIZE as usize].copy_from_slice(&patterned_page(0xF1));
    }
    let modified_path = dir.path().join("modified.raw");
    fs::write(&modified_path, &modified_data).unwrap();

    let mut base = BaseMemory::open_raw(&base_path).unwrap();
    base.hash_list = hashlist::hash_region(
        &mut File::open(&base_path).unwrap(),
        0,
        base_data.len() as u64,
    ).unwrap();

    let free_pfns: HashSet<u64> = (10..110).collect();
    let mut modified = File::open(&modified_path).unwrap();
    let (items, freed) = differ::scan_modified_pages(
        &mut modified,
        modified_data.len() as u64,
        &mut base,
        Some(&free_pfns),
        differ::MAX_DELTA_ITEMS,
    ).unwrap();

    assert!(items.is_empty());
    assert_eq!(freed, 100);
}

#[test]
fn unrelated_base_trips_the_safety_valve() {
    let dir = tempfile::tempdir().unwrap();
    let base_path = dir.path().join("base.raw");
    let base_data = vec![0u8; 8 * PAGE_SIZE as usize];
    fs::write(&base_path, &base_data).unwrap();

    let mut base = BaseMemory::open_raw(&base_path).unwrap();
    // a hash index of an unrelated snapshot: nothing will ever match
    base.hash_list = (0..8)
        .map(|i| HashEntry {
            offset: i * PAGE_SIZE as i64,
            length: PAGE_SIZE as u32,
            hash: [0u8; 32],
        })
        .collect();

    let mut modified_data = Vec::new();
    for i in 0..8u32 {
        modified_data.extend_from_slice(&patterned_page(i as u8));
    }
    let modified_path = dir.path().join("modified.raw");
    fs::write(&modified_path, &modified_data).unwrap();

    let mut modified = File::open(&modified_path).unwrap();
    assert!(matches!(
        differ::scan_modified_pages(&mut modified, modified_data.len() as u64, &mut base, None, 4),
        Err(SnapshotError::SuspectBaseMismatch { .. })
    ));
}

#[test]
fn modified_snapshot_longer_than_the_base_is_suspect() {
    let dir = tempfile::tempdir().unwrap();
    let base_path = dir.path().join("base.raw");
    let base_data = vec![0x11u8; 4 * PAGE_SIZE as usize];
    fs::write(&base_path, &base_data).unwrap();

    let mut base = BaseMemory::open_raw(&base_path).unwrap();
    base.hash_list = hashlist::hash_region(
        &mut File::open(&base_path).unwrap(),
        0,
        base_data.len() as u64,
    ).unwrap();

    let modified_data = vec![0x11u8; 6 * PAGE_SIZE as usize];
    let modified_path = dir.path().join("modified.raw");
    fs::write(&modified_path, &modified_data).unwrap();

    let mut modified = File::open(&modified_path).unwrap();
    assert!(matches!(
        differ::scan_modified_pages(
            &mut modified,
            modified_data.len() as u64,
            &mut base,
            None,
            differ::MAX_DELTA_ITEMS,
        ),
        Err(SnapshotError::SuspectBaseMismatch { .. })
    ));
}
