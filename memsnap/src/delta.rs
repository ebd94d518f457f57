use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use from_to_repr::from_to_other;
use tracing::{debug, instrument};

use crate::base::BaseMemory;
use crate::byte_io::{BigEndianRead, BigEndianWrite, ByteRead, ByteWrite, ReadFromBytes, WriteToBytes};
use crate::error::SnapshotError;
use crate::hashlist::{HashEntry, PageHash};
use crate::xdelta;


pub const OVERLAY_MAGIC: u32 = 0x4F56_4C59;
pub const OVERLAY_VERSION: u32 = 0x0000_0001;


/// On-disk discriminant of a delta record.
#[derive(Clone, Copy, Debug)]
#[from_to_other(base_type = u8, derive_compare = "as_int")]
pub enum RefTag {
    Raw = 0x00,
    Xdelta = 0x01,
    BaseDisk = 0x02,
    BaseMem = 0x03,
    SelfRef = 0x04,
    Zeros = 0x05,
    Other(u8),
}


/// How one page of the modified snapshot is reconstructed. The payload shape
/// follows the kind: patches and raw pages carry bytes, reference kinds carry
/// the offset into their source, the zero page needs neither.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RefKind {
    Raw(Vec<u8>),
    Xdelta(Vec<u8>),
    Zeros,
    BaseDisk { source: u64 },
    BaseMem { source: u64 },
    SelfRef { source: u64 },
}
impl RefKind {
    pub fn tag(&self) -> RefTag {
        match self {
            Self::Raw(_) => RefTag::Raw,
            Self::Xdelta(_) => RefTag::Xdelta,
            Self::Zeros => RefTag::Zeros,
            Self::BaseDisk { .. } => RefTag::BaseDisk,
            Self::BaseMem { .. } => RefTag::BaseMem,
            Self::SelfRef { .. } => RefTag::SelfRef,
        }
    }

    pub fn payload_len(&self) -> usize {
        match self {
            Self::Raw(data) | Self::Xdelta(data) => data.len(),
            _ => 0,
        }
    }

    fn carries_payload(&self) -> bool {
        matches!(self, Self::Raw(_) | Self::Xdelta(_))
    }
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeltaItem {
    pub offset: u64,
    pub length: u32,
    pub hash: PageHash,
    pub kind: RefKind,
}


pub fn write_overlay(items: &[DeltaItem], path: &Path) -> Result<(), SnapshotError> {
    let file = File::create(path)?;
    let mut writer = BigEndianWrite::new(BufWriter::new(file));
    writer.write_u32(OVERLAY_MAGIC)?;
    writer.write_u32(OVERLAY_VERSION)?;
    for item in items {
        writer.write_u64(item.offset)?;
        writer.write_u32(item.length)?;
        WriteToBytes::write_to_bytes(&item.hash, &mut writer)?;
        writer.write_u8(item.kind.tag().to_base_type())?;
        match &item.kind {
            RefKind::Raw(data) | RefKind::Xdelta(data) => {
                writer.write_u32(data.len() as u32)?;
                writer.write_all(data)?;
            },
            RefKind::Zeros => {},
            RefKind::BaseDisk { source } | RefKind::BaseMem { source } | RefKind::SelfRef { source } => {
                writer.write_u64(*source)?;
            },
        }
    }
    writer.flush()?;
    Ok(())
}

fn read_overlay_item<R: ByteRead + Read>(reader: &mut R, record_offset: u64) -> Result<(DeltaItem, u64), SnapshotError> {
    let offset = reader.read_u64()?;
    let length = reader.read_u32()?;
    let hash = <PageHash as ReadFromBytes>::read_from_bytes(reader)?;
    let tag = RefTag::from_base_type(reader.read_u8()?);
    let mut consumed = 8 + 4 + 32 + 1u64;
    let kind = match tag {
        RefTag::Raw => {
            let data_len = reader.read_u32()?;
            let mut data = vec![0u8; data_len as usize];
            reader.read_exact(&mut data)?;
            consumed += 4 + u64::from(data_len);
            RefKind::Raw(data)
        },
        RefTag::Xdelta => {
            let data_len = reader.read_u32()?;
            let mut data = vec![0u8; data_len as usize];
            reader.read_exact(&mut data)?;
            consumed += 4 + u64::from(data_len);
            RefKind::Xdelta(data)
        },
        RefTag::Zeros => RefKind::Zeros,
        RefTag::BaseDisk => {
            consumed += 8;
            RefKind::BaseDisk { source: reader.read_u64()? }
        },
        RefTag::BaseMem => {
            consumed += 8;
            RefKind::BaseMem { source: reader.read_u64()? }
        },
        RefTag::SelfRef => {
            consumed += 8;
            RefKind::SelfRef { source: reader.read_u64()? }
        },
        RefTag::Other(_) => {
            return Err(SnapshotError::CorruptOverlay { offset: record_offset });
        },
    };
    let item = DeltaItem {
        offset,
        length,
        hash,
        kind,
    };
    Ok((item, consumed))
}

pub fn read_overlay(path: &Path) -> Result<Vec<DeltaItem>, SnapshotError> {
    let size = fs::metadata(path)?.len();
    let file = File::open(path)?;
    let mut reader = BigEndianRead::new(BufReader::new(file));

    let magic = reader.read_u32().map_err(|_| SnapshotError::CorruptOverlay { offset: 0 })?;
    let version = reader.read_u32().map_err(|_| SnapshotError::CorruptOverlay { offset: 4 })?;
    if magic != OVERLAY_MAGIC || version != OVERLAY_VERSION {
        return Err(SnapshotError::CorruptOverlay { offset: 0 });
    }

    let mut items = Vec::new();
    let mut position = 8u64;
    while position < size {
        let (item, consumed) = match read_overlay_item(&mut reader, position) {
            Ok(parsed) => parsed,
            Err(SnapshotError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(SnapshotError::CorruptOverlay { offset: position });
            },
            Err(other) => return Err(other),
        };
        items.push(item);
        position += consumed;
    }
    debug!(items = items.len(), "loaded overlay");
    Ok(items)
}


/// Reference source for cross-snapshot deduplication, cheapest first.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CrossSource {
    Zeros,
    BaseMem,
    BaseDisk,
}

/// Re-tags payload-carrying items whose page hash already occurs in `source`,
/// replacing their payload with a reference. Items that were re-tagged by an
/// earlier (cheaper) pass are left alone.
pub fn cross_reference(source: &[HashEntry], items: &mut [DeltaItem], kind: CrossSource) -> usize {
    let mut by_hash: HashMap<&PageHash, i64> = HashMap::with_capacity(source.len());
    for entry in source {
        by_hash.entry(&entry.hash).or_insert(entry.offset);
    }

    let mut rewritten = 0;
    for item in items.iter_mut() {
        if !item.kind.carries_payload() {
            continue;
        }
        let Some(&source_offset) = by_hash.get(&item.hash) else { continue };
        item.kind = match kind {
            CrossSource::Zeros => RefKind::Zeros,
            CrossSource::BaseMem => RefKind::BaseMem { source: source_offset as u64 },
            CrossSource::BaseDisk => RefKind::BaseDisk { source: source_offset as u64 },
        };
        rewritten += 1;
    }
    debug!(?kind, rewritten, "cross-referenced delta items");
    rewritten
}

/// Deduplicates identical pages within the list itself. The first item in
/// list order keeps its payload; later duplicates become self references, so
/// a self reference always points backward.
pub fn self_references(items: &mut [DeltaItem]) -> usize {
    let mut first_by_hash: HashMap<PageHash, u64> = HashMap::new();
    let mut rewritten = 0;
    for item in items.iter_mut() {
        if !item.kind.carries_payload() {
            continue;
        }
        match first_by_hash.entry(item.hash) {
            Entry::Occupied(entry) => {
                item.kind = RefKind::SelfRef { source: *entry.get() };
                rewritten += 1;
            },
            Entry::Vacant(entry) => {
                entry.insert(item.offset);
            },
        }
    }
    debug!(rewritten, "self-deduplicated delta items");
    rewritten
}


#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct OverlayStatistics {
    pub items: usize,
    pub raw: usize,
    pub xdelta: usize,
    pub zeros: usize,
    pub base_mem: usize,
    pub base_disk: usize,
    pub self_ref: usize,
    pub payload_bytes: u64,
}
impl fmt::Display for OverlayStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "overlay items: {} ({} payload bytes)", self.items, self.payload_bytes)?;
        writeln!(f, "  raw pages     : {}", self.raw)?;
        writeln!(f, "  xdelta patches: {}", self.xdelta)?;
        writeln!(f, "  zero pages    : {}", self.zeros)?;
        writeln!(f, "  base memory   : {}", self.base_mem)?;
        writeln!(f, "  base disk     : {}", self.base_disk)?;
        write!(f, "  self          : {}", self.self_ref)
    }
}

pub fn statistics(items: &[DeltaItem]) -> OverlayStatistics {
    let mut stats = OverlayStatistics {
        items: items.len(),
        ..OverlayStatistics::default()
    };
    for item in items {
        stats.payload_bytes += item.kind.payload_len() as u64;
        match item.kind {
            RefKind::Raw(_) => stats.raw += 1,
            RefKind::Xdelta(_) => stats.xdelta += 1,
            RefKind::Zeros => stats.zeros += 1,
            RefKind::BaseDisk { .. } => stats.base_disk += 1,
            RefKind::BaseMem { .. } => stats.base_mem += 1,
            RefKind::SelfRef { .. } => stats.self_ref += 1,
        }
    }
    stats
}


/// Resolves every reference to concrete page bytes, leaving all items `Raw`.
/// Reference kinds resolve first; self references copy from the resolved
/// survivor afterwards, so backward references always find their data.
#[instrument(skip_all)]
pub fn resolve_references(
    items: &mut [DeltaItem],
    mut base_disk: Option<&mut BaseMemory>,
    base_mem: &mut BaseMemory,
) -> Result<(), SnapshotError> {
    for item in items.iter_mut() {
        let resolved = match &item.kind {
            RefKind::Raw(_) | RefKind::SelfRef { .. } => continue,
            RefKind::Zeros => vec![0u8; item.length as usize],
            RefKind::BaseMem { source } => base_mem.read_page(*source, item.length)?.to_vec(),
            RefKind::BaseDisk { source } => match base_disk.as_deref_mut() {
                Some(disk) => disk.read_page(*source, item.length)?.to_vec(),
                None => return Err(SnapshotError::BaseDiskRequired { offset: item.offset }),
            },
            RefKind::Xdelta(patch) => {
                let source = base_mem.read_page(item.offset, item.length)?;
                xdelta::apply(source, patch)?
            },
        };
        item.kind = RefKind::Raw(resolved);
    }

    let mut raw_by_offset: HashMap<u64, usize> = HashMap::new();
    for (index, item) in items.iter().enumerate() {
        if matches!(item.kind, RefKind::Raw(_)) {
            raw_by_offset.insert(item.offset, index);
        }
    }
    for index in 0..items.len() {
        let RefKind::SelfRef { source } = &items[index].kind else { continue };
        let Some(&source_index) = raw_by_offset.get(source) else {
            return Err(SnapshotError::CorruptOverlay { offset: items[index].offset });
        };
        let data = match &items[source_index].kind {
            RefKind::Raw(data) => data.clone(),
            _ => return Err(SnapshotError::CorruptOverlay { offset: items[index].offset }),
        };
        items[index].kind = RefKind::Raw(data);
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::hashlist::{hash_page, zero_page_hash};
    use crate::stream::PAGE_SIZE;

    fn page(fill: u8) -> Vec<u8> {
        vec![fill; PAGE_SIZE as usize]
    }

    fn item(offset: u64, kind: RefKind, hash: PageHash) -> DeltaItem {
        DeltaItem {
            offset,
            length: PAGE_SIZE as u32,
            hash,
            kind,
        }
    }

    #[test]
    fn overlay_file_round_trips() {
        let items = vec![
            item(0, RefKind::Raw(page(0x41)), hash_page(&page(0x41))),
            item(PAGE_SIZE, RefKind::Xdelta(vec![1, 2, 3]), hash_page(&page(0x42))),
            item(2 * PAGE_SIZE, RefKind::Zeros, zero_page_hash()),
            item(3 * PAGE_SIZE, RefKind::BaseMem { source: PAGE_SIZE }, hash_page(&page(0x43))),
            item(4 * PAGE_SIZE, RefKind::BaseDisk { source: 0 }, hash_page(&page(0x44))),
            item(5 * PAGE_SIZE, RefKind::SelfRef { source: 0 }, hash_page(&page(0x41))),
        ];

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mod.delta");
        write_overlay(&items, &path).unwrap();
        assert_eq!(read_overlay(&path).unwrap(), items);
    }

    #[test]
    fn truncated_overlay_is_corrupt() {
        let items = vec![item(0, RefKind::Raw(page(0x41)), hash_page(&page(0x41)))];
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mod.delta");
        write_overlay(&items, &path).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 10);
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            read_overlay(&path),
            Err(SnapshotError::CorruptOverlay { offset: 8 })
        ));
    }

    #[test]
    fn wrong_overlay_magic_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mod.delta");
        fs::write(&path, [0u8; 16]).unwrap();
        assert!(matches!(
            read_overlay(&path),
            Err(SnapshotError::CorruptOverlay { offset: 0 })
        ));
    }

    #[test]
    fn zero_pages_win_over_base_memory() {
        let zero = zero_page_hash();
        let mut items = vec![item(0, RefKind::Raw(page(0)), zero)];
        // the base also contains an all-zero page, but the zero pass ran first
        let zero_source = [HashEntry { offset: 0, length: PAGE_SIZE as u32, hash: zero }];
        let base_source = [HashEntry { offset: 7 * PAGE_SIZE as i64, length: PAGE_SIZE as u32, hash: zero }];

        assert_eq!(cross_reference(&zero_source, &mut items, CrossSource::Zeros), 1);
        assert_eq!(cross_reference(&base_source, &mut items, CrossSource::BaseMem), 0);
        assert_eq!(items[0].kind, RefKind::Zeros);
    }

    #[test]
    fn later_duplicates_become_self_references() {
        let hash = hash_page(&page(0x41));
        let mut items = vec![
            item(0, RefKind::Raw(page(0x41)), hash),
            item(PAGE_SIZE, RefKind::Raw(page(0x41)), hash),
            item(2 * PAGE_SIZE, RefKind::Raw(page(0x41)), hash),
        ];
        assert_eq!(self_references(&mut items), 2);
        assert_eq!(items[0].kind, RefKind::Raw(page(0x41)));
        assert_eq!(items[1].kind, RefKind::SelfRef { source: 0 });
        assert_eq!(items[2].kind, RefKind::SelfRef { source: 0 });
    }

    #[test]
    fn statistics_count_by_kind() {
        let items = vec![
            item(0, RefKind::Raw(page(0x41)), hash_page(&page(0x41))),
            item(PAGE_SIZE, RefKind::Xdelta(vec![9; 100]), hash_page(&page(0x42))),
            item(2 * PAGE_SIZE, RefKind::Zeros, zero_page_hash()),
        ];
        let stats = statistics(&items);
        assert_eq!(stats.items, 3);
        assert_eq!(stats.raw, 1);
        assert_eq!(stats.xdelta, 1);
        assert_eq!(stats.zeros, 1);
        assert_eq!(stats.payload_bytes, PAGE_SIZE + 100);
    }

    #[test]
    fn references_resolve_to_concrete_pages() {
        let dir = tempfile::tempdir().unwrap();
        let raw_path = dir.path().join("base.raw");
        let mut raw = page(0x10);
        raw.extend_from_slice(&page(0x20));
        fs::write(&raw_path, &raw).unwrap();
        let mut base = BaseMemory::open_raw(&raw_path).unwrap();

        let mut items = vec![
            item(0, RefKind::Raw(page(0x41)), hash_page(&page(0x41))),
            item(PAGE_SIZE, RefKind::Zeros, zero_page_hash()),
            item(2 * PAGE_SIZE, RefKind::BaseMem { source: PAGE_SIZE }, hash_page(&page(0x20))),
            item(3 * PAGE_SIZE, RefKind::SelfRef { source: 0 }, hash_page(&page(0x41))),
        ];
        resolve_references(&mut items, None, &mut base).unwrap();
        assert_eq!(items[0].kind, RefKind::Raw(page(0x41)));
        assert_eq!(items[1].kind, RefKind::Raw(page(0)));
        assert_eq!(items[2].kind, RefKind::Raw(page(0x20)));
        assert_eq!(items[3].kind, RefKind::Raw(page(0x41)));
    }

    #[test]
    fn disk_references_require_a_base_disk() {
        let dir = tempfile::tempdir().unwrap();
        let raw_path = dir.path().join("base.raw");
        fs::write(&raw_path, page(0x10)).unwrap();
        let mut base = BaseMemory::open_raw(&raw_path).unwrap();

        let mut items = vec![
            item(0, RefKind::BaseDisk { source: 0 }, hash_page(&page(0x10))),
        ];
        assert!(matches!(
            resolve_references(&mut items, None, &mut base),
            Err(SnapshotError::BaseDiskRequired { offset: 0 })
        ));
    }
}
