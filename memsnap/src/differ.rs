use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::{debug, instrument, trace};

use crate::base::BaseMemory;
use crate::delta::{self, CrossSource, DeltaItem, RefKind};
use crate::error::SnapshotError;
use crate::freemem::{self, FreeMemScan};
use crate::hashlist::{hash_page, zero_page_hash, HashEntry};
use crate::stream::{self, PAGE_SIZE};
use crate::xdelta;


/// A diff bigger than this almost certainly means the supplied base is not
/// the ancestor of the modified snapshot; abort instead of filling memory.
pub const MAX_DELTA_ITEMS: usize = 1_000_000;


#[derive(Debug, Default)]
pub struct OverlayOptions<'a> {
    pub base_disk_hashes: Option<&'a [HashEntry]>,
    pub free_scan: Option<&'a FreeMemScan>,
}

#[derive(Clone, Debug)]
pub struct OverlayOutcome {
    pub delta_list: Vec<DeltaItem>,
    pub freed_pages: u64,
}


/// Walks `[0, length)` of the modified snapshot one page at a time and emits
/// a delta item for every page that differs from the base page at the same
/// index: an xdelta patch when one exists and undercuts the page size, the
/// raw page otherwise. Pages on the free list are counted and dropped.
///
/// The returned list is strictly increasing in offset.
pub fn scan_modified_pages<R: Read + Seek>(
    reader: &mut R,
    length: u64,
    base: &mut BaseMemory,
    free_pfns: Option<&HashSet<u64>>,
    max_items: usize,
) -> Result<(Vec<DeltaItem>, u64), SnapshotError> {
    if length % PAGE_SIZE != 0 {
        return Err(SnapshotError::UnalignedRegion { offset: length });
    }

    reader.seek(SeekFrom::Start(0))?;
    let mut items = Vec::new();
    let mut freed_pages = 0u64;
    let mut page = vec![0u8; PAGE_SIZE as usize];
    let mut offset = 0u64;
    while offset < length {
        reader.read_exact(&mut page)?;
        let pfn = offset / PAGE_SIZE;
        let hash = hash_page(&page);

        let base_hash = match base.hash_at(pfn) {
            Some(base_hash) => *base_hash,
            None => return Err(SnapshotError::SuspectBaseMismatch { offset, items: items.len() }),
        };
        if base_hash == hash {
            offset += PAGE_SIZE;
            continue;
        }
        if free_pfns.map_or(false, |set| set.contains(&pfn)) {
            freed_pages += 1;
            offset += PAGE_SIZE;
            continue;
        }

        let source = base.read_page(offset, PAGE_SIZE as u32)?;
        let kind = match xdelta::diff(source, &page, 2 * PAGE_SIZE as usize) {
            Ok(patch) if patch.len() < PAGE_SIZE as usize => RefKind::Xdelta(patch),
            Ok(_) => RefKind::Raw(page.clone()),
            Err(error) if error.is_recoverable() => {
                trace!(offset, %error, "xdelta unavailable for page, storing it raw");
                RefKind::Raw(page.clone())
            },
            Err(error) => return Err(error),
        };
        items.push(DeltaItem {
            offset,
            length: PAGE_SIZE as u32,
            hash,
            kind,
        });
        if items.len() > max_items {
            return Err(SnapshotError::SuspectBaseMismatch { offset, items: items.len() });
        }
        offset += PAGE_SIZE;
    }
    Ok((items, freed_pages))
}

/// Produces the overlay describing how a modified snapshot differs from its
/// base: the primary page diff, then cross-referencing against the cheapest
/// sources first (zero page, base memory, optionally base disk), then
/// deduplication within the overlay itself.
#[instrument(skip(base, options))]
pub fn create_memory_overlay(
    modified_path: &Path,
    base: &mut BaseMemory,
    options: &OverlayOptions<'_>,
) -> Result<OverlayOutcome, SnapshotError> {
    let mut file = File::open(modified_path)?;
    let (ram_end, layout) = stream::parse_snapshot(&mut file)?;
    if ram_end % PAGE_SIZE != 0 {
        return Err(SnapshotError::UnalignedRegion { offset: ram_end });
    }

    let free_pfns = match options.free_scan {
        Some(scan) => freemem::scan_free_pfns(scan, modified_path, layout.ram_block()?),
        None => None,
    };

    let length = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let (mut items, freed_pages) =
        scan_modified_pages(&mut reader, length, base, free_pfns.as_ref(), MAX_DELTA_ITEMS)?;
    debug!(items = items.len(), freed_pages, "primary base-memory diff complete");

    let zero_list = [HashEntry {
        offset: 0,
        length: PAGE_SIZE as u32,
        hash: zero_page_hash(),
    }];
    delta::cross_reference(&zero_list, &mut items, CrossSource::Zeros);
    delta::cross_reference(&base.hash_list, &mut items, CrossSource::BaseMem);
    if let Some(disk_hashes) = options.base_disk_hashes {
        delta::cross_reference(disk_hashes, &mut items, CrossSource::BaseDisk);
    }
    delta::self_references(&mut items);

    Ok(OverlayOutcome {
        delta_list: items,
        freed_pages,
    })
}
