use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, instrument};

use crate::base::BaseMemory;
use crate::delta::{self, DeltaItem, RefKind};
use crate::error::SnapshotError;
use crate::stream::PAGE_SIZE;


fn read_page_or_eof<R: Read>(reader: &mut R, page: &mut [u8]) -> Result<usize, SnapshotError> {
    let mut filled = 0;
    while filled < page.len() {
        let n = reader.read(&mut page[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Streams the base snapshot into `out_path`, substituting the resolved
/// delta payload wherever the overlay names a page. Items are spliced in
/// offset order; every payload must be exactly one page.
///
/// Returns the overlay map: a comma-joined `pfn:1` token per substituted
/// page.
pub fn splice_base(base_path: &Path, items: &mut [DeltaItem], out_path: &Path) -> Result<String, SnapshotError> {
    items.sort_by_key(|item| item.offset);

    let mut reader = BufReader::new(File::open(base_path)?);
    let mut writer = BufWriter::new(File::create(out_path)?);
    let mut overlay_map: Vec<String> = Vec::new();
    let mut index = 0;
    let mut offset = 0u64;
    let mut page = vec![0u8; PAGE_SIZE as usize];
    loop {
        let filled = read_page_or_eof(&mut reader, &mut page)?;
        if filled == 0 {
            break;
        }
        if filled < page.len() {
            return Err(SnapshotError::UnalignedRegion { offset: offset + filled as u64 });
        }

        if index < items.len() && items[index].offset == offset {
            let item = &items[index];
            let RefKind::Raw(data) = &item.kind else {
                return Err(SnapshotError::DeltaSizeMismatch { offset, length: item.kind.payload_len() });
            };
            if data.len() as u64 != PAGE_SIZE {
                return Err(SnapshotError::DeltaSizeMismatch { offset, length: data.len() });
            }
            writer.write_all(data)?;
            overlay_map.push(format!("{}:1", offset / PAGE_SIZE));
            index += 1;
        } else {
            writer.write_all(&page)?;
        }
        offset += PAGE_SIZE;
    }
    if index < items.len() {
        // leftover items point outside the base walk
        return Err(SnapshotError::CorruptOverlay { offset: items[index].offset });
    }
    writer.flush()?;
    debug!(substituted = overlay_map.len(), "memory recovered");
    Ok(overlay_map.join(","))
}

/// Rebuilds a modified snapshot from a base and an overlay file, optionally
/// double-checking the result against the original modified snapshot.
#[instrument(skip(base_disk_path, verify_with))]
pub fn recover_memory(
    base_path: &Path,
    base_disk_path: Option<&Path>,
    delta_path: &Path,
    out_path: &Path,
    verify_with: Option<&Path>,
) -> Result<String, SnapshotError> {
    let mut items = delta::read_overlay(delta_path)?;
    let mut base_mem = BaseMemory::open_raw(base_path)?;
    let mut base_disk = base_disk_path.map(BaseMemory::open_raw).transpose()?;
    delta::resolve_references(&mut items, base_disk.as_mut(), &mut base_mem)?;

    let overlay_map = splice_base(base_path, &mut items, out_path)?;
    if let Some(original) = verify_with {
        verify_recovered(out_path, original, &items)?;
    }
    Ok(overlay_map)
}

/// Byte-compares a reconstructed snapshot against the original modified
/// snapshot, page by page over the whole walk and once more over every
/// delta payload.
pub fn verify_recovered(recovered_path: &Path, original_path: &Path, items: &[DeltaItem]) -> Result<(), SnapshotError> {
    let mut recovered = BufReader::new(File::open(recovered_path)?);
    let mut original = BufReader::new(File::open(original_path)?);
    let mut recovered_page = vec![0u8; PAGE_SIZE as usize];
    let mut original_page = vec![0u8; PAGE_SIZE as usize];
    let mut offset = 0u64;
    loop {
        let recovered_n = read_page_or_eof(&mut recovered, &mut recovered_page)?;
        let original_n = read_page_or_eof(&mut original, &mut original_page)?;
        if recovered_n != original_n || recovered_page[..recovered_n] != original_page[..original_n] {
            return Err(SnapshotError::VerificationFailed { offset });
        }
        if recovered_n == 0 {
            break;
        }
        offset += recovered_n as u64;
    }

    let mut original = File::open(original_path)?;
    for item in items {
        let RefKind::Raw(data) = &item.kind else {
            return Err(SnapshotError::VerificationFailed { offset: item.offset });
        };
        let mut buf = vec![0u8; data.len()];
        original.seek(SeekFrom::Start(item.offset))?;
        original.read_exact(&mut buf)?;
        if &buf != data {
            return Err(SnapshotError::VerificationFailed { offset: item.offset });
        }
    }
    debug!("recovered memory verified against the original");
    Ok(())
}
