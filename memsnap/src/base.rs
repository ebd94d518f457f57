use std::fmt;
use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use tracing::debug;

use crate::error::SnapshotError;
use crate::hashlist::{self, HashEntry, PageHash};


/// A previously captured snapshot together with its page hash index. The raw
/// file is mapped read-only, lazily, on the first page read.
pub struct BaseMemory {
    raw_file: File,
    raw_mmap: Option<Mmap>,
    pub hash_list: Vec<HashEntry>,
}
impl fmt::Debug for BaseMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseMemory")
            .field("mapped", &self.raw_mmap.is_some())
            .field("pages", &self.hash_list.len())
            .finish()
    }
}
impl BaseMemory {
    /// Opens a base for raw page reads only, without a hash index. Used on
    /// the reconstruction path, where only page data is needed.
    pub fn open_raw(raw_path: &Path) -> Result<Self, SnapshotError> {
        let raw_file = File::open(raw_path)?;
        Ok(Self {
            raw_file,
            raw_mmap: None,
            hash_list: Vec::new(),
        })
    }

    /// Rebuilds the base memory structure from an existing `.meta` sidecar
    /// and the raw snapshot it was computed from.
    pub fn import_from_meta(meta_path: &Path, raw_path: &Path) -> Result<Self, SnapshotError> {
        let hash_list = hashlist::import_hashlist(meta_path)?;
        let raw_file = File::open(raw_path)?;
        debug!(pages = hash_list.len(), "imported base hash index");
        Ok(Self {
            raw_file,
            raw_mmap: None,
            hash_list,
        })
    }

    /// A borrowed slice of the raw memory at `offset`.
    pub fn read_page(&mut self, offset: u64, length: u32) -> Result<&[u8], SnapshotError> {
        if self.raw_mmap.is_none() {
            self.raw_mmap = Some(unsafe { Mmap::map(&self.raw_file)? });
        }
        let mmap = self.raw_mmap.as_ref().unwrap();
        let end = offset + u64::from(length);
        if end > mmap.len() as u64 {
            return Err(SnapshotError::ReadPastEndOfRaw {
                offset,
                length,
                raw_size: mmap.len() as u64,
            });
        }
        Ok(&mmap[offset as usize..end as usize])
    }

    pub fn hash_at(&self, page_index: u64) -> Option<&PageHash> {
        self.hash_list.get(page_index as usize).map(|entry| &entry.hash)
    }

    pub fn page_count(&self) -> u64 {
        self.hash_list.len() as u64
    }
}
