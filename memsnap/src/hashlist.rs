use std::fs::{self, File};
use std::io::{BufWriter, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::byte_io::{BigEndianRead, BigEndianWrite, ByteRead, ByteWrite, ReadFromBytes, WriteToBytes};
use crate::error::SnapshotError;
use crate::stream::{self, PAGE_SIZE};


pub type PageHash = [u8; 32];

/// On-disk record size of one meta entry: i64 offset, u32 length, hash.
const META_RECORD_LEN: usize = 8 + 4 + 32;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct HashEntry {
    pub offset: i64,
    pub length: u32,
    pub hash: PageHash,
}
impl ReadFromBytes for HashEntry {
    type Error = std::io::Error;
    fn read_from_bytes<R: ByteRead>(reader: &mut R) -> Result<Self, Self::Error> {
        let offset = reader.read_i64()?;
        let length = reader.read_u32()?;
        let hash = <PageHash as ReadFromBytes>::read_from_bytes(reader)?;
        Ok(Self {
            offset,
            length,
            hash,
        })
    }
}
impl WriteToBytes for HashEntry {
    type Error = std::io::Error;
    fn write_to_bytes<W: ByteWrite>(&self, writer: &mut W) -> Result<(), Self::Error> {
        writer.write_i64(self.offset)?;
        writer.write_u32(self.length)?;
        WriteToBytes::write_to_bytes(&self.hash, writer)?;
        Ok(())
    }
}


pub fn hash_page(data: &[u8]) -> PageHash {
    Sha256::digest(data).into()
}

/// Digest of the all-zero page, the cheapest reference source.
pub fn zero_page_hash() -> PageHash {
    hash_page(&vec![0u8; PAGE_SIZE as usize])
}

/// Hashes `[start, end)` of the reader one page at a time. The region must be
/// a whole number of pages; short reads are fatal.
#[instrument(skip(reader))]
pub fn hash_region<R: Read + Seek>(reader: &mut R, start: u64, end: u64) -> Result<Vec<HashEntry>, SnapshotError> {
    let total = end - start;
    if total % PAGE_SIZE != 0 {
        return Err(SnapshotError::UnalignedRegion { offset: end });
    }

    reader.seek(SeekFrom::Start(start))?;
    let mut entries = Vec::with_capacity((total / PAGE_SIZE) as usize);
    let mut page = vec![0u8; PAGE_SIZE as usize];
    let mut offset = 0u64;
    while offset < total {
        reader.read_exact(&mut page)?;
        entries.push(HashEntry {
            offset: offset as i64,
            length: PAGE_SIZE as u32,
            hash: hash_page(&page),
        });
        offset += PAGE_SIZE;
    }
    debug!(pages = entries.len(), "hashed memory region");
    Ok(entries)
}

/// Builds the page hash index of a whole snapshot file, header pages
/// included, after validating the migration-stream layout.
pub fn hash_snapshot(path: &Path) -> Result<Vec<HashEntry>, SnapshotError> {
    let mut file = File::open(path)?;
    let (ram_end, _layout) = stream::parse_snapshot(&mut file)?;
    if ram_end % PAGE_SIZE != 0 {
        return Err(SnapshotError::UnalignedRegion { offset: ram_end });
    }
    let file_size = file.metadata()?.len();
    hash_region(&mut file, 0, file_size)
}

pub fn export_hashlist(entries: &[HashEntry], path: &Path) -> Result<(), SnapshotError> {
    let file = File::create(path)?;
    let mut writer = BigEndianWrite::new(BufWriter::new(file));
    for entry in entries {
        entry.write_to_bytes(&mut writer)?;
    }
    Ok(())
}

/// Loads a `.meta` sidecar. The format is a bare concatenation of records;
/// a partial trailing record means the file was cut short.
pub fn import_hashlist(path: &Path) -> Result<Vec<HashEntry>, SnapshotError> {
    let bytes = fs::read(path)?;
    let tail = bytes.len() % META_RECORD_LEN;
    if tail != 0 {
        return Err(SnapshotError::CorruptMeta { offset: (bytes.len() - tail) as u64 });
    }

    let mut reader = BigEndianRead::new(Cursor::new(bytes.as_slice()));
    let mut entries = Vec::with_capacity(bytes.len() / META_RECORD_LEN);
    for _ in 0..bytes.len() / META_RECORD_LEN {
        entries.push(HashEntry::read_from_bytes(&mut reader)?);
    }
    Ok(entries)
}
