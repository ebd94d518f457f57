use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};

use bitflags::bitflags;
use tracing::{debug, instrument, trace};

use crate::byte_io::{BigEndianRead, ByteRead, LittleEndianRead};
use crate::error::SnapshotError;


/// Granularity of hashing, diffing and reconstruction.
pub const PAGE_SIZE: u64 = 1 << 12;

// kvm-qemu migration format, version 3
pub const RAM_MAGIC: u32 = 0x5145_564D;
pub const RAM_VERSION: u32 = 0x0000_0003;
pub const RAM_ID: &[u8] = b"pc.ram";

const WRAPPER_MAGIC: &[u8; 16] = b"LibvirtQemudSave";
const WRAPPER_HEADER_LEN: u64 = 16 + 19 * 4;

// the save flags live in the low bits of each section's address word
const ADDR_FLAG_MASK: u64 = 0xfff;

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
    pub struct RamSaveFlags : u64 {
        const COMPRESS = 0x02;
        const MEM_SIZE = 0x04;
        const PAGE = 0x08;
        const EOS = 0x10;
        const CONTINUE = 0x20;
        const RAW = 0x40;
    }
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BlockInfo {
    /// Declared length of the block's raw data, a page-size multiple.
    pub length: u64,
    /// Byte offset of the block's data within the snapshot file.
    pub offset: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RamLayout {
    pub blocks: BTreeMap<String, BlockInfo>,
}
impl RamLayout {
    /// The main memory block. Every well-formed snapshot has one.
    pub fn ram_block(&self) -> Result<&BlockInfo, SnapshotError> {
        let id = String::from_utf8_lossy(RAM_ID);
        match self.blocks.get(id.as_ref()) {
            Some(block) => Ok(block),
            None => Err(SnapshotError::UnknownBlock { id: id.into_owned() }),
        }
    }
}


/// Reads the libvirt wrapper header and positions the reader at the start of
/// the QEMU migration stream. The body must begin exactly at the page size;
/// re-aligning foreign wrappers is out of scope.
pub fn seek_stream_body<R: Read + Seek>(reader: &mut R) -> Result<u64, SnapshotError> {
    let mut le = LittleEndianRead::new(reader);

    let mut magic = [0u8; 16];
    le.read_exact(&mut magic)?;
    if &magic != WRAPPER_MAGIC {
        return Err(SnapshotError::WrongWrapperMagic);
    }

    let _version = le.read_u32()?;
    let xml_length = le.read_u32()?;
    let _was_running = le.read_u32()?;
    let _compression = le.read_u32()?;
    // 15 unused header words
    le.seek(SeekFrom::Start(WRAPPER_HEADER_LEN))?;

    let body_offset = WRAPPER_HEADER_LEN + u64::from(xml_length);
    if body_offset != PAGE_SIZE {
        return Err(SnapshotError::UnsupportedHeader { body_offset });
    }
    le.seek(SeekFrom::Start(body_offset))?;
    Ok(body_offset)
}

/// Scans forward in page-sized chunks for the length-prefixed block id and
/// returns the file offset at which the id string starts. The byte before the
/// match must equal the id length; QEMU writes block ids as `{u8 len, bytes}`.
fn seek_block_id<R: Read + Seek>(reader: &mut R, id: &[u8]) -> Result<u64, SnapshotError> {
    let mut chunk_start = reader.stream_position()?;
    let mut chunk = vec![0u8; PAGE_SIZE as usize];
    loop {
        let mut filled = 0;
        while filled < chunk.len() {
            let n = reader.read(&mut chunk[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Err(SnapshotError::RamIdNotFound);
        }

        // test every candidate in the chunk, not just the first
        let mut search = 1;
        while filled >= id.len() && search + id.len() <= filled {
            match chunk[search..filled].windows(id.len()).position(|w| w == id) {
                Some(found) => {
                    let index = search + found;
                    if chunk[index - 1] == id.len() as u8 {
                        let position = chunk_start + index as u64;
                        reader.seek(SeekFrom::Start(position))?;
                        trace!(position, "block id located");
                        return Ok(position);
                    }
                    search = index + 1;
                },
                None => break,
            }
        }
        chunk_start += filled as u64;
    }
}

fn read_block_id<R: ByteRead + Read>(reader: &mut R) -> Result<String, SnapshotError> {
    let id_length = reader.read_u8()?;
    let mut id = vec![0u8; usize::from(id_length)];
    reader.read_exact(&mut id)?;
    Ok(String::from_utf8_lossy(&id).into_owned())
}

/// Walks the RAM section of a migration stream positioned at the stream body.
///
/// Returns the offset at which non-RAM trailer data begins together with the
/// per-block layout. RAM pages are never materialized here; only offsets are
/// computed.
#[instrument(skip(reader))]
pub fn read_ram_layout<R: Read + Seek>(reader: &mut R) -> Result<(u64, RamLayout), SnapshotError> {
    let mut be = BigEndianRead::new(reader);

    let magic = be.read_u32()?;
    if magic != RAM_MAGIC {
        return Err(SnapshotError::WrongStreamMagic { expected: RAM_MAGIC, read: magic });
    }
    let version = be.read_u32()?;
    if version != RAM_VERSION {
        return Err(SnapshotError::WrongStreamVersion { expected: RAM_VERSION, read: version });
    }

    // the first RAM section header is the memory-size record preceding the id
    let id_position = seek_block_id(&mut be, RAM_ID)?;
    let size_offset = id_position - (1 + 8);
    be.seek(SeekFrom::Start(size_offset))?;
    let size_word = be.read_u64()?;
    let flags = RamSaveFlags::from_bits_retain(size_word & ADDR_FLAG_MASK);
    if !flags.contains(RamSaveFlags::MEM_SIZE) {
        return Err(SnapshotError::MalformedRamHeader { offset: size_offset, flags: size_word });
    }
    let total_ram_size = size_word & !ADDR_FLAG_MASK;
    debug!(total_ram_size, "parsed memory-size header");

    // block directory: {u8 id_len, id, u64 length} until the declared lengths
    // cover the total RAM size
    let mut blocks: BTreeMap<String, BlockInfo> = BTreeMap::new();
    let mut declared = 0u64;
    while declared < total_ram_size {
        let id = read_block_id(&mut be)?;
        let length = be.read_u64()?;
        trace!(id = %id, length, "block directory entry");
        blocks.insert(id, BlockInfo { length, offset: 0 });
        declared += length;
    }

    // block bodies: flag word, id, padding to the next page boundary, data
    let mut parsed = 0u64;
    while parsed < total_ram_size {
        let word_offset = be.stream_position()?;
        let body_word = be.read_u64()?;
        let body_flags = RamSaveFlags::from_bits_retain(body_word & ADDR_FLAG_MASK);
        if body_flags.contains(RamSaveFlags::EOS) {
            return Err(SnapshotError::MalformedRamHeader { offset: word_offset, flags: body_word });
        }
        if !body_flags.contains(RamSaveFlags::RAW) {
            return Err(SnapshotError::MalformedRamHeader { offset: word_offset, flags: body_word });
        }

        let id = read_block_id(&mut be)?;
        let position = be.stream_position()?;
        // data starts at the next page boundary, a full page away when the id
        // already ends on one
        let padding = PAGE_SIZE - (position & (PAGE_SIZE - 1));
        let data_offset = position + padding;

        let block = blocks.get_mut(&id)
            .ok_or(SnapshotError::UnknownBlock { id })?;
        block.offset = data_offset;
        be.seek(SeekFrom::Start(data_offset + block.length))?;
        parsed += block.length;
    }

    let ram_end = be.stream_position()?;
    let layout = RamLayout { blocks };
    layout.ram_block()?;
    debug!(ram_end, blocks = layout.blocks.len(), "RAM section parsed");
    Ok((ram_end, layout))
}

/// Parses a complete libvirt-wrapped snapshot from the top: wrapper header,
/// stream magic, then the RAM section.
pub fn parse_snapshot<R: Read + Seek>(reader: &mut R) -> Result<(u64, RamLayout), SnapshotError> {
    seek_stream_body(reader)?;
    read_ram_layout(reader)
}
