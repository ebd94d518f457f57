use std::fmt;
use std::io;


#[derive(Debug)]
pub enum SnapshotError {
    Io(io::Error),
    WrongWrapperMagic,
    UnsupportedHeader { body_offset: u64 },
    WrongStreamMagic { expected: u32, read: u32 },
    WrongStreamVersion { expected: u32, read: u32 },
    RamIdNotFound,
    MalformedRamHeader { offset: u64, flags: u64 },
    UnknownBlock { id: String },
    UnalignedRegion { offset: u64 },
    SuspectBaseMismatch { offset: u64, items: usize },
    Xdelta { message: String },
    CorruptMeta { offset: u64 },
    CorruptOverlay { offset: u64 },
    DeltaSizeMismatch { offset: u64, length: usize },
    BaseDiskRequired { offset: u64 },
    ReadPastEndOfRaw { offset: u64, length: u32, raw_size: u64 },
    VerificationFailed { offset: u64 },
}
impl SnapshotError {
    /// Whether the differ may fall back to a raw page encoding after this
    /// error. Everything except a failed xdelta call aborts the operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Xdelta { .. })
    }
}
impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e)
                => write!(f, "I/O error: {}", e),
            Self::WrongWrapperMagic
                => write!(f, "file does not start with the libvirt QEMU save magic"),
            Self::UnsupportedHeader { body_offset }
                => write!(f, "libvirt header body starts at {} instead of the page size", body_offset),
            Self::WrongStreamMagic { expected, read }
                => write!(f, "wrong migration stream magic (expected 0x{:08X}, read 0x{:08X})", expected, read),
            Self::WrongStreamVersion { expected, read }
                => write!(f, "wrong migration stream version (expected {}, read {})", expected, read),
            Self::RamIdNotFound
                => write!(f, "reached end of file before locating the RAM block identifier"),
            Self::MalformedRamHeader { offset, flags }
                => write!(f, "RAM section flags 0x{:X} at offset {} violate the migration contract", flags, offset),
            Self::UnknownBlock { id }
                => write!(f, "unknown or missing memory block {:?}", id),
            Self::UnalignedRegion { offset }
                => write!(f, "memory region boundary {} is not page-aligned", offset),
            Self::SuspectBaseMismatch { offset, items }
                => write!(f, "suspiciously large diff at offset {} ({} delta items); probably the wrong base snapshot", offset, items),
            Self::Xdelta { message }
                => write!(f, "xdelta3 failed: {}", message),
            Self::CorruptMeta { offset }
                => write!(f, "meta file truncated mid-record at offset {}", offset),
            Self::CorruptOverlay { offset }
                => write!(f, "overlay file invalid at offset {}", offset),
            Self::DeltaSizeMismatch { offset, length }
                => write!(f, "delta payload at offset {} has length {} instead of the page size", offset, length),
            Self::BaseDiskRequired { offset }
                => write!(f, "delta item at offset {} references the base disk but no base disk was given", offset),
            Self::ReadPastEndOfRaw { offset, length, raw_size }
                => write!(f, "read of {} bytes at offset {} past the end of the raw memory ({} bytes)", length, offset, raw_size),
            Self::VerificationFailed { offset }
                => write!(f, "recovered memory differs from the original at offset {}", offset),
        }
    }
}
impl std::error::Error for SnapshotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}
impl From<io::Error> for SnapshotError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
