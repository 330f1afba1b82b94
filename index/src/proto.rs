//! Proto-index files written during a transaction.
//!
//! While a transaction is open, every item appended to the proto revision
//! file is also logged into two append-only side files holding fixed-size
//! records.  At finalization, [`crate::create_l2p_index`] and
//! [`crate::create_p2l_index`] consume and delete these files.

use crate::err::{Error, Result};
use crate::{Revision, NO_OFFSET};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::mem::size_of;
use std::path::{Path, PathBuf};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, LE, U32, U64};

/// Sentinel stored in a P2L proto record whose target revision is not known
/// until the transaction's revision number is assigned.
pub(crate) const INVALID_REVISION: u32 = u32::MAX;

/// Item indexes must stay below this bound so they can index a slot array
/// while the final index is built.
pub(crate) const MAX_ITEM_INDEX: u64 = 1 << 31;

/// On-disk record of the log-to-phys proto-index.
///
/// A record with both fields zero is a "new revision" marker separating the
/// entries of consecutive revisions.  Real records store the physical offset
/// incremented by one so that zero stays reserved for the marker.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned, Copy, Clone)]
#[repr(C)]
pub(crate) struct L2pProtoRecord {
    pub offset: U64<LE>,
    pub item_index: U64<LE>,
}

static_assertions::const_assert_eq!(size_of::<L2pProtoRecord>(), 16);

impl L2pProtoRecord {
    pub(crate) fn is_revision_marker(&self) -> bool {
        self.offset.get() == 0 && self.item_index.get() == 0
    }
}

/// On-disk record of the phys-to-log proto-index.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned, Copy, Clone)]
#[repr(C)]
pub(crate) struct P2lProtoRecord {
    pub offset: U64<LE>,
    pub size: U64<LE>,
    pub item_number: U64<LE>,
    pub item_type: U32<LE>,
    pub revision: U32<LE>,
    pub fnv1_checksum: U32<LE>,
}

static_assertions::const_assert_eq!(size_of::<P2lProtoRecord>(), 36);

/// One item logged into the phys-to-log proto-index.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct P2lProtoEntry {
    /// Byte offset of the item in the revision file being built.
    pub offset: u64,
    /// Size of the item in bytes.
    pub size: u64,
    /// Item type tag, one of the [`crate::item_type`] constants.
    pub item_type: u32,
    /// Revision the item logically belongs to.  `None` means "the revision
    /// being finalized" and is patched in by the builder.
    pub revision: Option<Revision>,
    /// Item number within its revision.
    pub item_number: u64,
    /// FNV-1 checksum of the item contents, as computed by the revision-file
    /// writer.
    pub fnv1_checksum: u32,
}

/// Append handle for a log-to-phys proto-index file.
pub struct L2pProtoIndex {
    file: BufWriter<File>,
    path: PathBuf,
}

impl L2pProtoIndex {
    /// Opens (creating if necessary) the proto-index at `path` for appending.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file: BufWriter::new(file),
            path,
        })
    }

    /// Logs the mapping of `item_index` to the physical `offset` of an item.
    pub fn add_entry(&mut self, offset: u64, item_index: u64) -> Result<()> {
        // Zero is reserved for revision markers, so offsets are stored
        // incremented by one.
        let Some(stored) = offset.checked_add(1) else {
            return Err(Error::InvalidProtoEntry(format!(
                "offset 0x{offset:x} cannot be represented"
            )));
        };
        if item_index >= MAX_ITEM_INDEX {
            return Err(Error::InvalidProtoEntry(format!(
                "item index {item_index} exceeds the supported maximum"
            )));
        }
        let record = L2pProtoRecord {
            offset: U64::new(stored),
            item_index: U64::new(item_index),
        };
        self.file.write_all(record.as_bytes())?;
        Ok(())
    }

    /// Logs a "new revision" marker.  Entries following it belong to the next
    /// revision of a pack.
    pub fn add_revision(&mut self) -> Result<()> {
        let record = L2pProtoRecord {
            offset: U64::new(0),
            item_index: U64::new(0),
        };
        self.file.write_all(record.as_bytes())?;
        Ok(())
    }

    /// Flushes all buffered records to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    /// The path of the proto-index file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Append handle for a phys-to-log proto-index file.
pub struct P2lProtoIndex {
    file: BufWriter<File>,
    path: PathBuf,
}

impl P2lProtoIndex {
    /// Opens (creating if necessary) the proto-index at `path` for appending.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file: BufWriter::new(file),
            path,
        })
    }

    /// Logs one item descriptor.
    pub fn add_entry(&mut self, entry: &P2lProtoEntry) -> Result<()> {
        if entry.item_type >= 8 {
            return Err(Error::InvalidProtoEntry(format!(
                "item type {} does not fit the 3-bit tag",
                entry.item_type
            )));
        }
        if entry.item_number > (u64::MAX - 7) / 8 {
            return Err(Error::InvalidProtoEntry(format!(
                "item number {} cannot be represented",
                entry.item_number
            )));
        }
        if entry.offset.checked_add(entry.size).is_none() {
            return Err(Error::InvalidProtoEntry(format!(
                "item at 0x{:x} with size 0x{:x} exceeds the address range",
                entry.offset, entry.size
            )));
        }
        let record = P2lProtoRecord {
            offset: U64::new(entry.offset),
            size: U64::new(entry.size),
            item_number: U64::new(entry.item_number),
            item_type: U32::new(entry.item_type),
            revision: U32::new(entry.revision.unwrap_or(INVALID_REVISION)),
            fnv1_checksum: U32::new(entry.fnv1_checksum),
        };
        self.file.write_all(record.as_bytes())?;
        Ok(())
    }

    /// Flushes all buffered records to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    /// The path of the proto-index file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reads the next fixed-size record into `buf`.
///
/// Returns `false` at a clean end of file.  A partial trailing record is a
/// corruption error; `record_offset` is the file position the record started
/// at and is only used for the error message.
pub(crate) fn read_record<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    path: &Path,
    record_offset: u64,
) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == 0 {
        return Ok(false);
    }
    if filled < buf.len() {
        return Err(Error::CorruptIndex {
            file: path.to_path_buf(),
            offset: record_offset + filled as u64,
            reason: "truncated proto-index record",
        });
    }
    Ok(true)
}

/// Looks up the physical offset recorded for `item_index` in the log-to-phys
/// proto-index of an open transaction.
///
/// Proto files are unsorted and typically small at transaction end, so this
/// is a plain sequential scan.  Returns [`NO_OFFSET`] if the item was never
/// logged.
pub fn l2p_proto_lookup<P: AsRef<Path>>(path: P, item_index: u64) -> Result<u64> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let mut reader = std::io::BufReader::new(file);

    let mut raw = [0u8; size_of::<L2pProtoRecord>()];
    let mut record_offset = 0u64;
    while read_record(&mut reader, &mut raw, path, record_offset)? {
        record_offset += raw.len() as u64;
        // Cannot fail: the buffer length equals the record size.
        let record = L2pProtoRecord::read_from_bytes(&raw).unwrap();
        if record.is_revision_marker() {
            continue;
        }
        if record.item_index.get() == item_index {
            return Ok(record.offset.get() - 1);
        }
    }
    Ok(NO_OFFSET)
}
