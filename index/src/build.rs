//! Builders that turn proto-indexes into the final index files.
//!
//! At revision finalization the append-only proto files written during the
//! transaction are streamed once, delta-compressed into a [`SpillBuf`], and
//! written out behind the freshly computed tables.  The finished index is
//! marked read-only and the proto file is deleted.

use crate::err::{Error, Result};
use crate::proto::{
    read_record, L2pProtoRecord, P2lProtoRecord, INVALID_REVISION, MAX_ITEM_INDEX,
};
use crate::spill::SpillBuf;
use crate::{item_type, varint, Revision};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::mem::size_of;
use std::path::Path;
use tracing::{debug, trace_span};
use zerocopy::FromBytes;

/// Appends one packed unsigned integer to `out`.
fn write_uint<W: Write>(out: &mut W, value: u64) -> Result<()> {
    let mut buf = [0u8; varint::MAX_ENCODED_LEN];
    let len = varint::encode_uint(&mut buf, value);
    out.write_all(&buf[..len])?;
    Ok(())
}

/// Appends one packed unsigned integer to the spill buffer.
fn spill_uint(spill: &mut SpillBuf, value: u64) -> Result<()> {
    let mut buf = [0u8; varint::MAX_ENCODED_LEN];
    let len = varint::encode_uint(&mut buf, value);
    spill.write(&buf[..len])?;
    Ok(())
}

/// Appends one packed signed integer to the spill buffer.
fn spill_int(spill: &mut SpillBuf, value: i64) -> Result<()> {
    let mut buf = [0u8; varint::MAX_ENCODED_LEN];
    let len = varint::encode_int(&mut buf, value);
    spill.write(&buf[..len])?;
    Ok(())
}

/// Revokes write permission on the finished index file.
fn set_read_only(path: &Path) -> Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_readonly(true);
    fs::set_permissions(path, permissions)?;
    Ok(())
}

/// Encodes the stored slot values of one L2P page as signed zig-zag deltas.
fn encode_l2p_page(slots: &[u64], spill: &mut SpillBuf) -> Result<()> {
    let mut last_value = 0u64;
    for &value in slots {
        let diff = value.wrapping_sub(last_value) as i64;
        last_value = value;
        spill_int(spill, diff)?;
    }
    Ok(())
}

/// Slices the accumulated slots of one revision into pages and records their
/// sizes and entry counts.
fn flush_l2p_revision(
    slots: &mut Vec<u64>,
    page_size: u32,
    spill: &mut SpillBuf,
    page_counts: &mut Vec<u64>,
    page_sizes: &mut Vec<u64>,
    entry_counts: &mut Vec<u64>,
    last_page_count: &mut usize,
) -> Result<()> {
    if slots.is_empty() {
        // A revision without items still needs a page so it stays
        // addressable.
        entry_counts.push(0);
        page_sizes.push(0);
    }
    for chunk in slots.chunks(page_size as usize) {
        let size_before = spill.len();
        encode_l2p_page(chunk, spill)?;
        entry_counts.push(chunk.len() as u64);
        page_sizes.push(spill.len() - size_before);
    }
    slots.clear();

    page_counts.push((page_sizes.len() - *last_page_count) as u64);
    *last_page_count = page_sizes.len();
    Ok(())
}

/// Converts the log-to-phys proto-index at `proto_path` into the final,
/// read-only index file at `index_path`.
///
/// `first_revision` is the first (and for unpacked revisions, only) revision
/// the index covers; "new revision" markers in the proto file separate the
/// revisions of a pack.  `page_size` is the maximum number of entries per
/// page.  The proto file is deleted once the index is complete.
pub fn create_l2p_index(
    index_path: &Path,
    proto_path: &Path,
    first_revision: Revision,
    page_size: u32,
) -> Result<()> {
    let _span = trace_span!("create_l2p_index").entered();
    assert!(page_size > 0);

    let mut reader = BufReader::new(File::open(proto_path)?);

    // Temporary structures collecting the data that moves to the target file
    // in a second step.
    let mut spill = SpillBuf::new();
    let mut page_counts: Vec<u64> = Vec::new();
    let mut page_sizes: Vec<u64> = Vec::new();
    let mut entry_counts: Vec<u64> = Vec::new();
    let mut last_page_count = 0usize;

    // Item offsets of the revision being collected, keyed by item index.
    let mut slots: Vec<u64> = Vec::new();

    let mut raw = [0u8; size_of::<L2pProtoRecord>()];
    let mut record_offset = 0u64;
    let mut seen_revisions = 0usize;
    let mut first_record = true;

    loop {
        if !read_record(&mut reader, &mut raw, proto_path, record_offset)? {
            // End of the proto file closes the final revision, unless a
            // trailing marker already did.
            if !slots.is_empty() || seen_revisions == 0 {
                flush_l2p_revision(
                    &mut slots,
                    page_size,
                    &mut spill,
                    &mut page_counts,
                    &mut page_sizes,
                    &mut entry_counts,
                    &mut last_page_count,
                )?;
            }
            break;
        }
        record_offset += raw.len() as u64;

        // Cannot fail: the buffer length equals the record size.
        let record = L2pProtoRecord::read_from_bytes(&raw).unwrap();

        if record.is_revision_marker() {
            // A marker before any entry carries no revision to close.
            if !first_record {
                flush_l2p_revision(
                    &mut slots,
                    page_size,
                    &mut spill,
                    &mut page_counts,
                    &mut page_sizes,
                    &mut entry_counts,
                    &mut last_page_count,
                )?;
                seen_revisions += 1;
            }
        } else {
            let item_index = record.item_index.get();
            if item_index >= MAX_ITEM_INDEX {
                return Err(Error::InvalidProtoEntry(format!(
                    "item index {item_index} exceeds the supported maximum"
                )));
            }
            // A sparse item index legitimately leaves a hole of unused
            // slots behind.
            let index = item_index as usize;
            if index >= slots.len() {
                slots.resize(index + 1, 0);
            }
            slots[index] = record.offset.get();
        }
        first_record = false;
    }

    debug!(
        revisions = page_counts.len(),
        pages = page_sizes.len(),
        payload = spill.len(),
        "writing l2p index"
    );

    let mut out = BufWriter::new(File::create(index_path)?);

    write_uint(&mut out, first_revision as u64)?;
    write_uint(&mut out, page_size as u64)?;
    write_uint(&mut out, page_counts.len() as u64)?;
    write_uint(&mut out, page_sizes.len() as u64)?;

    // Revision table.
    for &pages in &page_counts {
        write_uint(&mut out, pages)?;
    }

    // Page table.
    for (&size, &entry_count) in page_sizes.iter().zip(entry_counts.iter()) {
        write_uint(&mut out, size)?;
        write_uint(&mut out, entry_count)?;
    }

    // Page payloads.
    spill.write_to(&mut out)?;
    out.flush()?;
    drop(out);

    set_read_only(index_path)?;
    fs::remove_file(proto_path)?;
    Ok(())
}

/// Converts the phys-to-log proto-index at `proto_path` into the final,
/// read-only index file at `index_path`.
///
/// Proto entries whose revision was still unknown at write time are patched
/// to `first_revision`.  `page_size` is the number of revision-file bytes
/// covered per page.  A synthesized "unused" entry pads the tail of the last
/// page so that every byte of the revision file is covered.  The proto file
/// is deleted once the index is complete.
pub fn create_p2l_index(
    index_path: &Path,
    proto_path: &Path,
    first_revision: Revision,
    page_size: u64,
) -> Result<()> {
    let _span = trace_span!("create_p2l_index").entered();
    assert!(page_size > 0);

    let mut reader = BufReader::new(File::open(proto_path)?);

    let mut spill = SpillBuf::new();
    let mut table_sizes: Vec<u64> = Vec::new();

    // Spill size at the start of the page being collected.
    let mut last_buffer_size = 0u64;
    let mut last_entry_end = 0u64;
    let mut last_page_end = 0u64;
    let mut last_revision = first_revision as u64;
    let mut last_compound = 0u64;
    let mut file_size = 0u64;

    let mut raw = [0u8; size_of::<P2lProtoRecord>()];
    let mut record_offset = 0u64;

    loop {
        let have_record = read_record(&mut reader, &mut raw, proto_path, record_offset)?;
        record_offset += raw.len() as u64;

        let (offset, size, entry_type, revision, item_number, fnv1_checksum);
        if have_record {
            // Cannot fail: the buffer length equals the record size.
            let record = P2lProtoRecord::read_from_bytes(&raw).unwrap();

            offset = record.offset.get();
            size = record.size.get();
            entry_type = record.item_type.get();
            item_number = record.item_number.get();
            fnv1_checksum = record.fnv1_checksum.get();

            // Fix up items created while the txn's target revision was
            // still unknown.
            revision = if record.revision.get() == INVALID_REVISION {
                first_revision
            } else {
                record.revision.get()
            };

            if entry_type >= 8 {
                return Err(Error::InvalidProtoEntry(format!(
                    "item type {entry_type} does not fit the 3-bit tag"
                )));
            }
            if item_number > (u64::MAX - 7) / 8 {
                return Err(Error::InvalidProtoEntry(format!(
                    "item number {item_number} cannot be represented"
                )));
            }
            if offset < last_entry_end {
                return Err(Error::InvalidProtoEntry(format!(
                    "item at 0x{offset:x} overlaps the previous item ending at 0x{last_entry_end:x}"
                )));
            }
        } else {
            // Synthesize an "unused" entry covering the (usually empty) tail
            // of the last page.
            file_size = last_entry_end;
            offset = last_entry_end;
            size = offset.div_ceil(page_size) * page_size - offset;
            entry_type = item_type::UNUSED;
            revision = last_revision as Revision;
            item_number = 0;
            fnv1_checksum = 0;
        }

        let entry_end = offset.checked_add(size).ok_or_else(|| {
            Error::InvalidProtoEntry(format!(
                "item at 0x{offset:x} with size 0x{size:x} exceeds the address range"
            ))
        })?;

        // End all pages the entry extends beyond.
        let mut new_page = spill.is_empty();
        while entry_end - last_page_end > page_size {
            let buffer_size = spill.len();
            table_sizes.push(buffer_size - last_buffer_size);
            last_buffer_size = buffer_size;
            last_page_end += page_size;
            new_page = true;
        }

        // The first entry of a page stores its absolute offset; all
        // following entries store only their sizes.
        if new_page {
            spill_uint(&mut spill, offset)?;
            last_revision = first_revision as u64;
            last_compound = 0;
        }

        spill_uint(&mut spill, size)?;

        let compound = item_number * 8 + entry_type as u64;
        let compound_diff = compound.wrapping_sub(last_compound) as i64;
        last_compound = compound;
        spill_int(&mut spill, compound_diff)?;

        let revision_diff = (revision as u64).wrapping_sub(last_revision) as i64;
        last_revision = revision as u64;
        spill_int(&mut spill, revision_diff)?;

        spill_uint(&mut spill, fnv1_checksum as u64)?;

        last_entry_end = entry_end;

        if !have_record {
            break;
        }
    }

    // Length of the last page description.
    table_sizes.push(spill.len() - last_buffer_size);

    debug!(
        pages = table_sizes.len(),
        file_size,
        payload = spill.len(),
        "writing p2l index"
    );

    let mut out = BufWriter::new(File::create(index_path)?);

    write_uint(&mut out, first_revision as u64)?;
    write_uint(&mut out, file_size)?;
    write_uint(&mut out, page_size)?;
    write_uint(&mut out, table_sizes.len() as u64)?;
    for &size in &table_sizes {
        write_uint(&mut out, size)?;
    }

    spill.write_to(&mut out)?;
    out.flush()?;
    drop(out);

    set_read_only(index_path)?;
    fs::remove_file(proto_path)?;
    Ok(())
}
