//! Phys-to-log index reader.
//!
//! A P2L index file describes the revision or pack file as a sequence of
//! fixed-size windows ("clusters") of `page_size` bytes each.  The index page
//! for a window lists the descriptors of all items starting inside it; an
//! item belongs to the page containing its start offset even when it extends
//! into following windows.  Each page payload opens with the absolute file
//! offset of its first item, followed per item by its size, a signed delta of
//! the compound item number, a signed revision delta, and the FNV-1 checksum.

use crate::cache::PairKey;
use crate::err::{Error, Result};
use crate::stream::PackedStream;
use crate::{align_up, IndexStore, Revision};
use std::sync::Arc;
use tracing::{trace, trace_span};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, LE, U32, U64};

/// Initial value of the prefetch "leaking bucket": each cache hit drains it,
/// each miss refills it, and prefetching in a direction stops when it runs
/// dry.  Keeps prefetch useful when parts of the window are already cached
/// without re-reading a mostly-cached region.
const P2L_PREFETCH_BUCKET: i32 = 4;

/// Descriptor of one item in a revision or pack file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct P2lEntry {
    /// Byte offset of the item within the revision or pack file.
    pub offset: u64,
    /// Size of the item in bytes.
    pub size: u64,
    /// Item type tag, one of the [`crate::item_type`] constants.
    pub item_type: u32,
    /// Revision the item belongs to.
    pub revision: Revision,
    /// Item number within its revision.
    pub item_number: u64,
    /// FNV-1 checksum of the item contents.
    pub fnv1_checksum: u32,
}

/// Master data structure of a phys-to-log index: one entry per page plus the
/// global file geometry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct P2lHeader {
    /// First revision covered by the index (and the revision file).
    pub first_revision: Revision,
    /// Number of revision-file bytes covered by each page.
    pub page_size: u64,
    /// Number of bytes in the revision file.
    pub file_size: u64,
    /// Byte offsets of the page descriptions within the index file, with a
    /// sentinel at index `page_count` marking the end of the last page.
    pub offsets: Vec<u64>,
}

impl P2lHeader {
    /// Number of pages in this index.
    pub fn page_count(&self) -> usize {
        self.offsets.len() - 1
    }
}

/// Fixed prefix of the serialized header form.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned, Copy, Clone)]
#[repr(C)]
struct P2lHeaderRaw {
    first_revision: U32<LE>,
    page_size: U64<LE>,
    page_count: U64<LE>,
    file_size: U64<LE>,
}

/// Serialized form of one item descriptor.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned, Copy, Clone)]
#[repr(C)]
struct P2lEntryRaw {
    offset: U64<LE>,
    size: U64<LE>,
    item_number: U64<LE>,
    item_type: U32<LE>,
    revision: U32<LE>,
    fnv1_checksum: U32<LE>,
}

impl From<&P2lEntryRaw> for P2lEntry {
    fn from(raw: &P2lEntryRaw) -> Self {
        Self {
            offset: raw.offset.get(),
            size: raw.size.get(),
            item_type: raw.item_type.get(),
            revision: raw.revision.get(),
            item_number: raw.item_number.get(),
            fnv1_checksum: raw.fnv1_checksum.get(),
        }
    }
}

impl P2lHeader {
    /// Serializes the header for caching: raw prefix plus the page offsets.
    pub fn to_bytes(&self) -> Arc<[u8]> {
        let mut out = Vec::with_capacity(28 + self.offsets.len() * 8);
        let raw = P2lHeaderRaw {
            first_revision: U32::new(self.first_revision),
            page_size: U64::new(self.page_size),
            page_count: U64::new(self.page_count() as u64),
            file_size: U64::new(self.file_size),
        };
        out.extend_from_slice(raw.as_bytes());
        for &offset in &self.offsets {
            out.extend_from_slice(U64::<LE>::new(offset).as_bytes());
        }
        out.into()
    }

    /// Full deserialization of the cache form.  Returns `None` when the bytes
    /// do not form a well-shaped header.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let (raw, offsets) = parse_raw(bytes)?;
        Some(Self {
            first_revision: raw.first_revision.get(),
            page_size: raw.page_size.get(),
            file_size: raw.file_size.get(),
            offsets: offsets.iter().map(|v| v.get()).collect(),
        })
    }
}

/// Splits a serialized header into its zerocopy views.
fn parse_raw(bytes: &[u8]) -> Option<(&P2lHeaderRaw, &[U64<LE>])> {
    let (raw, rest) = P2lHeaderRaw::ref_from_prefix(bytes).ok()?;
    let page_count = usize::try_from(raw.page_count.get()).ok()?;
    let (offsets, _) = <[U64<LE>]>::ref_from_prefix_with_elems(rest, page_count + 1).ok()?;
    Some((raw, offsets))
}

/// Everything needed to read the index page covering one file offset.
#[derive(Clone, Debug)]
pub(crate) struct P2lPageInfo {
    /// Page containing the queried offset; equals `page_count` when the
    /// offset lies beyond the indexed range.
    pub page_no: u64,
    /// First revision covered by the index.
    pub first_revision: Revision,
    /// Byte offset of this page's description within the index file.
    pub start_offset: u64,
    /// Byte offset of the following page's description.
    pub next_offset: u64,
    /// Start of the page's window within the revision file.
    pub page_start: u64,
    /// Total number of pages indexed.
    pub page_count: u64,
    /// Size of each window in the revision file; zero when out of range.
    pub page_size: u64,
}

/// Partial getter: page info for a revision-file `offset` from a serialized
/// header.  `None` means the bytes are not a well-shaped header.
fn page_info_in(bytes: &[u8], offset: u64) -> Option<P2lPageInfo> {
    let (raw, offsets) = parse_raw(bytes)?;
    let page_size = raw.page_size.get();
    let page_count = raw.page_count.get();
    if page_size == 0 {
        return None;
    }

    // An out-of-bounds offset yields a zero-sized empty page right behind
    // the last page; the caller turns that into an error.
    let (page_no, start_offset, next_offset, size);
    if offset / page_size < page_count {
        page_no = offset / page_size;
        start_offset = offsets[page_no as usize].get();
        next_offset = offsets[page_no as usize + 1].get();
        size = page_size;
    } else {
        page_no = page_count;
        start_offset = offsets[page_no as usize].get();
        next_offset = start_offset;
        size = 0;
    }

    Some(P2lPageInfo {
        page_no,
        first_revision: raw.first_revision.get(),
        start_offset,
        next_offset,
        page_start: page_no * page_size,
        page_count,
        page_size: size,
    })
}

/// Partial getter: the size of the indexed revision file.
fn file_size_in(bytes: &[u8]) -> Option<u64> {
    let (raw, _) = P2lHeaderRaw::ref_from_prefix(bytes).ok()?;
    Some(raw.file_size.get())
}

/// Partial getter: the entry starting exactly at `offset`, if any.  The outer
/// `None` means the bytes are not a well-shaped page.
fn entry_at_in(bytes: &[u8], offset: u64) -> Option<Option<P2lEntry>> {
    let entries = <[P2lEntryRaw]>::ref_from_bytes(bytes).ok()?;
    let found = entries
        .binary_search_by(|raw| raw.offset.get().cmp(&offset))
        .ok()
        .map(|i| P2lEntry::from(&entries[i]));
    Some(found)
}

/// Serializes a page for caching.
fn page_to_bytes(entries: &[P2lEntry]) -> Arc<[u8]> {
    let mut out = Vec::with_capacity(entries.len() * 36);
    for entry in entries {
        let raw = P2lEntryRaw {
            offset: U64::new(entry.offset),
            size: U64::new(entry.size),
            item_number: U64::new(entry.item_number),
            item_type: U32::new(entry.item_type),
            revision: U32::new(entry.revision),
            fnv1_checksum: U32::new(entry.fnv1_checksum),
        };
        out.extend_from_slice(raw.as_bytes());
    }
    out.into()
}

/// Full deserialization of a cached page.
fn page_from_bytes(bytes: &[u8]) -> Option<Vec<P2lEntry>> {
    let entries = <[P2lEntryRaw]>::ref_from_bytes(bytes).ok()?;
    Some(entries.iter().map(P2lEntry::from).collect())
}

/// Finds the entry starting exactly at `offset` in a sorted entry list.
fn find_exact(entries: &[P2lEntry], offset: u64) -> Option<P2lEntry> {
    entries
        .binary_search_by(|entry| entry.offset.cmp(&offset))
        .ok()
        .map(|i| entries[i].clone())
}

/// Parses the header of a P2L index file from its packed stream.
pub(crate) fn read_p2l_header(stream: &mut PackedStream) -> Result<P2lHeader> {
    let _span = trace_span!("read_p2l_header").entered();
    stream.seek(0);

    let first_revision = stream.get_u32()?;
    let file_size = stream.get()?;
    let page_size = stream.get()?;
    let page_count = stream.get()?;

    if page_size == 0 {
        return Err(Error::CorruptIndex {
            file: stream.path().to_path_buf(),
            offset: stream.offset(),
            reason: "page size is zero",
        });
    }

    // Page sizes prefix-sum into description offsets …
    let page_count = usize::try_from(page_count).map_err(|_| Error::CorruptIndex {
        file: stream.path().to_path_buf(),
        offset: stream.offset(),
        reason: "header field out of range",
    })?;
    let mut offsets = Vec::with_capacity(page_count + 1);
    offsets.push(0u64);
    for i in 0..page_count {
        let size = stream.get()?;
        offsets.push(offsets[i] + size);
    }

    // … shifted past the header.
    let header_end = stream.offset();
    for offset in offsets.iter_mut() {
        *offset += header_end;
    }

    trace!(first_revision, file_size, page_count, "parsed p2l header");

    Ok(P2lHeader {
        first_revision,
        page_size,
        file_size,
        offsets,
    })
}

/// Reads one item descriptor from the page payload, running the revision and
/// compound sums forward and advancing `item_offset` by the item's size.
fn read_entry(
    stream: &mut PackedStream,
    item_offset: &mut u64,
    last_revision: &mut u64,
    last_compound: &mut u64,
    result: &mut Vec<P2lEntry>,
) -> Result<()> {
    let corrupt = |stream: &PackedStream, reason| Error::CorruptIndex {
        file: stream.path().to_path_buf(),
        offset: stream.offset(),
        reason,
    };

    let size = stream.get()?;

    let compound_delta = crate::varint::decode_int(stream.get()?);
    *last_compound = last_compound.wrapping_add(compound_delta as u64);
    let item_type = (*last_compound & 7) as u32;
    let item_number = *last_compound / 8;

    let revision_delta = crate::varint::decode_int(stream.get()?);
    *last_revision = last_revision.wrapping_add(revision_delta as u64);
    let revision = u32::try_from(*last_revision)
        .map_err(|_| corrupt(stream, "revision out of range"))?;

    let fnv1_checksum = stream.get_u32()?;

    let offset = *item_offset;
    *item_offset = offset
        .checked_add(size)
        .ok_or_else(|| corrupt(stream, "item size overflows the file"))?;

    result.push(P2lEntry {
        offset,
        size,
        item_type,
        revision,
        item_number,
        fnv1_checksum,
    });
    Ok(())
}

/// Reads the descriptors for the cluster described by `info`.
///
/// Reads entries until the stream reaches the next page's description; if the
/// last item still ends below the cluster end, the first entry of the
/// following page is read as well so the caller sees every item overlapping
/// the cluster.
pub(crate) fn read_p2l_page(stream: &mut PackedStream, info: &P2lPageInfo) -> Result<Vec<P2lEntry>> {
    stream.seek(info.start_offset);

    let mut result = Vec::new();

    // The first entry stores its absolute offset; all following entries store
    // only their sizes.
    let mut item_offset = stream.get()?;
    let mut last_revision = info.first_revision as u64;
    let mut last_compound = 0u64;

    loop {
        read_entry(
            stream,
            &mut item_offset,
            &mut last_revision,
            &mut last_compound,
            &mut result,
        )?;
        if stream.offset() >= info.next_offset {
            break;
        }
    }

    // If we have not covered the cluster end yet, read the first entry of
    // the next page.
    if item_offset < info.page_start + info.page_size {
        let mut item_offset = stream.get()?;
        let mut last_revision = info.first_revision as u64;
        let mut last_compound = 0u64;
        read_entry(
            stream,
            &mut item_offset,
            &mut last_revision,
            &mut last_compound,
            &mut result,
        )?;
    }

    Ok(result)
}

impl IndexStore {
    /// Returns the descriptors of all items overlapping the cluster that
    /// contains revision-file `offset`, in ascending offset order.
    pub fn p2l_page_lookup(&self, revision: Revision, offset: u64) -> Result<Vec<P2lEntry>> {
        let _span = trace_span!("p2l_page_lookup").entered();
        let mut stream = None;
        self.p2l_index_lookup(&mut stream, revision, offset)
    }

    /// Returns the descriptor of the item starting exactly at revision-file
    /// `offset`, or `None` if no item starts there.
    pub fn p2l_entry_lookup(
        &self,
        revision: Revision,
        offset: u64,
    ) -> Result<Option<P2lEntry>> {
        let _span = trace_span!("p2l_entry_lookup").entered();
        let mut stream = None;

        let (_, key) = self.get_p2l_keys(&mut stream, revision, offset)?;

        // Try a partial read against the cached page first.
        let mut out = None;
        let cached = self.caches().p2l_pages.with_value(&key, &mut |bytes| {
            out = entry_at_in(bytes, offset);
        });
        if cached {
            if let Some(found) = out {
                return Ok(found);
            }
        }

        // Fall back to a standard page lookup, which also prefetches to
        // speed up future queries.
        let entries = self.p2l_index_lookup(&mut stream, revision, offset)?;
        Ok(find_exact(&entries, offset))
    }

    /// The first offset not covered by the P2L index of `revision`, i.e. the
    /// size of the indexed revision or pack file.
    pub fn p2l_max_offset(&self, revision: Revision) -> Result<u64> {
        let key = self.pair_key(revision);
        let mut out = None;
        self.caches().p2l_headers.with_value(&key, &mut |bytes| {
            out = file_size_in(bytes);
        });
        if let Some(size) = out {
            return Ok(size);
        }

        let mut stream = None;
        let bytes = self.read_and_cache_p2l_header(&mut stream, revision, key)?;
        file_size_in(&bytes).ok_or_else(|| Error::CorruptIndex {
            file: self.layout().p2l_index_path(revision),
            offset: 0,
            reason: "header serialization is inconsistent",
        })
    }

    /// Opens the P2L index stream covering `revision` unless already open.
    fn auto_open_p2l<'a>(
        &self,
        stream: &'a mut Option<PackedStream>,
        revision: Revision,
    ) -> Result<&'a mut PackedStream> {
        if stream.is_none() {
            *stream = Some(PackedStream::open(
                self.layout().p2l_index_path(revision),
                self.layout().block_size,
            )?);
        }
        // Some(_) was just ensured above.
        Ok(stream.as_mut().unwrap())
    }

    /// Reads the header covering `revision` from disk and caches it.
    fn read_and_cache_p2l_header(
        &self,
        stream: &mut Option<PackedStream>,
        revision: Revision,
        key: PairKey,
    ) -> Result<Arc<[u8]>> {
        let stream_ref = self.auto_open_p2l(stream, revision)?;
        let header = read_p2l_header(stream_ref)?;
        let bytes = header.to_bytes();
        self.caches().p2l_headers.set(key, bytes.clone());
        Ok(bytes)
    }

    /// Page info for the cluster containing `offset`, from the header cache
    /// when possible.
    fn p2l_page_info(
        &self,
        stream: &mut Option<PackedStream>,
        revision: Revision,
        offset: u64,
    ) -> Result<P2lPageInfo> {
        let key = self.pair_key(revision);
        let mut out = None;
        let cached = self.caches().p2l_headers.with_value(&key, &mut |bytes| {
            out = page_info_in(bytes, offset);
        });
        if cached {
            if let Some(info) = out {
                return Ok(info);
            }
        }

        let bytes = self.read_and_cache_p2l_header(stream, revision, key)?;
        page_info_in(&bytes, offset).ok_or_else(|| Error::CorruptIndex {
            file: self.layout().p2l_index_path(revision),
            offset: 0,
            reason: "header serialization is inconsistent",
        })
    }

    /// Page info plus the page cache key for `offset`, failing with
    /// `OffsetTooLarge` when the offset lies beyond the indexed range.
    fn get_p2l_keys(
        &self,
        stream: &mut Option<PackedStream>,
        revision: Revision,
        offset: u64,
    ) -> Result<(P2lPageInfo, crate::cache::PageKey)> {
        let info = self.p2l_page_info(stream, revision, offset)?;
        if info.page_no >= info.page_count {
            return Err(Error::OffsetTooLarge { revision, offset });
        }
        let key = self.page_key(revision, info.page_no);
        Ok((info, key))
    }

    /// Body of the page lookup: cache probe, miss path, and symmetric
    /// prefetch around the requested page.
    fn p2l_index_lookup(
        &self,
        stream: &mut Option<PackedStream>,
        revision: Revision,
        offset: u64,
    ) -> Result<Vec<P2lEntry>> {
        let (info, key) = self.get_p2l_keys(stream, revision, offset)?;

        if let Some(bytes) = self.caches().p2l_pages.get(&key) {
            if let Some(entries) = page_from_bytes(&bytes) {
                return Ok(entries);
            }
        }

        // We read index data in larger blocks, so the stream buffer probably
        // holds more page data than requested.  Parse and cache the window
        // around the request until we run into pages that are already cached
        // or leave the buffered range.
        let block_size = self.layout().block_size;
        let max_offset = align_up(info.next_offset, block_size);
        let min_offset =
            align_up(info.start_offset, block_size).saturating_sub(1u64 << block_size.exponent());

        // Preceding pages.
        let mut bucket = P2L_PREFETCH_BUCKET;
        let mut prefetch_offset = info.page_start;
        while info.page_size > 0 && prefetch_offset >= info.page_size {
            prefetch_offset -= info.page_size;
            let (end, _) =
                self.prefetch_p2l_page(stream, info.first_revision, prefetch_offset, min_offset, &mut bucket)?;
            if end {
                break;
            }
        }

        // The requested page itself.
        let stream_ref = self.auto_open_p2l(stream, revision)?;
        let entries = read_p2l_page(stream_ref, &info)?;
        self.caches().p2l_pages.set(key, page_to_bytes(&entries));

        // Following pages.
        let mut bucket = P2L_PREFETCH_BUCKET;
        let mut prefetch = info.clone();
        let mut prefetch_offset = info.page_start;
        while prefetch.next_offset < max_offset && prefetch.page_no + 1 < prefetch.page_count {
            prefetch_offset += prefetch.page_size;
            let (end, next_info) =
                self.prefetch_p2l_page(stream, info.first_revision, prefetch_offset, min_offset, &mut bucket)?;
            prefetch = next_info;
            if end {
                break;
            }
        }

        Ok(entries)
    }

    /// Prefetches the page containing revision-file `offset` unless it is
    /// already cached.  Returns whether the caller should stop prefetching in
    /// this direction, plus the page info it worked from.
    fn prefetch_p2l_page(
        &self,
        stream: &mut Option<PackedStream>,
        first_revision: Revision,
        offset: u64,
        min_offset: u64,
        bucket: &mut i32,
    ) -> Result<(bool, P2lPageInfo)> {
        let info = self.p2l_page_info(stream, first_revision, offset)?;
        if info.start_offset < min_offset {
            // Page outside the window.
            return Ok((true, info));
        }

        let key = self.page_key(first_revision, info.page_no);
        if self.caches().p2l_pages.has_key(&key) {
            // Stop once most pages turn out to be cached already.
            *bucket -= 1;
            return Ok((*bucket <= 0, info));
        }
        *bucket += 1;

        let stream_ref = self.auto_open_p2l(stream, first_revision)?;
        let entries = read_p2l_page(stream_ref, &info)?;
        self.caches().p2l_pages.set(key, page_to_bytes(&entries));
        trace!(first_revision, page = info.page_no, "prefetched p2l page");

        Ok((false, info))
    }
}
