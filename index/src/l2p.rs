//! Log-to-phys index reader.
//!
//! An L2P index file covers one revision, or one shard of revisions when
//! packed.  It consists of a header, a revision table (pages per revision), a
//! page table (byte size and entry count per page), and the concatenated page
//! payloads.  Every page stores up to `page_size` physical offsets for
//! consecutive item indexes of one revision, delta- and zig-zag-encoded.
//!
//! Headers and pages are cached in their serialized forms (see
//! [`crate::cache`]); the serialized images are flat so that partial getters
//! can navigate them in place with zerocopy views instead of materializing
//! the full structure.

use crate::cache::PairKey;
use crate::err::{Error, Result};
use crate::stream::PackedStream;
use crate::{align_up, varint, IndexStore, Revision};
use pow2::Pow2;
use std::sync::Arc;
use tracing::{trace, trace_span};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, LE, U32, U64};

/// Prefetch window around the page just read, in bytes of the index file.
const L2P_PREFETCH_WINDOW: Pow2 = Pow2::from_exponent(16);

/// Position and size of one page within the index file.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct L2pPageTableEntry {
    /// Byte offset of the page payload within the index file.
    pub offset: u64,
    /// Byte size of the page payload.
    pub size: u32,
    /// Number of entries stored in the page.
    pub entry_count: u32,
}

/// Master data structure of a log-to-phys index: the page tables of every
/// covered revision, but not the pages themselves.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct L2pHeader {
    /// First revision covered by this index.
    pub first_revision: Revision,
    /// Maximum number of entries per page.
    pub page_size: u32,
    /// Indexes into `page_table` marking the first page of each revision;
    /// the final element marks the end of `page_table`.
    pub page_table_index: Vec<u64>,
    /// Page table covering all pages in the index.
    pub page_table: Vec<L2pPageTableEntry>,
}

impl L2pHeader {
    /// Number of revisions covered by this index.
    pub fn revision_count(&self) -> usize {
        self.page_table_index.len() - 1
    }
}

/// A single log-to-phys page: physical offsets keyed by page-local item
/// index.  Unused slots hold [`crate::NO_OFFSET`].
#[derive(Clone, Debug)]
pub struct L2pPage {
    /// Decoded offsets, one per entry.
    pub offsets: Vec<u64>,
}

impl L2pPage {
    /// The offset stored at `page_offset`, or `ItemIndexOverflow` if the page
    /// has fewer entries.  `revision` and `item_index` only label the error.
    pub fn entry(&self, page_offset: u32, revision: Revision, item_index: u64) -> Result<u64> {
        match self.offsets.get(page_offset as usize) {
            Some(&offset) => Ok(offset),
            None => Err(Error::ItemIndexOverflow {
                revision,
                item_index,
            }),
        }
    }

    /// Serializes the page for caching: the offsets as little-endian u64s.
    pub fn to_bytes(&self) -> Arc<[u8]> {
        let mut out = Vec::with_capacity(self.offsets.len() * 8);
        for &offset in &self.offsets {
            out.extend_from_slice(U64::<LE>::new(offset).as_bytes());
        }
        out.into()
    }
}

/// Fixed prefix of the serialized header form.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned, Copy, Clone)]
#[repr(C)]
struct L2pHeaderRaw {
    first_revision: U32<LE>,
    page_size: U32<LE>,
    revision_count: U32<LE>,
    page_count: U32<LE>,
}

/// Serialized form of one page-table entry.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned, Copy, Clone)]
#[repr(C)]
struct L2pTableEntryRaw {
    offset: U64<LE>,
    size: U32<LE>,
    entry_count: U32<LE>,
}

impl From<&L2pTableEntryRaw> for L2pPageTableEntry {
    fn from(raw: &L2pTableEntryRaw) -> Self {
        Self {
            offset: raw.offset.get(),
            size: raw.size.get(),
            entry_count: raw.entry_count.get(),
        }
    }
}

impl L2pHeader {
    /// Serializes the header for caching: raw prefix, page table index,
    /// page table.
    pub fn to_bytes(&self) -> Arc<[u8]> {
        let mut out =
            Vec::with_capacity(16 + self.page_table_index.len() * 8 + self.page_table.len() * 16);
        let raw = L2pHeaderRaw {
            first_revision: U32::new(self.first_revision),
            page_size: U32::new(self.page_size),
            revision_count: U32::new(self.revision_count() as u32),
            page_count: U32::new(self.page_table.len() as u32),
        };
        out.extend_from_slice(raw.as_bytes());
        for &index in &self.page_table_index {
            out.extend_from_slice(U64::<LE>::new(index).as_bytes());
        }
        for entry in &self.page_table {
            let raw = L2pTableEntryRaw {
                offset: U64::new(entry.offset),
                size: U32::new(entry.size),
                entry_count: U32::new(entry.entry_count),
            };
            out.extend_from_slice(raw.as_bytes());
        }
        out.into()
    }

    /// Full deserialization of the cache form.  Returns `None` when the bytes
    /// do not form a well-shaped header.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let (raw, index, table) = parse_raw(bytes)?;
        Some(Self {
            first_revision: raw.first_revision.get(),
            page_size: raw.page_size.get(),
            page_table_index: index.iter().map(|v| v.get()).collect(),
            page_table: table.iter().map(L2pPageTableEntry::from).collect(),
        })
    }
}

/// Splits a serialized header into its three zerocopy views.
fn parse_raw(bytes: &[u8]) -> Option<(&L2pHeaderRaw, &[U64<LE>], &[L2pTableEntryRaw])> {
    let (raw, rest) = L2pHeaderRaw::ref_from_prefix(bytes).ok()?;
    let revision_count = raw.revision_count.get() as usize;
    let page_count = raw.page_count.get() as usize;
    let (index, rest) = <[U64<LE>]>::ref_from_prefix_with_elems(rest, revision_count + 1).ok()?;
    let (table, _) = <[L2pTableEntryRaw]>::ref_from_prefix_with_elems(rest, page_count).ok()?;
    Some((raw, index, table))
}

/// Everything needed to locate and query the page covering one
/// `(revision, item_index)` pair.
#[derive(Clone, Debug)]
pub(crate) struct L2pPageInfo {
    /// Location and size of the page within the index file.
    pub entry: L2pPageTableEntry,
    /// Page index within the whole index file; this is the page cache key.
    pub file_page: u64,
    /// Offset of the item within the page.  Deliberately out of range when
    /// the item index exceeds the revision's pages, so the page query reports
    /// the overflow.
    pub page_offset: u32,
    /// First revision covered by the index file.
    pub first_revision: Revision,
}

/// Partial getter: page info for `(revision, item_index)` from a serialized
/// header.  `None` means the bytes are not a well-shaped header.
fn page_info_in(bytes: &[u8], revision: Revision, item_index: u64) -> Option<Result<L2pPageInfo>> {
    let (raw, index, table) = parse_raw(bytes)?;
    let first_revision = raw.first_revision.get();
    let page_size = raw.page_size.get();

    let not_covered = Err(Error::RevisionNotCovered { revision });
    let Some(rel) = revision.checked_sub(first_revision) else {
        return Some(not_covered);
    };
    if rel as usize >= index.len() - 1 {
        return Some(not_covered);
    }

    let first_page = index[rel as usize].get();
    let last_page = index[rel as usize + 1].get();

    let (file_page, page_offset);
    if item_index < page_size as u64 {
        // Most revisions fit well into a single page.
        file_page = first_page;
        page_offset = item_index as u32;
    } else {
        // All pages are of the same size and full, except for the last one.
        let page_no = item_index / page_size as u64;
        if last_page - first_page > page_no {
            file_page = first_page + page_no;
            page_offset = (item_index % page_size as u64) as u32;
        } else {
            // Limit the page index to the valid range and force an
            // item-index overflow further down the road.
            file_page = last_page - 1;
            page_offset = page_size + 1;
        }
    }

    let entry = table.get(file_page as usize)?;
    Some(Ok(L2pPageInfo {
        entry: entry.into(),
        file_page,
        page_offset,
        first_revision,
    }))
}

/// Partial getter: copies the page table of `revision` into the
/// caller-provided scratch `pages` and returns the file-page index of the
/// revision's first page.  `None` when the revision is not covered or the
/// bytes are not well shaped; `pages` is left cleared in that case.
fn page_table_in(
    bytes: &[u8],
    revision: Revision,
    pages: &mut Vec<L2pPageTableEntry>,
) -> Option<u64> {
    pages.clear();
    let (raw, index, table) = parse_raw(bytes)?;
    let rel = revision.checked_sub(raw.first_revision.get())? as usize;
    if rel >= index.len() - 1 {
        return None;
    }
    let first = index[rel].get() as usize;
    let last = index[rel + 1].get() as usize;
    let slice = table.get(first..last)?;
    pages.extend(slice.iter().map(L2pPageTableEntry::from));
    Some(first as u64)
}

/// Partial getter: one entry from a serialized page.  `None` means the bytes
/// are not a well-shaped page.
fn entry_in(
    bytes: &[u8],
    page_offset: u32,
    revision: Revision,
    item_index: u64,
) -> Option<Result<u64>> {
    let offsets = <[U64<LE>]>::ref_from_bytes(bytes).ok()?;
    Some(match offsets.get(page_offset as usize) {
        Some(value) => Ok(value.get()),
        None => Err(Error::ItemIndexOverflow {
            revision,
            item_index,
        }),
    })
}

/// Parses the header of an L2P index file from its packed stream.
pub(crate) fn read_l2p_header(stream: &mut PackedStream) -> Result<L2pHeader> {
    let _span = trace_span!("read_l2p_header").entered();
    stream.seek(0);

    let first_revision = stream.get_u32()?;
    let page_size = stream.get_u32()?;
    let revision_count = stream.get_u32()? as usize;
    let page_count = stream.get_u32()? as usize;

    let corrupt = |stream: &PackedStream, reason| Error::CorruptIndex {
        file: stream.path().to_path_buf(),
        offset: stream.offset(),
        reason,
    };

    if page_size == 0 {
        return Err(corrupt(stream, "page size is zero"));
    }

    // Revision table: number of pages per revision, prefix-summed into
    // indexes into the page table.
    let mut page_table_index = Vec::with_capacity(revision_count + 1);
    let mut total_pages = 0u64;
    page_table_index.push(0);
    for _ in 0..revision_count {
        let pages = stream.get()?;
        if pages == 0 {
            return Err(corrupt(stream, "revision covers no pages"));
        }
        total_pages += pages;
        page_table_index.push(total_pages);
    }
    if total_pages != page_count as u64 {
        return Err(corrupt(stream, "revision table does not match page count"));
    }

    // Page table: byte size and entry count per page.
    let mut page_table = Vec::with_capacity(page_count);
    for _ in 0..page_count {
        let size = stream.get_u32()?;
        let entry_count = stream.get_u32()?;
        if entry_count > page_size {
            return Err(corrupt(stream, "page entry count exceeds page size"));
        }
        page_table.push(L2pPageTableEntry {
            offset: 0,
            size,
            entry_count,
        });
    }

    // The page payloads start right behind the tables.
    let mut offset = stream.offset();
    for entry in page_table.iter_mut() {
        entry.offset = offset;
        offset += entry.size as u64;
    }

    trace!(
        first_revision,
        revision_count,
        page_count,
        "parsed l2p header"
    );

    Ok(L2pHeader {
        first_revision,
        page_size,
        page_table_index,
        page_table,
    })
}

/// Reads the page described by `table_entry` from the index file behind
/// `stream`.
pub(crate) fn read_l2p_page(
    stream: &mut PackedStream,
    table_entry: &L2pPageTableEntry,
) -> Result<L2pPage> {
    stream.seek(table_entry.offset);

    let mut offsets = Vec::with_capacity(table_entry.entry_count as usize);
    let mut last_value = 0u64;
    for _ in 0..table_entry.entry_count {
        let value = stream.get()?;
        last_value = last_value.wrapping_add(varint::decode_int(value) as u64);
        // Stored values carry the "+1" convention; unassigned slots decode
        // to NO_OFFSET.
        offsets.push(last_value.wrapping_sub(1));
    }

    Ok(L2pPage { offsets })
}

impl IndexStore {
    /// Returns the absolute offset in the revision or pack file of the item
    /// addressed by `(revision, item_index)`.
    ///
    /// Unassigned item indexes below the revision's page capacity yield
    /// [`crate::NO_OFFSET`]; indexes beyond it fail with
    /// [`Error::ItemIndexOverflow`].
    pub fn l2p_lookup(&self, revision: Revision, item_index: u64) -> Result<u64> {
        let _span = trace_span!("l2p_lookup").entered();
        let mut stream = None;

        let info = self.l2p_page_info(&mut stream, revision, item_index)?;

        // Try to answer from the page cache without deserializing the page.
        let page_key = self.page_key(revision, info.file_page);
        let mut out = None;
        let cached = self
            .caches()
            .l2p_pages
            .with_value(&page_key, &mut |bytes| {
                out = entry_in(bytes, info.page_offset, revision, item_index);
            });
        if cached {
            if let Some(result) = out {
                return result;
            }
        }

        // Read the relevant page (the data may already sit in the stream's
        // block buffer), cache it, and extract the result.
        let stream_ref = self.auto_open_l2p(&mut stream, revision)?;
        let page = read_l2p_page(stream_ref, &info.entry)?;
        self.caches().l2p_pages.set(page_key, page.to_bytes());
        let offset = page.entry(info.page_offset, revision, item_index)?;

        // Prefetch pages from following and preceding revisions while the
        // stream's buffered block is warm.
        self.prefetch_l2p(&mut stream, &info, revision)?;

        Ok(offset)
    }

    /// For each of `count` revisions starting at `start_revision`, the number
    /// of item slots indexed (full pages plus the last page's entry count).
    pub fn l2p_max_item_counts(&self, start_revision: Revision, count: u32) -> Result<Vec<u64>> {
        let mut stream = None;
        let mut header = self.get_l2p_header(&mut stream, start_revision)?;
        let mut result = Vec::with_capacity(count as usize);

        for revision in start_revision..start_revision + count {
            if (revision as u64)
                >= header.first_revision as u64 + header.revision_count() as u64
            {
                // This revision lives in the next index file.
                stream = None;
                header = self.get_l2p_header(&mut stream, revision)?;
            }

            let Some(rel) = revision
                .checked_sub(header.first_revision)
                .filter(|&rel| (rel as usize) < header.revision_count())
            else {
                return Err(Error::RevisionNotCovered { revision });
            };

            // In a revision with N pages, the first N-1 pages are full.
            let first = header.page_table_index[rel as usize] as usize;
            let last = header.page_table_index[rel as usize + 1] as usize;
            let full_pages = (last - first - 1) as u64;
            result.push(
                full_pages * header.page_size as u64
                    + header.page_table[last - 1].entry_count as u64,
            );
        }

        Ok(result)
    }

    /// Opens the L2P index stream covering `revision` unless already open.
    fn auto_open_l2p<'a>(
        &self,
        stream: &'a mut Option<PackedStream>,
        revision: Revision,
    ) -> Result<&'a mut PackedStream> {
        if stream.is_none() {
            *stream = Some(PackedStream::open(
                self.layout().l2p_index_path(revision),
                self.layout().block_size,
            )?);
        }
        // Some(_) was just ensured above.
        Ok(stream.as_mut().unwrap())
    }

    /// Page info for `(revision, item_index)`: from the header cache when
    /// possible, otherwise from disk (caching the header on the way).
    fn l2p_page_info(
        &self,
        stream: &mut Option<PackedStream>,
        revision: Revision,
        item_index: u64,
    ) -> Result<L2pPageInfo> {
        let key = self.pair_key(revision);
        let mut out = None;
        let cached = self.caches().l2p_headers.with_value(&key, &mut |bytes| {
            out = page_info_in(bytes, revision, item_index);
        });
        if cached {
            if let Some(result) = out {
                return result;
            }
        }

        let bytes = self.read_and_cache_l2p_header(stream, revision, key)?;
        match page_info_in(&bytes, revision, item_index) {
            Some(result) => result,
            None => Err(Error::CorruptIndex {
                file: self.layout().l2p_index_path(revision),
                offset: 0,
                reason: "header serialization is inconsistent",
            }),
        }
    }

    /// Reads the header covering `revision` from disk and caches it.
    fn read_and_cache_l2p_header(
        &self,
        stream: &mut Option<PackedStream>,
        revision: Revision,
        key: PairKey,
    ) -> Result<Arc<[u8]>> {
        let stream_ref = self.auto_open_l2p(stream, revision)?;
        let header = read_l2p_header(stream_ref)?;
        let bytes = header.to_bytes();
        self.caches().l2p_headers.set(key, bytes.clone());
        Ok(bytes)
    }

    /// The full header covering `revision`, from cache or disk.
    fn get_l2p_header(
        &self,
        stream: &mut Option<PackedStream>,
        revision: Revision,
    ) -> Result<L2pHeader> {
        let key = self.pair_key(revision);
        if let Some(bytes) = self.caches().l2p_headers.get(&key) {
            if let Some(header) = L2pHeader::from_bytes(&bytes) {
                return Ok(header);
            }
        }
        let bytes = self.read_and_cache_l2p_header(stream, revision, key)?;
        L2pHeader::from_bytes(&bytes).ok_or_else(|| Error::CorruptIndex {
            file: self.layout().l2p_index_path(revision),
            offset: 0,
            reason: "header serialization is inconsistent",
        })
    }

    /// Populates the page cache with pages near the one just read.
    ///
    /// The window is a 64 KiB aligned range around the current page in the
    /// index file; the walk covers the queried revision to the end of the
    /// shard, then the revisions before it.  Page tables are taken from the
    /// header cache only: a missing table would force a disk read, which
    /// defeats the latency goal of prefetching.
    fn prefetch_l2p(
        &self,
        stream: &mut Option<PackedStream>,
        info: &L2pPageInfo,
        revision: Revision,
    ) -> Result<()> {
        let max_offset = align_up(
            info.entry.offset + info.entry.size as u64,
            L2P_PREFETCH_WINDOW,
        );
        let min_offset = max_offset.saturating_sub(1u64 << L2P_PREFETCH_WINDOW.exponent());

        let last_revision = info.first_revision as u64
            + if self.layout().is_packed(revision) {
                self.layout().shard_size as u64
            } else {
                1
            };

        // Scratch page table, reused across revisions.
        let mut pages = Vec::with_capacity(16);

        let mut prefetch_revision = revision as u64;
        while prefetch_revision < last_revision {
            let excluded = (prefetch_revision == revision as u64).then_some(info.file_page);
            let end = self.prefetch_l2p_pages(
                stream,
                info.first_revision,
                prefetch_revision as Revision,
                &mut pages,
                excluded,
                min_offset,
                max_offset,
            )?;
            if end {
                break;
            }
            prefetch_revision += 1;
        }

        let mut prefetch_revision = revision;
        while prefetch_revision > info.first_revision {
            prefetch_revision -= 1;
            let end = self.prefetch_l2p_pages(
                stream,
                info.first_revision,
                prefetch_revision,
                &mut pages,
                None,
                min_offset,
                max_offset,
            )?;
            if end {
                break;
            }
        }

        Ok(())
    }

    /// Prefetches the pages of one revision.  Returns `true` when the caller
    /// should stop walking in this direction: the revision's page table is
    /// not cache-resident, a page fell outside the window, or a page was
    /// already cached.
    fn prefetch_l2p_pages(
        &self,
        stream: &mut Option<PackedStream>,
        first_revision: Revision,
        revision: Revision,
        pages: &mut Vec<L2pPageTableEntry>,
        excluded_page: Option<u64>,
        min_offset: u64,
        max_offset: u64,
    ) -> Result<bool> {
        let key = self.pair_key(revision);
        let mut first_page = None;
        self.caches().l2p_headers.with_value(&key, &mut |bytes| {
            first_page = page_table_in(bytes, revision, pages);
        });
        let Some(first_page) = first_page else {
            // Not cached; we cannot continue without hitting the disk again.
            return Ok(true);
        };

        for (i, entry) in pages.iter().enumerate() {
            let file_page = first_page + i as u64;
            if excluded_page == Some(file_page) {
                continue;
            }

            // Skip pages outside the specified index file range.
            if entry.offset < min_offset || entry.offset + entry.size as u64 > max_offset {
                return Ok(true);
            }

            let page_key = self.page_key(revision, file_page);
            if self.caches().l2p_pages.has_key(&page_key) {
                return Ok(true);
            }

            // Not in the cache: read from the stream (the data is usually
            // already in its block buffer) and cache the result.
            let stream_ref = self.auto_open_l2p(stream, first_revision)?;
            let page = read_l2p_page(stream_ref, entry)?;
            self.caches().l2p_pages.set(page_key, page.to_bytes());
            trace!(revision, file_page, "prefetched l2p page");
        }

        Ok(false)
    }
}
