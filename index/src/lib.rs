//! Item indexes for revision files and pack files in a versioned file store.
//!
//! Every committed revision of the store is serialized into an immutable
//! _revision file_; once enough revisions accumulate, whole shards of them
//! are bundled into a single _pack file_.  Items inside such a file (node
//! revisions, property representations, text representations) are addressed
//! either logically by `(revision, item_index)` or physically by their byte
//! offset.  This crate maintains the two indexes that translate between the
//! two schemes:
//!
//! * **log-to-phys (L2P)** — maps `(revision, item_index)` to the absolute
//!   byte offset inside the revision or pack file.
//! * **phys-to-log (P2L)** — maps a byte offset back to a descriptor of the
//!   item stored there, and enumerates the descriptors covering any
//!   contiguous region of the file.
//!
//! During a transaction, both indexes are written as append-only
//! _proto-indexes_ (see [`L2pProtoIndex`] and [`P2lProtoIndex`]).  When the
//! revision is finalized, [`create_l2p_index`] and [`create_p2l_index`]
//! consume the proto files and emit the delta-compressed, page-structured
//! final index, which is marked read-only and never mutated again.
//!
//! Lookups go through [`IndexStore`], which consults a two-tier cache
//! (header + page, see [`Caches`]) and reads missed pages through a
//! [`PackedStream`] over the on-disk index.  Sequential access patterns are
//! exploited by a bounded prefetch that populates the page cache from data
//! that is already buffered.
//!
//! This crate does not include the revision-file writer, transaction
//! machinery, or any higher-level commit/update logic; those layers own
//! concurrency control.  Readers take no locks, and every lookup uses its own
//! packed stream.

#![forbid(unused_must_use)]
#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::collapsible_if)]
#![allow(clippy::too_many_arguments)]

mod build;
mod cache;
mod err;
mod l2p;
mod p2l;
mod proto;
mod resolve;
mod spill;
mod stream;
pub mod varint;

#[cfg(test)]
mod tests;

pub use build::{create_l2p_index, create_p2l_index};
pub use cache::{Cache, Caches, MemCache, PageKey, PairKey};
pub use err::{Error, Result};
pub use l2p::{L2pHeader, L2pPage, L2pPageTableEntry};
pub use p2l::{P2lEntry, P2lHeader};
pub use proto::{l2p_proto_lookup, L2pProtoIndex, P2lProtoEntry, P2lProtoIndex};
pub use resolve::PackOffsets;
pub use spill::SpillBuf;
pub use stream::PackedStream;
pub use sync_file::{RandomAccessFile, ReadAt};

use pow2::Pow2;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Identifies a committed revision of the store.
pub type Revision = u32;

/// The reserved offset value for item slots that were never assigned.
///
/// The on-disk encoding stores every physical offset incremented by one so
/// that zero remains reserved; an unassigned slot therefore decodes to this
/// value.
pub const NO_OFFSET: u64 = u64::MAX;

/// Default block size for index I/O, in bytes.
pub const DEFAULT_BLOCK_SIZE: Pow2 = Pow2::from_exponent(16);

/// Default number of entries per log-to-phys index page.
pub const DEFAULT_L2P_PAGE_SIZE: u32 = 0x2000;

/// Default number of revision-file bytes covered per phys-to-log index page.
pub const DEFAULT_P2L_PAGE_SIZE: u64 = 0x10000;

/// Item type tags stored in phys-to-log entries.
///
/// The tag shares a compound number with the item number
/// (`compound = item_number * 8 + item_type`), so all tags are below 8.
pub mod item_type {
    /// Filler covering bytes that belong to no item.
    pub const UNUSED: u32 = 0;
    /// Text representation of a file.
    pub const FILE_REP: u32 = 1;
    /// Serialized directory listing.
    pub const DIR_REP: u32 = 2;
    /// Property representation of a file.
    pub const FILE_PROPS: u32 = 3;
    /// Property representation of a directory.
    pub const DIR_PROPS: u32 = 4;
    /// Node revision descriptor.
    pub const NODE_REV: u32 = 5;
    /// Changed-paths list of the revision.
    pub const CHANGES: u32 = 6;
}

/// Identifies an open transaction.
///
/// The display form (`<base_revision>-<number>`) is used in proto-index file
/// names.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct TxnId {
    /// The revision the transaction is based on.
    pub base_revision: Revision,
    /// Discriminator between transactions sharing a base revision.
    pub number: u64,
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base_revision, self.number)
    }
}

/// Describes where index files live and how revisions are addressed.
///
/// This is the contract with the surrounding storage layer: it never changes
/// for the lifetime of a store.
#[derive(Clone, Debug)]
pub struct Layout {
    root: PathBuf,

    /// Number of consecutive revisions bundled per pack file.
    pub shard_size: u32,

    /// First revision that is _not_ packed.  Always a multiple of
    /// `shard_size`; zero means nothing has been packed yet.
    pub packed_below: Revision,

    /// First revision addressed logically through the L2P index, or `None`
    /// if the store uses physical addressing throughout.
    pub logical_from: Option<Revision>,

    /// Block size used for index file I/O.
    pub block_size: Pow2,

    /// Maximum number of entries per L2P page.
    pub l2p_page_size: u32,

    /// Number of revision-file bytes covered per P2L page.
    pub p2l_page_size: u64,
}

impl Layout {
    /// Creates a layout rooted at `root` with default parameters: shards of
    /// 1000 revisions, nothing packed, logical addressing from revision 0.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            shard_size: 1000,
            packed_below: 0,
            logical_from: Some(0),
            block_size: DEFAULT_BLOCK_SIZE,
            l2p_page_size: DEFAULT_L2P_PAGE_SIZE,
            p2l_page_size: DEFAULT_P2L_PAGE_SIZE,
        }
    }

    /// The directory containing revision, pack, and index files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `revision` lives in a pack file.
    pub fn is_packed(&self, revision: Revision) -> bool {
        revision < self.packed_below
    }

    /// Whether `revision` is addressed logically through the L2P index.
    pub fn uses_logical_addressing(&self, revision: Revision) -> bool {
        matches!(self.logical_from, Some(first) if revision >= first)
    }

    /// The first revision of the shard containing `revision`, or `revision`
    /// itself when unpacked.  Index files and cache entries are keyed by this
    /// value.
    pub fn base_revision(&self, revision: Revision) -> Revision {
        if self.is_packed(revision) {
            revision - (revision % self.shard_size)
        } else {
            revision
        }
    }

    /// Path of the L2P index covering `revision`.
    pub fn l2p_index_path(&self, revision: Revision) -> PathBuf {
        self.index_path(revision, "l2p")
    }

    /// Path of the P2L index covering `revision`.
    pub fn p2l_index_path(&self, revision: Revision) -> PathBuf {
        self.index_path(revision, "p2l")
    }

    fn index_path(&self, revision: Revision, kind: &str) -> PathBuf {
        let base = self.base_revision(revision);
        if self.is_packed(revision) {
            self.root.join(format!("{base}.pack.{kind}"))
        } else {
            self.root.join(format!("{base}.{kind}"))
        }
    }

    /// Path of the L2P proto-index of transaction `txn`.
    pub fn l2p_proto_index_path(&self, txn: &TxnId) -> PathBuf {
        self.root.join(format!("{txn}.proto.l2p"))
    }

    /// Path of the P2L proto-index of transaction `txn`.
    pub fn p2l_proto_index_path(&self, txn: &TxnId) -> PathBuf {
        self.root.join(format!("{txn}.proto.p2l"))
    }
}

/// Read access to the indexes of a store.
///
/// Bundles the store [`Layout`] with the header and page [`Caches`].  All
/// lookups are `&self`; concurrent queries are safe as long as the cache
/// implementation honors its concurrency contract, since every lookup opens
/// its own [`PackedStream`].
pub struct IndexStore {
    layout: Layout,
    caches: Caches,
    pack_offsets: Option<Arc<dyn PackOffsets>>,
}

impl IndexStore {
    /// Creates a store with fresh in-memory caches.
    pub fn new(layout: Layout) -> Self {
        Self::with_caches(layout, Caches::default())
    }

    /// Creates a store using caller-provided caches.
    pub fn with_caches(layout: Layout, caches: Caches) -> Self {
        Self {
            layout,
            caches,
            pack_offsets: None,
        }
    }

    /// Installs the pack-file offset collaborator required to resolve
    /// physically addressed revisions inside pack files.
    pub fn set_pack_offsets(&mut self, pack_offsets: Arc<dyn PackOffsets>) {
        self.pack_offsets = Some(pack_offsets);
    }

    /// The store layout.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub(crate) fn caches(&self) -> &Caches {
        &self.caches
    }

    /// Header cache key for the index file covering `revision`.
    pub(crate) fn pair_key(&self, revision: Revision) -> PairKey {
        PairKey {
            revision: self.layout.base_revision(revision),
            is_packed: self.layout.is_packed(revision),
        }
    }

    /// Page cache key for page `page` of the index file covering `revision`.
    pub(crate) fn page_key(&self, revision: Revision, page: u64) -> PageKey {
        PageKey {
            revision: self.layout.base_revision(revision),
            is_packed: self.layout.is_packed(revision),
            page,
        }
    }

    pub(crate) fn pack_offsets(&self) -> Option<&Arc<dyn PackOffsets>> {
        self.pack_offsets.as_ref()
    }
}

/// Rounds `value` down to a multiple of `granularity`.
pub(crate) fn align_down(value: u64, granularity: Pow2) -> u64 {
    (value >> granularity.exponent()) << granularity.exponent()
}

/// Rounds `value` up to a multiple of `granularity`.
pub(crate) fn align_up(value: u64, granularity: Pow2) -> u64 {
    let mask = (1u64 << granularity.exponent()) - 1;
    (value + mask) & !mask
}
