//! Address resolution across transaction, logical, and physical addressing.

use crate::err::Result;
use crate::proto::l2p_proto_lookup;
use crate::{IndexStore, Revision, TxnId};

/// Collaborator supplying the position of each revision inside its pack file.
///
/// Only consulted for physically addressed revisions that live in pack
/// files; logically addressed revisions resolve through the L2P index
/// instead.
pub trait PackOffsets: Send + Sync {
    /// Byte offset of `revision`'s serialized data within its pack file.
    fn pack_offset(&self, revision: Revision) -> Result<u64>;
}

impl IndexStore {
    /// Returns the absolute position of an item in its revision, pack, or
    /// proto revision file.
    ///
    /// With `txn_id` present the item lives in the transaction's proto
    /// revision file: under logical addressing the mapping is looked up in
    /// the L2P proto-index, otherwise `item_index` already is the position.
    /// For committed revisions the lookup goes through the L2P index, the
    /// pack-offset collaborator, or the identity mapping, depending on how
    /// the revision is addressed and stored.
    pub fn item_offset(
        &self,
        revision: Revision,
        txn_id: Option<&TxnId>,
        item_index: u64,
    ) -> Result<u64> {
        if let Some(txn) = txn_id {
            if self
                .layout()
                .uses_logical_addressing(txn.base_revision.saturating_add(1))
            {
                // The txn is going to produce a logically addressed revision,
                // so the mapping lives in the proto-index.
                l2p_proto_lookup(self.layout().l2p_proto_index_path(txn), item_index)
            } else {
                // For data in txns, the item index is the offset.
                Ok(item_index)
            }
        } else if self.layout().uses_logical_addressing(revision) {
            self.l2p_lookup(revision, item_index)
        } else if self.layout().is_packed(revision) {
            // Pack file with physical addressing.
            let pack = self
                .pack_offsets()
                .expect("pack-offset collaborator required for physically addressed pack files");
            Ok(pack.pack_offset(revision)? + item_index)
        } else {
            // For non-packed revisions with physical addressing, the item
            // index is the offset.
            Ok(item_index)
        }
    }
}
