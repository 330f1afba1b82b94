use crate::l2p::read_l2p_header;
use crate::p2l::read_p2l_header;
use crate::*;
use pow2::Pow2;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// In-memory stand-in for an index file.
#[derive(Default)]
struct TestFile {
    data: Mutex<Vec<u8>>,
}

impl TestFile {
    fn new(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }
}

impl ReadAt for TestFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let data = self.data.lock().unwrap();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }
}

/// Encodes `values` the way index files store unsigned integers.
fn packed_bytes(values: &[u64]) -> Vec<u8> {
    let mut out = Vec::new();
    for &value in values {
        varint::encode_uint_into(&mut out, value);
    }
    out
}

fn small_layout(root: &Path) -> Layout {
    let mut layout = Layout::new(root);
    layout.l2p_page_size = 4;
    layout.p2l_page_size = 400;
    layout
}

// ---------------------------------------------------------------------------
// packed number stream
// ---------------------------------------------------------------------------

#[test]
fn stream_reads_values_in_order() {
    let values: Vec<u64> = (0..200u64)
        .map(|i| i.wrapping_mul(0x9e37_79b9).rotate_left(i as u32 % 17))
        .collect();
    let file = TestFile::new(packed_bytes(&values));
    let mut stream = PackedStream::from_file(file, "test", Pow2::from_exponent(4));

    for &value in &values {
        assert_eq!(stream.get().unwrap(), value);
    }
    assert!(matches!(
        stream.get(),
        Err(Error::UnexpectedEof { .. })
    ));
}

#[test]
fn stream_seek_is_idempotent() {
    let values: Vec<u64> = (0..64u64).map(|i| i * i * 37 + i).collect();
    let bytes = packed_bytes(&values);

    let file = TestFile::new(bytes.clone());
    let mut stream = PackedStream::from_file(file, "test", Pow2::from_exponent(4));

    for value in &values[..20] {
        assert_eq!(stream.get().unwrap(), *value);
    }
    let pos = stream.offset();

    stream.seek(0);
    for value in &values[..20] {
        assert_eq!(stream.get().unwrap(), *value);
    }

    stream.seek(pos);
    let next = stream.get().unwrap();

    let mut fresh = PackedStream::from_file(TestFile::new(bytes), "test", Pow2::from_exponent(4));
    for _ in 0..20 {
        fresh.get().unwrap();
    }
    assert_eq!(next, fresh.get().unwrap());
    assert_eq!(next, values[20]);
}

#[test]
fn stream_seek_within_buffer() {
    let values: Vec<u64> = (1..20u64).collect();
    let bytes = packed_bytes(&values);
    let mut stream =
        PackedStream::from_file(TestFile::new(bytes), "test", Pow2::from_exponent(16));

    // Buffer everything, then jump back to the third value (one byte each).
    for _ in 0..10 {
        stream.get().unwrap();
    }
    stream.seek(2);
    assert_eq!(stream.get().unwrap(), values[2]);
    assert_eq!(stream.offset(), 3);
}

#[test]
fn stream_rejects_oversized_number() {
    let mut bytes = vec![0x80u8; 11];
    bytes.push(0x01);
    let mut stream =
        PackedStream::from_file(TestFile::new(bytes), "test", Pow2::from_exponent(16));
    match stream.get() {
        Err(Error::CorruptIndex { reason, .. }) => assert_eq!(reason, "number too large"),
        other => panic!("expected corruption, got {other:?}"),
    }
}

#[test]
fn stream_reports_truncated_tail() {
    // A lone continuation byte can never complete.
    let mut stream = PackedStream::from_file(
        TestFile::new(vec![0x80]),
        "test",
        Pow2::from_exponent(16),
    );
    assert!(matches!(stream.get(), Err(Error::UnexpectedEof { .. })));
}

// ---------------------------------------------------------------------------
// log-to-phys: build and lookup
// ---------------------------------------------------------------------------

#[test]
fn l2p_single_revision_three_items() {
    let dir = tempfile::tempdir().unwrap();
    let layout = small_layout(dir.path());
    let index_path = layout.l2p_index_path(42);
    let proto_path = dir.path().join("proto.l2p");

    let mut proto = L2pProtoIndex::open(&proto_path).unwrap();
    proto.add_entry(1000, 0).unwrap();
    proto.add_entry(1100, 1).unwrap();
    proto.add_entry(1250, 3).unwrap();
    proto.flush().unwrap();
    drop(proto);

    create_l2p_index(&index_path, &proto_path, 42, 4).unwrap();
    assert!(!proto_path.exists(), "proto-index must be consumed");
    assert!(fs_readonly(&index_path));

    let mut stream = PackedStream::open(&index_path, DEFAULT_BLOCK_SIZE).unwrap();
    let header = read_l2p_header(&mut stream).unwrap();
    assert_eq!(header.first_revision, 42);
    assert_eq!(header.page_size, 4);
    assert_eq!(header.revision_count(), 1);
    assert_eq!(header.page_table.len(), 1);
    assert_eq!(header.page_table[0].entry_count, 4);

    let store = IndexStore::new(layout);
    assert_eq!(store.l2p_lookup(42, 0).unwrap(), 1000);
    assert_eq!(store.l2p_lookup(42, 1).unwrap(), 1100);
    assert_eq!(store.l2p_lookup(42, 2).unwrap(), NO_OFFSET);
    assert_eq!(store.l2p_lookup(42, 3).unwrap(), 1250);
    assert!(matches!(
        store.l2p_lookup(42, 4),
        Err(Error::ItemIndexOverflow {
            revision: 42,
            item_index: 4
        })
    ));
    // There is no index file for revision 43 at all.
    assert!(matches!(store.l2p_lookup(43, 0), Err(Error::Io(_))));
}

#[test]
fn l2p_two_revisions_spanning_pages() {
    let dir = tempfile::tempdir().unwrap();
    let mut layout = small_layout(dir.path());
    // Revisions 5 and 6 share the shard based at revision 5.
    layout.shard_size = 5;
    layout.packed_below = 10;

    let index_path = layout.l2p_index_path(5);
    let proto_path = dir.path().join("proto.l2p");

    let mut proto = L2pProtoIndex::open(&proto_path).unwrap();
    proto.add_entry(10, 0).unwrap();
    proto.add_entry(20, 1).unwrap();
    proto.add_entry(30, 2).unwrap();
    proto.add_revision().unwrap();
    proto.add_entry(40, 0).unwrap();
    proto.flush().unwrap();
    drop(proto);

    create_l2p_index(&index_path, &proto_path, 5, 2).unwrap();

    let mut stream = PackedStream::open(&index_path, DEFAULT_BLOCK_SIZE).unwrap();
    let header = read_l2p_header(&mut stream).unwrap();
    assert_eq!(header.revision_count(), 2);
    assert_eq!(header.page_table_index, vec![0, 2, 3]);
    let entry_counts: Vec<u32> = header.page_table.iter().map(|e| e.entry_count).collect();
    assert_eq!(entry_counts, vec![2, 1, 1]);

    let store = IndexStore::new(layout);
    for _ in 0..2 {
        // The second pass answers from the caches populated by the first,
        // including prefetched pages; results must not change.
        assert_eq!(store.l2p_lookup(5, 0).unwrap(), 10);
        assert_eq!(store.l2p_lookup(5, 1).unwrap(), 20);
        assert_eq!(store.l2p_lookup(5, 2).unwrap(), 30);
        assert_eq!(store.l2p_lookup(6, 0).unwrap(), 40);
    }
    assert!(matches!(
        store.l2p_lookup(7, 0),
        Err(Error::RevisionNotCovered { revision: 7 })
    ));
}

#[test]
fn l2p_sparse_item_index_leaves_holes() {
    let dir = tempfile::tempdir().unwrap();
    let layout = small_layout(dir.path());
    let index_path = layout.l2p_index_path(1);
    let proto_path = dir.path().join("proto.l2p");

    let mut proto = L2pProtoIndex::open(&proto_path).unwrap();
    proto.add_entry(700, 6).unwrap();
    proto.flush().unwrap();
    drop(proto);

    create_l2p_index(&index_path, &proto_path, 1, 4).unwrap();

    let store = IndexStore::new(layout);
    for item_index in 0..6 {
        assert_eq!(store.l2p_lookup(1, item_index).unwrap(), NO_OFFSET);
    }
    assert_eq!(store.l2p_lookup(1, 6).unwrap(), 700);
    assert!(matches!(
        store.l2p_lookup(1, 7),
        Err(Error::ItemIndexOverflow { .. })
    ));
}

#[test]
fn l2p_empty_revision_in_pack() {
    let dir = tempfile::tempdir().unwrap();
    let mut layout = small_layout(dir.path());
    layout.shard_size = 5;
    layout.packed_below = 10;

    let index_path = layout.l2p_index_path(5);
    let proto_path = dir.path().join("proto.l2p");

    let mut proto = L2pProtoIndex::open(&proto_path).unwrap();
    proto.add_entry(10, 0).unwrap();
    proto.add_revision().unwrap();
    // Revision 6 commits no items at all.
    proto.add_revision().unwrap();
    proto.add_entry(50, 0).unwrap();
    proto.flush().unwrap();
    drop(proto);

    create_l2p_index(&index_path, &proto_path, 5, 2).unwrap();

    let store = IndexStore::new(layout);
    assert_eq!(store.l2p_lookup(5, 0).unwrap(), 10);
    assert_eq!(store.l2p_lookup(7, 0).unwrap(), 50);
    assert!(matches!(
        store.l2p_lookup(6, 0),
        Err(Error::ItemIndexOverflow { .. })
    ));
}

#[test]
fn l2p_random_roundtrip() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0xd1ce);

    let dir = tempfile::tempdir().unwrap();
    let mut layout = small_layout(dir.path());
    layout.shard_size = 4;
    layout.packed_below = 24;

    let index_path = layout.l2p_index_path(20);
    let proto_path = dir.path().join("proto.l2p");

    // Three revisions with random sparse item maps.
    let mut revisions: Vec<BTreeMap<u64, u64>> = Vec::new();
    let mut proto = L2pProtoIndex::open(&proto_path).unwrap();
    for revision in 0..3 {
        if revision > 0 {
            proto.add_revision().unwrap();
        }
        let mut items = BTreeMap::new();
        let mut offset = 1u64;
        for _ in 0..rng.gen_range(1..30) {
            let item_index = rng.gen_range(0..30u64);
            offset += rng.gen_range(1..10_000u64);
            items.insert(item_index, offset);
        }
        for (&item_index, &offset) in &items {
            proto.add_entry(offset, item_index).unwrap();
        }
        revisions.push(items);
    }
    proto.flush().unwrap();
    drop(proto);

    create_l2p_index(&index_path, &proto_path, 20, 3).unwrap();

    let store = IndexStore::new(layout);
    for (rel, items) in revisions.iter().enumerate() {
        let revision = 20 + rel as Revision;
        let max_index = *items.keys().last().unwrap();
        for item_index in 0..=max_index {
            let expected = items.get(&item_index).copied().unwrap_or(NO_OFFSET);
            assert_eq!(
                store.l2p_lookup(revision, item_index).unwrap(),
                expected,
                "revision {revision}, item {item_index}"
            );
        }
    }
    assert!(matches!(
        store.l2p_lookup(23, 0),
        Err(Error::RevisionNotCovered { .. })
    ));
}

#[test]
fn l2p_max_item_counts_across_index_files() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let layout = small_layout(dir.path());

    // Revision 10: five items in pages of two; revision 11: three items.
    let proto_path = dir.path().join("proto.l2p");
    let mut proto = L2pProtoIndex::open(&proto_path)?;
    for item_index in 0..5 {
        proto.add_entry(100 + item_index, item_index)?;
    }
    proto.flush()?;
    drop(proto);
    create_l2p_index(&layout.l2p_index_path(10), &proto_path, 10, 2)?;

    let mut proto = L2pProtoIndex::open(&proto_path)?;
    for item_index in 0..3 {
        proto.add_entry(200 + item_index, item_index)?;
    }
    proto.flush()?;
    drop(proto);
    create_l2p_index(&layout.l2p_index_path(11), &proto_path, 11, 2)?;

    let store = IndexStore::new(layout);
    assert_eq!(store.l2p_max_item_counts(10, 2)?, vec![5, 3]);
    Ok(())
}

#[test]
fn l2p_corrupt_header_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let layout = small_layout(dir.path());

    // The first integer never terminates within the 10-byte limit.
    let mut bytes = vec![0x80u8; 11];
    bytes.push(0x01);
    std::fs::write(layout.l2p_index_path(42), &bytes).unwrap();

    let store = IndexStore::new(layout);
    match store.l2p_lookup(42, 0) {
        Err(Error::CorruptIndex { reason, .. }) => assert_eq!(reason, "number too large"),
        other => panic!("expected corruption, got {other:?}"),
    }
}

#[test]
fn l2p_proto_writer_validation() {
    let dir = tempfile::tempdir().unwrap();
    let proto_path = dir.path().join("proto.l2p");
    let mut proto = L2pProtoIndex::open(&proto_path).unwrap();

    assert!(matches!(
        proto.add_entry(100, 1 << 31),
        Err(Error::InvalidProtoEntry(_))
    ));
    assert!(matches!(
        proto.add_entry(u64::MAX, 0),
        Err(Error::InvalidProtoEntry(_))
    ));
    proto.add_entry(100, (1 << 31) - 1).unwrap();
}

// ---------------------------------------------------------------------------
// phys-to-log: build and lookup
// ---------------------------------------------------------------------------

/// Builds the four-item file of 1000 bytes used by several tests:
/// 100 + 300 bytes in the first cluster, a 500-byte item spanning clusters,
/// and a 100-byte tail item.
fn build_small_p2l(layout: &Layout) {
    let proto_path = layout.root().join("proto.p2l");
    let mut proto = P2lProtoIndex::open(&proto_path).unwrap();
    let items = [
        (0u64, 100u64, item_type::CHANGES, 1u64, 0xaaaa_0001),
        (100, 300, item_type::FILE_REP, 2, 0xaaaa_0002),
        (400, 500, item_type::DIR_REP, 3, 0xaaaa_0003),
        (900, 100, item_type::NODE_REV, 4, 0xaaaa_0004),
    ];
    for (offset, size, entry_type, item_number, fnv1_checksum) in items {
        proto
            .add_entry(&P2lProtoEntry {
                offset,
                size,
                item_type: entry_type,
                revision: None,
                item_number,
                fnv1_checksum,
            })
            .unwrap();
    }
    proto.flush().unwrap();
    drop(proto);

    create_p2l_index(&layout.p2l_index_path(7), &proto_path, 7, 400).unwrap();
    assert!(!proto_path.exists(), "proto-index must be consumed");
}

#[test]
fn p2l_small_file() {
    let dir = tempfile::tempdir().unwrap();
    let layout = small_layout(dir.path());
    build_small_p2l(&layout);

    let mut stream = PackedStream::open(layout.p2l_index_path(7), DEFAULT_BLOCK_SIZE).unwrap();
    let header = read_p2l_header(&mut stream).unwrap();
    assert_eq!(header.first_revision, 7);
    assert_eq!(header.file_size, 1000);
    assert_eq!(header.page_size, 400);
    assert_eq!(header.page_count(), 3);

    let store = IndexStore::new(layout);

    // The revision was patched in from the build target.
    let first = store.p2l_page_lookup(7, 0).unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].offset, 0);
    assert_eq!(first[0].size, 100);
    assert_eq!(first[0].revision, 7);
    assert_eq!(first[0].item_type, item_type::CHANGES);
    assert_eq!(first[0].item_number, 1);
    assert_eq!(first[0].fnv1_checksum, 0xaaaa_0001);
    assert_eq!(first[1].offset, 100);

    // The spanning item is the only one starting in the second cluster.
    let spanning = store.p2l_page_lookup(7, 400).unwrap();
    assert_eq!(spanning.len(), 1);
    assert_eq!(spanning[0].offset, 400);
    assert_eq!(spanning[0].size, 500);

    // Every offset of a cluster maps to the same page.
    assert_eq!(store.p2l_page_lookup(7, 500).unwrap(), spanning);

    // The last cluster sees the spanning item, the tail item, and the
    // synthesized filler.
    let tail = store.p2l_page_lookup(7, 900).unwrap();
    let offsets: Vec<u64> = tail.iter().map(|e| e.offset).collect();
    assert_eq!(offsets, vec![400, 900, 1000]);
    assert_eq!(tail[2].item_type, item_type::UNUSED);
    assert_eq!(tail[2].size, 200);

    // Exact-offset probes.
    let entry = store.p2l_entry_lookup(7, 400).unwrap().unwrap();
    assert_eq!(entry.size, 500);
    assert_eq!(store.p2l_entry_lookup(7, 500).unwrap(), None);
    assert_eq!(store.p2l_entry_lookup(7, 1).unwrap(), None);
    // Repeating the probe answers from the page cache.
    assert_eq!(store.p2l_entry_lookup(7, 400).unwrap().unwrap().size, 500);

    assert_eq!(store.p2l_max_offset(7).unwrap(), 1000);

    assert!(matches!(
        store.p2l_page_lookup(7, 1250),
        Err(Error::OffsetTooLarge {
            revision: 7,
            offset: 1250
        })
    ));
    assert!(matches!(
        store.p2l_entry_lookup(7, 1300),
        Err(Error::OffsetTooLarge { .. })
    ));
}

#[test]
fn p2l_every_byte_is_covered() {
    let dir = tempfile::tempdir().unwrap();
    let layout = small_layout(dir.path());
    build_small_p2l(&layout);

    let store = IndexStore::new(layout);

    // Union the clusters and verify the descriptors tile the file without
    // gaps or overlaps, including the synthesized filler.
    let mut descriptors: BTreeMap<u64, u64> = BTreeMap::new();
    for page_start in [0u64, 400, 800] {
        for entry in store.p2l_page_lookup(7, page_start).unwrap() {
            descriptors.insert(entry.offset, entry.size);
        }
    }
    let mut position = 0u64;
    for (&offset, &size) in &descriptors {
        assert_eq!(offset, position, "descriptor gap at 0x{position:x}");
        position = offset + size;
    }
    assert_eq!(position, 1200, "coverage must reach the cluster boundary");
}

#[test]
fn p2l_lookup_is_stable_across_cache_states() {
    let dir = tempfile::tempdir().unwrap();
    let layout = small_layout(dir.path());
    build_small_p2l(&layout);

    let warm = IndexStore::new(layout.clone());
    let mut first_pass = Vec::new();
    for offset in [0u64, 100, 399, 400, 800, 999] {
        first_pass.push(warm.p2l_page_lookup(7, offset).unwrap());
    }

    // Same queries against the warmed cache and against a cold store.
    let cold = IndexStore::new(layout);
    for (i, offset) in [0u64, 100, 399, 400, 800, 999].into_iter().enumerate() {
        assert_eq!(warm.p2l_page_lookup(7, offset).unwrap(), first_pass[i]);
        assert_eq!(cold.p2l_page_lookup(7, offset).unwrap(), first_pass[i]);
    }
}

#[test]
fn p2l_builder_rejects_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let layout = small_layout(dir.path());
    let proto_path = dir.path().join("proto.p2l");

    let mut proto = P2lProtoIndex::open(&proto_path).unwrap();
    for (offset, size) in [(0u64, 100u64), (50, 100)] {
        proto
            .add_entry(&P2lProtoEntry {
                offset,
                size,
                item_type: item_type::FILE_REP,
                revision: Some(3),
                item_number: 1,
                fnv1_checksum: 0,
            })
            .unwrap();
    }
    proto.flush().unwrap();
    drop(proto);

    assert!(matches!(
        create_p2l_index(&layout.p2l_index_path(3), &proto_path, 3, 400),
        Err(Error::InvalidProtoEntry(_))
    ));
}

#[test]
fn p2l_proto_writer_validation() {
    let dir = tempfile::tempdir().unwrap();
    let proto_path = dir.path().join("proto.p2l");
    let mut proto = P2lProtoIndex::open(&proto_path).unwrap();

    let mut entry = P2lProtoEntry {
        offset: 0,
        size: 10,
        item_type: 8,
        revision: Some(1),
        item_number: 1,
        fnv1_checksum: 0,
    };
    assert!(matches!(
        proto.add_entry(&entry),
        Err(Error::InvalidProtoEntry(_))
    ));

    entry.item_type = item_type::FILE_REP;
    entry.item_number = u64::MAX / 4;
    assert!(matches!(
        proto.add_entry(&entry),
        Err(Error::InvalidProtoEntry(_))
    ));

    entry.item_number = 1;
    proto.add_entry(&entry).unwrap();
}

// ---------------------------------------------------------------------------
// address resolution
// ---------------------------------------------------------------------------

struct FixedPack(u64);

impl PackOffsets for FixedPack {
    fn pack_offset(&self, _revision: Revision) -> Result<u64> {
        Ok(self.0)
    }
}

#[test]
fn item_offset_physical_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let mut layout = small_layout(dir.path());
    layout.logical_from = None;
    layout.shard_size = 10;
    layout.packed_below = 20;

    let mut store = IndexStore::new(layout);
    store.set_pack_offsets(Arc::new(FixedPack(5000)));

    // Packed revision: pack offset plus item index, no index file involved.
    assert_eq!(store.item_offset(5, None, 123).unwrap(), 5123);
    // Unpacked revision: the item index is the offset.
    assert_eq!(store.item_offset(25, None, 123).unwrap(), 123);
    // Transaction under physical addressing behaves the same.
    let txn = TxnId {
        base_revision: 25,
        number: 1,
    };
    assert_eq!(store.item_offset(25, Some(&txn), 77).unwrap(), 77);
}

#[test]
fn item_offset_txn_proto_scan() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let layout = small_layout(dir.path());
    let txn = TxnId {
        base_revision: 41,
        number: 7,
    };

    let mut proto = L2pProtoIndex::open(layout.l2p_proto_index_path(&txn))?;
    proto.add_entry(500, 4)?;
    proto.add_entry(600, 9)?;
    proto.flush()?;
    drop(proto);

    let store = IndexStore::new(layout);
    assert_eq!(store.item_offset(42, Some(&txn), 4)?, 500);
    assert_eq!(store.item_offset(42, Some(&txn), 9)?, 600);
    assert_eq!(store.item_offset(42, Some(&txn), 5)?, NO_OFFSET);
    Ok(())
}

#[test]
fn item_offset_logical_revision() {
    let dir = tempfile::tempdir().unwrap();
    let layout = small_layout(dir.path());
    let proto_path = dir.path().join("proto.l2p");

    let mut proto = L2pProtoIndex::open(&proto_path).unwrap();
    proto.add_entry(4242, 2).unwrap();
    proto.flush().unwrap();
    drop(proto);
    create_l2p_index(&layout.l2p_index_path(9), &proto_path, 9, 4).unwrap();

    let store = IndexStore::new(layout);
    assert_eq!(store.item_offset(9, None, 2).unwrap(), 4242);
}

// ---------------------------------------------------------------------------
// cache forms
// ---------------------------------------------------------------------------

#[test]
fn l2p_header_cache_form_roundtrip() {
    let header = L2pHeader {
        first_revision: 17,
        page_size: 8,
        page_table_index: vec![0, 2, 3],
        page_table: vec![
            L2pPageTableEntry {
                offset: 40,
                size: 11,
                entry_count: 8,
            },
            L2pPageTableEntry {
                offset: 51,
                size: 5,
                entry_count: 3,
            },
            L2pPageTableEntry {
                offset: 56,
                size: 9,
                entry_count: 6,
            },
        ],
    };
    let decoded = L2pHeader::from_bytes(&header.to_bytes()).unwrap();
    assert_eq!(decoded, header);
}

#[test]
fn p2l_header_cache_form_roundtrip() {
    let header = P2lHeader {
        first_revision: 9,
        page_size: 0x10000,
        file_size: 123_456,
        offsets: vec![30, 70, 95, 120],
    };
    let decoded = P2lHeader::from_bytes(&header.to_bytes()).unwrap();
    assert_eq!(decoded, header);
}

#[test]
fn mem_cache_contract() {
    let cache: MemCache<PairKey> = MemCache::new();
    let key = PairKey {
        revision: 1,
        is_packed: false,
    };
    assert!(!cache.has_key(&key));
    assert!(cache.get(&key).is_none());
    assert!(!cache.with_value(&key, &mut |_| panic!("no value expected")));

    cache.set(key, vec![1, 2, 3].into());
    assert!(cache.has_key(&key));
    assert_eq!(cache.get(&key).unwrap().as_ref(), &[1, 2, 3]);

    let mut seen = Vec::new();
    assert!(cache.with_value(&key, &mut |bytes| seen.extend_from_slice(bytes)));
    assert_eq!(seen, vec![1, 2, 3]);
}

fn fs_readonly(path: &Path) -> bool {
    std::fs::metadata(path).unwrap().permissions().readonly()
}
