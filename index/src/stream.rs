//! Buffered reader for files of 7-bit packed integers.

use crate::err::{Error, Result};
use crate::{align_down, varint};
use pow2::Pow2;
use std::fs::File;
use std::path::{Path, PathBuf};
use sync_file::{RandomAccessFile, ReadAt};
use tracing::trace;

/// How many numbers a packed stream prefetches and buffers at a time.
///
/// This doubles as the raw read size in bytes: a refill fetches at most this
/// many bytes and therefore decodes at most this many numbers.
pub const MAX_NUMBER_PREFETCH: usize = 64;

/// A decoded number plus the number of bytes consumed up to and including it,
/// counted from the start of the current buffer.
#[derive(Copy, Clone, Default)]
struct ValuePos {
    value: u64,
    total_len: usize,
}

/// Forward-reading view of a file containing packed unsigned integers, with
/// seek to arbitrary byte offsets.
///
/// Numbers are decoded in batches to amortize the per-integer overhead.
/// Refills align to `block_size` boundaries so that a run of small reads
/// stays within one I/O block.  The stream owns its file handle; dropping
/// the stream closes the file.
pub struct PackedStream<F = RandomAccessFile> {
    file: F,
    /// File name, used in error messages only.
    path: PathBuf,
    block_size: Pow2,
    buffer: [ValuePos; MAX_NUMBER_PREFETCH],
    /// Number of used entries in `buffer`.
    used: usize,
    /// Index of the next number to hand out; `current == used` forces a
    /// refill on the next [`Self::get`].
    current: usize,
    /// File offset the first buffered value was read from.
    start_offset: u64,
    /// File offset the next refill will read from.
    next_offset: u64,
}

impl PackedStream<RandomAccessFile> {
    /// Opens the packed stream over the file at `path`.
    pub fn open<P: AsRef<Path>>(path: P, block_size: Pow2) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Ok(Self::from_file(
            RandomAccessFile::from(file),
            path,
            block_size,
        ))
    }
}

impl<F: ReadAt> PackedStream<F> {
    /// Wraps an already-open file.  `path` is only used in error messages.
    pub fn from_file<P: AsRef<Path>>(file: F, path: P, block_size: Pow2) -> Self {
        Self {
            file,
            path: path.as_ref().to_path_buf(),
            block_size,
            buffer: [ValuePos::default(); MAX_NUMBER_PREFETCH],
            used: 0,
            current: 0,
            start_offset: 0,
            next_offset: 0,
        }
    }

    /// The file this stream reads from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the next number in the stream.
    pub fn get(&mut self) -> Result<u64> {
        if self.current == self.used {
            self.refill()?;
        }
        let value = self.buffer[self.current].value;
        self.current += 1;
        Ok(value)
    }

    /// Reads the next number, failing if it does not fit in 32 bits.
    pub fn get_u32(&mut self) -> Result<u32> {
        let value = self.get()?;
        u32::try_from(value).map_err(|_| Error::CorruptIndex {
            file: self.path.clone(),
            offset: self.offset(),
            reason: "value exceeds 32 bits",
        })
    }

    /// Navigates to byte offset `offset`.  The offset is not validated; a
    /// bogus position surfaces as a decode error on the next [`Self::get`].
    pub fn seek(&mut self, offset: u64) {
        if self.used == 0 || offset < self.start_offset || offset >= self.next_offset {
            // Outside the buffered range; the next get() reads from `offset`.
            self.start_offset = offset;
            self.next_offset = offset;
            self.current = 0;
            self.used = 0;
        } else {
            // The buffer is small, so a linear scan beats a search structure.
            let in_buffer = offset - self.start_offset;
            let mut i = 0;
            while i < self.used && self.buffer[i].total_len as u64 <= in_buffer {
                i += 1;
            }
            self.current = i;
        }
    }

    /// The byte offset at which the next number will be read.
    pub fn offset(&self) -> u64 {
        if self.current == 0 {
            self.start_offset
        } else {
            self.start_offset + self.buffer[self.current - 1].total_len as u64
        }
    }

    /// Reads the next batch of numbers into the buffer.
    fn refill(&mut self) -> Result<()> {
        // All buffered data will have been read starting here.
        self.start_offset = self.next_offset;

        // Prefetch at least one number but, if feasible, stay within the
        // current I/O block.  Crossing into the next block for data that was
        // not actually requested would make the file cache jump back and
        // forth between two blocks.
        let block_start = align_down(self.next_offset, self.block_size);
        let block_left = block_start + (1u64 << self.block_size.exponent()) - self.next_offset;

        let mut want = MAX_NUMBER_PREFETCH;
        if block_left >= varint::MAX_ENCODED_LEN as u64 && block_left < want as u64 {
            want = block_left as usize;
        }

        let mut raw = [0u8; MAX_NUMBER_PREFETCH];
        let mut filled = 0usize;
        while filled < want {
            let n = self
                .file
                .read_at(&mut raw[filled..want], self.next_offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        // The last number may be incomplete; trim it so it is re-read by the
        // next refill.
        while filled > 0 && raw[filled - 1] >= 0x80 {
            filled -= 1;
        }

        // refill() only runs when get() needs more data, so there must be at
        // least one further number.
        if filled == 0 {
            return Err(Error::UnexpectedEof {
                file: self.path.clone(),
                offset: self.next_offset,
            });
        }

        let mut consumed = 0usize;
        let mut used = 0usize;
        while consumed < filled {
            let Some((value, len)) = varint::decode_uint(&raw[consumed..filled]) else {
                // Catch corrupted data early; it would cause havoc further
                // down the line.
                return Err(Error::CorruptIndex {
                    file: self.path.clone(),
                    offset: self.start_offset + consumed as u64,
                    reason: "number too large",
                });
            };
            consumed += len;
            self.buffer[used] = ValuePos {
                value,
                total_len: consumed,
            };
            used += 1;
        }

        trace!(
            offset = self.start_offset,
            bytes = consumed,
            numbers = used,
            "refilled packed stream"
        );

        self.used = used;
        self.current = 0;
        self.next_offset = self.start_offset + consumed as u64;
        Ok(())
    }
}
