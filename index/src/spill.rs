//! Memory buffer that overflows to a temporary file.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Granularity of writes when draining a spilled buffer.
pub(crate) const SPILL_BLOCK_SIZE: usize = 0x10000;

/// Amount of data held in memory before spilling to disk.
pub(crate) const SPILL_MEM_LIMIT: usize = 0x0100_0000;

/// Append-only byte buffer used by the index builders to collect page
/// payloads before the final file layout is known.
///
/// Data accumulates in memory until it exceeds the 16 MiB cap, then overflows
/// into an anonymous temporary file.  [`SpillBuf::write_to`] replays the
/// bytes in write order.
pub struct SpillBuf {
    mem: Vec<u8>,
    spilled: Option<File>,
    spilled_len: u64,
    mem_limit: usize,
}

impl SpillBuf {
    /// Creates an empty buffer with the default 16 MiB memory cap.
    pub fn new() -> Self {
        Self::with_limit(SPILL_MEM_LIMIT)
    }

    /// Creates an empty buffer that spills once `mem_limit` bytes are held
    /// in memory.
    pub fn with_limit(mem_limit: usize) -> Self {
        Self {
            mem: Vec::new(),
            spilled: None,
            spilled_len: 0,
            mem_limit,
        }
    }

    /// Total number of bytes written so far.
    pub fn len(&self) -> u64 {
        self.spilled_len + self.mem.len() as u64
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `data` to the buffer.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.mem.extend_from_slice(data);
        if self.mem.len() >= self.mem_limit {
            self.spill()?;
        }
        Ok(())
    }

    /// Moves the in-memory part to the overflow file.
    fn spill(&mut self) -> io::Result<()> {
        if self.spilled.is_none() {
            self.spilled = Some(tempfile::tempfile()?);
        }
        // Some(_) was just ensured above.
        let file = self.spilled.as_mut().unwrap();
        for chunk in self.mem.chunks(SPILL_BLOCK_SIZE) {
            file.write_all(chunk)?;
        }
        self.spilled_len += self.mem.len() as u64;
        self.mem.clear();
        Ok(())
    }

    /// Writes the buffered bytes to `out` in write order and returns the
    /// total number of bytes transferred.
    pub fn write_to<W: Write>(mut self, out: &mut W) -> io::Result<u64> {
        let total = self.len();
        if let Some(mut file) = self.spilled.take() {
            file.seek(SeekFrom::Start(0))?;
            let mut block = vec![0u8; SPILL_BLOCK_SIZE];
            loop {
                let n = file.read(&mut block)?;
                if n == 0 {
                    break;
                }
                out.write_all(&block[..n])?;
            }
        }
        out.write_all(&self.mem)?;
        Ok(total)
    }
}

impl Default for SpillBuf {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_roundtrip() {
        let mut buf = SpillBuf::new();
        buf.write(b"hello ").unwrap();
        buf.write(b"world").unwrap();
        assert_eq!(buf.len(), 11);

        let mut out = Vec::new();
        assert_eq!(buf.write_to(&mut out).unwrap(), 11);
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn spills_past_limit() {
        let mut buf = SpillBuf::with_limit(64);
        let mut expected = Vec::new();
        for i in 0..50u8 {
            let piece = [i; 7];
            buf.write(&piece).unwrap();
            expected.extend_from_slice(&piece);
        }
        assert_eq!(buf.len(), expected.len() as u64);

        let mut out = Vec::new();
        buf.write_to(&mut out).unwrap();
        assert_eq!(out, expected);
    }
}
