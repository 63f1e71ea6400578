//! Read-only access to the captured address space.
//!
//! The image is whatever the snapshot writer managed to save before the
//! process died, so any read can fail. A failed read is not an error: it is
//! how a recovery method learns it has walked off the captured data, and the
//! callers react by falling back to the next method or stopping.

use crate::arch::WordSize;

pub trait MemoryRegion {
    /// Fill `out` from `addr`. `None` if any byte of the range is outside
    /// the captured image.
    fn read_bytes(&self, addr: u64, out: &mut [u8]) -> Option<()>;

    /// Read one little-endian machine word at `addr`.
    fn read_word(&self, addr: u64, word: WordSize) -> Option<u64> {
        let mut buf = [0u8; 8];
        let len = word.bytes() as usize;
        self.read_bytes(addr, &mut buf[..len])?;
        Some(u64::from_le_bytes(buf))
    }
}

/// A contiguous captured range, e.g. one thread's stack region out of a
/// crash snapshot.
#[derive(Debug, Clone)]
pub struct CapturedMemory {
    base: u64,
    bytes: Vec<u8>,
}

impl CapturedMemory {
    pub fn new(base: u64, bytes: impl Into<Vec<u8>>) -> CapturedMemory {
        CapturedMemory {
            base,
            bytes: bytes.into(),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

impl MemoryRegion for CapturedMemory {
    fn read_bytes(&self, addr: u64, out: &mut [u8]) -> Option<()> {
        let start = addr.checked_sub(self.base)?;
        let end = start.checked_add(out.len() as u64)?;
        if end > self.bytes.len() as u64 {
            return None;
        }
        out.copy_from_slice(&self.bytes[start as usize..end as usize]);
        Some(())
    }
}
