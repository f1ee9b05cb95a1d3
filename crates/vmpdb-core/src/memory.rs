//! # Target Memory
//!
//! Read access to the analyzed target's memory.
//!
//! The PDB subsystem only ever reads: symbol values ([`read_symbol`]), the
//! bytes of a displayed structure, `UNICODE_STRING` buffers and, during
//! bootstrap, the kernel image itself. [`MemoryAccess`] is the capability
//! the hosting engine supplies; [`SparseMemory`] is a simple map-backed
//! implementation for file-based analysis and tests.
//!
//! [`read_symbol`]: crate::symbols::PdbContext::read_symbol

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::RwLock;

pub use crate::error::MemoryError;
use crate::types::{Address, ProcessId};

/// Granularity of zero-padded reads.
const PAGE_SIZE: usize = 0x1000;

/// Read-only view of target memory
pub trait MemoryAccess: Send + Sync
{
    /// Read up to `buf.len()` bytes at `address`.
    ///
    /// Returns the length of the contiguous prefix that could be read.
    fn read(&self, process: ProcessId, address: Address, buf: &mut [u8]) -> usize;

    /// Read exactly `buf.len()` bytes.
    ///
    /// ## Errors
    ///
    /// Returns [`MemoryError::Unmapped`] if nothing could be read and
    /// [`MemoryError::Partial`] for short reads.
    fn read_exact(&self, process: ProcessId, address: Address, buf: &mut [u8]) -> Result<(), MemoryError>
    {
        match self.read(process, address, buf) {
            n if n == buf.len() => Ok(()),
            0 => Err(MemoryError::Unmapped(address)),
            read => Err(MemoryError::Partial { address, read, requested: buf.len() }),
        }
    }

    /// Read `len` bytes page by page, leaving unreadable pages zeroed.
    fn read_zero_pad(&self, process: ProcessId, address: Address, len: usize) -> Vec<u8>
    {
        let mut out = vec![0u8; len];
        let mut offset = 0;
        while offset < len {
            let page_left = PAGE_SIZE - ((address.value() as usize).wrapping_add(offset) % PAGE_SIZE);
            let end = (offset + page_left).min(len);
            self.read(process, address + offset as u64, &mut out[offset..end]);
            offset = end;
        }
        out
    }
}

/// Map-backed [`MemoryAccess`] holding explicitly registered regions
///
/// Reads that cross from one region into an adjacent one are satisfied;
/// reads stop at the first gap.
#[derive(Default)]
pub struct SparseMemory
{
    regions: RwLock<HashMap<ProcessId, BTreeMap<u64, Vec<u8>>>>,
}

impl SparseMemory
{
    /// Create an empty memory map.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Register `bytes` at `address` in the address space of `process`.
    ///
    /// A region starting at the same address is replaced.
    pub fn map(&self, process: ProcessId, address: Address, bytes: Vec<u8>)
    {
        let mut regions = self.regions.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        regions.entry(process).or_default().insert(address.value(), bytes);
    }

    /// Total number of mapped bytes across all processes.
    pub fn mapped_len(&self) -> usize
    {
        let regions = self.regions.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        regions.values().flat_map(BTreeMap::values).map(Vec::len).sum()
    }
}

impl MemoryAccess for SparseMemory
{
    fn read(&self, process: ProcessId, address: Address, buf: &mut [u8]) -> usize
    {
        let regions = self.regions.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(space) = regions.get(&process) else {
            return 0;
        };

        let mut done = 0;
        while done < buf.len() {
            let cursor = address.value().wrapping_add(done as u64);
            let Some((&start, bytes)) = space.range(..=cursor).next_back() else {
                break;
            };
            let Some(skip) = usize::try_from(cursor - start).ok().filter(|&skip| skip < bytes.len()) else {
                break;
            };
            let n = (bytes.len() - skip).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&bytes[skip..skip + n]);
            done += n;
        }
        done
    }
}

/// Format bytes as a hexdump: address, hex bytes and printable ASCII.
///
/// `width` (bytes per line) is clamped to `8..=32`.
///
/// ```rust
/// use vmpdb_core::memory::format_hexdump;
/// use vmpdb_core::types::Address;
///
/// let dump = format_hexdump(Address::new(0x1000), b"ABCD", 8);
/// assert!(dump.starts_with("0000000000001000  41 42 43 44"));
/// assert!(dump.trim_end().ends_with("ABCD"));
/// ```
pub fn format_hexdump(base: Address, bytes: &[u8], width: usize) -> String
{
    let width = width.clamp(8, 32);
    let mut out = String::new();
    for (line, chunk) in bytes.chunks(width).enumerate() {
        let addr = base.value().saturating_add((line * width) as u64);
        let _ = write!(out, "{addr:016x}  ");

        for i in 0..width {
            match chunk.get(i) {
                Some(byte) => {
                    let _ = write!(out, "{byte:02x} ");
                }
                None => out.push_str("   "),
            }
            if i + 1 == width / 2 {
                out.push(' ');
            }
        }

        out.push(' ');
        out.extend(chunk.iter().map(|&byte| {
            if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '.'
            }
        }));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_read_spans_adjacent_regions()
    {
        let memory = SparseMemory::new();
        memory.map(ProcessId::SYSTEM, Address::new(0x1000), vec![1; 0x10]);
        memory.map(ProcessId::SYSTEM, Address::new(0x1010), vec![2; 0x10]);

        let mut buf = [0u8; 0x18];
        assert_eq!(memory.read(ProcessId::SYSTEM, Address::new(0x1008), &mut buf), 0x18);
        assert_eq!(&buf[..8], &[1; 8]);
        assert_eq!(&buf[8..], &[2; 0x10]);
    }

    #[test]
    fn test_read_stops_at_gap()
    {
        let memory = SparseMemory::new();
        memory.map(ProcessId::SYSTEM, Address::new(0x1000), vec![7; 4]);

        let mut buf = [0u8; 8];
        assert_eq!(memory.read(ProcessId::SYSTEM, Address::new(0x1000), &mut buf), 4);
        assert!(matches!(
            memory.read_exact(ProcessId::SYSTEM, Address::new(0x1000), &mut buf),
            Err(MemoryError::Partial { read: 4, requested: 8, .. })
        ));
        assert!(matches!(
            memory.read_exact(ProcessId(1234), Address::new(0x1000), &mut buf),
            Err(MemoryError::Unmapped(_))
        ));
    }

    #[test]
    fn test_zero_pad_skips_holes()
    {
        let memory = SparseMemory::new();
        memory.map(ProcessId::SYSTEM, Address::new(0x2000), vec![0xaa; 0x1000]);

        let bytes = memory.read_zero_pad(ProcessId::SYSTEM, Address::new(0x1000), 0x3000);
        assert!(bytes[..0x1000].iter().all(|&b| b == 0));
        assert!(bytes[0x1000..0x2000].iter().all(|&b| b == 0xaa));
        assert!(bytes[0x2000..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_hexdump_lines()
    {
        let dump = format_hexdump(Address::new(0x10), &[0x41; 20], 16);
        let lines: Vec<_> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("0000000000000020  41 41 41 41"));
    }
}
