//! # PE Introspection
//!
//! Reading just enough of a mapped PE image to identify its debug database:
//! the image size and the RSDS CodeView record.
//!
//! Headers are parsed with `object::pe` / `object::read::pe` straight from
//! target memory. The CodeView record itself is decoded by hand because it
//! is referenced by RVA, not by a file offset.
//!
//! ## CodeView RSDS layout
//!
//! ```text
//! +0x00  u32       signature  "RSDS" (0x53445352)
//! +0x04  [u8; 16]  GUID
//! +0x14  u32       age
//! +0x18  char[]    PDB file name, NUL terminated
//! ```

pub mod image;

use std::fmt;
use std::sync::Arc;

use object::pe::{ImageDebugDirectory, ImageDosHeader, ImageNtHeaders32, ImageNtHeaders64};
use object::read::pe::{ImageNtHeaders, ImageOptionalHeader};
use object::LittleEndian as LE;

pub use crate::error::PeError;
use crate::memory::MemoryAccess;
use crate::types::{Address, ProcessId};

/// Little-endian "RSDS" signature of a CodeView 7.0 record.
pub const RSDS_SIGNATURE: u32 = 0x5344_5352;

/// Fixed size of a CodeView record including the longest file name we accept.
pub const CODEVIEW_RECORD_SIZE: usize = 24 + 260;

/// Bytes read from the image base to parse DOS and NT headers.
const HEADER_PAGE: usize = 0x1000;

/// Largest debug directory we bother reading.
const MAX_DEBUG_DIRECTORY: u32 = 0x1000;

/// GUID identifying one build of a debug database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Guid(pub [u8; 16]);

impl Guid
{
    /// Lower 8 bytes as a little-endian integer.
    pub fn low_u64(&self) -> u64
    {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(bytes)
    }

    /// Upper 8 bytes as a little-endian integer.
    pub fn high_u64(&self) -> u64
    {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.0[8..]);
        u64::from_le_bytes(bytes)
    }

    /// Symbol store directory key: the GUID in registry order followed by
    /// the age, both uppercase hex.
    pub fn symstore_key(&self, age: u32) -> String
    {
        let b = &self.0;
        let data1 = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        let data2 = u16::from_le_bytes([b[4], b[5]]);
        let data3 = u16::from_le_bytes([b[6], b[7]]);
        let mut key = format!("{data1:08X}{data2:04X}{data3:04X}");
        for byte in &b[8..] {
            key.push_str(&format!("{byte:02X}"));
        }
        key.push_str(&format!("{age:X}"));
        key
    }
}

impl fmt::Display for Guid
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let b = &self.0;
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            u16::from_le_bytes([b[4], b[5]]),
            u16::from_le_bytes([b[6], b[7]]),
            b[8],
            b[9],
            b[10],
            b[11],
            b[12],
            b[13],
            b[14],
            b[15]
        )
    }
}

/// Debug identity extracted from a CodeView RSDS record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeViewInfo
{
    /// PDB file name as recorded by the linker (may include a build path)
    pub pdb_file_name: String,
    /// Build GUID
    pub guid: Guid,
    /// Build age
    pub age: u32,
}

impl CodeViewInfo
{
    /// Decode an RSDS record.
    ///
    /// Returns `None` if the signature does not match or the record is too
    /// short to hold a file name.
    pub fn parse_rsds(bytes: &[u8]) -> Option<Self>
    {
        let signature = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?);
        if signature != RSDS_SIGNATURE {
            return None;
        }
        let guid: [u8; 16] = bytes.get(4..20)?.try_into().ok()?;
        let age = u32::from_le_bytes(bytes.get(20..24)?.try_into().ok()?);
        let name_bytes = bytes.get(24..)?;
        let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
        if end == 0 {
            return None;
        }
        Some(CodeViewInfo {
            pdb_file_name: String::from_utf8_lossy(&name_bytes[..end]).into_owned(),
            guid: Guid(guid),
            age,
        })
    }

    /// PDB file name without any directory prefix (`ntkrnlmp.pdb`).
    pub fn file_name(&self) -> &str
    {
        self.pdb_file_name.rsplit(['\\', '/']).next().unwrap_or(&self.pdb_file_name)
    }

    /// Short module name: the file name truncated at `.pdb`.
    pub fn module_name(&self) -> &str
    {
        let file = self.file_name();
        match file.to_ascii_lowercase().find(".pdb") {
            Some(end) => &file[..end],
            None => file,
        }
    }
}

/// Header facts of a mapped PE image
pub trait PeIntrospection: Send + Sync
{
    /// `SizeOfImage` of the image mapped at `base`.
    ///
    /// ## Errors
    ///
    /// Returns an error if the headers cannot be read or parsed.
    fn image_size(&self, process: ProcessId, base: Address) -> Result<u32, PeError>;

    /// CodeView RSDS record of the image mapped at `base`.
    ///
    /// ## Errors
    ///
    /// Returns an error if the headers cannot be parsed or the image carries
    /// no RSDS record.
    fn codeview(&self, process: ProcessId, base: Address) -> Result<CodeViewInfo, PeError>;
}

/// Header summary shared by both PE flavours.
struct HeaderSummary
{
    size_of_image: u32,
    debug_directory: Option<(u32, u32)>,
}

fn parse_headers<Pe: ImageNtHeaders>(page: &[u8]) -> Result<HeaderSummary, PeError>
{
    let dos = ImageDosHeader::parse(page)?;
    let mut offset = u64::from(dos.nt_headers_offset());
    let (nt, directories) = Pe::parse(page, &mut offset)?;
    let debug_directory = directories
        .get(object::pe::IMAGE_DIRECTORY_ENTRY_DEBUG)
        .map(|dir| dir.address_range())
        .filter(|&(rva, size)| rva != 0 && size != 0);
    Ok(HeaderSummary { size_of_image: nt.optional_header().size_of_image(), debug_directory })
}

fn parse_either(page: &[u8]) -> Result<HeaderSummary, PeError>
{
    parse_headers::<ImageNtHeaders64>(page).or_else(|_| parse_headers::<ImageNtHeaders32>(page))
}

/// [`PeIntrospection`] over images mapped in target memory
pub struct MappedPe
{
    memory: Arc<dyn MemoryAccess>,
}

impl MappedPe
{
    /// Inspect images through the given memory capability.
    pub fn new(memory: Arc<dyn MemoryAccess>) -> Self
    {
        MappedPe { memory }
    }

    fn headers(&self, process: ProcessId, base: Address) -> Result<HeaderSummary, PeError>
    {
        let page = self.memory.read_zero_pad(process, base, HEADER_PAGE);
        parse_either(&page)
    }
}

impl PeIntrospection for MappedPe
{
    fn image_size(&self, process: ProcessId, base: Address) -> Result<u32, PeError>
    {
        Ok(self.headers(process, base)?.size_of_image)
    }

    fn codeview(&self, process: ProcessId, base: Address) -> Result<CodeViewInfo, PeError>
    {
        let headers = self.headers(process, base)?;
        let (rva, size) = headers.debug_directory.ok_or(PeError::NoDebugDirectory)?;
        let size = size.min(MAX_DEBUG_DIRECTORY) as usize;

        let mut raw = vec![0u8; size];
        self.memory.read_exact(process, base + u64::from(rva), &mut raw)?;
        let count = size / std::mem::size_of::<ImageDebugDirectory>();
        let (entries, _) = object::pod::slice_from_bytes::<ImageDebugDirectory>(&raw, count)
            .map_err(|()| PeError::InvalidImage("truncated debug directory".into()))?;

        for entry in entries {
            if entry.typ.get(LE) != object::pe::IMAGE_DEBUG_TYPE_CODEVIEW {
                continue;
            }
            let data_rva = entry.address_of_raw_data.get(LE);
            let data_size = (entry.size_of_data.get(LE) as usize).min(CODEVIEW_RECORD_SIZE);
            if data_rva == 0 || data_size < 24 {
                continue;
            }
            let mut record = vec![0u8; data_size];
            self.memory.read_exact(process, base + u64::from(data_rva), &mut record)?;
            if let Some(info) = CodeViewInfo::parse_rsds(&record) {
                return Ok(info);
            }
        }
        Err(PeError::NoCodeView)
    }
}

/// Brute-force search for the kernel's RSDS record in raw image bytes.
///
/// Walks the buffer in 4-byte steps looking for a record whose age is at
/// most `0x20` and whose file name is exactly 12 characters starting with
/// `nt` and ending in `.pdb` (`ntkrnlmp.pdb`, `ntkrnlpa.pdb`, ...). The
/// first hit wins.
pub fn scan_for_kernel_codeview(image: &[u8]) -> Option<CodeViewInfo>
{
    const MAX_AGE: u32 = 0x20;

    if image.len() <= CODEVIEW_RECORD_SIZE {
        return None;
    }
    let limit = image.len() - CODEVIEW_RECORD_SIZE;
    (0..limit).step_by(4).find_map(|i| {
        let record = &image[i..i + CODEVIEW_RECORD_SIZE];
        if u32::from_le_bytes([record[0], record[1], record[2], record[3]]) != RSDS_SIGNATURE {
            return None;
        }
        let age = u32::from_le_bytes([record[20], record[21], record[22], record[23]]);
        let name = &record[24..];
        if age > MAX_AGE || !name.starts_with(b"nt") || &name[8..13] != b".pdb\0" {
            return None;
        }
        let mut guid = [0u8; 16];
        guid.copy_from_slice(&record[4..20]);
        Some(CodeViewInfo {
            pdb_file_name: String::from_utf8_lossy(&name[..12]).into_owned(),
            guid: Guid(guid),
            age,
        })
    })
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn rsds(name: &[u8], age: u32) -> Vec<u8>
    {
        let mut record = RSDS_SIGNATURE.to_le_bytes().to_vec();
        record.extend_from_slice(&[0x11; 16]);
        record.extend_from_slice(&age.to_le_bytes());
        record.extend_from_slice(name);
        record.push(0);
        record
    }

    #[test]
    fn test_parse_rsds()
    {
        let info = CodeViewInfo::parse_rsds(&rsds(b"d:\\build\\ntkrnlmp.pdb", 2)).unwrap();
        assert_eq!(info.age, 2);
        assert_eq!(info.file_name(), "ntkrnlmp.pdb");
        assert_eq!(info.module_name(), "ntkrnlmp");
    }

    #[test]
    fn test_parse_rsds_rejects_other_signatures()
    {
        let mut record = rsds(b"foo.pdb", 1);
        record[0] = b'N';
        assert!(CodeViewInfo::parse_rsds(&record).is_none());
    }

    #[test]
    fn test_scan_finds_kernel_record()
    {
        let mut image = vec![0u8; 0x2000];
        let record = rsds(b"ntkrnlmp.pdb", 1);
        image[0x804..0x804 + record.len()].copy_from_slice(&record);

        let info = scan_for_kernel_codeview(&image).unwrap();
        assert_eq!(info.pdb_file_name, "ntkrnlmp.pdb");
        assert_eq!(info.age, 1);
    }

    #[test]
    fn test_scan_skips_high_age_and_foreign_names()
    {
        let mut image = vec![0u8; 0x2000];
        let stale = rsds(b"ntkrnlmp.pdb", 0x21);
        let foreign = rsds(b"halmacpi.pdb", 1);
        image[0x100..0x100 + stale.len()].copy_from_slice(&stale);
        image[0x400..0x400 + foreign.len()].copy_from_slice(&foreign);
        assert!(scan_for_kernel_codeview(&image).is_none());
    }

    #[test]
    fn test_symstore_key()
    {
        let guid = Guid([0xf7, 0x4d, 0x2b, 0x1c, 0xe9, 0xee, 0x2f, 0x4f, 0x85, 0x6c, 0x5a, 0x6c, 0xb3, 0x94, 0x8e, 0x31]);
        assert_eq!(guid.symstore_key(1), "1C2B4DF7EEE94F2F856C5A6CB3948E311");
        assert_eq!(guid.to_string(), "1C2B4DF7-EEE9-4F2F-856C-5A6CB3948E31");
    }
}
