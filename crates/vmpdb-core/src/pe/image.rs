//! Laying out a PE file the way the loader maps it.
//!
//! Lets a kernel image on disk (`ntoskrnl.exe`) stand in for a live target:
//! the mapped bytes can be registered with a
//! [`SparseMemory`](crate::memory::SparseMemory) at the kernel base and the
//! rest of the subsystem cannot tell the difference.

use object::pe::{ImageDosHeader, ImageNtHeaders32, ImageNtHeaders64};
use object::read::pe::{ImageNtHeaders, ImageOptionalHeader};
use object::LittleEndian as LE;

use super::PeError;

/// Images larger than this are refused.
const MAX_IMAGE_SIZE: u32 = 0x0400_0000;

fn map_with<Pe: ImageNtHeaders>(file: &[u8]) -> Result<Vec<u8>, PeError>
{
    let dos = ImageDosHeader::parse(file)?;
    let mut offset = u64::from(dos.nt_headers_offset());
    let (nt, _) = Pe::parse(file, &mut offset)?;
    let optional = nt.optional_header();

    let size_of_image = optional.size_of_image();
    if size_of_image == 0 || size_of_image > MAX_IMAGE_SIZE {
        return Err(PeError::InvalidImage(format!("unsupported image size 0x{size_of_image:x}")));
    }
    let mut image = vec![0u8; size_of_image as usize];

    let headers = (optional.size_of_headers() as usize).min(file.len()).min(image.len());
    image[..headers].copy_from_slice(&file[..headers]);

    for section in nt.sections(file, offset)?.iter() {
        let (raw_offset, raw_size) = section.pe_file_range();
        let va = section.virtual_address.get(LE) as usize;
        let raw_offset = raw_offset as usize;
        let Some(data) = file.get(raw_offset..raw_offset + raw_size as usize) else {
            continue;
        };
        let Some(dest) = image.get_mut(va..) else {
            continue;
        };
        let len = data.len().min(dest.len());
        dest[..len].copy_from_slice(&data[..len]);
    }
    Ok(image)
}

/// A PE file laid out as it would be mapped.
#[derive(Debug, Clone)]
pub struct MappedImage
{
    /// `SizeOfImage` bytes, sections at their virtual addresses
    pub bytes: Vec<u8>,
    /// `true` for a PE32 image
    pub is_32bit: bool,
}

/// Map a PE file into its in-memory layout (`SizeOfImage` bytes, sections at
/// their virtual addresses, gaps zero-filled).
///
/// ## Errors
///
/// Returns [`PeError::InvalidImage`] if the file is not a PE image or its
/// image size is out of range.
pub fn map_image(file: &[u8]) -> Result<MappedImage, PeError>
{
    match map_with::<ImageNtHeaders64>(file) {
        Ok(bytes) => Ok(MappedImage { bytes, is_32bit: false }),
        Err(_) => map_with::<ImageNtHeaders32>(file).map(|bytes| MappedImage { bytes, is_32bit: true }),
    }
}
