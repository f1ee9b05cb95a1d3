//! Fingerprint and module-name hashing.
//!
//! Both hashes are rotate-right-13 accumulators. The fingerprint folds a PDB
//! identity `(file name, GUID, age)` into 64 bits and doubles as the public
//! handle; the module-name hash keys the secondary index.

use crate::pe::Guid;

const fn ror13_64(value: u64) -> u64
{
    value.rotate_right(13)
}

/// ROR13 hash of a byte string (32-bit accumulator).
pub fn hash_bytes(bytes: &[u8]) -> u32
{
    bytes.iter().fold(0u32, |acc, &b| acc.rotate_right(13).wrapping_add(u32::from(b)))
}

/// Fingerprint of a PDB identity.
///
/// ```rust
/// use vmpdb_core::pe::Guid;
/// use vmpdb_core::symbols::hash::fingerprint;
///
/// let guid = Guid([7; 16]);
/// assert_eq!(fingerprint("ntkrnlmp.pdb", &guid, 1), fingerprint("ntkrnlmp.pdb", &guid, 1));
/// assert_ne!(fingerprint("ntkrnlmp.pdb", &guid, 1), fingerprint("ntkrnlmp.pdb", &guid, 2));
/// ```
pub fn fingerprint(pdb_file_name: &str, guid: &Guid, age: u32) -> u64
{
    let mut hash = u64::from(hash_bytes(pdb_file_name.as_bytes()));
    hash = u64::from(age).wrapping_add(ror13_64(hash));
    hash = guid.low_u64().wrapping_add(ror13_64(hash));
    guid.high_u64().wrapping_add(ror13_64(hash))
}

/// Normalize a module name for the secondary index: strip any directory
/// prefix and lowercase ASCII.
pub fn normalize_module_name(name: &str) -> String
{
    name.rsplit(['\\', '/']).next().unwrap_or(name).to_ascii_lowercase()
}

/// Hash of a module name as used by the secondary index.
///
/// The name is normalized first and hashed over its UTF-16 code units so
/// non-ASCII names hash consistently with wide-character hosts.
pub fn module_name_hash(name: &str) -> u32
{
    normalize_module_name(name)
        .encode_utf16()
        .fold(0u32, |acc, unit| acc.rotate_right(13).wrapping_add(u32::from(unit)))
}
