//! Process identifiers and the description of the analyzed target.

use super::Address;

/// Process identifier (PID) inside the analyzed target
///
/// Memory reads are always qualified by a process because user-space
/// addresses are only meaningful within one address space. Kernel reads go
/// through [`ProcessId::SYSTEM`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl ProcessId
{
    /// The Windows `System` process, owner of the kernel address space.
    pub const SYSTEM: Self = ProcessId(4);
}

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

/// Static facts about the analyzed target needed by symbol queries
///
/// The kernel base and size come from the hosting analysis engine; the PDB
/// subsystem only reads them during bootstrap and when rendering types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetInfo
{
    /// `true` if the target runs a 32-bit kernel
    pub is_32bit: bool,
    /// Load address of the kernel image (`ntoskrnl.exe`)
    pub kernel_base: Address,
    /// Size in bytes of the kernel image
    pub kernel_size: u32,
    /// Process whose address space maps the kernel
    pub system_process: ProcessId,
}

impl TargetInfo
{
    /// Describe a 64-bit target with the kernel at `kernel_base`.
    #[must_use]
    pub const fn new_64(kernel_base: Address, kernel_size: u32) -> Self
    {
        TargetInfo { is_32bit: false, kernel_base, kernel_size, system_process: ProcessId::SYSTEM }
    }

    /// Describe a 32-bit target with the kernel at `kernel_base`.
    #[must_use]
    pub const fn new_32(kernel_base: Address, kernel_size: u32) -> Self
    {
        TargetInfo { is_32bit: true, kernel_base, kernel_size, system_process: ProcessId::SYSTEM }
    }

    /// Pointer width of the target in bytes.
    pub const fn pointer_size(&self) -> usize
    {
        if self.is_32bit {
            4
        } else {
            8
        }
    }

    /// Size of the fixed part of `_OBJECT_HEADER` preceding an object body.
    pub const fn object_header_size(&self) -> u64
    {
        if self.is_32bit {
            0x18
        } else {
            0x30
        }
    }

    /// Offset of `_OBJECT_HEADER.InfoMask`.
    pub const fn object_info_mask_offset(&self) -> usize
    {
        if self.is_32bit {
            0x0e
        } else {
            0x1a
        }
    }

    /// Format an address with the target's native width (8 or 16 hex digits).
    pub fn format_address(&self, address: Address) -> String
    {
        if self.is_32bit {
            format!("0x{:08X}", address.value())
        } else {
            format!("0x{:016X}", address.value())
        }
    }
}
