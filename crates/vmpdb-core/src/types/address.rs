//! Virtual address type.

use std::fmt;
use std::ops::{Add, Sub};

/// Lowest canonical kernel-space address on 64-bit Windows targets
const KERNEL_BASE_64: u64 = 0xffff_8000_0000_0000;

/// Lowest kernel-space address on 32-bit Windows targets
const KERNEL_BASE_32: u64 = 0x8000_0000;

/// Strongly typed virtual address in the analyzed target
///
/// This wrapper around `u64` keeps target addresses apart from sizes, offsets
/// and symbol-backend addresses (which live in a synthetic address space, see
/// [`LOAD_SLOT_BASE`](crate::symbols::LOAD_SLOT_BASE)).
///
/// ## Example
///
/// ```rust
/// use vmpdb_core::types::Address;
///
/// let addr = Address::from(0xfffff800_00000000);
/// let field = addr + 0x30;
/// assert_eq!(field.value(), 0xfffff800_00000030);
/// assert!(field.is_kernel(false));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address
{
    /// The null address (0x0)
    pub const ZERO: Self = Address(0);

    /// Create a new address from a `u64` value
    ///
    /// This is equivalent to `Address::from(value)` but can be used in const contexts.
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Get the raw `u64` value of this address
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// Returns `true` for the null address.
    pub const fn is_null(self) -> bool
    {
        self.0 == 0
    }

    /// Add an offset to this address, checking for overflow
    ///
    /// ```rust
    /// use vmpdb_core::types::Address;
    ///
    /// let addr = Address::from(0x1000);
    /// assert_eq!(addr.checked_add(0x100), Some(Address::from(0x1100)));
    /// assert_eq!(addr.checked_add(u64::MAX), None);
    /// ```
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.0.checked_add(offset).map(Address)
    }

    /// Subtract an offset from this address, checking for underflow
    pub fn checked_sub(self, offset: u64) -> Option<Self>
    {
        self.0.checked_sub(offset).map(Address)
    }

    /// Returns `true` if the address lies in kernel space of the target.
    ///
    /// 32-bit targets place the kernel in the upper 2 GiB; 64-bit targets in
    /// the upper canonical half.
    pub const fn is_kernel(self, is_32bit: bool) -> bool
    {
        if is_32bit {
            self.0 & KERNEL_BASE_32 == KERNEL_BASE_32 && self.0 >> 32 == 0
        } else {
            self.0 & KERNEL_BASE_64 == KERNEL_BASE_64
        }
    }

    /// Returns `true` if the address is a kernel address aligned to the
    /// target's pointer size (4 bytes on 32-bit, 8 bytes on 64-bit).
    pub const fn is_aligned_kernel(self, is_32bit: bool) -> bool
    {
        let mask = if is_32bit { 3 } else { 7 };
        self.is_kernel(is_32bit) && self.0 & mask == 0
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Address(value)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:016x}", self.0)
    }
}

impl fmt::LowerHex for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::UpperHex for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::UpperHex::fmt(&self.0, f)
    }
}

impl Add<u64> for Address
{
    type Output = Address;

    fn add(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for Address
{
    type Output = Address;

    fn sub(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_sub(rhs))
    }
}
