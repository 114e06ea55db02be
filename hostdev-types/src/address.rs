//! PCI bus address identity.
//!
//! [`PciAddress`] is the identity of a PCI function across every registry in
//! the manager: equality is structural, by `(domain, bus, slot, function)`.

use core::fmt;

/// A PCI domain:bus:slot.function address.
///
/// `slot` is a 5-bit device number (0..=31) and `function` a 3-bit function
/// number (0..=7); both are stored widened to their natural integer type
/// since Rust has no sub-byte integer primitives, but values outside those
/// ranges are rejected by [`PciAddress::new`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

impl PciAddress {
    /// Construct an address, validating that `slot` and `function` fit the
    /// PCI config-space address encoding (5 and 3 bits respectively).
    pub fn new(domain: u16, bus: u8, slot: u8, function: u8) -> Option<Self> {
        if slot > 0x1F || function > 0x07 {
            return None;
        }
        Some(Self {
            domain,
            bus,
            slot,
            function,
        })
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}
