//! Periodic link pointer words
//!
//! Frame list entries and the "next" word of every periodic descriptor share
//! one format (EHCI Specification Section 3.1): bits 31:5 hold the descriptor
//! address, bits 2:1 the descriptor type and bit 0 the terminate flag.

/// Terminate bit
pub const TERMINATE: u32 = 1;

const TYPE_SHIFT: u32 = 1;
const TYPE_MASK: u32 = 0b11;
const ADDRESS_MASK: u32 = !0x1F;

/// Descriptor type encoded in a link pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkType {
    /// Isochronous transfer descriptor (high-speed isochronous)
    Itd = 0,
    /// Queue head (interrupt)
    Qh = 1,
    /// Split-transaction isochronous descriptor
    Sitd = 2,
    /// Frame span traversal node
    Fstn = 3,
}

impl LinkType {
    const fn from_bits(bits: u32) -> Self {
        match bits & TYPE_MASK {
            0 => Self::Itd,
            1 => Self::Qh,
            2 => Self::Sitd,
            _ => Self::Fstn,
        }
    }
}

/// Hardware link pointer value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(transparent)]
pub struct LinkPointer(u32);

impl LinkPointer {
    /// End-of-list marker
    pub const TERMINATE: Self = Self(TERMINATE);

    /// Build a link to a 32-byte aligned descriptor
    pub const fn new(address: u32, link_type: LinkType) -> Self {
        Self((address & ADDRESS_MASK) | ((link_type as u32) << TYPE_SHIFT))
    }

    /// Wrap a raw word read back from descriptor memory
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw word as written to descriptor memory
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether this word ends the list
    pub const fn is_terminate(self) -> bool {
        self.0 & TERMINATE != 0
    }

    /// Descriptor address (meaningless when terminated)
    pub const fn address(self) -> u32 {
        self.0 & ADDRESS_MASK
    }

    /// Descriptor type (meaningless when terminated)
    pub const fn link_type(self) -> LinkType {
        LinkType::from_bits(self.0 >> TYPE_SHIFT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_encoding() {
        let link = LinkPointer::new(0x2020_0040, LinkType::Qh);
        assert_eq!(link.raw(), 0x2020_0042);
        assert!(!link.is_terminate());
        assert_eq!(link.address(), 0x2020_0040);
        assert_eq!(link.link_type(), LinkType::Qh);
    }

    #[test]
    fn test_low_address_bits_discarded() {
        let link = LinkPointer::new(0x1000_003F, LinkType::Itd);
        assert_eq!(link.address(), 0x1000_0020);
        assert_eq!(link.link_type(), LinkType::Itd);
    }

    #[test]
    fn test_terminate() {
        assert!(LinkPointer::TERMINATE.is_terminate());
        assert!(LinkPointer::from_raw(0xFFFF_FFFF).is_terminate());
        assert_eq!(LinkPointer::from_raw(0x6).link_type(), LinkType::Fstn);
    }
}
