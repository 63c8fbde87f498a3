//! Scheduler error types

use core::fmt;

/// Scheduler operation result type
pub type Result<T> = core::result::Result<T, UsbError>;

/// Errors reported by admission, cancellation and the engine handshake
///
/// Per-packet hardware errors are not represented here; they travel through
/// the completion sink as [`PacketStatus`](crate::transfer::PacketStatus).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbError {
    /// Endpoint speed class is not handled by this scheduler
    Unsupported,
    /// An interrupt transfer is already in flight on this endpoint
    Busy,
    /// Isochronous packet exceeds the endpoint's capability
    PacketTooLarge {
        /// Index of the offending packet within the request
        packet: u16,
    },
    /// No bandwidth-compliant placement exists
    NoSpace,
    /// Request needs a path this scheduler does not provide
    /// (split transactions, a third isochronous stream on one endpoint)
    NotImplemented,
    /// Internal consistency violation (corrupt node tag, broken chain)
    Inconsistent,
    /// Periodic engine did not acknowledge an enable/disable in time
    HardwareTimeout,
    /// Invalid parameter
    InvalidParameter,
    /// Invalid state for operation
    InvalidState,
    /// No available resources (descriptors, request slots)
    NoResources,
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported => write!(f, "Unsupported endpoint speed"),
            Self::Busy => write!(f, "Endpoint busy"),
            Self::PacketTooLarge { packet } => write!(f, "Packet {} too large", packet),
            Self::NoSpace => write!(f, "No periodic bandwidth available"),
            Self::NotImplemented => write!(f, "Not implemented"),
            Self::Inconsistent => write!(f, "Periodic schedule inconsistent"),
            Self::HardwareTimeout => write!(f, "Periodic engine handshake timed out"),
            Self::InvalidParameter => write!(f, "Invalid parameter"),
            Self::InvalidState => write!(f, "Invalid state"),
            Self::NoResources => write!(f, "No resources available"),
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use std::string::ToString;

    #[test]
    fn test_display_names_packet_index() {
        assert_eq!(
            UsbError::PacketTooLarge { packet: 3 }.to_string(),
            "Packet 3 too large"
        );
        assert_eq!(UsbError::NoSpace.to_string(), "No periodic bandwidth available");
    }
}
