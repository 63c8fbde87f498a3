//! Periodic transfer requests, handles and completion reporting
//!
//! The generic request object of the surrounding driver is reduced here to
//! what admission and completion need: the target endpoint, a DMA buffer
//! address, packet descriptors and a sink for results.

pub mod interrupt;
pub mod isochronous;

use crate::ehci::PortSpeed;
use crate::error::{Result, UsbError};

pub use interrupt::{InterruptRecord, InterruptState};
pub use isochronous::{IsoRecord, IsoState};

/// Periodic transfer types handled by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferType {
    /// Recurring interrupt transfer on a queue head
    Interrupt,
    /// Multi-packet isochronous request on iTDs
    Isochronous,
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// Identifies one endpoint direction for the single-in-flight rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointKey {
    device_address: u8,
    endpoint: u8,
    direction: Direction,
}

/// Target endpoint of a periodic request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Endpoint {
    /// Device address (0-127)
    pub device_address: u8,
    /// Endpoint number without direction bit (0-15)
    pub number: u8,
    /// Transfer direction
    pub direction: Direction,
    /// Link speed of the device
    pub speed: PortSpeed,
    /// wMaxPacketSize bits 10:0
    pub max_packet_size: u16,
    /// Transactions per microframe (1-3, "high-bandwidth" when above 1)
    pub mult: u8,
}

impl Endpoint {
    /// High-speed endpoint with one transaction per microframe
    pub const fn high_speed(
        device_address: u8,
        number: u8,
        direction: Direction,
        max_packet_size: u16,
    ) -> Self {
        Self {
            device_address,
            number,
            direction,
            speed: PortSpeed::HighSpeed,
            max_packet_size,
            mult: 1,
        }
    }

    /// Same endpoint with a high-bandwidth multiplier
    pub const fn with_mult(mut self, mult: u8) -> Self {
        self.mult = mult;
        self
    }

    /// Key used to detect concurrent requests on one endpoint direction
    pub const fn key(&self) -> EndpointKey {
        EndpointKey {
            device_address: self.device_address,
            endpoint: self.number,
            direction: self.direction,
        }
    }

    /// Largest payload the endpoint moves in one microframe
    pub const fn max_payload(&self) -> u32 {
        self.max_packet_size as u32 * self.mult as u32
    }

    /// Endpoint address with direction bit (0x80 for IN)
    pub const fn address(&self) -> u8 {
        match self.direction {
            Direction::In => self.number | 0x80,
            Direction::Out => self.number,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.device_address > 127 || self.number > 15 {
            return Err(UsbError::InvalidParameter);
        }
        if self.max_packet_size == 0 || self.max_packet_size > 1024 {
            return Err(UsbError::InvalidParameter);
        }
        if !(1..=3).contains(&self.mult) {
            return Err(UsbError::InvalidParameter);
        }
        Ok(())
    }
}

/// Handle to an admitted periodic request
///
/// The generation guards against a stale handle naming a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Handle {
    kind: TransferType,
    slot: u16,
    generation: u16,
}

impl Handle {
    pub(crate) const fn new(kind: TransferType, slot: usize, generation: u16) -> Self {
        Self {
            kind,
            slot: slot as u16,
            generation,
        }
    }

    /// Transfer type of the request
    pub const fn kind(&self) -> TransferType {
        self.kind
    }

    pub(crate) const fn slot(&self) -> usize {
        self.slot as usize
    }

    pub(crate) const fn generation(&self) -> u16 {
        self.generation
    }
}

/// Interrupt transfer request
#[derive(Debug, Clone, Copy)]
pub struct InterruptRequest {
    /// Target endpoint
    pub endpoint: Endpoint,
    /// DMA address of the data buffer
    pub buffer: u32,
    /// Bytes moved per period (at most the endpoint's max payload)
    pub length: u16,
}

/// One packet of an isochronous request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IsoPacket {
    /// Offset of the packet within the request buffer
    pub offset: u32,
    /// Packet length in bytes
    pub length: u16,
}

/// Where an isochronous request may start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IsoStart {
    /// First fitting microframe after the scheduling threshold
    Asap,
    /// Exactly this schedule microframe (`frame * 8 + microframe`)
    Microframe(u32),
}

/// Isochronous transfer request
#[derive(Debug, Clone, Copy)]
pub struct IsoRequest {
    /// Target endpoint
    pub endpoint: Endpoint,
    /// DMA address of the single buffer all packets live in
    pub buffer: u32,
    /// Start policy
    pub start: IsoStart,
}

/// Per-packet outcome reported by hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketStatus {
    /// Full-length success
    Ok,
    /// Success with fewer bytes than requested (including zero-length)
    Short,
    /// IN data could not be stored in time
    Overrun,
    /// OUT data could not be fetched in time
    Underrun,
    /// Device sent more than the packet allowed
    Babble,
    /// CRC, timeout or bad PID
    ProtocolError,
    /// Endpoint halted
    Stall,
    /// Hardware never executed the transaction
    Missed,
    /// Not yet completed
    Pending,
}

impl PacketStatus {
    /// Whether the packet counts as an error
    pub const fn is_error(self) -> bool {
        !matches!(self, Self::Ok | Self::Short | Self::Pending)
    }
}

/// Result of one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PacketResult {
    /// Outcome
    pub status: PacketStatus,
    /// Bytes actually transferred
    pub actual_length: u16,
}

impl PacketResult {
    pub(crate) const PENDING: Self = Self {
        status: PacketStatus::Pending,
        actual_length: 0,
    };
}

/// Completion event delivered to the sink
#[derive(Debug, PartialEq, Eq)]
pub enum Completion<'a> {
    /// One period of an interrupt transfer finished; the node stays armed
    /// for the next period unless `result.status` is an error
    Interrupt {
        /// Request the period belongs to
        handle: Handle,
        /// Outcome of this period
        result: PacketResult,
    },
    /// Last packet of an isochronous request finished
    Isochronous {
        /// Finished request
        handle: Handle,
        /// Per-packet outcome, in submission order
        packets: &'a [PacketResult],
        /// Packets that did not complete successfully
        error_count: u16,
    },
    /// Request withdrawn and its descriptors released
    Cancelled {
        /// Withdrawn request
        handle: Handle,
    },
}

/// Receiver of completion events
///
/// Called with the schedule lock held: implementations must not call back
/// into the scheduler.
pub trait CompletionSink {
    /// Deliver one completion
    fn complete(&mut self, completion: Completion<'_>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_address_direction_bit() {
        let ep_in = Endpoint::high_speed(1, 2, Direction::In, 512);
        let ep_out = Endpoint::high_speed(1, 2, Direction::Out, 512);
        assert_eq!(ep_in.address(), 0x82);
        assert_eq!(ep_out.address(), 0x02);
        assert_ne!(ep_in.key(), ep_out.key());
    }

    #[test]
    fn test_endpoint_validation() {
        assert!(Endpoint::high_speed(1, 1, Direction::In, 64).validate().is_ok());
        assert_eq!(
            Endpoint::high_speed(128, 1, Direction::In, 64).validate(),
            Err(UsbError::InvalidParameter)
        );
        assert_eq!(
            Endpoint::high_speed(1, 1, Direction::In, 1025).validate(),
            Err(UsbError::InvalidParameter)
        );
        assert_eq!(
            Endpoint::high_speed(1, 1, Direction::In, 1024)
                .with_mult(4)
                .validate(),
            Err(UsbError::InvalidParameter)
        );
    }

    #[test]
    fn test_high_bandwidth_payload() {
        let ep = Endpoint::high_speed(3, 1, Direction::In, 1024).with_mult(3);
        assert_eq!(ep.max_payload(), 3072);
    }

    #[test]
    fn test_packet_status_error_classes() {
        assert!(!PacketStatus::Ok.is_error());
        assert!(!PacketStatus::Short.is_error());
        assert!(PacketStatus::Babble.is_error());
        assert!(PacketStatus::Missed.is_error());
    }
}
