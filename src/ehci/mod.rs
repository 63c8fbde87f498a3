//! EHCI periodic-schedule hardware structures
//!
//! Descriptor layouts and register bits the periodic scheduler touches:
//! - Periodic frame list and link pointers (EHCI Specification Section 3.1)
//! - Isochronous Transfer Descriptor (Section 3.3)
//! - Queue Head (Section 3.6)
//! - USBCMD / USBSTS / FRINDEX / PERIODICLISTBASE (Section 2.3)
//!
//! The controller itself is reached through [`HostController`] so the
//! scheduler can run against a simulated controller in tests.

pub mod controller;
pub mod itd;
pub mod link;
pub mod periodic;
pub mod qh;

pub use controller::HostController;
#[cfg(feature = "imxrt")]
pub use controller::ImxrtEhci;
pub use itd::{IsoTransferDescriptor, TransactionStatus};
pub use link::{LinkPointer, LinkType};
pub use periodic::{Calendar, PeriodicFrameList, MICROFRAMES_PER_FRAME};
pub use qh::QueueHead;

use bitflags::bitflags;

/// Port speed detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortSpeed {
    /// 12 Mbps
    FullSpeed,
    /// 1.5 Mbps
    LowSpeed,
    /// 480 Mbps
    HighSpeed,
    /// Not reported by the port
    Unknown,
}

bitflags! {
    /// USB Command Register (USBCMD) bits used by the periodic engine
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbCmd: u32 {
        /// Run/Stop (RS) - Bit 0
        const RUN_STOP = 1 << 0;
        /// Frame List Size - Bits [3:2]
        const FRAME_LIST_SIZE_MASK = 0b11 << 2;
        /// Periodic Schedule Enable (PSE) - Bit 4
        const PERIODIC_SCHEDULE_ENABLE = 1 << 4;
        /// Frame List Size bit 2 (i.MX RT extension) - Bit 15
        const FRAME_LIST_SIZE_2 = 1 << 15;
    }
}

bitflags! {
    /// USB Status Register (USBSTS) bits used by the periodic engine
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbSts: u32 {
        /// Frame List Rollover (FLR) - Bit 3
        const FRAME_LIST_ROLLOVER = 1 << 3;
        /// Host Controller Halted (HCHalted) - Bit 12
        const HC_HALTED = 1 << 12;
        /// Periodic Schedule Status (PSS) - Bit 14
        const PERIODIC_SCHEDULE_STATUS = 1 << 14;
    }
}

/// Timeout constants for the periodic engine handshake (in microseconds)
pub mod timeouts {
    /// Schedule enable/disable timeout (2ms)
    pub const SCHEDULE_TIMEOUT_US: u32 = 2_000;
    /// Interval between PSS polls
    pub const SCHEDULE_POLL_US: u32 = 10;
}
