//! Shared test utilities for ehci-periodic tests
//!
//! A simulated controller, a recording completion sink and small request
//! builders used across the integration tests.

#![allow(dead_code)]

pub mod mock_hardware;

pub use mock_hardware::{finish_itd, finish_qh, MockController, RecordingSink, XorShift};

use ehci_periodic::{Direction, Endpoint, InterruptRequest, IsoPacket, IsoRequest, IsoStart};

/// High-bandwidth interrupt IN endpoint (3 x 1024 bytes per microframe)
pub fn wide_endpoint(device: u8, number: u8) -> Endpoint {
    Endpoint::high_speed(device, number, Direction::In, 1024).with_mult(3)
}

/// Interrupt request moving `length` bytes per period
pub fn interrupt_request(device: u8, number: u8, length: u16) -> InterruptRequest {
    InterruptRequest {
        endpoint: wide_endpoint(device, number),
        buffer: 0x2020_0000 + ((device as u32) << 12),
        length,
    }
}

/// Isochronous OUT request on a high-bandwidth endpoint
pub fn iso_request(device: u8, number: u8, start: IsoStart) -> IsoRequest {
    IsoRequest {
        endpoint: Endpoint::high_speed(device, number, Direction::Out, 1024).with_mult(3),
        buffer: 0x2030_0000 + ((device as u32) << 16),
        start,
    }
}

/// `count` back-to-back packets of `length` bytes
pub fn iso_packets(count: usize, length: u16) -> Vec<IsoPacket> {
    (0..count)
        .map(|i| IsoPacket {
            offset: i as u32 * length as u32,
            length,
        })
        .collect()
}

/// Payload lengths with a known high-speed cost on [`wide_endpoint`]
pub mod cost {
    /// 30 µs
    pub const USECS_30: u16 = 1400;
    /// 40 µs
    pub const USECS_40: u16 = 1920;
    /// 50 µs
    pub const USECS_50: u16 = 2400;
    /// 60 µs
    pub const USECS_60: u16 = 2900;
    /// 63 µs, the most one endpoint can take
    pub const USECS_63: u16 = 3072;
}
