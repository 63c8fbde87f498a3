//! Queue Head (qH) for periodic interrupt endpoints
//!
//! Based on EHCI Specification Section 3.6. Interrupt nodes run their single
//! transaction straight from the overlay area: software writes an active
//! token with `next_qtd` terminated and the controller executes it in every
//! microframe named by the S-mask.

use super::link::LinkPointer;
use crate::transfer::{Direction, Endpoint, PacketResult, PacketStatus};
use core::sync::atomic::{AtomicU32, Ordering};

/// Endpoint characteristics field bits
#[allow(missing_docs)]
pub mod endpoint {
    pub const DEVICE_ADDRESS_SHIFT: u32 = 0;
    pub const DEVICE_ADDRESS_MASK: u32 = 0x7F;

    pub const ENDPOINT_NUMBER_SHIFT: u32 = 8;
    pub const ENDPOINT_NUMBER_MASK: u32 = 0xF;

    pub const ENDPOINT_SPEED_SHIFT: u32 = 12;
    pub const SPEED_FULL: u32 = 0;
    pub const SPEED_LOW: u32 = 1;
    pub const SPEED_HIGH: u32 = 2;

    pub const DATA_TOGGLE_CONTROL: u32 = 1 << 14;

    pub const MAX_PACKET_LENGTH_SHIFT: u32 = 16;
    pub const MAX_PACKET_LENGTH_MASK: u32 = 0x7FF;
}

/// Endpoint capabilities field bits
#[allow(missing_docs)]
pub mod capabilities {
    pub const INTERRUPT_SCHEDULE_MASK_SHIFT: u32 = 0;
    pub const INTERRUPT_SCHEDULE_MASK_MASK: u32 = 0xFF;

    pub const SPLIT_COMPLETION_MASK_SHIFT: u32 = 8;
    pub const SPLIT_COMPLETION_MASK_MASK: u32 = 0xFF;

    pub const MULT_SHIFT: u32 = 30;
    pub const MULT_MASK: u32 = 0x3;
}

/// Overlay token field bits
#[allow(missing_docs)]
pub mod token {
    pub const STATUS_ACTIVE: u32 = 1 << 7;
    pub const STATUS_HALTED: u32 = 1 << 6;
    pub const STATUS_DATA_BUFFER_ERROR: u32 = 1 << 5;
    pub const STATUS_BABBLE: u32 = 1 << 4;
    pub const STATUS_TRANSACTION_ERROR: u32 = 1 << 3;
    pub const STATUS_MISSED_MICROFRAME: u32 = 1 << 2;
    pub const STATUS_MASK: u32 = 0xFF;

    pub const PID_OUT: u32 = 0x0 << 8;
    pub const PID_IN: u32 = 0x1 << 8;

    pub const ERROR_COUNTER_SHIFT: u32 = 10;

    pub const INTERRUPT_ON_COMPLETE: u32 = 1 << 15;

    pub const TOTAL_BYTES_SHIFT: u32 = 16;
    pub const TOTAL_BYTES_MASK: u32 = 0x7FFF;

    pub const DATA_TOGGLE: u32 = 1 << 31;
}

/// Queue Head (qH)
///
/// EHCI Specification Section 3.6
/// Must be 32-byte aligned for DMA
#[repr(C, align(32))]
pub struct QueueHead {
    /// Horizontal link pointer to the next periodic descriptor
    pub horizontal_link: AtomicU32,

    /// Endpoint characteristics
    pub endpoint_chars: AtomicU32,

    /// Endpoint capabilities (S-mask, C-mask, multiplier)
    pub endpoint_caps: AtomicU32,

    /// Current qTD pointer (overlay area begins here)
    pub current_qtd: AtomicU32,

    /// Next qTD pointer
    pub next_qtd: AtomicU32,

    /// Alternate next qTD
    pub alt_next_qtd: AtomicU32,

    /// Token (status and control)
    pub token: AtomicU32,

    /// Buffer pointers
    pub buffer_pointers: [AtomicU32; 5],

    /// Extended buffer pointers (unused on 32-bit controllers)
    pub ext_buffer_pointers: [AtomicU32; 5],

    _reserved: [u32; 4],
}

impl QueueHead {
    /// Terminator bit
    pub const TERMINATE: u32 = 1;

    /// Create new unlinked, inactive Queue Head
    pub const fn new() -> Self {
        Self {
            horizontal_link: AtomicU32::new(Self::TERMINATE),
            endpoint_chars: AtomicU32::new(0),
            endpoint_caps: AtomicU32::new(0),
            current_qtd: AtomicU32::new(Self::TERMINATE),
            next_qtd: AtomicU32::new(Self::TERMINATE),
            alt_next_qtd: AtomicU32::new(Self::TERMINATE),
            token: AtomicU32::new(0),
            buffer_pointers: [
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
            ],
            ext_buffer_pointers: [
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
            ],
            _reserved: [0; 4],
        }
    }

    /// Program a high-speed interrupt endpoint running in the microframes
    /// named by `s_mask`
    pub fn init_interrupt(&self, ep: &Endpoint, s_mask: u8) {
        let mut chars = 0u32;
        chars |= (ep.device_address as u32 & endpoint::DEVICE_ADDRESS_MASK)
            << endpoint::DEVICE_ADDRESS_SHIFT;
        chars |= (ep.number as u32 & endpoint::ENDPOINT_NUMBER_MASK)
            << endpoint::ENDPOINT_NUMBER_SHIFT;
        chars |= endpoint::SPEED_HIGH << endpoint::ENDPOINT_SPEED_SHIFT;
        chars |= endpoint::DATA_TOGGLE_CONTROL;
        chars |= (ep.max_packet_size as u32 & endpoint::MAX_PACKET_LENGTH_MASK)
            << endpoint::MAX_PACKET_LENGTH_SHIFT;
        self.endpoint_chars.store(chars, Ordering::Release);

        let mut caps = 0u32;
        caps |= (s_mask as u32) << capabilities::INTERRUPT_SCHEDULE_MASK_SHIFT;
        caps |= (ep.mult as u32 & capabilities::MULT_MASK) << capabilities::MULT_SHIFT;
        self.endpoint_caps.store(caps, Ordering::Release);

        self.current_qtd.store(Self::TERMINATE, Ordering::Release);
        self.next_qtd.store(Self::TERMINATE, Ordering::Release);
        self.alt_next_qtd.store(Self::TERMINATE, Ordering::Release);
        self.token.store(0, Ordering::Release);
    }

    /// Microframes this endpoint starts transactions in
    pub fn s_mask(&self) -> u8 {
        let caps = self.endpoint_caps.load(Ordering::Acquire);
        ((caps >> capabilities::INTERRUPT_SCHEDULE_MASK_SHIFT)
            & capabilities::INTERRUPT_SCHEDULE_MASK_MASK) as u8
    }

    /// Split-completion mask (always zero for high-speed nodes)
    pub fn c_mask(&self) -> u8 {
        let caps = self.endpoint_caps.load(Ordering::Acquire);
        ((caps >> capabilities::SPLIT_COMPLETION_MASK_SHIFT)
            & capabilities::SPLIT_COMPLETION_MASK_MASK) as u8
    }

    /// Arm the overlay for one transaction of `length` bytes at `buffer`
    ///
    /// The data toggle left behind by the previous transaction is kept.
    pub fn arm(&self, direction: Direction, buffer: u32, length: u16) {
        let page = buffer & !0xFFF;
        self.buffer_pointers[0].store(buffer, Ordering::Release);
        for (i, ptr) in self.buffer_pointers.iter().enumerate().skip(1) {
            ptr.store(page.wrapping_add(0x1000 * i as u32), Ordering::Release);
        }

        let toggle = self.token.load(Ordering::Acquire) & token::DATA_TOGGLE;
        let pid = match direction {
            Direction::In => token::PID_IN,
            Direction::Out => token::PID_OUT,
        };
        let value = toggle
            | ((length as u32 & token::TOTAL_BYTES_MASK) << token::TOTAL_BYTES_SHIFT)
            | token::INTERRUPT_ON_COMPLETE
            | (3 << token::ERROR_COUNTER_SHIFT)
            | pid
            | token::STATUS_ACTIVE;
        self.token.store(value, Ordering::Release);
    }

    /// Deactivate the overlay so the controller skips this node
    pub fn disarm(&self) {
        self.token.fetch_and(!token::STATUS_ACTIVE, Ordering::AcqRel);
    }

    /// Check if the overlay transaction is still pending
    pub fn is_active(&self) -> bool {
        self.token.load(Ordering::Acquire) & token::STATUS_ACTIVE != 0
    }

    /// Decode the finished overlay transaction
    pub fn result(&self, direction: Direction, requested: u16) -> PacketResult {
        let value = self.token.load(Ordering::Acquire);
        let remaining = (value >> token::TOTAL_BYTES_SHIFT) & token::TOTAL_BYTES_MASK;
        let actual = (requested as u32).saturating_sub(remaining) as u16;

        let status = if value & token::STATUS_BABBLE != 0 {
            PacketStatus::Babble
        } else if value & token::STATUS_DATA_BUFFER_ERROR != 0 {
            match direction {
                Direction::In => PacketStatus::Overrun,
                Direction::Out => PacketStatus::Underrun,
            }
        } else if value & (token::STATUS_TRANSACTION_ERROR | token::STATUS_MISSED_MICROFRAME) != 0
        {
            PacketStatus::ProtocolError
        } else if value & token::STATUS_HALTED != 0 {
            PacketStatus::Stall
        } else if actual < requested {
            PacketStatus::Short
        } else {
            PacketStatus::Ok
        };

        PacketResult {
            status,
            actual_length: actual,
        }
    }

    /// Hardware next link
    pub fn next(&self) -> LinkPointer {
        LinkPointer::from_raw(self.horizontal_link.load(Ordering::Acquire))
    }

    /// Point the hardware next link
    pub fn set_next(&self, link: LinkPointer) {
        self.horizontal_link.store(link.raw(), Ordering::Release);
    }

    /// Return to the freshly constructed state
    pub fn reset(&self) {
        self.horizontal_link.store(Self::TERMINATE, Ordering::Release);
        self.endpoint_chars.store(0, Ordering::Release);
        self.endpoint_caps.store(0, Ordering::Release);
        self.current_qtd.store(Self::TERMINATE, Ordering::Release);
        self.next_qtd.store(Self::TERMINATE, Ordering::Release);
        self.alt_next_qtd.store(Self::TERMINATE, Ordering::Release);
        self.token.store(0, Ordering::Release);
        for ptr in &self.buffer_pointers {
            ptr.store(0, Ordering::Release);
        }
    }
}

impl Default for QueueHead {
    fn default() -> Self {
        Self::new()
    }
}

// Ensure size is correct per EHCI spec
const _: () = assert!(core::mem::size_of::<QueueHead>() == 96);
const _: () = assert!(core::mem::align_of::<QueueHead>() >= 32);
