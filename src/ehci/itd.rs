//! Isochronous Transfer Descriptor (iTD)
//!
//! Based on EHCI Specification Section 3.3. The scheduler gives every packet
//! its own iTD and uses exactly one of the eight transaction slots: the one
//! matching the microframe the packet was placed in.

use super::link::LinkPointer;
use crate::transfer::{Direction, Endpoint, PacketResult, PacketStatus};
use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};

bitflags! {
    /// Transaction status bits (dword 1-8, bits 31:28)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransactionStatus: u32 {
        /// Transaction still owned by the controller
        const ACTIVE = 1 << 31;
        /// Controller could not keep up with the data (overrun/underrun)
        const DATA_BUFFER_ERROR = 1 << 30;
        /// Babble detected
        const BABBLE = 1 << 29;
        /// Transaction error (CRC, timeout, bad PID)
        const TRANSACTION_ERROR = 1 << 28;
    }
}

/// Transaction word fields
#[allow(missing_docs)]
pub mod transaction {
    pub const LENGTH_SHIFT: u32 = 16;
    pub const LENGTH_MASK: u32 = 0xFFF;
    pub const INTERRUPT_ON_COMPLETE: u32 = 1 << 15;
    pub const PAGE_SHIFT: u32 = 12;
    pub const PAGE_MASK: u32 = 0x7;
    pub const OFFSET_MASK: u32 = 0xFFF;
}

/// Buffer page pointer fields carrying endpoint information
#[allow(missing_docs)]
pub mod buffer {
    pub const POINTER_MASK: u32 = !0xFFF;
    pub const DEVICE_ADDRESS_MASK: u32 = 0x7F;
    pub const ENDPOINT_SHIFT: u32 = 8;
    pub const ENDPOINT_MASK: u32 = 0xF;
    pub const DIRECTION_IN: u32 = 1 << 11;
    pub const MAX_PACKET_MASK: u32 = 0x7FF;
    pub const MULT_MASK: u32 = 0x3;
}

/// Isochronous Transfer Descriptor
///
/// Must be 32-byte aligned for DMA
#[repr(C, align(32))]
pub struct IsoTransferDescriptor {
    /// Next link pointer
    pub next_link: AtomicU32,
    /// Transaction status and control, one per microframe
    pub transactions: [AtomicU32; 8],
    /// Buffer page pointers
    pub buffer_pages: [AtomicU32; 7],
}

impl IsoTransferDescriptor {
    /// Terminator bit
    pub const TERMINATE: u32 = 1;

    /// Create an unlinked iTD with no active transactions
    pub const fn new() -> Self {
        const ZERO: AtomicU32 = AtomicU32::new(0);
        Self {
            next_link: AtomicU32::new(Self::TERMINATE),
            transactions: [ZERO; 8],
            buffer_pages: [ZERO; 7],
        }
    }

    /// Program one packet of `length` bytes at `address` into the
    /// transaction slot for `microframe`
    pub fn init_packet(&self, ep: &Endpoint, address: u32, length: u16, microframe: u8) {
        let page = address & buffer::POINTER_MASK;

        self.buffer_pages[0].store(
            page | ((ep.number as u32 & buffer::ENDPOINT_MASK) << buffer::ENDPOINT_SHIFT)
                | (ep.device_address as u32 & buffer::DEVICE_ADDRESS_MASK),
            Ordering::Release,
        );
        let dir = match ep.direction {
            Direction::In => buffer::DIRECTION_IN,
            Direction::Out => 0,
        };
        self.buffer_pages[1].store(
            page.wrapping_add(0x1000) | dir | (ep.max_packet_size as u32 & buffer::MAX_PACKET_MASK),
            Ordering::Release,
        );
        self.buffer_pages[2].store(ep.mult as u32 & buffer::MULT_MASK, Ordering::Release);
        for page_ptr in &self.buffer_pages[3..] {
            page_ptr.store(0, Ordering::Release);
        }

        for (i, slot) in self.transactions.iter().enumerate() {
            if i == microframe as usize {
                slot.store(
                    TransactionStatus::ACTIVE.bits()
                        | ((length as u32 & transaction::LENGTH_MASK) << transaction::LENGTH_SHIFT)
                        | transaction::INTERRUPT_ON_COMPLETE
                        | (address & transaction::OFFSET_MASK),
                    Ordering::Release,
                );
            } else {
                slot.store(0, Ordering::Release);
            }
        }
    }

    /// Raw transaction word for `microframe`
    pub fn transaction(&self, microframe: u8) -> u32 {
        self.transactions[microframe as usize & 7].load(Ordering::Acquire)
    }

    /// Status bits of the transaction in `microframe`
    pub fn status(&self, microframe: u8) -> TransactionStatus {
        TransactionStatus::from_bits_truncate(self.transaction(microframe))
    }

    /// Classify the transaction in `microframe`
    ///
    /// A transaction still marked active after its microframe passed was
    /// never executed and is reported as missed.
    pub fn result(&self, microframe: u8, direction: Direction, requested: u16) -> PacketResult {
        let word = self.transaction(microframe);
        let status = TransactionStatus::from_bits_truncate(word);
        let length = ((word >> transaction::LENGTH_SHIFT) & transaction::LENGTH_MASK) as u16;

        if status.contains(TransactionStatus::ACTIVE) {
            return PacketResult {
                status: PacketStatus::Missed,
                actual_length: 0,
            };
        }

        let packet_status = if status.contains(TransactionStatus::DATA_BUFFER_ERROR) {
            match direction {
                Direction::In => PacketStatus::Overrun,
                Direction::Out => PacketStatus::Underrun,
            }
        } else if status.contains(TransactionStatus::BABBLE) {
            PacketStatus::Babble
        } else if status.contains(TransactionStatus::TRANSACTION_ERROR) {
            PacketStatus::ProtocolError
        } else {
            PacketStatus::Ok
        };

        // IN transactions report the received length; OUT keep the request
        let actual = match (packet_status, direction) {
            (PacketStatus::Ok, Direction::In) => length.min(requested),
            (PacketStatus::Ok, Direction::Out) => requested,
            _ => 0,
        };
        let packet_status = if packet_status == PacketStatus::Ok && actual < requested {
            PacketStatus::Short
        } else {
            packet_status
        };

        PacketResult {
            status: packet_status,
            actual_length: actual,
        }
    }

    /// Hardware next link
    pub fn next(&self) -> LinkPointer {
        LinkPointer::from_raw(self.next_link.load(Ordering::Acquire))
    }

    /// Point the hardware next link
    pub fn set_next(&self, link: LinkPointer) {
        self.next_link.store(link.raw(), Ordering::Release);
    }

    /// Return to the freshly constructed state
    pub fn reset(&self) {
        self.next_link.store(Self::TERMINATE, Ordering::Release);
        for word in self.transactions.iter().chain(self.buffer_pages.iter()) {
            word.store(0, Ordering::Release);
        }
    }
}

impl Default for IsoTransferDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = assert!(core::mem::size_of::<IsoTransferDescriptor>() == 64);
const _: () = assert!(core::mem::align_of::<IsoTransferDescriptor>() >= 32);

#[cfg(test)]
mod tests {
    use super::*;

    fn iso_in() -> Endpoint {
        Endpoint::high_speed(2, 3, Direction::In, 1024).with_mult(2)
    }

    #[test]
    fn test_init_packet_uses_one_slot() {
        let itd = IsoTransferDescriptor::new();
        itd.init_packet(&iso_in(), 0x2021_0F00, 1500, 5);

        for uframe in 0..8u8 {
            if uframe == 5 {
                assert!(itd.status(uframe).contains(TransactionStatus::ACTIVE));
            } else {
                assert_eq!(itd.transaction(uframe), 0);
            }
        }

        let word = itd.transaction(5);
        assert_eq!((word >> transaction::LENGTH_SHIFT) & transaction::LENGTH_MASK, 1500);
        assert_eq!(word & transaction::OFFSET_MASK, 0xF00);
        assert_eq!((word >> transaction::PAGE_SHIFT) & transaction::PAGE_MASK, 0);

        let page0 = itd.buffer_pages[0].load(Ordering::Relaxed);
        assert_eq!(page0 & buffer::POINTER_MASK, 0x2021_0000);
        assert_eq!(page0 & buffer::DEVICE_ADDRESS_MASK, 2);
        assert_eq!((page0 >> buffer::ENDPOINT_SHIFT) & buffer::ENDPOINT_MASK, 3);

        let page1 = itd.buffer_pages[1].load(Ordering::Relaxed);
        assert_eq!(page1 & buffer::POINTER_MASK, 0x2021_1000);
        assert_ne!(page1 & buffer::DIRECTION_IN, 0);
        assert_eq!(page1 & buffer::MAX_PACKET_MASK, 1024);
        assert_eq!(itd.buffer_pages[2].load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_result_classification() {
        let itd = IsoTransferDescriptor::new();
        itd.init_packet(&iso_in(), 0x2021_0000, 512, 0);
        assert_eq!(itd.result(0, Direction::In, 512).status, PacketStatus::Missed);

        // received 100 bytes
        itd.transactions[0].store(100 << transaction::LENGTH_SHIFT, Ordering::Relaxed);
        let short = itd.result(0, Direction::In, 512);
        assert_eq!(short.status, PacketStatus::Short);
        assert_eq!(short.actual_length, 100);

        itd.transactions[0].store(0, Ordering::Relaxed);
        let zero = itd.result(0, Direction::In, 512);
        assert_eq!(zero.status, PacketStatus::Short);
        assert_eq!(zero.actual_length, 0);

        itd.transactions[0].store(TransactionStatus::BABBLE.bits(), Ordering::Relaxed);
        assert_eq!(itd.result(0, Direction::In, 512).status, PacketStatus::Babble);

        itd.transactions[0].store(TransactionStatus::DATA_BUFFER_ERROR.bits(), Ordering::Relaxed);
        assert_eq!(itd.result(0, Direction::In, 512).status, PacketStatus::Overrun);
        assert_eq!(itd.result(0, Direction::Out, 512).status, PacketStatus::Underrun);

        itd.transactions[0].store(TransactionStatus::TRANSACTION_ERROR.bits(), Ordering::Relaxed);
        assert_eq!(itd.result(0, Direction::In, 512).status, PacketStatus::ProtocolError);
    }

    #[test]
    fn test_out_success_reports_full_length() {
        let itd = IsoTransferDescriptor::new();
        let ep = Endpoint::high_speed(2, 4, Direction::Out, 512);
        itd.init_packet(&ep, 0x2021_0000, 256, 7);
        itd.transactions[7].fetch_and(!TransactionStatus::ACTIVE.bits(), Ordering::Relaxed);
        let result = itd.result(7, Direction::Out, 256);
        assert_eq!(result.status, PacketStatus::Ok);
        assert_eq!(result.actual_length, 256);
    }

    #[test]
    fn test_reset() {
        let itd = IsoTransferDescriptor::new();
        itd.init_packet(&iso_in(), 0x2021_0000, 512, 1);
        itd.reset();
        assert!(itd.next().is_terminate());
        assert_eq!(itd.transaction(1), 0);
    }
}
