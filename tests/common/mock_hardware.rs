//! Mock hardware helpers for testing without a real EHCI controller
//!
//! The controller's frame counter is advanced by the test; the periodic
//! enable bit is mirrored into the status bit unless acknowledgement is
//! switched off.

use ehci_periodic::ehci::qh::token;
use ehci_periodic::ehci::{IsoTransferDescriptor, QueueHead};
use ehci_periodic::{Completion, CompletionSink, Handle, HostController, PacketResult};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::vec::Vec;

/// Simulated EHCI operational registers
pub struct MockController {
    frindex: AtomicU32,
    pse: AtomicBool,
    pss: AtomicBool,
    acknowledge: AtomicBool,
    claimed: AtomicI64,
    handshakes: AtomicU32,
}

impl MockController {
    pub fn new() -> Self {
        Self {
            frindex: AtomicU32::new(0),
            pse: AtomicBool::new(false),
            pss: AtomicBool::new(false),
            acknowledge: AtomicBool::new(true),
            claimed: AtomicI64::new(0),
            handshakes: AtomicU32::new(0),
        }
    }

    /// Move the hardware position to `uframe`
    pub fn set_uframe(&self, uframe: u32) {
        self.frindex.store(uframe, Ordering::SeqCst);
    }

    /// Advance the hardware position by `uframes`
    pub fn advance(&self, uframes: u32) {
        self.frindex.fetch_add(uframes, Ordering::SeqCst);
    }

    pub fn uframe(&self) -> u32 {
        self.frindex.load(Ordering::SeqCst)
    }

    /// Stop mirroring PSE into PSS
    pub fn set_acknowledge(&self, acknowledge: bool) {
        self.acknowledge.store(acknowledge, Ordering::SeqCst);
    }

    /// Whether software has requested the periodic schedule
    pub fn periodic_enabled(&self) -> bool {
        self.pse.load(Ordering::SeqCst)
    }

    /// Net bandwidth reported through the claim/release hooks
    pub fn claimed_usecs(&self) -> i64 {
        self.claimed.load(Ordering::SeqCst)
    }

    /// Enable/disable requests seen
    pub fn handshakes(&self) -> u32 {
        self.handshakes.load(Ordering::SeqCst)
    }
}

impl Default for MockController {
    fn default() -> Self {
        Self::new()
    }
}

impl HostController for MockController {
    fn frame_index(&self) -> u32 {
        self.frindex.load(Ordering::SeqCst)
    }

    fn set_periodic_enable(&self, enable: bool) {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        self.pse.store(enable, Ordering::SeqCst);
        if self.acknowledge.load(Ordering::SeqCst) {
            self.pss.store(enable, Ordering::SeqCst);
        }
    }

    fn periodic_status(&self) -> bool {
        self.pss.load(Ordering::SeqCst)
    }

    fn delay_us(&self, _us: u32) {}

    fn claim_bandwidth(&self, _handle: Handle, usecs: u32) {
        self.claimed.fetch_add(usecs as i64, Ordering::SeqCst);
    }

    fn release_bandwidth(&self, _handle: Handle, usecs: u32) {
        self.claimed.fetch_sub(usecs as i64, Ordering::SeqCst);
    }
}

/// Completion sink keeping every event
#[derive(Default, Debug)]
pub struct RecordingSink {
    pub interrupts: Vec<(Handle, PacketResult)>,
    pub isochronous: Vec<(Handle, Vec<PacketResult>, u16)>,
    pub cancelled: Vec<Handle>,
}

impl CompletionSink for RecordingSink {
    fn complete(&mut self, completion: Completion<'_>) {
        match completion {
            Completion::Interrupt { handle, result } => self.interrupts.push((handle, result)),
            Completion::Isochronous {
                handle,
                packets,
                error_count,
            } => self.isochronous.push((handle, packets.to_vec(), error_count)),
            Completion::Cancelled { handle } => self.cancelled.push(handle),
        }
    }
}

/// Play the controller finishing an interrupt transaction of `length` bytes
pub fn finish_qh(qh: &QueueHead, length: u16) {
    let value = qh.token.load(Ordering::Acquire);
    let remaining = (value >> token::TOTAL_BYTES_SHIFT) & token::TOTAL_BYTES_MASK;
    let left = remaining.saturating_sub(length as u32);
    let toggled = (value ^ token::DATA_TOGGLE) & token::DATA_TOGGLE;
    qh.token.store(
        toggled | (left << token::TOTAL_BYTES_SHIFT),
        Ordering::Release,
    );
}

/// Play the controller finishing the iTD transaction in `microframe`
pub fn finish_itd(itd: &IsoTransferDescriptor, microframe: u8) {
    itd.transactions[microframe as usize & 7].fetch_and(!(1 << 31), Ordering::AcqRel);
}

/// Deterministic xorshift generator for randomized sequences
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Uniform-ish value in `0..bound`
    pub fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound
    }
}
