//! Periodic schedule core
//!
//! [`PeriodicSchedule`] owns everything the controller walks: the frame list,
//! the QH and iTD pools, and the shadow list that mirrors every hardware link
//! word. The shadow list is the only structure code reads back; hardware words
//! are written as a side effect of shadow mutation and never consulted for
//! traversal.
//!
//! All mutation takes `&mut self`. [`PeriodicScheduler`] wraps the core in the
//! single coarse lock together with the controller and runs the engine
//! handshake outside it.
//!
//! The schedule must not move once a request has been admitted: descriptors
//! are referenced by DMA address.

pub mod bandwidth;
mod engine;
mod retire;
pub mod scan;
mod shadow;
pub mod shared;

pub use engine::EngineState;
pub use scan::ScanSummary;
pub use shadow::SlotEntry;
pub use shared::PeriodicScheduler;

pub(crate) use shadow::ShadowLink;

use crate::dma::DescriptorPool;
use crate::ehci::{
    Calendar, HostController, IsoTransferDescriptor, PeriodicFrameList, QueueHead,
};
use crate::error::{Result, UsbError};
use crate::transfer::{Handle, InterruptRecord, IsoRecord, IsoState, TransferType};

/// Scheduler tunables
pub mod config {
    pub use crate::ehci::MICROFRAMES_PER_FRAME;

    /// Admission ceiling per microframe: 80% of 125 µs
    pub const MAX_PERIODIC_USECS: u32 = 100;

    /// How far ahead of the hardware position the first isochronous packet
    /// must be placed (two frames)
    pub const ISO_SCHEDULING_THRESHOLD_UFRAMES: u32 = 16;

    /// Microframes that must elapse after the hardware left the unlink frame
    /// before a retired node is released
    pub const QUIESCE_UFRAMES: u32 = 1;

    /// Packets in one isochronous request
    pub const MAX_ISO_PACKETS: usize = 64;

    /// Isochronous requests tracked at once (active or being cancelled)
    pub const MAX_ISO_REQUESTS: usize = 8;

    /// Concurrent isochronous requests on one endpoint direction
    pub const MAX_ISO_PER_ENDPOINT: usize = 2;
}

use config::MAX_ISO_REQUESTS;

/// Schedule counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScheduleStats {
    /// Interrupt requests admitted
    pub interrupt_admitted: u32,
    /// Isochronous requests admitted
    pub iso_admitted: u32,
    /// Admissions refused with `NoSpace`
    pub rejected_no_space: u32,
    /// Admissions refused with `Busy`
    pub rejected_busy: u32,
    /// Admissions refused for any other reason
    pub rejected_other: u32,
    /// Interrupt periods completed
    pub interrupt_completions: u32,
    /// Isochronous requests completed
    pub iso_completions: u32,
    /// Packets reported with an error status
    pub packet_errors: u32,
    /// Requests cancelled and released
    pub cancellations: u32,
    /// Scan passes that walked the calendar
    pub scans: u32,
    /// Slots skipped because the mirror was inconsistent
    pub inconsistent_slots: u32,
}

/// Scheduler bookkeeping for one linked iTD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ItdSlot {
    /// Owning isochronous request; cleared once the packet has completed
    pub request: Option<u8>,
    /// Packet index within the request
    pub packet: u16,
    /// Schedule microframe the packet occupies
    pub uframe: u32,
    /// Committed cost of the packet
    pub usecs: u16,
}

/// Periodic schedule: calendar, shadow list, pools and request tables
pub struct PeriodicSchedule<const FRAMES: usize, const N_QH: usize, const N_ITD: usize> {
    pub(crate) frame_list: PeriodicFrameList<FRAMES>,
    pub(crate) qhs: DescriptorPool<QueueHead, N_QH>,
    pub(crate) itds: DescriptorPool<IsoTransferDescriptor, N_ITD>,

    // Shadow list
    pub(crate) heads: [Option<ShadowLink>; FRAMES],
    pub(crate) qh_next: [Option<ShadowLink>; N_QH],
    pub(crate) itd_next: [Option<ShadowLink>; N_ITD],

    // Request tables
    pub(crate) interrupts: [Option<InterruptRecord>; N_QH],
    pub(crate) qh_generation: [u16; N_QH],
    pub(crate) itd_slots: [Option<ItdSlot>; N_ITD],
    pub(crate) isos: [Option<IsoRecord>; MAX_ISO_REQUESTS],
    pub(crate) iso_generation: [u16; MAX_ISO_REQUESTS],

    // Unlink microframe of nodes waiting for quiescence
    pub(crate) qh_retired: [Option<u32>; N_QH],
    pub(crate) itd_retired: [Option<u32>; N_ITD],

    pub(crate) engine: EngineState,
    pub(crate) next_scan: u32,
    pub(crate) stats: ScheduleStats,
}

impl<const FRAMES: usize, const N_QH: usize, const N_ITD: usize>
    PeriodicSchedule<FRAMES, N_QH, N_ITD>
{
    /// Create an empty schedule (const-compatible)
    pub const fn new() -> Self {
        Self {
            frame_list: PeriodicFrameList::new(),
            qhs: DescriptorPool::new(),
            itds: DescriptorPool::new(),
            heads: [None; FRAMES],
            qh_next: [None; N_QH],
            itd_next: [None; N_ITD],
            interrupts: [const { None }; N_QH],
            qh_generation: [0; N_QH],
            itd_slots: [None; N_ITD],
            isos: [const { None }; MAX_ISO_REQUESTS],
            iso_generation: [0; MAX_ISO_REQUESTS],
            qh_retired: [None; N_QH],
            itd_retired: [None; N_ITD],
            engine: EngineState::Stopped,
            next_scan: 0,
            stats: ScheduleStats {
                interrupt_admitted: 0,
                iso_admitted: 0,
                rejected_no_space: 0,
                rejected_busy: 0,
                rejected_other: 0,
                interrupt_completions: 0,
                iso_completions: 0,
                packet_errors: 0,
                cancellations: 0,
                scans: 0,
                inconsistent_slots: 0,
            },
        }
    }

    /// Address to program into PERIODICLISTBASE
    pub fn frame_list_base(&self) -> u32 {
        self.frame_list.base_address()
    }

    /// Hardware frame list
    pub fn frame_list(&self) -> &PeriodicFrameList<FRAMES> {
        &self.frame_list
    }

    /// Engine state as last decided
    pub fn engine_state(&self) -> EngineState {
        self.engine
    }

    /// Counters
    pub fn stats(&self) -> ScheduleStats {
        self.stats
    }

    /// Microframe the next scan pass starts at
    pub fn next_scan(&self) -> u32 {
        self.next_scan
    }

    /// Requests that keep the engine running
    ///
    /// Interrupt requests count until cancelled (halted ones included);
    /// isochronous requests count until their last packet completes.
    pub fn outstanding(&self) -> usize {
        let interrupts = self
            .interrupts
            .iter()
            .flatten()
            .filter(|record| record.is_outstanding())
            .count();
        let isos = self
            .isos
            .iter()
            .flatten()
            .filter(|record| record.state == IsoState::Active)
            .count();
        interrupts + isos
    }

    /// Descriptors waiting for the quiescence window
    pub fn retired(&self) -> usize {
        self.qh_retired.iter().flatten().count() + self.itd_retired.iter().flatten().count()
    }

    /// Current hardware position reduced onto the calendar
    pub(crate) fn now<H: HostController>(hc: &H) -> u32 {
        Calendar::<FRAMES>::wrap(hc.frame_index())
    }

    /// Record and queue head behind an interrupt handle
    pub(crate) fn interrupt_index(&self, handle: Handle) -> Result<usize> {
        let index = handle.slot();
        if handle.kind() != TransferType::Interrupt
            || index >= N_QH
            || self.qh_generation[index] != handle.generation()
            || self.interrupts[index].is_none()
        {
            return Err(UsbError::InvalidParameter);
        }
        Ok(index)
    }

    /// Request table slot behind an isochronous handle
    pub(crate) fn iso_index(&self, handle: Handle) -> Result<usize> {
        let index = handle.slot();
        if handle.kind() != TransferType::Isochronous
            || index >= MAX_ISO_REQUESTS
            || self.iso_generation[index] != handle.generation()
            || self.isos[index].is_none()
        {
            return Err(UsbError::InvalidParameter);
        }
        Ok(index)
    }

    /// Admission record of an interrupt request
    pub fn interrupt(&self, handle: Handle) -> Option<&InterruptRecord> {
        let index = self.interrupt_index(handle).ok()?;
        self.interrupts[index].as_ref()
    }

    /// Admission record of an isochronous request
    pub fn isochronous(&self, handle: Handle) -> Option<&IsoRecord> {
        let index = self.iso_index(handle).ok()?;
        self.isos[index].as_ref()
    }

    /// Queue head carrying an interrupt request
    pub fn queue_head(&self, handle: Handle) -> Option<&QueueHead> {
        let index = self.interrupt_index(handle).ok()?;
        self.qhs.get(index)
    }

    /// iTD carrying one packet of an isochronous request, with the schedule
    /// microframe the packet occupies
    pub fn iso_descriptor(
        &self,
        handle: Handle,
        packet: usize,
    ) -> Option<(&IsoTransferDescriptor, u32)> {
        let record = self.isochronous(handle)?;
        let index = *record.itds.get(packet)? as usize;
        let slot = self.itd_slots[index].as_ref()?;
        Some((self.itds.get(index)?, slot.uframe))
    }

    /// Bandwidth reported to the controller for an admitted request
    pub fn claimed_usecs(&self, handle: Handle) -> Option<u32> {
        match handle.kind() {
            TransferType::Interrupt => self.interrupt(handle).map(|r| r.claimed_usecs()),
            TransferType::Isochronous => self.isochronous(handle).map(|r| r.usecs),
        }
    }

    /// Withdraw a request
    ///
    /// Its nodes are unlinked immediately and released once the controller
    /// can no longer be looking at them; the sink then receives
    /// [`Completion::Cancelled`](crate::transfer::Completion::Cancelled).
    pub fn cancel<H: HostController>(&mut self, hc: &H, handle: Handle) -> Result<()> {
        self.withdraw(hc, handle, true)
    }

    pub(crate) fn withdraw<H: HostController>(
        &mut self,
        hc: &H,
        handle: Handle,
        notify: bool,
    ) -> Result<()> {
        let now = Self::now(hc);
        match handle.kind() {
            TransferType::Interrupt => {
                let index = self.interrupt_index(handle)?;
                self.deschedule_interrupt(index, now, notify)
            }
            TransferType::Isochronous => {
                let index = self.iso_index(handle)?;
                self.deschedule_isochronous(index, now, notify)
            }
        }
    }
}

impl<const FRAMES: usize, const N_QH: usize, const N_ITD: usize> Default
    for PeriodicSchedule<FRAMES, N_QH, N_ITD>
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::ehci::HostController;
    use crate::transfer::{Completion, CompletionSink, Handle, PacketResult};
    use core::cell::Cell;
    use heapless::Vec;

    /// Sink keeping every event it receives
    #[derive(Default)]
    pub struct RecordingSink {
        pub interrupts: Vec<(Handle, PacketResult), 64>,
        pub isochronous: Vec<(Handle, Vec<PacketResult, 64>, u16), 16>,
        pub cancelled: Vec<Handle, 16>,
    }

    impl CompletionSink for RecordingSink {
        fn complete(&mut self, completion: Completion<'_>) {
            match completion {
                Completion::Interrupt { handle, result } => {
                    let _ = self.interrupts.push((handle, result));
                }
                Completion::Isochronous {
                    handle,
                    packets,
                    error_count,
                } => {
                    let packets = Vec::from_slice(packets).unwrap_or_default();
                    let _ = self.isochronous.push((handle, packets, error_count));
                }
                Completion::Cancelled { handle } => {
                    let _ = self.cancelled.push(handle);
                }
            }
        }
    }

    /// Minimal controller: settable frame counter, engine follows requests
    pub struct FakeController {
        pub frame: Cell<u32>,
        pub enabled: Cell<bool>,
        pub acknowledge: Cell<bool>,
    }

    impl FakeController {
        pub fn new() -> Self {
            Self {
                frame: Cell::new(0),
                enabled: Cell::new(false),
                acknowledge: Cell::new(true),
            }
        }

        pub fn set_uframe(&self, uframe: u32) {
            self.frame.set(uframe);
        }

        pub fn advance(&self, uframes: u32) {
            self.frame.set(self.frame.get().wrapping_add(uframes));
        }
    }

    impl HostController for FakeController {
        fn frame_index(&self) -> u32 {
            self.frame.get()
        }

        fn set_periodic_enable(&self, enable: bool) {
            if self.acknowledge.get() {
                self.enabled.set(enable);
            }
        }

        fn periodic_status(&self) -> bool {
            self.enabled.get()
        }

        fn delay_us(&self, _us: u32) {}
    }
}
