//! High-speed isochronous transfers
//!
//! Each packet gets its own iTD, linked into the frame slot of the
//! microframe it was placed in and unlinked by the scanner once that
//! microframe has passed. A request is admitted whole or not at all.

use crate::ehci::{Calendar, HostController, PortSpeed};
use crate::error::{Result, UsbError};
use crate::schedule::bandwidth::transfer_usecs;
use crate::schedule::config::{
    ISO_SCHEDULING_THRESHOLD_UFRAMES, MAX_ISO_PACKETS, MAX_ISO_PER_ENDPOINT, MAX_PERIODIC_USECS,
};
use crate::schedule::{EngineState, ItdSlot, PeriodicSchedule, ShadowLink};
use crate::transfer::{
    Endpoint, Handle, IsoPacket, IsoRequest, IsoStart, PacketResult, TransferType,
};
use heapless::Vec;

/// Isochronous request states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IsoState {
    /// Packets linked, waiting for their microframes
    Active,
    /// Unlinked, waiting for the quiescence window
    Cancelling,
}

/// Admission record of an isochronous request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoRecord {
    /// Target endpoint
    pub endpoint: Endpoint,
    /// DMA buffer all packet offsets are relative to
    pub buffer: u32,
    /// Microframes between packets
    pub interval: u32,
    /// Schedule microframe of the first packet
    pub start: u32,
    /// Packet layout as submitted
    pub packets: Vec<IsoPacket, MAX_ISO_PACKETS>,
    /// Aggregate committed microseconds
    pub usecs: u32,
    /// Current state
    pub state: IsoState,
    pub(crate) itds: Vec<u16, MAX_ISO_PACKETS>,
    pub(crate) results: Vec<PacketResult, MAX_ISO_PACKETS>,
    pub(crate) remaining: u16,
    pub(crate) error_count: u16,
    pub(crate) pending_release: u16,
    pub(crate) notify: bool,
}

impl IsoRecord {
    /// Microframes from the first to the last packet
    pub fn span(&self) -> u32 {
        (self.packets.len() as u32).saturating_sub(1) * self.interval
    }

    /// Results gathered so far
    pub fn results(&self) -> &[PacketResult] {
        &self.results
    }

    /// Packets not yet completed
    pub fn remaining(&self) -> u16 {
        self.remaining
    }

    /// Packets completed with an error
    pub fn error_count(&self) -> u16 {
        self.error_count
    }
}

impl<const FRAMES: usize, const N_QH: usize, const N_ITD: usize>
    PeriodicSchedule<FRAMES, N_QH, N_ITD>
{
    /// Admit an isochronous request of `packets` spaced `interval`
    /// microframes apart
    pub fn admit_isochronous<H: HostController>(
        &mut self,
        hc: &H,
        request: &IsoRequest,
        packets: &[IsoPacket],
        interval: u32,
    ) -> Result<Handle> {
        let result = self.try_admit_isochronous(hc, request, packets, interval);
        match result {
            Ok(_) => self.stats.iso_admitted += 1,
            Err(UsbError::NoSpace) => self.stats.rejected_no_space += 1,
            Err(_) => self.stats.rejected_other += 1,
        }
        result
    }

    fn try_admit_isochronous<H: HostController>(
        &mut self,
        hc: &H,
        request: &IsoRequest,
        packets: &[IsoPacket],
        interval: u32,
    ) -> Result<Handle> {
        let endpoint = &request.endpoint;
        match endpoint.speed {
            PortSpeed::HighSpeed => {}
            // Split isochronous through a transaction translator
            PortSpeed::FullSpeed | PortSpeed::LowSpeed => return Err(UsbError::NotImplemented),
            PortSpeed::Unknown => return Err(UsbError::Unsupported),
        }
        endpoint.validate()?;

        if packets.is_empty() || packets.len() > MAX_ISO_PACKETS {
            return Err(UsbError::InvalidParameter);
        }
        if packets[0].offset != 0 {
            return Err(UsbError::InvalidParameter);
        }
        for (i, packet) in packets.iter().enumerate() {
            if packet.length as u32 > endpoint.max_payload() {
                #[cfg(feature = "defmt")]
                defmt::debug!("Iso packet {} of {} bytes exceeds endpoint", i, packet.length);
                return Err(UsbError::PacketTooLarge { packet: i as u16 });
            }
        }
        if interval == 0 || !interval.is_power_of_two() || interval > Calendar::<FRAMES>::MODULUS {
            return Err(UsbError::InvalidParameter);
        }
        let span = (packets.len() as u32 - 1) * interval;
        if span >= Calendar::<FRAMES>::MODULUS {
            return Err(UsbError::InvalidParameter);
        }

        let now = Self::now(hc);
        let key = endpoint.key();
        let mut lead = ISO_SCHEDULING_THRESHOLD_UFRAMES;
        let mut active = 0;
        for record in self.isos.iter().flatten() {
            if record.state == IsoState::Active && record.endpoint.key() == key {
                active += 1;
                lead = lead.max(self.end_offset(record, now));
            }
        }
        if active >= MAX_ISO_PER_ENDPOINT {
            return Err(UsbError::NotImplemented);
        }

        // Candidate offsets from `now`; the last packet must stay ahead of
        // the scan position, which trails `now` until the next boundary
        let reach = Calendar::<FRAMES>::MODULUS - self.scan_lag(now);
        let limit = reach.saturating_sub(span);
        let (first, last) = match request.start {
            IsoStart::Asap => {
                if lead >= limit {
                    return Err(UsbError::NoSpace);
                }
                (lead, limit)
            }
            IsoStart::Microframe(uframe) => {
                let offset = Calendar::<FRAMES>::distance(now, uframe);
                if offset < lead || offset >= limit {
                    return Err(UsbError::InvalidParameter);
                }
                (offset, offset + 1)
            }
        };

        let mut costs: Vec<u16, MAX_ISO_PACKETS> = Vec::new();
        for packet in packets {
            let usecs = transfer_usecs(endpoint, packet.length as u32);
            if usecs > MAX_PERIODIC_USECS {
                return Err(UsbError::NoSpace);
            }
            let _ = costs.push(usecs as u16);
        }

        let offset = match self.find_iso_start(now, first, last, interval, &costs)? {
            Some(offset) => offset,
            None => return Err(UsbError::NoSpace),
        };

        let slot = self
            .isos
            .iter()
            .position(Option::is_none)
            .ok_or(UsbError::NoResources)?;
        let mut itds: Vec<u16, MAX_ISO_PACKETS> = Vec::new();
        for _ in packets {
            match self.itds.alloc() {
                Some(index) => {
                    let _ = itds.push(index as u16);
                }
                None => {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("iTD pool exhausted - {} packets requested", packets.len());
                    for &index in &itds {
                        self.itds.free(index as usize);
                    }
                    return Err(UsbError::NoResources);
                }
            }
        }

        let start = Calendar::<FRAMES>::wrap(now + offset);
        let usecs: u32 = costs.iter().map(|&c| c as u32).sum();
        let mut results = Vec::new();
        for _ in packets {
            let _ = results.push(PacketResult::PENDING);
        }
        self.isos[slot] = Some(IsoRecord {
            endpoint: *endpoint,
            buffer: request.buffer,
            interval,
            start,
            packets: Vec::from_slice(packets).map_err(|_| UsbError::InvalidParameter)?,
            usecs,
            state: IsoState::Active,
            itds: itds.clone(),
            results,
            remaining: packets.len() as u16,
            error_count: 0,
            pending_release: 0,
            notify: true,
        });

        for (i, packet) in packets.iter().enumerate() {
            let index = itds[i] as usize;
            let uframe = Calendar::<FRAMES>::wrap(start + i as u32 * interval);
            let microframe = Calendar::<FRAMES>::microframe_of(uframe);
            if let Some(itd) = self.itds.get(index) {
                itd.init_packet(
                    endpoint,
                    request.buffer.wrapping_add(packet.offset),
                    packet.length,
                    microframe,
                );
            }
            self.itd_slots[index] = Some(ItdSlot {
                request: Some(slot as u8),
                packet: i as u16,
                uframe,
                usecs: costs[i],
            });
        }
        for (i, &index) in itds.iter().enumerate() {
            let uframe = Calendar::<FRAMES>::wrap(start + i as u32 * interval);
            if let Err(e) = self.link_itd(Calendar::<FRAMES>::frame_of(uframe), index as usize) {
                self.deschedule_isochronous(slot, now, false)?;
                return Err(e);
            }
        }

        let handle = Handle::new(TransferType::Isochronous, slot, self.iso_generation[slot]);
        hc.claim_bandwidth(handle, usecs);

        #[cfg(feature = "defmt")]
        defmt::debug!(
            "Iso ep {=u8:#x}: {} packets every {} uframes from {} ({} us)",
            endpoint.address(),
            packets.len(),
            interval,
            start,
            usecs
        );

        Ok(handle)
    }

    /// Offset from `now` at which an active request's last packet has been
    /// followed by one more interval
    ///
    /// Measured from the scan position: every packet not yet scanned lies
    /// within one calendar pass ahead of it.
    fn end_offset(&self, record: &IsoRecord, now: u32) -> u32 {
        let behind = self.scan_lag(now);
        let base = Calendar::<FRAMES>::wrap(now + Calendar::<FRAMES>::MODULUS - behind);
        let last = Calendar::<FRAMES>::wrap(record.start + record.span());
        let end = Calendar::<FRAMES>::distance(base, last) + record.interval;
        end.saturating_sub(behind)
    }

    /// Microframes the next scan will visit before reaching `now`
    ///
    /// Zero while the engine is stopped: the scan position restarts at the
    /// hardware position when it comes up.
    fn scan_lag(&self, now: u32) -> u32 {
        match self.engine {
            EngineState::Running | EngineState::Stopping => {
                Calendar::<FRAMES>::distance(self.next_scan, now)
            }
            EngineState::Stopped | EngineState::Starting => 0,
        }
    }

    /// First offset in `first..last` where every packet fits
    fn find_iso_start(
        &self,
        now: u32,
        first: u32,
        last: u32,
        interval: u32,
        costs: &[u16],
    ) -> Result<Option<u32>> {
        'candidate: for offset in first..last {
            for (i, &usecs) in costs.iter().enumerate() {
                let uframe = now + offset + i as u32 * interval;
                let frame = Calendar::<FRAMES>::frame_of(uframe);
                let microframe = Calendar::<FRAMES>::microframe_of(uframe);
                if !self.fits(frame, microframe, usecs as u32)? {
                    continue 'candidate;
                }
            }
            return Ok(Some(offset));
        }
        Ok(None)
    }

    /// Unlink every packet of a request that is still linked and start
    /// their quiescence window
    pub(crate) fn deschedule_isochronous(
        &mut self,
        slot: usize,
        now: u32,
        notify: bool,
    ) -> Result<()> {
        let itds = match self.isos[slot].as_mut() {
            Some(record) if record.state == IsoState::Cancelling => {
                return Err(UsbError::InvalidState);
            }
            Some(record) => {
                record.state = IsoState::Cancelling;
                record.notify = notify;
                record.itds.clone()
            }
            None => return Err(UsbError::InvalidParameter),
        };

        let mut pending = 0;
        let mut result = Ok(());
        for &index in &itds {
            let index = index as usize;
            let Some(packet) = self.itd_slots[index] else {
                continue;
            };
            if packet.request != Some(slot as u8) || self.itd_retired[index].is_some() {
                continue;
            }
            let frame = Calendar::<FRAMES>::frame_of(packet.uframe);
            if let Err(e) = self.unlink(frame, ShadowLink::itd(index)) {
                #[cfg(feature = "defmt")]
                defmt::error!("Frame {} inconsistent while unlinking iTD {}", frame, index);
                self.stats.inconsistent_slots += 1;
                result = Err(e);
            }
            self.retire_itd(index, now);
            pending += 1;
        }

        if let Some(record) = self.isos[slot].as_mut() {
            record.pending_release = pending;
        }

        #[cfg(feature = "defmt")]
        defmt::debug!("Iso request {} descheduled, {} packets pending release", slot, pending);

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::test_support::{FakeController, RecordingSink};
    use crate::schedule::SlotEntry;
    use crate::transfer::Direction;

    type Schedule = PeriodicSchedule<32, 4, 64>;

    fn endpoint(number: u8) -> Endpoint {
        Endpoint::high_speed(5, number, Direction::In, 1024)
    }

    fn packets(count: usize, length: u16) -> Vec<IsoPacket, MAX_ISO_PACKETS> {
        (0..count)
            .map(|i| IsoPacket {
                offset: i as u32 * length as u32,
                length,
            })
            .collect()
    }

    fn asap(endpoint: Endpoint) -> IsoRequest {
        IsoRequest {
            endpoint,
            buffer: 0x2020_0000,
            start: IsoStart::Asap,
        }
    }

    #[test]
    fn test_validation_order() {
        let hc = FakeController::new();
        let mut schedule = Schedule::new();

        let mut fs = endpoint(1);
        fs.speed = PortSpeed::FullSpeed;
        assert_eq!(
            schedule.admit_isochronous(&hc, &asap(fs), &packets(1, 8), 1),
            Err(UsbError::NotImplemented)
        );

        let mut shifted = packets(2, 64);
        shifted[0].offset = 4;
        assert_eq!(
            schedule.admit_isochronous(&hc, &asap(endpoint(1)), &shifted, 1),
            Err(UsbError::InvalidParameter)
        );

        let mut large = packets(3, 512);
        large[2].length = 1025;
        assert_eq!(
            schedule.admit_isochronous(&hc, &asap(endpoint(1)), &large, 1),
            Err(UsbError::PacketTooLarge { packet: 2 })
        );

        assert_eq!(
            schedule.admit_isochronous(&hc, &asap(endpoint(1)), &[], 1),
            Err(UsbError::InvalidParameter)
        );
        assert_eq!(
            schedule.admit_isochronous(&hc, &asap(endpoint(1)), &packets(2, 8), 3),
            Err(UsbError::InvalidParameter)
        );
        assert_eq!(schedule.stats().rejected_other, 5);
    }

    #[test]
    fn test_high_bandwidth_payload_accepted() {
        let hc = FakeController::new();
        let mut schedule = Schedule::new();
        let ep = endpoint(1).with_mult(2);
        let handle = schedule
            .admit_isochronous(&hc, &asap(ep), &packets(2, 2048), 8)
            .unwrap();
        assert_eq!(schedule.claimed_usecs(handle), Some(84));
    }

    #[test]
    fn test_asap_respects_threshold() {
        let hc = FakeController::new();
        hc.set_uframe(100);
        let mut schedule = Schedule::new();
        let handle = schedule
            .admit_isochronous(&hc, &asap(endpoint(1)), &packets(4, 64), 2)
            .unwrap();
        let record = schedule.isochronous(handle).unwrap();
        assert_eq!(record.start, 100 + ISO_SCHEDULING_THRESHOLD_UFRAMES);

        for packet in 0..4 {
            let (itd, uframe) = schedule.iso_descriptor(handle, packet).unwrap();
            assert_eq!(uframe, record.start + packet as u32 * 2);
            assert!(itd
                .status(Calendar::<32>::microframe_of(uframe))
                .contains(crate::ehci::TransactionStatus::ACTIVE));
        }
    }

    #[test]
    fn test_explicit_start_window() {
        let hc = FakeController::new();
        let mut schedule = Schedule::new();
        let mut request = asap(endpoint(1));

        request.start = IsoStart::Microframe(4);
        assert_eq!(
            schedule.admit_isochronous(&hc, &request, &packets(2, 8), 1),
            Err(UsbError::InvalidParameter)
        );

        // 32 frames = 256 uframes; 8 packets every 16 span 112
        request.start = IsoStart::Microframe(150);
        assert_eq!(
            schedule.admit_isochronous(&hc, &request, &packets(8, 8), 16),
            Err(UsbError::InvalidParameter)
        );

        request.start = IsoStart::Microframe(40);
        let handle = schedule
            .admit_isochronous(&hc, &request, &packets(8, 8), 16)
            .unwrap();
        assert_eq!(schedule.isochronous(handle).unwrap().start, 40);
    }

    #[test]
    fn test_window_stops_short_of_scan_position() {
        let hc = FakeController::new();
        let mut schedule = PeriodicSchedule::<8, 4, 16>::new();
        schedule
            .admit_interrupt(
                &hc,
                &crate::transfer::InterruptRequest {
                    endpoint: Endpoint::high_speed(1, 1, Direction::In, 64),
                    buffer: 0x2020_0000,
                    length: 8,
                },
                1,
            )
            .unwrap();
        schedule.sync_engine(&hc).unwrap();
        assert_eq!(schedule.next_scan(), 0);

        // Boundary pending: uframes 0..8 are still to be scanned
        hc.set_uframe(8);
        let mut request = asap(endpoint(1));
        request.start = IsoStart::Microframe(4);
        assert_eq!(
            schedule.admit_isochronous(&hc, &request, &packets(1, 8), 1),
            Err(UsbError::InvalidParameter)
        );
        request.start = IsoStart::Microframe(63);
        assert_eq!(
            schedule.admit_isochronous(&hc, &request, &packets(2, 8), 1),
            Err(UsbError::InvalidParameter)
        );

        request.start = IsoStart::Microframe(60);
        let handle = schedule
            .admit_isochronous(&hc, &request, &packets(4, 8), 1)
            .unwrap();

        hc.advance(1);
        let mut sink = RecordingSink::default();
        let summary = schedule.on_frame_boundary(&hc, &mut sink);
        assert_eq!(summary.uframes, 9);
        assert!(sink.isochronous.is_empty());
        assert_eq!(schedule.retired(), 0);
        for packet in 0..4 {
            let (itd, uframe) = schedule.iso_descriptor(handle, packet).unwrap();
            assert_eq!(uframe, 60 + packet as u32);
            assert!(itd
                .status(Calendar::<8>::microframe_of(uframe))
                .contains(crate::ehci::TransactionStatus::ACTIVE));
        }
    }

    #[test]
    fn test_asap_refused_when_only_gap_is_free() {
        let hc = FakeController::new();
        let mut schedule = PeriodicSchedule::<8, 4, 16>::new();
        schedule
            .admit_interrupt(
                &hc,
                &crate::transfer::InterruptRequest {
                    endpoint: Endpoint::high_speed(1, 1, Direction::In, 64),
                    buffer: 0x2020_0000,
                    length: 8,
                },
                1,
            )
            .unwrap();
        schedule.sync_engine(&hc).unwrap();

        // Behind by 40: offsets 16..24 are the only ones left
        hc.set_uframe(40);
        assert_eq!(
            schedule.admit_isochronous(&hc, &asap(endpoint(1)), &packets(9, 8), 1),
            Err(UsbError::NoSpace)
        );
        let handle = schedule
            .admit_isochronous(&hc, &asap(endpoint(1)), &packets(8, 8), 1)
            .unwrap();
        assert_eq!(schedule.isochronous(handle).unwrap().start, 56);
    }

    #[test]
    fn test_third_stream_on_endpoint_refused() {
        let hc = FakeController::new();
        let mut schedule = Schedule::new();
        let first = schedule
            .admit_isochronous(&hc, &asap(endpoint(1)), &packets(4, 64), 1)
            .unwrap();
        let second = schedule
            .admit_isochronous(&hc, &asap(endpoint(1)), &packets(4, 64), 1)
            .unwrap();

        let first = schedule.isochronous(first).unwrap();
        let second = schedule.isochronous(second).unwrap();
        assert_eq!(second.start, first.start + 4);

        assert_eq!(
            schedule.admit_isochronous(&hc, &asap(endpoint(1)), &packets(1, 64), 1),
            Err(UsbError::NotImplemented)
        );
        assert!(schedule
            .admit_isochronous(&hc, &asap(endpoint(2)), &packets(1, 64), 1)
            .is_ok());
    }

    #[test]
    fn test_pool_exhaustion_links_nothing() {
        let hc = FakeController::new();
        let mut schedule = PeriodicSchedule::<8, 2, 4>::new();
        assert_eq!(
            schedule.admit_isochronous(&hc, &asap(endpoint(1)), &packets(5, 64), 1),
            Err(UsbError::NoResources)
        );
        assert_eq!(schedule.itds.available(), 4);
        for frame in 0..8 {
            assert_eq!(schedule.verify_slot(frame), Ok(0));
        }
    }

    #[test]
    fn test_packets_linked_at_slot_head() {
        let hc = FakeController::new();
        let mut schedule = Schedule::new();
        let ep = Endpoint::high_speed(1, 1, Direction::In, 64);
        schedule
            .admit_interrupt(
                &hc,
                &crate::transfer::InterruptRequest {
                    endpoint: ep,
                    buffer: 0x2020_0000,
                    length: 8,
                },
                1,
            )
            .unwrap();
        let iso = schedule
            .admit_isochronous(&hc, &asap(endpoint(2)), &packets(1, 64), 1)
            .unwrap();
        let start = schedule.isochronous(iso).unwrap().start;
        let frame = Calendar::<32>::frame_of(start);

        let mut kinds: Vec<bool, 4> = Vec::new();
        schedule
            .for_each_entry(frame, |entry| {
                let _ = kinds.push(matches!(entry, SlotEntry::Isochronous { .. }));
            })
            .unwrap();
        assert_eq!(kinds.as_slice(), &[true, false]);
        assert_eq!(schedule.verify_slot(frame), Ok(2));
    }

    #[test]
    fn test_cancel_unlinks_every_packet() {
        let hc = FakeController::new();
        let mut schedule = Schedule::new();
        let handle = schedule
            .admit_isochronous(&hc, &asap(endpoint(1)), &packets(6, 512), 8)
            .unwrap();
        schedule.cancel(&hc, handle).unwrap();

        for frame in 0..32 {
            assert_eq!(schedule.frame_usecs(frame), Ok([0; 8]));
            assert_eq!(schedule.verify_slot(frame), Ok(0));
        }
        assert_eq!(schedule.retired(), 6);
        assert_eq!(schedule.outstanding(), 0);
        assert_eq!(schedule.cancel(&hc, handle), Err(UsbError::InvalidState));
    }
}
