//! Completion scanner
//!
//! Each pass covers the microframes between the previous pass and the
//! hardware position, `[next_scan, now)`. The range is cut into per-frame
//! windows: a frame entirely behind `now` is examined for all eight
//! microframes, the frame holding `now` only up to it. Every microframe is
//! examined exactly once and in order, as long as passes come at least once
//! per calendar cycle.

use super::{EngineState, ItdSlot, PeriodicSchedule};
use crate::ehci::{Calendar, HostController, LinkType, MICROFRAMES_PER_FRAME};
use crate::error::{Result, UsbError};
use crate::transfer::{
    Completion, CompletionSink, Handle, InterruptState, IsoState, TransferType,
};

/// Microframes `[start, end)` of one frame slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScanWindow {
    /// Frame slot
    pub frame: usize,
    /// First microframe examined
    pub start: u8,
    /// One past the last microframe examined
    pub end: u8,
}

/// Splits a microframe range into per-frame windows
#[derive(Debug, Clone)]
pub struct ScanWindows<const FRAMES: usize> {
    cursor: u32,
    remaining: u32,
}

impl<const FRAMES: usize> ScanWindows<FRAMES> {
    /// Windows covering `[from, to)` around the calendar
    pub const fn new(from: u32, to: u32) -> Self {
        Self {
            cursor: Calendar::<FRAMES>::wrap(from),
            remaining: Calendar::<FRAMES>::distance(from, to),
        }
    }
}

impl<const FRAMES: usize> Iterator for ScanWindows<FRAMES> {
    type Item = ScanWindow;

    fn next(&mut self) -> Option<ScanWindow> {
        if self.remaining == 0 {
            return None;
        }
        let start = Calendar::<FRAMES>::microframe_of(self.cursor);
        let count = (MICROFRAMES_PER_FRAME - start as u32).min(self.remaining);
        let window = ScanWindow {
            frame: Calendar::<FRAMES>::frame_of(self.cursor),
            start,
            end: start + count as u8,
        };
        self.cursor = Calendar::<FRAMES>::wrap(self.cursor + count);
        self.remaining -= count;
        Some(window)
    }
}

/// Outcome of one scan pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScanSummary {
    /// First microframe examined
    pub from: u32,
    /// Where the pass stopped; the next pass starts here
    pub to: u32,
    /// Microframes examined
    pub uframes: u32,
    /// Frame slots walked
    pub frames: u16,
    /// Completions delivered (interrupt periods and finished iso requests)
    pub completions: u16,
    /// Slots abandoned as inconsistent
    pub inconsistent: u16,
    /// Descriptors released after quiescence
    pub released: u16,
    /// Engine not running, nothing examined
    pub skipped: bool,
}

impl<const FRAMES: usize, const N_QH: usize, const N_ITD: usize>
    PeriodicSchedule<FRAMES, N_QH, N_ITD>
{
    /// Frame boundary processing: release quiesced descriptors, then scan
    pub fn on_frame_boundary<H, S>(&mut self, hc: &H, sink: &mut S) -> ScanSummary
    where
        H: HostController,
        S: CompletionSink,
    {
        let released = self.reclaim(hc, sink);
        let mut summary = self.scan(hc, sink);
        summary.released = released as u16;
        summary
    }

    /// Walk the calendar from the last scan position up to the hardware
    ///
    /// Skipped while the engine is not running: nothing can have executed.
    pub fn scan<H, S>(&mut self, hc: &H, sink: &mut S) -> ScanSummary
    where
        H: HostController,
        S: CompletionSink,
    {
        let now = Self::now(hc);
        if !matches!(self.engine, EngineState::Running | EngineState::Stopping) {
            self.next_scan = now;
            return ScanSummary {
                from: now,
                to: now,
                skipped: true,
                ..ScanSummary::default()
            };
        }

        let from = self.next_scan;
        let mut summary = ScanSummary {
            from,
            to: now,
            uframes: Calendar::<FRAMES>::distance(from, now),
            ..ScanSummary::default()
        };

        for window in ScanWindows::<FRAMES>::new(from, now) {
            summary.frames += 1;
            match self.scan_slot(hc, sink, window, now) {
                Ok(completions) => summary.completions += completions,
                Err(_) => {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("Frame {} inconsistent, skipped", window.frame);
                    self.stats.inconsistent_slots += 1;
                    summary.inconsistent += 1;
                }
            }
        }

        self.next_scan = now;
        self.stats.scans += 1;

        #[cfg(feature = "defmt")]
        defmt::trace!("Scan {}..{}: {} completions", from, now, summary.completions);

        summary
    }

    /// Visit the nodes of one slot whose microframe lies in the window
    fn scan_slot<H, S>(
        &mut self,
        hc: &H,
        sink: &mut S,
        window: ScanWindow,
        now: u32,
    ) -> Result<u16>
    where
        H: HostController,
        S: CompletionSink,
    {
        let frame = window.frame;
        let in_window = |microframe: u8| (window.start..window.end).contains(&microframe);
        let mut completions = 0;
        let mut prev = None;
        let mut cursor = self.heads[frame];
        let mut steps = 0;

        while let Some(link) = cursor {
            steps += 1;
            if steps > Self::WALK_LIMIT {
                return Err(UsbError::Inconsistent);
            }
            let next = self.next_of(link)?;
            let index = link.index();

            match link.kind() {
                LinkType::Itd => {
                    let slot = self.itd_slots[index].ok_or(UsbError::Inconsistent)?;
                    if in_window(Calendar::<FRAMES>::microframe_of(slot.uframe)) {
                        // The packet's microframe has passed: done either way
                        self.set_after(frame, prev, next)?;
                        self.retire_itd(index, now);
                        if self.complete_packet(hc, sink, index, slot)? {
                            completions += 1;
                        }
                        cursor = next;
                        continue;
                    }
                }
                LinkType::Qh => {
                    if self.complete_interrupt(sink, index, &in_window)? {
                        completions += 1;
                    }
                }
                LinkType::Sitd | LinkType::Fstn => return Err(UsbError::Inconsistent),
            }

            prev = Some(link);
            cursor = next;
        }
        Ok(completions)
    }

    /// Report a finished interrupt period and re-arm the QH
    ///
    /// Returns whether a completion was delivered.
    fn complete_interrupt<S, F>(&mut self, sink: &mut S, index: usize, in_window: &F) -> Result<bool>
    where
        S: CompletionSink,
        F: Fn(u8) -> bool,
    {
        let record = self.interrupts[index]
            .as_mut()
            .ok_or(UsbError::Inconsistent)?;
        if record.state != InterruptState::Armed || !in_window(record.microframe) {
            return Ok(false);
        }
        let qh = self.qhs.get(index).ok_or(UsbError::Inconsistent)?;
        if qh.is_active() {
            return Ok(false);
        }

        let direction = record.endpoint.direction;
        let result = qh.result(direction, record.length);
        if result.status.is_error() {
            #[cfg(feature = "defmt")]
            defmt::warn!("Interrupt QH {} halted: {:?}", index, result.status);
            record.state = InterruptState::Halted;
            self.stats.packet_errors += 1;
        } else {
            qh.arm(direction, record.buffer, record.length);
        }

        let handle = Handle::new(TransferType::Interrupt, index, self.qh_generation[index]);
        self.stats.interrupt_completions += 1;
        sink.complete(Completion::Interrupt { handle, result });
        Ok(true)
    }

    /// Fold one finished iTD into its request; deliver the request once its
    /// last packet is in
    ///
    /// Returns whether the request completed.
    fn complete_packet<H, S>(
        &mut self,
        hc: &H,
        sink: &mut S,
        index: usize,
        slot: ItdSlot,
    ) -> Result<bool>
    where
        H: HostController,
        S: CompletionSink,
    {
        let request = slot.request.ok_or(UsbError::Inconsistent)? as usize;
        if let Some(itd_slot) = self.itd_slots[index].as_mut() {
            itd_slot.request = None;
        }

        let record = self
            .isos
            .get_mut(request)
            .and_then(|record| record.as_mut())
            .ok_or(UsbError::Inconsistent)?;
        if record.state != IsoState::Active {
            return Err(UsbError::Inconsistent);
        }
        let itd = self.itds.get(index).ok_or(UsbError::Inconsistent)?;
        let packet = slot.packet as usize;
        let requested = record
            .packets
            .get(packet)
            .ok_or(UsbError::Inconsistent)?
            .length;

        let microframe = Calendar::<FRAMES>::microframe_of(slot.uframe);
        let result = itd.result(microframe, record.endpoint.direction, requested);
        if result.status.is_error() {
            #[cfg(feature = "defmt")]
            defmt::debug!("Iso packet {} of request {}: {:?}", packet, request, result.status);
            record.error_count += 1;
            self.stats.packet_errors += 1;
        }
        if let Some(entry) = record.results.get_mut(packet) {
            *entry = result;
        }
        record.remaining = record.remaining.saturating_sub(1);
        if record.remaining > 0 {
            return Ok(false);
        }

        let handle = Handle::new(TransferType::Isochronous, request, self.iso_generation[request]);
        sink.complete(Completion::Isochronous {
            handle,
            packets: &record.results,
            error_count: record.error_count,
        });
        let usecs = record.usecs;
        self.isos[request] = None;
        self.iso_generation[request] = self.iso_generation[request].wrapping_add(1);
        self.stats.iso_completions += 1;
        hc.release_bandwidth(handle, usecs);
        Ok(true)
    }
}
