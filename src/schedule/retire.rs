//! Deferred release of unlinked descriptors
//!
//! An unlinked node may still be under the controller's cursor: it read the
//! old link before the splice. The controller re-reads the frame list entry
//! at every frame start and only follows links within the current frame, so
//! once the counter has left the unlink frame (plus `QUIESCE_UFRAMES`) no
//! traversal can reach the node.

use super::config::{MAX_ISO_REQUESTS, QUIESCE_UFRAMES};
use super::{EngineState, PeriodicSchedule};
use crate::ehci::{Calendar, HostController, MICROFRAMES_PER_FRAME};
use crate::transfer::{Completion, CompletionSink, Handle, IsoState, TransferType};

impl<const FRAMES: usize, const N_QH: usize, const N_ITD: usize>
    PeriodicSchedule<FRAMES, N_QH, N_ITD>
{
    pub(crate) fn retire_qh(&mut self, index: usize, now: u32) {
        self.qh_retired[index] = Some(now);
    }

    pub(crate) fn retire_itd(&mut self, index: usize, now: u32) {
        self.itd_retired[index] = Some(now);
    }

    /// Whether a node unlinked at `since` can no longer be reached
    pub(crate) fn quiesced(&self, since: u32, now: u32) -> bool {
        if self.engine == EngineState::Stopped {
            return true;
        }
        let to_next_frame = MICROFRAMES_PER_FRAME - since % MICROFRAMES_PER_FRAME;
        Calendar::<FRAMES>::distance(since, now) >= to_next_frame + QUIESCE_UFRAMES
    }

    /// Release every retired descriptor whose quiescence window has passed
    ///
    /// Cancelled requests are reported to `sink` once their last
    /// descriptor is released. Returns the number of descriptors released.
    pub fn reclaim<H, S>(&mut self, hc: &H, sink: &mut S) -> usize
    where
        H: HostController,
        S: CompletionSink,
    {
        let now = Self::now(hc);
        let mut released = 0;

        for index in 0..N_QH {
            let Some(since) = self.qh_retired[index] else {
                continue;
            };
            if !self.quiesced(since, now) {
                continue;
            }
            self.qh_retired[index] = None;
            self.qh_next[index] = None;
            self.qhs.free(index);
            released += 1;

            let handle = Handle::new(TransferType::Interrupt, index, self.qh_generation[index]);
            self.qh_generation[index] = self.qh_generation[index].wrapping_add(1);
            if let Some(record) = self.interrupts[index].take() {
                hc.release_bandwidth(handle, record.claimed_usecs());
                if record.notify {
                    self.stats.cancellations += 1;
                    sink.complete(Completion::Cancelled { handle });
                }
            }
        }

        for index in 0..N_ITD {
            let Some(since) = self.itd_retired[index] else {
                continue;
            };
            if !self.quiesced(since, now) {
                continue;
            }
            self.itd_retired[index] = None;
            self.itd_next[index] = None;
            self.itds.free(index);
            released += 1;

            let owner = self.itd_slots[index].take().and_then(|slot| slot.request);
            if let Some(record) = owner.and_then(|r| self.isos[r as usize].as_mut()) {
                record.pending_release = record.pending_release.saturating_sub(1);
            }
        }

        for slot in 0..MAX_ISO_REQUESTS {
            let done = matches!(
                &self.isos[slot],
                Some(record) if record.state == IsoState::Cancelling && record.pending_release == 0
            );
            if !done {
                continue;
            }
            let handle = Handle::new(TransferType::Isochronous, slot, self.iso_generation[slot]);
            self.iso_generation[slot] = self.iso_generation[slot].wrapping_add(1);
            if let Some(record) = self.isos[slot].take() {
                hc.release_bandwidth(handle, record.usecs);
                if record.notify {
                    self.stats.cancellations += 1;
                    sink.complete(Completion::Cancelled { handle });
                }
            }
        }

        #[cfg(feature = "defmt")]
        if released > 0 {
            defmt::trace!("Released {} periodic descriptors at uframe {}", released, now);
        }

        released
    }
}
