//! Bandwidth accountant
//!
//! Committed time is never stored separately: it is summed from the shadow
//! list on demand, so it cannot drift from what is actually linked.
//!
//! High-speed cost model (USB 2.0 section 5.11.3): per-transaction overhead
//! plus bit-stuffed payload time, 2083 ps per bit.

use super::config::MAX_PERIODIC_USECS;
use super::PeriodicSchedule;
use crate::ehci::{LinkType, MICROFRAMES_PER_FRAME};
use crate::error::{Result, UsbError};
use crate::transfer::Endpoint;

/// High-speed bit time in picoseconds
const HS_BIT_PS: u32 = 2083;

/// Host delay per transaction in nanoseconds
const HOST_DELAY_NS: u32 = 5;

/// Bus time of one high-speed transaction of `bytes` payload, in ns
pub const fn hs_nsecs(bytes: u32) -> u32 {
    let stuffed = 7 * 8 * bytes / 6;
    ((55 * 8 * HS_BIT_PS) + HS_BIT_PS * (3 + stuffed)) / 1000 + HOST_DELAY_NS
}

/// Bus time of one high-speed transaction, rounded up to whole µs
pub const fn hs_usecs(bytes: u32) -> u32 {
    hs_nsecs(bytes).div_ceil(1000)
}

/// Cost of moving `length` bytes to `endpoint` within one microframe
///
/// High-bandwidth endpoints split the payload into up to three
/// `max_packet_size` transactions.
pub fn transfer_usecs(endpoint: &Endpoint, length: u32) -> u32 {
    let max_packet = endpoint.max_packet_size.max(1) as u32;
    if length == 0 {
        return hs_usecs(0);
    }
    let full = length / max_packet;
    let rest = length % max_packet;
    let mut usecs = full * hs_usecs(max_packet);
    if rest != 0 {
        usecs += hs_usecs(rest);
    }
    usecs
}

impl<const FRAMES: usize, const N_QH: usize, const N_ITD: usize>
    PeriodicSchedule<FRAMES, N_QH, N_ITD>
{
    /// Microseconds committed in `(frame, microframe)`
    ///
    /// Fails with `Inconsistent` if the slot holds a node kind this
    /// scheduler never links or its chain is broken.
    pub fn committed_usecs(&self, frame: usize, microframe: u8) -> Result<u32> {
        if microframe as u32 >= MICROFRAMES_PER_FRAME {
            return Err(UsbError::InvalidParameter);
        }
        let frame = frame % FRAMES;
        let mut total = 0;
        let mut cursor = self.heads[frame];
        let mut steps = 0;

        while let Some(link) = cursor {
            steps += 1;
            if steps > Self::WALK_LIMIT {
                return Err(UsbError::Inconsistent);
            }
            let index = link.index();
            match link.kind() {
                LinkType::Qh => {
                    let record = self
                        .interrupts
                        .get(index)
                        .and_then(|record| record.as_ref())
                        .ok_or(UsbError::Inconsistent)?;
                    let qh = self.qhs.get(index).ok_or(UsbError::Inconsistent)?;
                    if qh.s_mask() & (1 << microframe) != 0 {
                        total += record.usecs as u32;
                    }
                }
                LinkType::Itd => {
                    let slot = self
                        .itd_slots
                        .get(index)
                        .and_then(|slot| slot.as_ref())
                        .ok_or(UsbError::Inconsistent)?;
                    if slot.uframe % MICROFRAMES_PER_FRAME == microframe as u32 {
                        total += slot.usecs as u32;
                    }
                }
                LinkType::Sitd | LinkType::Fstn => {
                    #[cfg(feature = "defmt")]
                    defmt::error!("Unexpected node kind in frame {}", frame);
                    return Err(UsbError::Inconsistent);
                }
            }
            cursor = self.next_of(link)?;
        }
        Ok(total)
    }

    /// Committed microseconds for all eight microframes of `frame`
    pub fn frame_usecs(&self, frame: usize) -> Result<[u16; 8]> {
        let mut usecs = [0u16; 8];
        for (microframe, slot) in usecs.iter_mut().enumerate() {
            *slot = self.committed_usecs(frame, microframe as u8)? as u16;
        }
        Ok(usecs)
    }

    /// Whether `usecs` more fit into `(frame, microframe)`
    pub(crate) fn fits(&self, frame: usize, microframe: u8, usecs: u32) -> Result<bool> {
        Ok(self.committed_usecs(frame, microframe)? + usecs <= MAX_PERIODIC_USECS)
    }
}
