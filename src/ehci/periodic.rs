//! Periodic frame list and schedule time axis
//!
//! The EHCI periodic frame list is a power-of-two array of link pointers the
//! controller reads once per frame and walks again in each of the frame's 8
//! microframes. Schedule time is counted in microframes:
//! `uframe = frame * 8 + microframe`, modulo `FRAMES * 8`.

use super::link::LinkPointer;
use core::sync::atomic::{AtomicU32, Ordering};

/// Microframes per frame
pub const MICROFRAMES_PER_FRAME: u32 = 8;

/// Largest frame list the controller supports
pub const MAX_FRAME_LIST_SIZE: usize = 1024;

/// Periodic frame list
///
/// Must be 4096-byte aligned per EHCI specification. Only the schedule
/// writes entries, always as a consequence of a shadow-list mutation.
#[repr(C, align(4096))]
pub struct PeriodicFrameList<const FRAMES: usize> {
    entries: [AtomicU32; FRAMES],
}

impl<const FRAMES: usize> PeriodicFrameList<FRAMES> {
    const VALID_SIZE: () = assert!(
        FRAMES.is_power_of_two() && FRAMES >= 8 && FRAMES <= MAX_FRAME_LIST_SIZE,
        "frame list size must be a power of two in 8..=1024"
    );

    /// Create new frame list with all entries terminated
    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID_SIZE;
        const TERMINATED: AtomicU32 = AtomicU32::new(LinkPointer::TERMINATE.raw());
        Self {
            entries: [TERMINATED; FRAMES],
        }
    }

    /// Address for the PERIODICLISTBASE register
    pub fn base_address(&self) -> u32 {
        self.entries.as_ptr() as usize as u32
    }

    /// Read the entry for `frame`
    pub fn entry(&self, frame: usize) -> LinkPointer {
        LinkPointer::from_raw(self.entries[frame % FRAMES].load(Ordering::Acquire))
    }

    pub(crate) fn set_entry(&self, frame: usize, link: LinkPointer) {
        self.entries[frame % FRAMES].store(link.raw(), Ordering::Release);
    }
}

impl<const FRAMES: usize> Default for PeriodicFrameList<FRAMES> {
    fn default() -> Self {
        Self::new()
    }
}

/// Schedule time arithmetic for a `FRAMES`-long calendar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calendar<const FRAMES: usize>;

impl<const FRAMES: usize> Calendar<FRAMES> {
    /// Microframes in one pass over the frame list
    pub const MODULUS: u32 = FRAMES as u32 * MICROFRAMES_PER_FRAME;

    /// Reduce any microframe count onto the calendar
    #[inline]
    pub const fn wrap(uframe: u32) -> u32 {
        uframe % Self::MODULUS
    }

    /// Frame slot of a schedule microframe
    #[inline]
    pub const fn frame_of(uframe: u32) -> usize {
        (Self::wrap(uframe) / MICROFRAMES_PER_FRAME) as usize
    }

    /// Microframe within its frame
    #[inline]
    pub const fn microframe_of(uframe: u32) -> u8 {
        (uframe % MICROFRAMES_PER_FRAME) as u8
    }

    /// Forward distance from `from` to `to` around the calendar
    #[inline]
    pub const fn distance(from: u32, to: u32) -> u32 {
        (Self::wrap(to) + Self::MODULUS - Self::wrap(from)) % Self::MODULUS
    }

    /// Schedule microframe of `(frame, microframe)`
    #[inline]
    pub const fn uframe(frame: usize, microframe: u8) -> u32 {
        Self::wrap(frame as u32 * MICROFRAMES_PER_FRAME + microframe as u32)
    }
}
