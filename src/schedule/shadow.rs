//! Shadow list mirror
//!
//! Every frame slot is a singly linked chain. The shadow copy of each link
//! is authoritative; the hardware word is rewritten from it on every change,
//! the node's own `next` before any pointer that publishes the node.
//!
//! Slot order: iTDs first (newest first), then QHs by descending period,
//! newest first among equal periods. A QH of period `P` is present in every
//! slot `phase + k*P`, and so is every QH of a shorter period that follows
//! it, which keeps each QH's successor identical in all slots sharing it.

use super::PeriodicSchedule;
use crate::ehci::{LinkPointer, LinkType};
use crate::error::{Result, UsbError};
use crate::transfer::{Handle, TransferType};

/// Shadow copy of one link word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ShadowLink {
    kind: LinkType,
    index: u16,
}

impl ShadowLink {
    pub(crate) const fn qh(index: usize) -> Self {
        Self {
            kind: LinkType::Qh,
            index: index as u16,
        }
    }

    pub(crate) const fn itd(index: usize) -> Self {
        Self {
            kind: LinkType::Itd,
            index: index as u16,
        }
    }

    #[cfg(test)]
    pub(crate) const fn raw(kind: LinkType, index: usize) -> Self {
        Self {
            kind,
            index: index as u16,
        }
    }

    pub(crate) const fn kind(self) -> LinkType {
        self.kind
    }

    pub(crate) const fn index(self) -> usize {
        self.index as usize
    }
}

/// A node as seen while walking a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlotEntry {
    /// Interrupt QH
    Interrupt {
        /// Owning request
        handle: Handle,
        /// Period in frames
        period: u16,
        /// Microframe the transaction starts in
        microframe: u8,
    },
    /// One isochronous packet
    Isochronous {
        /// Owning request, `None` once the packet has completed
        handle: Option<Handle>,
        /// Schedule microframe of the packet
        uframe: u32,
    },
}

impl<const FRAMES: usize, const N_QH: usize, const N_ITD: usize>
    PeriodicSchedule<FRAMES, N_QH, N_ITD>
{
    /// Longest chain a slot can hold; anything longer is a cycle
    pub(crate) const WALK_LIMIT: usize = N_QH + N_ITD + 1;

    /// Hardware word for a shadow link
    pub(crate) fn hw_link(&self, link: Option<ShadowLink>) -> LinkPointer {
        match link {
            Some(link) => match link.kind {
                LinkType::Qh => self.qhs.link(link.index()),
                LinkType::Itd => self.itds.link(link.index()),
                LinkType::Sitd | LinkType::Fstn => LinkPointer::TERMINATE,
            },
            None => LinkPointer::TERMINATE,
        }
    }

    /// Shadow successor of a linked node
    pub(crate) fn next_of(&self, link: ShadowLink) -> Result<Option<ShadowLink>> {
        let index = link.index();
        match link.kind {
            LinkType::Qh if self.qhs.is_allocated(index) => Ok(self.qh_next[index]),
            LinkType::Itd if self.itds.is_allocated(index) => Ok(self.itd_next[index]),
            _ => Err(UsbError::Inconsistent),
        }
    }

    /// Period of a linked QH
    fn period_of(&self, index: usize) -> Result<u16> {
        self.interrupts
            .get(index)
            .and_then(|record| record.as_ref())
            .map(|record| record.period)
            .ok_or(UsbError::Inconsistent)
    }

    /// Point `link` at `next` in both lists
    fn set_next(&mut self, link: ShadowLink, next: Option<ShadowLink>) -> Result<()> {
        let word = self.hw_link(next);
        let index = link.index();
        match link.kind {
            LinkType::Qh => {
                let qh = self.qhs.get(index).ok_or(UsbError::Inconsistent)?;
                qh.set_next(word);
                self.qh_next[index] = next;
            }
            LinkType::Itd => {
                let itd = self.itds.get(index).ok_or(UsbError::Inconsistent)?;
                itd.set_next(word);
                self.itd_next[index] = next;
            }
            LinkType::Sitd | LinkType::Fstn => return Err(UsbError::Inconsistent),
        }
        Ok(())
    }

    /// Point whatever precedes the splice point (slot head or `prev`) at
    /// `target`
    pub(crate) fn set_after(
        &mut self,
        frame: usize,
        prev: Option<ShadowLink>,
        target: Option<ShadowLink>,
    ) -> Result<()> {
        match prev {
            Some(prev) => self.set_next(prev, target),
            None => {
                self.frame_list.set_entry(frame, self.hw_link(target));
                self.heads[frame] = target;
                Ok(())
            }
        }
    }

    /// Prepend an iTD to `frame`
    pub(crate) fn link_itd(&mut self, frame: usize, index: usize) -> Result<()> {
        let node = ShadowLink::itd(index);
        let head = self.heads[frame];
        self.set_next(node, head)?;
        self.set_after(frame, None, Some(node))
    }

    /// Splice a QH of `period` into `frame` at its ordered position
    ///
    /// Reaching the QH itself during the walk means an earlier slot already
    /// made it reachable through a shared predecessor.
    pub(crate) fn link_qh(&mut self, frame: usize, index: usize, period: u16) -> Result<()> {
        let node = ShadowLink::qh(index);
        let mut prev = None;
        let mut cursor = self.heads[frame];
        let mut steps = 0;

        while let Some(link) = cursor {
            steps += 1;
            if steps > Self::WALK_LIMIT {
                return Err(UsbError::Inconsistent);
            }
            if link == node {
                return Ok(());
            }
            match link.kind {
                LinkType::Itd => {}
                LinkType::Qh => {
                    if self.period_of(link.index())? <= period {
                        break;
                    }
                }
                LinkType::Sitd | LinkType::Fstn => return Err(UsbError::Inconsistent),
            }
            prev = Some(link);
            cursor = self.next_of(link)?;
        }

        self.set_next(node, cursor)?;
        self.set_after(frame, prev, Some(node))
    }

    /// Bypass `target` in `frame`
    ///
    /// The node keeps its own `next` so a controller already on it walks
    /// on. Returns whether the node was reachable from this slot.
    pub(crate) fn unlink(&mut self, frame: usize, target: ShadowLink) -> Result<bool> {
        let mut prev = None;
        let mut cursor = self.heads[frame];
        let mut steps = 0;

        while let Some(link) = cursor {
            steps += 1;
            if steps > Self::WALK_LIMIT {
                return Err(UsbError::Inconsistent);
            }
            let next = self.next_of(link)?;
            if link == target {
                self.set_after(frame, prev, next)?;
                return Ok(true);
            }
            prev = Some(link);
            cursor = next;
        }
        Ok(false)
    }

    /// Walk `frame` in link order
    pub fn for_each_entry(&self, frame: usize, mut f: impl FnMut(SlotEntry)) -> Result<()> {
        let frame = frame % FRAMES;
        let mut cursor = self.heads[frame];
        let mut steps = 0;

        while let Some(link) = cursor {
            steps += 1;
            if steps > Self::WALK_LIMIT {
                return Err(UsbError::Inconsistent);
            }
            let next = self.next_of(link)?;
            let index = link.index();
            match link.kind {
                LinkType::Qh => {
                    let record = self
                        .interrupts
                        .get(index)
                        .and_then(|record| record.as_ref())
                        .ok_or(UsbError::Inconsistent)?;
                    let generation = *self
                        .qh_generation
                        .get(index)
                        .ok_or(UsbError::Inconsistent)?;
                    f(SlotEntry::Interrupt {
                        handle: Handle::new(TransferType::Interrupt, index, generation),
                        period: record.period,
                        microframe: record.microframe,
                    });
                }
                LinkType::Itd => {
                    let slot = self
                        .itd_slots
                        .get(index)
                        .copied()
                        .flatten()
                        .ok_or(UsbError::Inconsistent)?;
                    let handle = match slot.request {
                        Some(request) => {
                            let request = request as usize;
                            let generation = *self
                                .iso_generation
                                .get(request)
                                .ok_or(UsbError::Inconsistent)?;
                            Some(Handle::new(TransferType::Isochronous, request, generation))
                        }
                        None => None,
                    };
                    f(SlotEntry::Isochronous {
                        handle,
                        uframe: slot.uframe,
                    });
                }
                LinkType::Sitd | LinkType::Fstn => return Err(UsbError::Inconsistent),
            }
            cursor = next;
        }
        Ok(())
    }

    /// Compare the hardware chain of `frame` against the shadow chain
    ///
    /// Follows the frame list entry and each node's link word, decoding
    /// addresses back to pool indices. Returns the chain length.
    pub fn verify_slot(&self, frame: usize) -> Result<usize> {
        let frame = frame % FRAMES;
        let mut hw = self.frame_list.entry(frame);
        let mut shadow = self.heads[frame];
        let mut length = 0;

        loop {
            if hw != self.hw_link(shadow) {
                #[cfg(feature = "defmt")]
                defmt::error!("Frame {} diverges from shadow after {} nodes", frame, length);
                return Err(UsbError::Inconsistent);
            }
            let Some(link) = shadow else {
                return Ok(length);
            };

            length += 1;
            if length > Self::WALK_LIMIT {
                return Err(UsbError::Inconsistent);
            }

            let decoded = match hw.link_type() {
                LinkType::Qh => self.qhs.index_of(hw.address()),
                LinkType::Itd => self.itds.index_of(hw.address()),
                LinkType::Sitd | LinkType::Fstn => None,
            };
            if decoded != Some(link.index()) {
                return Err(UsbError::Inconsistent);
            }

            hw = match link.kind {
                LinkType::Qh => self.qhs.get(link.index()).map(|qh| qh.next()),
                LinkType::Itd => self.itds.get(link.index()).map(|itd| itd.next()),
                LinkType::Sitd | LinkType::Fstn => None,
            }
            .ok_or(UsbError::Inconsistent)?;
            shadow = self.next_of(link)?;
        }
    }
}
