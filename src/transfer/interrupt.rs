//! High-speed interrupt transfers
//!
//! An interrupt request owns one QH that stays linked in every slot
//! `frame, frame + period, ...` and is re-armed by the scanner after each
//! completed period. Only one request per endpoint direction may be in
//! flight.

use crate::ehci::{HostController, PortSpeed, MICROFRAMES_PER_FRAME};
use crate::error::{Result, UsbError};
use crate::schedule::bandwidth::transfer_usecs;
use crate::schedule::{PeriodicSchedule, ShadowLink};
use crate::transfer::{Endpoint, Handle, InterruptRequest, TransferType};

/// Interrupt request states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InterruptState {
    /// Linked and re-armed every period
    Armed,
    /// Endpoint reported an error; linked but no longer armed
    Halted,
    /// Unlinked, waiting for the quiescence window
    Cancelling,
}

/// Admission record of an interrupt request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptRecord {
    /// Target endpoint
    pub endpoint: Endpoint,
    /// DMA buffer re-used every period
    pub buffer: u32,
    /// Bytes per period
    pub length: u16,
    /// Period in frames (power of two, at most the calendar length)
    pub period: u16,
    /// First frame the node occupies
    pub frame: u16,
    /// Microframe the transaction starts in
    pub microframe: u8,
    /// Committed cost per occurrence
    pub usecs: u16,
    /// Current state
    pub state: InterruptState,
    pub(crate) notify: bool,
}

impl InterruptRecord {
    /// Whether the request still keeps the engine running
    pub fn is_outstanding(&self) -> bool {
        self.state != InterruptState::Cancelling
    }

    /// Average cost per frame, as reported to the controller
    pub fn claimed_usecs(&self) -> u32 {
        (self.usecs as u32).div_ceil(self.period as u32)
    }
}

/// Normalize a requested period: power of two, clamped to the calendar
pub(crate) fn normalize_period(period: u16, frames: usize) -> Result<u16> {
    if period == 0 || !period.is_power_of_two() {
        return Err(UsbError::InvalidParameter);
    }
    Ok(period.min(frames as u16))
}

impl<const FRAMES: usize, const N_QH: usize, const N_ITD: usize>
    PeriodicSchedule<FRAMES, N_QH, N_ITD>
{
    /// Admit an interrupt request polled every `period` frames
    ///
    /// Picks the first `(frame, microframe)` with `frame < period` that fits
    /// in every slot the node will occupy, then links the armed QH into all
    /// of them.
    pub fn admit_interrupt<H: HostController>(
        &mut self,
        hc: &H,
        request: &InterruptRequest,
        period: u16,
    ) -> Result<Handle> {
        let result = self.try_admit_interrupt(hc, request, period);
        match result {
            Ok(_) => self.stats.interrupt_admitted += 1,
            Err(UsbError::NoSpace) => self.stats.rejected_no_space += 1,
            Err(UsbError::Busy) => self.stats.rejected_busy += 1,
            Err(_) => self.stats.rejected_other += 1,
        }
        result
    }

    fn try_admit_interrupt<H: HostController>(
        &mut self,
        hc: &H,
        request: &InterruptRequest,
        period: u16,
    ) -> Result<Handle> {
        let endpoint = &request.endpoint;
        if endpoint.speed != PortSpeed::HighSpeed {
            #[cfg(feature = "defmt")]
            defmt::debug!("Interrupt endpoint {:?} is not high-speed", endpoint.speed);
            return Err(UsbError::Unsupported);
        }
        endpoint.validate()?;

        let key = endpoint.key();
        if self
            .interrupts
            .iter()
            .flatten()
            .any(|record| record.is_outstanding() && record.endpoint.key() == key)
        {
            return Err(UsbError::Busy);
        }

        if request.length as u32 > endpoint.max_payload() {
            return Err(UsbError::InvalidParameter);
        }
        let period = normalize_period(period, FRAMES)?;
        let usecs = transfer_usecs(endpoint, request.length as u32);

        let (frame, microframe) = self.find_interrupt_slot(period, usecs)?;

        let index = match self.qhs.alloc() {
            Some(index) => index,
            None => {
                #[cfg(feature = "defmt")]
                defmt::warn!("QH pool exhausted - all {} queue heads allocated", N_QH);
                return Err(UsbError::NoResources);
            }
        };

        let qh = self.qhs.get(index).ok_or(UsbError::Inconsistent)?;
        qh.init_interrupt(endpoint, 1 << microframe);
        qh.arm(endpoint.direction, request.buffer, request.length);

        self.interrupts[index] = Some(InterruptRecord {
            endpoint: *endpoint,
            buffer: request.buffer,
            length: request.length,
            period,
            frame: frame as u16,
            microframe,
            usecs: usecs as u16,
            state: InterruptState::Armed,
            notify: true,
        });

        let mut slot = frame;
        while slot < FRAMES {
            if let Err(e) = self.link_qh(slot, index, period) {
                // Roll back the slots already linked
                self.deschedule_interrupt(index, Self::now(hc), false)?;
                return Err(e);
            }
            slot += period as usize;
        }

        let handle = Handle::new(TransferType::Interrupt, index, self.qh_generation[index]);
        hc.claim_bandwidth(handle, usecs.div_ceil(period as u32));

        #[cfg(feature = "defmt")]
        defmt::debug!(
            "Interrupt ep {=u8:#x} dev {}: period {} at frame {} uframe {} ({} us)",
            endpoint.address(),
            endpoint.device_address,
            period,
            frame,
            microframe,
            usecs
        );

        Ok(handle)
    }

    /// First-fit placement for a node of `period` costing `usecs`
    fn find_interrupt_slot(&self, period: u16, usecs: u32) -> Result<(usize, u8)> {
        for frame in 0..period as usize {
            'microframe: for microframe in 0..MICROFRAMES_PER_FRAME as u8 {
                let mut slot = frame;
                while slot < FRAMES {
                    if !self.fits(slot, microframe, usecs)? {
                        continue 'microframe;
                    }
                    slot += period as usize;
                }
                return Ok((frame, microframe));
            }
        }
        Err(UsbError::NoSpace)
    }

    /// Unlink an interrupt QH from every slot it occupies and start its
    /// quiescence window
    pub(crate) fn deschedule_interrupt(
        &mut self,
        index: usize,
        now: u32,
        notify: bool,
    ) -> Result<()> {
        let (frame, period) = match self.interrupts[index].as_mut() {
            Some(record) if record.state == InterruptState::Cancelling => {
                return Err(UsbError::InvalidState);
            }
            Some(record) => {
                record.state = InterruptState::Cancelling;
                record.notify = notify;
                (record.frame as usize, record.period as usize)
            }
            None => return Err(UsbError::InvalidParameter),
        };

        if let Some(qh) = self.qhs.get(index) {
            qh.disarm();
        }

        let node = ShadowLink::qh(index);
        let mut slot = frame;
        let mut result = Ok(());
        while slot < FRAMES {
            // Keep going past a broken slot so the node is gone from the rest
            if let Err(e) = self.unlink(slot, node) {
                #[cfg(feature = "defmt")]
                defmt::error!("Frame {} inconsistent while unlinking QH {}", slot, index);
                self.stats.inconsistent_slots += 1;
                result = Err(e);
            }
            slot += period;
        }

        self.retire_qh(index, now);

        #[cfg(feature = "defmt")]
        defmt::debug!("Interrupt QH {} descheduled at uframe {}", index, now);

        result
    }
}
