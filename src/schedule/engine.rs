//! Periodic engine state
//!
//! Whether the engine should run is decided under the lock from the
//! outstanding-request count. The USBCMD.PSE / USBSTS.PSS handshake is slow
//! and runs outside it, after which the outcome is recorded under the lock
//! again.

use super::PeriodicSchedule;
use crate::ehci::timeouts::{SCHEDULE_POLL_US, SCHEDULE_TIMEOUT_US};
use crate::ehci::HostController;
use crate::error::{Result, UsbError};

/// Periodic engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EngineState {
    /// Controller is not walking the periodic schedule
    Stopped,
    /// Enable requested, waiting for PSS
    Starting,
    /// Controller walks the periodic schedule every microframe
    Running,
    /// Disable requested, waiting for PSS to clear
    Stopping,
}

/// Transition chosen under the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EngineAction {
    Enable,
    Disable,
}

/// Bounded polling of a controller status bit
pub(crate) struct PollTimeout {
    budget_us: u32,
}

impl PollTimeout {
    /// Create new timeout with duration in microseconds
    pub(crate) const fn new_us(budget_us: u32) -> Self {
        Self { budget_us }
    }

    /// Wait for condition with timeout
    pub(crate) fn wait_for<H, F>(&self, hc: &H, mut condition: F) -> Result<()>
    where
        H: HostController,
        F: FnMut() -> bool,
    {
        let mut waited = 0;
        while !condition() {
            if waited >= self.budget_us {
                return Err(UsbError::HardwareTimeout);
            }
            hc.delay_us(SCHEDULE_POLL_US);
            waited += SCHEDULE_POLL_US;
        }
        Ok(())
    }
}

/// Toggle USBCMD.PSE and wait for USBSTS.PSS to follow
pub(crate) fn handshake<H: HostController>(hc: &H, enable: bool) -> Result<()> {
    hc.set_periodic_enable(enable);
    let result =
        PollTimeout::new_us(SCHEDULE_TIMEOUT_US).wait_for(hc, || hc.periodic_status() == enable);

    #[cfg(feature = "defmt")]
    if result.is_err() {
        defmt::error!("Periodic schedule handshake (enable={}) timed out", enable);
    }

    result
}

impl<const FRAMES: usize, const N_QH: usize, const N_ITD: usize>
    PeriodicSchedule<FRAMES, N_QH, N_ITD>
{
    /// Decide the next engine transition, if any
    ///
    /// Returns `None` while another caller is mid-handshake.
    pub(crate) fn engine_action(&mut self) -> Option<EngineAction> {
        let wanted = self.outstanding() > 0;
        match (self.engine, wanted) {
            (EngineState::Stopped, true) => {
                self.engine = EngineState::Starting;
                Some(EngineAction::Enable)
            }
            (EngineState::Running, false) => {
                self.engine = EngineState::Stopping;
                Some(EngineAction::Disable)
            }
            _ => None,
        }
    }

    /// Record the outcome of a handshake
    pub(crate) fn engine_settled<H: HostController>(
        &mut self,
        hc: &H,
        action: EngineAction,
        result: Result<()>,
    ) {
        self.engine = match (action, result) {
            (EngineAction::Enable, Ok(())) => {
                self.next_scan = Self::now(hc);
                EngineState::Running
            }
            (EngineAction::Enable, Err(_)) => {
                hc.set_periodic_enable(false);
                EngineState::Stopped
            }
            (EngineAction::Disable, Ok(())) => EngineState::Stopped,
            (EngineAction::Disable, Err(_)) => EngineState::Running,
        };

        #[cfg(feature = "defmt")]
        defmt::debug!("Periodic engine {:?}", self.engine);
    }

    /// Bring the engine in line with the outstanding requests
    ///
    /// For callers owning the schedule outright; [`PeriodicScheduler`]
    /// runs the same loop with the handshake outside its lock.
    ///
    /// [`PeriodicScheduler`]: super::PeriodicScheduler
    pub fn sync_engine<H: HostController>(&mut self, hc: &H) -> Result<()> {
        while let Some(action) = self.engine_action() {
            let result = handshake(hc, action == EngineAction::Enable);
            self.engine_settled(hc, action, result);
            result?;
        }
        Ok(())
    }
}
