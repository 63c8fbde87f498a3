//! Lock-protected scheduler front end
//!
//! One spin lock serializes admission, cancellation and scanning; the
//! controller and the completion sink are called with it held, except for
//! the periodic-engine handshake, which polls for up to two milliseconds and
//! runs unlocked.

use spin::Mutex;

use super::engine::{handshake, EngineAction};
use super::{EngineState, PeriodicSchedule, ScanSummary, ScheduleStats, SlotEntry};
use crate::ehci::HostController;
use crate::error::Result;
use crate::transfer::{CompletionSink, Handle, InterruptRequest, IsoPacket, IsoRequest};

/// Periodic scheduler shared between task context and the frame interrupt
///
/// The scheduler must stay at a fixed address once the frame list base has
/// been programmed into the controller: place it in a `static` or another
/// location that never moves.
pub struct PeriodicScheduler<
    H: HostController,
    const FRAMES: usize,
    const N_QH: usize,
    const N_ITD: usize,
> {
    schedule: Mutex<PeriodicSchedule<FRAMES, N_QH, N_ITD>>,
    controller: H,
}

impl<H: HostController, const FRAMES: usize, const N_QH: usize, const N_ITD: usize>
    PeriodicScheduler<H, FRAMES, N_QH, N_ITD>
{
    /// Create an empty scheduler driving `controller`
    pub const fn new(controller: H) -> Self {
        Self {
            schedule: Mutex::new(PeriodicSchedule::new()),
            controller,
        }
    }

    /// Controller the scheduler drives
    pub fn controller(&self) -> &H {
        &self.controller
    }

    /// Address to program into PERIODICLISTBASE
    pub fn frame_list_base(&self) -> u32 {
        self.schedule.lock().frame_list_base()
    }

    /// Admit an interrupt request polled every `period` frames
    ///
    /// Starts the periodic engine if this is the first outstanding request.
    /// If the engine cannot be started the request is withdrawn again and
    /// [`UsbError::HardwareTimeout`](crate::UsbError::HardwareTimeout) is
    /// returned.
    pub fn schedule_interrupt(&self, request: &InterruptRequest, period: u16) -> Result<Handle> {
        let handle = self
            .schedule
            .lock()
            .admit_interrupt(&self.controller, request, period)?;
        self.enable_for(handle)
    }

    /// Admit an isochronous request with packets `interval` microframes apart
    pub fn schedule_isochronous(
        &self,
        request: &IsoRequest,
        packets: &[IsoPacket],
        interval: u32,
    ) -> Result<Handle> {
        let handle = self.schedule.lock().admit_isochronous(
            &self.controller,
            request,
            packets,
            interval,
        )?;
        self.enable_for(handle)
    }

    /// Withdraw a request; the sink hears about it once its descriptors
    /// are released
    pub fn cancel(&self, handle: Handle) -> Result<()> {
        self.schedule.lock().cancel(&self.controller, handle)?;
        // Stopping the engine is best effort: the request is gone either way
        let _ = self.sync_engine();
        Ok(())
    }

    /// Frame interrupt entry point: release quiesced descriptors, report
    /// completions, stop the engine once nothing is outstanding
    pub fn on_frame_boundary<S: CompletionSink>(&self, sink: &mut S) -> Result<ScanSummary> {
        let summary = self
            .schedule
            .lock()
            .on_frame_boundary(&self.controller, sink);
        self.sync_engine()?;
        Ok(summary)
    }

    /// Microseconds committed in one microframe of one slot
    pub fn committed_usecs(&self, frame: usize, microframe: u8) -> Result<u32> {
        self.schedule.lock().committed_usecs(frame, microframe)
    }

    /// Committed microseconds of all eight microframes of a slot
    pub fn frame_usecs(&self, frame: usize) -> Result<[u16; 8]> {
        self.schedule.lock().frame_usecs(frame)
    }

    /// Check one slot's hardware links against the shadow list
    pub fn verify_slot(&self, frame: usize) -> Result<usize> {
        self.schedule.lock().verify_slot(frame)
    }

    /// Visit the nodes of one slot in hardware order
    pub fn for_each_entry(&self, frame: usize, f: impl FnMut(SlotEntry)) -> Result<()> {
        self.schedule.lock().for_each_entry(frame, f)
    }

    /// Counters
    pub fn stats(&self) -> ScheduleStats {
        self.schedule.lock().stats()
    }

    /// Engine state as last decided
    pub fn engine_state(&self) -> EngineState {
        self.schedule.lock().engine_state()
    }

    /// Requests that keep the engine running
    pub fn outstanding(&self) -> usize {
        self.schedule.lock().outstanding()
    }

    /// Run `f` against the locked schedule
    pub fn with_schedule<R>(&self, f: impl FnOnce(&PeriodicSchedule<FRAMES, N_QH, N_ITD>) -> R) -> R {
        f(&self.schedule.lock())
    }

    /// Start the engine for a freshly admitted request, withdrawing it
    /// silently if the controller never acknowledges
    fn enable_for(&self, handle: Handle) -> Result<Handle> {
        match self.sync_engine() {
            Ok(()) => Ok(handle),
            Err(e) => {
                let mut schedule = self.schedule.lock();
                if schedule.engine_state() == EngineState::Running {
                    // Another caller got the engine going in the meantime
                    return Ok(handle);
                }
                #[cfg(feature = "defmt")]
                defmt::warn!("Periodic engine did not start, withdrawing {:?}", handle);
                let _ = schedule.withdraw(&self.controller, handle, false);
                Err(e)
            }
        }
    }

    /// Bring the engine in line with the outstanding requests, handshaking
    /// without the lock
    fn sync_engine(&self) -> Result<()> {
        loop {
            let Some(action) = self.schedule.lock().engine_action() else {
                return Ok(());
            };
            let result = handshake(&self.controller, action == EngineAction::Enable);
            self.schedule
                .lock()
                .engine_settled(&self.controller, action, result);
            result?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{FakeController, RecordingSink};
    use super::*;
    use crate::error::UsbError;
    use crate::transfer::{Direction, Endpoint, IsoStart, PacketStatus};

    type Scheduler = PeriodicScheduler<FakeController, 8, 4, 8>;

    fn request() -> InterruptRequest {
        InterruptRequest {
            endpoint: Endpoint::high_speed(1, 1, Direction::In, 64),
            buffer: 0x2020_0000,
            length: 64,
        }
    }

    #[test]
    fn test_engine_started_and_stopped() {
        let scheduler = Scheduler::new(FakeController::new());
        let handle = scheduler.schedule_interrupt(&request(), 4).unwrap();
        assert_eq!(scheduler.engine_state(), EngineState::Running);
        assert!(scheduler.controller().enabled.get());

        scheduler.cancel(handle).unwrap();
        assert_eq!(scheduler.engine_state(), EngineState::Stopped);
        assert!(!scheduler.controller().enabled.get());

        // Stopped engine: released and reported on the next boundary
        let mut sink = RecordingSink::default();
        let summary = scheduler.on_frame_boundary(&mut sink).unwrap();
        assert!(summary.skipped);
        assert_eq!(summary.released, 1);
        assert_eq!(sink.cancelled.as_slice(), &[handle]);
    }

    #[test]
    fn test_unacknowledged_enable_withdraws_request() {
        let controller = FakeController::new();
        controller.acknowledge.set(false);
        let scheduler = Scheduler::new(controller);

        assert_eq!(
            scheduler.schedule_interrupt(&request(), 1),
            Err(UsbError::HardwareTimeout)
        );
        assert_eq!(scheduler.outstanding(), 0);
        assert_eq!(scheduler.engine_state(), EngineState::Stopped);

        // No cancellation is reported for a request the caller never got
        let mut sink = RecordingSink::default();
        scheduler.on_frame_boundary(&mut sink).unwrap();
        assert!(sink.cancelled.is_empty());
        assert_eq!(scheduler.committed_usecs(0, 0), Ok(0));
        scheduler.with_schedule(|schedule| assert_eq!(schedule.retired(), 0));
    }

    #[test]
    fn test_isochronous_through_front_end() {
        let scheduler = Scheduler::new(FakeController::new());
        let packets = [IsoPacket {
            offset: 0,
            length: 188,
        }];
        let handle = scheduler
            .schedule_isochronous(
                &IsoRequest {
                    endpoint: Endpoint::high_speed(4, 2, Direction::Out, 512),
                    buffer: 0x2020_8000,
                    start: IsoStart::Asap,
                },
                &packets,
                1,
            )
            .unwrap();
        assert_eq!(scheduler.outstanding(), 1);

        let mut entries = 0;
        scheduler
            .for_each_entry(2, |entry| {
                if let SlotEntry::Isochronous { handle: Some(h), .. } = entry {
                    assert_eq!(h, handle);
                    entries += 1;
                }
            })
            .unwrap();
        assert_eq!(entries, 1);
        assert_eq!(scheduler.verify_slot(2), Ok(1));

        // Packet done: engine stops once the boundary after it is handled
        scheduler.controller().set_uframe(24);
        let mut sink = RecordingSink::default();
        let summary = scheduler.on_frame_boundary(&mut sink).unwrap();
        assert_eq!(summary.completions, 1);
        assert_eq!(sink.isochronous.len(), 1);
        assert_eq!(sink.isochronous[0].1[0].status, PacketStatus::Missed);
        assert_eq!(scheduler.engine_state(), EngineState::Stopped);
    }
}
