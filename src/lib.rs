#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

//! Periodic transfer scheduler for USB 2.0 EHCI host controllers
//!
//! Places high-speed interrupt and isochronous transfers into the EHCI
//! periodic frame list, enforces the per-microframe bandwidth ceiling, and
//! reports completions from a frame-boundary scan.
//!
//! # Core Components
//!
//! - [`ehci`] - Frame list, QH and iTD layouts and the [`HostController`] seam
//! - [`dma`] - Fixed descriptor pools with DMA address mapping
//! - [`schedule`] - Calendar, shadow list, bandwidth accounting, scanner and
//!   the lock-protected [`PeriodicScheduler`]
//! - [`transfer`] - Requests, handles and completion reporting
//! - [`error`] - Error types
//!
//! # Usage
//!
//! ```ignore
//! static SCHEDULER: PeriodicScheduler<ImxrtEhci, 256, 32, 128> =
//!     PeriodicScheduler::new(unsafe { ImxrtEhci::new(USB1_OP_BASE, 600_000_000) });
//!
//! SCHEDULER
//!     .controller()
//!     .set_frame_list(SCHEDULER.frame_list_base(), 256)?;
//! let handle = SCHEDULER.schedule_interrupt(&request, 8)?;
//!
//! // from the frame list rollover / IOC interrupt
//! SCHEDULER.on_frame_boundary(&mut sink)?;
//! ```

#[cfg(feature = "defmt")]
use defmt as _;

pub mod dma;
pub mod ehci;
pub mod error;
pub mod schedule;
pub mod transfer;

pub use ehci::HostController;
pub use error::{Result, UsbError};
pub use schedule::{
    EngineState, PeriodicSchedule, PeriodicScheduler, ScanSummary, ScheduleStats, SlotEntry,
};
pub use transfer::{
    Completion, CompletionSink, Direction, Endpoint, Handle, InterruptRequest, IsoPacket,
    IsoRequest, IsoStart, PacketResult, PacketStatus, TransferType,
};
