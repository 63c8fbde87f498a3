//! Host controller seam
//!
//! The scheduler consumes exactly four things from the controller: the
//! hardware frame counter, the periodic-schedule enable bit, its status bit,
//! and a short delay for polling. Bandwidth reporting hooks are optional.

use crate::transfer::Handle;

/// Periodic-engine view of an EHCI host controller
///
/// Methods take `&self`: register access is interior, the same way MMIO
/// registers are.
pub trait HostController {
    /// Current hardware position in microframes (FRINDEX)
    ///
    /// Only the low bits are used; the scheduler reduces the value modulo
    /// the calendar length.
    fn frame_index(&self) -> u32;

    /// Request the periodic schedule on or off (USBCMD.PSE)
    fn set_periodic_enable(&self, enable: bool);

    /// Whether the controller is processing the periodic schedule (USBSTS.PSS)
    fn periodic_status(&self) -> bool;

    /// Busy-wait for roughly `us` microseconds
    fn delay_us(&self, us: u32);

    /// Report bandwidth committed to an admitted request
    fn claim_bandwidth(&self, _handle: Handle, _usecs: u32) {}

    /// Report bandwidth returned by a released request
    fn release_bandwidth(&self, _handle: Handle, _usecs: u32) {}
}

#[cfg(feature = "imxrt")]
pub use imxrt::ImxrtEhci;

#[cfg(feature = "imxrt")]
mod imxrt {
    use super::HostController;
    use crate::ehci::{UsbCmd, UsbSts};
    use crate::error::{Result, UsbError};
    use core::ptr::{read_volatile, write_volatile};

    const USBCMD: usize = 0x00;
    const USBSTS: usize = 0x04;
    const FRINDEX: usize = 0x0C;
    const PERIODICLISTBASE: usize = 0x14;

    /// FRINDEX is 14 bits wide
    const FRINDEX_MASK: u32 = 0x3FFF;

    /// i.MX RT EHCI operational registers
    pub struct ImxrtEhci {
        op_base: usize,
        cycles_per_us: u32,
    }

    impl ImxrtEhci {
        /// Wrap the operational register block at `op_base`
        ///
        /// # Safety
        ///
        /// `op_base` must be the operational register base of an initialized
        /// EHCI controller, and the caller must own the periodic-schedule bits.
        pub const unsafe fn new(op_base: usize, core_clock_hz: u32) -> Self {
            Self {
                op_base,
                cycles_per_us: core_clock_hz / 1_000_000,
            }
        }

        #[inline(always)]
        fn read(&self, offset: usize) -> u32 {
            cortex_m::asm::dmb();
            // Safety: offset is one of the operational registers above
            let value = unsafe { read_volatile((self.op_base + offset) as *const u32) };
            cortex_m::asm::dmb();
            value
        }

        #[inline(always)]
        fn write(&self, offset: usize, value: u32) {
            cortex_m::asm::dmb();
            // Safety: offset is one of the operational registers above
            unsafe { write_volatile((self.op_base + offset) as *mut u32, value) };
            cortex_m::asm::dsb();
        }

        /// Program PERIODICLISTBASE and the USBCMD frame list size
        ///
        /// Must be called while the periodic schedule is disabled.
        pub fn set_frame_list(&self, base_address: u32, frames: usize) -> Result<()> {
            if base_address & 0xFFF != 0 {
                return Err(UsbError::InvalidParameter);
            }
            // FS2:FS1:FS0 = 0 for 1024 entries, 7 for 8
            let code = match frames {
                1024 => 0u32,
                512 => 1,
                256 => 2,
                128 => 3,
                64 => 4,
                32 => 5,
                16 => 6,
                8 => 7,
                _ => return Err(UsbError::InvalidParameter),
            };
            self.write(PERIODICLISTBASE, base_address);

            let mut cmd = UsbCmd::from_bits_retain(self.read(USBCMD));
            cmd.remove(UsbCmd::FRAME_LIST_SIZE_MASK | UsbCmd::FRAME_LIST_SIZE_2);
            let mut bits = cmd.bits() | ((code & 0b11) << 2);
            if code & 0b100 != 0 {
                bits |= UsbCmd::FRAME_LIST_SIZE_2.bits();
            }
            self.write(USBCMD, bits);
            Ok(())
        }
    }

    impl HostController for ImxrtEhci {
        fn frame_index(&self) -> u32 {
            self.read(FRINDEX) & FRINDEX_MASK
        }

        fn set_periodic_enable(&self, enable: bool) {
            let mut cmd = UsbCmd::from_bits_retain(self.read(USBCMD));
            cmd.set(UsbCmd::PERIODIC_SCHEDULE_ENABLE, enable);
            self.write(USBCMD, cmd.bits());
        }

        fn periodic_status(&self) -> bool {
            UsbSts::from_bits_retain(self.read(USBSTS)).contains(UsbSts::PERIODIC_SCHEDULE_STATUS)
        }

        fn delay_us(&self, us: u32) {
            cortex_m::asm::delay(us.saturating_mul(self.cycles_per_us));
        }
    }
}
