//! Register access for the LPC43xx USB0/USB1 controller blocks
//!
//! Implements efficient register access with proper memory ordering for the
//! ARM Cortex-M weakly-ordered memory model, plus a typed layout of the
//! controller register block per UM10503 chapter 23.

use crate::error::{Result, UsbError};
use crate::Speed;
use bitflags::bitflags;
use core::cell::UnsafeCell;
use core::mem::offset_of;
use core::ptr::{read_volatile, write_volatile};

/// Register access wrapper with proper memory ordering
///
/// More efficient than an atomic for MMIO while keeping accesses volatile and
/// ordered with respect to the DMA engine.
#[repr(transparent)]
pub struct Register<T> {
    value: UnsafeCell<T>,
}

unsafe impl<T> Send for Register<T> where T: Send {}
unsafe impl<T> Sync for Register<T> where T: Sync {}

impl Register<u32> {
    /// Read register with barriers for status/data reads
    #[inline(always)]
    pub fn read(&self) -> u32 {
        unsafe {
            cortex_m::asm::dmb();
            let value = read_volatile(self.value.get());
            cortex_m::asm::dmb();
            value
        }
    }

    /// Write register; the trailing DSB ensures the write completes before
    /// dependent operations continue
    #[inline(always)]
    pub fn write(&self, value: u32) {
        unsafe {
            cortex_m::asm::dmb();
            write_volatile(self.value.get(), value);
            cortex_m::asm::dsb();
        }
    }

    /// Read-modify-write operation
    #[inline(always)]
    pub fn modify<F>(&self, f: F)
    where
        F: FnOnce(u32) -> u32,
    {
        unsafe {
            cortex_m::asm::dmb();
            let current = read_volatile(self.value.get());
            cortex_m::asm::dmb();
            let new_value = f(current);
            cortex_m::asm::dmb();
            write_volatile(self.value.get(), new_value);
            cortex_m::asm::dsb();
        }
    }

    /// Set bits in the register
    #[inline(always)]
    pub fn set_bits(&self, mask: u32) {
        self.modify(|v| v | mask);
    }

    /// Clear bits in the register
    #[inline(always)]
    pub fn clear_bits(&self, mask: u32) {
        self.modify(|v| v & !mask);
    }
}

/// Validate that an address is within the LPC43xx peripheral regions
///
/// Known MMIO regions (UM10503 chapter 2):
/// - 0x4000_0000 - 0x400F_FFFF: AHB peripherals (USB0 at 0x4000_6000, USB1 at 0x4000_7000)
/// - 0x4004_0000 - 0x400F_FFFF: RTC/clocking/reset domain (CREG, RGU, ...)
/// - 0x4008_0000 - 0x409F_FFFF: APB peripherals (SCU, ...)
/// - 0xE000_0000 - 0xE00F_FFFF: Cortex-M private peripherals
#[inline]
const fn is_valid_mmio_address(addr: usize) -> bool {
    matches!(addr,
        0x4000_0000..=0x409F_FFFF
        | 0xE000_0000..=0xE00F_FFFF
    )
}

/// Read a register at a raw address with memory barriers
///
/// # Safety
///
/// Caller must ensure the address points to a valid MMIO register.
#[inline(always)]
pub unsafe fn read_register_at(addr: *const u32) -> u32 {
    debug_assert!(is_valid_mmio_address(addr as usize));
    unsafe {
        cortex_m::asm::dmb();
        let value = read_volatile(addr);
        cortex_m::asm::dmb();
        value
    }
}

/// Write a register at a raw address with memory barriers
///
/// # Safety
///
/// Caller must ensure the address points to a valid MMIO register.
#[inline(always)]
pub unsafe fn write_register_at(addr: *mut u32, value: u32) {
    debug_assert!(is_valid_mmio_address(addr as usize));
    unsafe {
        cortex_m::asm::dmb();
        write_volatile(addr, value);
        cortex_m::asm::dsb();
    }
}

/// Modify a register at a raw address with memory barriers
///
/// # Safety
///
/// Caller must ensure the address points to a valid MMIO register.
#[inline(always)]
pub unsafe fn modify_register_at<F>(addr: *mut u32, f: F)
where
    F: FnOnce(u32) -> u32,
{
    unsafe {
        let value = read_register_at(addr);
        write_register_at(addr, f(value));
    }
}

/// Iteration-bounded busy-wait on a hardware acknowledgement bit
///
/// The controller acknowledges prime/flush/reset commands within a bounded
/// number of bus cycles; a budget that expires means the controller has
/// wedged, which is surfaced as [`UsbError::ControllerUnresponsive`] rather
/// than hanging the caller.
pub struct SpinBudget {
    remaining: u32,
}

impl SpinBudget {
    /// Default spin count, generous for any in-spec controller response
    pub const DEFAULT_SPINS: u32 = 1_000_000;

    /// Create a budget with an explicit spin count
    pub const fn new(spins: u32) -> Self {
        Self { remaining: spins }
    }

    /// Spin until `condition` holds or the budget expires
    pub fn wait_for<F>(mut self, mut condition: F) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        while !condition() {
            if self.remaining == 0 {
                #[cfg(feature = "defmt")]
                defmt::warn!("spin budget expired waiting on controller");
                return Err(UsbError::ControllerUnresponsive);
            }
            self.remaining -= 1;
            core::hint::spin_loop();
        }
        Ok(())
    }
}

impl Default for SpinBudget {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SPINS)
    }
}

/// USB0 controller register base
pub const USB0_BASE: usize = 0x4000_6000;

/// USB1 controller register base
pub const USB1_BASE: usize = 0x4000_7000;

/// Number of endpoint pairs implemented per controller (EP0..EP5)
pub const ENDPOINT_COUNT: usize = 6;

/// The LPC43xx USB register block (UM10503 section 23.6)
///
/// Capability registers start at offset 0x100 from the controller base; the
/// operational/device registers follow at 0x140. Registers that are aliased
/// between host and device mode (PERIODICLISTBASE/DEVICEADDR and
/// ASYNCLISTADDR/ENDPOINTLISTADDR) appear once under their host-mode name.
#[repr(C)]
pub struct RegisterBlock {
    _reserved0: [u32; 64],
    /// Capability register length / HCI version
    pub caplength: Register<u32>,
    /// Host controller structural parameters
    pub hcsparams: Register<u32>,
    /// Host controller capability parameters
    pub hccparams: Register<u32>,
    _reserved1: [u32; 5],
    /// Device interface version
    pub dciversion: Register<u32>,
    /// Device controller capability parameters
    pub dccparams: Register<u32>,
    _reserved2: [u32; 6],
    /// USB command
    pub usbcmd: Register<u32>,
    /// USB status (write-one-to-clear)
    pub usbsts: Register<u32>,
    /// USB interrupt enable
    pub usbintr: Register<u32>,
    /// Frame index
    pub frindex: Register<u32>,
    _reserved3: u32,
    /// Periodic frame list base (host) / device address (device)
    pub periodiclistbase: Register<u32>,
    /// Asynchronous list address (host) / endpoint list address (device)
    pub asynclistaddr: Register<u32>,
    /// Transaction translator control (host)
    pub ttctrl: Register<u32>,
    /// Burst size
    pub burstsize: Register<u32>,
    /// TX fill tuning (host)
    pub txfilltuning: Register<u32>,
    _reserved4: [u32; 2],
    /// ULPI viewport
    pub ulpiviewport: Register<u32>,
    /// bInterval value (device)
    pub binterval: Register<u32>,
    /// Endpoint NAK status (write-one-to-clear)
    pub endptnak: Register<u32>,
    /// Endpoint NAK interrupt enable
    pub endptnaken: Register<u32>,
    _reserved5: u32,
    /// Port 1 status and control
    pub portsc1: Register<u32>,
    _reserved6: [u32; 7],
    /// OTG status and control
    pub otgsc: Register<u32>,
    /// Controller mode select
    pub usbmode: Register<u32>,
    /// Endpoint setup status (device; write-one-to-clear)
    pub endptsetupstat: Register<u32>,
    /// Endpoint prime (device)
    pub endptprime: Register<u32>,
    /// Endpoint flush (device)
    pub endptflush: Register<u32>,
    /// Endpoint buffer-ready status (device; read-only)
    pub endptstat: Register<u32>,
    /// Endpoint transfer complete (device; write-one-to-clear)
    pub endptcomplete: Register<u32>,
    /// Per-endpoint control registers
    pub endptctrl: [Register<u32>; ENDPOINT_COUNT],
}

// Register offsets per UM10503 section 23.6.
const _: () = {
    assert!(offset_of!(RegisterBlock, caplength) == 0x100);
    assert!(offset_of!(RegisterBlock, dciversion) == 0x120);
    assert!(offset_of!(RegisterBlock, usbcmd) == 0x140);
    assert!(offset_of!(RegisterBlock, usbsts) == 0x144);
    assert!(offset_of!(RegisterBlock, usbintr) == 0x148);
    assert!(offset_of!(RegisterBlock, periodiclistbase) == 0x154);
    assert!(offset_of!(RegisterBlock, asynclistaddr) == 0x158);
    assert!(offset_of!(RegisterBlock, endptnak) == 0x178);
    assert!(offset_of!(RegisterBlock, portsc1) == 0x184);
    assert!(offset_of!(RegisterBlock, otgsc) == 0x1A4);
    assert!(offset_of!(RegisterBlock, usbmode) == 0x1A8);
    assert!(offset_of!(RegisterBlock, endptsetupstat) == 0x1AC);
    assert!(offset_of!(RegisterBlock, endptprime) == 0x1B0);
    assert!(offset_of!(RegisterBlock, endptflush) == 0x1B4);
    assert!(offset_of!(RegisterBlock, endptstat) == 0x1B8);
    assert!(offset_of!(RegisterBlock, endptcomplete) == 0x1BC);
    assert!(offset_of!(RegisterBlock, endptctrl) == 0x1C0);
};

bitflags! {
    /// USBCMD bit definitions (device and host mode)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbCmd: u32 {
        /// Run/Stop
        const RUN = 1 << 0;
        /// Controller reset
        const RESET = 1 << 1;
        /// Periodic schedule enable (host)
        const PERIODIC_SCHEDULE_ENABLE = 1 << 4;
        /// Asynchronous schedule enable (host)
        const ASYNC_SCHEDULE_ENABLE = 1 << 5;
        /// Interrupt on async advance doorbell (host)
        const ASYNC_ADVANCE_DOORBELL = 1 << 6;
        /// Add-dTD-tripwire (device); see the schedule-append handshake
        const ATDTW = 1 << 12;
        /// Setup-tripwire (device)
        const SETUP_TRIPWIRE = 1 << 13;
        /// Interrupt threshold control - bits [23:16]
        const ITC_MASK = 0xFF << 16;
    }
}

bitflags! {
    /// USBSTS / USBINTR bit definitions
    ///
    /// The interrupt-enable register uses the same bit positions as the
    /// status register, so one set of flags serves both.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbSts: u32 {
        /// USB interrupt: transaction with IOC completed, short packet, or
        /// (device) SETUP packet received
        const USB_INTERRUPT = 1 << 0;
        /// USB error interrupt
        const USB_ERROR = 1 << 1;
        /// Port change detect
        const PORT_CHANGE = 1 << 2;
        /// Frame list rollover
        const FRAME_ROLLOVER = 1 << 3;
        /// Interrupt on async advance (host)
        const ASYNC_ADVANCE = 1 << 5;
        /// USB reset received (device)
        const USB_RESET = 1 << 6;
        /// Start of frame received
        const SOF = 1 << 7;
        /// DC suspend (device)
        const SUSPEND = 1 << 8;
        /// Controller halted (host)
        const HC_HALTED = 1 << 12;
        /// Reclamation (host)
        const RECLAMATION = 1 << 13;
        /// Periodic schedule status (host)
        const PERIODIC_STATUS = 1 << 14;
        /// Asynchronous schedule status (host)
        const ASYNC_STATUS = 1 << 15;
        /// NAK interrupt (device)
        const NAK = 1 << 16;
    }
}

bitflags! {
    /// PORTSC1 bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortSc: u32 {
        /// Current connect status
        const CURRENT_CONNECT_STATUS = 1 << 0;
        /// Connect status change
        const CONNECT_STATUS_CHANGE = 1 << 1;
        /// Port enabled
        const PORT_ENABLED = 1 << 2;
        /// Port enable change
        const PORT_ENABLE_CHANGE = 1 << 3;
        /// Over-current active
        const OVER_CURRENT_ACTIVE = 1 << 4;
        /// Over-current change
        const OVER_CURRENT_CHANGE = 1 << 5;
        /// Force port resume
        const FORCE_PORT_RESUME = 1 << 6;
        /// Suspend
        const SUSPEND = 1 << 7;
        /// Port reset
        const PORT_RESET = 1 << 8;
        /// High-speed status
        const HIGH_SPEED = 1 << 9;
        /// Line status - bits [11:10]
        const LINE_STATUS_MASK = 0b11 << 10;
        /// Port power
        const PORT_POWER = 1 << 12;
        /// PHY low power suspend
        const PHY_LOW_POWER = 1 << 23;
        /// Force full-speed connection (disable chirp)
        const FORCE_FULL_SPEED = 1 << 24;
        /// Port speed - bits [27:26]
        const PORT_SPEED_MASK = 0b11 << 26;
    }
}

impl PortSc {
    const PORT_SPEED_SHIFT: u32 = 26;

    /// Decode the detected port speed field
    pub fn speed(self) -> Option<Speed> {
        match (self.bits() & Self::PORT_SPEED_MASK.bits()) >> Self::PORT_SPEED_SHIFT {
            0 => Some(Speed::Full),
            1 => Some(Speed::Low),
            2 => Some(Speed::High),
            _ => None,
        }
    }
}

bitflags! {
    /// USBMODE bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[allow(missing_docs)]
    pub struct UsbMode: u32 {
        /// Controller mode - bits [1:0]: 0 = idle, 2 = device, 3 = host
        const CM_MASK = 0b11;
        const CM_DEVICE = 0b10;
        const CM_HOST = 0b11;
        /// Setup lockout mode disable (device)
        const SETUP_LOCKOUT_DISABLE = 1 << 3;
        /// Stream disable
        const STREAM_DISABLE = 1 << 4;
    }
}

bitflags! {
    /// OTGSC bit definitions (only the bits this driver touches)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OtgSc: u32 {
        /// OTG termination: controls the pull-down on USB_DM
        const OTG_TERMINATION = 1 << 3;
        /// VBUS discharge
        const VBUS_DISCHARGE = 1 << 0;
    }
}

bitflags! {
    /// ENDPTCTRLn bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EndptCtrl: u32 {
        /// RX (OUT) stall
        const RX_STALL = 1 << 0;
        /// RX endpoint type - bits [3:2]
        const RX_TYPE_MASK = 0b11 << 2;
        /// RX data toggle inhibit
        const RX_TOGGLE_INHIBIT = 1 << 5;
        /// RX data toggle reset
        const RX_TOGGLE_RESET = 1 << 6;
        /// RX endpoint enable
        const RX_ENABLE = 1 << 7;
        /// TX (IN) stall
        const TX_STALL = 1 << 16;
        /// TX endpoint type - bits [19:18]
        const TX_TYPE_MASK = 0b11 << 18;
        /// TX data toggle inhibit
        const TX_TOGGLE_INHIBIT = 1 << 21;
        /// TX data toggle reset
        const TX_TOGGLE_RESET = 1 << 22;
        /// TX endpoint enable
        const TX_ENABLE = 1 << 23;
    }
}

impl EndptCtrl {
    /// Shift for the RX endpoint type field
    pub const RX_TYPE_SHIFT: u32 = 2;
    /// Shift for the TX endpoint type field
    pub const TX_TYPE_SHIFT: u32 = 18;
}

/// DEVICEADDR field encoding
pub mod deviceaddr {
    /// Device address advance: latch the new address at the end of the
    /// in-flight control transfer's status stage instead of immediately
    pub const USBADRA: u32 = 1 << 24;
    /// Shift for the 7-bit address field
    pub const USBADR_SHIFT: u32 = 25;
}

/// Per-endpoint bit positions in ENDPTPRIME/ENDPTFLUSH/ENDPTSTAT/ENDPTCOMPLETE
///
/// OUT (RX) endpoints occupy bits [5:0]; IN (TX) endpoints occupy bits [21:16].
pub mod endpoint_bits {
    /// Bit for an OUT endpoint's receive buffer
    #[inline(always)]
    pub const fn out_bit(number: u8) -> u32 {
        1 << (number as u32)
    }

    /// Bit for an IN endpoint's transmit buffer
    #[inline(always)]
    pub const fn in_bit(number: u8) -> u32 {
        1 << (number as u32 + 16)
    }

    /// Bit for an endpoint identified by number and direction
    #[inline(always)]
    pub const fn bit(number: u8, is_in: bool) -> u32 {
        if is_in {
            in_bit(number)
        } else {
            out_bit(number)
        }
    }

    /// Mask covering every endpoint in both directions
    pub const ALL: u32 = 0xFFFF_FFFF;
}

/// Handle to one controller's register block
#[derive(Clone, Copy)]
pub struct UsbRegisters {
    base: *const RegisterBlock,
}

unsafe impl Send for UsbRegisters {}

impl UsbRegisters {
    /// Create a handle to the register block at `base`
    ///
    /// # Safety
    ///
    /// `base` must be the base address of an LPC43xx USB controller and the
    /// caller must hold exclusive ownership of that controller.
    pub const unsafe fn new(base: usize) -> Self {
        Self {
            base: base as *const RegisterBlock,
        }
    }

    /// Access the raw register block
    #[inline(always)]
    pub fn block(&self) -> &RegisterBlock {
        unsafe { &*self.base }
    }

    /// Set the run bit; the controller begins executing its schedule
    pub fn command_run(&self) {
        self.block().usbcmd.set_bits(UsbCmd::RUN.bits());
    }

    /// Clear the run bit
    pub fn command_stop(&self) {
        self.block().usbcmd.clear_bits(UsbCmd::RUN.bits());
    }

    /// Reset the controller and wait for the reset to complete
    ///
    /// Resets internal pipelines, timers, counters and state machines. Not
    /// recommended while attached; detach first by flushing all primed
    /// endpoints and stopping the controller.
    pub fn controller_reset(&self) -> Result<()> {
        self.block().usbcmd.write(UsbCmd::RESET.bits());
        SpinBudget::default()
            .wait_for(|| self.block().usbcmd.read() & UsbCmd::RESET.bits() == 0)
    }

    /// Set the interrupt threshold to issue interrupts immediately
    pub fn set_zero_interrupt_threshold(&self) {
        self.block().usbcmd.clear_bits(UsbCmd::ITC_MASK.bits());
    }

    /// Select device mode
    pub fn set_device_mode(&self) {
        self.block().usbmode.write(UsbMode::CM_DEVICE.bits());
    }

    /// Select host mode
    pub fn set_host_mode(&self) {
        self.block().usbmode.write(UsbMode::CM_HOST.bits());
    }

    /// Program the interrupt enable mask
    pub fn set_interrupt_mask(&self, mask: UsbSts) {
        self.block().usbintr.write(mask.bits());
    }

    /// Read the enabled-and-pending interrupt status, clearing what was read
    ///
    /// The read value is written back to USBSTS so that only the flags
    /// observed by this call are cleared; flags that set between the read and
    /// the write-back are preserved for the next call.
    pub fn read_and_clear_status(&self) -> UsbSts {
        let regs = self.block();
        let status = regs.usbsts.read() & regs.usbintr.read();
        regs.usbsts.write(status);
        UsbSts::from_bits_truncate(status)
    }

    /// Clear pending per-endpoint interrupt state covered by `mask`
    pub fn clear_pending_interrupts(&self, mask: u32) {
        let regs = self.block();
        regs.endptnak.write(mask);
        regs.endptnaken.write(mask);
        regs.usbsts.write(mask);
        regs.endptsetupstat.write(regs.endptsetupstat.read() & mask);
        regs.endptcomplete.write(regs.endptcomplete.read() & mask);
    }

    /// Write the device address, taking effect immediately
    pub fn set_address_immediate(&self, address: u8) {
        self.block()
            .periodiclistbase
            .write((address as u32) << deviceaddr::USBADR_SHIFT);
    }

    /// Write the device address, deferred until the status stage of the
    /// current control transfer completes
    pub fn set_address_deferred(&self, address: u8) {
        self.block()
            .periodiclistbase
            .write(((address as u32) << deviceaddr::USBADR_SHIFT) | deviceaddr::USBADRA);
    }

    /// Program the device-mode endpoint list (dQH table) base address
    ///
    /// The table must be 2048-byte aligned.
    pub fn set_endpoint_list_address(&self, address: u32) {
        debug_assert!(address & 0x7FF == 0);
        self.block().asynclistaddr.write(address);
    }

    /// Program the host-mode asynchronous list address
    pub fn set_async_list_address(&self, address: u32) {
        debug_assert!(address & 0x1F == 0);
        self.block().asynclistaddr.write(address);
    }

    /// Program the host-mode periodic frame list base
    pub fn set_periodic_list_base(&self, address: u32) {
        debug_assert!(address & 0xFFF == 0);
        self.block().periodiclistbase.write(address);
    }

    /// Read the negotiated port speed
    pub fn port_speed(&self) -> Speed {
        match PortSc::from_bits_truncate(self.block().portsc1.read()).speed() {
            Some(speed) => speed,
            None => {
                #[cfg(feature = "defmt")]
                defmt::warn!("unexpected port speed detected, defaulting to full speed");
                Speed::Full
            }
        }
    }

    /// Prevent the port from negotiating high speed (PORTSC1.PFSC)
    pub fn set_force_full_speed(&self, force: bool) {
        let regs = self.block();
        if force {
            regs.portsc1.set_bits(PortSc::FORCE_FULL_SPEED.bits());
        } else {
            regs.portsc1.clear_bits(PortSc::FORCE_FULL_SPEED.bits());
        }
    }

    /// Prime the endpoints covered by `mask`
    pub fn prime_endpoints(&self, mask: u32) {
        self.block().endptprime.write(mask);
    }

    /// Check whether any endpoint covered by `mask` is mid-prime
    pub fn is_priming(&self, mask: u32) -> bool {
        self.block().endptprime.read() & mask != 0
    }

    /// Wait until the controller has consumed all prime requests in `mask`
    pub fn wait_for_priming_to_finish(&self, mask: u32) -> Result<()> {
        SpinBudget::default().wait_for(|| self.block().endptprime.read() & mask == 0)
    }

    /// Begin flushing the endpoints covered by `mask`
    ///
    /// Clears any primed buffers. A packet already in progress on the wire
    /// continues to completion.
    pub fn flush_endpoints(&self, mask: u32) {
        self.block().endptflush.write(mask);
    }

    /// Wait until the controller has finished flushing the endpoints in `mask`
    pub fn wait_for_flushing_to_finish(&self, mask: u32) -> Result<()> {
        SpinBudget::default().wait_for(|| self.block().endptflush.read() & mask == 0)
    }

    /// Check whether an endpoint covered by `mask` has a primed buffer ready
    pub fn endpoint_ready(&self, mask: u32) -> bool {
        self.block().endptstat.read() & mask != 0
    }

    /// Read the raw endpoint-complete status
    pub fn endpoint_complete(&self) -> u32 {
        self.block().endptcomplete.read()
    }

    /// Clear the endpoint-complete bits in `mask`
    pub fn clear_endpoint_complete(&self, mask: u32) {
        self.block().endptcomplete.write(mask);
    }

    /// Read the raw endpoint setup status
    pub fn endpoint_setup_status(&self) -> u32 {
        self.block().endptsetupstat.read()
    }

    /// Clear the setup-status bits in `mask`, waiting for the clear to land
    pub fn clear_endpoint_setup_status(&self, mask: u32) -> Result<()> {
        self.block().endptsetupstat.write(mask);
        SpinBudget::default().wait_for(|| self.block().endptsetupstat.read() & mask == 0)
    }

    /// Modify an endpoint pair's control register
    pub fn modify_endpoint_control<F>(&self, endpoint_number: u8, f: F)
    where
        F: FnOnce(u32) -> u32,
    {
        self.block().endptctrl[endpoint_number as usize].modify(f);
    }

    /// Read an endpoint pair's control register
    pub fn endpoint_control(&self, endpoint_number: u8) -> EndptCtrl {
        EndptCtrl::from_bits_truncate(self.block().endptctrl[endpoint_number as usize].read())
    }

    /// Set the add-dTD tripwire bit
    pub fn set_atdtw(&self) {
        self.block().usbcmd.set_bits(UsbCmd::ATDTW.bits());
    }

    /// Clear the add-dTD tripwire bit
    pub fn clear_atdtw(&self) {
        self.block().usbcmd.clear_bits(UsbCmd::ATDTW.bits());
    }

    /// Check whether the add-dTD tripwire survived (observation was coherent)
    pub fn atdtw_is_set(&self) -> bool {
        self.block().usbcmd.read() & UsbCmd::ATDTW.bits() != 0
    }

    /// Enable NAK interrupts for the endpoints in `mask`
    pub fn enable_nak_interrupts(&self, mask: u32) {
        self.block().endptnaken.set_bits(mask);
    }

    /// Disable NAK interrupts for the endpoints in `mask`
    pub fn disable_nak_interrupts(&self, mask: u32) {
        self.block().endptnaken.clear_bits(mask);
    }

    /// Enable the host asynchronous schedule and wait for it to engage
    pub fn enable_async_schedule(&self) -> Result<()> {
        let regs = self.block();
        regs.usbcmd.set_bits(UsbCmd::ASYNC_SCHEDULE_ENABLE.bits());
        SpinBudget::default()
            .wait_for(|| regs.usbsts.read() & UsbSts::ASYNC_STATUS.bits() != 0)
    }

    /// Disable the host asynchronous schedule and wait for it to idle
    ///
    /// Once this returns, the schedule's queue heads are safe to modify.
    pub fn disable_async_schedule(&self) -> Result<()> {
        let regs = self.block();
        regs.usbcmd.clear_bits(UsbCmd::ASYNC_SCHEDULE_ENABLE.bits());
        SpinBudget::default()
            .wait_for(|| regs.usbsts.read() & UsbSts::ASYNC_STATUS.bits() == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_bit_positions() {
        assert_eq!(endpoint_bits::out_bit(0), 1);
        assert_eq!(endpoint_bits::out_bit(5), 1 << 5);
        assert_eq!(endpoint_bits::in_bit(0), 1 << 16);
        assert_eq!(endpoint_bits::in_bit(5), 1 << 21);
        assert_eq!(endpoint_bits::bit(3, true), 1 << 19);
        assert_eq!(endpoint_bits::bit(3, false), 1 << 3);
    }

    #[test]
    fn bitflag_values() {
        assert_eq!(UsbCmd::RUN.bits(), 1);
        assert_eq!(UsbCmd::ATDTW.bits(), 1 << 12);
        assert_eq!(UsbSts::USB_RESET.bits(), 1 << 6);
        assert_eq!(UsbSts::NAK.bits(), 1 << 16);
        assert_eq!(EndptCtrl::TX_ENABLE.bits(), 1 << 23);
        assert_eq!(PortSc::FORCE_FULL_SPEED.bits(), 1 << 24);
    }

    #[test]
    fn portsc_speed_decode() {
        assert_eq!(PortSc::from_bits_truncate(0).speed(), Some(Speed::Full));
        assert_eq!(
            PortSc::from_bits_truncate(2 << 26).speed(),
            Some(Speed::High)
        );
        assert_eq!(PortSc::from_bits_truncate(1 << 26).speed(), Some(Speed::Low));
        assert_eq!(PortSc::from_bits_truncate(3 << 26).speed(), None);
    }

    #[test]
    fn register_block_size_covers_endpoint_controls() {
        assert_eq!(core::mem::offset_of!(RegisterBlock, endptctrl), 0x1C0);
        assert!(core::mem::size_of::<RegisterBlock>() >= 0x1C0 + 4 * ENDPOINT_COUNT);
    }
}
