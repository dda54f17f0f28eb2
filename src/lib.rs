#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

//! Dual-role USB 2.0 driver for the LPC43xx USB0/USB1 controllers
//!
//! The controllers are EHCI-family blocks: host mode follows EHCI proper,
//! device mode the simplified-EHCI device model (UM10503 chapter 23). Each
//! controller runs one role at a time:
//!
//! - [`device::UsbDevice`] — accept enumeration from an upstream host:
//!   endpoint queue heads, the per-endpoint transfer queue and the Chapter 9
//!   standard-request engine on endpoint 0.
//! - [`host::UsbHost`] — drive downstream devices through the asynchronous
//!   transfer queue: queue-head ring management, pooled transfer
//!   descriptors and interrupt-context completion reaping.
//!
//! # Core Components
//!
//! - [`registers`] - typed access to the controller register block
//! - [`dma`] - link words and token layout shared by both roles
//! - [`descriptor`] - setup packets and descriptor wire formats
//! - [`device`] - device-mode controller and request engine
//! - [`host`] - host-mode asynchronous queue manager
//! - [`error`] - driver error types
//!
//! All DMA-visible structures (queue-head tables, pools, host buffers) are
//! owned by the caller and handed in as `&'static mut`, so their placement
//! in DMA-visible memory stays under application control.

#[cfg(test)]
extern crate std;

/// Hardware timing constants for the LPC43xx USB controllers
///
/// Cycle conversions assume the Cortex-M4 core at its 204 MHz maximum;
/// applications clocking lower simply wait proportionally longer, which is
/// harmless for these bounds.
pub mod timing {
    /// Core frequency used for cycle conversions, in MHz
    pub const CPU_FREQ_MHZ: u32 = 204;

    /// Convert microseconds to CPU cycles
    #[inline(always)]
    pub const fn us_to_cycles(us: u32) -> u32 {
        us * CPU_FREQ_MHZ
    }

    /// Convert milliseconds to CPU cycles
    #[inline(always)]
    pub const fn ms_to_cycles(ms: u32) -> u32 {
        ms * CPU_FREQ_MHZ * 1000
    }

    /// Port reset assertion time (20 ms minimum per USB 2.0 section 7.1.7.5)
    pub const PORT_RESET_HOLD_MS: u32 = 20;
}

pub mod descriptor;
pub mod device;
pub mod dma;
pub mod error;
pub mod host;
pub mod registers;

mod soc;

pub use descriptor::{Direction, EndpointAddress, SetupPacket};
pub use device::UsbDevice;
pub use error::{Result, UsbError};
pub use host::UsbHost;
pub use soc::usb1_set_vbus_present;

/// USB device address (0-127)
pub type DeviceAddress = u8;
/// USB endpoint number (0-15, direction encoded separately)
pub type EndpointNumber = u8;
/// Maximum packet size for an endpoint
pub type MaxPacketSize = u16;

/// The two USB controllers on the part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Controller {
    /// USB0: high-speed capable, integrated HS PHY, OTG cell
    Usb0,
    /// USB1: full-speed with the on-chip PHY
    Usb1,
}

impl Controller {
    /// Base address of the controller's register block
    pub const fn register_base(self) -> usize {
        match self {
            Self::Usb0 => registers::USB0_BASE,
            Self::Usb1 => registers::USB1_BASE,
        }
    }

    /// The controller's NVIC interrupt
    pub const fn interrupt(self) -> Interrupt {
        match self {
            Self::Usb0 => Interrupt::Usb0,
            Self::Usb1 => Interrupt::Usb1,
        }
    }
}

/// NVIC interrupt numbers for the USB controllers (UM10503 table 89)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// USB0 interrupt
    Usb0 = 8,
    /// USB1 interrupt
    Usb1 = 9,
}

unsafe impl cortex_m::interrupt::InterruptNumber for Interrupt {
    #[inline(always)]
    fn number(self) -> u16 {
        self as u16
    }
}

/// USB bus speeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Speed {
    /// 1.5 Mbps
    Low,
    /// 12 Mbps
    Full,
    /// 480 Mbps
    High,
    /// 5 Gbps; never negotiated by this hardware, present for completeness
    Super,
}

impl Speed {
    /// The speed encoding used in host queue-head endpoint characteristics
    pub const fn queue_head_encoding(self) -> u32 {
        match self {
            Self::Full => 0,
            Self::Low => 1,
            Self::High => 2,
            Self::Super => 3,
        }
    }
}
