//! SoC plumbing the controller depends on: PHY power and block reset
//!
//! These touch CREG, SCU and RGU registers outside the USB block proper;
//! everything else about clocks and pin muxing is the application's business.

use crate::error::Result;
use crate::registers::{modify_register_at, read_register_at, write_register_at, SpinBudget};
use crate::Controller;

/// CREG0: USB0 PHY power control lives in bit 5 (set = powered down)
const CREG_CREG0: *mut u32 = 0x4004_3004 as *mut u32;
const CREG0_USB0PHY_POWERDOWN: u32 = 1 << 5;

/// SCU SFSUSB: USB1 full-speed PHY configuration
const SCU_SFSUSB: *mut u32 = 0x4008_6C80 as *mut u32;
/// ESEA=1 (enable), EPWR=1 (powered): the USB1 FS PHY's run configuration
const SFSUSB_PHY_ENABLED: u32 = 0x12;
/// VBUS-present indication to the PHY
const SFSUSB_VBUS_VALID: u32 = 1 << 5;

/// RGU reset control and status
const RGU_RESET_CTRL0: *mut u32 = 0x4005_3100 as *mut u32;
const RGU_RESET_ACTIVE_STATUS0: *const u32 = 0x4005_3150 as *const u32;
const RESET_CTRL0_USB0_RST: u32 = 1 << 17;
const RESET_CTRL0_USB1_RST: u32 = 1 << 18;

/// Power up the PHY for the given controller
pub(crate) fn phy_enable(controller: Controller) {
    match controller {
        Controller::Usb0 => unsafe {
            modify_register_at(CREG_CREG0, |value| value & !CREG0_USB0PHY_POWERDOWN);
        },
        Controller::Usb1 => unsafe {
            write_register_at(SCU_SFSUSB, SFSUSB_PHY_ENABLED);

            // The USB1 PHY only runs once it believes VBUS is present. With
            // VBUS sensing wired up the application drives this bit from the
            // USB1_SENSE pin; otherwise claim VBUS is always there, which
            // works with essentially every host.
            #[cfg(not(feature = "usb1-sense-vbus"))]
            modify_register_at(SCU_SFSUSB, |value| value | SFSUSB_VBUS_VALID);
        },
    }
}

/// Report VBUS presence to the USB1 full-speed PHY
///
/// Intended to be called from the application's USB1_SENSE pin interrupt when
/// the `usb1-sense-vbus` feature is active.
pub fn usb1_set_vbus_present(present: bool) {
    unsafe {
        modify_register_at(SCU_SFSUSB, |value| {
            if present {
                value | SFSUSB_VBUS_VALID
            } else {
                value & !SFSUSB_VBUS_VALID
            }
        });
    }
}

/// Reset the controller block through the reset-generation unit
pub(crate) fn peripheral_reset(controller: Controller) -> Result<()> {
    let mask = match controller {
        Controller::Usb0 => RESET_CTRL0_USB0_RST,
        Controller::Usb1 => RESET_CTRL0_USB1_RST,
    };

    unsafe {
        write_register_at(RGU_RESET_CTRL0, mask);
        write_register_at(RGU_RESET_CTRL0, 0);
    }
    // The status bit rises once the block has come back out of reset.
    SpinBudget::default()
        .wait_for(|| unsafe { read_register_at(RGU_RESET_ACTIVE_STATUS0) } & mask != 0)
}
