//! Device-mode controller: bringup, bus reset, interrupt handling and the
//! request-dispatch hooks
//!
//! The controller runs the simplified-EHCI device model: the hardware parses
//! tokens and DMAs transfer data through per-endpoint queue heads; software
//! reacts to SETUP and completion events from the interrupt handler and
//! drives the Chapter 9 state machine on endpoint 0.

pub mod qh;
pub mod queue;
pub mod standard_request;

mod endpoint;

use crate::descriptor::{
    Configuration, DeviceDescriptor, DeviceQualifierDescriptor, Direction, EndpointAddress,
    EndpointDescriptor, RequestKind, SetupPacket, StringTable,
};
use crate::error::{Result, UsbError};
use crate::registers::{endpoint_bits, EndptCtrl, UsbRegisters, UsbSts, ENDPOINT_COUNT};
use crate::{soc, Controller, Speed};
use self::qh::{QueueHeadTable, QUEUE_HEAD_COUNT};
use self::queue::TransferPool;

/// Stages of a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferStage {
    /// SETUP packet received
    Setup,
    /// Data stage completed
    Data,
    /// Status stage completed
    Status,
}

/// Outcome of a request handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestStatus {
    /// Request accepted; any reply has been scheduled
    Ok,
    /// Request rejected; the endpoint will be stalled
    Stall,
}

/// A control-request handler, invoked once per transfer stage
pub type RequestHandlerFn =
    fn(&mut UsbDevice, EndpointAddress, TransferStage) -> RequestStatus;

/// Per-endpoint event callback
pub type EndpointCallback = fn(&mut UsbDevice, EndpointAddress);

/// Device-level event callback
pub type DeviceCallback = fn(&mut UsbDevice);

/// The request handlers bound to a peripheral, selected by the setup
/// packet's request-type bits
#[derive(Clone, Copy)]
pub struct RequestHandlers {
    /// Chapter 9 standard requests
    pub standard: RequestHandlerFn,
    /// Class-defined requests
    pub class: Option<RequestHandlerFn>,
    /// Vendor-defined requests
    pub vendor: Option<RequestHandlerFn>,
}

impl Default for RequestHandlers {
    fn default() -> Self {
        Self {
            standard: standard_request::handle,
            class: None,
            vendor: None,
        }
    }
}

/// The descriptor set a device presents to the host
#[derive(Clone, Copy)]
pub struct DeviceDescriptors {
    /// The device descriptor
    pub device: &'static DeviceDescriptor,
    /// The device qualifier descriptor, absent on full-speed-only devices
    pub device_qualifier: Option<&'static DeviceQualifierDescriptor>,
    /// String descriptors; index 0 carries the language list
    pub strings: StringTable,
    /// Configurations served while operating at full speed
    pub full_speed_configurations: &'static [Configuration],
    /// Configurations served while operating at high speed
    pub high_speed_configurations: &'static [Configuration],
}

impl DeviceDescriptors {
    fn pool_for(&self, speed: Speed, other_speed: bool) -> &'static [Configuration] {
        let high = matches!(speed, Speed::High) != other_speed;
        if high {
            self.high_speed_configurations
        } else {
            self.full_speed_configurations
        }
    }
}

/// Look up a configuration by value in a speed pool
///
/// Value 0 denotes the unconfigured state and never matches a descriptor.
/// The search is bounded by the device descriptor's configuration count,
/// like the enumeration the host sees.
pub(crate) fn find_configuration_in(
    pool: &'static [Configuration],
    configuration_count: u8,
    value: u8,
) -> Option<Configuration> {
    if value == 0 {
        return None;
    }
    pool.iter()
        .take(configuration_count as usize)
        .find(|configuration| configuration.value() == value)
        .copied()
}

struct EndpointState {
    setup: SetupPacket,
    setup_complete: Option<EndpointCallback>,
    transfer_complete: Option<EndpointCallback>,
}

impl EndpointState {
    const fn new() -> Self {
        Self {
            setup: SetupPacket {
                request_type: 0,
                request: 0,
                value: 0,
                index: 0,
                length: 0,
            },
            setup_complete: None,
            transfer_complete: None,
        }
    }
}

/// A USB controller operating in device mode
pub struct UsbDevice {
    pub(crate) regs: UsbRegisters,
    controller: Controller,
    pub(crate) descriptors: DeviceDescriptors,
    active_configuration: Option<Configuration>,
    endpoints: [EndpointState; QUEUE_HEAD_COUNT],
    pub(crate) queue_heads: &'static mut QueueHeadTable,
    pub(crate) transfers: &'static mut TransferPool,
    handlers: RequestHandlers,
    configuration_changed: Option<DeviceCallback>,
    port_change: Option<DeviceCallback>,
    suspend: Option<DeviceCallback>,
    pub(crate) control_reply: [u8; 2],
}

impl UsbDevice {
    /// Create a device-mode driver for `controller`
    ///
    /// Endpoint 0's callbacks are wired to the control-transfer stage
    /// dispatcher; other endpoints get callbacks via
    /// [`set_endpoint_callbacks`](Self::set_endpoint_callbacks).
    ///
    /// # Safety
    ///
    /// The caller must hold exclusive ownership of the controller, and
    /// `queue_heads`/`transfers` must live in DMA-visible memory.
    pub unsafe fn new(
        controller: Controller,
        descriptors: DeviceDescriptors,
        queue_heads: &'static mut QueueHeadTable,
        transfers: &'static mut TransferPool,
    ) -> Self {
        let mut device = Self {
            regs: unsafe { UsbRegisters::new(controller.register_base()) },
            controller,
            descriptors,
            active_configuration: None,
            endpoints: [const { EndpointState::new() }; QUEUE_HEAD_COUNT],
            queue_heads,
            transfers,
            handlers: RequestHandlers::default(),
            configuration_changed: None,
            port_change: None,
            suspend: None,
            control_reply: [0; 2],
        };

        let ep0_out = EndpointAddress::new(0, Direction::Out);
        let ep0_in = EndpointAddress::new(0, Direction::In);
        device.endpoints[ep0_out.queue_head_index()].setup_complete =
            Some(control_setup_complete);
        device.endpoints[ep0_out.queue_head_index()].transfer_complete =
            Some(control_out_complete);
        device.endpoints[ep0_in.queue_head_index()].transfer_complete =
            Some(control_in_complete);

        device
    }

    /// The controller this device runs on
    pub fn controller(&self) -> Controller {
        self.controller
    }

    /// Replace the bound request handlers
    pub fn set_request_handlers(&mut self, handlers: RequestHandlers) {
        self.handlers = handlers;
    }

    /// Register callbacks for a non-control endpoint
    pub fn set_endpoint_callbacks(
        &mut self,
        endpoint: EndpointAddress,
        setup_complete: Option<EndpointCallback>,
        transfer_complete: Option<EndpointCallback>,
    ) {
        let state = &mut self.endpoints[endpoint.queue_head_index()];
        state.setup_complete = setup_complete;
        state.transfer_complete = transfer_complete;
    }

    /// Register a callback fired when the host applies a configuration
    pub fn on_configuration_changed(&mut self, callback: DeviceCallback) {
        self.configuration_changed = Some(callback);
    }

    /// Register a callback fired on port change events
    pub fn on_port_change(&mut self, callback: DeviceCallback) {
        self.port_change = Some(callback);
    }

    /// Register a callback fired when the bus suspends
    pub fn on_suspend(&mut self, callback: DeviceCallback) {
        self.suspend = Some(callback);
    }

    /// The setup packet cached for an endpoint
    pub fn endpoint_setup(&self, endpoint: EndpointAddress) -> SetupPacket {
        self.endpoints[endpoint.queue_head_index()].setup
    }

    /// Reset the block, configure device mode and unmask interrupts
    ///
    /// After this the endpoint queues can be initialized and
    /// [`run`](Self::run) starts enumeration.
    pub fn init(&mut self) -> Result<()> {
        soc::phy_enable(self.controller);
        self.controller_reset()?;
        self.set_device_mode();

        self.regs.set_zero_interrupt_threshold();
        self.regs
            .set_endpoint_list_address(self.queue_heads.base_address());

        // SOF stays masked; everything else the ISR handles is enabled here.
        self.regs.set_interrupt_mask(
            UsbSts::USB_INTERRUPT
                | UsbSts::USB_ERROR
                | UsbSts::PORT_CHANGE
                | UsbSts::USB_RESET
                | UsbSts::SUSPEND
                | UsbSts::NAK,
        );
        Ok(())
    }

    /// Reset the controller block through the reset-generation unit
    pub fn peripheral_reset(&mut self) -> Result<()> {
        soc::peripheral_reset(self.controller)
    }

    /// Enable the controller's interrupt and start responding on the bus
    pub fn run(&mut self) {
        unsafe { cortex_m::peripheral::NVIC::unmask(self.controller.interrupt()) };
        self.regs.command_run();
    }

    fn set_device_mode(&mut self) {
        self.regs.set_device_mode();

        // USB0 carries the OTG cell; device operation needs the OTG
        // termination (USB_DM pull-down) selected.
        if matches!(self.controller, Controller::Usb0) {
            self.regs
                .block()
                .otgsc
                .write(crate::registers::OtgSc::OTG_TERMINATION.bits());
        }
    }

    /// Stop and reset the controller's internal state machines
    ///
    /// Detaches first: all primed endpoints are flushed and the controller is
    /// stopped, since resetting while attached leaves the host's view
    /// undefined.
    pub fn controller_reset(&mut self) -> Result<()> {
        self.reset_all_endpoints()?;
        self.regs.command_stop();
        self.regs.controller_reset()
    }

    fn disable_all_endpoints(&mut self) {
        for number in 0..ENDPOINT_COUNT as u8 {
            self.regs.modify_endpoint_control(number, |value| {
                value & !(EndptCtrl::RX_ENABLE.bits() | EndptCtrl::TX_ENABLE.bits())
            });
        }
    }

    fn reset_all_endpoints(&mut self) -> Result<()> {
        self.disable_all_endpoints();
        self.regs.clear_pending_interrupts(endpoint_bits::ALL);

        self.regs.wait_for_priming_to_finish(endpoint_bits::ALL)?;
        self.regs.flush_endpoints(endpoint_bits::ALL);
        self.regs.wait_for_flushing_to_finish(endpoint_bits::ALL)
    }

    /// React to a bus reset from the host (UM10503 section 23.10.3)
    ///
    /// Returns the device to the Default state: all endpoints disabled and
    /// drained, address 0 effective immediately, configuration cleared.
    pub fn bus_reset(&mut self) -> Result<()> {
        #[cfg(feature = "defmt")]
        defmt::debug!("usb bus reset");

        self.reset_all_endpoints()?;
        for qh_index in 0..QUEUE_HEAD_COUNT {
            self.transfers.flush_queue(qh_index);
        }
        self.regs.set_address_immediate(0);
        self.set_configuration(0)
    }

    /// Write the device address, effective immediately
    pub fn set_address_immediate(&mut self, address: u8) {
        self.regs.set_address_immediate(address);
    }

    /// Write the device address, latched by the hardware at the next IN
    /// status stage
    ///
    /// SET_ADDRESS uses this form: the transfer's own status stage must still
    /// be acknowledged from address 0.
    pub fn set_address_deferred(&mut self, address: u8) {
        self.regs.set_address_deferred(address);
    }

    /// The speed the port negotiated
    pub fn speed(&self) -> Speed {
        self.regs.port_speed()
    }

    /// Keep the port from negotiating high speed
    ///
    /// Useful for debugging high-speed-specific behavior or watching traffic
    /// with a full-speed analyzer.
    pub fn prevent_high_speed(&mut self) {
        #[cfg(feature = "defmt")]
        defmt::warn!("disabling high-speed communication");
        self.regs.set_force_full_speed(true);
    }

    /// Allow high-speed negotiation again
    pub fn allow_high_speed(&mut self) {
        self.regs.set_force_full_speed(false);
    }

    /// Find a current-speed configuration by its value
    pub fn find_configuration_descriptor(&self, value: u8) -> Option<Configuration> {
        find_configuration_in(
            self.descriptors.pool_for(self.speed(), false),
            self.descriptors.device.configuration_count,
            value,
        )
    }

    /// Find an opposite-speed configuration by its value
    pub fn find_other_speed_configuration_descriptor(&self, value: u8) -> Option<Configuration> {
        find_configuration_in(
            self.descriptors.pool_for(self.speed(), true),
            self.descriptors.device.configuration_count,
            value,
        )
    }

    /// Apply a configuration by value; 0 de-configures the device
    pub fn set_configuration(&mut self, value: u8) -> Result<()> {
        let new_configuration = self.find_configuration_descriptor(value);
        if value != 0 && new_configuration.is_none() {
            return Err(UsbError::InvalidParameter);
        }

        self.active_configuration = new_configuration;

        if let Some(callback) = self.configuration_changed {
            callback(self);
        }
        Ok(())
    }

    /// The configuration currently applied, if any
    pub fn active_configuration(&self) -> Option<Configuration> {
        self.active_configuration
    }

    /// The active configuration's descriptor for `endpoint`, if present
    pub fn endpoint_descriptor(&self, endpoint: EndpointAddress) -> Option<EndpointDescriptor> {
        self.active_configuration?.endpoint_descriptor(endpoint)
    }

    /// Device-mode interrupt handler top half
    ///
    /// Call from the controller's interrupt vector. SETUP events are handled
    /// before completions so a fresh control transfer's setup handler always
    /// runs before stale completion callbacks from its predecessor.
    pub fn isr(&mut self) {
        let status = self.regs.read_and_clear_status();
        if status.is_empty() {
            return;
        }

        if status.contains(UsbSts::USB_INTERRUPT) {
            // Transaction with IOC completed, short packet, or SETUP received.
            self.check_for_setup_events();
            self.check_for_transfer_events();
        }

        if status.contains(UsbSts::PORT_CHANGE) {
            // Port entered the full- or high-speed operational state.
            if let Some(callback) = self.port_change {
                callback(self);
            }
        }

        if status.contains(UsbSts::SUSPEND) {
            if let Some(callback) = self.suspend {
                callback(self);
            }
        }

        if status.contains(UsbSts::USB_RESET) {
            if self.bus_reset().is_err() {
                #[cfg(feature = "defmt")]
                defmt::warn!("controller unresponsive during bus reset");
            }
        }

        // USB_ERROR: completion error on a TD with IOC set; surfaced through
        // the transfer's status bits. NAK: observers only. Neither requires
        // action here.
    }

    fn check_for_setup_events(&mut self) {
        let setup_status = self.regs.endpoint_setup_status();
        if setup_status == 0 {
            return;
        }

        for number in 0..ENDPOINT_COUNT as u8 {
            let bit = 1 << number;
            if setup_status & bit == 0 {
                continue;
            }

            let out = EndpointAddress::new(number, Direction::Out);
            let setup = self.queue_heads.for_endpoint(out).read_setup();

            // Cache the packet on both sides of the pair; the handler may
            // consult it from whichever direction the data stage uses.
            self.endpoints[out.queue_head_index()].setup = setup;
            self.endpoints[out.opposite().queue_head_index()].setup = setup;

            // The setup is ours now; release the capture area before
            // clearing out any stale control transfer.
            if self.regs.clear_endpoint_setup_status(bit).is_err() {
                #[cfg(feature = "defmt")]
                defmt::warn!("setup status stuck on endpoint {}", number);
            }
            let _ = self.endpoint_flush(out.opposite());
            let _ = self.endpoint_flush(out);

            if let Some(callback) = self.endpoints[out.queue_head_index()].setup_complete {
                callback(self, out);
            }
        }
    }

    fn check_for_transfer_events(&mut self) {
        let complete = self.regs.endpoint_complete();
        if complete == 0 {
            return;
        }

        for number in 0..ENDPOINT_COUNT as u8 {
            let out_bit = endpoint_bits::out_bit(number);
            if complete & out_bit != 0 {
                self.regs.clear_endpoint_complete(out_bit);
                let endpoint = EndpointAddress::new(number, Direction::Out);
                self.finish_transfer(endpoint);
            }

            let in_bit = endpoint_bits::in_bit(number);
            if complete & in_bit != 0 {
                self.regs.clear_endpoint_complete(in_bit);
                let endpoint = EndpointAddress::new(number, Direction::In);
                self.finish_transfer(endpoint);
            }
        }
    }

    fn finish_transfer(&mut self, endpoint: EndpointAddress) {
        self.transfers.reap_completed(endpoint.queue_head_index());
        if let Some(callback) = self.endpoints[endpoint.queue_head_index()].transfer_complete {
            callback(self, endpoint);
        }
    }

    fn dispatch_request(&mut self, endpoint: EndpointAddress, stage: TransferStage) {
        let setup = self.endpoint_setup(endpoint);
        let handler = match setup.kind() {
            RequestKind::Standard => Some(self.handlers.standard),
            RequestKind::Class => self.handlers.class,
            RequestKind::Vendor => self.handlers.vendor,
            RequestKind::Reserved => None,
        };

        let status = match handler {
            Some(handler) => handler(self, endpoint, stage),
            None => RequestStatus::Stall,
        };

        if status != RequestStatus::Ok {
            let _ = self.endpoint_stall(endpoint);
        }
    }
}

/// Setup stage arrived on a control endpoint
fn control_setup_complete(device: &mut UsbDevice, endpoint: EndpointAddress) {
    device.dispatch_request(endpoint, TransferStage::Setup);
}

/// IN completion on a control endpoint: the data stage finished if the
/// request moves data device-to-host, otherwise the status stage did
fn control_in_complete(device: &mut UsbDevice, endpoint: EndpointAddress) {
    let stage = match device.endpoint_setup(endpoint).direction() {
        Direction::In => TransferStage::Data,
        Direction::Out => TransferStage::Status,
    };
    device.dispatch_request(endpoint, stage);
}

/// OUT completion on a control endpoint: mirror of [`control_in_complete`]
fn control_out_complete(device: &mut UsbDevice, endpoint: EndpointAddress) {
    let stage = match device.endpoint_setup(endpoint).direction() {
        Direction::Out => TransferStage::Data,
        Direction::In => TransferStage::Status,
    };
    device.dispatch_request(endpoint, stage);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{ConfigurationDescriptor, DescriptorType};
    use std::boxed::Box;

    fn configuration(value: u8) -> Configuration {
        let descriptor = ConfigurationDescriptor {
            length: 9,
            descriptor_type: DescriptorType::Configuration as u8,
            total_length: 9,
            interface_count: 0,
            value,
            string_index: 0,
            attributes: 0x80,
            max_power: 50,
        };
        let mut bytes = [0u8; 9];
        bytes.copy_from_slice(descriptor.as_bytes());
        Configuration::new(&*Box::leak(Box::new(bytes)))
    }

    #[test]
    fn configuration_lookup_by_value() {
        let pool: &'static [Configuration] =
            Box::leak(Box::new([configuration(1), configuration(2)]));

        assert_eq!(find_configuration_in(pool, 2, 1).unwrap().value(), 1);
        assert_eq!(find_configuration_in(pool, 2, 2).unwrap().value(), 2);

        // Value 0 is the well-defined "not configured" state, not an error
        // and never a descriptor.
        assert!(find_configuration_in(pool, 2, 0).is_none());
        assert!(find_configuration_in(pool, 2, 3).is_none());

        // The device descriptor's configuration count bounds the search.
        assert!(find_configuration_in(pool, 1, 2).is_none());
    }
}
