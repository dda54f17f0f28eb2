//! Endpoint primitives: prime, flush, stall, enable, disable, append
//!
//! Each primitive operates on an endpoint identified by its USB address byte
//! (direction in bit 7). The hardware views an endpoint pair through one
//! ENDPTCTRL register and per-direction bits in the prime/flush/status/
//! complete registers.

use super::qh::TransferDescriptor;
use super::UsbDevice;
use crate::descriptor::{EndpointAddress, TransferType};
use crate::dma::LinkWord;
use crate::error::Result;
use crate::registers::{endpoint_bits, EndptCtrl, SpinBudget};

impl UsbDevice {
    #[inline(always)]
    fn endpoint_bit(endpoint: EndpointAddress) -> u32 {
        endpoint_bits::bit(endpoint.number(), endpoint.is_in())
    }

    /// Hand a dTD chain to the controller and request servicing
    ///
    /// The caller must know the endpoint is idle; appending to a live chain
    /// goes through [`endpoint_schedule_append`](Self::endpoint_schedule_append)
    /// instead.
    pub fn endpoint_prime(&mut self, endpoint: EndpointAddress, first: *const TransferDescriptor) {
        let qh = self.queue_heads.for_endpoint(endpoint);
        qh.stage_for_prime(LinkWord::to(first));
        self.regs.prime_endpoints(Self::endpoint_bit(endpoint));
    }

    /// Whether the controller is still consuming a prime request
    pub fn endpoint_is_priming(&self, endpoint: EndpointAddress) -> bool {
        self.regs.is_priming(Self::endpoint_bit(endpoint))
    }

    /// Whether the endpoint has a primed buffer waiting
    pub fn endpoint_is_ready(&self, endpoint: EndpointAddress) -> bool {
        self.regs.endpoint_ready(Self::endpoint_bit(endpoint))
    }

    /// Whether the endpoint has an unacknowledged completion
    pub fn endpoint_is_complete(&self, endpoint: EndpointAddress) -> bool {
        self.regs.endpoint_complete() & Self::endpoint_bit(endpoint) != 0
    }

    /// Prime a descriptor on an idle endpoint, waiting out any residue of an
    /// aborted transaction first
    pub(crate) fn endpoint_schedule_wait(
        &mut self,
        endpoint: EndpointAddress,
        transfer_index: u8,
    ) -> Result<()> {
        let mask = Self::endpoint_bit(endpoint);
        SpinBudget::default().wait_for(|| !self.regs.endpoint_ready(mask))?;
        let first = self.transfers.descriptor_address(transfer_index);
        self.endpoint_prime(endpoint, first);
        Ok(())
    }

    /// Append a descriptor to an endpoint's live chain
    ///
    /// Links the new descriptor after `tail`, then runs the add-dTD-tripwire
    /// handshake: set ATDTW, sample the endpoint's ready bit, and accept the
    /// sample only if ATDTW survives the read-back. If the coherent sample
    /// shows the hardware already drained the old chain before our link was
    /// visible, the new descriptor must be primed explicitly; otherwise the
    /// controller picks it up on its own. This is the only sequence that
    /// closes the race between software append and hardware completion.
    pub(crate) fn endpoint_schedule_append(
        &mut self,
        endpoint: EndpointAddress,
        tail_index: u8,
        new_index: u8,
    ) {
        self.transfers.link_descriptor(tail_index, new_index);

        if self.endpoint_is_priming(endpoint) {
            return;
        }

        let mask = Self::endpoint_bit(endpoint);
        let ready = loop {
            self.regs.set_atdtw();
            let sample = self.regs.endpoint_ready(mask);
            if self.regs.atdtw_is_set() {
                break sample;
            }
        };
        self.regs.clear_atdtw();

        if !ready {
            let first = self.transfers.descriptor_address(new_index);
            self.endpoint_prime(endpoint, first);
        }
    }

    /// Cancel all pending transfers on an endpoint
    ///
    /// Drops the software queue, then flushes the hardware: wait for any
    /// in-progress prime to land, request the flush, and wait for the flush
    /// bit to clear. A packet already on the wire completes naturally.
    pub fn endpoint_flush(&mut self, endpoint: EndpointAddress) -> Result<()> {
        critical_section::with(|_| {
            self.transfers.flush_queue(endpoint.queue_head_index());
        });

        let mask = Self::endpoint_bit(endpoint);
        self.regs.wait_for_priming_to_finish(mask)?;
        self.regs.flush_endpoints(mask);
        self.regs.wait_for_flushing_to_finish(mask)
    }

    /// Stall an endpoint
    ///
    /// Stalling applies to the endpoint pair, so both RX and TX stall bits
    /// are set (UM10503 section 23.10.5.2). A protocol stall on endpoint 0
    /// also clears out any queued control transfer in both directions.
    pub fn endpoint_stall(&mut self, endpoint: EndpointAddress) -> Result<()> {
        let number = endpoint.number();
        self.regs.modify_endpoint_control(number, |value| {
            value | EndptCtrl::RX_STALL.bits() | EndptCtrl::TX_STALL.bits()
        });

        if number == 0 {
            self.endpoint_flush(EndpointAddress::from_address(0x80))?;
            self.endpoint_flush(EndpointAddress::from_address(0x00))?;
        }
        Ok(())
    }

    /// Program the endpoint pair's transfer type
    ///
    /// Both directions receive the type: UM10503 section 23.6.24 requires the
    /// unused side of an endpoint to be configured as a non-control type.
    pub fn endpoint_set_type(&mut self, endpoint: EndpointAddress, transfer_type: TransferType) {
        let type_bits = transfer_type as u32;
        self.regs.modify_endpoint_control(endpoint.number(), |value| {
            (value & !(EndptCtrl::RX_TYPE_MASK.bits() | EndptCtrl::TX_TYPE_MASK.bits()))
                | (type_bits << EndptCtrl::RX_TYPE_SHIFT)
                | (type_bits << EndptCtrl::TX_TYPE_SHIFT)
        });
    }

    /// Enable an endpoint, resetting its data toggle
    pub fn endpoint_enable(&mut self, endpoint: EndpointAddress) {
        let bits = if endpoint.is_in() {
            EndptCtrl::TX_ENABLE.bits() | EndptCtrl::TX_TOGGLE_RESET.bits()
        } else {
            EndptCtrl::RX_ENABLE.bits() | EndptCtrl::RX_TOGGLE_RESET.bits()
        };
        self.regs
            .modify_endpoint_control(endpoint.number(), |value| value | bits);
    }

    /// Disable an endpoint and discard anything it had pending
    pub fn endpoint_disable(&mut self, endpoint: EndpointAddress) -> Result<()> {
        let enable = if endpoint.is_in() {
            EndptCtrl::TX_ENABLE.bits()
        } else {
            EndptCtrl::RX_ENABLE.bits()
        };
        self.regs
            .modify_endpoint_control(endpoint.number(), |value| value & !enable);

        critical_section::with(|_| {
            self.transfers.flush_queue(endpoint.queue_head_index());
        });
        self.regs
            .clear_pending_interrupts(Self::endpoint_bit(endpoint));
        self.endpoint_flush(endpoint)
    }

    /// Enable NAK interrupts for an IN endpoint
    pub fn endpoint_enable_nak_interrupt(&mut self, endpoint: EndpointAddress) {
        self.regs
            .enable_nak_interrupts(endpoint_bits::in_bit(endpoint.number()));
    }

    /// Disable NAK interrupts for an IN endpoint
    pub fn endpoint_disable_nak_interrupt(&mut self, endpoint: EndpointAddress) {
        self.regs
            .disable_nak_interrupts(endpoint_bits::in_bit(endpoint.number()));
    }

    /// Configure an endpoint from the active configuration's descriptor
    ///
    /// Falls back to a control endpoint at the device's EP0 max packet size
    /// when the active configuration does not describe the endpoint, which
    /// covers endpoint 0 itself and pre-configuration bringup.
    pub fn endpoint_init(&mut self, endpoint: EndpointAddress) -> Result<()> {
        let (max_packet_size, transfer_type) = match self.endpoint_descriptor(endpoint) {
            Some(descriptor) => ({ descriptor.max_packet_size }, descriptor.transfer_type()),
            None => (
                self.descriptors.device.ep0_max_packet_size as u16,
                TransferType::Control,
            ),
        };
        self.endpoint_init_with(endpoint, max_packet_size, transfer_type)
    }

    /// Configure an endpoint with explicit parameters
    pub fn endpoint_init_with(
        &mut self,
        endpoint: EndpointAddress,
        max_packet_size: u16,
        transfer_type: TransferType,
    ) -> Result<()> {
        self.endpoint_flush(endpoint)?;

        let qh = self.queue_heads.for_endpoint(endpoint);
        qh.configure(max_packet_size, transfer_type);
        qh.set_endpoint_info(endpoint);

        self.endpoint_set_type(endpoint, transfer_type);
        self.endpoint_enable(endpoint);
        Ok(())
    }
}
