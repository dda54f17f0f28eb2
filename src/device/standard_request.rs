//! Chapter 9 standard request handling on endpoint 0
//!
//! A control transfer runs in three stages (setup, optional data, status);
//! the dispatcher invokes this engine once per stage. All decisions happen at
//! the setup stage, where the handler schedules the IN/OUT descriptors for
//! the later stages; data and status stages then complete on their own.

use super::{RequestStatus, TransferStage, UsbDevice};
use crate::descriptor::{
    DescriptorType, Direction, EndpointAddress, SetupPacket, StandardRequest,
};

/// Entry point bound as the standard-request handler
pub fn handle(
    device: &mut UsbDevice,
    endpoint: EndpointAddress,
    stage: TransferStage,
) -> RequestStatus {
    match stage {
        TransferStage::Setup => handle_setup(device, endpoint),
        // The setup-stage handler queued everything the controller needs;
        // later stages just acknowledge.
        TransferStage::Data | TransferStage::Status => RequestStatus::Ok,
    }
}

fn handle_setup(device: &mut UsbDevice, endpoint: EndpointAddress) -> RequestStatus {
    let setup = device.endpoint_setup(endpoint);

    match StandardRequest::from_request(setup.request) {
        Some(StandardRequest::GetStatus) => get_status(device, endpoint, setup),
        Some(StandardRequest::GetDescriptor) => get_descriptor(device, endpoint, setup),
        Some(StandardRequest::SetAddress) => set_address(device, endpoint, setup),
        Some(StandardRequest::GetConfiguration) => get_configuration(device, endpoint, setup),
        Some(StandardRequest::SetConfiguration) => set_configuration(device, endpoint, setup),
        // CLEAR_FEATURE and SET_FEATURE included: recovery from an endpoint
        // halt currently requires a bus reset.
        _ => RequestStatus::Stall,
    }
}

/// Number of bytes a GET_DESCRIPTOR reply carries
///
/// A configuration descriptor answers with its `total_length` so the
/// subordinate descriptors follow in the same transfer; everything else
/// answers with its own length byte. The host's `wLength` caps the reply
/// either way; a longer `wLength` gets the full descriptor with no padding.
pub(crate) fn descriptor_reply_length(descriptor: &[u8], requested: u16) -> u32 {
    let mut length = descriptor[0] as u32;
    if descriptor[1] == DescriptorType::Configuration as u8 {
        length = u16::from_le_bytes([descriptor[2], descriptor[3]]) as u32;
    }
    length.min(requested as u32)
}

/// Schedule a descriptor (or stall for a missing one) as the reply to a
/// GET_DESCRIPTOR-shaped request
fn send_descriptor(
    device: &mut UsbDevice,
    endpoint: EndpointAddress,
    setup: SetupPacket,
    descriptor: Option<&'static [u8]>,
) -> RequestStatus {
    let Some(bytes) = descriptor else {
        return RequestStatus::Stall;
    };

    let length = descriptor_reply_length(bytes, setup.length);
    send_reply(device, endpoint, bytes.as_ptr(), length)
}

/// Schedule `length` bytes from `data` on the IN side and an ACK on OUT
fn send_reply(
    device: &mut UsbDevice,
    endpoint: EndpointAddress,
    data: *const u8,
    length: u32,
) -> RequestStatus {
    let in_endpoint = EndpointAddress::new(endpoint.number(), Direction::In);
    let out_endpoint = EndpointAddress::new(endpoint.number(), Direction::Out);

    let scheduled = unsafe { device.transfer_schedule(in_endpoint, data, length, None, 0) }
        .and_then(|_| device.transfer_schedule_ack(out_endpoint));

    match scheduled {
        Ok(()) => RequestStatus::Ok,
        Err(_) => RequestStatus::Stall,
    }
}

fn get_descriptor(
    device: &mut UsbDevice,
    endpoint: EndpointAddress,
    setup: SetupPacket,
) -> RequestStatus {
    let descriptor_type = setup.value_high();
    let descriptor_index = setup.value_low();

    let descriptor: Option<&'static [u8]> = match descriptor_type {
        t if t == DescriptorType::Device as u8 => Some(device.descriptors.device.as_bytes()),

        t if t == DescriptorType::Configuration as u8 => {
            // The wire index is 0-based but configurations are keyed by
            // their 1-based value, hence the +1. An index of 255 wraps to
            // value 0, which resolves to nothing and stalls.
            device
                .find_configuration_descriptor(descriptor_index.wrapping_add(1))
                .map(|configuration| configuration.as_bytes())
        }

        t if t == DescriptorType::DeviceQualifier as u8 => device
            .descriptors
            .device_qualifier
            .map(|qualifier| qualifier.as_bytes()),

        t if t == DescriptorType::OtherSpeedConfiguration as u8 => device
            .find_other_speed_configuration_descriptor(descriptor_index)
            .map(|configuration| configuration.as_bytes()),

        t if t == DescriptorType::String as u8 => {
            device.descriptors.strings.lookup(descriptor_index)
        }

        // INTERFACE and ENDPOINT descriptors are only served as part of a
        // configuration.
        _ => None,
    };

    send_descriptor(device, endpoint, setup, descriptor)
}

fn set_address(
    device: &mut UsbDevice,
    endpoint: EndpointAddress,
    setup: SetupPacket,
) -> RequestStatus {
    // The status stage still runs at address 0, so the hardware latches the
    // new address only once that stage completes.
    device.set_address_deferred(setup.value_low());

    let in_endpoint = EndpointAddress::new(endpoint.number(), Direction::In);
    match device.transfer_schedule_ack(in_endpoint) {
        Ok(()) => RequestStatus::Ok,
        Err(_) => RequestStatus::Stall,
    }
}

fn set_configuration(
    device: &mut UsbDevice,
    endpoint: EndpointAddress,
    setup: SetupPacket,
) -> RequestStatus {
    if device.set_configuration(setup.value_low()).is_err() {
        return RequestStatus::Stall;
    }

    let in_endpoint = EndpointAddress::new(endpoint.number(), Direction::In);
    match device.transfer_schedule_ack(in_endpoint) {
        Ok(()) => RequestStatus::Ok,
        Err(_) => RequestStatus::Stall,
    }
}

fn get_configuration(
    device: &mut UsbDevice,
    endpoint: EndpointAddress,
    setup: SetupPacket,
) -> RequestStatus {
    if setup.length != 1 {
        return RequestStatus::Stall;
    }

    device.control_reply[0] = device
        .active_configuration()
        .map_or(0, |configuration| configuration.value());

    let reply = device.control_reply.as_ptr();
    send_reply(device, endpoint, reply, 1)
}

fn get_status(
    device: &mut UsbDevice,
    endpoint: EndpointAddress,
    setup: SetupPacket,
) -> RequestStatus {
    if setup.length as usize != device.control_reply.len() {
        return RequestStatus::Stall;
    }

    // Self-powered and remote-wakeup reporting both read as zero.
    device.control_reply = [0, 0];

    let reply = device.control_reply.as_ptr();
    send_reply(device, endpoint, reply, 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_length_truncates_to_wlength() {
        let device_descriptor = [18u8, DescriptorType::Device as u8, 0, 2, 0, 0, 0, 64];
        assert_eq!(descriptor_reply_length(&device_descriptor, 18), 18);
        assert_eq!(descriptor_reply_length(&device_descriptor, 8), 8);
        // A generous wLength never pads the reply.
        assert_eq!(descriptor_reply_length(&device_descriptor, 0xFF), 18);
    }

    #[test]
    fn reply_length_uses_total_length_for_configurations() {
        // length = 9, total_length = 32: subordinates ride along.
        let configuration = [9u8, DescriptorType::Configuration as u8, 32, 0, 1, 1, 0, 0x80];
        assert_eq!(descriptor_reply_length(&configuration, 0xFFFF), 32);
        assert_eq!(descriptor_reply_length(&configuration, 9), 9);
    }

    #[test]
    fn reply_length_for_language_string() {
        // GET_DESCRIPTOR(STRING, 0) with wLength 255 sends min(4, 255).
        let language = crate::descriptor::LANGUAGE_ENGLISH_US;
        assert_eq!(descriptor_reply_length(&language, 255), 4);
    }

    #[test]
    fn spec_request_bytes_decode_to_the_right_handlers() {
        // The literal byte sequences of the enumeration dance, as decoded by
        // the dispatcher before a handler runs.
        let set_address =
            SetupPacket::from_bytes([0x00, 0x05, 0x2A, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(
            StandardRequest::from_request(set_address.request),
            Some(StandardRequest::SetAddress)
        );
        assert_eq!(set_address.value_low(), 0x2A);

        let get_device =
            SetupPacket::from_bytes([0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
        assert_eq!(
            StandardRequest::from_request(get_device.request),
            Some(StandardRequest::GetDescriptor)
        );
        assert_eq!(get_device.value_high(), DescriptorType::Device as u8);
        assert_eq!({ get_device.length }, 18);

        let get_unknown =
            SetupPacket::from_bytes([0x80, 0x06, 0x00, 0x42, 0x00, 0x00, 0x40, 0x00]);
        assert_eq!(get_unknown.value_high(), 0x42);
        // 0x42 is no descriptor type; the handler resolves nothing and stalls.

        let get_configuration =
            SetupPacket::from_bytes([0x80, 0x08, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(
            StandardRequest::from_request(get_configuration.request),
            Some(StandardRequest::GetConfiguration)
        );
        assert_eq!({ get_configuration.length }, 1);
    }
}
