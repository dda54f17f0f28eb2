//! USB protocol wire formats: setup packets and descriptors
//!
//! Descriptors are byte-exact per USB 2.0 section 9.6. Configuration
//! descriptors are handled as raw byte blobs (the configuration header plus
//! its subordinate interface/endpoint descriptors concatenated in enumeration
//! order), which is exactly the representation the wire and the resolver need.

use crate::error::{Result, UsbError};

/// Transfer direction relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Direction {
    /// Host to device
    Out = 0,
    /// Device to host
    In = 1,
}

/// Endpoint transfer types as encoded in descriptors and ENDPTCTRL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TransferType {
    /// Control transfers (endpoint 0)
    Control = 0,
    /// Isochronous transfers
    Isochronous = 1,
    /// Bulk transfers
    Bulk = 2,
    /// Interrupt transfers
    Interrupt = 3,
}

impl TransferType {
    /// Decode from a descriptor attributes byte
    pub const fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x3 {
            0 => Self::Control,
            1 => Self::Isochronous,
            2 => Self::Bulk,
            _ => Self::Interrupt,
        }
    }
}

/// A USB endpoint address: 4-bit endpoint number plus direction bit 7
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointAddress(u8);

impl EndpointAddress {
    /// Construct from an endpoint number and direction
    pub const fn new(number: u8, direction: Direction) -> Self {
        Self(match direction {
            Direction::In => 0x80 | (number & 0xF),
            Direction::Out => number & 0xF,
        })
    }

    /// Construct from the raw wire address byte
    pub const fn from_address(address: u8) -> Self {
        Self(address)
    }

    /// The raw wire address byte
    pub const fn address(self) -> u8 {
        self.0
    }

    /// The endpoint number without the direction bit
    pub const fn number(self) -> u8 {
        self.0 & 0xF
    }

    /// Whether this addresses the IN (device-to-host) side
    pub const fn is_in(self) -> bool {
        self.0 & 0x80 != 0
    }

    /// The paired endpoint in the opposite direction
    pub const fn opposite(self) -> Self {
        Self(self.0 ^ 0x80)
    }

    /// Index of this endpoint's dQH in the device endpoint list:
    /// `(number * 2) + is_in`
    pub const fn queue_head_index(self) -> usize {
        ((self.number() as usize) * 2) + if self.is_in() { 1 } else { 0 }
    }
}

/// Request type classification from bmRequestType bits [6:5]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestKind {
    /// Chapter 9 standard request
    Standard,
    /// Class-defined request
    Class,
    /// Vendor-defined request
    Vendor,
    /// Reserved type bits
    Reserved,
}

/// Request recipient from bmRequestType bits [4:0]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Recipient {
    /// The device as a whole
    Device,
    /// An interface
    Interface,
    /// An endpoint
    Endpoint,
    /// Another recipient
    Other,
    /// Reserved recipient bits
    Reserved,
}

/// USB setup packet per USB 2.0 section 9.3 (8 bytes on the wire)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    /// Request characteristics: direction, type, recipient
    pub request_type: u8,
    /// Request code
    pub request: u8,
    /// Request-specific value
    pub value: u16,
    /// Request-specific index
    pub index: u16,
    /// Length of the data stage
    pub length: u16,
}

impl SetupPacket {
    /// Decode from the 8 wire bytes
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    /// Decode from the two 32-bit words the controller deposits in a dQH's
    /// setup area
    pub const fn from_words(low: u32, high: u32) -> Self {
        let low = low.to_le_bytes();
        let high = high.to_le_bytes();
        Self::from_bytes([
            low[0], low[1], low[2], low[3], high[0], high[1], high[2], high[3],
        ])
    }

    /// Encode to the 8 wire bytes
    pub const fn to_bytes(self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Data stage direction (bmRequestType bit 7)
    pub const fn direction(self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Request type classification (bmRequestType bits [6:5])
    pub const fn kind(self) -> RequestKind {
        match (self.request_type >> 5) & 0x3 {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }

    /// Request recipient (bmRequestType bits [4:0])
    pub const fn recipient(self) -> Recipient {
        match self.request_type & 0x1F {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }

    /// Low byte of wValue
    pub const fn value_low(self) -> u8 {
        (self.value & 0xFF) as u8
    }

    /// High byte of wValue
    pub const fn value_high(self) -> u8 {
        (self.value >> 8) as u8
    }

    /// Standard GET_DESCRIPTOR request
    pub const fn get_descriptor(
        descriptor_type: u8,
        descriptor_index: u8,
        language_id: u16,
        length: u16,
    ) -> Self {
        Self {
            request_type: 0x80,
            request: StandardRequest::GetDescriptor as u8,
            value: ((descriptor_type as u16) << 8) | (descriptor_index as u16),
            index: language_id,
            length,
        }
    }

    /// Standard SET_ADDRESS request
    pub const fn set_address(address: u8) -> Self {
        Self {
            request_type: 0x00,
            request: StandardRequest::SetAddress as u8,
            value: address as u16,
            index: 0,
            length: 0,
        }
    }

    /// Standard SET_CONFIGURATION request
    pub const fn set_configuration(configuration_value: u8) -> Self {
        Self {
            request_type: 0x00,
            request: StandardRequest::SetConfiguration as u8,
            value: configuration_value as u16,
            index: 0,
            length: 0,
        }
    }
}

const _: () = assert!(core::mem::size_of::<SetupPacket>() == 8);

/// Standard request codes per USB 2.0 section 9.4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
#[repr(u8)]
pub enum StandardRequest {
    GetStatus = 0,
    ClearFeature = 1,
    SetFeature = 3,
    SetAddress = 5,
    GetDescriptor = 6,
    SetDescriptor = 7,
    GetConfiguration = 8,
    SetConfiguration = 9,
    GetInterface = 10,
    SetInterface = 11,
    SynchFrame = 12,
}

impl StandardRequest {
    /// Decode a request code
    pub const fn from_request(request: u8) -> Option<Self> {
        match request {
            0 => Some(Self::GetStatus),
            1 => Some(Self::ClearFeature),
            3 => Some(Self::SetFeature),
            5 => Some(Self::SetAddress),
            6 => Some(Self::GetDescriptor),
            7 => Some(Self::SetDescriptor),
            8 => Some(Self::GetConfiguration),
            9 => Some(Self::SetConfiguration),
            10 => Some(Self::GetInterface),
            11 => Some(Self::SetInterface),
            12 => Some(Self::SynchFrame),
            _ => None,
        }
    }
}

/// Descriptor type codes per USB 2.0 table 9-5
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
#[repr(u8)]
pub enum DescriptorType {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    DeviceQualifier = 6,
    OtherSpeedConfiguration = 7,
    InterfacePower = 8,
}

/// BCD-coded version number (e.g. 0x0200 for USB 2.0)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct BcdVersion(pub u16);

impl BcdVersion {
    /// Construct from major/minor digits
    pub const fn new(major: u8, minor: u8) -> Self {
        Self(((major as u16) << 8) | (minor as u16))
    }
}

/// Device descriptor per USB 2.0 section 9.6.1
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
#[allow(missing_docs)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub usb_version: BcdVersion,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub ep0_max_packet_size: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: BcdVersion,
    pub manufacturer_string_index: u8,
    pub product_string_index: u8,
    pub serial_string_index: u8,
    pub configuration_count: u8,
}

const _: () = assert!(core::mem::size_of::<DeviceDescriptor>() == 18);

/// Device qualifier descriptor per USB 2.0 section 9.6.2
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
#[allow(missing_docs)]
pub struct DeviceQualifierDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub usb_version: BcdVersion,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub ep0_max_packet_size: u8,
    pub configuration_count: u8,
    pub reserved: u8,
}

const _: () = assert!(core::mem::size_of::<DeviceQualifierDescriptor>() == 10);

/// Configuration descriptor header per USB 2.0 section 9.6.3
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
#[allow(missing_docs)]
pub struct ConfigurationDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    /// Length of this descriptor plus all subordinate descriptors
    pub total_length: u16,
    pub interface_count: u8,
    /// Non-zero value identifying this configuration
    pub value: u8,
    pub string_index: u8,
    /// Bit 7 must be set; bit 6 = self powered; bit 5 = remote wakeup
    pub attributes: u8,
    /// Maximum current draw in 2 mA units
    pub max_power: u8,
}

const _: () = assert!(core::mem::size_of::<ConfigurationDescriptor>() == 9);

/// Interface descriptor per USB 2.0 section 9.6.5
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
#[allow(missing_docs)]
pub struct InterfaceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub number: u8,
    pub alternate_setting: u8,
    pub endpoint_count: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub string_index: u8,
}

const _: () = assert!(core::mem::size_of::<InterfaceDescriptor>() == 9);

/// Endpoint descriptor per USB 2.0 section 9.6.6
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
#[allow(missing_docs)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    /// Endpoint number with the direction bit in bit 7
    pub address: u8,
    /// Transfer type in bits [1:0], sync/usage for isochronous endpoints
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

const _: () = assert!(core::mem::size_of::<EndpointDescriptor>() == 7);

impl EndpointDescriptor {
    /// Parse from a raw descriptor
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < core::mem::size_of::<Self>() {
            return Err(UsbError::InvalidDescriptor);
        }
        if bytes[1] != DescriptorType::Endpoint as u8 {
            return Err(UsbError::InvalidDescriptor);
        }
        Ok(unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const Self) })
    }

    /// The endpoint's transfer type
    pub fn transfer_type(&self) -> TransferType {
        TransferType::from_attributes(self.attributes)
    }
}

/// View a packed descriptor struct as its wire bytes
macro_rules! impl_as_bytes {
    ($($t:ty),+ $(,)?) => {
        $(impl $t {
            /// The descriptor's wire representation
            pub fn as_bytes(&self) -> &[u8] {
                unsafe {
                    core::slice::from_raw_parts(
                        self as *const Self as *const u8,
                        core::mem::size_of::<Self>(),
                    )
                }
            }
        })+
    };
}

impl_as_bytes!(
    DeviceDescriptor,
    DeviceQualifierDescriptor,
    ConfigurationDescriptor,
    InterfaceDescriptor,
    EndpointDescriptor,
);

/// A complete configuration: the configuration descriptor immediately
/// followed by its subordinate descriptors, as sent on the wire
#[derive(Debug, Clone, Copy)]
pub struct Configuration {
    bytes: &'static [u8],
}

impl Configuration {
    /// Wrap a configuration blob
    ///
    /// The blob must start with a configuration descriptor header; the
    /// subordinate descriptors follow within `total_length` bytes.
    pub const fn new(bytes: &'static [u8]) -> Self {
        Self { bytes }
    }

    /// The configuration's identifying value
    pub fn value(&self) -> u8 {
        self.bytes[5]
    }

    /// Total length of the configuration plus subordinates
    pub fn total_length(&self) -> u16 {
        u16::from_le_bytes([self.bytes[2], self.bytes[3]])
    }

    /// The full blob
    pub fn as_bytes(&self) -> &'static [u8] {
        self.bytes
    }

    /// Iterate the configuration's descriptors (including its own header),
    /// bounded by `total_length`
    pub fn descriptors(&self) -> DescriptorIter<'static> {
        let bound = (self.total_length() as usize).min(self.bytes.len());
        DescriptorIter {
            remaining: &self.bytes[..bound],
        }
    }

    /// Locate the endpoint descriptor for `address`, if this configuration
    /// defines one
    pub fn endpoint_descriptor(&self, address: EndpointAddress) -> Option<EndpointDescriptor> {
        self.descriptors()
            .find(|raw| {
                raw.len() >= 3
                    && raw[1] == DescriptorType::Endpoint as u8
                    && raw[2] == address.address()
            })
            .and_then(|raw| EndpointDescriptor::from_bytes(raw).ok())
    }
}

/// Iterator over length-prefixed descriptors in a byte blob
pub struct DescriptorIter<'a> {
    remaining: &'a [u8],
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.remaining.len() < 2 {
            return None;
        }
        let length = self.remaining[0] as usize;
        if length < 2 || length > self.remaining.len() {
            // A zero or overlong length field would never advance; treat it
            // as the end of the subordinate list.
            return None;
        }
        let (descriptor, rest) = self.remaining.split_at(length);
        self.remaining = rest;
        Some(descriptor)
    }
}

/// One entry in a device's sparse string-descriptor table
#[derive(Debug, Clone, Copy)]
pub struct StringEntry {
    /// The string index as referenced by other descriptors
    pub index: u8,
    /// The string descriptor bytes (length, type, UTF-16LE body)
    pub descriptor: &'static [u8],
}

/// Sparse table of string descriptors
///
/// Index 0 conventionally carries the supported-languages descriptor.
#[derive(Debug, Clone, Copy)]
pub struct StringTable {
    entries: &'static [StringEntry],
}

impl StringTable {
    /// Wrap a table of entries
    pub const fn new(entries: &'static [StringEntry]) -> Self {
        Self { entries }
    }

    /// An empty table
    pub const fn empty() -> Self {
        Self { entries: &[] }
    }

    /// Find the descriptor registered under `index`
    pub fn lookup(&self, index: u8) -> Option<&'static [u8]> {
        self.entries
            .iter()
            .find(|entry| entry.index == index)
            .map(|entry| entry.descriptor)
    }
}

/// US English language-list string descriptor: `04 03 09 04`
pub const LANGUAGE_ENGLISH_US: [u8; 4] = [0x04, DescriptorType::String as u8, 0x09, 0x04];

/// Longest string (in UTF-16 code units) a built descriptor can carry
pub const MAX_STRING_LENGTH: usize = 64;

/// Work buffer for building a string descriptor from text at run time
/// (serial numbers read from the part, for instance)
pub struct StringDescriptorBuffer {
    bytes: heapless::Vec<u8, { 2 + MAX_STRING_LENGTH * 2 }>,
}

impl StringDescriptorBuffer {
    /// Encode `text` as a UTF-16LE string descriptor, truncating to
    /// [`MAX_STRING_LENGTH`] code units
    pub fn from_str(text: &str) -> Self {
        let mut bytes: heapless::Vec<u8, { 2 + MAX_STRING_LENGTH * 2 }> = heapless::Vec::new();
        // Reserve the header; patched once the body length is known.
        let _ = bytes.push(0);
        let _ = bytes.push(DescriptorType::String as u8);
        for unit in text.encode_utf16().take(MAX_STRING_LENGTH) {
            let le = unit.to_le_bytes();
            if bytes.push(le[0]).is_err() || bytes.push(le[1]).is_err() {
                break;
            }
        }
        bytes[0] = bytes.len() as u8;
        Self { bytes }
    }

    /// The descriptor's wire bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;

    #[test]
    fn setup_packet_round_trips_bit_for_bit() {
        let wire = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        let setup = SetupPacket::from_bytes(wire);
        assert_eq!(setup.to_bytes(), wire);
        assert_eq!(setup.direction(), Direction::In);
        assert_eq!(setup.kind(), RequestKind::Standard);
        assert_eq!(setup.recipient(), Recipient::Device);
        assert_eq!({ setup.value }, 0x0100);
        assert_eq!({ setup.length }, 18);

        // Every request-type byte and field combination must survive the
        // words-based path the hardware uses as well.
        let vendor = SetupPacket::from_bytes([0xC1, 0x42, 0x34, 0x12, 0x78, 0x56, 0xCD, 0xAB]);
        let words = {
            let b = vendor.to_bytes();
            (
                u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
                u32::from_le_bytes([b[4], b[5], b[6], b[7]]),
            )
        };
        assert_eq!(SetupPacket::from_words(words.0, words.1), vendor);
        assert_eq!(vendor.kind(), RequestKind::Vendor);
    }

    #[test]
    fn setup_builders_match_wire_encoding() {
        assert_eq!(
            SetupPacket::set_address(0x2A).to_bytes(),
            [0x00, 0x05, 0x2A, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            SetupPacket::get_descriptor(0x01, 0, 0, 18).to_bytes(),
            [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]
        );
        assert_eq!(
            SetupPacket::set_configuration(1).to_bytes(),
            [0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn endpoint_address_math() {
        let ep1_in = EndpointAddress::new(1, Direction::In);
        assert_eq!(ep1_in.address(), 0x81);
        assert_eq!(ep1_in.number(), 1);
        assert!(ep1_in.is_in());
        assert_eq!(ep1_in.queue_head_index(), 3);
        assert_eq!(ep1_in.opposite().address(), 0x01);

        let ep0_out = EndpointAddress::new(0, Direction::Out);
        assert_eq!(ep0_out.queue_head_index(), 0);
        assert_eq!(ep0_out.opposite().queue_head_index(), 1);
    }

    fn example_configuration() -> ([u8; 32], u16) {
        let mut bytes = [0u8; 32];
        let config = ConfigurationDescriptor {
            length: 9,
            descriptor_type: DescriptorType::Configuration as u8,
            total_length: 32,
            interface_count: 1,
            value: 1,
            string_index: 0,
            attributes: 0x80,
            max_power: 250,
        };
        let interface = InterfaceDescriptor {
            length: 9,
            descriptor_type: DescriptorType::Interface as u8,
            number: 0,
            alternate_setting: 0,
            endpoint_count: 2,
            interface_class: 0xFF,
            interface_subclass: 0xFF,
            interface_protocol: 0xFF,
            string_index: 0,
        };
        let ep_in = EndpointDescriptor {
            length: 7,
            descriptor_type: DescriptorType::Endpoint as u8,
            address: 0x81,
            attributes: TransferType::Bulk as u8,
            max_packet_size: 512,
            interval: 0,
        };
        let ep_out = EndpointDescriptor {
            length: 7,
            descriptor_type: DescriptorType::Endpoint as u8,
            address: 0x01,
            attributes: TransferType::Bulk as u8,
            max_packet_size: 512,
            interval: 0,
        };
        bytes[..9].copy_from_slice(config.as_bytes());
        bytes[9..18].copy_from_slice(interface.as_bytes());
        bytes[18..25].copy_from_slice(ep_in.as_bytes());
        bytes[25..32].copy_from_slice(ep_out.as_bytes());
        (bytes, 32)
    }

    #[test]
    fn configuration_walk_finds_endpoints() {
        let (bytes, total) = example_configuration();
        let blob: &'static [u8] = Box::leak(Box::new(bytes));
        let config = Configuration::new(blob);

        assert_eq!(config.value(), 1);
        assert_eq!(config.total_length(), total);
        assert_eq!(config.descriptors().count(), 4);

        let ep = config
            .endpoint_descriptor(EndpointAddress::from_address(0x81))
            .unwrap();
        assert_eq!({ ep.max_packet_size }, 512);
        assert_eq!(ep.transfer_type(), TransferType::Bulk);

        assert!(config
            .endpoint_descriptor(EndpointAddress::from_address(0x82))
            .is_none());
    }

    #[test]
    fn string_table_lookup_is_sparse() {
        static LANGUAGE: [u8; 4] = LANGUAGE_ENGLISH_US;
        static PRODUCT: [u8; 6] = [6, 3, b'a', 0, b'b', 0];
        static ENTRIES: [StringEntry; 2] = [
            StringEntry {
                index: 0,
                descriptor: &LANGUAGE,
            },
            StringEntry {
                index: 2,
                descriptor: &PRODUCT,
            },
        ];
        let table = StringTable::new(&ENTRIES);
        assert_eq!(table.lookup(0), Some(&LANGUAGE[..]));
        assert_eq!(table.lookup(2), Some(&PRODUCT[..]));
        assert_eq!(table.lookup(1), None);
    }

    #[test]
    fn string_descriptor_builder_encodes_utf16le() {
        let descriptor = StringDescriptorBuffer::from_str("GF");
        assert_eq!(descriptor.as_bytes(), &[6, 3, b'G', 0, b'F', 0]);

        let long_bytes = [b'x'; 100];
        let long = core::str::from_utf8(&long_bytes).unwrap();
        let truncated = StringDescriptorBuffer::from_str(long);
        assert_eq!(truncated.as_bytes().len(), 2 + MAX_STRING_LENGTH * 2);
        assert_eq!(truncated.as_bytes()[0], (2 + MAX_STRING_LENGTH * 2) as u8);
    }
}
