//! Structural verification of the driver's DMA-visible types and wire
//! formats, checked through the public API
//!
//! The controller dictates exact sizes and alignments for everything it
//! DMAs; these tests pin them so a refactor cannot silently break the
//! hardware contract.

use lpc43xx_usb::descriptor::{
    Configuration, ConfigurationDescriptor, DescriptorType, DeviceDescriptor, Direction,
    EndpointAddress, EndpointDescriptor, SetupPacket, TransferType,
};
use lpc43xx_usb::device::qh::{DeviceQueueHead, QueueHeadTable, TransferDescriptor};
use lpc43xx_usb::device::queue::TransferPool;
use lpc43xx_usb::host::pool::HostPools;
use lpc43xx_usb::host::qh::{HostQueueHead, Qtd};
use lpc43xx_usb::Speed;

#[test]
fn device_dma_structure_layout() {
    // dQH and dTD sizes/alignments per UM10503 section 23.9.
    assert_eq!(core::mem::size_of::<DeviceQueueHead>(), 64);
    assert_eq!(core::mem::align_of::<DeviceQueueHead>(), 64);
    assert_eq!(core::mem::size_of::<TransferDescriptor>(), 64);
    assert_eq!(core::mem::align_of::<TransferDescriptor>(), 64);

    // The endpoint list must be 2048-byte aligned for ENDPOINTLISTADDR.
    assert_eq!(core::mem::align_of::<QueueHeadTable>(), 2048);
}

#[test]
fn host_dma_structure_layout() {
    assert_eq!(core::mem::size_of::<Qtd>(), 32);
    assert_eq!(core::mem::size_of::<HostQueueHead>(), 64);
    assert_eq!(core::mem::align_of::<HostQueueHead>(), 64);
}

#[test]
fn dma_owned_types_are_constructible() {
    let _table = QueueHeadTable::new();
    let _pool = TransferPool::new();
    let _host_pools = HostPools::new();
    let _qh = HostQueueHead::new();
    let _td = TransferDescriptor::new();
}

#[test]
fn descriptor_wire_sizes() {
    assert_eq!(core::mem::size_of::<SetupPacket>(), 8);
    assert_eq!(core::mem::size_of::<DeviceDescriptor>(), 18);
    assert_eq!(core::mem::size_of::<ConfigurationDescriptor>(), 9);
    assert_eq!(core::mem::size_of::<EndpointDescriptor>(), 7);
}

#[test]
fn setup_packet_wire_round_trip() {
    for wire in [
        [0x00u8, 0x05, 0x2A, 0x00, 0x00, 0x00, 0x00, 0x00],
        [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00],
        [0x80, 0x06, 0x00, 0x03, 0x00, 0x00, 0xFF, 0x00],
        [0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00],
        [0xC1, 0xF3, 0x34, 0x12, 0x78, 0x56, 0xBC, 0x9A],
    ] {
        assert_eq!(SetupPacket::from_bytes(wire).to_bytes(), wire);
    }
}

#[test]
fn queue_head_indexing_matches_endpoint_list_order() {
    // (ep0 out, ep0 in, ep1 out, ep1 in, ...)
    assert_eq!(
        EndpointAddress::new(0, Direction::Out).queue_head_index(),
        0
    );
    assert_eq!(EndpointAddress::new(0, Direction::In).queue_head_index(), 1);
    assert_eq!(
        EndpointAddress::new(5, Direction::Out).queue_head_index(),
        10
    );
    assert_eq!(
        EndpointAddress::new(5, Direction::In).queue_head_index(),
        11
    );
}

#[test]
fn speed_encodings() {
    assert_eq!(Speed::Full.queue_head_encoding(), 0);
    assert_eq!(Speed::Low.queue_head_encoding(), 1);
    assert_eq!(Speed::High.queue_head_encoding(), 2);
    assert_eq!(Speed::Super.queue_head_encoding(), 3);
}

#[test]
fn configuration_blob_walk() {
    static CONFIG: [u8; 25] = [
        // Configuration header: total_length = 25, value = 1.
        9,
        DescriptorType::Configuration as u8,
        25,
        0,
        1,
        1,
        0,
        0x80,
        50,
        // Interface 0 with one endpoint.
        9,
        DescriptorType::Interface as u8,
        0,
        0,
        1,
        0xFF,
        0xFF,
        0xFF,
        0,
        // EP2 IN, bulk, 512 bytes.
        7,
        DescriptorType::Endpoint as u8,
        0x82,
        TransferType::Bulk as u8,
        0x00,
        0x02,
        0,
    ];

    let configuration = Configuration::new(&CONFIG);
    assert_eq!(configuration.value(), 1);
    assert_eq!(configuration.total_length(), 25);
    assert_eq!(configuration.descriptors().count(), 3);

    let endpoint = configuration
        .endpoint_descriptor(EndpointAddress::from_address(0x82))
        .expect("endpoint descriptor present");
    assert_eq!({ endpoint.max_packet_size }, 512);
    assert_eq!(endpoint.transfer_type(), TransferType::Bulk);
}
