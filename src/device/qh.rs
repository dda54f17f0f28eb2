//! Device-mode DMA records: dQH and dTD
//!
//! The device controller uses the simplified-EHCI layout from UM10503 section
//! 23.9: one queue head per endpoint direction in a 2048-byte-aligned list,
//! each with an embedded transfer overlay and an 8-byte setup capture area.

use crate::descriptor::{EndpointAddress, SetupPacket, TransferType};
use crate::dma::{token, LinkCell, LinkWord};
use crate::registers::ENDPOINT_COUNT;
use core::sync::atomic::{AtomicU32, Ordering};

/// Number of dQH entries: one OUT and one IN per endpoint pair
pub const QUEUE_HEAD_COUNT: usize = ENDPOINT_COUNT * 2;

/// dQH capabilities field bits
pub mod capabilities {
    /// High-bandwidth multiplier - bits [31:30]
    pub const MULT_SHIFT: u32 = 30;
    /// Zero-length termination select (set = automatic ZLP disabled)
    pub const ZLT_DISABLE: u32 = 1 << 29;
    /// Maximum packet length - bits [26:16]
    pub const MAX_PACKET_SHIFT: u32 = 16;
    pub const MAX_PACKET_MASK: u32 = 0x7FF;
    /// Interrupt on setup
    pub const IOS: u32 = 1 << 15;
}

/// Device transfer descriptor (dTD)
///
/// UM10503 section 23.9.2. The controller requires 32-byte alignment; the
/// stricter 64-byte alignment keeps each descriptor in its own cache line.
#[repr(C, align(64))]
pub struct TransferDescriptor {
    /// Link to the next dTD (terminate bit in bit 0)
    pub next: LinkCell,
    /// Status, IOC and byte count
    pub token: AtomicU32,
    /// Buffer pointer pages (4 KiB each)
    pub buffer_pages: [AtomicU32; 5],
    _reserved: u32,
}

impl TransferDescriptor {
    /// Create an inactive descriptor
    pub const fn new() -> Self {
        Self {
            next: LinkCell::terminated(),
            token: AtomicU32::new(0),
            buffer_pages: [
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
            ],
            _reserved: 0,
        }
    }

    /// Arm the descriptor for a transfer of `total_bytes` from/to `data`
    ///
    /// # Safety
    ///
    /// `data` must point to a DMA-visible buffer of at least `total_bytes`
    /// bytes which stays valid until the transfer completes or is flushed.
    pub unsafe fn prepare(&self, data: *const u8, total_bytes: u32) {
        self.next.set(LinkWord::TERMINATE);
        crate::dma::fill_buffer_pages(&self.buffer_pages, data);
        self.token.store(
            token::STATUS_ACTIVE | token::IOC | token::encode_total_bytes(total_bytes),
            Ordering::Release,
        );
    }

    /// Whether the hardware still owns this descriptor
    pub fn is_active(&self) -> bool {
        self.token.load(Ordering::Acquire) & token::STATUS_ACTIVE != 0
    }

    /// Whether the descriptor completed with a halt condition
    pub fn is_halted(&self) -> bool {
        self.token.load(Ordering::Acquire) & token::STATUS_HALTED != 0
    }

    /// Bytes the controller did not transfer
    pub fn remaining_bytes(&self) -> u32 {
        token::total_bytes(self.token.load(Ordering::Acquire))
    }
}

const _: () = assert!(core::mem::size_of::<TransferDescriptor>() == 64);
const _: () = assert!(core::mem::align_of::<TransferDescriptor>() == 64);

/// Device queue head (dQH)
///
/// UM10503 section 23.9.1. The first four words plus the buffer pages mirror
/// the dTD layout and serve as the controller's working overlay; the word
/// after the buffer pages is ignored by hardware and carries the logical
/// endpoint identity for software.
#[repr(C, align(64))]
pub struct DeviceQueueHead {
    /// Endpoint capabilities: mult, ZLT, max packet length, IOS
    pub capabilities: AtomicU32,
    /// Current dTD (hardware scratch)
    pub current_dtd: LinkCell,
    /// Next dTD to execute
    pub next_dtd: LinkCell,
    /// Overlay token
    pub token: AtomicU32,
    /// Overlay buffer pages
    pub buffer_pages: [AtomicU32; 5],
    endpoint_info: AtomicU32,
    setup: [AtomicU32; 2],
    _reserved: [u32; 4],
}

impl DeviceQueueHead {
    /// Create a quiesced queue head
    pub const fn new() -> Self {
        Self {
            capabilities: AtomicU32::new(0),
            current_dtd: LinkCell::new(LinkWord::from_raw(0)),
            next_dtd: LinkCell::terminated(),
            token: AtomicU32::new(0),
            buffer_pages: [
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
            ],
            endpoint_info: AtomicU32::new(0),
            setup: [AtomicU32::new(0), AtomicU32::new(0)],
            _reserved: [0; 4],
        }
    }

    /// Configure the queue head for an endpoint
    ///
    /// Control endpoints get interrupt-on-setup; other types get automatic
    /// zero-length termination disabled, per UM10503 section 23.6.24.
    pub fn configure(&self, max_packet_size: u16, transfer_type: TransferType) {
        let is_control = matches!(transfer_type, TransferType::Control);
        let mut caps = ((max_packet_size as u32) & capabilities::MAX_PACKET_MASK)
            << capabilities::MAX_PACKET_SHIFT;
        if is_control {
            caps |= capabilities::IOS;
        } else {
            caps |= capabilities::ZLT_DISABLE;
        }
        self.capabilities.store(caps, Ordering::Release);

        self.current_dtd.set(LinkWord::from_raw(0));
        self.next_dtd.set(LinkWord::TERMINATE);
        self.token.store(0, Ordering::Release);
        for page in &self.buffer_pages {
            page.store(0, Ordering::Release);
        }
    }

    /// Record which logical endpoint this queue head serves
    ///
    /// Stored in a word the hardware never touches.
    pub fn set_endpoint_info(&self, address: EndpointAddress) {
        self.endpoint_info
            .store(address.address() as u32, Ordering::Release);
    }

    /// The logical endpoint recorded by [`set_endpoint_info`]
    ///
    /// [`set_endpoint_info`]: Self::set_endpoint_info
    pub fn endpoint_info(&self) -> EndpointAddress {
        EndpointAddress::from_address(self.endpoint_info.load(Ordering::Acquire) as u8)
    }

    /// Snapshot the 8-byte setup area the controller captured
    pub fn read_setup(&self) -> SetupPacket {
        SetupPacket::from_words(
            self.setup[0].load(Ordering::Acquire),
            self.setup[1].load(Ordering::Acquire),
        )
    }

    /// Register `first` as the next dTD and clear stale overlay status, the
    /// two writes that must precede a PRIME
    pub fn stage_for_prime(&self, first: LinkWord) {
        self.next_dtd.set(first);
        self.token.fetch_and(
            !(token::STATUS_ACTIVE | token::STATUS_HALTED),
            Ordering::AcqRel,
        );
    }

    #[cfg(test)]
    pub(crate) fn write_setup_for_test(&self, packet: SetupPacket) {
        let bytes = packet.to_bytes();
        self.setup[0].store(
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            Ordering::Release,
        );
        self.setup[1].store(
            u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            Ordering::Release,
        );
    }
}

const _: () = assert!(core::mem::size_of::<DeviceQueueHead>() == 64);
const _: () = assert!(core::mem::align_of::<DeviceQueueHead>() == 64);

/// The device endpoint list: `2 × ENDPOINT_COUNT` queue heads ordered
/// `(ep0 out, ep0 in, ep1 out, ep1 in, ...)`
///
/// ENDPOINTLISTADDR requires 2048-byte alignment, which this type guarantees.
#[repr(C, align(2048))]
pub struct QueueHeadTable {
    entries: [DeviceQueueHead; QUEUE_HEAD_COUNT],
}

impl QueueHeadTable {
    /// Create a table of quiesced queue heads
    pub const fn new() -> Self {
        Self {
            entries: [const { DeviceQueueHead::new() }; QUEUE_HEAD_COUNT],
        }
    }

    /// The queue head serving `address`
    pub fn for_endpoint(&self, address: EndpointAddress) -> &DeviceQueueHead {
        &self.entries[address.queue_head_index()]
    }

    /// The queue head at a raw table index
    pub fn at(&self, index: usize) -> &DeviceQueueHead {
        &self.entries[index]
    }

    /// The DMA address to program into ENDPOINTLISTADDR
    pub fn base_address(&self) -> u32 {
        self.entries.as_ptr() as u32
    }
}

impl Default for QueueHeadTable {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = assert!(core::mem::align_of::<QueueHeadTable>() == 2048);
const _: () = assert!(core::mem::size_of::<QueueHeadTable>() == 2048);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Direction;

    #[test]
    fn queue_head_setup_area_round_trips() {
        let qh = DeviceQueueHead::new();
        let setup = SetupPacket::from_bytes([0x00, 0x05, 0x2A, 0x00, 0x00, 0x00, 0x00, 0x00]);
        qh.write_setup_for_test(setup);
        assert_eq!(qh.read_setup(), setup);
    }

    #[test]
    fn configure_distinguishes_control_endpoints() {
        let qh = DeviceQueueHead::new();

        qh.configure(64, TransferType::Control);
        let caps = qh.capabilities.load(Ordering::Relaxed);
        assert_eq!(
            (caps >> capabilities::MAX_PACKET_SHIFT) & capabilities::MAX_PACKET_MASK,
            64
        );
        assert!(caps & capabilities::IOS != 0);
        assert!(caps & capabilities::ZLT_DISABLE == 0);

        qh.configure(512, TransferType::Bulk);
        let caps = qh.capabilities.load(Ordering::Relaxed);
        assert!(caps & capabilities::IOS == 0);
        assert!(caps & capabilities::ZLT_DISABLE != 0);
    }

    #[test]
    fn stage_for_prime_clears_stale_status() {
        let qh = DeviceQueueHead::new();
        qh.token.store(
            token::STATUS_ACTIVE | token::STATUS_HALTED | token::IOC,
            Ordering::Relaxed,
        );
        qh.stage_for_prime(LinkWord::from_raw(0x2000_0000));
        let token_value = qh.token.load(Ordering::Relaxed);
        assert_eq!(token_value & token::STATUS_ACTIVE, 0);
        assert_eq!(token_value & token::STATUS_HALTED, 0);
        assert_eq!(qh.next_dtd.get().address(), 0x2000_0000);
    }

    #[test]
    fn table_indexing_interleaves_directions() {
        let table = QueueHeadTable::new();
        let ep2_in = EndpointAddress::new(2, Direction::In);
        let expected = &table.entries[5] as *const DeviceQueueHead;
        assert_eq!(table.for_endpoint(ep2_in) as *const _, expected);
    }
}
