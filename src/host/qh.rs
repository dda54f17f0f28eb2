//! Host-mode DMA records: queue heads and transfer descriptors per EHCI
//! sections 3.5 and 3.6

use crate::dma::{token, LinkCell, LinkWord};
use crate::Speed;
use core::mem::offset_of;
use core::sync::atomic::{AtomicU32, Ordering};

/// Endpoint characteristics field bits (EHCI section 3.6, DWord 2)
pub mod endpoint_chars {
    pub const DEVICE_ADDRESS_SHIFT: u32 = 0;
    pub const DEVICE_ADDRESS_MASK: u32 = 0x7F;

    pub const INACTIVE_ON_NEXT: u32 = 1 << 7;

    pub const ENDPOINT_NUMBER_SHIFT: u32 = 8;
    pub const ENDPOINT_NUMBER_MASK: u32 = 0xF;

    pub const ENDPOINT_SPEED_SHIFT: u32 = 12;
    pub const ENDPOINT_SPEED_MASK: u32 = 0x3;

    /// Take the data toggle from each qTD instead of tracking it in the
    /// endpoint
    pub const DATA_TOGGLE_CONTROL: u32 = 1 << 14;
    /// Head-of-reclamation-list marker for the async ring's sentinel
    pub const HEAD_OF_LIST: u32 = 1 << 15;

    pub const MAX_PACKET_LENGTH_SHIFT: u32 = 16;
    pub const MAX_PACKET_LENGTH_MASK: u32 = 0x7FF;

    /// Control-endpoint marker; only set for non-high-speed control
    /// endpoints (high-speed control is signalled per-qTD via the PID)
    pub const CONTROL_ENDPOINT: u32 = 1 << 27;

    pub const NAK_COUNT_RELOAD_SHIFT: u32 = 28;
    pub const NAK_COUNT_RELOAD_MASK: u32 = 0xF;
}

/// Endpoint capabilities field bits (EHCI section 3.6, DWord 3)
pub mod endpoint_caps {
    pub const INTERRUPT_SCHEDULE_MASK_SHIFT: u32 = 0;
    pub const SPLIT_COMPLETION_MASK_SHIFT: u32 = 8;

    pub const HUB_ADDRESS_SHIFT: u32 = 16;
    pub const HUB_ADDRESS_MASK: u32 = 0x7F;

    pub const PORT_NUMBER_SHIFT: u32 = 23;
    pub const PORT_NUMBER_MASK: u32 = 0x7F;

    pub const MULT_SHIFT: u32 = 30;
    pub const MULT_MASK: u32 = 0x3;
}

/// Queue transfer descriptor (qTD) working area
///
/// Also serves as the queue head's overlay, which the controller uses as
/// scratch while it executes the current qTD.
#[repr(C)]
pub struct Qtd {
    /// Next qTD (terminate bit in bit 0)
    pub next: LinkCell,
    /// Alternate next qTD, followed on a short packet
    pub alt_next: LinkCell,
    /// Status, PID, byte count, toggle
    pub token: AtomicU32,
    /// Buffer pointer pages (4 KiB each)
    pub buffer_pages: [AtomicU32; 5],
}

impl Qtd {
    /// Create an inactive descriptor
    pub const fn new() -> Self {
        Self {
            next: LinkCell::terminated(),
            alt_next: LinkCell::terminated(),
            token: AtomicU32::new(0),
            buffer_pages: [
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
            ],
        }
    }

    /// Reset every field to the inactive state
    pub fn clear(&self) {
        self.next.set(LinkWord::TERMINATE);
        self.alt_next.set(LinkWord::TERMINATE);
        self.token.store(0, Ordering::Release);
        for page in &self.buffer_pages {
            page.store(0, Ordering::Release);
        }
    }

    /// Whether the hardware still owns this descriptor
    pub fn is_active(&self) -> bool {
        self.token.load(Ordering::Acquire) & token::STATUS_ACTIVE != 0
    }
}

const _: () = assert!(core::mem::size_of::<Qtd>() == 32);

/// Host queue head (EHCI section 3.6)
///
/// The horizontal link doubles as the freelist link while the queue head is
/// pooled; its terminate bit is set exactly when the queue head is not a
/// member of a live ring.
#[repr(C, align(64))]
pub struct HostQueueHead {
    /// Horizontal link: next queue head in the asynchronous ring
    pub horizontal: LinkCell,
    /// Endpoint characteristics
    pub endpoint_chars: AtomicU32,
    /// Endpoint capabilities (split transactions, multiplier)
    pub endpoint_caps: AtomicU32,
    /// Current qTD (hardware scratch)
    pub current_qtd: LinkCell,
    /// Transfer overlay
    pub overlay: Qtd,
}

impl HostQueueHead {
    /// Create an unlinked queue head
    pub const fn new() -> Self {
        Self {
            horizontal: LinkCell::terminated(),
            endpoint_chars: AtomicU32::new(0),
            endpoint_caps: AtomicU32::new(0),
            current_qtd: LinkCell::new(LinkWord::from_raw(0)),
            overlay: Qtd::new(),
        }
    }

    /// Populate the endpoint parameters for a downstream endpoint
    ///
    /// `handle_data_toggle_in_hw` selects whether the endpoint tracks the
    /// data toggle itself; when false the toggle comes from each scheduled
    /// qTD, which lets callers force sequence-breaking toggles.
    pub fn init_endpoint(
        &self,
        device_address: u8,
        endpoint_number: u8,
        speed: Speed,
        is_control_endpoint: bool,
        handle_data_toggle_in_hw: bool,
        max_packet_size: u16,
    ) {
        let mut chars = 0u32;
        chars |= (device_address as u32 & endpoint_chars::DEVICE_ADDRESS_MASK)
            << endpoint_chars::DEVICE_ADDRESS_SHIFT;
        chars |= (endpoint_number as u32 & endpoint_chars::ENDPOINT_NUMBER_MASK)
            << endpoint_chars::ENDPOINT_NUMBER_SHIFT;
        chars |= speed.queue_head_encoding() << endpoint_chars::ENDPOINT_SPEED_SHIFT;
        chars |= (max_packet_size as u32 & endpoint_chars::MAX_PACKET_LENGTH_MASK)
            << endpoint_chars::MAX_PACKET_LENGTH_SHIFT;

        if !handle_data_toggle_in_hw {
            chars |= endpoint_chars::DATA_TOGGLE_CONTROL;
        }

        if is_control_endpoint && !matches!(speed, Speed::High) {
            chars |= endpoint_chars::CONTROL_ENDPOINT;
        }

        self.endpoint_chars.store(chars, Ordering::Release);

        // No split-transaction scheduling, hub routing or high-bandwidth
        // multiplier yet.
        self.endpoint_caps.store(0, Ordering::Release);

        self.overlay.next.set(LinkWord::TERMINATE);
        self.overlay.alt_next.set(LinkWord::TERMINATE);
        self.overlay
            .token
            .fetch_and(!token::STATUS_PING_STATE, Ordering::AcqRel);
    }

    /// Mark this queue head as the head of the reclamation list
    ///
    /// Exactly one queue head in the asynchronous ring carries this flag:
    /// the sentinel.
    pub fn set_head_of_list(&self) {
        self.endpoint_chars
            .fetch_or(endpoint_chars::HEAD_OF_LIST, Ordering::AcqRel);
    }
}

const _: () = assert!(core::mem::size_of::<HostQueueHead>() == 64);
const _: () = assert!(core::mem::align_of::<HostQueueHead>() == 64);
const _: () = assert!(offset_of!(HostQueueHead, overlay) == 16);

/// Completion callback for a host transfer:
/// `(user_data, bytes_transferred, halted, transaction_error)`
pub type CompletionCallback =
    fn(user_data: usize, bytes_transferred: u32, halted: bool, transaction_error: bool);

/// A pooled host transfer: freelist/pending link, the hardware qTD, and
/// completion bookkeeping
///
/// The leading link cell is on the pending list or the freelist, never both;
/// the hardware only ever follows the embedded qTD.
#[repr(C, align(64))]
pub struct HostTransfer {
    /// Freelist / pending-list link
    pub(crate) horizontal: LinkCell,
    _reserved: [u32; 7],
    /// The hardware transfer descriptor
    pub(crate) td: Qtd,
    pub(crate) maximum_length: u32,
    pub(crate) completion: Option<CompletionCallback>,
    pub(crate) user_data: usize,
}

impl HostTransfer {
    /// Create an idle transfer
    pub const fn new() -> Self {
        Self {
            horizontal: LinkCell::terminated(),
            _reserved: [0; 7],
            td: Qtd::new(),
            maximum_length: 0,
            completion: None,
            user_data: 0,
        }
    }

    /// The embedded hardware descriptor
    pub fn descriptor(&self) -> &Qtd {
        &self.td
    }
}

// The qTD must sit at a 32-byte boundary for the hardware to chain into it.
const _: () = assert!(offset_of!(HostTransfer, horizontal) == 0);
const _: () = assert!(offset_of!(HostTransfer, td) == 32);
const _: () = assert!(core::mem::align_of::<HostTransfer>() == 64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_endpoint_encodes_characteristics() {
        let qh = HostQueueHead::new();
        qh.init_endpoint(0x05, 0x1, Speed::High, false, false, 512);

        let chars = qh.endpoint_chars.load(Ordering::Relaxed);
        assert_eq!(chars & endpoint_chars::DEVICE_ADDRESS_MASK, 0x05);
        assert_eq!(
            (chars >> endpoint_chars::ENDPOINT_NUMBER_SHIFT)
                & endpoint_chars::ENDPOINT_NUMBER_MASK,
            0x1
        );
        assert_eq!(
            (chars >> endpoint_chars::ENDPOINT_SPEED_SHIFT) & endpoint_chars::ENDPOINT_SPEED_MASK,
            2
        );
        assert_eq!(
            (chars >> endpoint_chars::MAX_PACKET_LENGTH_SHIFT)
                & endpoint_chars::MAX_PACKET_LENGTH_MASK,
            512
        );
        // Caller-controlled data toggle.
        assert!(chars & endpoint_chars::DATA_TOGGLE_CONTROL != 0);
        assert!(qh.overlay.next.get().is_terminate());
        assert!(qh.overlay.alt_next.get().is_terminate());
    }

    #[test]
    fn control_endpoint_flag_only_below_high_speed() {
        let qh = HostQueueHead::new();

        qh.init_endpoint(1, 0, Speed::High, true, true, 64);
        assert_eq!(
            qh.endpoint_chars.load(Ordering::Relaxed) & endpoint_chars::CONTROL_ENDPOINT,
            0
        );

        qh.init_endpoint(1, 0, Speed::Full, true, true, 64);
        assert_ne!(
            qh.endpoint_chars.load(Ordering::Relaxed) & endpoint_chars::CONTROL_ENDPOINT,
            0
        );

        // Hardware-managed toggle clears the toggle-control bit.
        assert_eq!(
            qh.endpoint_chars.load(Ordering::Relaxed) & endpoint_chars::DATA_TOGGLE_CONTROL,
            0
        );
    }

    #[test]
    fn speed_encodings_match_ehci() {
        assert_eq!(Speed::Full.queue_head_encoding(), 0);
        assert_eq!(Speed::Low.queue_head_encoding(), 1);
        assert_eq!(Speed::High.queue_head_encoding(), 2);
    }
}
