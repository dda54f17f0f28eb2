//! Shared vocabulary for the controller's DMA-visible data structures
//!
//! EHCI links descriptors with 32-bit words that encode a 32-byte-aligned
//! address, a descriptor type and a terminate bit. The same cell doubles as a
//! software freelist link while a pooled object is not owned by hardware; all
//! reads and writes of such a cell go through [`LinkWord`] / [`LinkCell`] so
//! the dual meaning stays behind one accessor.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

/// Terminate bit: set when the link does not reference another descriptor
pub const TERMINATE: u32 = 1 << 0;

/// Descriptor type field value for a queue head (bits [2:1])
pub const TYPE_QUEUE_HEAD: u32 = 1 << 1;

/// Bits that are not part of the address field
const NON_ADDRESS_BITS: u32 = 0b111;

/// An EHCI link word: `{address[31:5], type[2:1], terminate[0]}`
///
/// Treated as an opaque 32-bit value; the address is only materialized back
/// into a pointer at the DMA boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkWord(u32);

impl LinkWord {
    /// A link that terminates the list
    pub const TERMINATE: LinkWord = LinkWord(TERMINATE);

    /// Construct from a raw 32-bit word
    #[inline(always)]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw 32-bit word
    #[inline(always)]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Link to the object at `target` with no type bits (dTD/qTD chains)
    #[inline(always)]
    pub fn to<T>(target: *const T) -> Self {
        Self(target as u32)
    }

    /// Link to the queue head at `target` (horizontal ring links)
    #[inline(always)]
    pub fn to_queue_head<T>(target: *const T) -> Self {
        Self(target as u32 | TYPE_QUEUE_HEAD)
    }

    /// Whether the terminate bit is set
    #[inline(always)]
    pub const fn is_terminate(self) -> bool {
        self.0 & TERMINATE != 0
    }

    /// The address field with type and terminate bits masked away
    #[inline(always)]
    pub const fn address(self) -> u32 {
        self.0 & !NON_ADDRESS_BITS
    }

    /// Materialize the address as a pointer, or `None` for a terminating or
    /// null link
    #[inline(always)]
    pub fn pointer<T>(self) -> Option<NonNull<T>> {
        if self.is_terminate() {
            return None;
        }
        NonNull::new(self.address() as *mut T)
    }
}

/// A DMA-visible cell holding one [`LinkWord`]
///
/// This is the first word of every pooled object, so the identical cell
/// serves as the hardware horizontal/next pointer when the object is live and
/// as the freelist link when it is not. An object on a freelist always reads
/// back as terminate (or as a link to the next free element), never as a live
/// hardware link.
#[repr(transparent)]
pub struct LinkCell(AtomicU32);

impl LinkCell {
    /// Create a cell holding the given link
    pub const fn new(word: LinkWord) -> Self {
        Self(AtomicU32::new(word.0))
    }

    /// Create a terminated cell
    pub const fn terminated() -> Self {
        Self(AtomicU32::new(TERMINATE))
    }

    /// Load the current link word
    #[inline(always)]
    pub fn get(&self) -> LinkWord {
        LinkWord(self.0.load(Ordering::Acquire))
    }

    /// Store a link word
    #[inline(always)]
    pub fn set(&self, word: LinkWord) {
        self.0.store(word.0, Ordering::Release);
    }
}

/// dTD/qTD token field bit layout
///
/// Device-mode dTDs use the status, IOC and total-bytes fields (with bits
/// [11:10] as the multiplier override); host-mode qTDs additionally carry the
/// PID code, error counter, current page and data toggle.
pub mod token {
    /// Transfer is (still) owned by the hardware
    pub const STATUS_ACTIVE: u32 = 1 << 7;
    /// Serious error or stall halted the endpoint
    pub const STATUS_HALTED: u32 = 1 << 6;
    /// Data buffer under/overrun
    pub const STATUS_BUFFER_ERROR: u32 = 1 << 5;
    /// Babble detected
    pub const STATUS_BABBLE: u32 = 1 << 4;
    /// Transaction error (CRC, timeout, PID check, ...)
    pub const STATUS_TRANSACTION_ERROR: u32 = 1 << 3;
    /// Missed microframe (split transactions)
    pub const STATUS_MISSED_UFRAME: u32 = 1 << 2;
    /// Split transaction state
    pub const STATUS_SPLIT_STATE: u32 = 1 << 1;
    /// Ping state / error (high speed)
    pub const STATUS_PING_STATE: u32 = 1 << 0;

    /// PID code field - bits [9:8] (host qTD only)
    pub const PID_SHIFT: u32 = 8;
    pub const PID_MASK: u32 = 0x3;

    /// Error counter (host) / multiplier override (device) - bits [11:10]
    pub const ERROR_COUNTER_SHIFT: u32 = 10;
    pub const ERROR_COUNTER_MASK: u32 = 0x3;

    /// Current page - bits [14:12]
    pub const CURRENT_PAGE_SHIFT: u32 = 12;
    pub const CURRENT_PAGE_MASK: u32 = 0x7;

    /// Interrupt on complete
    pub const IOC: u32 = 1 << 15;

    /// Total bytes to transfer - bits [30:16]
    pub const TOTAL_BYTES_SHIFT: u32 = 16;
    pub const TOTAL_BYTES_MASK: u32 = 0x7FFF;

    /// Data toggle (host qTD only)
    pub const DATA_TOGGLE: u32 = 1 << 31;

    /// Extract the remaining byte count from a token
    #[inline(always)]
    pub const fn total_bytes(token: u32) -> u32 {
        (token >> TOTAL_BYTES_SHIFT) & TOTAL_BYTES_MASK
    }

    /// Encode a byte count into token position
    #[inline(always)]
    pub const fn encode_total_bytes(bytes: u32) -> u32 {
        (bytes & TOTAL_BYTES_MASK) << TOTAL_BYTES_SHIFT
    }
}

/// USB token PID codes as encoded in a host qTD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PidCode {
    /// OUT token (host to device data)
    Out = 0,
    /// IN token (device to host data)
    In = 1,
    /// SETUP token
    Setup = 2,
}

impl PidCode {
    /// Encode into token field position
    #[inline(always)]
    pub const fn token_bits(self) -> u32 {
        (self as u32) << token::PID_SHIFT
    }

    /// Decode from a qTD token
    pub const fn from_token(token_value: u32) -> Option<Self> {
        match (token_value >> token::PID_SHIFT) & token::PID_MASK {
            0 => Some(Self::Out),
            1 => Some(Self::In),
            2 => Some(Self::Setup),
            _ => None,
        }
    }
}

/// Fill a descriptor's five 4 KiB buffer page pointers for a buffer at `data`
///
/// The first page pointer carries the byte offset; subsequent pointers are
/// page-aligned continuations of the same buffer.
pub fn fill_buffer_pages(pages: &[AtomicU32; 5], data: *const u8) {
    let base = data as u32;
    pages[0].store(base, Ordering::Release);
    for (i, page) in pages.iter().enumerate().skip(1) {
        page.store((base + (i as u32) * 0x1000) & 0xFFFF_F000, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_word_round_trip() {
        let word = LinkWord::to_queue_head(0x2000_0040usize as *const u32);
        assert!(!word.is_terminate());
        assert_eq!(word.address(), 0x2000_0040);
        assert_eq!(word.raw() & TYPE_QUEUE_HEAD, TYPE_QUEUE_HEAD);

        assert!(LinkWord::TERMINATE.is_terminate());
        assert!(LinkWord::TERMINATE.pointer::<u32>().is_none());
    }

    #[test]
    fn token_byte_count_round_trip() {
        let token_value = token::encode_total_bytes(0x123) | token::STATUS_ACTIVE;
        assert_eq!(token::total_bytes(token_value), 0x123);
        assert_eq!(token::total_bytes(token::encode_total_bytes(0)), 0);
    }

    #[test]
    fn pid_code_round_trip() {
        for pid in [PidCode::Out, PidCode::In, PidCode::Setup] {
            assert_eq!(PidCode::from_token(pid.token_bits()), Some(pid));
        }
        assert_eq!(PidCode::from_token(3 << token::PID_SHIFT), None);
    }

    #[test]
    fn buffer_pages_mask_continuations() {
        let pages: [AtomicU32; 5] = Default::default();
        fill_buffer_pages(&pages, 0x2000_0123usize as *const u8);
        assert_eq!(pages[0].load(Ordering::Relaxed), 0x2000_0123);
        assert_eq!(pages[1].load(Ordering::Relaxed), 0x2000_1000);
        assert_eq!(pages[2].load(Ordering::Relaxed), 0x2000_2000);
        assert_eq!(pages[4].load(Ordering::Relaxed), 0x2000_4000);
    }
}
