//! Host-mode controller: the asynchronous transfer queue
//!
//! Downstream endpoints live as queue heads on a circular asynchronous ring
//! whose head is a sentinel owned by the peripheral. Transfers are pooled
//! objects whose qTDs chain onto a queue head's overlay; completions are
//! reaped from interrupt context through a pending-transfer list.

pub mod pool;
pub mod qh;

use crate::dma::{token, LinkCell, LinkWord, PidCode};
use crate::error::{Result, UsbError};
use crate::registers::{PortSc, SpinBudget, UsbRegisters, UsbSts};
use crate::{soc, timing, Controller, Speed};
use core::ptr::NonNull;
use core::sync::atomic::Ordering;
use self::pool::HostPools;
use self::qh::{CompletionCallback, HostQueueHead, HostTransfer, Qtd};

/// Placeholder periodic frame list
///
/// Present so the data layout is ready for a periodic schedule; the schedule
/// itself is never enabled.
pub struct PeriodicList {
    entries: [LinkCell; Self::SIZE],
}

impl PeriodicList {
    /// Number of placeholder frame entries
    pub const SIZE: usize = 8;

    /// Create a list with every entry terminated
    pub const fn new() -> Self {
        Self {
            entries: [const { LinkCell::terminated() }; Self::SIZE],
        }
    }

    /// Whether every entry is still terminated
    pub fn is_idle(&self) -> bool {
        self.entries.iter().all(|entry| entry.get().is_terminate())
    }
}

impl Default for PeriodicList {
    fn default() -> Self {
        Self::new()
    }
}

/// DMA-visible state for a host-mode controller
///
/// Must be placed in static, DMA-visible memory and handed to
/// [`UsbHost::new`].
pub struct HostBuffers {
    /// Sentinel queue head anchoring the asynchronous ring
    pub async_head: HostQueueHead,
    /// Periodic schedule placeholder
    pub periodic_list: PeriodicList,
    /// Object pools
    pub pools: HostPools,
}

impl HostBuffers {
    /// Create the host buffer set
    pub const fn new() -> Self {
        Self {
            async_head: HostQueueHead::new(),
            periodic_list: PeriodicList::new(),
            pools: HostPools::new(),
        }
    }
}

impl Default for HostBuffers {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a configured asynchronous endpoint's queue head
#[derive(Clone, Copy)]
pub struct QhHandle(NonNull<HostQueueHead>);

/// Transfer lifecycle events reported to the observer hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferEvent {
    /// A transfer was scheduled
    Started,
    /// A transfer completed and is about to be reaped
    Completed,
}

/// Observer notified of transfer starts and completions with their PID kind
pub type TransferObserver = fn(event: TransferEvent, pid: PidCode);

/// Host-level event callback
pub type HostCallback = fn(&mut UsbHost);

/// A USB controller operating in host mode
pub struct UsbHost {
    regs: UsbRegisters,
    controller: Controller,
    buffers: &'static mut HostBuffers,
    queue_head_freelist: LinkCell,
    transfer_freelist: LinkCell,
    pending_transfers: LinkCell,
    observer: Option<TransferObserver>,
    port_change: Option<HostCallback>,
}

impl UsbHost {
    /// Create a host-mode driver for `controller`
    ///
    /// Seeds the object pools and constructs the asynchronous ring's
    /// sentinel: a queue head linked to itself, flagged as the reclamation
    /// head, with a halted overlay so the controller never executes it.
    ///
    /// # Safety
    ///
    /// The caller must hold exclusive ownership of the controller, and
    /// `buffers` must live in DMA-visible memory.
    pub unsafe fn new(controller: Controller, buffers: &'static mut HostBuffers) -> Self {
        let queue_head_freelist = pool::seed_queue_heads(&buffers.pools);
        let transfer_freelist = pool::seed_transfers(&buffers.pools);

        let sentinel = &buffers.async_head;
        sentinel
            .horizontal
            .set(LinkWord::to_queue_head(sentinel as *const HostQueueHead));
        sentinel.set_head_of_list();
        sentinel.overlay.next.set(LinkWord::TERMINATE);
        sentinel.overlay.alt_next.set(LinkWord::TERMINATE);
        sentinel
            .overlay
            .token
            .store(token::STATUS_HALTED, Ordering::Release);

        Self {
            regs: unsafe { UsbRegisters::new(controller.register_base()) },
            controller,
            buffers,
            queue_head_freelist,
            transfer_freelist,
            pending_transfers: LinkCell::terminated(),
            observer: None,
            port_change: None,
        }
    }

    /// The controller this host runs on
    pub fn controller(&self) -> Controller {
        self.controller
    }

    /// Register the transfer observer hook
    pub fn set_transfer_observer(&mut self, observer: TransferObserver) {
        self.observer = Some(observer);
    }

    /// Register a callback fired on port change events
    pub fn on_port_change(&mut self, callback: HostCallback) {
        self.port_change = Some(callback);
    }

    fn notify_observer(&self, event: TransferEvent, pid: PidCode) {
        if let Some(observer) = self.observer {
            observer(event, pid);
        }
    }

    /// Reset the block, configure host mode and unmask interrupts
    pub fn init(&mut self) -> Result<()> {
        soc::phy_enable(self.controller);
        self.regs.command_stop();
        self.regs.controller_reset()?;
        self.regs.set_host_mode();

        self.regs.set_zero_interrupt_threshold();
        self.regs
            .set_async_list_address(&self.buffers.async_head as *const HostQueueHead as u32);

        self.regs.set_interrupt_mask(
            UsbSts::USB_INTERRUPT | UsbSts::USB_ERROR | UsbSts::PORT_CHANGE | UsbSts::ASYNC_ADVANCE,
        );
        Ok(())
    }

    /// Reset the controller block through the reset-generation unit
    pub fn peripheral_reset(&mut self) -> Result<()> {
        soc::peripheral_reset(self.controller)
    }

    /// Enable the controller's interrupt and start the controller
    pub fn run(&mut self) {
        unsafe { cortex_m::peripheral::NVIC::unmask(self.controller.interrupt()) };
        self.regs.command_run();
    }

    /// Drive port power on or off
    pub fn set_port_power(&mut self, on: bool) {
        let regs = self.regs.block();
        if on {
            regs.portsc1.set_bits(PortSc::PORT_POWER.bits());
        } else {
            regs.portsc1.clear_bits(PortSc::PORT_POWER.bits());
        }
    }

    /// Whether a device is connected to the port
    pub fn is_port_connected(&self) -> bool {
        self.regs.block().portsc1.read() & PortSc::CURRENT_CONNECT_STATUS.bits() != 0
    }

    /// Reset the downstream port, as required before enumeration
    ///
    /// Asserts the reset for the USB 2.0 minimum hold time, releases it and
    /// waits for the controller to finish.
    pub fn reset_port(&mut self) -> Result<()> {
        let regs = self.regs.block();
        regs.portsc1.set_bits(PortSc::PORT_RESET.bits());
        cortex_m::asm::delay(timing::ms_to_cycles(timing::PORT_RESET_HOLD_MS));
        regs.portsc1.clear_bits(PortSc::PORT_RESET.bits());
        SpinBudget::default()
            .wait_for(|| regs.portsc1.read() & PortSc::PORT_RESET.bits() == 0)
    }

    /// The speed the port negotiated
    pub fn port_speed(&self) -> Speed {
        self.regs.port_speed()
    }

    /// Whether `handle`'s queue head is currently linked into the
    /// asynchronous ring
    pub fn endpoint_in_async_queue(&self, handle: QhHandle) -> bool {
        self.find_ring_predecessor(handle.0.as_ptr()).is_some()
    }

    /// Walk the ring looking for the queue head whose horizontal link points
    /// at `target`
    fn find_ring_predecessor(
        &self,
        target: *const HostQueueHead,
    ) -> Option<*const HostQueueHead> {
        let head = &self.buffers.async_head as *const HostQueueHead;
        let mut cursor = head;

        loop {
            let link = unsafe { &(*cursor).horizontal }.get();

            if link.address() == target as u32 {
                return Some(cursor);
            }

            // A terminated or null link means the ring is broken; stop
            // rather than walk into the weeds.
            if link.is_terminate() || link.address() == 0 {
                return None;
            }

            let next = link.address() as *const HostQueueHead;
            if next == head {
                return None;
            }
            cursor = next;
        }
    }

    /// Configure an endpoint for transfers on the asynchronous queue
    ///
    /// Allocates a queue head unless the caller supplies one to reconfigure.
    /// The asynchronous schedule is paused while the queue head is populated
    /// and, if new, spliced into the ring just after the sentinel.
    #[allow(clippy::too_many_arguments)]
    pub fn set_up_async_endpoint(
        &mut self,
        queue_head: Option<QhHandle>,
        device_address: u8,
        endpoint_number: u8,
        speed: Speed,
        is_control_endpoint: bool,
        handle_data_toggle_in_hw: bool,
        max_packet_size: u16,
    ) -> Result<QhHandle> {
        let handle = match queue_head {
            Some(handle) => handle,
            None => QhHandle(
                unsafe { pool::allocate_queue_head(&self.queue_head_freelist) }
                    .ok_or(UsbError::NoResources)?,
            ),
        };

        // Nothing in the ring may change while the schedule walks it.
        self.regs.disable_async_schedule()?;

        let qh = unsafe { handle.0.as_ref() };
        qh.init_endpoint(
            device_address,
            endpoint_number,
            speed,
            is_control_endpoint,
            handle_data_toggle_in_hw,
            max_packet_size,
        );

        if !self.endpoint_in_async_queue(handle) {
            let sentinel = &self.buffers.async_head;
            qh.horizontal.set(sentinel.horizontal.get());
            sentinel
                .horizontal
                .set(LinkWord::to_queue_head(handle.0.as_ptr()));
        }

        self.regs.enable_async_schedule()?;
        Ok(handle)
    }

    /// Return an unlinked queue head to the pool
    ///
    /// The queue head must not be in the ring; tear the endpoint down first.
    pub fn free_queue_head(&mut self, handle: QhHandle) -> Result<()> {
        if self.endpoint_in_async_queue(handle) {
            return Err(UsbError::InvalidState);
        }
        unsafe { pool::free_queue_head(&self.queue_head_freelist, handle.0) };
        Ok(())
    }

    /// Schedule a transfer on a configured endpoint's queue head
    ///
    /// Fills a pooled qTD (five page pointers, byte count, PID, toggle, IOC)
    /// and, inside a critical section, records it on the pending list and
    /// links it at the end of the queue head's overlay chain. The hardware
    /// executes it as soon as the bus allows.
    ///
    /// # Safety
    ///
    /// `data` must point to a DMA-visible buffer of at least
    /// `maximum_length` bytes, valid (and writable for IN transfers) until
    /// the completion callback runs.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn schedule_transfer(
        &mut self,
        queue_head: QhHandle,
        pid_code: PidCode,
        data_toggle: bool,
        data: *mut u8,
        maximum_length: u32,
        completion: Option<CompletionCallback>,
        user_data: usize,
    ) -> Result<()> {
        let transfer = unsafe { pool::allocate_transfer(&self.transfer_freelist) }
            .ok_or(UsbError::NoResources)?;

        self.notify_observer(TransferEvent::Started, pid_code);

        let transfer_ptr = transfer.as_ptr();
        {
            let td = unsafe { &(*transfer_ptr).td };
            td.next.set(LinkWord::TERMINATE);
            td.alt_next.set(LinkWord::TERMINATE);
            crate::dma::fill_buffer_pages(&td.buffer_pages, data);

            let mut token_value = token::STATUS_ACTIVE
                | token::IOC
                | pid_code.token_bits()
                | token::encode_total_bytes(maximum_length);
            if data_toggle {
                token_value |= token::DATA_TOGGLE;
            }
            td.token.store(token_value, Ordering::Release);
        }

        unsafe {
            (*transfer_ptr).maximum_length = maximum_length;
            (*transfer_ptr).completion = completion;
            (*transfer_ptr).user_data = user_data;
        }

        // The append must be atomic with respect to the reaper: the pending
        // list gains the transfer and the overlay chain gains the qTD as one
        // unit.
        critical_section::with(|_| {
            unsafe { pool::push(&self.pending_transfers, transfer.cast()) };

            let qh = unsafe { queue_head.0.as_ref() };
            let mut tail: &LinkCell = &qh.overlay.next;
            loop {
                let link = tail.get();
                if link.is_terminate() {
                    break;
                }
                let next = link.address() as *const Qtd;
                tail = unsafe { &(*next).next };
            }
            tail.set(LinkWord::to(unsafe {
                &(*transfer_ptr).td as *const Qtd
            }));
        });

        Ok(())
    }

    /// Reap completed transfers from the pending list
    ///
    /// For every transfer whose qTD the hardware has released: report the
    /// outcome through its completion callback, unlink it and return it to
    /// the pool. The next pointer is snapshotted before the node is freed so
    /// the walk can advance over it.
    pub fn handle_transfer_completions(&mut self) {
        let mut previous: *const LinkCell = &self.pending_transfers;
        let mut link = unsafe { (*previous).get() }.pointer::<LinkCell>();

        while let Some(cell) = link {
            let transfer = cell.as_ptr() as *const HostTransfer;
            let td_token = unsafe { &(*transfer).td }.token.load(Ordering::Acquire);

            if td_token & token::STATUS_ACTIVE == 0 {
                if let Some(pid) = PidCode::from_token(td_token) {
                    self.notify_observer(TransferEvent::Completed, pid);
                }

                let (completion, user_data, maximum_length) = unsafe {
                    (
                        (*transfer).completion,
                        (*transfer).user_data,
                        (*transfer).maximum_length,
                    )
                };
                if let Some(callback) = completion {
                    let bytes_transferred = maximum_length - token::total_bytes(td_token);
                    callback(
                        user_data,
                        bytes_transferred,
                        td_token & token::STATUS_HALTED != 0,
                        td_token & token::STATUS_TRANSACTION_ERROR != 0,
                    );
                }

                // Snapshot the next link, unlink, advance, then free.
                let next = unsafe { (*cell.as_ptr()).get() };
                unsafe { (*previous).set(next) };
                previous = cell.as_ptr();
                link = next.pointer::<LinkCell>();

                unsafe {
                    pool::free_transfer(
                        &self.transfer_freelist,
                        NonNull::new_unchecked(transfer.cast_mut()),
                    )
                };
            } else {
                previous = cell.as_ptr();
                link = unsafe { (*cell.as_ptr()).get() }.pointer::<LinkCell>();
            }
        }
    }

    /// Host-mode interrupt handler top half
    pub fn isr(&mut self) {
        let status = self.regs.read_and_clear_status();
        if status.is_empty() {
            return;
        }

        if status.intersects(UsbSts::USB_INTERRUPT | UsbSts::USB_ERROR) {
            self.handle_transfer_completions();
        }

        if status.contains(UsbSts::PORT_CHANGE) {
            if let Some(callback) = self.port_change {
                callback(self);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, AtomicUsize};
    use std::boxed::Box;

    fn test_host() -> UsbHost {
        let buffers = Box::leak(Box::new(HostBuffers::new()));
        unsafe { UsbHost::new(Controller::Usb0, buffers) }
    }

    #[test]
    fn sentinel_rings_to_itself() {
        let host = test_host();
        let sentinel = &host.buffers.async_head;
        let link = sentinel.horizontal.get();
        assert_eq!(link.address(), sentinel as *const HostQueueHead as u32);
        assert!(!link.is_terminate());
        assert!(sentinel.overlay.next.get().is_terminate());
        assert!(host.buffers.periodic_list.is_idle());
    }

    fn splice_after_sentinel(host: &mut UsbHost) -> QhHandle {
        let handle = QhHandle(
            unsafe { pool::allocate_queue_head(&host.queue_head_freelist) }.unwrap(),
        );
        let qh = unsafe { handle.0.as_ref() };
        qh.init_endpoint(5, 1, Speed::High, false, false, 512);
        let sentinel = &host.buffers.async_head;
        qh.horizontal.set(sentinel.horizontal.get());
        sentinel
            .horizontal
            .set(LinkWord::to_queue_head(handle.0.as_ptr()));
        handle
    }

    #[test]
    fn ring_membership_follows_splices() {
        let mut host = test_host();

        let outside = QhHandle(
            unsafe { pool::allocate_queue_head(&host.queue_head_freelist) }.unwrap(),
        );
        assert!(!host.endpoint_in_async_queue(outside));

        let first = splice_after_sentinel(&mut host);
        let second = splice_after_sentinel(&mut host);
        assert!(host.endpoint_in_async_queue(first));
        assert!(host.endpoint_in_async_queue(second));
        assert!(!host.endpoint_in_async_queue(outside));

        // Interior ring nodes never terminate.
        let mut cursor = host.buffers.async_head.horizontal.get();
        for _ in 0..2 {
            assert!(!cursor.is_terminate());
            let qh = cursor.address() as *const HostQueueHead;
            cursor = unsafe { &(*qh).horizontal }.get();
        }
        assert_eq!(
            cursor.address(),
            &host.buffers.async_head as *const HostQueueHead as u32
        );
    }

    // Completion records are keyed by user_data so concurrently running
    // tests never observe each other's callbacks.
    const SLOTS: usize = 3;
    static CALLBACK_BYTES: [AtomicU32; SLOTS] =
        [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)];
    static CALLBACK_COUNT: [AtomicUsize; SLOTS] =
        [AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)];
    static CALLBACK_FLAGS: [AtomicU32; SLOTS] =
        [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)];

    fn record(user_data: usize, bytes: u32, halted: bool, transaction_error: bool) {
        CALLBACK_BYTES[user_data].store(bytes, Ordering::SeqCst);
        CALLBACK_COUNT[user_data].fetch_add(1, Ordering::SeqCst);
        CALLBACK_FLAGS[user_data].store(
            (halted as u32) | ((transaction_error as u32) << 1),
            Ordering::SeqCst,
        );
    }

    #[test]
    fn reaper_reports_and_recycles_completed_transfers() {
        const SLOT: usize = 0;

        let mut host = test_host();
        let transfer =
            unsafe { pool::allocate_transfer(&host.transfer_freelist) }.unwrap();
        let transfer_ptr = transfer.as_ptr();

        unsafe {
            (*transfer_ptr).maximum_length = 1024;
            (*transfer_ptr).completion = Some(record);
            (*transfer_ptr).user_data = SLOT;
        }
        // IN transfer, completed in full: active clear, no residue, no error.
        unsafe { &(*transfer_ptr).td }.token.store(
            PidCode::In.token_bits() | token::encode_total_bytes(0),
            Ordering::SeqCst,
        );
        unsafe { pool::push(&host.pending_transfers, transfer.cast()) };

        host.handle_transfer_completions();

        assert_eq!(CALLBACK_COUNT[SLOT].load(Ordering::SeqCst), 1);
        assert_eq!(CALLBACK_BYTES[SLOT].load(Ordering::SeqCst), 1024);
        assert_eq!(CALLBACK_FLAGS[SLOT].load(Ordering::SeqCst), 0);
        // Pending list is empty again and the transfer is reusable.
        assert!(host.pending_transfers.get().is_terminate());
        let again = unsafe { pool::allocate_transfer(&host.transfer_freelist) }.unwrap();
        assert_eq!(again.as_ptr(), transfer_ptr);
    }

    #[test]
    fn reaper_skips_active_transfers() {
        const SLOT: usize = 1;

        let mut host = test_host();
        let transfer =
            unsafe { pool::allocate_transfer(&host.transfer_freelist) }.unwrap();
        unsafe { &(*transfer.as_ptr()).td }.token.store(
            token::STATUS_ACTIVE | token::encode_total_bytes(64),
            Ordering::SeqCst,
        );
        unsafe {
            (*transfer.as_ptr()).completion = Some(record);
            (*transfer.as_ptr()).user_data = SLOT;
        }
        unsafe { pool::push(&host.pending_transfers, transfer.cast()) };

        host.handle_transfer_completions();
        assert_eq!(CALLBACK_COUNT[SLOT].load(Ordering::SeqCst), 0);
        assert!(!host.pending_transfers.get().is_terminate());
    }

    #[test]
    fn halted_completion_reports_error_flags() {
        const SLOT: usize = 2;

        let mut host = test_host();
        let transfer =
            unsafe { pool::allocate_transfer(&host.transfer_freelist) }.unwrap();
        unsafe {
            (*transfer.as_ptr()).maximum_length = 512;
            (*transfer.as_ptr()).completion = Some(record);
            (*transfer.as_ptr()).user_data = SLOT;
        }
        // Halted mid-transfer with a transaction error; 512 bytes unsent.
        unsafe { &(*transfer.as_ptr()).td }.token.store(
            token::STATUS_HALTED
                | token::STATUS_TRANSACTION_ERROR
                | token::encode_total_bytes(512),
            Ordering::SeqCst,
        );
        unsafe { pool::push(&host.pending_transfers, transfer.cast()) };

        host.handle_transfer_completions();
        assert_eq!(CALLBACK_COUNT[SLOT].load(Ordering::SeqCst), 1);
        assert_eq!(CALLBACK_BYTES[SLOT].load(Ordering::SeqCst), 0);
        assert_eq!(CALLBACK_FLAGS[SLOT].load(Ordering::SeqCst), 0b11);
    }
}
