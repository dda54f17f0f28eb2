//! Per-endpoint transfer queues over a shared descriptor pool
//!
//! Transfers pair a hardware dTD with completion bookkeeping. A single pool
//! feeds every endpoint; each endpoint keeps an ordered queue of its in-flight
//! transfers so the completion reaper can retire them in submission order.

use super::qh::{TransferDescriptor, QUEUE_HEAD_COUNT};
use super::UsbDevice;
use crate::descriptor::EndpointAddress;
use crate::dma::LinkWord;
use crate::error::{Result, UsbError};

/// Number of transfers the shared pool holds
pub const TRANSFER_POOL_SIZE: usize = 16;

/// Completion callback: `(user_data, bytes_transferred)`
pub type TransferCallback = fn(user_data: usize, bytes_transferred: u32);

const NO_TRANSFER: u8 = u8::MAX;

/// One pooled transfer: hardware descriptor plus completion metadata
///
/// The dTD sits at offset zero; the controller never reads past it.
#[repr(C, align(64))]
pub struct Transfer {
    td: TransferDescriptor,
    next: u8,
    maximum_length: u32,
    completion: Option<TransferCallback>,
    user_data: usize,
}

impl Transfer {
    const fn new() -> Self {
        Self {
            td: TransferDescriptor::new(),
            next: NO_TRANSFER,
            maximum_length: 0,
            completion: None,
            user_data: 0,
        }
    }

    /// The embedded hardware descriptor
    pub fn descriptor(&self) -> &TransferDescriptor {
        &self.td
    }
}

#[derive(Clone, Copy)]
struct EndpointQueue {
    head: u8,
    tail: u8,
}

impl EndpointQueue {
    const fn empty() -> Self {
        Self {
            head: NO_TRANSFER,
            tail: NO_TRANSFER,
        }
    }
}

/// Shared transfer pool with per-endpoint in-flight queues
///
/// Allocation and deallocation are not interrupt-safe on their own; callers
/// that may race the ISR hold a critical section around them.
pub struct TransferPool {
    transfers: [Transfer; TRANSFER_POOL_SIZE],
    free_head: u8,
    queues: [EndpointQueue; QUEUE_HEAD_COUNT],
}

impl TransferPool {
    /// Create a pool with every transfer on the freelist
    pub const fn new() -> Self {
        let mut transfers = [const { Transfer::new() }; TRANSFER_POOL_SIZE];
        let mut i = 0;
        while i < TRANSFER_POOL_SIZE - 1 {
            transfers[i].next = (i + 1) as u8;
            i += 1;
        }
        transfers[TRANSFER_POOL_SIZE - 1].next = NO_TRANSFER;
        Self {
            transfers,
            free_head: 0,
            queues: [EndpointQueue::empty(); QUEUE_HEAD_COUNT],
        }
    }

    /// Take a transfer from the freelist
    ///
    /// Only the descriptor's link cell is reset; callers arm the rest of the
    /// descriptor explicitly.
    pub fn allocate(&mut self) -> Option<u8> {
        if self.free_head == NO_TRANSFER {
            #[cfg(feature = "defmt")]
            defmt::warn!("device transfer pool exhausted");
            return None;
        }
        let index = self.free_head;
        self.free_head = self.transfers[index as usize].next;
        let transfer = &mut self.transfers[index as usize];
        transfer.next = NO_TRANSFER;
        transfer.td.next.set(LinkWord::TERMINATE);
        Some(index)
    }

    /// Return a transfer to the freelist
    pub fn free(&mut self, index: u8) {
        self.transfers[index as usize].next = self.free_head;
        self.free_head = index;
    }

    /// Number of transfers currently on the freelist
    pub fn available(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.free_head;
        while cursor != NO_TRANSFER {
            count += 1;
            cursor = self.transfers[cursor as usize].next;
        }
        count
    }

    fn transfer(&self, index: u8) -> &Transfer {
        &self.transfers[index as usize]
    }

    fn transfer_mut(&mut self, index: u8) -> &mut Transfer {
        &mut self.transfers[index as usize]
    }

    /// DMA address of a pooled transfer's descriptor
    pub fn descriptor_address(&self, index: u8) -> *const TransferDescriptor {
        &self.transfers[index as usize].td
    }

    /// Chain `new`'s descriptor after `tail`'s in DMA space
    pub fn link_descriptor(&self, tail: u8, new: u8) {
        let target = self.descriptor_address(new);
        self.transfers[tail as usize].td.next.set(LinkWord::to(target));
    }

    /// Index of the last in-flight transfer on an endpoint's queue
    pub fn tail_of(&self, qh_index: usize) -> Option<u8> {
        match self.queues[qh_index].tail {
            NO_TRANSFER => None,
            tail => Some(tail),
        }
    }

    fn push(&mut self, qh_index: usize, index: u8) {
        let queue = &mut self.queues[qh_index];
        if queue.tail == NO_TRANSFER {
            queue.head = index;
        } else {
            let tail = queue.tail;
            self.transfers[tail as usize].next = index;
        }
        self.queues[qh_index].tail = index;
    }

    fn pop_head(&mut self, qh_index: usize) -> Option<u8> {
        let queue = &mut self.queues[qh_index];
        match queue.head {
            NO_TRANSFER => None,
            head => {
                queue.head = self.transfers[head as usize].next;
                if queue.head == NO_TRANSFER {
                    queue.tail = NO_TRANSFER;
                }
                Some(head)
            }
        }
    }

    /// Drop every queued transfer for an endpoint without running callbacks
    ///
    /// Used when an endpoint is flushed or torn down.
    pub fn flush_queue(&mut self, qh_index: usize) {
        while let Some(index) = self.pop_head(qh_index) {
            self.free(index);
        }
    }

    /// Retire completed transfers at the head of an endpoint's queue
    ///
    /// Walks in submission order and stops at the first descriptor the
    /// hardware still owns. Each retired transfer is freed before its
    /// callback runs, so a callback may immediately schedule a new transfer.
    pub fn reap_completed(&mut self, qh_index: usize) {
        loop {
            let head = match self.queues[qh_index].head {
                NO_TRANSFER => return,
                head => head,
            };
            if self.transfer(head).td.is_active() {
                return;
            }

            let transfer = self.transfer(head);
            let bytes_transferred = transfer.maximum_length - transfer.td.remaining_bytes();
            let completion = transfer.completion;
            let user_data = transfer.user_data;

            let _ = self.pop_head(qh_index);
            self.free(head);

            if let Some(callback) = completion {
                callback(user_data, bytes_transferred);
            }
        }
    }
}

impl Default for TransferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbDevice {
    /// Schedule a transfer on an endpoint
    ///
    /// The transfer is appended to the endpoint's queue; if the endpoint is
    /// idle it is primed directly, otherwise the descriptor is linked onto
    /// the running chain with the add-dTD tripwire handshake.
    ///
    /// # Safety
    ///
    /// `data` must point to a DMA-visible buffer of at least
    /// `maximum_length` bytes that stays valid (and, for OUT endpoints,
    /// writable) until the completion callback runs or the endpoint is
    /// flushed. A null pointer is only permitted with `maximum_length == 0`.
    pub unsafe fn transfer_schedule(
        &mut self,
        endpoint: EndpointAddress,
        data: *const u8,
        maximum_length: u32,
        completion: Option<TransferCallback>,
        user_data: usize,
    ) -> Result<()> {
        critical_section::with(|_| {
            let index = self
                .transfers
                .allocate()
                .ok_or(UsbError::NoResources)?;

            {
                let transfer = self.transfers.transfer_mut(index);
                unsafe { transfer.td.prepare(data, maximum_length) };
                transfer.maximum_length = maximum_length;
                transfer.completion = completion;
                transfer.user_data = user_data;
            }

            let qh_index = endpoint.queue_head_index();
            let scheduled = match self.transfers.tail_of(qh_index) {
                None => self.endpoint_schedule_wait(endpoint, index),
                Some(tail) => {
                    self.endpoint_schedule_append(endpoint, tail, index);
                    Ok(())
                }
            };

            if let Err(error) = scheduled {
                self.transfers.free(index);
                return Err(error);
            }

            self.transfers.push(qh_index, index);
            Ok(())
        })
    }

    /// Schedule a zero-length handshake packet on an endpoint
    ///
    /// Used for the status stage of control transfers.
    pub fn transfer_schedule_ack(&mut self, endpoint: EndpointAddress) -> Result<()> {
        unsafe { self.transfer_schedule(endpoint, core::ptr::null(), 0, None, 0) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::token;
    use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    #[test]
    fn pool_returns_to_full_after_arbitrary_free_order() {
        let mut pool = TransferPool::new();
        assert_eq!(pool.available(), TRANSFER_POOL_SIZE);

        let mut held = [0u8; TRANSFER_POOL_SIZE];
        for slot in held.iter_mut() {
            *slot = pool.allocate().unwrap();
        }
        assert!(pool.allocate().is_none());
        assert_eq!(pool.available(), 0);

        // Free in a scrambled order; the pool must become fully available.
        for offset in [3usize, 0, 7, 12, 1, 15, 4, 9, 2, 14, 5, 11, 6, 13, 8, 10] {
            pool.free(held[offset]);
        }
        assert_eq!(pool.available(), TRANSFER_POOL_SIZE);
        for _ in 0..TRANSFER_POOL_SIZE {
            assert!(pool.allocate().is_some());
        }
    }

    #[test]
    fn queues_preserve_submission_order() {
        let mut pool = TransferPool::new();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();
        pool.push(2, a);
        pool.push(2, b);
        pool.push(2, c);

        assert_eq!(pool.tail_of(2), Some(c));
        assert_eq!(pool.pop_head(2), Some(a));
        assert_eq!(pool.pop_head(2), Some(b));
        assert_eq!(pool.pop_head(2), Some(c));
        assert_eq!(pool.pop_head(2), None);
        assert_eq!(pool.tail_of(2), None);
    }

    // Completion records are keyed by user_data so concurrently running
    // tests never observe each other's callbacks.
    static REAPED_BYTES: [AtomicU32; 2] = [AtomicU32::new(0), AtomicU32::new(0)];
    static REAPED_COUNT: [AtomicUsize; 2] = [AtomicUsize::new(0), AtomicUsize::new(0)];

    fn record_completion(user_data: usize, bytes_transferred: u32) {
        REAPED_BYTES[user_data].fetch_add(bytes_transferred, Ordering::SeqCst);
        REAPED_COUNT[user_data].fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn reaper_stops_at_first_active_descriptor() {
        const SLOT: usize = 0;

        let mut pool = TransferPool::new();
        let first = pool.allocate().unwrap();
        let second = pool.allocate().unwrap();

        for (index, requested, remaining, active) in
            [(first, 64u32, 14u32, false), (second, 32, 32, true)]
        {
            let transfer = pool.transfer_mut(index);
            transfer.maximum_length = requested;
            transfer.completion = Some(record_completion);
            transfer.user_data = SLOT;
            transfer.td.token.store(
                token::encode_total_bytes(remaining)
                    | if active { token::STATUS_ACTIVE } else { 0 },
                Ordering::SeqCst,
            );
            pool.push(0, index);
        }

        pool.reap_completed(0);

        // Only the inactive head transfer retires: 64 requested - 14 left.
        assert_eq!(REAPED_COUNT[SLOT].load(Ordering::SeqCst), 1);
        assert_eq!(REAPED_BYTES[SLOT].load(Ordering::SeqCst), 50);
        assert_eq!(pool.tail_of(0), Some(second));

        // Once the hardware releases the second descriptor it retires too.
        pool.transfer(second)
            .td
            .token
            .store(token::encode_total_bytes(0), Ordering::SeqCst);
        pool.reap_completed(0);
        assert_eq!(REAPED_COUNT[SLOT].load(Ordering::SeqCst), 2);
        assert_eq!(REAPED_BYTES[SLOT].load(Ordering::SeqCst), 82);
        assert_eq!(pool.tail_of(0), None);
        assert_eq!(pool.available(), TRANSFER_POOL_SIZE);
    }

    #[test]
    fn flush_discards_without_callbacks() {
        const SLOT: usize = 1;

        let mut pool = TransferPool::new();
        for _ in 0..4 {
            let index = pool.allocate().unwrap();
            let transfer = pool.transfer_mut(index);
            transfer.completion = Some(record_completion);
            transfer.user_data = SLOT;
            pool.push(3, index);
        }

        pool.flush_queue(3);
        assert_eq!(REAPED_COUNT[SLOT].load(Ordering::SeqCst), 0);
        assert_eq!(pool.available(), TRANSFER_POOL_SIZE);
        assert_eq!(pool.tail_of(3), None);
    }
}
