//! Freelist pools for host-mode queue heads and transfers
//!
//! Every pooled object leads with a link cell; the freelist is threaded
//! through the very cell the hardware uses once the object goes live. The
//! freelist head holds a link to the first free element, or terminate when
//! the pool is empty.

use super::qh::{HostQueueHead, HostTransfer};
use crate::dma::{LinkCell, LinkWord};
use core::ptr::NonNull;

/// Queue heads available for asynchronous endpoints
pub const QUEUE_HEAD_POOL_SIZE: usize = 8;

/// Transfers available across all endpoints
pub const TRANSFER_POOL_SIZE: usize = 8;

/// Backing storage for the host object pools
///
/// Must live in DMA-visible memory with a stable address.
pub struct HostPools {
    pub(crate) queue_heads: [HostQueueHead; QUEUE_HEAD_POOL_SIZE],
    pub(crate) transfers: [HostTransfer; TRANSFER_POOL_SIZE],
}

impl HostPools {
    /// Create the pool storage
    pub const fn new() -> Self {
        Self {
            queue_heads: [const { HostQueueHead::new() }; QUEUE_HEAD_POOL_SIZE],
            transfers: [const { HostTransfer::new() }; TRANSFER_POOL_SIZE],
        }
    }
}

impl Default for HostPools {
    fn default() -> Self {
        Self::new()
    }
}

/// Chain a pool's elements into a freelist and return its head
///
/// Each element's leading link cell points at the next element; the last
/// element terminates. Every pool is terminated by its own length, never
/// another pool's.
fn seed<T>(elements: &[T], link_of: impl Fn(&T) -> &LinkCell) -> LinkCell {
    for pair in elements.windows(2) {
        link_of(&pair[0]).set(LinkWord::to(&pair[1] as *const T));
    }
    if let Some(last) = elements.last() {
        link_of(last).set(LinkWord::TERMINATE);
    }
    match elements.first() {
        Some(first) => LinkCell::new(LinkWord::to(first as *const T)),
        None => LinkCell::terminated(),
    }
}

/// Seed the queue-head freelist
pub(crate) fn seed_queue_heads(pools: &HostPools) -> LinkCell {
    seed(&pools.queue_heads, |qh| &qh.horizontal)
}

/// Seed the transfer freelist
pub(crate) fn seed_transfers(pools: &HostPools) -> LinkCell {
    seed(&pools.transfers, |transfer| &transfer.horizontal)
}

/// Pop the head element off a freelist
///
/// The allocated element's link cell is reset to terminate so a stale link
/// can never be mistaken for a live one. Only the link cell is touched; the
/// caller clears whatever else it needs.
///
/// # Safety
///
/// `freelist` must head a list seeded over live pool elements, and the
/// caller must serialize against any other context that touches the list.
unsafe fn allocate(freelist: &LinkCell) -> Option<NonNull<LinkCell>> {
    let head = freelist.get();
    if head.is_terminate() {
        return None;
    }
    let element = head.pointer::<LinkCell>()?;

    freelist.set(unsafe { element.as_ref() }.get());
    unsafe { element.as_ref() }.set(LinkWord::TERMINATE);
    Some(element)
}

/// Push an element onto the head of a list
///
/// # Safety
///
/// `element` must lead a live pool object that no hardware structure
/// references, and the caller must serialize against other list users.
pub(crate) unsafe fn push(list: &LinkCell, element: NonNull<LinkCell>) {
    unsafe { element.as_ref() }.set(list.get());
    list.set(LinkWord::to(element.as_ptr()));
}

/// Allocate a queue head from the pool
///
/// # Safety
///
/// See [`push`]; same list ownership rules.
pub(crate) unsafe fn allocate_queue_head(freelist: &LinkCell) -> Option<NonNull<HostQueueHead>> {
    unsafe { allocate(freelist) }.map(NonNull::cast)
}

/// Return a queue head to the pool
///
/// The queue head must not be part of a live ring.
///
/// # Safety
///
/// See [`push`].
pub(crate) unsafe fn free_queue_head(freelist: &LinkCell, queue_head: NonNull<HostQueueHead>) {
    unsafe { push(freelist, queue_head.cast()) };
}

/// Allocate a transfer from the pool, clearing its embedded descriptor
///
/// # Safety
///
/// See [`push`]; same list ownership rules.
pub(crate) unsafe fn allocate_transfer(freelist: &LinkCell) -> Option<NonNull<HostTransfer>> {
    let transfer: NonNull<HostTransfer> = unsafe { allocate(freelist) }?.cast();
    unsafe { transfer.as_ref() }.td.clear();
    Some(transfer)
}

/// Return a transfer to the pool
///
/// # Safety
///
/// See [`push`].
pub(crate) unsafe fn free_transfer(freelist: &LinkCell, transfer: NonNull<HostTransfer>) {
    unsafe { push(freelist, transfer.cast()) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;
    use std::vec::Vec;

    fn leaked_pools() -> &'static HostPools {
        Box::leak(Box::new(HostPools::new()))
    }

    #[test]
    fn queue_head_pool_drains_and_refills() {
        let pools = leaked_pools();
        let freelist = seed_queue_heads(pools);

        let mut taken = Vec::new();
        for _ in 0..QUEUE_HEAD_POOL_SIZE {
            let qh = unsafe { allocate_queue_head(&freelist) }.unwrap();
            // A freshly allocated queue head is not in any ring.
            assert!(unsafe { qh.as_ref() }.horizontal.get().is_terminate());
            taken.push(qh);
        }
        assert!(unsafe { allocate_queue_head(&freelist) }.is_none());

        for qh in taken.drain(..).rev() {
            unsafe { free_queue_head(&freelist, qh) };
        }
        for _ in 0..QUEUE_HEAD_POOL_SIZE {
            assert!(unsafe { allocate_queue_head(&freelist) }.is_some());
        }
        assert!(unsafe { allocate_queue_head(&freelist) }.is_none());
    }

    #[test]
    fn transfer_pool_terminates_at_its_own_length() {
        // The transfer pool must yield exactly TRANSFER_POOL_SIZE elements
        // regardless of the queue-head pool's size.
        let pools = leaked_pools();
        let freelist = seed_transfers(pools);

        let mut count = 0;
        while unsafe { allocate_transfer(&freelist) }.is_some() {
            count += 1;
            assert!(count <= TRANSFER_POOL_SIZE);
        }
        assert_eq!(count, TRANSFER_POOL_SIZE);
    }

    #[test]
    fn allocation_clears_only_the_descriptor() {
        let pools = leaked_pools();
        let freelist = seed_transfers(pools);

        let transfer = unsafe { allocate_transfer(&freelist) }.unwrap();
        let transfer_ref = unsafe { transfer.as_ref() };
        assert!(transfer_ref.td.next.get().is_terminate());
        assert!(!transfer_ref.td.is_active());
        unsafe { free_transfer(&freelist, transfer) };

        // Freed elements sit at the freelist head: LIFO reuse.
        let again = unsafe { allocate_transfer(&freelist) }.unwrap();
        assert_eq!(again.as_ptr(), transfer.as_ptr());
    }
}
