//! Zero-allocation descriptor pools with compile-time sizing
//!
//! Periodic descriptors are referenced by the controller through 32-bit DMA
//! addresses, so a pool never moves its storage and hands out indices rather
//! than references. The pool must sit at its final location (typically a
//! `static` in non-cacheable RAM) before any descriptor is linked.

use super::DMA_ALIGNMENT;
use crate::ehci::{IsoTransferDescriptor, LinkPointer, LinkType, QueueHead};

// Link pointers drop the low five address bits
const _: () = assert!(core::mem::align_of::<QueueHead>() >= DMA_ALIGNMENT);
const _: () = assert!(core::mem::align_of::<IsoTransferDescriptor>() >= DMA_ALIGNMENT);

/// A descriptor that can sit in the periodic schedule
pub trait PeriodicDescriptor {
    /// Type tag used in link pointers to this descriptor
    const LINK_TYPE: LinkType;
    /// Unlinked, inactive descriptor
    const EMPTY: Self;

    /// Hardware next link
    fn next(&self) -> LinkPointer;
    /// Point the hardware next link
    fn set_next(&self, link: LinkPointer);
    /// Return to the unlinked, inactive state
    fn reset(&self);
}

impl PeriodicDescriptor for QueueHead {
    const LINK_TYPE: LinkType = LinkType::Qh;
    #[allow(clippy::declare_interior_mutable_const)]
    const EMPTY: Self = QueueHead::new();

    fn next(&self) -> LinkPointer {
        QueueHead::next(self)
    }

    fn set_next(&self, link: LinkPointer) {
        QueueHead::set_next(self, link)
    }

    fn reset(&self) {
        QueueHead::reset(self)
    }
}

impl PeriodicDescriptor for IsoTransferDescriptor {
    const LINK_TYPE: LinkType = LinkType::Itd;
    #[allow(clippy::declare_interior_mutable_const)]
    const EMPTY: Self = IsoTransferDescriptor::new();

    fn next(&self) -> LinkPointer {
        IsoTransferDescriptor::next(self)
    }

    fn set_next(&self, link: LinkPointer) {
        IsoTransferDescriptor::set_next(self, link)
    }

    fn reset(&self) {
        IsoTransferDescriptor::reset(self)
    }
}

/// Fixed pool of periodic descriptors
pub struct DescriptorPool<T: PeriodicDescriptor, const N: usize> {
    memory: [T; N],
    allocated: [bool; N],
}

impl<T: PeriodicDescriptor, const N: usize> DescriptorPool<T, N> {
    /// Create new descriptor pool (const-compatible)
    pub const fn new() -> Self {
        Self {
            memory: [const { T::EMPTY }; N],
            allocated: [false; N],
        }
    }

    /// Claim a descriptor, returning its index
    pub fn alloc(&mut self) -> Option<usize> {
        let index = self.allocated.iter().position(|used| !used)?;
        self.allocated[index] = true;
        self.memory[index].reset();
        Some(index)
    }

    /// Return a descriptor to the pool
    ///
    /// The caller guarantees the controller no longer references it.
    pub fn free(&mut self, index: usize) {
        if index < N && self.allocated[index] {
            self.memory[index].reset();
            self.allocated[index] = false;
        }
    }

    /// Allocated descriptor at `index`
    pub fn get(&self, index: usize) -> Option<&T> {
        if self.is_allocated(index) {
            Some(&self.memory[index])
        } else {
            None
        }
    }

    /// Whether `index` is currently allocated
    pub fn is_allocated(&self, index: usize) -> bool {
        index < N && self.allocated[index]
    }

    /// DMA address of the descriptor at `index`
    pub fn dma_address(&self, index: usize) -> u32 {
        (&self.memory[index % N] as *const T as usize) as u32
    }

    /// Link pointer naming the descriptor at `index`
    pub fn link(&self, index: usize) -> LinkPointer {
        LinkPointer::new(self.dma_address(index), T::LINK_TYPE)
    }

    /// Map a DMA address back to a descriptor index
    pub fn index_of(&self, address: u32) -> Option<usize> {
        let base = self.dma_address(0);
        let offset = address.wrapping_sub(base) as usize;
        let size = core::mem::size_of::<T>();
        if offset % size != 0 {
            return None;
        }
        let index = offset / size;
        (index < N).then_some(index)
    }

    /// Number of free descriptors
    pub fn available(&self) -> usize {
        self.allocated.iter().filter(|used| !**used).count()
    }

    /// Pool capacity
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<T: PeriodicDescriptor, const N: usize> Default for DescriptorPool<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
