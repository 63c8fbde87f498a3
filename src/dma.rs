//! DMA-visible descriptor storage

pub mod pools;

pub use pools::{DescriptorPool, PeriodicDescriptor};

/// DMA descriptor alignment requirement (32-byte for EHCI link pointers)
pub const DMA_ALIGNMENT: usize = 32;
