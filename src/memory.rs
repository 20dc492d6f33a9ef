//! Statically-allocated transfer memory

use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, Ordering},
};

/// Word-aligned memory that backs transfer buffers and network blocks
///
/// Allocate a `static` object, then [`take()`](StaticMemory::take) it once to
/// acquire the bytes. Subsequent takes return `None`, so the same memory can't
/// be handed to two components.
///
/// ```
/// use usbd_engine::StaticMemory;
///
/// static TX_MEMORY: StaticMemory<512> = StaticMemory::new();
///
/// let memory = TX_MEMORY.take().unwrap();
/// assert_eq!(memory.len(), 512);
/// assert!(TX_MEMORY.take().is_none());
/// ```
#[repr(C, align(4))]
pub struct StaticMemory<const N: usize> {
    memory: UnsafeCell<[u8; N]>,
    taken: AtomicBool,
}

// Safety: the only access to the memory is through take(), which
// hands out at most one reference.
unsafe impl<const N: usize> Sync for StaticMemory<N> {}

impl<const N: usize> StaticMemory<N> {
    /// Allocate `N` zeroed bytes
    pub const fn new() -> Self {
        StaticMemory {
            memory: UnsafeCell::new([0; N]),
            taken: AtomicBool::new(false),
        }
    }

    /// Acquire the memory
    ///
    /// Returns `None` if the memory was already taken.
    pub fn take(&'static self) -> Option<&'static mut [u8]> {
        let taken = self.taken.swap(true, Ordering::SeqCst);
        // Safety: the flag transitions to `true` exactly once. Only that
        // caller receives the reference.
        (!taken).then(|| -> &'static mut [u8] { unsafe { &mut *self.memory.get() } })
    }

    /// Size of the memory, in bytes
    pub const fn len(&self) -> usize {
        N
    }

    /// Indicates if the memory has no bytes
    pub const fn is_empty(&self) -> bool {
        N == 0
    }
}

impl<const N: usize> Default for StaticMemory<N> {
    fn default() -> Self {
        Self::new()
    }
}
