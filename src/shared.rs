//! Sharing components between interrupt and task contexts

use core::cell::RefCell;
use cortex_m::interrupt::{self, Mutex};

/// A component shared between the USB interrupt handler and the application
///
/// Hardware events are dispatched from the interrupt handler, while the
/// application queues data from task context. Place the component in a
/// `Shared`, and reach it through [`with()`](Shared::with) in both places.
/// Every access masks interrupts for the duration of the closure, so keep the
/// closures short.
///
/// ```no_run
/// use usbd_engine::Shared;
///
/// struct Counter(u32);
/// static COUNTER: Shared<Counter> = Shared::new(Counter(0));
///
/// let count = COUNTER.with(|counter| {
///     counter.0 += 1;
///     counter.0
/// });
/// # let _ = count;
/// ```
pub struct Shared<T> {
    inner: Mutex<RefCell<T>>,
}

impl<T> Shared<T> {
    /// Wrap a component
    pub const fn new(value: T) -> Self {
        Shared {
            inner: Mutex::new(RefCell::new(value)),
        }
    }

    /// Interrupt-safe, mutable access to the component
    ///
    /// # Panics
    ///
    /// Panics if called re-entrantly from within `func`.
    pub fn with<R>(&self, func: impl FnOnce(&mut T) -> R) -> R {
        interrupt::free(|cs| {
            let inner = self.inner.borrow(cs);
            let mut inner = inner.borrow_mut();
            func(&mut *inner)
        })
    }

    /// Interrupt-safe, immutable access to the component
    pub fn with_ref<R>(&self, func: impl FnOnce(&T) -> R) -> R {
        interrupt::free(|cs| {
            let inner = self.inner.borrow(cs);
            let inner = inner.borrow();
            func(&*inner)
        })
    }
}
