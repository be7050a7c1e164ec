//! Interrupt-to-main-loop handoff primitives.
//!
//! Interrupt handlers in this design do almost nothing: the slave-IRQ ISR
//! flips a [`TouchIrq`] flag, the UART RX ISR pushes bytes into the engine
//! through an [`IsrShared`] wrapper, and the 1 ms tick ISR advances a
//! [`crate::time::TickClock`]. All decoding and state transitions happen in
//! the cooperative loop.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};

use critical_section::Mutex;

/// Pending-data flag asserted by the touch-controller IRQ ISR.
///
/// A single byte of state with plain load/store semantics; the ISR only
/// ever sets it and the comm engine only ever clears it.
pub struct TouchIrq {
    pending: AtomicBool,
}

impl TouchIrq {
    /// A flag with no interrupt pending.
    pub const fn new() -> Self {
        Self { pending: AtomicBool::new(false) }
    }

    /// Mark slave data pending. ISR-safe.
    pub fn set(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Whether slave data is pending.
    pub fn is_set(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Consume the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }
}

impl Default for TouchIrq {
    fn default() -> Self {
        Self::new()
    }
}

/// Shares a value between one ISR and the cooperative loop.
///
/// Both sides go through [`IsrShared::with`], which holds a critical
/// section for the duration of the closure. Used to hand the UART engine
/// to the RX ISR for [`crate::uart::UartEngine::process_received_byte`].
pub struct IsrShared<T> {
    inner: Mutex<RefCell<T>>,
}

impl<T> IsrShared<T> {
    /// Wrap `value` for ISR sharing.
    pub const fn new(value: T) -> Self {
        Self { inner: Mutex::new(RefCell::new(value)) }
    }

    /// Run `f` on the shared value inside a critical section.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        critical_section::with(|cs| f(&mut self.inner.borrow_ref_mut(cs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_irq_take_clears() {
        let irq = TouchIrq::new();
        assert!(!irq.is_set());
        irq.set();
        assert!(irq.is_set());
        assert!(irq.take());
        assert!(!irq.is_set());
        assert!(!irq.take());
    }

    #[test]
    fn isr_shared_round_trip() {
        let shared = IsrShared::new(0u32);
        shared.with(|v| *v += 7);
        assert_eq!(shared.with(|v| *v), 7);
    }
}
