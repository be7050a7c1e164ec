//! Seam to the vendor I2C controller driver.
//!
//! The comm engines never touch controller registers. They begin a
//! transaction with [`I2cBus::write`] / [`I2cBus::read`] and then drive it
//! to completion by polling [`I2cBus::poll`], which follows the `nb`
//! convention: `WouldBlock` while the transaction is in flight, `Ok` once
//! the bus is idle again, `Err(Other(fault))` exactly once per failed
//! transaction.

/// Faults reported by the controller driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum BusFault {
    /// The bus lines are held by another party (or stuck low).
    Busy,
    /// The controller refused the request in its current state.
    NotReady,
    /// The slave did not acknowledge the address or a data byte.
    Nack,
    /// Controller-internal failure (arbitration loss, FIFO error, ...).
    Hardware,
}

impl BusFault {
    /// Whether this fault feeds the locked-bus detector.
    pub fn is_busy_class(self) -> bool {
        matches!(self, BusFault::Busy | BusFault::NotReady)
    }
}

/// Non-blocking master access to the I2C controller.
///
/// Implementations own a receive buffer at least as large as the longest
/// read the engines request (260 bytes in translator mode).
pub trait I2cBus {
    /// Drive the current transaction. `WouldBlock` while in flight, `Ok`
    /// when the bus is idle, a fault exactly once per failed transaction.
    fn poll(&mut self) -> nb::Result<(), BusFault>;

    /// Begin writing `bytes` to `address`. The bus must be idle.
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), BusFault>;

    /// Begin reading `len` bytes from `address` into the driver buffer.
    /// The bus must be idle.
    fn read(&mut self, address: u8, len: usize) -> Result<(), BusFault>;

    /// Bytes received by the last completed read.
    fn rx_data(&self) -> &[u8];

    /// Blocking zero-length probe: address the slave and report whether it
    /// acknowledged.
    fn probe(&mut self, address: u8) -> Result<(), BusFault>;

    /// Stop the controller, clear its status, re-init and re-enable it.
    /// Used by locked-bus recovery.
    fn reinit(&mut self);
}

impl<B: I2cBus + ?Sized> I2cBus for &mut B {
    fn poll(&mut self) -> nb::Result<(), BusFault> {
        (**self).poll()
    }

    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), BusFault> {
        (**self).write(address, bytes)
    }

    fn read(&mut self, address: u8, len: usize) -> Result<(), BusFault> {
        (**self).read(address, len)
    }

    fn rx_data(&self) -> &[u8] {
        (**self).rx_data()
    }

    fn probe(&mut self, address: u8) -> Result<(), BusFault> {
        (**self).probe(address)
    }

    fn reinit(&mut self) {
        (**self).reinit()
    }
}
