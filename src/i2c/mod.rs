//! I2C master communication with the touch-controller slave.
//!
//! The slave exposes a memory-mapped command/response interface: writing
//! offset `0x00` selects its command buffer, writing offset `0x20` selects
//! the response buffer and clears the slave IRQ line. Responses start with
//! a command byte and a length byte, followed by `length` payload bytes.
//!
//! [`master::I2cTranslator`] runs the interrupt-driven receive pipeline and
//! drains host-initiated transfers; [`updater::I2cUpdater`] is the thin
//! bootloader pass-through used while reflashing the slave. Both drive the
//! controller through the [`bus::I2cBus`] seam.

pub mod bus;
pub mod error;
#[cfg(feature = "lockup-recovery")]
pub mod lockup;
pub mod master;
pub mod updater;

/// 7-bit address of the slave application.
pub const APP_ADDRESS: u8 = 0x48;
/// 7-bit address of the slave bootloader.
pub const BOOTLOADER_ADDRESS: u8 = 0x58;

/// Buffer-select offset for the slave's command buffer.
pub const COMMAND_BUFFER_OFFSET: u8 = 0x00;
/// Buffer-select offset for the slave's response buffer. Writing it also
/// clears the slave IRQ.
pub const RESPONSE_BUFFER_OFFSET: u8 = 0x20;

/// Length byte the slave must never report; marks a garbled packet.
pub const INVALID_PACKET_LENGTH: u8 = 0xFF;

/// Direction of a queued host transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferDirection {
    /// Bridge writes to the slave.
    Write,
    /// Bridge reads from the slave.
    Read,
}

/// Packed transfer descriptor: `[address:7 | direction:1]`.
///
/// Stored as the first byte of every record on the transfer queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferDescriptor(u8);

impl TransferDescriptor {
    /// Pack `address` and `direction`.
    pub fn new(address: u8, direction: TransferDirection) -> Self {
        let dir = match direction {
            TransferDirection::Write => 0,
            TransferDirection::Read => 1,
        };
        Self((address << 1) | dir)
    }

    /// Reinterpret a raw queue byte.
    pub fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    /// The packed byte.
    pub fn raw(self) -> u8 {
        self.0
    }

    /// The 7-bit slave address.
    pub fn address(self) -> u8 {
        self.0 >> 1
    }

    /// The transfer direction.
    pub fn direction(self) -> TransferDirection {
        if self.0 & 1 == 0 {
            TransferDirection::Write
        } else {
            TransferDirection::Read
        }
    }
}

/// Command codes understood by the slave application.
///
/// Written as the first byte after selecting the command buffer. The
/// bridge relays them verbatim on behalf of the host and never interprets
/// them; the enumeration exists so hosts built against this crate share
/// one set of names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
#[allow(missing_docs)]
pub enum AppCommand {
    GetFirmwareVersion = 0x01,
    GetStatus = 0x02,
    StartScan = 0x03,
    StopScan = 0x04,
    GetTouchReport = 0x05,
    SetPowerMode = 0x06,
    GetPowerMode = 0x07,
    SetInterruptMode = 0x08,
    Calibrate = 0x09,
    GetCalibrationData = 0x0A,
    SelfTest = 0x0B,
    GetSelfTestResult = 0x0C,
    EnterBootloader = 0x0D,
}

impl AppCommand {
    /// The wire byte.
    pub fn byte(self) -> u8 {
        self as u8
    }
}

/// Consumer of slave data and typed errors: the UART side of the bridge.
///
/// The engines and the framing engine only know each other through this
/// seam; the supervisor wires the two together at activation.
pub trait ResponseSink {
    /// Slave bytes ready to be re-framed for the host.
    fn on_slave_data(&mut self, data: &[u8]);

    /// A comm-engine call finished with error bits set.
    fn on_error(&mut self, status: error::CommStatus, callsite: error::Callsite);
}

/// Worst-case transaction time for `n` bytes, in milliseconds.
///
/// Nine bit-times per byte at roughly 100 kHz SCL is ~90 us per byte;
/// divide by 1024 instead of 1000 and round up, plus one for the partial
/// millisecond still in flight.
pub fn extended_timeout(n: usize) -> u32 {
    (n as u32 * 90 + 1023) / 1024 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_packs_address_and_direction() {
        let write = TransferDescriptor::new(APP_ADDRESS, TransferDirection::Write);
        assert_eq!(write.raw(), 0x90);
        assert_eq!(write.address(), APP_ADDRESS);
        assert_eq!(write.direction(), TransferDirection::Write);

        let read = TransferDescriptor::new(BOOTLOADER_ADDRESS, TransferDirection::Read);
        assert_eq!(read.raw(), 0xB1);
        assert_eq!(read.address(), BOOTLOADER_ADDRESS);
        assert_eq!(read.direction(), TransferDirection::Read);

        assert_eq!(TransferDescriptor::from_raw(0x91).direction(), TransferDirection::Read);
    }

    #[test]
    fn extended_timeout_scales_with_size() {
        assert_eq!(extended_timeout(0), 1);
        assert_eq!(extended_timeout(1), 2);
        assert_eq!(extended_timeout(12), 3);
        assert!(extended_timeout(600) >= 53);
    }
}
