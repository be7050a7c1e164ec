//! Updater-mode engine: raw pass-through to the slave bootloader.
//!
//! While the slave is being reflashed the bridge does no response-buffer
//! bookkeeping at all; host frames are forwarded verbatim as writes to the
//! bootloader address and read-backs are relayed unparsed. The bootloader
//! wire protocol itself lives entirely in the host-side flashing tool.

use super::bus::I2cBus;
use super::error::CommStatus;
use super::{extended_timeout, BOOTLOADER_ADDRESS};
use crate::arena::{words_for, Arena, ArenaClaim, ArenaError};
use crate::time::{Alarm, AlarmKind, Clock};

/// Receive scratch for bootloader read-backs.
pub const UPDATER_RX_BUFFER_SIZE: usize = 32;

struct UpdaterHeap {
    rx_buffer: [u8; UPDATER_RX_BUFFER_SIZE],
}

/// The updater-mode I2C engine.
pub struct I2cUpdater {
    claim: ArenaClaim,
    heap: UpdaterHeap,
    address: u8,
}

impl I2cUpdater {
    /// Arena words one activation claims.
    pub const HEAP_WORDS: usize = words_for::<UpdaterHeap>();

    /// Claim the updater heap from `arena`, targeting the bootloader
    /// address.
    pub fn activate(arena: &mut Arena) -> Result<Self, ArenaError> {
        let claim = arena.claim(Self::HEAP_WORDS)?;
        debug!("i2c updater active, {} words", claim.words());
        Ok(Self {
            claim,
            heap: UpdaterHeap { rx_buffer: [0; UPDATER_RX_BUFFER_SIZE] },
            address: BOOTLOADER_ADDRESS,
        })
    }

    /// Return the claimed arena words and tear the engine down.
    pub fn deactivate(self, arena: &mut Arena) -> Result<(), ArenaError> {
        arena.release(self.claim)
    }

    /// The bootloader address transfers go to.
    pub fn bootloader_address(&self) -> u8 {
        self.address
    }

    /// Forward `data` to the bootloader and wait for completion.
    pub fn write(
        &mut self,
        bus: &mut impl I2cBus,
        clock: &impl Clock,
        data: &[u8],
        timeout_ms: u32,
    ) -> Result<(), CommStatus> {
        let mut status = CommStatus::ok();
        if data.is_empty() {
            status.set_invalid_input();
            return Err(status);
        }
        if let Err(fault) = bus.write(self.address, data) {
            status.record_fault(fault);
            return Err(status);
        }
        self.wait_complete(bus, clock, data.len(), timeout_ms)
    }

    /// Read `len` bytes back from the bootloader.
    pub fn read<'a>(
        &'a mut self,
        bus: &mut impl I2cBus,
        clock: &impl Clock,
        len: usize,
        timeout_ms: u32,
    ) -> Result<&'a [u8], CommStatus> {
        let mut status = CommStatus::ok();
        if len == 0 || len > UPDATER_RX_BUFFER_SIZE {
            status.set_invalid_input();
            return Err(status);
        }
        if let Err(fault) = bus.read(self.address, len) {
            status.record_fault(fault);
            return Err(status);
        }
        self.wait_complete(bus, clock, len, timeout_ms)?;
        let data = bus.rx_data();
        let n = data.len().min(len);
        self.heap.rx_buffer[..n].copy_from_slice(&data[..n]);
        Ok(&self.heap.rx_buffer[..n])
    }

    fn wait_complete(
        &mut self,
        bus: &mut impl I2cBus,
        clock: &impl Clock,
        size: usize,
        timeout_ms: u32,
    ) -> Result<(), CommStatus> {
        let mut status = CommStatus::ok();
        let mut deadline = Alarm::new();
        if timeout_ms > 0 {
            deadline.arm(clock, timeout_ms, AlarmKind::SingleNotification);
            deadline.snooze(extended_timeout(size));
        }
        loop {
            match bus.poll() {
                Ok(()) => return Ok(()),
                Err(nb::Error::WouldBlock) => {}
                Err(nb::Error::Other(fault)) => {
                    status.record_fault(fault);
                    return Err(status);
                }
            }
            if deadline.has_elapsed(clock) {
                status.set_timed_out();
                return Err(status);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::i2c::bus::BusFault;
    use crate::mock::{FakeClock, ScriptedBus};

    fn updater(arena: &mut Arena) -> I2cUpdater {
        I2cUpdater::activate(arena).unwrap()
    }

    #[test]
    fn write_targets_the_bootloader() {
        let mut arena = Arena::new(64);
        let clock = FakeClock::new();
        let mut bus = ScriptedBus::new();
        let mut engine = updater(&mut arena);

        engine.write(&mut bus, &clock, &[0x01, 0x02], 5).unwrap();
        assert_eq!(bus.writes(), &[(BOOTLOADER_ADDRESS, vec![0x01, 0x02])]);

        engine.deactivate(&mut arena).unwrap();
        assert_eq!(arena.free_words(), 64);
    }

    #[test]
    fn read_relays_scripted_bytes() {
        let mut arena = Arena::new(64);
        let clock = FakeClock::new();
        let mut bus = ScriptedBus::new();
        bus.push_read_data(&[0xDE, 0xAD]);
        let mut engine = updater(&mut arena);

        let data = engine.read(&mut bus, &clock, 2, 5).unwrap();
        assert_eq!(data, &[0xDE, 0xAD]);
    }

    #[test]
    fn oversized_read_is_invalid_input() {
        let mut arena = Arena::new(64);
        let clock = FakeClock::new();
        let mut bus = ScriptedBus::new();
        let mut engine = updater(&mut arena);

        let err = engine
            .read(&mut bus, &clock, UPDATER_RX_BUFFER_SIZE + 1, 5)
            .unwrap_err();
        assert!(err.invalid_input());
    }

    #[test]
    fn nak_surfaces_in_the_status() {
        let mut arena = Arena::new(64);
        let clock = FakeClock::new();
        let mut bus = ScriptedBus::new();
        bus.fail_next_poll(BusFault::Nack);
        let mut engine = updater(&mut arena);

        let err = engine.write(&mut bus, &clock, &[0xAA], 5).unwrap_err();
        assert!(err.nak());
    }

    #[test]
    fn stalled_transfer_times_out() {
        let mut arena = Arena::new(64);
        let clock = FakeClock::new();
        clock.set_auto_advance(1);
        let mut bus = ScriptedBus::new();
        bus.set_latency(u32::MAX);
        let mut engine = updater(&mut arena);

        let err = engine.write(&mut bus, &clock, &[0xAA], 3).unwrap_err();
        assert!(err.timed_out());
    }
}
