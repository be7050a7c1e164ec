//! Locked-bus detection and recovery.
//!
//! A slave holding SDA/SCL low shows up as a stream of busy-class faults
//! from the controller. Once those persist past the detection window the
//! bus is declared locked and the monitor periodically re-inits the
//! controller and probes the slave until it acknowledges again. A stretch
//! of failed attempts past the cap latches a software-reset request for
//! the supervisor.

use super::bus::I2cBus;
use crate::time::{Alarm, AlarmKind, Clock};

/// How long busy faults must persist before the bus counts as locked.
pub const DETECT_MS: u32 = 100;
/// Interval between recovery attempts.
pub const RECOVER_INTERVAL_MS: u32 = 50;
/// Recovery attempts before a software reset is requested.
pub const MAX_RECOVERY_ATTEMPTS: u8 = 10;

/// Busy-fault fed detector plus periodic recovery driver.
pub struct LockupMonitor {
    locked: bool,
    detect: Alarm,
    recover: Alarm,
    attempts: u8,
    reset_requested: bool,
}

impl LockupMonitor {
    /// A monitor with no fault history.
    pub const fn new() -> Self {
        Self {
            locked: false,
            detect: Alarm::new(),
            recover: Alarm::new(),
            attempts: 0,
            reset_requested: false,
        }
    }

    /// Whether the bus is currently considered locked.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Whether recovery gave up and wants a software reset.
    pub fn reset_requested(&self) -> bool {
        self.reset_requested
    }

    /// Recovery attempts since the bus locked.
    pub fn attempts(&self) -> u8 {
        self.attempts
    }

    /// Feed one busy-class fault from the driver.
    pub fn on_busy_fault(&mut self, clock: &impl Clock) {
        if self.locked {
            return;
        }
        if !self.detect.is_armed() {
            self.detect.arm(clock, DETECT_MS, AlarmKind::SingleNotification);
        } else if self.detect.has_elapsed(clock) {
            warn!("i2c bus locked, starting recovery");
            self.locked = true;
            self.recover
                .arm(clock, RECOVER_INTERVAL_MS, AlarmKind::ContinuousNotification);
        }
    }

    /// Run one recovery attempt if the interval is due. Returns true when
    /// the slave acknowledged and the bus is healthy again.
    pub fn service(&mut self, clock: &impl Clock, bus: &mut impl I2cBus, slave_address: u8) -> bool {
        if !self.locked || !self.recover.has_elapsed(clock) {
            return false;
        }
        self.recover
            .arm(clock, RECOVER_INTERVAL_MS, AlarmKind::ContinuousNotification);

        bus.reinit();
        self.attempts = self.attempts.saturating_add(1);
        if bus.probe(slave_address).is_ok() {
            info!("i2c bus recovered after {} attempts", self.attempts);
            self.clear();
            return true;
        }
        if self.attempts >= MAX_RECOVERY_ATTEMPTS && !self.reset_requested {
            error!("i2c bus recovery exhausted, requesting reset");
            self.reset_requested = true;
        }
        false
    }

    /// A healthy non-busy transaction resets all lockup state.
    pub fn on_success(&mut self) {
        self.clear();
    }

    fn clear(&mut self) {
        self.locked = false;
        self.detect.disarm();
        self.recover.disarm();
        self.attempts = 0;
        self.reset_requested = false;
    }
}

impl Default for LockupMonitor {
    fn default() -> Self {
        Self::new()
    }
}
