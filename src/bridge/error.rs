//! Error routing toward the host.
//!
//! Every failure inside the bridge funnels through one [`ErrorRouter`].
//! How a failure reaches the host depends on the current [`ErrorMode`]:
//! the legacy mode mimics the original per-family command bytes (`T` for a
//! timeout, `N` for a NAK), the global mode wraps everything into one `E`
//! frame carrying the status mask and the packed callsite. Failures are
//! also tallied per family; the host reads the tallies with the `E` stats
//! sub-command.

use crate::i2c::error::{Callsite, CommStatus};

/// How errors are presented to the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorMode {
    /// Per-family bridge commands, as the oldest hosts expect.
    #[default]
    Legacy = 0,
    /// Structured `E` frames with status and callsite.
    Global = 1,
    /// Human-readable ASCII. Reserved, currently silent.
    Cli = 2,
}

/// Family tag carried in the first payload byte of an `E` frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorFamily {
    /// Supervisor and board-level failures.
    System = 0,
    /// Updater-mode failures.
    Updater = 1,
    /// Host-link framing failures.
    Uart = 2,
    /// Slave-communication failures.
    I2c = 3,
    /// Not a failure: reports the current error mode.
    Mode = 4,
    /// Not a failure: reports the per-family tallies.
    Stats = 5,
}

impl ErrorFamily {
    /// The wire tag byte.
    pub fn tag(self) -> u8 {
        self as u8
    }

    fn tally_index(self) -> Option<usize> {
        match self {
            ErrorFamily::System => Some(0),
            ErrorFamily::Updater => Some(1),
            ErrorFamily::Uart => Some(2),
            ErrorFamily::I2c => Some(3),
            ErrorFamily::Mode | ErrorFamily::Stats => None,
        }
    }
}

/// What the router wants sent for a reported error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorReply {
    /// Nothing to transmit.
    None,
    /// A bare legacy command byte.
    LegacyCommand(u8),
    /// An `E` frame payload: `[family, status, callsite_hi, callsite_lo]`.
    Frame([u8; 4]),
}

/// Payload bytes of the mode report message.
pub const MODE_PAYLOAD_LEN: usize = 2;
/// Payload bytes of the stats report message.
pub const STATS_PAYLOAD_LEN: usize = 9;

/// Mode state plus per-family tallies.
pub struct ErrorRouter {
    mode: ErrorMode,
    tallies: [u16; 4],
}

impl ErrorRouter {
    /// A router in legacy mode with clear tallies.
    pub const fn new() -> Self {
        Self { mode: ErrorMode::Legacy, tallies: [0; 4] }
    }

    /// The active error mode.
    pub fn mode(&self) -> ErrorMode {
        self.mode
    }

    /// Switch the error mode.
    pub fn set_mode(&mut self, mode: ErrorMode) {
        self.mode = mode;
    }

    /// Tallies in family order: system, updater, uart, i2c.
    pub fn tallies(&self) -> [u16; 4] {
        self.tallies
    }

    /// Reset all tallies to zero.
    pub fn clear_tallies(&mut self) {
        self.tallies = [0; 4];
    }

    /// Record one failure and decide what to send the host.
    pub fn report(&mut self, family: ErrorFamily, status: CommStatus, callsite: Callsite) -> ErrorReply {
        if let Some(index) = family.tally_index() {
            self.tallies[index] = self.tallies[index].saturating_add(1);
        }
        match self.mode {
            ErrorMode::Legacy => {
                if status.timed_out() {
                    ErrorReply::LegacyCommand(b'T')
                } else if status.nak() {
                    ErrorReply::LegacyCommand(b'N')
                } else {
                    ErrorReply::None
                }
            }
            ErrorMode::Global => {
                let callsite = callsite.value();
                ErrorReply::Frame([
                    family.tag(),
                    status.bits(),
                    (callsite >> 8) as u8,
                    callsite as u8,
                ])
            }
            ErrorMode::Cli => ErrorReply::None,
        }
    }

    /// Payload of the mode report: `[Mode tag, mode]`.
    pub fn mode_payload(&self) -> [u8; MODE_PAYLOAD_LEN] {
        [ErrorFamily::Mode.tag(), self.mode as u8]
    }

    /// Payload of the stats report: `[Stats tag, four 16-bit BE tallies]`.
    pub fn stats_payload(&self) -> [u8; STATS_PAYLOAD_LEN] {
        let [system, updater, uart, i2c] = self.tallies;
        [
            ErrorFamily::Stats.tag(),
            (system >> 8) as u8,
            system as u8,
            (updater >> 8) as u8,
            updater as u8,
            (uart >> 8) as u8,
            uart as u8,
            (i2c >> 8) as u8,
            i2c as u8,
        ]
    }
}

impl Default for ErrorRouter {
    fn default() -> Self {
        Self::new()
    }
}
