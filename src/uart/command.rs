//! Bridge command alphabet and dispatch.
//!
//! The first body byte of every decoded frame is a one-letter command;
//! the rest is its binary payload. Dispatch turns commands into queued
//! slave transfers, probes, mode changes and immediate framed responses.
//! Whatever it needs outside the UART engine goes through the
//! [`CommandActions`] capability, implemented by the supervisor.

use super::frame::FrameEncoder;
use crate::bridge::error::{ErrorFamily, ErrorMode, ErrorReply, ErrorRouter};
use crate::bridge::{
    FW_VERSION_MAJOR, FW_VERSION_MINOR, FW_VERSION_UPDATE, HOST_UART_BAUD, LEGACY_VERSION_MAJOR,
    LEGACY_VERSION_MINOR,
};
use crate::i2c::error::{Callsite, CommStatus};
use crate::queue::RegionQueue;

/// The one-byte command alphabet.
///
/// The framing reserves `0xAA` and `0x55`; every code here is plain ASCII
/// so none can collide with them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Command {
    /// Liveness check, echoed back.
    Ack = b'A',
    /// Legacy request to enter updater mode.
    SlaveUpdate = b'B',
    /// Error-mode set/get plus the stats sub-commands.
    ErrorMode = b'E',
    /// Select the slave address.
    SlaveAddress = b'I',
    /// Slave NAK report (bridge to host only).
    SlaveNak = b'N',
    /// Queue a slave read.
    SlaveRead = b'R',
    /// Slave timeout report (bridge to host only).
    SlaveTimeout = b'T',
    /// Version in the original 6-byte layout.
    LegacyVersion = b'V',
    /// Queue a slave write.
    SlaveWrite = b'W',
    /// Blocking ACK probe of the slave.
    SlaveAck = b'a',
    /// Software reset.
    Reset = b'r',
    /// Version as three 16-bit values.
    Version = b'v',
}

impl Command {
    /// Map a wire byte onto the alphabet.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            b'A' => Command::Ack,
            b'B' => Command::SlaveUpdate,
            b'E' => Command::ErrorMode,
            b'I' => Command::SlaveAddress,
            b'N' => Command::SlaveNak,
            b'R' => Command::SlaveRead,
            b'T' => Command::SlaveTimeout,
            b'V' => Command::LegacyVersion,
            b'W' => Command::SlaveWrite,
            b'a' => Command::SlaveAck,
            b'r' => Command::Reset,
            b'v' => Command::Version,
            _ => return None,
        })
    }

    /// The wire byte.
    pub fn byte(self) -> u8 {
        self as u8
    }
}

/// Everything the dispatcher can trigger outside the UART engine.
pub trait CommandActions {
    /// Queue a write transfer toward the slave.
    fn queue_slave_write(&mut self, address: u8, data: &[u8]) -> Result<(), CommStatus>;

    /// Queue a read transfer toward the slave.
    fn queue_slave_read(&mut self, address: u8, len: u8) -> Result<(), CommStatus>;

    /// Select the slave address.
    fn set_slave_address(&mut self, address: u8) -> Result<(), CommStatus>;

    /// Blocking 2 ms ACK probe of `address` (or the current slave).
    fn ack_probe(&mut self, address: Option<u8>) -> Result<(), CommStatus>;

    /// Callsite of the most recent slave-side operation, for error frames.
    fn last_callsite(&self) -> Callsite;

    /// Family tag slave-side failures are reported under.
    fn error_family(&self) -> ErrorFamily {
        ErrorFamily::I2c
    }

    /// The host asked for updater mode.
    fn request_updater(&mut self);

    /// The host asked for a software reset.
    fn request_reset(&mut self);
}

/// Enqueue a framed command response; the first scratch byte is the
/// command, the rest its payload.
pub(crate) fn respond<const N: usize, const CAP: usize>(
    tx: &mut RegionQueue<N, CAP, FrameEncoder>,
    command: u8,
    payload: &[u8],
) -> bool {
    let mut scratch = [0u8; 16];
    let len = payload.len() + 1;
    if len > scratch.len() {
        return false;
    }
    scratch[0] = command;
    scratch[1..len].copy_from_slice(payload);
    if let Some(encoder) = tx.transform_mut() {
        encoder.set_command_pending();
    }
    tx.enqueue(&scratch[..len])
}

/// Send whatever the router decided an error looks like on the wire.
pub(crate) fn send_error_reply<const N: usize, const CAP: usize>(
    tx: &mut RegionQueue<N, CAP, FrameEncoder>,
    reply: ErrorReply,
) {
    match reply {
        ErrorReply::None => {}
        ErrorReply::LegacyCommand(command) => {
            respond(tx, command, &[]);
        }
        ErrorReply::Frame(payload) => {
            respond(tx, Command::ErrorMode.byte(), &payload);
        }
    }
}

fn route_slave_result<const N: usize, const CAP: usize>(
    result: Result<(), CommStatus>,
    tx: &mut RegionQueue<N, CAP, FrameEncoder>,
    actions: &mut impl CommandActions,
    router: &mut ErrorRouter,
) {
    if let Err(status) = result {
        let reply = router.report(actions.error_family(), status, actions.last_callsite());
        send_error_reply(tx, reply);
    }
}

fn report_uart_misuse<const N: usize, const CAP: usize>(
    tx: &mut RegionQueue<N, CAP, FrameEncoder>,
    router: &mut ErrorRouter,
) {
    let mut status = CommStatus::ok();
    status.set_invalid_input();
    let reply = router.report(ErrorFamily::Uart, status, Callsite::new());
    send_error_reply(tx, reply);
}

fn handle_error_mode<const N: usize, const CAP: usize>(
    payload: &[u8],
    tx: &mut RegionQueue<N, CAP, FrameEncoder>,
    router: &mut ErrorRouter,
) {
    match payload.first() {
        None => {}
        Some(0x00) => router.set_mode(ErrorMode::Legacy),
        Some(0xFE) => {
            respond(tx, Command::ErrorMode.byte(), &router.stats_payload());
            return;
        }
        Some(0xFF) => {
            router.clear_tallies();
            respond(tx, Command::ErrorMode.byte(), &router.stats_payload());
            return;
        }
        Some(_) => router.set_mode(ErrorMode::Global),
    }
    respond(tx, Command::ErrorMode.byte(), &router.mode_payload());
}

/// Act on one decoded frame.
pub(crate) fn dispatch<const N: usize, const CAP: usize>(
    frame: &[u8],
    tx: &mut RegionQueue<N, CAP, FrameEncoder>,
    actions: &mut impl CommandActions,
    router: &mut ErrorRouter,
) {
    let Some((&raw, payload)) = frame.split_first() else {
        return;
    };
    let Some(command) = Command::from_byte(raw) else {
        trace!("unknown host command {:02x}", raw);
        report_uart_misuse(tx, router);
        return;
    };

    match command {
        Command::Ack => {
            respond(tx, Command::Ack.byte(), &[]);
        }

        Command::SlaveUpdate => actions.request_updater(),

        Command::ErrorMode => handle_error_mode(payload, tx, router),

        Command::SlaveAddress => match payload.first() {
            Some(&address) => {
                route_slave_result(actions.set_slave_address(address), tx, actions, router)
            }
            None => report_uart_misuse(tx, router),
        },

        // Bridge-to-host notifications; nothing to do when a host sends
        // them anyway.
        Command::SlaveNak | Command::SlaveTimeout => {}

        Command::SlaveRead => match payload.first() {
            Some(&address) => {
                let len = payload.get(1).copied().unwrap_or(1);
                route_slave_result(actions.queue_slave_read(address, len), tx, actions, router);
            }
            None => report_uart_misuse(tx, router),
        },

        Command::LegacyVersion => {
            let baud = HOST_UART_BAUD.to_be_bytes();
            respond(
                tx,
                Command::LegacyVersion.byte(),
                &[
                    LEGACY_VERSION_MAJOR,
                    LEGACY_VERSION_MINOR,
                    baud[0],
                    baud[1],
                    baud[2],
                    baud[3],
                ],
            );
        }

        Command::SlaveWrite => match payload.split_first() {
            Some((&address, data)) => {
                route_slave_result(actions.queue_slave_write(address, data), tx, actions, router);
            }
            None => report_uart_misuse(tx, router),
        },

        Command::SlaveAck => {
            let target = payload.first().copied();
            match actions.ack_probe(target) {
                Ok(()) => {
                    respond(tx, Command::SlaveAck.byte(), &[]);
                }
                Err(status) => {
                    let reply = router.report(actions.error_family(), status, actions.last_callsite());
                    send_error_reply(tx, reply);
                }
            }
        }

        Command::Reset => actions.request_reset(),

        Command::Version => {
            let major = FW_VERSION_MAJOR.to_be_bytes();
            let minor = FW_VERSION_MINOR.to_be_bytes();
            let update = FW_VERSION_UPDATE.to_be_bytes();
            respond(
                tx,
                Command::Version.byte(),
                &[major[0], major[1], minor[0], minor[1], update[0], update[1]],
            );
        }
    }
}
