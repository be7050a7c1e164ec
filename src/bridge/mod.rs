//! Bridge supervisor.
//!
//! The top-level state machine wires everything together: it brings up the
//! host link, pulses the slave reset line, activates one of the two
//! mutually exclusive modes over the shared arena and then drives the
//! steady-state rotation -- UART RX, I2C, UART TX, each with its
//! millisecond budget. Mode changes and software resets are requests
//! latched by host commands (or the application) and observed only between
//! ticks, never inside an in-flight I2C transaction.

pub mod error;

use core::mem;

use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_nb::serial::{Read, Write};

use self::error::{ErrorFamily, ErrorReply, ErrorRouter};
use crate::arena::Arena;
use crate::i2c::bus::I2cBus;
use crate::i2c::error::{Callsite, CommStatus};
use crate::i2c::master::I2cTranslator;
use crate::i2c::updater::{I2cUpdater, UPDATER_RX_BUFFER_SIZE};
use crate::i2c::ResponseSink;
use crate::irq::TouchIrq;
use crate::time::{Alarm, AlarmKind, Clock};
use crate::uart::command::CommandActions;
use crate::uart::{UartEngine, UpdaterUartEngine};

/// Firmware major version (`v` command).
pub const FW_VERSION_MAJOR: u16 = 1;
/// Firmware minor version (`v` command).
pub const FW_VERSION_MINOR: u16 = 4;
/// Firmware update counter (`v` command).
pub const FW_VERSION_UPDATE: u16 = 0;
/// Major version in the original 6-byte layout (`V` command).
pub const LEGACY_VERSION_MAJOR: u8 = 1;
/// Minor version in the original 6-byte layout (`V` command).
pub const LEGACY_VERSION_MINOR: u8 = 4;
/// Host link baud rate, reported by the `V` command.
pub const HOST_UART_BAUD: u32 = 1_000_000;

const fn max_words(a: usize, b: usize) -> usize {
    if a > b {
        a
    } else {
        b
    }
}

/// Arena words needed for whichever mode is larger.
pub const BRIDGE_ARENA_WORDS: usize = max_words(
    UartEngine::HEAP_WORDS + I2cTranslator::HEAP_WORDS,
    UpdaterUartEngine::HEAP_WORDS + I2cUpdater::HEAP_WORDS,
);

/// Steady-state budgets, in the order the rotation runs them.
const RX_BUDGET_MS: u32 = 2;
const I2C_BUDGET_MS: u32 = 5;
const TX_BUDGET_MS: u32 = 3;

/// How long the slave reset line is held low.
const SLAVE_RESET_MS: u32 = 100;
/// Interval between diagnostics from a failed terminal state.
const FAILED_DIAG_INTERVAL_MS: u32 = 5000;
/// Per-transfer completion budget in updater mode.
const UPDATER_XFER_TIMEOUT_MS: u32 = 50;
/// Per-byte retry bound for the direct diagnostic writes.
const DIAG_WRITE_RETRIES: u32 = 5000;

/// Supervisor states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BridgeState {
    /// Bring up the host framing engine.
    InitHostComm,
    /// Drive the slave reset line low.
    InitSlaveReset,
    /// Wait out the reset pulse.
    CheckSlaveResetComplete,
    /// Bring up the translator-mode I2C engine.
    InitSlaveTranslator,
    /// Steady state: translate between host and slave.
    SlaveTranslator,
    /// Bring up the updater-mode engines.
    InitSlaveUpdater,
    /// Steady state: pass frames through to the bootloader.
    SlaveUpdater,
    /// Terminal: the host link could not be activated.
    HostCommFailed,
    /// Terminal: translator activation failed.
    SlaveTranslatorFailed,
    /// Terminal: updater activation failed.
    SlaveUpdaterFailed,
}

/// Supervisor-level failure codes, carried in the status byte of a
/// system-family `E` frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BridgeError {
    /// Translator-mode activation or dispatch failed.
    TranslatorError = 1,
    /// Updater-mode activation or dispatch failed.
    UpdaterError = 2,
    /// The slave reset line could not be driven.
    SlaveResetFailed = 3,
    /// Engines and supervisor state disagreed.
    InvalidState = 4,
}

/// Pending mode-change request, observed between ticks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum ModeRequest {
    #[default]
    None,
    Translator,
    Updater,
    Reset,
}

/// Capability to reset the whole system.
pub trait SystemReset {
    /// Perform (or latch) a software reset.
    fn system_reset(&mut self);
}

/// Board description injected at construction.
pub struct BridgeConfig {
    /// Whether the slave reset line is actually wired on this board.
    pub reset_line_fitted: bool,
    /// Scratch arena capacity in words.
    pub arena_words: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self { reset_line_fitted: true, arena_words: BRIDGE_ARENA_WORDS }
    }
}

/// The hardware seams one tick needs, borrowed for the call.
pub struct BridgeIo<'a, B, S, RP, IP, R, C> {
    /// I2C controller driver.
    pub bus: &'a mut B,
    /// Host serial port.
    pub serial: &'a mut S,
    /// Slave reset line.
    pub reset_pin: &'a mut RP,
    /// Slave IRQ line.
    pub irq_pin: &'a mut IP,
    /// Flag set by the slave-IRQ ISR.
    pub irq: &'a TouchIrq,
    /// Software-reset capability.
    pub reset: &'a mut R,
    /// Millisecond clock.
    pub clock: &'a C,
}

enum HostComm {
    Inactive,
    Normal(UartEngine),
    Updater(UpdaterUartEngine),
}

enum SlaveComm {
    Inactive,
    Translator(I2cTranslator),
    Updater(I2cUpdater),
}

/// The bridge supervisor.
pub struct Bridge {
    config: BridgeConfig,
    arena: Arena,
    state: BridgeState,
    host: HostComm,
    slave: SlaveComm,
    router: ErrorRouter,
    reset_alarm: Alarm,
    diag_alarm: Alarm,
    request: ModeRequest,
    updater_relay: Option<([u8; UPDATER_RX_BUFFER_SIZE], usize)>,
}

impl Bridge {
    /// A bridge ready to boot through `InitHostComm`.
    pub fn new(config: BridgeConfig) -> Self {
        let arena = Arena::new(config.arena_words);
        Self {
            config,
            arena,
            state: BridgeState::InitHostComm,
            host: HostComm::Inactive,
            slave: SlaveComm::Inactive,
            router: ErrorRouter::new(),
            reset_alarm: Alarm::new(),
            diag_alarm: Alarm::new(),
            request: ModeRequest::None,
            updater_relay: None,
        }
    }

    /// Current supervisor state.
    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// The error router (mode, tallies).
    pub fn router_mut(&mut self) -> &mut ErrorRouter {
        &mut self.router
    }

    /// Ask for translator mode at the next tick boundary.
    pub fn request_translator(&mut self) {
        self.request = ModeRequest::Translator;
    }

    /// Ask for updater mode at the next tick boundary.
    pub fn request_updater(&mut self) {
        self.request = ModeRequest::Updater;
    }

    /// Ask for a software reset at the next tick boundary.
    pub fn request_reset(&mut self) {
        self.request = ModeRequest::Reset;
    }

    fn deactivate_all(&mut self) {
        // Every claim in play came from this bridge's own arena, so a
        // release can only fail if that single-owner discipline broke.
        match mem::replace(&mut self.host, HostComm::Inactive) {
            HostComm::Inactive => {}
            HostComm::Normal(engine) => engine
                .deactivate(&mut self.arena)
                .expect("claim always matches the bridge's own arena"),
            HostComm::Updater(engine) => engine
                .deactivate(&mut self.arena)
                .expect("claim always matches the bridge's own arena"),
        }
        match mem::replace(&mut self.slave, SlaveComm::Inactive) {
            SlaveComm::Inactive => {}
            SlaveComm::Translator(engine) => engine
                .deactivate(&mut self.arena)
                .expect("claim always matches the bridge's own arena"),
            SlaveComm::Updater(engine) => engine
                .deactivate(&mut self.arena)
                .expect("claim always matches the bridge's own arena"),
        }
    }

    /// Record a supervisor failure and enter `failed_state`.
    fn fail(&mut self, clock: &impl Clock, failed_state: BridgeState, code: BridgeError) {
        error!("bridge entering failed state: {}", code as u8);
        let reply = self.router.report(
            ErrorFamily::System,
            CommStatus::from_bits(code as u8),
            Callsite::new(),
        );
        if let (HostComm::Normal(uart), ErrorReply::Frame(_) | ErrorReply::LegacyCommand(_)) =
            (&mut self.host, reply)
        {
            uart.send_error_reply(reply);
        }
        self.state = failed_state;
        // Duration zero: the first diagnostic goes out on the next tick.
        self.diag_alarm.arm(clock, 0, AlarmKind::ContinuousNotification);
    }

    fn handle_request(&mut self, reset: &mut impl SystemReset) {
        match mem::take(&mut self.request) {
            ModeRequest::None => {}
            ModeRequest::Reset => {
                info!("software reset requested");
                self.deactivate_all();
                reset.system_reset();
                self.state = BridgeState::InitHostComm;
            }
            ModeRequest::Updater => {
                if self.state == BridgeState::SlaveTranslator {
                    self.deactivate_all();
                    self.state = BridgeState::InitSlaveUpdater;
                }
            }
            ModeRequest::Translator => {
                if self.state == BridgeState::SlaveUpdater {
                    self.deactivate_all();
                    self.state = BridgeState::InitHostComm;
                }
            }
        }
    }

    /// Run one supervisor tick.
    pub fn process<B, S, RP, IP, R, C>(&mut self, io: &mut BridgeIo<'_, B, S, RP, IP, R, C>)
    where
        B: I2cBus,
        S: Read<u8> + Write<u8>,
        RP: OutputPin,
        IP: InputPin,
        R: SystemReset,
        C: Clock,
    {
        self.handle_request(io.reset);

        match self.state {
            BridgeState::InitHostComm => match UartEngine::activate(&mut self.arena) {
                Ok(engine) => {
                    self.host = HostComm::Normal(engine);
                    self.state = BridgeState::InitSlaveReset;
                }
                Err(_) => self.fail(io.clock, BridgeState::HostCommFailed, BridgeError::TranslatorError),
            },

            BridgeState::InitSlaveReset => {
                if self.config.reset_line_fitted {
                    if io.reset_pin.set_low().is_err() {
                        self.fail(
                            io.clock,
                            BridgeState::SlaveTranslatorFailed,
                            BridgeError::SlaveResetFailed,
                        );
                        return;
                    }
                    self.reset_alarm
                        .arm(io.clock, SLAVE_RESET_MS, AlarmKind::SingleNotification);
                }
                self.state = BridgeState::CheckSlaveResetComplete;
            }

            BridgeState::CheckSlaveResetComplete => {
                if !self.reset_alarm.is_armed() || self.reset_alarm.has_elapsed(io.clock) {
                    if self.config.reset_line_fitted && io.reset_pin.set_high().is_err() {
                        self.fail(
                            io.clock,
                            BridgeState::SlaveTranslatorFailed,
                            BridgeError::SlaveResetFailed,
                        );
                        return;
                    }
                    self.state = BridgeState::InitSlaveTranslator;
                }
            }

            BridgeState::InitSlaveTranslator => match I2cTranslator::activate(&mut self.arena) {
                Ok(engine) => {
                    self.slave = SlaveComm::Translator(engine);
                    self.state = BridgeState::SlaveTranslator;
                    info!("bridge in translator mode");
                }
                Err(_) => {
                    self.deactivate_all();
                    self.fail(
                        io.clock,
                        BridgeState::SlaveTranslatorFailed,
                        BridgeError::TranslatorError,
                    );
                }
            },

            BridgeState::SlaveTranslator => self.translator_tick(io),

            BridgeState::InitSlaveUpdater => {
                let uart = UpdaterUartEngine::activate(&mut self.arena);
                let i2c = I2cUpdater::activate(&mut self.arena);
                match (uart, i2c) {
                    (Ok(uart), Ok(i2c)) => {
                        self.host = HostComm::Updater(uart);
                        self.slave = SlaveComm::Updater(i2c);
                        self.state = BridgeState::SlaveUpdater;
                        info!("bridge in updater mode");
                    }
                    (uart, i2c) => {
                        if let Ok(engine) = uart {
                            engine
                                .deactivate(&mut self.arena)
                                .expect("claim always matches the bridge's own arena");
                        }
                        if let Ok(engine) = i2c {
                            engine
                                .deactivate(&mut self.arena)
                                .expect("claim always matches the bridge's own arena");
                        }
                        self.fail(
                            io.clock,
                            BridgeState::SlaveUpdaterFailed,
                            BridgeError::UpdaterError,
                        );
                    }
                }
            }

            BridgeState::SlaveUpdater => self.updater_tick(io),

            BridgeState::HostCommFailed => {
                self.failed_tick(io, b"bridge: host comm init failed\r\n")
            }
            BridgeState::SlaveTranslatorFailed => {
                self.failed_tick(io, b"bridge: translator init failed\r\n")
            }
            BridgeState::SlaveUpdaterFailed => {
                self.failed_tick(io, b"bridge: updater init failed\r\n")
            }
        }
    }

    /// One steady-state translator rotation: host RX, slave comm, host TX.
    fn translator_tick<B, S, RP, IP, R, C>(&mut self, io: &mut BridgeIo<'_, B, S, RP, IP, R, C>)
    where
        B: I2cBus,
        S: Read<u8> + Write<u8>,
        RP: OutputPin,
        IP: InputPin,
        R: SystemReset,
        C: Clock,
    {
        let engines_matched = match (&mut self.host, &mut self.slave) {
            (HostComm::Normal(uart), SlaveComm::Translator(i2c)) => {
                uart.pump(io.clock, io.serial);

                let mut actions = TranslatorActions {
                    i2c: &mut *i2c,
                    bus: &mut *io.bus,
                    clock: io.clock,
                    request: &mut self.request,
                };
                uart.process_rx(io.clock, &mut actions, &mut self.router, RX_BUDGET_MS);

                let mut sink = HostSink { uart: &mut *uart, router: &mut self.router };
                let _ = i2c.process(io.bus, io.irq_pin, io.irq, io.clock, &mut sink, I2C_BUDGET_MS);

                #[cfg(feature = "lockup-recovery")]
                if i2c.reset_requested() {
                    self.request = ModeRequest::Reset;
                }

                uart.process_tx(io.clock, io.serial, TX_BUDGET_MS);
                true
            }
            _ => false,
        };
        if !engines_matched {
            self.fail(io.clock, BridgeState::SlaveTranslatorFailed, BridgeError::InvalidState);
        }
    }

    /// One updater rotation: host RX, lockstep relay, host TX.
    fn updater_tick<B, S, RP, IP, R, C>(&mut self, io: &mut BridgeIo<'_, B, S, RP, IP, R, C>)
    where
        B: I2cBus,
        S: Read<u8> + Write<u8>,
        RP: OutputPin,
        IP: InputPin,
        R: SystemReset,
        C: Clock,
    {
        let engines_matched = match (&mut self.host, &mut self.slave) {
            (HostComm::Updater(uart), SlaveComm::Updater(i2c)) => {
                uart.pump(io.clock, io.serial);

                let mut actions = UpdaterActions {
                    i2c: &mut *i2c,
                    bus: &mut *io.bus,
                    clock: io.clock,
                    request: &mut self.request,
                    relay: &mut self.updater_relay,
                };
                uart.process_rx(io.clock, &mut actions, &mut self.router, RX_BUDGET_MS);

                if let Some((buffer, len)) = self.updater_relay.take() {
                    uart.relay_slave_data(&buffer[..len]);
                }

                uart.process_tx(io.clock, io.serial, TX_BUDGET_MS);
                true
            }
            _ => false,
        };
        if !engines_matched {
            self.fail(io.clock, BridgeState::SlaveUpdaterFailed, BridgeError::InvalidState);
        }
    }

    /// Terminal states only emit a periodic diagnostic line.
    fn failed_tick<B, S, RP, IP, R, C>(
        &mut self,
        io: &mut BridgeIo<'_, B, S, RP, IP, R, C>,
        message: &[u8],
    ) where
        B: I2cBus,
        S: Read<u8> + Write<u8>,
        RP: OutputPin,
        IP: InputPin,
        R: SystemReset,
        C: Clock,
    {
        if self.diag_alarm.has_elapsed(io.clock) {
            emit_diag(io.serial, message);
            self.diag_alarm
                .arm(io.clock, FAILED_DIAG_INTERVAL_MS, AlarmKind::ContinuousNotification);
        }
    }
}

/// Write an ASCII diagnostic straight to the driver with a bounded retry
/// per byte; failed states cannot rely on an active TX queue.
fn emit_diag<S: Write<u8>>(serial: &mut S, message: &[u8]) {
    for &byte in message {
        let mut retries = 0;
        loop {
            match serial.write(byte) {
                Ok(()) => break,
                Err(nb::Error::WouldBlock) => {
                    retries += 1;
                    if retries > DIAG_WRITE_RETRIES {
                        return;
                    }
                }
                Err(nb::Error::Other(_)) => return,
            }
        }
    }
}

/// Dispatcher capabilities while the bridge translates.
struct TranslatorActions<'a, B: I2cBus, C: Clock> {
    i2c: &'a mut I2cTranslator,
    bus: &'a mut B,
    clock: &'a C,
    request: &'a mut ModeRequest,
}

impl<B: I2cBus, C: Clock> CommandActions for TranslatorActions<'_, B, C> {
    fn queue_slave_write(&mut self, address: u8, data: &[u8]) -> Result<(), CommStatus> {
        self.i2c.queue_write(address, data)
    }

    fn queue_slave_read(&mut self, address: u8, len: u8) -> Result<(), CommStatus> {
        self.i2c.queue_read(address, len)
    }

    fn set_slave_address(&mut self, address: u8) -> Result<(), CommStatus> {
        self.i2c.set_slave_address(address)
    }

    fn ack_probe(&mut self, address: Option<u8>) -> Result<(), CommStatus> {
        self.i2c.ack_probe(self.bus, self.clock, address)
    }

    fn last_callsite(&self) -> Callsite {
        self.i2c.callsite()
    }

    fn request_updater(&mut self) {
        *self.request = ModeRequest::Updater;
    }

    fn request_reset(&mut self) {
        *self.request = ModeRequest::Reset;
    }
}

/// Dispatcher capabilities while the bridge reflashes the slave. All
/// transfers target the bootloader; reads are relayed after dispatch,
/// one outstanding read at a time (the bootloader flow is lockstep).
struct UpdaterActions<'a, B: I2cBus, C: Clock> {
    i2c: &'a mut I2cUpdater,
    bus: &'a mut B,
    clock: &'a C,
    request: &'a mut ModeRequest,
    relay: &'a mut Option<([u8; UPDATER_RX_BUFFER_SIZE], usize)>,
}

impl<B: I2cBus, C: Clock> CommandActions for UpdaterActions<'_, B, C> {
    fn queue_slave_write(&mut self, _address: u8, data: &[u8]) -> Result<(), CommStatus> {
        self.i2c.write(self.bus, self.clock, data, UPDATER_XFER_TIMEOUT_MS)
    }

    fn queue_slave_read(&mut self, _address: u8, len: u8) -> Result<(), CommStatus> {
        let data = self.i2c.read(self.bus, self.clock, len as usize, UPDATER_XFER_TIMEOUT_MS)?;
        let mut buffer = [0u8; UPDATER_RX_BUFFER_SIZE];
        buffer[..data.len()].copy_from_slice(data);
        *self.relay = Some((buffer, data.len()));
        Ok(())
    }

    fn set_slave_address(&mut self, _address: u8) -> Result<(), CommStatus> {
        // The translator module owns the address plan and is deactivated
        // while the updater holds the arena.
        let mut status = CommStatus::ok();
        status.set_deactivated();
        Err(status)
    }

    fn ack_probe(&mut self, address: Option<u8>) -> Result<(), CommStatus> {
        let target = address.unwrap_or(self.i2c.bootloader_address());
        self.bus.probe(target).map_err(|fault| {
            let mut status = CommStatus::ok();
            status.record_fault(fault);
            status
        })
    }

    fn last_callsite(&self) -> Callsite {
        Callsite::new()
    }

    fn error_family(&self) -> ErrorFamily {
        ErrorFamily::Updater
    }

    fn request_updater(&mut self) {}

    fn request_reset(&mut self) {
        *self.request = ModeRequest::Reset;
    }
}

/// Routes slave data and comm errors into the host TX queue.
struct HostSink<'a> {
    uart: &'a mut UartEngine,
    router: &'a mut ErrorRouter,
}

impl ResponseSink for HostSink<'_> {
    fn on_slave_data(&mut self, data: &[u8]) {
        if !self.uart.relay_slave_data(data) {
            warn!("host tx queue full, slave data dropped");
        }
    }

    fn on_error(&mut self, status: CommStatus, callsite: Callsite) {
        let reply = self.router.report(ErrorFamily::I2c, status, callsite);
        self.uart.send_error_reply(reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{CountingReset, FakeClock, FakePin, LoopSerial, ScriptedBus};

    struct Rig {
        bus: ScriptedBus,
        serial: LoopSerial,
        reset_pin: FakePin,
        irq_pin: FakePin,
        irq: TouchIrq,
        clock: FakeClock,
        reset: CountingReset,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                bus: ScriptedBus::new(),
                serial: LoopSerial::new(),
                reset_pin: FakePin::new(true),
                irq_pin: FakePin::new(false),
                irq: TouchIrq::new(),
                clock: FakeClock::new(),
                reset: CountingReset::default(),
            }
        }

        fn tick(&mut self, bridge: &mut Bridge) {
            let mut io = BridgeIo {
                bus: &mut self.bus,
                serial: &mut self.serial,
                reset_pin: &mut self.reset_pin,
                irq_pin: &mut self.irq_pin,
                irq: &self.irq,
                reset: &mut self.reset,
                clock: &self.clock,
            };
            bridge.process(&mut io);
        }

        /// Drive a fresh bridge through boot into translator mode.
        fn boot(&mut self, bridge: &mut Bridge) {
            self.tick(bridge);
            self.tick(bridge);
            self.clock.advance(SLAVE_RESET_MS);
            self.tick(bridge);
            self.tick(bridge);
            assert_eq!(bridge.state(), BridgeState::SlaveTranslator);
        }
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn boot_pulses_the_slave_reset_line() {
        let mut rig = Rig::new();
        let mut bridge = Bridge::new(BridgeConfig::default());
        rig.boot(&mut bridge);
        assert_eq!(rig.reset_pin.history, vec![false, true]);
    }

    #[test]
    fn missing_reset_line_skips_the_pulse() {
        let mut rig = Rig::new();
        let mut bridge =
            Bridge::new(BridgeConfig { reset_line_fitted: false, ..BridgeConfig::default() });
        rig.tick(&mut bridge);
        rig.tick(&mut bridge);
        rig.tick(&mut bridge);
        rig.tick(&mut bridge);
        assert_eq!(bridge.state(), BridgeState::SlaveTranslator);
        assert!(rig.reset_pin.history.is_empty());
    }

    #[test]
    fn ack_round_trips_through_the_whole_bridge() {
        let mut rig = Rig::new();
        let mut bridge = Bridge::new(BridgeConfig::default());
        rig.boot(&mut bridge);

        rig.serial.feed(&[0xAA, 0x41, 0xAA]);
        rig.tick(&mut bridge);
        assert_eq!(rig.serial.sent, vec![0xAA, 0x55, 0x55, 0x41, 0xAA]);
    }

    #[test]
    fn host_write_command_reaches_the_slave() {
        let mut rig = Rig::new();
        let mut bridge = Bridge::new(BridgeConfig::default());
        rig.boot(&mut bridge);

        rig.serial.feed(&[0xAA, 0x57, 0x48, 0x01, 0x02, 0x03, 0xAA]);
        rig.tick(&mut bridge);
        assert_eq!(rig.bus.writes(), &[(0x48, vec![0x01, 0x02, 0x03])]);
    }

    #[test]
    fn slave_response_is_reframed_for_the_host() {
        let mut rig = Rig::new();
        let mut bridge = Bridge::new(BridgeConfig::default());
        rig.boot(&mut bridge);

        rig.irq_pin.set(true);
        rig.irq.set();
        rig.bus.push_read_data(&[0x81, 0x03]);
        rig.bus.push_read_data(&[0x81, 0x03, 0xAA, 0xBB, 0xCC]);
        rig.tick(&mut bridge);

        // 0xAA in the payload arrives byte-stuffed.
        assert_eq!(
            rig.serial.sent,
            vec![0xAA, 0x81, 0x03, 0x55, 0xAA, 0xBB, 0xCC, 0xAA]
        );
    }

    #[test]
    fn legacy_version_wire_bytes_are_frozen() {
        let mut rig = Rig::new();
        let mut bridge = Bridge::new(BridgeConfig::default());
        rig.boot(&mut bridge);

        rig.serial.feed(&[0xAA, 0x56, 0xAA]);
        rig.tick(&mut bridge);
        assert_eq!(
            rig.serial.sent,
            vec![0xAA, 0x55, 0x55, 0x56, 0x01, 0x04, 0x00, 0x0F, 0x42, 0x40, 0xAA]
        );
    }

    #[test]
    fn error_mode_switch_is_acknowledged() {
        let mut rig = Rig::new();
        let mut bridge = Bridge::new(BridgeConfig::default());
        rig.boot(&mut bridge);

        rig.serial.feed(&[0xAA, 0x45, 0x01, 0xAA]);
        rig.tick(&mut bridge);
        assert_eq!(
            rig.serial.sent,
            vec![0xAA, 0x55, 0x55, 0x45, 0x04, 0x01, 0xAA]
        );
        assert_eq!(bridge.router_mut().mode(), error::ErrorMode::Global);
    }

    #[test]
    fn updater_mode_switches_arena_layout_and_passes_through() {
        let mut rig = Rig::new();
        let mut bridge = Bridge::new(BridgeConfig::default());
        rig.boot(&mut bridge);

        // Legacy B command requests updater mode; the switch happens on the
        // next tick boundary.
        rig.serial.feed(&[0xAA, 0x42, 0xAA]);
        rig.tick(&mut bridge);
        assert_eq!(bridge.state(), BridgeState::SlaveTranslator);
        rig.tick(&mut bridge);
        assert_eq!(bridge.state(), BridgeState::SlaveUpdater);

        // Writes now land on the bootloader address regardless of the
        // address byte in the frame.
        rig.serial.feed(&[0xAA, 0x57, 0x00, 0x10, 0x20, 0xAA]);
        rig.tick(&mut bridge);
        assert_eq!(rig.bus.writes(), &[(0x58, vec![0x10, 0x20])]);

        // Read-backs are relayed unparsed.
        rig.bus.push_read_data(&[0xCA, 0xFE]);
        rig.serial.feed(&[0xAA, 0x52, 0x00, 0x02, 0xAA]);
        rig.tick(&mut bridge);
        assert!(contains(&rig.serial.sent, &[0xAA, 0xCA, 0xFE, 0xAA]));

        // And the bridge can come back to translator mode.
        bridge.request_translator();
        rig.tick(&mut bridge);
        rig.tick(&mut bridge);
        rig.clock.advance(SLAVE_RESET_MS);
        rig.tick(&mut bridge);
        rig.tick(&mut bridge);
        assert_eq!(bridge.state(), BridgeState::SlaveTranslator);
    }

    #[test]
    fn reset_command_invokes_the_system_reset() {
        let mut rig = Rig::new();
        let mut bridge = Bridge::new(BridgeConfig::default());
        rig.boot(&mut bridge);

        rig.serial.feed(&[0xAA, 0x72, 0xAA]);
        rig.tick(&mut bridge);
        assert_eq!(rig.reset.count, 0);
        rig.tick(&mut bridge);
        assert_eq!(rig.reset.count, 1);
    }

    #[test]
    fn starved_arena_lands_in_host_comm_failed() {
        let mut rig = Rig::new();
        let mut bridge =
            Bridge::new(BridgeConfig { arena_words: 4, ..BridgeConfig::default() });

        rig.tick(&mut bridge);
        assert_eq!(bridge.state(), BridgeState::HostCommFailed);

        rig.tick(&mut bridge);
        assert!(contains(&rig.serial.sent, b"host comm init failed"));
        let first_len = rig.serial.sent.len();

        // No spam between intervals, another line after 5 s.
        rig.tick(&mut bridge);
        assert_eq!(rig.serial.sent.len(), first_len);
        rig.clock.advance(FAILED_DIAG_INTERVAL_MS);
        rig.tick(&mut bridge);
        assert_eq!(rig.serial.sent.len(), first_len * 2);
    }

    #[test]
    fn arena_capacity_covers_both_modes() {
        assert!(BRIDGE_ARENA_WORDS >= UartEngine::HEAP_WORDS + I2cTranslator::HEAP_WORDS);
        assert!(BRIDGE_ARENA_WORDS >= UpdaterUartEngine::HEAP_WORDS + I2cUpdater::HEAP_WORDS);
    }
}
