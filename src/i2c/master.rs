//! Translator-mode master engine.
//!
//! One cooperative state machine covers both data directions: the
//! IRQ-driven receive pipeline (slave raised its interrupt line, the
//! bridge switches to the response buffer, reads the header, reads the
//! payload, forwards it, clears the IRQ) and the host-transfer pipeline
//! (records queued by the UART dispatcher are dequeued and turned into raw
//! writes or reads). Every pipeline step waits for the controller to go
//! idle before issuing the next transaction, so a single [`I2cBus`]
//! suffices for the whole engine.

use embedded_hal::digital::InputPin;

use super::bus::{BusFault, I2cBus};
use super::error::{Callsite, CommStatus};
#[cfg(feature = "lockup-recovery")]
use super::lockup::LockupMonitor;
use super::{
    extended_timeout, ResponseSink, TransferDescriptor, TransferDirection, APP_ADDRESS,
    INVALID_PACKET_LENGTH, RESPONSE_BUFFER_OFFSET,
};
use crate::arena::{words_for, Arena, ArenaClaim, ArenaError};
use crate::irq::TouchIrq;
use crate::queue::RegionQueue;
use crate::time::{Alarm, AlarmKind, Clock};

/// Records the transfer queue can hold.
pub const XFER_QUEUE_RECORDS: usize = 8;
/// Arena bytes backing the transfer queue.
pub const XFER_QUEUE_BYTES: usize = 600;
/// Raw receive buffer size; covers the 2-byte header plus a maximal
/// payload.
pub const RX_BUFFER_SIZE: usize = 260;

/// Window for the blocking ACK probe.
const ACK_PROBE_MS: u32 = 2;
/// Clear-IRQ message: select the response buffer, reason byte zero.
const CLEAR_IRQ_MESSAGE: [u8; 2] = [RESPONSE_BUFFER_OFFSET, 0x00];

/// Public-entry ids for [`Callsite`] tracing.
mod entry {
    pub const PROCESS: u8 = 0x01;
    pub const QUEUE_WRITE: u8 = 0x02;
    pub const QUEUE_READ: u8 = 0x03;
    pub const SET_ADDRESS: u8 = 0x04;
    pub const ACK_PROBE: u8 = 0x05;
}

/// Low-level call ids for [`Callsite`] tracing.
mod driver_call {
    pub const WRITE: u8 = 0x1;
    pub const READ: u8 = 0x2;
    pub const PROBE: u8 = 0x3;
}

/// States of the comm FSM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum CommState {
    Waiting,
    RxPending,
    RxSwitchToResponseBuffer,
    RxReadLength,
    RxProcessLength,
    RxReadExtraData,
    RxProcessExtraData,
    RxClearIrq,
    RxCheckComplete,
    XferDequeueAndAct,
    XferRxCheckComplete,
    XferTxCheckComplete,
}

/// Translator-mode scratch: the host transfer queue plus the raw receive
/// buffer.
struct TranslatorHeap {
    xfer_queue: RegionQueue<XFER_QUEUE_RECORDS, XFER_QUEUE_BYTES>,
    rx_buffer: [u8; RX_BUFFER_SIZE],
}

/// The translator-mode I2C engine.
pub struct I2cTranslator {
    claim: ArenaClaim,
    heap: TranslatorHeap,
    state: CommState,
    slave_address: u8,
    /// The app confirmed (by a parseable header) that it serves its
    /// response buffer. Cleared by a NAK or a garbled header, which makes
    /// the next receive cycle re-issue the buffer switch.
    app_in_response_mode: bool,
    /// A forced switch-and-reread already ran within this receive cycle.
    retried_this_cycle: bool,
    pending_rx_size: usize,
    status: CommStatus,
    callsite: Callsite,
    timeout: Alarm,
    #[cfg(feature = "lockup-recovery")]
    lockup: LockupMonitor,
}

impl I2cTranslator {
    /// Arena words one activation claims.
    pub const HEAP_WORDS: usize = words_for::<TranslatorHeap>();

    /// Claim the translator heap from `arena` and start in `Waiting` with
    /// the application slave address selected.
    pub fn activate(arena: &mut Arena) -> Result<Self, ArenaError> {
        let claim = arena.claim(Self::HEAP_WORDS)?;
        debug!("i2c translator active, {} words", claim.words());
        Ok(Self {
            claim,
            heap: TranslatorHeap {
                xfer_queue: RegionQueue::new(),
                rx_buffer: [0; RX_BUFFER_SIZE],
            },
            state: CommState::Waiting,
            slave_address: APP_ADDRESS,
            app_in_response_mode: false,
            retried_this_cycle: false,
            pending_rx_size: 0,
            status: CommStatus::ok(),
            callsite: Callsite::new(),
            timeout: Alarm::new(),
            #[cfg(feature = "lockup-recovery")]
            lockup: LockupMonitor::new(),
        })
    }

    /// Return the claimed arena words and tear the engine down. Forces
    /// `Waiting` and disarms every alarm by construction.
    pub fn deactivate(self, arena: &mut Arena) -> Result<(), ArenaError> {
        arena.release(self.claim)
    }

    /// Currently selected 7-bit slave address.
    pub fn slave_address(&self) -> u8 {
        self.slave_address
    }

    /// Callsite of the most recent operation, for error frames.
    pub fn callsite(&self) -> Callsite {
        self.callsite
    }

    /// Select the slave address used by all subsequent transactions.
    pub fn set_slave_address(&mut self, address: u8) -> Result<(), CommStatus> {
        self.callsite.set_entry(entry::SET_ADDRESS);
        if address & 0x80 != 0 {
            let mut status = CommStatus::ok();
            status.set_invalid_input();
            return Err(status);
        }
        self.slave_address = address;
        self.app_in_response_mode = false;
        Ok(())
    }

    /// Records waiting on the transfer queue.
    pub fn queued_transfers(&self) -> usize {
        self.heap.xfer_queue.len()
    }

    /// Queue a host-initiated write of `data` to `address`.
    pub fn queue_write(&mut self, address: u8, data: &[u8]) -> Result<(), CommStatus> {
        self.callsite.set_entry(entry::QUEUE_WRITE);
        let mut status = CommStatus::ok();
        if address & 0x80 != 0 {
            status.set_invalid_input();
            return Err(status);
        }
        let descriptor = TransferDescriptor::new(address, TransferDirection::Write);
        let queue = &mut self.heap.xfer_queue;
        if !queue.enqueue_byte(descriptor.raw(), data.is_empty()) {
            queue.abort_partial();
            status.set_queue_full();
            return Err(status);
        }
        for (i, &byte) in data.iter().enumerate() {
            if !queue.enqueue_byte(byte, i == data.len() - 1) {
                queue.abort_partial();
                status.set_queue_full();
                return Err(status);
            }
        }
        Ok(())
    }

    /// Queue a host-initiated read of `len` bytes from `address`.
    pub fn queue_read(&mut self, address: u8, len: u8) -> Result<(), CommStatus> {
        self.callsite.set_entry(entry::QUEUE_READ);
        let mut status = CommStatus::ok();
        if address & 0x80 != 0 || len == 0 {
            status.set_invalid_input();
            return Err(status);
        }
        let descriptor = TransferDescriptor::new(address, TransferDirection::Read);
        if !self.heap.xfer_queue.enqueue(&[descriptor.raw(), len]) {
            status.set_queue_full();
            return Err(status);
        }
        Ok(())
    }

    /// Blocking ACK probe: address the slave (or `address` if given) and
    /// wait up to 2 ms for it to acknowledge.
    pub fn ack_probe(
        &mut self,
        bus: &mut impl I2cBus,
        clock: &impl Clock,
        address: Option<u8>,
    ) -> Result<(), CommStatus> {
        self.callsite.set_entry(entry::ACK_PROBE);
        self.callsite.set_driver_call(driver_call::PROBE);
        let target = address.unwrap_or(self.slave_address);
        let mut status = CommStatus::ok();
        let mut window = Alarm::new();
        window.arm(clock, ACK_PROBE_MS, AlarmKind::SingleNotification);
        loop {
            match bus.probe(target) {
                Ok(()) => {
                    #[cfg(feature = "lockup-recovery")]
                    self.lockup.on_success();
                    return Ok(());
                }
                Err(fault) => {
                    status.record_fault(fault);
                    #[cfg(feature = "lockup-recovery")]
                    if fault.is_busy_class() {
                        self.lockup.on_busy_fault(clock);
                    }
                }
            }
            if window.has_elapsed(clock) {
                status.set_timed_out();
                return Err(status);
            }
        }
    }

    /// Whether the bus is currently considered locked.
    #[cfg(feature = "lockup-recovery")]
    pub fn bus_locked(&self) -> bool {
        self.lockup.is_locked()
    }

    /// Whether lockup recovery gave up and wants a software reset.
    #[cfg(feature = "lockup-recovery")]
    pub fn reset_requested(&self) -> bool {
        self.lockup.reset_requested()
    }

    /// Drive the comm FSM until it returns to `Waiting` with no work left
    /// or `timeout_ms` expires (0 means unbounded).
    ///
    /// Slave data and error reports go to `sink`; the IRQ pin level plus
    /// the ISR-set `irq` flag gate the receive pipeline.
    pub fn process(
        &mut self,
        bus: &mut impl I2cBus,
        irq_pin: &mut impl InputPin,
        irq: &TouchIrq,
        clock: &impl Clock,
        sink: &mut impl ResponseSink,
        timeout_ms: u32,
    ) -> Result<(), CommStatus> {
        self.callsite.set_entry(entry::PROCESS);
        self.status = CommStatus::ok();
        if timeout_ms > 0 {
            self.timeout.arm(clock, timeout_ms, AlarmKind::SingleNotification);
        } else {
            self.timeout.disarm();
        }

        #[cfg(feature = "lockup-recovery")]
        if self.lockup.is_locked() {
            self.lockup.service(clock, bus, self.slave_address);
            if self.lockup.is_locked() {
                self.status.set_locked_bus();
                self.timeout.disarm();
                return Err(self.status);
            }
        }

        loop {
            let made_progress = self.step(bus, irq_pin, irq, clock, sink);
            if self.state == CommState::Waiting && !made_progress {
                break;
            }
            if self.timeout.has_elapsed(clock) {
                // Abandon whatever was half-read.
                self.status.set_timed_out();
                self.state = CommState::Waiting;
                break;
            }
        }

        self.timeout.disarm();
        if self.status.error_occurred() {
            sink.on_error(self.status, self.callsite);
            Err(self.status)
        } else {
            Ok(())
        }
    }

    /// One FSM step. Returns false when `Waiting` found nothing to do.
    fn step(
        &mut self,
        bus: &mut impl I2cBus,
        irq_pin: &mut impl InputPin,
        irq: &TouchIrq,
        clock: &impl Clock,
        sink: &mut impl ResponseSink,
    ) -> bool {
        match self.state {
            CommState::Waiting => {
                if matches!(irq_pin.is_high(), Ok(true)) && irq.is_set() {
                    self.state = CommState::RxPending;
                } else if !self.heap.xfer_queue.is_empty() {
                    self.state = CommState::XferDequeueAndAct;
                } else {
                    return false;
                }
            }

            CommState::RxPending => {
                irq.take();
                self.pending_rx_size = 2;
                self.retried_this_cycle = false;
                self.callsite.set_sub_call(0x1);
                if !self.app_in_response_mode {
                    self.state = CommState::RxSwitchToResponseBuffer;
                } else {
                    self.state = CommState::RxReadLength;
                }
            }

            CommState::RxSwitchToResponseBuffer => {
                if self.bus_ready(bus, clock) {
                    self.callsite.set_driver_call(driver_call::WRITE);
                    match bus.write(self.slave_address, &[RESPONSE_BUFFER_OFFSET]) {
                        Ok(()) => self.state = CommState::RxReadLength,
                        Err(fault) => self.abandon_rx(fault, clock),
                    }
                }
            }

            CommState::RxReadLength => {
                if self.bus_ready(bus, clock) {
                    self.callsite.set_driver_call(driver_call::READ);
                    match bus.read(self.slave_address, self.pending_rx_size) {
                        Ok(()) => self.state = CommState::RxProcessLength,
                        Err(fault) => self.abandon_rx(fault, clock),
                    }
                }
            }

            CommState::RxProcessLength => {
                if self.bus_ready(bus, clock) {
                    self.capture_rx(bus);
                    let command = self.heap.rx_buffer[0] & 0x7F;
                    let length = self.heap.rx_buffer[1];
                    if command == 0 || length == INVALID_PACKET_LENGTH {
                        self.app_in_response_mode = false;
                        if !self.retried_this_cycle {
                            // The app may still be serving its command
                            // buffer; force a switch and reread.
                            self.retried_this_cycle = true;
                            self.state = CommState::RxSwitchToResponseBuffer;
                        } else {
                            self.status.set_invalid_read();
                            self.state = CommState::RxClearIrq;
                        }
                    } else {
                        self.app_in_response_mode = true;
                        self.pending_rx_size = 2 + length as usize;
                        if length == 0 {
                            self.state = CommState::RxProcessExtraData;
                        } else {
                            self.timeout.snooze(extended_timeout(self.pending_rx_size));
                            self.state = CommState::RxReadExtraData;
                        }
                    }
                }
            }

            CommState::RxReadExtraData => {
                if self.bus_ready(bus, clock) {
                    self.callsite.set_driver_call(driver_call::READ);
                    match bus.read(self.slave_address, self.pending_rx_size) {
                        Ok(()) => self.state = CommState::RxProcessExtraData,
                        Err(fault) => self.abandon_rx(fault, clock),
                    }
                }
            }

            CommState::RxProcessExtraData => {
                if self.bus_ready(bus, clock) {
                    self.capture_rx(bus);
                    sink.on_slave_data(&self.heap.rx_buffer[..self.pending_rx_size]);
                    self.state = CommState::RxClearIrq;
                }
            }

            CommState::RxClearIrq => {
                if self.bus_ready(bus, clock) {
                    self.callsite.set_driver_call(driver_call::WRITE);
                    match bus.write(self.slave_address, &CLEAR_IRQ_MESSAGE) {
                        Ok(()) => self.state = CommState::RxCheckComplete,
                        Err(fault) => {
                            self.record_fault(fault, clock);
                            self.state = CommState::Waiting;
                        }
                    }
                }
            }

            CommState::RxCheckComplete => {
                if self.bus_ready(bus, clock) {
                    #[cfg(feature = "lockup-recovery")]
                    self.lockup.on_success();
                    self.state = CommState::Waiting;
                }
            }

            CommState::XferDequeueAndAct => {
                if self.bus_ready(bus, clock) {
                    self.callsite.set_sub_call(0x2);
                    self.dequeue_and_act(bus, clock);
                }
            }

            CommState::XferRxCheckComplete => {
                if self.bus_ready(bus, clock) {
                    self.capture_rx(bus);
                    sink.on_slave_data(&self.heap.rx_buffer[..self.pending_rx_size]);
                    #[cfg(feature = "lockup-recovery")]
                    self.lockup.on_success();
                    self.state = CommState::Waiting;
                }
            }

            CommState::XferTxCheckComplete => {
                if self.bus_ready(bus, clock) {
                    #[cfg(feature = "lockup-recovery")]
                    self.lockup.on_success();
                    self.state = CommState::Waiting;
                }
            }
        }
        true
    }

    /// Dequeue one transfer record and start the matching transaction.
    fn dequeue_and_act(&mut self, bus: &mut impl I2cBus, clock: &impl Clock) {
        let Some(record) = self.heap.xfer_queue.dequeue() else {
            self.state = CommState::Waiting;
            return;
        };
        let descriptor = TransferDescriptor::from_raw(record[0]);
        let address = descriptor.address();
        self.timeout.snooze(extended_timeout(record.len()));
        match descriptor.direction() {
            TransferDirection::Write => {
                self.callsite.set_driver_call(driver_call::WRITE);
                match bus.write(address, &record[1..]) {
                    Ok(()) => self.state = CommState::XferTxCheckComplete,
                    Err(fault) => {
                        self.record_fault(fault, clock);
                        self.state = CommState::Waiting;
                    }
                }
            }
            TransferDirection::Read => {
                let len = record.get(1).copied().unwrap_or(1) as usize;
                self.pending_rx_size = len.min(RX_BUFFER_SIZE);
                self.callsite.set_driver_call(driver_call::READ);
                match bus.read(address, self.pending_rx_size) {
                    Ok(()) => self.state = CommState::XferRxCheckComplete,
                    Err(fault) => {
                        self.record_fault(fault, clock);
                        self.state = CommState::Waiting;
                    }
                }
            }
        }
    }

    /// Poll the controller. True once idle; faults abandon the current
    /// pipeline.
    fn bus_ready(&mut self, bus: &mut impl I2cBus, clock: &impl Clock) -> bool {
        match bus.poll() {
            Ok(()) => true,
            Err(nb::Error::WouldBlock) => false,
            Err(nb::Error::Other(fault)) => {
                match self.state {
                    // A failed receive step must still clear the slave IRQ
                    // or the line stays asserted forever.
                    CommState::RxSwitchToResponseBuffer
                    | CommState::RxReadLength
                    | CommState::RxProcessLength
                    | CommState::RxReadExtraData
                    | CommState::RxProcessExtraData => self.abandon_rx(fault, clock),
                    _ => {
                        self.record_fault(fault, clock);
                        self.state = CommState::Waiting;
                    }
                }
                false
            }
        }
    }

    /// Record a fault and steer the receive pipeline to the IRQ clear.
    fn abandon_rx(&mut self, fault: BusFault, clock: &impl Clock) {
        self.record_fault(fault, clock);
        self.state = CommState::RxClearIrq;
    }

    fn record_fault(&mut self, fault: BusFault, clock: &impl Clock) {
        self.status.record_fault(fault);
        if fault == BusFault::Nack {
            self.app_in_response_mode = false;
        }
        cfg_if::cfg_if! {
            if #[cfg(feature = "lockup-recovery")] {
                if fault.is_busy_class() {
                    self.lockup.on_busy_fault(clock);
                }
            } else {
                let _ = clock;
            }
        }
    }

    /// Copy the completed read out of the driver buffer.
    fn capture_rx(&mut self, bus: &impl I2cBus) {
        let data = bus.rx_data();
        let n = data.len().min(self.pending_rx_size).min(RX_BUFFER_SIZE);
        self.heap.rx_buffer[..n].copy_from_slice(&data[..n]);
        self.pending_rx_size = n;
    }
}
