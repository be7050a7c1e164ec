//! Test doubles for the hardware seams.
//!
//! Only compiled for the host test harness. `ScriptedBus` plays the role
//! of the vendor I2C controller: transactions complete (or fault) when the
//! test says so, read data is scripted per transaction.

use std::collections::VecDeque;
use std::vec::Vec;

use core::cell::Cell;
use core::convert::Infallible;

use crate::i2c::bus::{BusFault, I2cBus};
use crate::i2c::error::{Callsite, CommStatus};
use crate::i2c::ResponseSink;
use crate::time::Clock;

/// Manually advanced millisecond clock.
pub struct FakeClock {
    ms: Cell<u32>,
    auto_advance: Cell<u32>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self::at(0)
    }

    pub fn at(start_ms: u32) -> Self {
        Self { ms: Cell::new(start_ms), auto_advance: Cell::new(0) }
    }

    pub fn advance(&self, ms: u32) {
        self.ms.set(self.ms.get().wrapping_add(ms));
    }

    /// Make every `now_ms` read advance the counter by `ms`, so code that
    /// spins on a deadline inside one call still sees time move.
    pub fn set_auto_advance(&self, ms: u32) {
        self.auto_advance.set(ms);
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u32 {
        let now = self.ms.get();
        self.ms.set(now.wrapping_add(self.auto_advance.get()));
        now
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Op {
    Write,
    Read(usize),
}

/// Scriptable [`I2cBus`] double.
pub struct ScriptedBus {
    pending: Option<(Op, u32)>,
    latency: u32,
    busy: bool,
    poll_faults: VecDeque<BusFault>,
    start_faults: VecDeque<BusFault>,
    probe_failures: u32,
    rx_script: VecDeque<Vec<u8>>,
    rx_last: Vec<u8>,
    writes: Vec<(u8, Vec<u8>)>,
    reads: Vec<(u8, usize)>,
    probes: Vec<u8>,
    reinits: u32,
}

impl ScriptedBus {
    pub fn new() -> Self {
        Self {
            pending: None,
            latency: 0,
            busy: false,
            poll_faults: VecDeque::new(),
            start_faults: VecDeque::new(),
            probe_failures: 0,
            rx_script: VecDeque::new(),
            rx_last: Vec::new(),
            writes: Vec::new(),
            reads: Vec::new(),
            probes: Vec::new(),
            reinits: 0,
        }
    }

    /// Require `n` extra polls before each transaction completes.
    pub fn set_latency(&mut self, n: u32) {
        self.latency = n;
    }

    /// Make every start call fail with `Busy` until [`Self::set_busy`]
    /// is called with false or `reinit` runs with a healthy script.
    pub fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }

    /// Script the bytes delivered by the next read, in request order.
    pub fn push_read_data(&mut self, data: &[u8]) {
        self.rx_script.push_back(data.to_vec());
    }

    /// Inject a fault that completes the next transaction.
    pub fn fail_next_poll(&mut self, fault: BusFault) {
        self.poll_faults.push_back(fault);
    }

    /// Inject a fault on the next transaction start.
    pub fn fail_next_start(&mut self, fault: BusFault) {
        self.start_faults.push_back(fault);
    }

    /// Make the next `n` probes fail with `Nack`.
    pub fn fail_probes(&mut self, n: u32) {
        self.probe_failures = n;
    }

    /// Completed writes as `(address, bytes)`.
    pub fn writes(&self) -> &[(u8, Vec<u8>)] {
        &self.writes
    }

    /// Read requests as `(address, len)`.
    pub fn reads(&self) -> &[(u8, usize)] {
        &self.reads
    }

    /// Probed addresses.
    pub fn probes(&self) -> &[u8] {
        &self.probes
    }

    pub fn reinit_count(&self) -> u32 {
        self.reinits
    }

    fn begin(&mut self, op: Op) -> Result<(), BusFault> {
        if self.busy {
            return Err(BusFault::Busy);
        }
        if let Some(fault) = self.start_faults.pop_front() {
            return Err(fault);
        }
        if self.pending.is_some() {
            return Err(BusFault::NotReady);
        }
        self.pending = Some((op, self.latency));
        Ok(())
    }
}

impl Default for ScriptedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl I2cBus for ScriptedBus {
    fn poll(&mut self) -> nb::Result<(), BusFault> {
        let Some((op, remaining)) = self.pending else {
            return Ok(());
        };
        if remaining > 0 {
            self.pending = Some((op, remaining - 1));
            return Err(nb::Error::WouldBlock);
        }
        self.pending = None;
        if let Some(fault) = self.poll_faults.pop_front() {
            return Err(nb::Error::Other(fault));
        }
        if let Op::Read(len) = op {
            let mut data = self.rx_script.pop_front().unwrap_or_default();
            data.resize(len, 0);
            self.rx_last = data;
        }
        Ok(())
    }

    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), BusFault> {
        self.begin(Op::Write)?;
        self.writes.push((address, bytes.to_vec()));
        Ok(())
    }

    fn read(&mut self, address: u8, len: usize) -> Result<(), BusFault> {
        self.begin(Op::Read(len))?;
        self.reads.push((address, len));
        Ok(())
    }

    fn rx_data(&self) -> &[u8] {
        &self.rx_last
    }

    fn probe(&mut self, address: u8) -> Result<(), BusFault> {
        self.probes.push(address);
        if self.busy {
            return Err(BusFault::Busy);
        }
        if self.probe_failures > 0 {
            self.probe_failures -= 1;
            return Err(BusFault::Nack);
        }
        Ok(())
    }

    fn reinit(&mut self) {
        self.reinits += 1;
        self.pending = None;
    }
}

/// Records everything the comm engines push toward the host.
#[derive(Default)]
pub struct RecordingSink {
    pub data: Vec<Vec<u8>>,
    pub errors: Vec<(CommStatus, Callsite)>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResponseSink for RecordingSink {
    fn on_slave_data(&mut self, data: &[u8]) {
        self.data.push(data.to_vec());
    }

    fn on_error(&mut self, status: CommStatus, callsite: Callsite) {
        self.errors.push((status, callsite));
    }
}

/// In-memory serial endpoint for the host UART seam.
pub struct LoopSerial {
    pub sent: Vec<u8>,
    rx: VecDeque<u8>,
    write_budget: Option<usize>,
}

impl LoopSerial {
    pub fn new() -> Self {
        Self { sent: Vec::new(), rx: VecDeque::new(), write_budget: None }
    }

    /// Queue bytes the bridge will see on its RX side.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }

    /// Accept only `n` more written bytes, then report `WouldBlock`.
    pub fn limit_writes(&mut self, n: usize) {
        self.write_budget = Some(n);
    }
}

impl Default for LoopSerial {
    fn default() -> Self {
        Self::new()
    }
}

impl embedded_hal_nb::serial::ErrorType for LoopSerial {
    type Error = Infallible;
}

impl embedded_hal_nb::serial::Write<u8> for LoopSerial {
    fn write(&mut self, word: u8) -> nb::Result<(), Infallible> {
        match &mut self.write_budget {
            Some(0) => Err(nb::Error::WouldBlock),
            Some(n) => {
                *n -= 1;
                self.sent.push(word);
                Ok(())
            }
            None => {
                self.sent.push(word);
                Ok(())
            }
        }
    }

    fn flush(&mut self) -> nb::Result<(), Infallible> {
        Ok(())
    }
}

impl embedded_hal_nb::serial::Read<u8> for LoopSerial {
    fn read(&mut self) -> nb::Result<u8, Infallible> {
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

/// [`crate::bridge::SystemReset`] double that only counts invocations.
#[derive(Default)]
pub struct CountingReset {
    pub count: u32,
}

impl crate::bridge::SystemReset for CountingReset {
    fn system_reset(&mut self) {
        self.count += 1;
    }
}

/// Input/output pin double with recorded transitions.
pub struct FakePin {
    state: bool,
    pub history: Vec<bool>,
}

impl FakePin {
    pub fn new(state: bool) -> Self {
        Self { state, history: Vec::new() }
    }

    pub fn set(&mut self, state: bool) {
        self.state = state;
    }
}

impl embedded_hal::digital::ErrorType for FakePin {
    type Error = Infallible;
}

impl embedded_hal::digital::InputPin for FakePin {
    fn is_high(&mut self) -> Result<bool, Infallible> {
        Ok(self.state)
    }

    fn is_low(&mut self) -> Result<bool, Infallible> {
        Ok(!self.state)
    }
}

impl embedded_hal::digital::OutputPin for FakePin {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.state = false;
        self.history.push(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.state = true;
        self.history.push(true);
        Ok(())
    }
}
