//! Host-link framing engine.
//!
//! Bytes arrive one at a time, either pushed by the UART RX interrupt
//! through [`UartCore::process_received_byte`] or pulled from a polled
//! serial driver by [`UartCore::pump`]. The decoder drops them through a
//! three-state machine straight into the decoded-RX queue, so a complete
//! record is ready the moment the closing boundary byte lands. The
//! cooperative loop then dispatches decoded frames ([`UartCore::process_rx`])
//! and drains the framed TX queue into the serial driver
//! ([`UartCore::process_tx`]), each under a millisecond budget.

pub mod command;
pub mod frame;

use embedded_hal_nb::serial::{Read, Write};

use self::command::CommandActions;
use self::frame::{FrameEncoder, ESCAPE, FRAME_BOUNDARY};
use crate::arena::{words_for, Arena, ArenaClaim, ArenaError};
use crate::bridge::error::{ErrorFamily, ErrorRouter};
use crate::i2c::error::{Callsite, CommStatus};
use crate::queue::RegionQueue;
use crate::time::{Alarm, AlarmKind, Clock};

/// Mid-frame idle window after which the decoder resets to out-of-frame.
pub const RX_IDLE_RESET_MS: u32 = 2000;

/// Normal-mode decoded-RX queue: records.
pub const NORMAL_RX_RECORDS: usize = 8;
/// Normal-mode decoded-RX queue: arena bytes.
pub const NORMAL_RX_BYTES: usize = 600;
/// Normal-mode framed-TX queue: records.
pub const NORMAL_TX_RECORDS: usize = 8;
/// Normal-mode framed-TX queue: arena bytes.
pub const NORMAL_TX_BYTES: usize = 800;

/// Updater-mode decoded-RX queue: records.
pub const UPDATER_RX_RECORDS: usize = 4;
/// Updater-mode decoded-RX queue: arena bytes. Sized for bootloader
/// payload chunks.
pub const UPDATER_RX_BYTES: usize = 2100;
/// Updater-mode framed-TX queue: records.
pub const UPDATER_TX_RECORDS: usize = 4;
/// Updater-mode framed-TX queue: arena bytes.
pub const UPDATER_TX_BYTES: usize = 100;

/// The framing engine in its normal (translator) geometry.
pub type UartEngine = UartCore<NORMAL_RX_RECORDS, NORMAL_RX_BYTES, NORMAL_TX_RECORDS, NORMAL_TX_BYTES>;
/// The framing engine in its updater geometry.
pub type UpdaterUartEngine =
    UartCore<UPDATER_RX_RECORDS, UPDATER_RX_BYTES, UPDATER_TX_RECORDS, UPDATER_TX_BYTES>;

/// Receive decoder states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum RxState {
    OutOfFrame,
    InFrame,
    EscapeCharacter,
}

/// Decode-side counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxStats {
    /// Bytes seen outside any frame.
    pub out_of_frame: u16,
    /// Frames dropped because the decoded-RX queue overflowed.
    pub overflow: u16,
    /// Serial driver errors while pumping or draining.
    pub line_errors: u16,
}

struct UartHeap<const RN: usize, const RC: usize, const TN: usize, const TC: usize> {
    rx: RegionQueue<RN, RC>,
    tx: RegionQueue<TN, TC, FrameEncoder>,
}

/// Framing engine over one decoded-RX and one framed-TX queue.
pub struct UartCore<const RN: usize, const RC: usize, const TN: usize, const TC: usize> {
    claim: ArenaClaim,
    heap: UartHeap<RN, RC, TN, TC>,
    rx_state: RxState,
    last_rx_ms: u32,
    frame_overflowed: bool,
    stats: RxStats,
    reported_overflow: u16,
    tx_offset: usize,
}

impl<const RN: usize, const RC: usize, const TN: usize, const TC: usize>
    UartCore<RN, RC, TN, TC>
{
    /// Arena words one activation claims.
    pub const HEAP_WORDS: usize = words_for::<UartHeap<RN, RC, TN, TC>>();

    /// Claim the queue heap from `arena` and start out of frame.
    pub fn activate(arena: &mut Arena) -> Result<Self, ArenaError> {
        let claim = arena.claim(Self::HEAP_WORDS)?;
        debug!("uart engine active, {} words", claim.words());
        let mut heap = UartHeap { rx: RegionQueue::new(), tx: RegionQueue::new() };
        heap.tx.set_transform(FrameEncoder::new());
        Ok(Self {
            claim,
            heap,
            rx_state: RxState::OutOfFrame,
            last_rx_ms: 0,
            frame_overflowed: false,
            stats: RxStats::default(),
            reported_overflow: 0,
            tx_offset: 0,
        })
    }

    /// Return the claimed arena words and tear the engine down.
    pub fn deactivate(self, arena: &mut Arena) -> Result<(), ArenaError> {
        arena.release(self.claim)
    }

    /// Decode-side counters.
    pub fn rx_stats(&self) -> RxStats {
        self.stats
    }

    /// Decoded frames waiting for dispatch.
    pub fn pending_rx_frames(&self) -> usize {
        self.heap.rx.len()
    }

    /// Framed records waiting for transmission.
    pub fn pending_tx_frames(&self) -> usize {
        self.heap.tx.len()
    }

    /// Feed one received byte through the decode state machine.
    ///
    /// Safe to call from the UART RX interrupt when the engine is wrapped
    /// in an [`crate::irq::IsrShared`]; it only appends to the decoded-RX
    /// queue and flips the decoder state.
    pub fn process_received_byte(&mut self, clock: &impl Clock, byte: u8) {
        match self.rx_state {
            RxState::OutOfFrame => {
                if byte == FRAME_BOUNDARY {
                    self.last_rx_ms = clock.now_ms();
                    self.rx_state = RxState::InFrame;
                } else {
                    self.stats.out_of_frame = self.stats.out_of_frame.saturating_add(1);
                }
            }
            RxState::InFrame => {
                self.last_rx_ms = clock.now_ms();
                if byte == ESCAPE {
                    self.rx_state = RxState::EscapeCharacter;
                } else if byte == FRAME_BOUNDARY {
                    self.end_of_frame();
                } else {
                    self.push_body_byte(byte);
                }
            }
            RxState::EscapeCharacter => {
                self.last_rx_ms = clock.now_ms();
                self.push_body_byte(byte);
                self.rx_state = RxState::InFrame;
            }
        }
    }

    fn end_of_frame(&mut self) {
        if self.frame_overflowed {
            self.heap.rx.abort_partial();
            self.frame_overflowed = false;
        } else {
            // An empty frame has nothing to commit; finalize failing is
            // just the parser resetting.
            self.heap.rx.finalize();
        }
        self.rx_state = RxState::OutOfFrame;
    }

    fn push_body_byte(&mut self, byte: u8) {
        if self.frame_overflowed {
            return;
        }
        if !self.heap.rx.enqueue_byte(byte, false) {
            self.stats.overflow = self.stats.overflow.saturating_add(1);
            self.frame_overflowed = true;
            self.heap.rx.abort_partial();
        }
    }

    /// Drain a polled serial driver into the decoder. Returns bytes
    /// consumed.
    pub fn pump<S: Read<u8>>(&mut self, clock: &impl Clock, serial: &mut S) -> usize {
        let mut consumed = 0;
        loop {
            match serial.read() {
                Ok(byte) => {
                    self.process_received_byte(clock, byte);
                    consumed += 1;
                }
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(_)) => {
                    self.stats.line_errors = self.stats.line_errors.saturating_add(1);
                    break;
                }
            }
        }
        consumed
    }

    /// Dispatch decoded frames for up to `budget_ms`. Returns frames
    /// handled.
    pub fn process_rx(
        &mut self,
        clock: &impl Clock,
        actions: &mut impl CommandActions,
        router: &mut ErrorRouter,
        budget_ms: u32,
    ) -> usize {
        // Stuck mid-frame with a silent host: drop the partial record.
        if self.rx_state != RxState::OutOfFrame
            && clock.now_ms().wrapping_sub(self.last_rx_ms) > RX_IDLE_RESET_MS
        {
            trace!("rx idle mid-frame, resetting decoder");
            self.rx_state = RxState::OutOfFrame;
            self.heap.rx.abort_partial();
            self.frame_overflowed = false;
        }

        if self.stats.overflow != self.reported_overflow {
            self.reported_overflow = self.stats.overflow;
            let mut status = CommStatus::ok();
            status.set_queue_full();
            let reply = router.report(ErrorFamily::Uart, status, Callsite::new());
            command::send_error_reply(&mut self.heap.tx, reply);
        }

        let mut budget = Alarm::new();
        if budget_ms > 0 {
            budget.arm(clock, budget_ms, AlarmKind::SingleNotification);
        }

        let UartHeap { rx, tx } = &mut self.heap;
        let mut handled = 0;
        while let Some(frame) = rx.dequeue() {
            command::dispatch(frame, tx, actions, router);
            handled += 1;
            if budget.has_elapsed(clock) {
                break;
            }
        }
        handled
    }

    /// Remove and return the oldest decoded frame without dispatching it.
    /// Updater mode uses this to forward raw records to the bootloader.
    pub fn take_frame(&mut self) -> Option<&[u8]> {
        self.heap.rx.dequeue()
    }

    /// Enqueue a framed command response.
    pub fn enqueue_response(&mut self, command: u8, payload: &[u8]) -> bool {
        command::respond(&mut self.heap.tx, command, payload)
    }

    /// Enqueue slave bytes as a data-only frame.
    pub fn relay_slave_data(&mut self, data: &[u8]) -> bool {
        self.heap.tx.enqueue(data)
    }

    /// Send a routed error reply toward the host.
    pub fn send_error_reply(&mut self, reply: crate::bridge::error::ErrorReply) {
        command::send_error_reply(&mut self.heap.tx, reply);
    }

    /// Drain the framed-TX queue into the serial driver for up to
    /// `budget_ms`. Returns bytes written.
    pub fn process_tx<S: Write<u8>>(
        &mut self,
        clock: &impl Clock,
        serial: &mut S,
        budget_ms: u32,
    ) -> usize {
        let mut budget = Alarm::new();
        if budget_ms > 0 {
            budget.arm(clock, budget_ms, AlarmKind::SingleNotification);
        }

        let mut written = 0;
        loop {
            let mut line_error = false;
            let record_done = {
                let Some(record) = self.heap.tx.peek() else {
                    break;
                };
                loop {
                    if self.tx_offset >= record.len() {
                        break true;
                    }
                    match serial.write(record[self.tx_offset]) {
                        Ok(()) => {
                            self.tx_offset += 1;
                            written += 1;
                        }
                        Err(nb::Error::WouldBlock) => {
                            if budget.has_elapsed(clock) {
                                break false;
                            }
                        }
                        Err(nb::Error::Other(_)) => {
                            // Give up on this record, keep the link going.
                            line_error = true;
                            break true;
                        }
                    }
                }
            };
            if line_error {
                self.stats.line_errors = self.stats.line_errors.saturating_add(1);
            }
            if !record_done {
                return written;
            }
            self.heap.tx.dequeue();
            self.tx_offset = 0;
            if budget.has_elapsed(clock) {
                break;
            }
        }
        written
    }
}
