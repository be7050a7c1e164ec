#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

//! Protocol core of a UART to I2C bridge for a touch-controller slave.
//!
//! The host talks a framed byte protocol over UART (`0xAA` boundaries,
//! `0x55` byte stuffing); the slave is an I2C device with a memory-mapped
//! command/response interface and an interrupt line. This crate holds the
//! three engines in between -- the [`uart`] framing engine, the [`i2c`]
//! master comm engine and the [`bridge`] supervisor that drives both from
//! a single cooperative loop -- plus the [`queue`], [`arena`], [`time`]
//! and [`irq`] primitives they stand on.
//!
//! All hardware access goes through capability traits
//! ([`i2c::bus::I2cBus`], `embedded-hal` pins, `embedded-hal-nb` serial,
//! [`time::Clock`], [`bridge::SystemReset`]), so the crate is pure logic:
//! the board crate supplies the vendor drivers and the interrupt handlers,
//! the engines supply everything else.
//!
//! ## Feature flags
#![doc = document_features::document_features!(feature_label = r#"<span class="stab portability"><code>{feature}</code></span>"#)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod arena;
pub mod bridge;
pub mod i2c;
pub mod irq;
pub mod queue;
pub mod time;
pub mod uart;

#[cfg(test)]
pub(crate) mod mock;

pub use bridge::{Bridge, BridgeConfig, BridgeIo, BridgeState, SystemReset};
pub use irq::TouchIrq;
pub use time::{Clock, TickClock};
