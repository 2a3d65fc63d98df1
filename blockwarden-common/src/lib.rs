//! Utilities shared by the blockwarden crates.
//!
//! `blockwarden-common` must not depend on any other blockwarden crate. It only
//! carries the pieces that both the library and the CLI need: a mockable wall
//! clock and a clock-driven timeout.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![warn(clippy::panic)]
#![cfg_attr(test, allow(clippy::panic))]

pub mod clock;
pub mod utils;

#[cfg(feature = "test-util")]
pub use clock::MockSystemClock;
pub use clock::{DefaultSystemClock, SystemClock, SystemClockTicker};
pub use utils::timeout;
