//! # Priority Gate
//!
//! A priority-gated task coordinator: competing tasks register an integer
//! priority, then ask whether they may proceed. Only the task(s) holding
//! the current highest registered priority are admitted; everyone else
//! blocks, polls, or receives an error, at their choice:
//! - [`PriorityGate::proceed`] blocks until admitted (cancellable variant
//!   available)
//! - [`PriorityGate::proceed_non_blocking`] polls
//! - [`PriorityGate::proceed_or_fail`] errors with the current highest
//!
//! Typical use is serializing access to a scarce resource (a decoder, a
//! network budget) among tasks of different urgency. The gate performs no
//! scheduling and no allocation of its own; it is a pure arbitration
//! primitive.

pub mod error;
pub mod gate;

pub use error::{Error, Result};
pub use gate::{CancelToken, PriorityGate, Registration};
