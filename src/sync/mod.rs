//! Synchronization primitives
//!
//! Engine locks that are never taken from interrupt context use `spin::Mutex`
//! directly. This module adds the interrupt-masking variant for state the
//! interrupt handler shares with the worker.

pub mod mutex;

pub use mutex::Mutex;
