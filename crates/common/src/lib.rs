//! Shared error plumbing and cancellation helpers used across all turingpi crates.

pub mod cancel;
pub mod error;
pub mod kind;

pub use {
    cancel::{Interrupt, guarded},
    error::{Error, FromMessage, Result},
    kind::ErrorKind,
};
