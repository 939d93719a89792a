//! The device session: connection state machine, derived state and observer fan-out.

pub mod clock;
pub mod controller;
pub mod observer;
pub mod snapshot;

pub use controller::{Session, SessionOptions};
