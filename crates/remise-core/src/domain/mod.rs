//! Domain layer: channel identity and the device exclusivity gate.
//!
//! Nothing in here performs I/O.  The gate uses a `std::sync::Mutex` for its
//! counters, but every operation is non-blocking in the sense that matters to
//! callers: an acquisition either succeeds immediately or fails immediately.

pub mod channel;
pub mod gate;
