//! The daemon's three periodic jobs. Each exposes a single run-once entry
//! point taking the current time as a parameter, so the heartbeat loop, the
//! CLI, and the tests all drive the same code with their own clocks.

pub mod expiry;
pub mod reminders;
pub mod sync;
