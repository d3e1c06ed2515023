//! Power and energy logger for WATT CHECKER wireless meters.
//!
//! A reader task samples instantaneous power once per second into a shared
//! pool. A wall-clock scheduler drains that pool every minute into a mean
//! power record and every half hour into an energy record, each written as a
//! JSON file.

pub mod agent;
pub mod aggregate;
pub mod clock;
pub mod config;
pub mod device;
pub mod reader;
pub mod record;
pub mod scheduler;
pub mod transport;
