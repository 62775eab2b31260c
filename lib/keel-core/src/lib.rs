//! Core supervision primitives: process handles, readiness polling, and heartbeat fan-out.
#![deny(warnings)]

pub mod bus;
pub mod exit;
pub mod heartbeat;
pub mod process;
pub mod readiness;
pub mod stats;
