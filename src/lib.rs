//! Core library for the acpower_cycler application.
//!
//! Drives a programmable AC power source through repeated output on/off
//! cycles for power-interruption testing. The library holds the instrument
//! link, the transports it runs over, the cycle engine and the console front
//! end; the binary in `main.rs` only wires them together.

pub mod adapters;
pub mod config;
pub mod console;
pub mod cycle;
pub mod error;
pub mod instrument;
pub mod journal;
