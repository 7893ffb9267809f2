//! call-listen library crate
//!
//! Places an outbound call through a call-origination service and plays the
//! call's live PCM audio stream. The binary is in main.rs.

#[macro_use]
extern crate log;

pub mod config;
pub mod connection;
pub mod constants;
pub mod control;
pub mod event;
pub mod frame;
pub mod origination;
pub mod output;
pub mod scheduler;
pub mod session;
pub mod stdin;

#[cfg(test)]
mod event_tests;
