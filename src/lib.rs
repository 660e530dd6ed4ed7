//! Car-audio Bluetooth sink.
//!
//! The host advertises itself as car audio, accepts A2DP connections from a
//! phone, and reconciles connection, playback, metadata, device and
//! equalizer events into one observable [`types::PlayerState`]. All platform
//! access goes through the traits in [`platform`]; [`sidecar::Sidecar`]
//! implements them by talking to an out-of-process helper.

pub mod config;
pub mod format;
pub mod platform;
pub mod poller;
pub mod service;
pub mod sidecar;
pub mod state;
pub mod types;

#[cfg(test)]
mod testing;
