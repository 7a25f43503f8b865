#![deny(missing_docs)]

//! This crate shares a single serial port with any number of TCP clients.
//!
//! Everything read from the serial port is copied to every connected client.
//! Clients send line based commands, which are queued per client
//! and forwarded to the serial port one at a time, at most one per pacing interval.
//!
//! All I/O is non-blocking and driven by a single readiness loop,
//! see [`selector::Selector`] and [`bridge::Bridge`].

/// Growable array, ring buffer and line store backing the devices.
pub mod collections;

/// A simple non-blocking timer.
pub mod timer;

/// Devices and their lifecycle.
pub mod device;

/// The concrete things a device can wrap: serial ports, listeners and connections.
pub mod endpoint;

/// Owning devices and waiting for them to become ready.
pub mod selector;

/// Moving data between the serial device and the clients.
pub mod bridge;

/// The outer run loop.
pub mod server;

/// Listen address handling.
pub mod net;

/// Reload and quit requests from signals.
pub mod signals;

/// Configuration of a bridge.
pub mod config;

/// The command line interface.
pub mod cli;

/// Logging setup.
pub mod logging;

/// Possible errors in this library.
pub mod error;
