#![deny(missing_docs)]

//! This crate bridges one bench power supply onto the network.
//!
//! The supply sits on a serial port and tolerates exactly one open
//! handle and one command at a time. The session manager in [`session`]
//! owns that handle, serializes every command against it, and remembers
//! the chosen port across restarts via [`settings`].
//!
//! The HTTP layer in [`server`]/[`http`] is deliberately thin: each
//! route is one session operation plus JSON encoding and nothing else.
//!
//! Hardware access goes through the [`device`] seam, with a driver for
//! Tenma 72-series supplies and a scriptable mock for tests.

/// The command line interface.
pub mod cli;

/// The seam to the physical device, its drivers and its mock.
pub mod device;

/// Possible errors in this library.
pub mod error;

/// Route handlers; transport encoding only.
pub(crate) mod http;

/// Tracing setup.
pub mod logging;

/// Code relating to setting up a server.
pub mod server;

/// The device session manager.
pub mod session;

/// The persisted settings store.
pub mod settings;
