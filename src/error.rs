use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that may occur while driving the power supply.
#[derive(Debug, Error, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub enum Error {
    /// The input was rejected before reaching the device.
    #[error("Invalid input: {0}")]
    BadInput(String),

    /// No live handle to the device exists.
    /// Commands are never a reason to connect implicitly.
    #[error("Not connected to the power supply- connect first")]
    NotConnected,

    /// Opening the port failed for some reason other than it being claimed.
    #[error("Could not connect to `{port}`: {problem}")]
    ConnectFailed {
        /// The port we tried to open.
        port: String,

        /// What the driver reported.
        problem: String,
    },

    /// The port was claimed by an open handle, and the device behind
    /// our own handle (if any) did not answer a probe either.
    /// Carries both failures so a caller can tell "claimed elsewhere"
    /// from "claimed and dead".
    #[error(
        "Port `{port}` is claimed ({open_problem}) and the device did not answer a probe ({probe_problem})"
    )]
    BusyAndUnresponsive {
        /// The port we tried to open.
        port: String,

        /// Why the open failed.
        open_problem: String,

        /// Why the follow-up liveness probe failed.
        probe_problem: String,
    },

    /// A previously live handle failed in a way indicating the link dropped.
    /// The session is now disconnected; reconnecting is up to the caller.
    #[error("Connection to the power supply lost: {0}")]
    ConnectionLost(String),

    /// The device answered, but reported or produced something unusable.
    /// The session stays connected.
    #[error("Power supply fault: {0}")]
    Device(String),

    /// Reading or writing the persisted settings failed.
    #[error("Settings storage problem: {0}")]
    Settings(String),
}
