//! The seam between the session manager and a physical power supply.
//!
//! A [`PortOpener`] turns a port name into a live [`PowerSupply`] handle.
//! Everything above this module is hardware-agnostic; everything below it
//! ([`tenma`] for the real thing, [`mock`] for tests) speaks to one device.

use std::{fmt::Display, ops::RangeInclusive};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Error;

pub mod mock;
pub mod tenma;

/// An on-device non-volatile memory bank.
///
/// The hardware has exactly five. Construction validates, so a slot that
/// exists at all is a slot the device has; nothing else reaches the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct PresetSlot(u8);

impl PresetSlot {
    /// The slots the hardware provides.
    pub const VALID: RangeInclusive<u8> = 1..=5;

    /// A validated slot.
    pub fn new(slot: u8) -> Result<Self, Error> {
        if Self::VALID.contains(&slot) {
            Ok(Self(slot))
        } else {
            Err(Error::BadInput(format!(
                "preset slot {slot} does not exist- valid slots are 1 through 5"
            )))
        }
    }

    /// The raw slot number.
    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for PresetSlot {
    type Error = Error;

    fn try_from(slot: u8) -> Result<Self, Self::Error> {
        Self::new(slot)
    }
}

impl From<PresetSlot> for u8 {
    fn from(slot: PresetSlot) -> Self {
        slot.0
    }
}

impl Display for PresetSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether the supply is currently limiting on voltage or on current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// Holding the voltage set-point; current below its limit.
    ConstantVoltage,

    /// Current limit reached; voltage sags below its set-point.
    ConstantCurrent,
}

/// Why opening a port failed.
#[derive(Debug, Error)]
pub enum OpenError {
    /// The port exists but is already claimed by an open handle,
    /// possibly our own.
    #[error("port is already claimed: {0}")]
    Busy(String),

    /// Any other reason: no such port, permissions, hardware gone.
    #[error("{0}")]
    Other(String),
}

/// Why a command against an open handle failed.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The link itself is gone. The handle is no longer usable.
    #[error("{0}")]
    LinkLost(String),

    /// The device is reachable but gave an unusable answer.
    #[error("{0}")]
    Fault(String),
}

/// Shorthand for what every device command returns.
pub type CommandResult<T> = Result<T, CommandError>;

/// The capability set of one bench power supply.
///
/// Set-point and measured readings are distinct capabilities on the
/// hardware and are kept distinct here.
pub trait PowerSupply: Send {
    /// The device's identification string.
    fn identification(&mut self) -> CommandResult<String>;

    /// The configured output voltage.
    fn voltage_setpoint(&mut self) -> CommandResult<f64>;

    /// Configure the output voltage.
    fn set_voltage(&mut self, volts: f64) -> CommandResult<()>;

    /// The voltage actually present on the terminals.
    fn measured_voltage(&mut self) -> CommandResult<f64>;

    /// The configured current limit.
    fn current_setpoint(&mut self) -> CommandResult<f64>;

    /// Configure the current limit.
    fn set_current(&mut self, amps: f64) -> CommandResult<()>;

    /// The current actually flowing.
    fn measured_current(&mut self) -> CommandResult<f64>;

    /// Whether the output is live.
    fn output_enabled(&mut self) -> CommandResult<bool>;

    /// Switch the output on or off.
    fn set_output(&mut self, on: bool) -> CommandResult<()>;

    /// Whether over-voltage protection is armed.
    fn ovp_enabled(&mut self) -> CommandResult<bool>;

    /// Arm or disarm over-voltage protection.
    fn set_ovp(&mut self, on: bool) -> CommandResult<()>;

    /// Whether over-current protection is armed.
    fn ocp_enabled(&mut self) -> CommandResult<bool>;

    /// Arm or disarm over-current protection.
    fn set_ocp(&mut self, on: bool) -> CommandResult<()>;

    /// Whether the front-panel beeper is on.
    fn beep_enabled(&mut self) -> CommandResult<bool>;

    /// Switch the front-panel beeper.
    fn set_beep(&mut self, on: bool) -> CommandResult<()>;

    /// Constant-voltage or constant-current right now.
    fn mode(&mut self) -> CommandResult<OperatingMode>;

    /// Whether the front panel is locked out.
    fn panel_locked(&mut self) -> CommandResult<bool>;

    /// Load a stored configuration into the supply.
    fn recall(&mut self, slot: PresetSlot) -> CommandResult<()>;

    /// Store the present configuration in the supply.
    fn save(&mut self, slot: PresetSlot) -> CommandResult<()>;

    /// The load resistance implied by the present measurements.
    fn resistance(&mut self) -> CommandResult<f64> {
        let volts = self.measured_voltage()?;
        let amps = self.measured_current()?;

        if amps == 0.0 {
            Err(CommandError::Fault(
                "no current flowing- load resistance is undefined".into(),
            ))
        } else {
            Ok(volts / amps)
        }
    }

    /// An idempotent read used to check the device is alive.
    fn probe(&mut self) -> CommandResult<()> {
        self.output_enabled().map(|_| ())
    }
}

/// Something that can open a named serial endpoint and hand back
/// a live [`PowerSupply`].
pub trait PortOpener: Send + Sync {
    /// Open the given port. Dropping the returned handle closes it.
    fn open(&self, port: &str) -> Result<Box<dyn PowerSupply>, OpenError>;
}
