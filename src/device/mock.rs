//! A scriptable power supply, useful to test session logic without
//! the actual hardware.
//!
//! Every handle opened by a [`MockOpener`] shares one [`MockState`],
//! so tests can inject readings and failures and inspect what the
//! "device" was asked to do. Each command writes enter/exit records
//! into a journal, which lets tests assert that two commands never
//! overlapped.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use crate::device::{
    CommandError, CommandResult, OpenError, OperatingMode, PortOpener, PowerSupply, PresetSlot,
};

/// One record in the call journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRecord {
    /// A command began executing.
    Enter(&'static str),

    /// That command finished.
    Exit(&'static str),
}

/// Everything the scripted supply remembers and reports.
#[derive(Debug)]
pub struct MockState {
    /// Reading handed out for the voltage set-point.
    pub voltage_setpoint: f64,

    /// Reading handed out for the current limit.
    pub current_setpoint: f64,

    /// Reading handed out for the terminal voltage.
    pub measured_voltage: f64,

    /// Reading handed out for the flowing current.
    pub measured_current: f64,

    /// Output flag.
    pub output: bool,

    /// Over-voltage protection flag.
    pub ovp: bool,

    /// Over-current protection flag.
    pub ocp: bool,

    /// Beeper flag.
    pub beep: bool,

    /// Front-panel lock state.
    pub locked: bool,

    /// When set, [`PowerSupply::mode`] reports constant current.
    pub constant_current: bool,

    /// Slots the device was asked to recall, in order.
    pub recalled: Vec<u8>,

    /// Slots the device was asked to save to, in order.
    pub saved: Vec<u8>,

    /// Enter/exit records of every command executed.
    pub journal: Vec<CallRecord>,

    /// When set, every command fails with a copy of this
    /// (after still being journaled).
    pub fail_with: Option<FailWith>,
}

/// The failure every command reports when injected via [`MockState::fail_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailWith {
    /// Commands fail as if the link dropped.
    LinkLost,

    /// Commands fail as a device fault.
    Fault,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            voltage_setpoint: 0.0,
            current_setpoint: 0.0,
            measured_voltage: 0.0,
            measured_current: 0.0,
            output: false,
            ovp: false,
            ocp: false,
            beep: false,
            locked: false,
            constant_current: false,
            recalled: vec![],
            saved: vec![],
            journal: vec![],
            fail_with: None,
        }
    }
}

impl MockState {
    /// How many commands reached the device.
    pub fn commands_executed(&self) -> usize {
        self.journal
            .iter()
            .filter(|record| matches!(record, CallRecord::Enter(_)))
            .count()
    }
}

/// Hands out handles to one shared scripted supply.
#[derive(Debug, Default)]
pub struct MockOpener {
    state: Arc<Mutex<MockState>>,

    /// When set, only this port opens; anything else fails
    /// as if no such port exists.
    accept_only: Option<String>,

    /// Outcomes forced onto upcoming opens, front first.
    /// Once drained, opens behave normally again.
    scripted_opens: Mutex<VecDeque<OpenError>>,

    attempts: AtomicUsize,
}

impl MockOpener {
    /// An opener which accepts any port.
    pub fn new() -> Self {
        Self::default()
    }

    /// An opener which only accepts the given port.
    pub fn accepting(port: &str) -> Self {
        Self {
            accept_only: Some(port.to_owned()),
            ..Self::default()
        }
    }

    /// The state shared by all handles this opener produced.
    pub fn state(&self) -> Arc<Mutex<MockState>> {
        Arc::clone(&self.state)
    }

    /// Force the next open to fail with the given error.
    pub fn fail_next_open(&self, error: OpenError) {
        self.scripted_opens.lock().unwrap().push_back(error);
    }

    /// How many times anything tried to open a port.
    pub fn open_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl PortOpener for MockOpener {
    fn open(&self, port: &str) -> Result<Box<dyn PowerSupply>, OpenError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.scripted_opens.lock().unwrap().pop_front() {
            return Err(error);
        }

        if let Some(accepted) = &self.accept_only {
            if accepted != port {
                return Err(OpenError::Other(format!("no such port: `{port}`")));
            }
        }

        Ok(Box::new(MockPsu {
            state: Arc::clone(&self.state),
        }))
    }
}

/// A handle to the scripted supply.
#[derive(Debug)]
pub struct MockPsu {
    state: Arc<Mutex<MockState>>,
}

impl MockPsu {
    /// Journal the command, let other tasks run a moment, then execute.
    ///
    /// The pause between enter and exit is the point: if two commands
    /// ever run without external mutual exclusion, their records will
    /// interleave and the journal gives the race away.
    fn command<T>(
        &mut self,
        name: &'static str,
        f: impl FnOnce(&mut MockState) -> T,
    ) -> CommandResult<T> {
        self.state.lock().unwrap().journal.push(CallRecord::Enter(name));

        thread::sleep(Duration::from_millis(2));

        let mut state = self.state.lock().unwrap();
        let failure = state.fail_with;
        let value = f(&mut state);
        state.journal.push(CallRecord::Exit(name));

        match failure {
            None => Ok(value),
            Some(FailWith::LinkLost) => {
                Err(CommandError::LinkLost(format!("scripted link loss in `{name}`")))
            }
            Some(FailWith::Fault) => {
                Err(CommandError::Fault(format!("scripted fault in `{name}`")))
            }
        }
    }
}

impl PowerSupply for MockPsu {
    fn identification(&mut self) -> CommandResult<String> {
        self.command("identification", |_| "MOCK PSU V1.0".to_owned())
    }

    fn voltage_setpoint(&mut self) -> CommandResult<f64> {
        self.command("voltage_setpoint", |state| state.voltage_setpoint)
    }

    fn set_voltage(&mut self, volts: f64) -> CommandResult<()> {
        self.command("set_voltage", |state| state.voltage_setpoint = volts)
    }

    fn measured_voltage(&mut self) -> CommandResult<f64> {
        self.command("measured_voltage", |state| state.measured_voltage)
    }

    fn current_setpoint(&mut self) -> CommandResult<f64> {
        self.command("current_setpoint", |state| state.current_setpoint)
    }

    fn set_current(&mut self, amps: f64) -> CommandResult<()> {
        self.command("set_current", |state| state.current_setpoint = amps)
    }

    fn measured_current(&mut self) -> CommandResult<f64> {
        self.command("measured_current", |state| state.measured_current)
    }

    fn output_enabled(&mut self) -> CommandResult<bool> {
        self.command("output_enabled", |state| state.output)
    }

    fn set_output(&mut self, on: bool) -> CommandResult<()> {
        self.command("set_output", |state| state.output = on)
    }

    fn ovp_enabled(&mut self) -> CommandResult<bool> {
        self.command("ovp_enabled", |state| state.ovp)
    }

    fn set_ovp(&mut self, on: bool) -> CommandResult<()> {
        self.command("set_ovp", |state| state.ovp = on)
    }

    fn ocp_enabled(&mut self) -> CommandResult<bool> {
        self.command("ocp_enabled", |state| state.ocp)
    }

    fn set_ocp(&mut self, on: bool) -> CommandResult<()> {
        self.command("set_ocp", |state| state.ocp = on)
    }

    fn beep_enabled(&mut self) -> CommandResult<bool> {
        self.command("beep_enabled", |state| state.beep)
    }

    fn set_beep(&mut self, on: bool) -> CommandResult<()> {
        self.command("set_beep", |state| state.beep = on)
    }

    fn mode(&mut self) -> CommandResult<OperatingMode> {
        self.command("mode", |state| {
            if state.constant_current {
                OperatingMode::ConstantCurrent
            } else {
                OperatingMode::ConstantVoltage
            }
        })
    }

    fn panel_locked(&mut self) -> CommandResult<bool> {
        self.command("panel_locked", |state| state.locked)
    }

    fn recall(&mut self, slot: PresetSlot) -> CommandResult<()> {
        self.command("recall", |state| state.recalled.push(slot.get()))
    }

    fn save(&mut self, slot: PresetSlot) -> CommandResult<()> {
        self.command("save", |state| state.saved.push(slot.get()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_journaled_in_pairs() {
        let opener = MockOpener::new();
        let mut psu = opener.open("any").unwrap();

        psu.set_voltage(3.3).unwrap();
        assert_eq!(psu.voltage_setpoint().unwrap(), 3.3);

        let state = opener.state();
        let state = state.lock().unwrap();
        assert_eq!(
            state.journal,
            vec![
                CallRecord::Enter("set_voltage"),
                CallRecord::Exit("set_voltage"),
                CallRecord::Enter("voltage_setpoint"),
                CallRecord::Exit("voltage_setpoint"),
            ]
        );
    }

    #[test]
    fn scripted_open_failures_are_one_shot() {
        let opener = MockOpener::new();
        opener.fail_next_open(OpenError::Busy("claimed".into()));

        assert!(matches!(opener.open("any"), Err(OpenError::Busy(_))));
        assert!(opener.open("any").is_ok());
        assert_eq!(opener.open_attempts(), 2);
    }

    #[test]
    fn injected_link_loss_fails_every_command() {
        let opener = MockOpener::new();
        let mut psu = opener.open("any").unwrap();

        opener.state().lock().unwrap().fail_with = Some(FailWith::LinkLost);

        assert!(matches!(
            psu.measured_voltage(),
            Err(CommandError::LinkLost(_))
        ));
        assert!(matches!(psu.probe(), Err(CommandError::LinkLost(_))));
    }
}
