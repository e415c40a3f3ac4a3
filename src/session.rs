//! The device session manager.
//!
//! Owns the one relationship the service has with physical hardware:
//! which port, whether a handle to it is live, and the handle itself.
//! Every device-touching operation goes through one session-wide lock,
//! so at most one command is ever in flight on the serial link- the
//! electrical command set is stateful and two interleaved commands
//! could leave the supply misconfigured.
//!
//! There is no background reconnect and no lazy connect: a session
//! that loses its link stays disconnected until a caller asks for
//! [`SessionManager::connect`] again.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    device::{CommandError, OpenError, OperatingMode, PortOpener, PowerSupply, PresetSlot},
    error::Error,
    settings::{self, SettingsStore},
};

/// How a successful connect came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connected {
    /// A fresh handle was opened.
    Fresh,

    /// The port was already claimed, but the device behind our existing
    /// handle answers; that handle stays in service.
    AlreadyOpen,
}

/// What a port change did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortChange {
    /// The new port; persisted even when the connect attempt failed.
    pub port: String,

    /// The outcome of the reconnect the change triggered.
    pub connect: Result<Connected, Error>,
}

/// A snapshot of the session for callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    /// The configured port.
    pub port: String,

    /// Whether a live handle exists.
    pub connected: bool,
}

/// A power reading with the telemetry it was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerReading {
    /// Measured voltage times measured current.
    pub watts: f64,

    /// The voltage reading that went into the product.
    pub volts: f64,

    /// The current reading that went into the product.
    pub amps: f64,
}

struct DeviceSession {
    port: String,

    /// The at-most-one live handle. `None` means disconnected.
    handle: Option<Box<dyn PowerSupply>>,
}

/// Mediates all access to the supply. Cheap to clone; clones share
/// the same session.
#[derive(Clone)]
pub struct SessionManager {
    session: Arc<Mutex<DeviceSession>>,
    opener: Arc<dyn PortOpener>,
    settings: Arc<SettingsStore>,
}

impl SessionManager {
    /// A manager for the port persisted in `settings`, creating the
    /// settings file from the template first if needed.
    ///
    /// No connect is attempted here; see [`SessionManager::connect`].
    pub fn new(settings: SettingsStore, opener: Arc<dyn PortOpener>) -> Result<Self, Error> {
        settings
            .ensure_template()
            .map_err(|e| Error::Settings(e.to_string()))?;

        let port = settings
            .read(settings::SECTION, settings::COM_PORT_KEY)
            .map_err(|e| Error::Settings(e.to_string()))?;

        debug!(%port, "Session starts disconnected");

        Ok(Self {
            session: Arc::new(Mutex::new(DeviceSession { port, handle: None })),
            opener,
            settings: Arc::new(settings),
        })
    }

    /// The session as callers see it.
    pub async fn status(&self) -> SessionStatus {
        let session = self.session.lock().await;

        SessionStatus {
            port: session.port.clone(),
            connected: session.handle.is_some(),
        }
    }

    /// The configured port.
    pub async fn port(&self) -> String {
        self.session.lock().await.port.clone()
    }

    /// Try to open the configured port.
    pub async fn connect(&self) -> Result<Connected, Error> {
        let mut session = self.session.lock().await;
        self.connect_locked(&mut session)
    }

    /// Switch to a new port and reconnect.
    ///
    /// The port is persisted before anything else happens and is not
    /// rolled back if the reconnect fails- the caller asked for that
    /// port, and the next restart should come back to it.
    pub async fn set_port(&self, new_port: &str) -> Result<PortChange, Error> {
        if new_port.trim().is_empty() {
            return Err(Error::BadInput("the port name must not be empty".into()));
        }

        let mut session = self.session.lock().await;

        self.settings
            .write(settings::SECTION, settings::COM_PORT_KEY, new_port)
            .map_err(|e| Error::Settings(e.to_string()))?;

        if session.port != new_port {
            // A handle to the old port says nothing about the new one,
            // and must be gone before another open is attempted.
            session.handle = None;
            session.port = new_port.to_owned();
        }

        let connect = self.connect_locked(&mut session);
        if let Err(e) = &connect {
            warn!(port = %new_port, %e, "Port changed but connecting to it failed");
        }

        Ok(PortChange {
            port: new_port.to_owned(),
            connect,
        })
    }

    fn connect_locked(&self, session: &mut DeviceSession) -> Result<Connected, Error> {
        debug!(port = %session.port, "Connecting");

        match self.opener.open(&session.port) {
            Ok(handle) => {
                // Replacing drops (and thereby closes) any previous handle.
                session.handle = Some(handle);
                info!(port = %session.port, "Connected");
                Ok(Connected::Fresh)
            }
            Err(OpenError::Busy(open_problem)) => {
                // The port is claimed. If the claim is our own live handle
                // the supply may be perfectly usable; ask it.
                let probe_problem = match &mut session.handle {
                    Some(handle) => match handle.probe() {
                        Ok(()) => {
                            info!(port = %session.port, "Port claimed by us and device answers");
                            return Ok(Connected::AlreadyOpen);
                        }
                        Err(e) => e.to_string(),
                    },
                    None => "no live handle in this process to probe".to_owned(),
                };

                session.handle = None;

                Err(Error::BusyAndUnresponsive {
                    port: session.port.clone(),
                    open_problem,
                    probe_problem,
                })
            }
            Err(OpenError::Other(problem)) => Err(Error::ConnectFailed {
                port: session.port.clone(),
                problem,
            }),
        }
    }

    /// Run one command against the live handle.
    ///
    /// Link-loss failures drop the handle; the session is then
    /// disconnected until someone explicitly reconnects.
    async fn with_device<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut dyn PowerSupply) -> Result<T, CommandError>,
    ) -> Result<T, Error> {
        let mut session = self.session.lock().await;

        let handle = session.handle.as_mut().ok_or(Error::NotConnected)?;

        match f(handle.as_mut()) {
            Ok(value) => Ok(value),
            Err(CommandError::LinkLost(problem)) => {
                warn!(%op, %problem, "Link lost, dropping handle");
                session.handle = None;
                Err(Error::ConnectionLost(problem))
            }
            Err(CommandError::Fault(problem)) => Err(Error::Device(problem)),
        }
    }

    /// The device's identification string.
    pub async fn identification(&self) -> Result<String, Error> {
        self.with_device("identification", |psu| psu.identification())
            .await
    }

    /// The configured output voltage.
    pub async fn voltage_setpoint(&self) -> Result<f64, Error> {
        self.with_device("voltage_setpoint", |psu| psu.voltage_setpoint())
            .await
    }

    /// Configure the output voltage.
    pub async fn set_voltage(&self, volts: f64) -> Result<(), Error> {
        let volts = checked_scalar("voltage", volts)?;
        self.with_device("set_voltage", move |psu| psu.set_voltage(volts))
            .await
    }

    /// The voltage actually on the terminals.
    pub async fn measured_voltage(&self) -> Result<f64, Error> {
        self.with_device("measured_voltage", |psu| psu.measured_voltage())
            .await
    }

    /// The configured current limit.
    pub async fn current_setpoint(&self) -> Result<f64, Error> {
        self.with_device("current_setpoint", |psu| psu.current_setpoint())
            .await
    }

    /// Configure the current limit.
    pub async fn set_current(&self, amps: f64) -> Result<(), Error> {
        let amps = checked_scalar("current", amps)?;
        self.with_device("set_current", move |psu| psu.set_current(amps))
            .await
    }

    /// The current actually flowing.
    pub async fn measured_current(&self) -> Result<f64, Error> {
        self.with_device("measured_current", |psu| psu.measured_current())
            .await
    }

    /// Whether the output is live.
    pub async fn output_enabled(&self) -> Result<bool, Error> {
        self.with_device("output_enabled", |psu| psu.output_enabled())
            .await
    }

    /// Switch the output.
    pub async fn set_output(&self, on: bool) -> Result<(), Error> {
        self.with_device("set_output", move |psu| psu.set_output(on))
            .await
    }

    /// Whether over-voltage protection is armed.
    pub async fn ovp_enabled(&self) -> Result<bool, Error> {
        self.with_device("ovp_enabled", |psu| psu.ovp_enabled()).await
    }

    /// Arm or disarm over-voltage protection.
    pub async fn set_ovp(&self, on: bool) -> Result<(), Error> {
        self.with_device("set_ovp", move |psu| psu.set_ovp(on)).await
    }

    /// Whether over-current protection is armed.
    pub async fn ocp_enabled(&self) -> Result<bool, Error> {
        self.with_device("ocp_enabled", |psu| psu.ocp_enabled()).await
    }

    /// Arm or disarm over-current protection.
    pub async fn set_ocp(&self, on: bool) -> Result<(), Error> {
        self.with_device("set_ocp", move |psu| psu.set_ocp(on)).await
    }

    /// Whether the beeper is on.
    pub async fn beep_enabled(&self) -> Result<bool, Error> {
        self.with_device("beep_enabled", |psu| psu.beep_enabled())
            .await
    }

    /// Switch the beeper.
    pub async fn set_beep(&self, on: bool) -> Result<(), Error> {
        self.with_device("set_beep", move |psu| psu.set_beep(on)).await
    }

    /// Constant voltage or constant current right now.
    pub async fn mode(&self) -> Result<OperatingMode, Error> {
        self.with_device("mode", |psu| psu.mode()).await
    }

    /// Whether the front panel is locked out.
    pub async fn panel_locked(&self) -> Result<bool, Error> {
        self.with_device("panel_locked", |psu| psu.panel_locked())
            .await
    }

    /// The load resistance implied by present measurements.
    pub async fn resistance(&self) -> Result<f64, Error> {
        self.with_device("resistance", |psu| psu.resistance()).await
    }

    /// Power delivered right now, always recomputed from fresh telemetry.
    pub async fn power(&self) -> Result<PowerReading, Error> {
        self.with_device("power", |psu| {
            let volts = psu.measured_voltage()?;
            let amps = psu.measured_current()?;

            Ok(PowerReading {
                watts: volts * amps,
                volts,
                amps,
            })
        })
        .await
    }

    /// The set-point voltage needed to deliver `watts` at the current
    /// actually flowing. A calculation, not a device write- but over a
    /// freshly read current, never a cached one.
    pub async fn target_voltage(&self, watts: f64) -> Result<f64, Error> {
        let watts = checked_scalar("power target", watts)?;

        let amps = self
            .with_device("target_voltage", |psu| psu.measured_current())
            .await?;

        if amps == 0.0 {
            Err(Error::Device(
                "no current flowing- enable the output before computing a target voltage".into(),
            ))
        } else {
            Ok(watts / amps)
        }
    }

    /// Load preset `slot` into the supply.
    pub async fn recall(&self, slot: u8) -> Result<(), Error> {
        // An out-of-range slot must never reach the device.
        let slot = PresetSlot::new(slot)?;
        self.with_device("recall", move |psu| psu.recall(slot)).await
    }

    /// Store the present configuration into preset `slot`.
    pub async fn save(&self, slot: u8) -> Result<(), Error> {
        let slot = PresetSlot::new(slot)?;
        self.with_device("save", move |psu| psu.save(slot)).await
    }
}

fn checked_scalar(what: &str, value: f64) -> Result<f64, Error> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(Error::BadInput(format!(
            "{what} must be a finite non-negative number, got {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{CallRecord, FailWith, MockOpener};
    use crate::settings::{COM_PORT_KEY, DEFAULT_COM_PORT, SECTION};
    use pretty_assertions::assert_eq;

    struct Fixture {
        manager: SessionManager,
        opener: Arc<MockOpener>,

        // Keeps the settings file alive for the test's duration.
        _dir: tempfile::TempDir,
    }

    fn fixture_with(opener: MockOpener) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let settings = SettingsStore::new(dir.path().join("settings.ron"));
        let opener = Arc::new(opener);

        let manager =
            SessionManager::new(settings, Arc::clone(&opener) as Arc<dyn PortOpener>).unwrap();

        Fixture {
            manager,
            opener,
            _dir: dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MockOpener::new())
    }

    async fn connected_fixture() -> Fixture {
        let fixture = fixture();
        assert_eq!(fixture.manager.connect().await.unwrap(), Connected::Fresh);
        fixture
    }

    #[tokio::test]
    async fn startup_creates_template_and_connects_to_default_port() {
        let fixture = fixture_with(MockOpener::accepting(DEFAULT_COM_PORT));

        assert_eq!(fixture.manager.port().await, DEFAULT_COM_PORT);
        assert_eq!(fixture.manager.connect().await.unwrap(), Connected::Fresh);
        assert!(fixture.manager.status().await.connected);
    }

    #[tokio::test]
    async fn dispatch_without_a_handle_does_no_io() {
        let fixture = fixture();

        assert_eq!(
            fixture.manager.measured_voltage().await,
            Err(Error::NotConnected)
        );
        assert_eq!(fixture.manager.set_output(true).await, Err(Error::NotConnected));
        assert_eq!(fixture.manager.recall(3).await, Err(Error::NotConnected));

        assert_eq!(fixture.opener.state().lock().unwrap().commands_executed(), 0);
    }

    #[tokio::test]
    async fn bad_slots_never_reach_the_device() {
        let fixture = connected_fixture().await;

        for slot in [0, 6, 99] {
            assert!(matches!(
                fixture.manager.recall(slot).await,
                Err(Error::BadInput(_))
            ));
            assert!(matches!(
                fixture.manager.save(slot).await,
                Err(Error::BadInput(_))
            ));
        }

        let state = fixture.opener.state();
        let state = state.lock().unwrap();
        assert_eq!(state.commands_executed(), 0);
        assert!(state.recalled.is_empty());
        assert!(state.saved.is_empty());
    }

    #[tokio::test]
    async fn good_slots_do() {
        let fixture = connected_fixture().await;

        fixture.manager.recall(2).await.unwrap();
        fixture.manager.save(5).await.unwrap();

        let state = fixture.opener.state();
        let state = state.lock().unwrap();
        assert_eq!(state.recalled, vec![2]);
        assert_eq!(state.saved, vec![5]);
    }

    #[tokio::test]
    async fn empty_port_is_rejected_without_persisting() {
        let fixture = fixture();

        assert!(matches!(
            fixture.manager.set_port("  ").await,
            Err(Error::BadInput(_))
        ));
        assert_eq!(fixture.manager.port().await, DEFAULT_COM_PORT);
    }

    #[tokio::test]
    async fn port_change_persists_even_when_connect_fails() {
        let fixture = fixture_with(MockOpener::accepting(DEFAULT_COM_PORT));

        let change = fixture.manager.set_port("/dev/ttyUSB9").await.unwrap();

        assert_eq!(change.port, "/dev/ttyUSB9");
        assert!(matches!(change.connect, Err(Error::ConnectFailed { .. })));

        // In memory and on disk, despite the failed connect.
        assert_eq!(fixture.manager.port().await, "/dev/ttyUSB9");

        let status = fixture.manager.status().await;
        assert!(!status.connected);
    }

    #[tokio::test]
    async fn port_change_reconnects() {
        let fixture = connected_fixture().await;

        let change = fixture.manager.set_port("/dev/ttyACM7").await.unwrap();

        assert_eq!(change.connect, Ok(Connected::Fresh));
        assert_eq!(fixture.manager.status().await.port, "/dev/ttyACM7");
    }

    #[tokio::test]
    async fn busy_port_with_answering_device_reports_already_open() {
        let fixture = connected_fixture().await;

        fixture
            .opener
            .fail_next_open(OpenError::Busy("claimed by this process".into()));

        assert_eq!(
            fixture.manager.connect().await.unwrap(),
            Connected::AlreadyOpen
        );

        // Still connected, no second handle was opened.
        assert!(fixture.manager.status().await.connected);
        assert_eq!(fixture.opener.open_attempts(), 2);

        // The probe was the idempotent output query.
        let state = fixture.opener.state();
        let state = state.lock().unwrap();
        assert!(state.journal.contains(&CallRecord::Enter("output_enabled")));
    }

    #[tokio::test]
    async fn busy_port_with_dead_device_reports_both_problems() {
        let fixture = connected_fixture().await;

        fixture.opener.state().lock().unwrap().fail_with = Some(FailWith::LinkLost);
        fixture
            .opener
            .fail_next_open(OpenError::Busy("claimed".into()));

        let error = fixture.manager.connect().await.unwrap_err();
        match error {
            Error::BusyAndUnresponsive {
                open_problem,
                probe_problem,
                ..
            } => {
                assert_eq!(open_problem, "claimed");
                assert!(probe_problem.contains("scripted link loss"));
            }
            other => panic!("expected the combined error, got {other:?}"),
        }

        assert!(!fixture.manager.status().await.connected);
    }

    #[tokio::test]
    async fn busy_port_with_no_handle_reports_both_problems_too() {
        let fixture = fixture();

        fixture
            .opener
            .fail_next_open(OpenError::Busy("claimed by someone else".into()));

        assert!(matches!(
            fixture.manager.connect().await,
            Err(Error::BusyAndUnresponsive { .. })
        ));
    }

    #[tokio::test]
    async fn link_loss_disconnects_until_explicit_reconnect() {
        let fixture = connected_fixture().await;

        fixture.opener.state().lock().unwrap().fail_with = Some(FailWith::LinkLost);

        assert!(matches!(
            fixture.manager.measured_voltage().await,
            Err(Error::ConnectionLost(_))
        ));
        assert!(!fixture.manager.status().await.connected);

        // And stays that way: dispatch never reconnects on its own.
        assert_eq!(
            fixture.manager.measured_voltage().await,
            Err(Error::NotConnected)
        );

        fixture.opener.state().lock().unwrap().fail_with = None;
        fixture.manager.connect().await.unwrap();
        assert!(fixture.manager.status().await.connected);
    }

    #[tokio::test]
    async fn device_faults_do_not_disconnect() {
        let fixture = connected_fixture().await;

        fixture.opener.state().lock().unwrap().fail_with = Some(FailWith::Fault);
        assert!(matches!(
            fixture.manager.identification().await,
            Err(Error::Device(_))
        ));

        assert!(fixture.manager.status().await.connected);

        fixture.opener.state().lock().unwrap().fail_with = None;
        assert!(fixture.manager.identification().await.is_ok());
    }

    #[tokio::test]
    async fn power_is_fresh_telemetry_every_time() {
        let fixture = connected_fixture().await;

        {
            let state = fixture.opener.state();
            let mut state = state.lock().unwrap();
            state.measured_voltage = 12.0;
            state.measured_current = 2.0;
        }

        let reading = fixture.manager.power().await.unwrap();
        assert_eq!(reading.watts, 24.0);
        assert_eq!((reading.volts, reading.amps), (12.0, 2.0));

        {
            let state = fixture.opener.state();
            let mut state = state.lock().unwrap();
            state.measured_voltage = 5.0;
            state.measured_current = 1.0;
        }

        let reading = fixture.manager.power().await.unwrap();
        assert_eq!(reading.watts, 5.0);
    }

    #[tokio::test]
    async fn target_voltage_uses_the_present_current() {
        let fixture = connected_fixture().await;

        fixture.opener.state().lock().unwrap().measured_current = 2.0;
        assert_eq!(fixture.manager.target_voltage(30.0).await.unwrap(), 15.0);

        fixture.opener.state().lock().unwrap().measured_current = 0.0;
        assert!(matches!(
            fixture.manager.target_voltage(30.0).await,
            Err(Error::Device(_))
        ));
    }

    #[tokio::test]
    async fn setpoint_and_measured_are_distinct_reads() {
        let fixture = connected_fixture().await;

        {
            let state = fixture.opener.state();
            let mut state = state.lock().unwrap();
            state.voltage_setpoint = 12.0;
            state.measured_voltage = 11.87;
            state.current_setpoint = 1.0;
            state.measured_current = 0.32;
        }

        assert_eq!(fixture.manager.voltage_setpoint().await.unwrap(), 12.0);
        assert_eq!(fixture.manager.measured_voltage().await.unwrap(), 11.87);
        assert_eq!(fixture.manager.current_setpoint().await.unwrap(), 1.0);
        assert_eq!(fixture.manager.measured_current().await.unwrap(), 0.32);
    }

    #[tokio::test]
    async fn nonsense_scalars_are_rejected_before_dispatch() {
        let fixture = connected_fixture().await;

        for bad in [f64::NAN, f64::INFINITY, -1.0] {
            assert!(matches!(
                fixture.manager.set_voltage(bad).await,
                Err(Error::BadInput(_))
            ));
        }

        assert_eq!(fixture.opener.state().lock().unwrap().commands_executed(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_dispatch_never_interleaves_on_the_wire() {
        let fixture = connected_fixture().await;

        let mut tasks = Vec::new();
        for i in 0..8 {
            let manager = fixture.manager.clone();
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    manager.set_voltage(f64::from(i)).await.unwrap();
                } else {
                    manager.power().await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let state = fixture.opener.state();
        let state = state.lock().unwrap();
        let journal = &state.journal;

        // Commands must pair up: every enter is immediately followed
        // by its own exit. Note `power` is two reads under one lock,
        // so pairs are the granularity, not operations.
        assert!(!journal.is_empty());
        for pair in journal.chunks(2) {
            match pair {
                [CallRecord::Enter(a), CallRecord::Exit(b)] if a == b => {}
                other => panic!("interleaved device transactions: {other:?}"),
            }
        }
    }
}
