//! Driver for Tenma 72-series bench supplies (and Korad clones).
//!
//! The protocol is plain ASCII request/response over the serial port:
//! `VSET1:12.34` sets, `VSET1?` asks, `STATUS?` answers with one raw
//! status byte. Replies carry no terminator; a read is done when the
//! port goes quiet.

use std::{io, io::Read, io::Write, thread, time::Duration};

use tracing::{debug, trace};

use crate::device::{
    CommandError, CommandResult, OpenError, OperatingMode, PortOpener, PowerSupply, PresetSlot,
};

/// How long the device gets to start answering a query.
const REPLY_TIMEOUT: Duration = Duration::from_millis(500);

/// The device ignores commands that arrive back-to-back.
const SETTLE: Duration = Duration::from_millis(50);

/// Replies are a handful of bytes; anything bigger is garbage.
const MAX_REPLY: usize = 256;

/// Opens Tenma 72-series supplies on demand.
#[derive(Debug, Clone)]
pub struct TenmaOpener {
    baud: u32,
    timeout: Duration,
}

impl Default for TenmaOpener {
    fn default() -> Self {
        Self {
            baud: 9_600,
            timeout: REPLY_TIMEOUT,
        }
    }
}

impl TenmaOpener {
    /// An opener with the stock 9600 baud and a half second reply timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the baud rate. Newer models in the series run at 115200.
    pub fn set_baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }
}

impl PortOpener for TenmaOpener {
    fn open(&self, port: &str) -> Result<Box<dyn PowerSupply>, OpenError> {
        debug!(%port, baud = self.baud, "Opening supply");

        let handle = serialport::new(port, self.baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(self.timeout)
            .open()
            .map_err(classify_open_error)?;

        Ok(Box::new(Tenma {
            port: handle,
            ovp_armed: false,
            ocp_armed: false,
        }))
    }
}

fn classify_open_error(e: serialport::Error) -> OpenError {
    let description = e.to_string();

    // The OS reports a claimed port as EBUSY on unix
    // and as access denied on Windows.
    let claimed = matches!(
        e.kind(),
        serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied)
    ) || description.to_lowercase().contains("busy");

    if claimed {
        OpenError::Busy(description)
    } else {
        OpenError::Other(description)
    }
}

struct Tenma {
    port: Box<dyn serialport::SerialPort>,

    // The hardware cannot report its protection state,
    // so the handle shadows what it last wrote.
    ovp_armed: bool,
    ocp_armed: bool,
}

impl Tenma {
    fn send(&mut self, cmd: &str) -> CommandResult<()> {
        trace!(%cmd, "tx");

        self.port
            .write_all(cmd.as_bytes())
            .map_err(|e| CommandError::LinkLost(format!("could not send `{cmd}`: {e}")))?;

        thread::sleep(SETTLE);
        Ok(())
    }

    fn query(&mut self, cmd: &str) -> CommandResult<Vec<u8>> {
        self.send(cmd)?;

        let mut reply = Vec::new();
        let mut buf = [0u8; 64];

        loop {
            match self.port.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    reply.extend_from_slice(&buf[..n]);
                    if reply.len() > MAX_REPLY {
                        return Err(CommandError::Fault(format!(
                            "reply to `{cmd}` does not end ({} bytes and counting)",
                            reply.len()
                        )));
                    }
                }
                // Quiet port: the reply (if any) is complete.
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) => {
                    return Err(CommandError::LinkLost(format!(
                        "read after `{cmd}` failed: {e}"
                    )))
                }
            }
        }

        trace!(?reply, "rx");

        if reply.is_empty() {
            // Port open, device silent. Treat as the link being gone;
            // this is also what makes a liveness probe meaningful.
            Err(CommandError::LinkLost(format!("no reply to `{cmd}`")))
        } else {
            Ok(reply)
        }
    }

    fn query_scalar(&mut self, cmd: &str) -> CommandResult<f64> {
        let reply = self.query(cmd)?;
        parse_scalar(&reply)
            .ok_or_else(|| CommandError::Fault(unparseable(cmd, &reply)))
    }

    fn query_status(&mut self) -> CommandResult<Status> {
        let reply = self.query("STATUS?")?;
        Ok(Status::decode(reply[0]))
    }

    fn set_flag(&mut self, prefix: &str, on: bool) -> CommandResult<()> {
        self.send(&format!("{prefix}{}", u8::from(on)))
    }
}

fn unparseable(cmd: &str, reply: &[u8]) -> String {
    format!(
        "unparseable reply `{}` to `{cmd}`",
        String::from_utf8_lossy(reply)
    )
}

/// Parse the leading decimal out of a reply.
///
/// Some firmware revisions append a stray byte to `ISET1?` answers,
/// so trailing junk is expected and ignored.
fn parse_scalar(reply: &[u8]) -> Option<f64> {
    let text = String::from_utf8_lossy(reply);
    let numeric: String = text
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    numeric.parse().ok()
}

/// The fields of the `STATUS?` byte this driver cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Status {
    constant_voltage: bool,
    beep: bool,
    locked: bool,
    output: bool,
}

impl Status {
    fn decode(byte: u8) -> Self {
        Self {
            constant_voltage: byte & 0x01 != 0,
            beep: byte & 0x10 != 0,
            locked: byte & 0x20 != 0,
            output: byte & 0x40 != 0,
        }
    }
}

impl PowerSupply for Tenma {
    fn identification(&mut self) -> CommandResult<String> {
        let reply = self.query("*IDN?")?;
        Ok(String::from_utf8_lossy(&reply)
            .trim_matches(|c: char| c == '\0' || c.is_whitespace())
            .to_owned())
    }

    fn voltage_setpoint(&mut self) -> CommandResult<f64> {
        self.query_scalar("VSET1?")
    }

    fn set_voltage(&mut self, volts: f64) -> CommandResult<()> {
        self.send(&format!("VSET1:{volts:05.2}"))
    }

    fn measured_voltage(&mut self) -> CommandResult<f64> {
        self.query_scalar("VOUT1?")
    }

    fn current_setpoint(&mut self) -> CommandResult<f64> {
        self.query_scalar("ISET1?")
    }

    fn set_current(&mut self, amps: f64) -> CommandResult<()> {
        self.send(&format!("ISET1:{amps:05.3}"))
    }

    fn measured_current(&mut self) -> CommandResult<f64> {
        self.query_scalar("IOUT1?")
    }

    fn output_enabled(&mut self) -> CommandResult<bool> {
        Ok(self.query_status()?.output)
    }

    fn set_output(&mut self, on: bool) -> CommandResult<()> {
        self.set_flag("OUT", on)
    }

    fn ovp_enabled(&mut self) -> CommandResult<bool> {
        Ok(self.ovp_armed)
    }

    fn set_ovp(&mut self, on: bool) -> CommandResult<()> {
        self.set_flag("OVP", on)?;
        self.ovp_armed = on;
        Ok(())
    }

    fn ocp_enabled(&mut self) -> CommandResult<bool> {
        Ok(self.ocp_armed)
    }

    fn set_ocp(&mut self, on: bool) -> CommandResult<()> {
        self.set_flag("OCP", on)?;
        self.ocp_armed = on;
        Ok(())
    }

    fn beep_enabled(&mut self) -> CommandResult<bool> {
        Ok(self.query_status()?.beep)
    }

    fn set_beep(&mut self, on: bool) -> CommandResult<()> {
        self.set_flag("BEEP", on)
    }

    fn mode(&mut self) -> CommandResult<OperatingMode> {
        Ok(if self.query_status()?.constant_voltage {
            OperatingMode::ConstantVoltage
        } else {
            OperatingMode::ConstantCurrent
        })
    }

    fn panel_locked(&mut self) -> CommandResult<bool> {
        Ok(self.query_status()?.locked)
    }

    fn recall(&mut self, slot: PresetSlot) -> CommandResult<()> {
        self.send(&format!("RCL{slot}"))
    }

    fn save(&mut self, slot: PresetSlot) -> CommandResult<()> {
        self.send(&format!("SAV{slot}"))
    }
}
