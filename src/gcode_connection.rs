/// G-code link to the printer host
///
/// The tuner's collaborators map onto a handful of host commands sent over a
/// serial (or pseudo-tty) line:
/// - threshold write: SET_TMC_FIELD on every configured stepper driver
/// - homing: the configured homing command (G2800 by default) plus the axis
/// - backtrack: G91 / G1 / G90
/// - logical zero: SET_KINEMATIC_POSITION
///
/// Ordinary commands wait for the host's `ok`, and `!!` or `Error` lines turn
/// into errors. The homing command is sent without waiting: the host answers
/// it only once the move ends, so its `ok` is the stall signal and a
/// `No trigger` rejection means the axis ran its full travel.

use anyhow::{anyhow, Context, Result};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config_loader::PrinterSettings;
use crate::motion::{Axis, AxisPositioner, MotionController, PositionResetter, Reporter, ThresholdWriter};

/// Host rejection for a homing move that ended without the driver stalling
pub const NO_TRIGGER: &str = "No trigger";

/// Anything we can speak G-code over: a serial port, a pty, or a test double
pub trait LinkIo: Read + Write + Send {}
impl<T: Read + Write + Send + ?Sized> LinkIo for T {}

pub fn threshold_command(stepper: &str, field: &str, value: u8) -> String {
    format!("SET_TMC_FIELD STEPPER={} FIELD={} VALUE={}", stepper, field, value)
}

pub fn homing_command(command: &str, axis: Axis) -> String {
    format!("{} {}", command, axis)
}

pub fn move_commands(axis: Axis, distance: f64, feed_rate: f64) -> [String; 3] {
    [
        "G91".to_string(),
        format!("G1 {}{} F{}", axis, distance, feed_rate),
        "G90".to_string(),
    ]
}

pub fn zero_command(axis: Axis) -> String {
    format!("SET_KINEMATIC_POSITION {}=0", axis)
}

/// Where a command sent with [`GcodeConnection::start`] stands
#[derive(Debug, Clone, PartialEq)]
pub enum CommandStatus {
    Running,
    Completed,
    Rejected(String),
}

struct Background {
    command: String,
    sent_at: Instant,
    status: CommandStatus,
}

enum ReplyLine {
    Ok,
    Rejected(String),
    Info(String),
}

fn classify_line(line: String) -> ReplyLine {
    if line == "ok" || line.starts_with("ok ") {
        ReplyLine::Ok
    } else if line.starts_with("!!") || line.starts_with("Error") {
        ReplyLine::Rejected(line)
    } else {
        ReplyLine::Info(line)
    }
}

/// Line-oriented connection to the host
pub struct GcodeConnection {
    port: Box<dyn LinkIo>,
    label: String,
    reply_timeout: Duration,
    background_timeout: Duration,
    pending: Vec<u8>,
    background: Option<Background>,
}

impl GcodeConnection {
    /// Wrap an already-open stream (pty, socket, test double)
    pub fn from_io(io: Box<dyn LinkIo>, label: &str) -> Self {
        Self {
            port: io,
            label: label.to_string(),
            reply_timeout: Duration::from_secs(5),
            background_timeout: Duration::from_secs(60),
            pending: Vec::new(),
            background: None,
        }
    }

    pub fn open(port_path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(port_path, baud_rate)
            .timeout(Duration::from_millis(20))
            .open()
            .with_context(|| format!("Failed to open {} at {} baud", port_path, baud_rate))?;
        log::info!(target: "gcode", "Connected to {} at {} baud", port_path, baud_rate);
        Ok(Self::from_io(Box::new(port), port_path))
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// How long a later command waits for a started command to finish
    pub fn with_background_timeout(mut self, timeout: Duration) -> Self {
        self.background_timeout = timeout;
        self
    }

    fn write_line(&mut self, command: &str) -> Result<()> {
        log::debug!(target: "gcode", "→ {}", command);
        self.port.write_all(format!("{}\n", command).as_bytes())?;
        self.port.flush()?;
        Ok(())
    }

    /// One read from the port; false when nothing arrived
    fn fill(&mut self) -> Result<bool> {
        let mut chunk = [0u8; 256];
        match self.port.read(&mut chunk) {
            Ok(0) => Ok(false),
            Ok(bytes_read) => {
                self.pending.extend_from_slice(&chunk[..bytes_read]);
                Ok(true)
            }
            Err(e) if matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) => Ok(false),
            Err(e) => Err(anyhow!("Read error on {}: {}", self.label, e)),
        }
    }

    fn next_line(&mut self) -> Option<String> {
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                return Some(line);
            }
        }
        None
    }

    /// Send one command and return the reply lines that preceded `ok`
    pub fn send(&mut self, command: &str) -> Result<Vec<String>> {
        self.settle()?;
        self.write_line(command)?;
        let reply = self.read_reply(command)?;
        log::debug!(target: "gcode", "← {:?}", reply);
        Ok(reply)
    }

    fn read_reply(&mut self, command: &str) -> Result<Vec<String>> {
        let start_time = Instant::now();
        let mut lines = Vec::new();

        loop {
            while let Some(line) = self.next_line() {
                match classify_line(line) {
                    ReplyLine::Ok => return Ok(lines),
                    ReplyLine::Rejected(line) => {
                        return Err(anyhow!("'{}' rejected by host: {}", command, line));
                    }
                    ReplyLine::Info(line) => lines.push(line),
                }
            }

            if start_time.elapsed() > self.reply_timeout {
                return Err(anyhow!("No reply to '{}' within {:?}", command, self.reply_timeout));
            }
            if !self.fill()? {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }

    /// Send a command whose reply arrives much later, without waiting for it.
    /// Track it with [`status`](Self::status).
    pub fn start(&mut self, command: &str) -> Result<()> {
        self.settle()?;
        self.write_line(command)?;
        self.background = Some(Background {
            command: command.to_string(),
            sent_at: Instant::now(),
            status: CommandStatus::Running,
        });
        Ok(())
    }

    /// Status of the last started command, reading whatever the host sent so far
    pub fn status(&mut self) -> Result<Option<(String, CommandStatus)>> {
        let running = matches!(
            self.background.as_ref().map(|b| &b.status),
            Some(CommandStatus::Running)
        );
        if running {
            self.fill()?;
            while let Some(line) = self.next_line() {
                let Some(background) = self.background.as_mut() else { break; };
                match classify_line(line) {
                    ReplyLine::Ok => background.status = CommandStatus::Completed,
                    ReplyLine::Rejected(line) => background.status = CommandStatus::Rejected(line),
                    ReplyLine::Info(line) => {
                        log::debug!(target: "gcode", "← {}", line);
                        continue;
                    }
                }
                log::debug!(
                    target: "gcode",
                    "'{}' finished after {:.2}s: {:?}",
                    background.command, background.sent_at.elapsed().as_secs_f64(), background.status
                );
                break;
            }
        }
        Ok(self.background.as_ref().map(|b| (b.command.clone(), b.status.clone())))
    }

    /// Wait for a started command to finish before the line is reused
    fn settle(&mut self) -> Result<()> {
        loop {
            let Some((command, status)) = self.status()? else { return Ok(()); };
            match status {
                CommandStatus::Running => {
                    let waited = self.background.as_ref().map_or(Duration::ZERO, |b| b.sent_at.elapsed());
                    if waited > self.background_timeout {
                        return Err(anyhow!(
                            "'{}' still running after {:?}",
                            command, self.background_timeout
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                CommandStatus::Completed => {
                    self.background = None;
                    return Ok(());
                }
                CommandStatus::Rejected(line) => {
                    log::info!(target: "gcode", "'{}' ended with: {}", command, line);
                    self.background = None;
                    return Ok(());
                }
            }
        }
    }
}

/// Collaborator handle over a shared G-code connection.
///
/// Clones share one connection; each collaborator call holds the lock for the
/// commands it sends.
#[derive(Clone)]
pub struct KlipperHost {
    conn: Arc<Mutex<GcodeConnection>>,
    homing_command: String,
    threshold_field: String,
    steppers: Vec<String>,
}

impl KlipperHost {
    pub fn new(conn: GcodeConnection, settings: &PrinterSettings) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            homing_command: settings.homing_command.clone(),
            threshold_field: settings.threshold_field.clone(),
            steppers: settings.steppers.clone(),
        }
    }

    /// Open the configured serial port and wrap it
    pub fn connect(settings: &PrinterSettings) -> Result<Self> {
        let conn = GcodeConnection::open(&settings.port, settings.baud_rate)?
            .with_background_timeout(Duration::from_secs_f64(settings.homing_timeout));
        Ok(Self::new(conn, settings))
    }

    fn lock(&self) -> Result<MutexGuard<'_, GcodeConnection>> {
        self.conn.lock().map_err(|_| anyhow!("G-code connection lock poisoned"))
    }

    fn send_all<I>(&self, commands: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = String>,
    {
        let mut conn = self.lock()?;
        let mut replies = Vec::new();
        for command in commands {
            replies.extend(conn.send(&command)?);
        }
        Ok(replies)
    }
}

impl ThresholdWriter for KlipperHost {
    /// Written to every configured driver, not just the axis under test
    fn set(&mut self, threshold: u8) -> Result<()> {
        let commands: Vec<String> = self.steppers.iter()
            .map(|s| threshold_command(s, &self.threshold_field, threshold))
            .collect();
        self.send_all(commands)?;
        Ok(())
    }
}

impl MotionController for KlipperHost {
    fn start_homing(&mut self, axis: Axis) -> Result<()> {
        self.lock()?.start(&homing_command(&self.homing_command, axis))
    }

    /// Homed once the host acknowledges the homing move for this axis
    fn is_homed(&mut self, axis: Axis) -> Result<bool> {
        let expected = homing_command(&self.homing_command, axis);
        match self.lock()?.status()? {
            Some((command, CommandStatus::Completed)) => Ok(command == expected),
            Some((_, CommandStatus::Rejected(line))) if line.contains(NO_TRIGGER) => Ok(false),
            Some((command, CommandStatus::Rejected(line))) => {
                Err(anyhow!("'{}' rejected by host: {}", command, line))
            }
            Some((_, CommandStatus::Running)) | None => Ok(false),
        }
    }
}

impl AxisPositioner for KlipperHost {
    fn move_relative(&mut self, axis: Axis, distance: f64, feed_rate: f64) -> Result<()> {
        self.send_all(move_commands(axis, distance, feed_rate))?;
        Ok(())
    }
}

impl PositionResetter for KlipperHost {
    fn set_logical_zero(&mut self, axis: Axis) -> Result<()> {
        self.send_all([zero_command(axis)])?;
        Ok(())
    }
}

impl Reporter for KlipperHost {
    /// Echoed on the host console; failures are only logged
    fn report(&mut self, message: &str) {
        let respond = format!("RESPOND MSG=\"{}\"", message.replace('"', "'"));
        if let Err(e) = self.send_all([respond]) {
            log::warn!(target: "gcode", "Console echo failed: {}", e);
        }
    }
}
