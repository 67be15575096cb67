/// Device backends.
///
/// A backend answers the two questions a session asks of its device:
/// "what are your properties?" and "run this command". [`AdbBackend`]
/// talks to a real device through `adb`; [`LocalBackend`] runs commands on
/// the host and reports a fixed property map (used for emulators, tests and
/// bring-up).
use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::error::ProtocolError;

/// Read size for command output.
const CHUNK_SIZE: usize = 16 * 1024;

/// Queue depth between the reader tasks and the session.
const STREAM_BUFFER: usize = 64;

/// One event of a running command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    /// Output bytes, in order.
    Data(Vec<u8>),
    /// The command exited normally.
    End,
    /// The command could not run to completion.
    Fail(String),
}

impl ShellEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ShellEvent::Data(_))
    }
}

/// Output of a running command. Yields [`ShellEvent::Data`] zero or more
/// times, then exactly one terminal event.
pub struct ShellStream {
    rx: mpsc::Receiver<ShellEvent>,
}

impl ShellStream {
    pub async fn next(&mut self) -> Option<ShellEvent> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// Read the raw device properties.
    async fn properties(&self, serial: &str) -> Result<HashMap<String, String>, ProtocolError>;

    /// Start `command` on the device.
    fn shell(&self, serial: &str, command: &[String]) -> Result<ShellStream, ProtocolError>;
}

/// Spawn `argv` and stream its stdout and stderr.
///
/// Exit with any status code ends the stream with [`ShellEvent::End`].
/// Death by signal, or a read error, ends it with [`ShellEvent::Fail`].
pub fn spawn_stream(argv: &[String]) -> Result<ShellStream, ProtocolError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| ProtocolError::Backend("empty command".into()))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ProtocolError::Backend(format!("spawn {program}: {e}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProtocolError::Backend("stdout not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ProtocolError::Backend("stderr not captured".into()))?;

    let (tx, rx) = mpsc::channel(STREAM_BUFFER);

    tokio::spawn(async move {
        let (out, err) = tokio::join!(forward(stdout, tx.clone()), forward(stderr, tx.clone()));

        let terminal = match (out, err) {
            (Err(e), _) | (_, Err(e)) => {
                let _ = child.start_kill();
                ShellEvent::Fail(format!("read failed: {e}"))
            }
            (Ok(false), _) | (_, Ok(false)) => {
                // Receiver gone; nobody is listening for the result.
                let _ = child.start_kill();
                return;
            }
            (Ok(true), Ok(true)) => match child.wait().await {
                Ok(status) if status.code().is_some() => ShellEvent::End,
                Ok(status) => ShellEvent::Fail(format!("terminated: {status}")),
                Err(e) => ShellEvent::Fail(format!("wait failed: {e}")),
            },
        };
        let _ = tx.send(terminal).await;
    });

    Ok(ShellStream { rx })
}

/// Copy `reader` into `tx` as Data events. `Ok(false)` if the receiver
/// went away.
async fn forward<R: AsyncRead + Unpin>(
    mut reader: R,
    tx: mpsc::Sender<ShellEvent>,
) -> std::io::Result<bool> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(true);
        }
        if tx.send(ShellEvent::Data(buf[..n].to_vec())).await.is_err() {
            return Ok(false);
        }
    }
}

// ── adb ───────────────────────────────────────────────────────────────

/// Backend that reaches the device through an adb server.
#[derive(Debug, Clone)]
pub struct AdbBackend {
    program: String,
    host: String,
    port: u16,
}

impl AdbBackend {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            program: "adb".into(),
            host: host.into(),
            port,
        }
    }

    /// Use a different adb binary.
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn argv(&self, serial: &str, rest: &[String]) -> Vec<String> {
        let mut argv = vec![
            self.program.clone(),
            "-H".into(),
            self.host.clone(),
            "-P".into(),
            self.port.to_string(),
            "-s".into(),
            serial.to_string(),
            "shell".into(),
        ];
        argv.extend_from_slice(rest);
        argv
    }
}

#[async_trait]
impl DeviceBackend for AdbBackend {
    async fn properties(&self, serial: &str) -> Result<HashMap<String, String>, ProtocolError> {
        let argv = self.argv(serial, &["getprop".to_string()]);
        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ProtocolError::Backend(format!("spawn {}: {e}", argv[0])))?;
        if !output.status.success() {
            return Err(ProtocolError::Backend(format!(
                "getprop on {serial} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(parse_getprop(&String::from_utf8_lossy(&output.stdout)))
    }

    fn shell(&self, serial: &str, command: &[String]) -> Result<ShellStream, ProtocolError> {
        spawn_stream(&self.argv(serial, command))
    }
}

/// Parse `getprop` output: one `[key]: [value]` per line. Lines that do
/// not fit the shape are skipped.
pub fn parse_getprop(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once("]: [")?;
            let key = key.strip_prefix('[')?;
            let value = value.strip_suffix(']')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

// ── local ─────────────────────────────────────────────────────────────

/// Backend that runs commands on the host.
#[derive(Debug, Clone, Default)]
pub struct LocalBackend {
    properties: HashMap<String, String>,
}

impl LocalBackend {
    pub fn new(properties: HashMap<String, String>) -> Self {
        Self { properties }
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl DeviceBackend for LocalBackend {
    async fn properties(&self, _serial: &str) -> Result<HashMap<String, String>, ProtocolError> {
        Ok(self.properties.clone())
    }

    fn shell(&self, _serial: &str, command: &[String]) -> Result<ShellStream, ProtocolError> {
        spawn_stream(command)
    }
}
