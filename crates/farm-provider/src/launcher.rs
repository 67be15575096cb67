/// Worker processes.
///
/// The supervisor launches workers through a [`WorkerLauncher`] and drives
/// them through the [`Worker`] trait, so tests can substitute scripted
/// workers for real processes.
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::config::WorkerConfig;
use crate::error::ProviderError;

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Exited with a status code.
    Code(i32),
    /// Terminated by a signal.
    Signal(i32),
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        matches!(self, WorkerExit::Code(0))
    }
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerExit::Code(code) => write!(f, "exit code {code}"),
            WorkerExit::Signal(sig) => write!(f, "signal {sig}"),
        }
    }
}

/// A running worker.
#[async_trait]
pub trait Worker: Send {
    /// OS process id, if there is one.
    fn pid(&self) -> Option<u32>;

    /// Wait for the worker to end. Cancel-safe.
    async fn wait(&mut self) -> Result<WorkerExit, ProviderError>;

    /// Ask the worker to stop.
    fn terminate(&mut self) -> Result<(), ProviderError>;

    /// Stop the worker now.
    fn kill(&mut self) -> Result<(), ProviderError>;
}

pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, config: &WorkerConfig) -> Result<Box<dyn Worker>, ProviderError>;
}

// ── Processes ─────────────────────────────────────────────────────────

/// Launches `<program> device --config <json>`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Workers run the binary the provider itself was started from.
    pub fn current_exe() -> Result<Self, ProviderError> {
        Ok(Self::new(std::env::current_exe()?))
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, config: &WorkerConfig) -> Result<Box<dyn Worker>, ProviderError> {
        let json = config.to_json()?;
        let child = Command::new(&self.program)
            .arg("device")
            .arg("--config")
            .arg(json)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProviderError::Launch {
                serial: config.serial.clone(),
                source,
            })?;
        Ok(Box::new(ChildWorker { child }))
    }
}

/// A worker backed by an OS child process.
pub struct ChildWorker {
    child: Child,
}

impl ChildWorker {
    pub fn new(child: Child) -> Self {
        Self { child }
    }

    #[cfg(unix)]
    fn signal(&self, signal: libc::c_int) -> Result<(), ProviderError> {
        let Some(pid) = self.child.id() else {
            // Already reaped.
            return Ok(());
        };
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if rc == 0 {
            return Ok(());
        }
        let source = std::io::Error::last_os_error();
        if source.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(ProviderError::Signal { pid, source })
    }
}

#[async_trait]
impl Worker for ChildWorker {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<WorkerExit, ProviderError> {
        let status = self.child.wait().await?;
        Ok(exit_of(status))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> Result<(), ProviderError> {
        self.signal(libc::SIGTERM)
    }

    #[cfg(unix)]
    fn kill(&mut self) -> Result<(), ProviderError> {
        self.signal(libc::SIGKILL)
    }

    // No graceful signal elsewhere; both stop the process outright.
    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<(), ProviderError> {
        self.kill()
    }

    #[cfg(not(unix))]
    fn kill(&mut self) -> Result<(), ProviderError> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(source) => Err(ProviderError::Signal {
                pid: self.child.id().unwrap_or_default(),
                source,
            }),
        }
    }
}

#[cfg(unix)]
fn exit_of(status: std::process::ExitStatus) -> WorkerExit {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => WorkerExit::Code(code),
        (None, Some(sig)) => WorkerExit::Signal(sig),
        (None, None) => WorkerExit::Code(-1),
    }
}

#[cfg(not(unix))]
fn exit_of(status: std::process::ExitStatus) -> WorkerExit {
    WorkerExit::Code(status.code().unwrap_or(-1))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spawn(script: &str) -> ChildWorker {
        let child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        ChildWorker::new(child)
    }

    #[tokio::test]
    async fn exit_code_is_reported() {
        let mut worker = spawn("exit 3");
        assert_eq!(worker.wait().await.unwrap(), WorkerExit::Code(3));
    }

    #[tokio::test]
    async fn terminate_stops_a_cooperative_worker() {
        let mut worker = spawn("sleep 30");
        worker.terminate().unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), worker.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, WorkerExit::Signal(libc::SIGTERM));
    }

    #[tokio::test]
    async fn kill_stops_a_stubborn_worker() {
        let mut worker = spawn("trap '' TERM; sleep 30");
        // Let the shell install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        worker.terminate().unwrap();
        let still_running =
            tokio::time::timeout(Duration::from_millis(300), worker.wait()).await;
        assert!(still_running.is_err());

        worker.kill().unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), worker.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, WorkerExit::Signal(libc::SIGKILL));
    }

    #[tokio::test]
    async fn signalling_an_exited_worker_is_fine() {
        let mut worker = spawn("exit 0");
        worker.wait().await.unwrap();
        assert!(worker.terminate().is_ok());
    }

    #[tokio::test]
    async fn missing_program_is_launch_error() {
        let launcher = ProcessLauncher::new("/definitely/not/a/program");
        let config = crate::config::ProviderConfig::new("p").worker_config(
            "A",
            crate::ports::WorkerPorts {
                screen: 1,
                connect: 2,
                vnc: 3,
                mjpeg: 4,
            },
        );
        assert!(matches!(
            launcher.launch(&config),
            Err(ProviderError::Launch { .. })
        ));
    }

    #[test]
    fn exit_display() {
        assert_eq!(WorkerExit::Code(0).to_string(), "exit code 0");
        assert!(WorkerExit::Code(0).success());
        assert!(!WorkerExit::Signal(9).success());
    }
}
