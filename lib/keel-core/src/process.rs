//! Lifecycle management for a single external process.

use std::{
    fmt, io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex, PoisonError},
};

use keel_error::GenericError;
use metrics::counter;
use snafu::{ResultExt as _, Snafu};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::exit::{exit_channel, ExitNotification};

/// Error starting a process.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ProcessError {
    /// The handle already owns a running process.
    #[snafu(display("Process '{}' is already running.", name))]
    AlreadyRunning { name: String },

    /// A preparation step failed.
    #[snafu(display("Failed to prepare environment for process '{}'.", name))]
    Prepare { name: String, source: GenericError },

    /// The executable could not be launched.
    #[snafu(display("Failed to start process '{}' ({}).", name, program.display()))]
    Start {
        name: String,
        program: PathBuf,
        source: io::Error,
    },
}

/// Abnormal termination of a running process.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ProcessExitError {
    /// The process terminated with a non-zero status or was killed by a signal.
    #[snafu(display("Process '{}' stopped: {}.", name, status))]
    Exited { name: String, status: ExitStatus },

    /// Waiting on the process failed, so its outcome is unknown.
    #[snafu(display("Failed to wait on process '{}'.", name))]
    Wait { name: String, source: io::Error },
}

/// A step run to completion before a process is started.
#[derive(Clone, Debug)]
pub enum Preparation {
    /// Create a directory, along with any missing parents.
    CreateDir(PathBuf),

    /// Run a command, which must exit successfully.
    Command { program: PathBuf, args: Vec<String> },
}

impl Preparation {
    async fn run(&self) -> Result<(), GenericError> {
        match self {
            Self::CreateDir(path) => tokio::fs::create_dir_all(path)
                .await
                .map_err(|e| keel_error::generic_error!("{}: {}", path.display(), e)),
            Self::Command { program, args } => {
                let status = Command::new(program)
                    .args(args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit())
                    .status()
                    .await
                    .map_err(|e| keel_error::generic_error!("{}: {}", program.display(), e))?;

                if status.success() {
                    Ok(())
                } else {
                    Err(keel_error::generic_error!("{} failed: {}", program.display(), status))
                }
            }
        }
    }
}

impl fmt::Display for Preparation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateDir(path) => write!(f, "mkdir -p {}", path.display()),
            Self::Command { program, args } => {
                write!(f, "{}", program.display())?;
                for arg in args {
                    write!(f, " {}", arg)?;
                }
                Ok(())
            }
        }
    }
}

/// A handle to an external executable.
///
/// The handle owns at most one OS process at a time. Standard input is closed, while standard output and standard
/// error are inherited so the process logs alongside the supervisor.
pub struct ManagedProcess {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    preparations: Vec<Preparation>,
    pid: Arc<Mutex<Option<u32>>>,
}

impl ManagedProcess {
    /// Creates a new `ManagedProcess` for the given executable and arguments.
    pub fn new<N, P, I, A>(name: N, program: P, args: I) -> Self
    where
        N: Into<String>,
        P: Into<PathBuf>,
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        Self {
            name: name.into(),
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            preparations: Vec::new(),
            pid: Arc::new(Mutex::new(None)),
        }
    }

    /// Adds a step to run, in order, each time before the process is started.
    pub fn with_preparation(mut self, preparation: Preparation) -> Self {
        self.preparations.push(preparation);
        self
    }

    /// Returns the name of this process.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the path of the executable.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Returns the arguments passed to the executable.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Returns the OS process ID, if the process is currently running.
    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` if the process is currently running.
    pub fn is_running(&self) -> bool {
        self.pid().is_some()
    }

    /// Starts the process.
    ///
    /// Any preparation steps are run first. On success, returns a notification that resolves once the process
    /// terminates: `Ok(())` on a zero exit status, otherwise with the [`ProcessExitError`] describing how it stopped.
    ///
    /// # Errors
    ///
    /// If the handle already owns a running process, a preparation step fails, or the executable cannot be launched,
    /// an error is returned and no process is left running.
    pub async fn run(&self) -> Result<ExitNotification<ProcessExitError>, ProcessError> {
        if self.is_running() {
            return AlreadyRunning { name: self.name.clone() }.fail();
        }

        for preparation in &self.preparations {
            debug!(process = %self.name, step = %preparation, "Running preparation step.");
            preparation.run().await.context(Prepare { name: self.name.clone() })?;
        }

        let (notifier, notification) = exit_channel();

        let mut child = {
            let mut pid = self.pid.lock().unwrap_or_else(PoisonError::into_inner);
            if pid.is_some() {
                return AlreadyRunning { name: self.name.clone() }.fail();
            }

            let child = Command::new(&self.program)
                .args(&self.args)
                .stdin(Stdio::null())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .spawn()
                .context(Start {
                    name: self.name.clone(),
                    program: self.program.clone(),
                })?;

            *pid = child.id();
            child
        };

        info!(process = %self.name, pid = ?child.id(), program = %self.program.display(), "Process started.");
        counter!("supervisor_process_starts_total", "process" => self.name.clone()).increment(1);

        let name = self.name.clone();
        let pid = Arc::clone(&self.pid);
        let raw_pid = child.id().and_then(|id| libc::pid_t::try_from(id).ok());
        tokio::spawn(async move {
            // Cleared while the exited child is still an unreaped zombie, so `close` never signals a recycled pid.
            if let Some(raw_pid) = raw_pid {
                match tokio::task::spawn_blocking(move || wait_for_exit(raw_pid)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => debug!(process = %name, %error, "Failed to observe exit before reaping."),
                    Err(error) => debug!(process = %name, %error, "Exit observer task failed."),
                }
            }
            pid.lock().unwrap_or_else(PoisonError::into_inner).take();

            let result = child.wait().await;
            counter!("supervisor_process_exits_total", "process" => name.clone()).increment(1);

            match result {
                Ok(status) if status.success() => {
                    info!(process = %name, "Process exited cleanly.");
                    notifier.complete();
                }
                Ok(status) => {
                    debug!(process = %name, %status, "Process exited abnormally.");
                    notifier.fail(ProcessExitError::Exited { name, status });
                }
                Err(e) => notifier.fail(ProcessExitError::Wait { name, source: e }),
            }
        });

        Ok(notification)
    }

    /// Asks the process to stop by sending it `SIGINT`.
    ///
    /// Does not wait for the process to exit; observe that through the notification returned by [`run`][Self::run].
    /// Does nothing if no process is running.
    pub fn close(&self) {
        let pid = self.pid.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(pid) = *pid else {
            debug!(process = %self.name, "Process not running. Nothing to close.");
            return;
        };

        let Ok(raw_pid) = libc::pid_t::try_from(pid) else {
            warn!(process = %self.name, pid, "Process ID out of range. Unable to signal process.");
            return;
        };

        // SAFETY: `kill` has no memory-safety preconditions. The pid belongs to our own child, which cannot have been
        // reaped while the pid is still set: the waiter clears it under this lock before reaping.
        let rc = unsafe { libc::kill(raw_pid, libc::SIGINT) };
        if rc != 0 {
            let error = io::Error::last_os_error();
            warn!(process = %self.name, pid, %error, "Failed to send interrupt to process.");
        } else {
            debug!(process = %self.name, pid, "Sent interrupt to process.");
        }
    }
}

/// Blocks until the given child has exited, without reaping it.
fn wait_for_exit(pid: libc::pid_t) -> io::Result<()> {
    let id = libc::id_t::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    loop {
        // SAFETY: `siginfo_t` is plain old data, so an all-zero value is valid.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };

        // SAFETY: `info` is a valid, writable `siginfo_t` for the duration of the call. `WNOWAIT` leaves the child
        // waitable, so the tokio handle still reaps it.
        let rc = unsafe { libc::waitid(libc::P_PID, id, &mut info, libc::WEXITED | libc::WNOWAIT) };
        if rc == 0 {
            return Ok(());
        }

        let error = io::Error::last_os_error();
        if error.kind() != io::ErrorKind::Interrupted {
            return Err(error);
        }
    }
}
