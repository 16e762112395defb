// SPDX-FileCopyrightText: Copyright © 2021-2026 pkgupdate developers
//
// SPDX-License-Identifier: MPL-2.0

//! Bounded execution of external programs.
//!
//! Children run in their own process group with both std streams
//! captured and tee'd to the log. Timeouts are two-phase: SIGTERM at the
//! wall deadline, SIGKILL to the whole group after a further kill
//! timeout.

use std::ffi::OsStr;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use log::debug;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::sleep;

/// Grace period between SIGTERM and SIGKILL
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(60);

/// How the child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Normal exit with the given code
    Exited(i32),
    /// Died after our SIGTERM at the wall timeout
    TermedByTimer,
    /// Survived SIGTERM, reaped after our SIGKILL to the group
    KilledByTimer,
    /// Terminated by a signal we did not send
    Signaled(i32),
}

impl Termination {
    pub fn success(&self) -> bool {
        matches!(self, Termination::Exited(0))
    }

    /// Exit code for reporting; signal deaths follow shell convention
    pub fn code(&self) -> i32 {
        match self {
            Termination::Exited(code) => *code,
            Termination::TermedByTimer => 128 + Signal::SIGTERM as i32,
            Termination::KilledByTimer => 128 + Signal::SIGKILL as i32,
            Termination::Signaled(signal) => 128 + signal,
        }
    }
}

#[derive(Debug)]
pub struct Output {
    pub termination: Termination,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Output {
    /// Both captured streams, stdout first, for changelog reporting
    pub fn combined(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        text
    }
}

type PreExec = Box<dyn FnMut() -> io::Result<()> + Send + Sync + 'static>;

/// Builder for one bounded subprocess invocation
pub struct Runner {
    program: PathBuf,
    args: Vec<std::ffi::OsString>,
    envs: Vec<(std::ffi::OsString, std::ffi::OsString)>,
    current_dir: Option<PathBuf>,
    timeout: Option<Duration>,
    kill_timeout: Duration,
    pre_exec: Option<PreExec>,
}

impl Runner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            timeout: None,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
            pre_exec: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> Self {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    /// Callback run in the child between fork and exec
    pub fn pre_exec(mut self, callback: impl FnMut() -> io::Result<()> + Send + Sync + 'static) -> Self {
        self.pre_exec = Some(Box::new(callback));
        self
    }

    pub async fn run(self) -> Result<Output, Error> {
        debug!(
            "Running subprocess: {} {}",
            self.program.display(),
            self.args
                .iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        if let Some(mut callback) = self.pre_exec {
            unsafe {
                command.pre_exec(move || callback());
            }
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::Spawn(self.program.clone(), e))?;
        let pgid = Pid::from_raw(child.id().expect("child pid") as i32);

        let stdout_pipe = child.stdout.take().expect("piped stdout");
        let stderr_pipe = child.stderr.take().expect("piped stderr");

        let label = self
            .program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let wait = async {
            let Some(timeout) = self.timeout else {
                return (child.wait().await, false, false);
            };

            tokio::select! {
                status = child.wait() => (status, false, false),
                _ = sleep(timeout) => {
                    debug!("Terminating process on timeout: {}", self.program.display());
                    let _ = killpg(pgid, Signal::SIGTERM);

                    tokio::select! {
                        status = child.wait() => (status, true, false),
                        _ = sleep(self.kill_timeout) => {
                            debug!("Killing process on timeout: {}", self.program.display());
                            let _ = killpg(pgid, Signal::SIGKILL);
                            (child.wait().await, true, true)
                        }
                    }
                }
            }
        };

        let (stdout, stderr, (status, termed, killed)) = tokio::join!(
            drain(stdout_pipe, &label, "stdout"),
            drain(stderr_pipe, &label, "stderr"),
            wait,
        );

        let status = status.map_err(Error::Wait)?;
        let termination = if killed {
            Termination::KilledByTimer
        } else if termed {
            Termination::TermedByTimer
        } else if let Some(code) = status.code() {
            Termination::Exited(code)
        } else {
            use std::os::unix::process::ExitStatusExt;
            Termination::Signaled(status.signal().unwrap_or(0))
        };

        Ok(Output {
            termination,
            stdout: stdout.map_err(Error::Capture)?,
            stderr: stderr.map_err(Error::Capture)?,
        })
    }
}

/// Capture a child pipe fully, tee'ing complete lines to the log
async fn drain(
    mut pipe: impl tokio::io::AsyncRead + Unpin,
    label: &str,
    stream: &str,
) -> io::Result<Vec<u8>> {
    let mut captured = Vec::new();
    let mut buf = [0u8; 4096];
    let mut line_from = 0;

    loop {
        let n = pipe.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        captured.extend_from_slice(&buf[..n]);

        while let Some(pos) = captured[line_from..].iter().position(|b| *b == b'\n') {
            let line = &captured[line_from..line_from + pos];
            debug!("{label} ({stream}): {}", String::from_utf8_lossy(line));
            line_from += pos + 1;
        }
    }

    if line_from < captured.len() {
        debug!(
            "{label} ({stream}): {}",
            String::from_utf8_lossy(&captured[line_from..])
        );
    }

    Ok(captured)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to spawn {}", .0.display())]
    Spawn(PathBuf, #[source] io::Error),
    #[error("failed to wait for child")]
    Wait(#[source] io::Error),
    #[error("failed to capture child output")]
    Capture(#[source] io::Error),
}
