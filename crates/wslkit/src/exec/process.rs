//! Real process execution through `wsl.exe`.

use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::exec::{CommandExecutor, CommandOutput, CommandSpec};
use crate::target::TargetEnvironment;

/// How often a running child is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Executor that spawns real processes.
///
/// Host commands run directly. Distribution commands are wrapped as
/// `wsl.exe --distribution <name> --user <user> --exec [env K=V...] program args...`
/// so no shell on either side reinterprets the arguments.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    wsl_path: String,
    user: String,
}

impl ProcessExecutor {
    /// Create an executor using `wsl.exe` from PATH and the `root` user.
    pub fn new() -> Self {
        Self {
            wsl_path: "wsl.exe".to_string(),
            user: "root".to_string(),
        }
    }

    /// Use a different `wsl.exe` binary.
    pub fn with_wsl_path(mut self, path: impl Into<String>) -> Self {
        self.wsl_path = path.into();
        self
    }

    /// Run guest commands as a different user.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Build the process invocation for a target.
    fn build(&self, target: &TargetEnvironment, spec: &CommandSpec) -> Command {
        match target {
            TargetEnvironment::Host => {
                let mut cmd = Command::new(&spec.program);
                cmd.args(&spec.args);
                for (key, value) in &spec.env {
                    cmd.env(key, value);
                }
                cmd
            }
            TargetEnvironment::Distribution(name) => {
                let mut cmd = Command::new(&self.wsl_path);
                cmd.args(["--distribution", name, "--user", &self.user, "--exec"]);
                if !spec.env.is_empty() {
                    cmd.arg("env");
                    for (key, value) in &spec.env {
                        cmd.arg(format!("{key}={value}"));
                    }
                }
                cmd.arg(&spec.program);
                cmd.args(&spec.args);
                cmd
            }
        }
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandExecutor for ProcessExecutor {
    fn spawn(&self, target: &TargetEnvironment, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut cmd = self.build(target, spec);
        cmd.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| Error::Launch {
            program: spec.program.clone(),
            source,
        })?;

        if let Some(input) = &spec.stdin
            && let Some(mut stdin) = child.stdin.take()
        {
            let bytes = input.as_bytes().to_vec();
            // Writer thread so a full pipe cannot deadlock against our reads
            thread::spawn(move || {
                let _ = stdin.write_all(&bytes);
            });
        }

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let exit_code = wait_with_timeout(&mut child, spec.timeout).map_err(|e| match e {
            WaitError::TimedOut => Error::ExecutionTimeout {
                target: target.to_string(),
                program: spec.program.clone(),
                timeout: spec.timeout,
            },
            WaitError::Io(source) => Error::Launch {
                program: spec.program.clone(),
                source,
            },
        })?;

        Ok(CommandOutput {
            exit_code,
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        })
    }
}

enum WaitError {
    TimedOut,
    Io(std::io::Error),
}

/// Poll until the child exits or the deadline passes, killing it on expiry.
fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
) -> std::result::Result<Option<i32>, WaitError> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status.code()),
            Ok(None) if Instant::now() >= deadline => {
                log::warn!("killing process {} after {:?}", child.id(), timeout);
                let _ = child.kill();
                let _ = child.wait();
                return Err(WaitError::TimedOut);
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => return Err(WaitError::Io(e)),
        }
    }
}

/// Read a pipe to the end on a background thread.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}
