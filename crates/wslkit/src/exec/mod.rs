//! Command execution boundary.
//!
//! Everything the engine does to a host or distribution goes through the
//! [`CommandExecutor`] trait. The engine never assumes a scripting
//! technology; it only needs to run a program with arguments against a
//! [`TargetEnvironment`] and read back exit code, stdout and stderr.
//!
//! - [`process::ProcessExecutor`] runs real processes through `wsl.exe`.
//! - [`fake::FakeHost`] simulates a WSL host in memory for tests.

pub mod fake;
pub mod process;

use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::secret::Secret;
use crate::target::TargetEnvironment;

pub use fake::FakeHost;
pub use process::ProcessExecutor;

/// Default per-command timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Maximum stderr excerpt carried in errors and diagnostics.
const STDERR_EXCERPT: usize = 512;

/// Data written to a command's standard input.
#[derive(Clone)]
pub enum Input {
    /// Ordinary bytes such as file content.
    Plain(Vec<u8>),
    /// Secret material; never logged.
    Secret(Secret),
}

impl Input {
    /// Raw bytes to write.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Plain(bytes) => bytes,
            Self::Secret(secret) => secret.expose().as_bytes(),
        }
    }
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(bytes) => write!(f, "Plain({} bytes)", bytes.len()),
            Self::Secret(_) => f.write_str("Secret(<redacted>)"),
        }
    }
}

/// A command to run against a target.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program to run.
    pub program: String,
    /// Arguments, passed verbatim (no shell).
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Optional standard input.
    pub stdin: Option<Input>,
    /// Kill the process after this long.
    pub timeout: Duration,
    /// Exit codes that count as success for [`CommandExecutor::execute`].
    pub allowed_exit_codes: Vec<i32>,
}

impl CommandSpec {
    /// Create a command with the default timeout and exit code 0 allowed.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            timeout: DEFAULT_TIMEOUT,
            allowed_exit_codes: vec![0],
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Feed plain bytes on stdin.
    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(Input::Plain(bytes.into()));
        self
    }

    /// Feed a secret on stdin.
    pub fn secret_stdin(mut self, secret: Secret) -> Self {
        self.stdin = Some(Input::Secret(secret));
        self
    }

    /// Override the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Treat these exit codes as success (0 must be listed explicitly).
    pub fn allow_exit_codes(mut self, codes: &[i32]) -> Self {
        self.allowed_exit_codes = codes.to_vec();
        self
    }

    /// Program and arguments joined for display. Stdin is never included.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Output of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code; `None` if killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: Vec::new(),
        }
    }

    /// Failed output with an exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: Vec::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the command exited 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Get stdout as a string (UTF-8 or the UTF-16LE `wsl.exe` emits).
    pub fn stdout_str(&self) -> String {
        decode_output(&self.stdout)
    }

    /// Get stderr as a string.
    pub fn stderr_str(&self) -> String {
        decode_output(&self.stderr)
    }

    /// Trimmed, length-limited stderr for error messages.
    pub fn stderr_excerpt(&self) -> String {
        let stderr = self.stderr_str();
        let trimmed = stderr.trim();
        if trimmed.chars().count() <= STDERR_EXCERPT {
            trimmed.to_string()
        } else {
            let cut: String = trimmed.chars().take(STDERR_EXCERPT).collect();
            format!("{cut}…")
        }
    }
}

/// Decode process output, detecting the UTF-16LE that `wsl.exe` writes.
pub fn decode_output(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(&[0xFF, 0xFE]).unwrap_or(bytes);
    let looks_utf16 = bytes.len() >= 2
        && bytes.len() % 2 == 0
        && bytes.iter().skip(1).step_by(2).filter(|b| **b == 0).count() * 2 >= bytes.len() / 2;

    if looks_utf16 {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(bytes).to_string()
    }
}

/// Runs commands against a target environment.
///
/// Implementations are stateless between calls.
pub trait CommandExecutor: Send + Sync {
    /// Run the command and return its output whatever the exit code.
    ///
    /// Fails only when the process cannot be launched or times out.
    fn spawn(&self, target: &TargetEnvironment, command: &CommandSpec) -> Result<CommandOutput>;

    /// Run the command and fail unless its exit code is allowed.
    fn execute(&self, target: &TargetEnvironment, command: &CommandSpec) -> Result<CommandOutput> {
        log::debug!("[{}] {}", target, command.display());
        let output = self.spawn(target, command)?;
        let allowed = output
            .exit_code
            .is_some_and(|code| command.allowed_exit_codes.contains(&code));
        if !allowed {
            return Err(Error::Execution {
                target: target.to_string(),
                program: command.program.clone(),
                exit_code: output.exit_code,
                stderr: output.stderr_excerpt(),
            });
        }
        Ok(output)
    }

    /// Run the command and capture trimmed stdout.
    fn capture(&self, target: &TargetEnvironment, command: &CommandSpec) -> Result<String> {
        Ok(self.execute(target, command)?.stdout_str().trim().to_string())
    }
}

impl<E: CommandExecutor + ?Sized> CommandExecutor for &E {
    fn spawn(&self, target: &TargetEnvironment, command: &CommandSpec) -> Result<CommandOutput> {
        (**self).spawn(target, command)
    }
}

impl<E: CommandExecutor + ?Sized> CommandExecutor for std::sync::Arc<E> {
    fn spawn(&self, target: &TargetEnvironment, command: &CommandSpec) -> Result<CommandOutput> {
        (**self).spawn(target, command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(CommandOutput);

    impl CommandExecutor for Fixed {
        fn spawn(&self, _: &TargetEnvironment, _: &CommandSpec) -> Result<CommandOutput> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_execute_rejects_unlisted_exit_code() {
        let exec = Fixed(CommandOutput::failed(1, "No such file"));
        let cmd = CommandSpec::new("stat").arg("/nope");
        let err = exec.execute(&TargetEnvironment::Host, &cmd).unwrap_err();
        match err {
            Error::Execution {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, Some(1));
                assert_eq!(stderr, "No such file");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_execute_accepts_allow_listed_exit_code() {
        let exec = Fixed(CommandOutput::failed(1, ""));
        let cmd = CommandSpec::new("test").args(["-e", "/nope"]).allow_exit_codes(&[0, 1]);
        let output = exec.execute(&TargetEnvironment::Host, &cmd).unwrap();
        assert!(!output.success());
    }

    #[test]
    fn test_decode_utf16_output() {
        let text = "  NAME      STATE\r\n";
        let bytes: Vec<u8> = text.encode_utf16().flat_map(u16::to_le_bytes).collect();
        assert_eq!(decode_output(&bytes), text);
        assert_eq!(decode_output(text.as_bytes()), text);
    }

    #[test]
    fn test_secret_stdin_is_redacted_in_debug() {
        let cmd = CommandSpec::new("chpasswd")
            .arg("-e")
            .secret_stdin(Secret::new("alice:$6$hash"));
        let debug = format!("{cmd:?}");
        assert!(!debug.contains("$6$hash"));
        assert!(debug.contains("<redacted>"));
        assert_eq!(cmd.display(), "chpasswd -e");
    }

    #[test]
    fn test_stderr_excerpt_is_bounded() {
        let output = CommandOutput::failed(2, "x".repeat(2000));
        assert!(output.stderr_excerpt().chars().count() <= STDERR_EXCERPT + 1);
    }
}
