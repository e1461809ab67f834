/*!
 * External command execution.
 *
 * Commands are described by a `CommandSpec` (program plus a discrete argument
 * list) and executed through the `CommandRunner` trait, so the orchestrator
 * can be driven by the real process runner, a dry-run runner or a test double.
 */

use async_trait::async_trait;
use log::{debug, info};
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::errors::{MigrationError, Result};

/// Description of one external program invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to execute, resolved through `PATH`
    pub program: String,
    /// Arguments passed as-is, never interpreted by a local shell
    pub args: Vec<String>,
    /// Extra environment variables
    pub envs: Vec<(String, String)>,
    /// Bytes written to the program's stdin
    pub stdin: Option<Vec<u8>>,
    /// Per-command timeout, overrides the runner default
    pub timeout: Option<Duration>,
    /// Run without capturing output (for programs that fork into the background)
    pub detached: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    /// Whether any argument equals `needle`
    pub fn has_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|a| a == needle)
    }

    /// Render the command as a POSIX shell line.
    ///
    /// Used both for logging and to build the command line a remote shell
    /// executes. Stdin content is never rendered.
    pub fn to_shell_line(&self) -> String {
        let mut parts = Vec::with_capacity(self.envs.len() + self.args.len() + 1);
        for (key, value) in &self.envs {
            parts.push(format!("{}={}", key, shell_quote(value)));
        }
        parts.push(shell_quote(&self.program));
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        parts.join(" ")
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_shell_line())?;
        if let Some(input) = &self.stdin {
            write!(f, " < [{} bytes]", input.len())?;
        }
        Ok(())
    }
}

/// Captured output of a successful command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Executes external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion.
    ///
    /// A non-zero exit is reported as `MigrationError::CommandFailed` carrying
    /// the captured stderr.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Runs commands as local child processes
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    default_timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `timeout` to every command that does not set its own
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            default_timeout: timeout,
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!("$ {}", spec);

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true);

        if spec.detached {
            command.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        } else {
            let stdin = if spec.stdin.is_some() { Stdio::piped() } else { Stdio::null() };
            command.stdin(stdin).stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        let mut child = command.spawn().map_err(|source| MigrationError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        // Written alongside the wait so a child that exits early still reports its stderr.
        let pipe = child.stdin.take();
        let feed = async move {
            if let (Some(input), Some(mut pipe)) = (spec.stdin.as_deref(), pipe) {
                pipe.write_all(input).await?;
                pipe.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let completed = async { tokio::join!(feed, child.wait_with_output()) };

        let (fed, output) = match spec.timeout.or(self.default_timeout) {
            Some(limit) => tokio::select! {
                result = completed => result,
                _ = tokio::time::sleep(limit) => {
                    return Err(MigrationError::Timeout {
                        program: spec.program.clone(),
                        secs: limit.as_secs(),
                    });
                }
            },
            None => completed.await,
        };
        let output = output?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            debug!("{} failed: {}", spec.program, stderr);
            return Err(MigrationError::CommandFailed {
                program: spec.program.clone(),
                status: output.status.to_string(),
                stderr,
            });
        }
        fed?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
        })
    }
}

/// Logs commands instead of running them
#[derive(Debug, Clone, Default)]
pub struct DryRunRunner;

#[async_trait]
impl CommandRunner for DryRunRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        info!("[dry-run] {}", spec);
        Ok(CommandOutput::default())
    }
}

/// Quote a word for a POSIX shell.
///
/// Words made only of unambiguous characters are returned unchanged.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '@' | '%' | '+' | ',' | '='));

    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
