/*!
 * SSH session to the remote server.
 *
 * One authenticated connection is opened with the system `ssh` client in
 * control-master mode. Every remote command and the `scp` transfer are
 * multiplexed over that connection, which is closed explicitly at the end of
 * the run.
 */

use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app_config::{HostKeyPolicy, ServerConfig};
use crate::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::errors::{MigrationError, Result};

/// An open control connection to the remote server
pub struct RemoteSession<'r> {
    runner: &'r dyn CommandRunner,
    server: &'r ServerConfig,
    // Holds the control socket and the ssh log; removed on drop.
    _control_dir: tempfile::TempDir,
    control_path: PathBuf,
    log_path: PathBuf,
    timeout: Option<Duration>,
    open: bool,
}

impl<'r> RemoteSession<'r> {
    /// Authenticate with the configured private key and start the control master
    pub async fn open(
        runner: &'r dyn CommandRunner,
        server: &'r ServerConfig,
        timeout: Option<Duration>,
    ) -> Result<RemoteSession<'r>> {
        let control_dir = tempfile::Builder::new().prefix("pgpull-ssh-").tempdir()?;
        let control_path = control_dir.path().join("control.sock");
        let log_path = control_dir.path().join("ssh.log");

        if server.host_key_policy == HostKeyPolicy::Insecure {
            warn!(
                "Host key verification is disabled for {}; any server presenting itself as this host will be trusted",
                server.host
            );
        }

        let mut session = RemoteSession {
            runner,
            server,
            _control_dir: control_dir,
            control_path,
            log_path,
            timeout,
            open: false,
        };

        // -f forks after authentication, so output is not captured; ssh writes
        // its diagnostics to the -E log instead.
        let spec = CommandSpec::new("ssh")
            .args(["-M", "-N", "-f"])
            .arg("-S")
            .arg(session.control_path_str())
            .arg("-E")
            .arg(session.log_path.to_string_lossy().to_string())
            .args(session.common_options())
            .args(["-p".to_string(), server.port.to_string()])
            .arg(session.destination())
            .timeout(timeout)
            .detached();

        match runner.run(&spec).await {
            Ok(_) => {
                session.open = true;
                info!("Connected to {}", session.destination());
                Ok(session)
            }
            Err(MigrationError::CommandFailed { status, .. }) => {
                let log = std::fs::read_to_string(&session.log_path).unwrap_or_default();
                Err(MigrationError::Session(format!(
                    "could not connect to {}:{} ({}): {}",
                    session.destination(),
                    server.port,
                    status,
                    log.trim()
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// `user@host`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.server.user, self.server.host)
    }

    pub fn control_path(&self) -> &Path {
        &self.control_path
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    fn control_path_str(&self) -> String {
        self.control_path.to_string_lossy().to_string()
    }

    /// Options shared by every ssh and scp invocation
    fn common_options(&self) -> Vec<String> {
        let mut options = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "IdentitiesOnly=yes".to_string(),
            "-i".to_string(),
            self.server.private_key_file.to_string_lossy().to_string(),
            "-o".to_string(),
            format!("StrictHostKeyChecking={}", self.server.host_key_policy.strict_host_key_checking()),
        ];
        if self.server.host_key_policy == HostKeyPolicy::Insecure {
            options.push("-o".to_string());
            options.push("UserKnownHostsFile=/dev/null".to_string());
        }
        options
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(MigrationError::Session(format!("session to {} is closed", self.destination())))
        }
    }

    /// Build the ssh invocation that runs `remote` through the control connection
    pub fn exec_spec(&self, remote: &CommandSpec) -> CommandSpec {
        let mut spec = CommandSpec::new("ssh")
            .arg("-S")
            .arg(self.control_path_str())
            .args(["-o", "ControlMaster=no"])
            .args(self.common_options())
            .args(["-p".to_string(), self.server.port.to_string()])
            .arg(self.destination())
            .arg(remote.to_shell_line())
            .timeout(self.timeout);
        spec.stdin = remote.stdin.clone();
        spec
    }

    /// Run a command on the remote host, failing on non-zero exit
    pub async fn exec(&self, remote: &CommandSpec) -> Result<CommandOutput> {
        self.ensure_open()?;
        debug!("[{}] $ {}", self.server.host, remote);

        self.runner
            .run(&self.exec_spec(remote))
            .await
            .map_err(|e| self.attribute(remote, e))
    }

    /// Run a command on the remote host with `input` on its stdin
    pub async fn exec_with_input(&self, remote: &CommandSpec, input: impl Into<Vec<u8>>) -> Result<CommandOutput> {
        self.exec(&remote.clone().stdin(input)).await
    }

    /// Build the scp invocation copying `remote_path` to `local_path`
    pub fn copy_spec(&self, remote_path: &str, local_path: &Path) -> CommandSpec {
        CommandSpec::new("scp")
            .arg("-q")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path_str()))
            .args(self.common_options())
            .args(["-P".to_string(), self.server.port.to_string()])
            .arg(format!("{}:{}", self.destination(), remote_path))
            .arg(local_path.to_string_lossy().to_string())
            .timeout(self.timeout)
    }

    /// Copy a remote file to the local filesystem
    pub async fn copy_from(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        self.ensure_open()?;
        self.runner.run(&self.copy_spec(remote_path, local_path)).await?;
        Ok(())
    }

    /// Stop the control master. Calling it on a closed session is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;

        let spec = CommandSpec::new("ssh")
            .arg("-S")
            .arg(self.control_path_str())
            .args(["-O", "exit"])
            .arg(self.destination())
            .timeout(self.timeout);
        self.runner.run(&spec).await?;
        debug!("Closed connection to {}", self.destination());
        Ok(())
    }

    /// Name the remote program in a failure instead of `ssh`
    fn attribute(&self, remote: &CommandSpec, error: MigrationError) -> MigrationError {
        match error {
            MigrationError::CommandFailed { status, stderr, .. } => MigrationError::CommandFailed {
                program: format!("{} on {}", remote.program, self.server.host),
                status,
                stderr,
            },
            other => other,
        }
    }
}
