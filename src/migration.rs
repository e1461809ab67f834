/*!
 * Migration orchestrator.
 *
 * Sequences the run:
 * 1. Local connectivity check
 * 2. SSH session
 * 3. Remote credentials upload and `pg_dump`
 * 4. `scp` of the dump
 * 5. Intermediate and restored databases, `pg_restore`
 * 6. Drop of the production database and rename of the restored one
 *
 * Every temporary resource registers a `CleanupAction` as soon as it exists.
 * The actions are drained in reverse order whether the pipeline succeeded or
 * failed. Completed steps are never rolled back.
 */

use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::app_config::Config;
use crate::command::{CommandRunner, CommandSpec};
use crate::errors::{MigrationError, Result};
use crate::naming::{RunId, TempNames};
use crate::postgres::{self, PgClient, PgPassFile};
use crate::remote::RemoteSession;

/// One scheduled release of a temporary resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupAction {
    /// `rm -f` on the remote host
    RemoveRemoteFile(String),
    /// Delete a local file; a missing file is not an error
    RemoveLocalFile(PathBuf),
    /// Drop a local database while connected to `via`
    DropDatabase { name: String, via: String, if_exists: bool },
}

impl fmt::Display for CleanupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoveRemoteFile(path) => write!(f, "remove remote file {}", path),
            Self::RemoveLocalFile(path) => write!(f, "remove local file {}", path.display()),
            Self::DropDatabase { name, .. } => write!(f, "drop database {}", name),
        }
    }
}

/// Pending cleanup actions in registration order, plus the ones already run
#[derive(Debug, Default)]
pub struct CleanupStack {
    actions: Vec<CleanupAction>,
    done: Vec<CleanupAction>,
}

impl CleanupStack {
    pub fn push(&mut self, action: CleanupAction) {
        self.actions.push(action);
    }

    /// Remove a pending action wherever it sits, to run it ahead of the others
    pub fn take(&mut self, action: &CleanupAction) -> Option<CleanupAction> {
        let index = self.actions.iter().rposition(|a| a == action)?;
        Some(self.actions.remove(index))
    }

    /// Record an action that completed
    pub fn record(&mut self, action: CleanupAction) {
        self.done.push(action);
    }

    /// Completed actions in the order they ran
    pub fn done(&self) -> &[CleanupAction] {
        &self.done
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Next action to run (the most recently registered)
    pub fn pop(&mut self) -> Option<CleanupAction> {
        self.actions.pop()
    }
}

/// Human-readable step numbering
#[derive(Debug, Default)]
pub struct StepCounter {
    current: usize,
}

impl StepCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log the start of the next step and return its number
    pub fn begin(&mut self, description: impl fmt::Display) -> usize {
        self.current += 1;
        info!("{}. {}", self.current, description);
        self.current
    }

    pub fn count(&self) -> usize {
        self.current
    }
}

/// Summary of a successful run
#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub run_id: RunId,
    pub steps: usize,
    pub elapsed: Duration,
    /// Cleanup actions in the order they ran
    pub cleaned_up: Vec<CleanupAction>,
}

/// Drives one migration run
pub struct Migration<'a> {
    config: &'a Config,
    runner: &'a dyn CommandRunner,
    local_temp_dir: PathBuf,
    show_progress: bool,
}

impl<'a> Migration<'a> {
    pub fn new(config: &'a Config, runner: &'a dyn CommandRunner) -> Self {
        Self {
            config,
            runner,
            local_temp_dir: std::env::temp_dir(),
            show_progress: false,
        }
    }

    /// Directory receiving the local copy of the dump
    pub fn with_local_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_temp_dir = dir.into();
        self
    }

    /// Show a spinner while long-running tools execute
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.show_progress = enabled;
        self
    }

    fn timeout(&self) -> Option<Duration> {
        self.config.command_timeout_secs.map(Duration::from_secs)
    }

    async fn run_local(&self, spec: CommandSpec) -> Result<()> {
        self.runner.run(&spec.timeout(self.timeout())).await?;
        Ok(())
    }

    /// Verify the local database accepts connections
    pub async fn check(&self) -> Result<()> {
        let passfile = PgPassFile::create(&self.config.local_db)?;
        let local = PgClient::new(&self.config.local_db, passfile.path().to_string_lossy());
        self.run_local(local.connectivity_check()).await
    }

    /// Run the whole migration
    pub async fn run(&self) -> Result<MigrationReport> {
        let start = Instant::now();
        let mut steps = StepCounter::new();
        let local_db = &self.config.local_db;

        let passfile = PgPassFile::create(local_db)?;
        let local = PgClient::new(local_db, passfile.path().to_string_lossy());

        steps.begin(format!(
            "Checking local database {} on {}:{}",
            local_db.database, local_db.host, local_db.port
        ));
        self.run_local(local.connectivity_check()).await?;

        let names = TempNames::new(
            RunId::generate(),
            &self.config.server.db.database,
            &local_db.database,
            &self.config.temp_dir,
            &self.local_temp_dir,
        );

        steps.begin(format!("SSH to {}", self.config.server.host));
        let mut session = RemoteSession::open(self.runner, &self.config.server, self.timeout()).await?;

        let mut cleanup = CleanupStack::default();
        let outcome = self
            .run_pipeline(&session, &local, &names, &mut steps, &mut cleanup)
            .await;
        let cleaned = self.drain(&session, &local, &mut steps, &mut cleanup).await;
        let cleaned_up = cleanup.done().to_vec();
        let closed = session.close().await;

        match outcome {
            Err(e) => {
                if let Err(cleanup_error) = &cleaned {
                    error!("Cleanup failed: {}", cleanup_error);
                }
                if let Err(close_error) = &closed {
                    warn!("Failed to close SSH session: {}", close_error);
                }
                Err(e)
            }
            Ok(()) => {
                cleaned?;
                closed?;
                info!("Database {} restored from {}", local_db.database, self.config.server.host);
                Ok(MigrationReport {
                    run_id: names.run_id,
                    steps: steps.count(),
                    elapsed: start.elapsed(),
                    cleaned_up,
                })
            }
        }
    }

    async fn run_pipeline(
        &self,
        session: &RemoteSession<'_>,
        local: &PgClient<'_>,
        names: &TempNames,
        steps: &mut StepCounter,
        cleanup: &mut CleanupStack,
    ) -> Result<()> {
        let server = &self.config.server;
        let production = &self.config.local_db.database;
        let maintenance = &self.config.maintenance_database;

        // Scheduled before the upload: an interrupted upload can leave a partial file.
        let remote_pgpass = CleanupAction::RemoveRemoteFile(names.remote_pgpass.clone());
        cleanup.push(remote_pgpass.clone());
        steps.begin(format!("Uploading credentials for {} to {}", server.db.database, server.host));
        session
            .exec_with_input(&upload_command(&names.remote_pgpass), postgres::pgpass_line(&server.db))
            .await?;

        let remote = PgClient::new(&server.db, names.remote_pgpass.clone());
        steps.begin(format!("Dumping database {} in {}", server.db.database, server.host));
        self.with_spinner("Dumping", session.exec(&remote.dump(&names.remote_dump)))
            .await?;
        cleanup.push(CleanupAction::RemoveRemoteFile(names.remote_dump.clone()));

        // The remote credentials are only needed by pg_dump.
        self.release_early(session, local, steps, cleanup, &remote_pgpass)
            .await?;

        steps.begin(format!("Copy dump file {} to local", names.remote_dump));
        self.with_spinner("Copying", session.copy_from(&names.remote_dump, &names.local_dump))
            .await?;
        cleanup.push(CleanupAction::RemoveLocalFile(names.local_dump.clone()));

        steps.begin(format!("Creating intermediate database {}", names.intermediate_db));
        self.run_local(local.create_database(production, &names.intermediate_db)?)
            .await?;
        cleanup.push(CleanupAction::DropDatabase {
            name: names.intermediate_db.clone(),
            via: maintenance.clone(),
            if_exists: false,
        });

        steps.begin(format!("Creating database {}", names.restored_db));
        self.run_local(local.create_database(&names.intermediate_db, &names.restored_db)?)
            .await?;
        cleanup.push(CleanupAction::DropDatabase {
            name: names.restored_db.clone(),
            via: names.intermediate_db.clone(),
            if_exists: true,
        });

        steps.begin(format!("Restoring {} to database {}", names.local_dump.display(), names.restored_db));
        let dump_path = names.local_dump.to_string_lossy();
        self.with_spinner("Restoring", self.run_local(local.restore(&names.restored_db, &dump_path)))
            .await?;

        steps.begin(format!("Dropping database {}", production));
        self.run_local(local.drop_database(&names.intermediate_db, production, false)?)
            .await?;

        steps.begin(format!("Renaming {} to {}", names.restored_db, production));
        self.run_local(local.rename_database(&names.intermediate_db, &names.restored_db, production)?)
            .await?;

        Ok(())
    }

    /// Run one pending cleanup action now. On failure it goes back on the
    /// stack and is retried first when the stack is drained.
    async fn release_early(
        &self,
        session: &RemoteSession<'_>,
        local: &PgClient<'_>,
        steps: &mut StepCounter,
        cleanup: &mut CleanupStack,
        action: &CleanupAction,
    ) -> Result<()> {
        let Some(action) = cleanup.take(action) else {
            return Ok(());
        };

        steps.begin(capitalize(&action.to_string()));
        match self.release(session, local, &action).await {
            Ok(()) => {
                cleanup.record(action);
                Ok(())
            }
            Err(e) => {
                cleanup.push(action);
                Err(e)
            }
        }
    }

    /// Run the cleanup actions, newest first. Stops at the first failure.
    async fn drain(
        &self,
        session: &RemoteSession<'_>,
        local: &PgClient<'_>,
        steps: &mut StepCounter,
        cleanup: &mut CleanupStack,
    ) -> Result<()> {
        while let Some(action) = cleanup.pop() {
            steps.begin(capitalize(&action.to_string()));
            if let Err(e) = self.release(session, local, &action).await {
                if !cleanup.is_empty() {
                    warn!("Skipping {} remaining cleanup action(s)", cleanup.len());
                }
                return Err(e);
            }
            cleanup.record(action);
        }

        Ok(())
    }

    async fn release(&self, session: &RemoteSession<'_>, local: &PgClient<'_>, action: &CleanupAction) -> Result<()> {
        match action {
            CleanupAction::RemoveRemoteFile(path) => {
                session.exec(&CommandSpec::new("rm").args(["-f", path.as_str()])).await?;
            }
            CleanupAction::RemoveLocalFile(path) => remove_local_file(path).await?,
            CleanupAction::DropDatabase { name, via, if_exists } => {
                self.run_local(local.drop_database(via, name, *if_exists)?).await?;
            }
        }
        Ok(())
    }

    async fn with_spinner<F, T>(&self, message: &str, future: F) -> T
    where
        F: Future<Output = T>,
    {
        if !self.show_progress {
            return future.await;
        }

        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg} [{elapsed_precise}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        spinner.set_style(style);
        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(120));

        let result = future.await;
        spinner.finish_and_clear();
        result
    }
}

/// Remote command writing its stdin to an owner-only file
fn upload_command(path: &str) -> CommandSpec {
    CommandSpec::new("sh").args([
        "-c".to_string(),
        format!("umask 077 && cat > {}", crate::command::shell_quote(path)),
    ])
}

async fn remove_local_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MigrationError::Io(e)),
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
