/*!
 * PostgreSQL client command construction.
 *
 * All database work is delegated to `psql`, `pg_dump` and `pg_restore`.
 * Passwords never appear in an argument list: they are written to a
 * `.pgpass`-format file and handed to the tools through `PGPASSFILE`.
 */

use std::io::Write;
use std::path::Path;

use crate::app_config::DbConfig;
use crate::command::CommandSpec;
use crate::errors::{MigrationError, Result};
use crate::naming::MAX_IDENTIFIER_LEN;

/// `pg_dump` options: custom format, no privileges
pub const DUMP_OPTIONS: &[&str] = &["-Fc", "-x"];

/// `pg_restore` options: no privileges, no ownership, clean existing objects
pub const RESTORE_OPTIONS: &[&str] = &["-x", "-O", "-c", "--if-exists"];

/// Environment variable the client tools read the credentials file from
pub const PGPASSFILE_ENV: &str = "PGPASSFILE";

/// Escape one `.pgpass` field (`:` and `\` are special)
fn escape_pgpass_field(value: &str) -> String {
    value.replace('\\', r"\\").replace(':', r"\:")
}

/// Render the `.pgpass` line for `db`, valid for any database on that server
pub fn pgpass_line(db: &DbConfig) -> String {
    format!(
        "{}:{}:*:{}:{}\n",
        escape_pgpass_field(&db.host),
        db.port,
        escape_pgpass_field(&db.username),
        escape_pgpass_field(&db.password)
    )
}

/// Quote a database name as a PostgreSQL identifier
pub fn quote_ident(name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(MigrationError::InvalidIdentifier("empty name".to_string()));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(MigrationError::InvalidIdentifier(format!(
            "'{}' is longer than {} bytes",
            name, MAX_IDENTIFIER_LEN
        )));
    }
    if name.contains('\0') {
        return Err(MigrationError::InvalidIdentifier(format!("'{}' contains a NUL byte", name.escape_default())));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Local credentials file, removed when dropped
#[derive(Debug)]
pub struct PgPassFile {
    file: tempfile::NamedTempFile,
}

impl PgPassFile {
    /// Write the credentials for `db` to a new owner-only temp file
    pub fn create(db: &DbConfig) -> Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("pgpull-")
            .suffix(".pgpass")
            .tempfile()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))?;
        }

        file.write_all(pgpass_line(db).as_bytes())?;
        file.flush()?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Builds client tool invocations for one database server
#[derive(Debug, Clone)]
pub struct PgClient<'a> {
    db: &'a DbConfig,
    passfile: String,
}

impl<'a> PgClient<'a> {
    /// `passfile` is the credentials file path as seen by the host that runs the tools
    pub fn new(db: &'a DbConfig, passfile: impl Into<String>) -> Self {
        Self {
            db,
            passfile: passfile.into(),
        }
    }

    fn base(&self, program: &str, database: &str) -> CommandSpec {
        CommandSpec::new(program)
            .env(PGPASSFILE_ENV, self.passfile.clone())
            .args(["-h", self.db.host.as_str()])
            .args(["-p".to_string(), self.db.port.to_string()])
            .args(["-U", self.db.username.as_str()])
            .args(["-d", database])
            // never prompt for a password
            .arg("-w")
    }

    fn psql(&self, via: &str, sql: String) -> CommandSpec {
        self.base("psql", via)
            .args(["-X", "-v", "ON_ERROR_STOP=1", "-c"])
            .arg(sql)
    }

    /// `SELECT 1` against the configured database
    pub fn connectivity_check(&self) -> CommandSpec {
        self.psql(&self.db.database, "SELECT 1".to_string())
    }

    /// Dump the configured database to `file` in custom format
    pub fn dump(&self, file: &str) -> CommandSpec {
        self.base("pg_dump", &self.db.database)
            .args(DUMP_OPTIONS.iter().copied())
            .args(["-f", file])
    }

    /// Restore `file` into `target`
    pub fn restore(&self, target: &str, file: &str) -> CommandSpec {
        self.base("pg_restore", target)
            .args(RESTORE_OPTIONS.iter().copied())
            .arg(file)
    }

    /// `CREATE DATABASE name`, issued while connected to `via`
    pub fn create_database(&self, via: &str, name: &str) -> Result<CommandSpec> {
        Ok(self.psql(via, format!("CREATE DATABASE {}", quote_ident(name)?)))
    }

    /// `DROP DATABASE [IF EXISTS] name`, issued while connected to `via`
    pub fn drop_database(&self, via: &str, name: &str, if_exists: bool) -> Result<CommandSpec> {
        let guard = if if_exists { "IF EXISTS " } else { "" };
        Ok(self.psql(via, format!("DROP DATABASE {}{}", guard, quote_ident(name)?)))
    }

    /// `ALTER DATABASE from RENAME TO to`, issued while connected to `via`
    pub fn rename_database(&self, via: &str, from: &str, to: &str) -> Result<CommandSpec> {
        Ok(self.psql(
            via,
            format!("ALTER DATABASE {} RENAME TO {}", quote_ident(from)?, quote_ident(to)?),
        ))
    }
}
