/*!
 * # pgpull - pull a remote PostgreSQL database into a local server
 *
 * Dumps a database on a remote host over SSH, copies the dump locally and
 * restores it into a fresh local database that is then renamed over the
 * production one.
 *
 * ## Architecture
 *
 * - `app_config`: Configuration loading and validation
 * - `command`: External command description and execution
 * - `postgres`: `psql` / `pg_dump` / `pg_restore` invocations and credentials files
 * - `remote`: SSH control connection, remote execution and `scp`
 * - `naming`: Per-run temp file and database names
 * - `migration`: Step sequencing and cleanup
 * - `errors`: Error types
 *
 * ## License
 *
 * This project is licensed under the MIT License
 */

// Global lints configuration
#![allow(clippy::uninlined_format_args)]

pub mod app_config;
pub mod command;
pub mod errors;
pub mod migration;
pub mod naming;
pub mod postgres;
pub mod remote;

// Re-export main types for easier usage
pub use app_config::{Config, DbConfig, HostKeyPolicy, ServerConfig};
pub use command::{CommandOutput, CommandRunner, CommandSpec, DryRunRunner, ProcessRunner};
pub use errors::{ConfigError, MigrationError};
pub use migration::{CleanupAction, Migration, MigrationReport};
