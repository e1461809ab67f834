/*!
 * Error types for the pgpull application.
 *
 * Every failure is fatal to a migration run; the variants only exist so the
 * diagnostic text (captured stderr, offending identifier, config path) can be
 * reported precisely before the process exits.
 */

use thiserror::Error;

/// Errors raised while loading the configuration file
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON/YAML or does not match the expected layout
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The configuration could not be rendered for writing
    #[error("Failed to serialize config for {path}: {source}")]
    Serialize {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The file could not be written
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A field is missing or has an unusable value
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main error type for a migration run
#[derive(Error, Debug)]
pub enum MigrationError {
    /// Configuration could not be loaded or validated
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An external program could not be started
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// An external program exited with a non-zero status
    #[error("{program} failed ({status}): {stderr}")]
    CommandFailed {
        /// Program name (`psql`, `ssh`, ...)
        program: String,
        /// Exit status as reported by the OS, e.g. `exit status: 1`
        status: String,
        /// Captured standard error, trimmed
        stderr: String,
    },

    /// An external program exceeded the configured timeout
    #[error("{program} timed out after {secs} seconds")]
    Timeout { program: String, secs: u64 },

    /// The SSH control connection could not be established or used
    #[error("SSH session error: {0}")]
    Session(String),

    /// A database name cannot be used as a PostgreSQL identifier
    #[error("Invalid database identifier: {0}")]
    InvalidIdentifier(String),

    /// Local filesystem error
    #[error("File error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigrationError {
    /// Captured stderr of a failed command, if any
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::CommandFailed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, MigrationError>;
