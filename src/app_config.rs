use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::ConfigError;
use crate::naming;

/// Application configuration module
/// This module handles loading, validating and writing the migration
/// configuration: the remote server, its database and the local database.
/// Represents the application configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
    /// Remote server reached over SSH
    pub server: ServerConfig,

    /// Local database that receives the restored dump
    pub local_db: DbConfig,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Directory on the remote host for the dump and credentials files
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,

    /// Optional upper bound for every external command, in seconds
    #[serde(default)]
    pub command_timeout_secs: Option<u64>,

    /// Local database that outlives the swap; temporary databases are dropped through it
    #[serde(default = "default_maintenance_database")]
    pub maintenance_database: String,
}

/// On-disk config format, picked from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    /// `.yml` and `.yaml` files are YAML, anything else is JSON
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yml") || ext.eq_ignore_ascii_case("yaml") => Self::Yaml,
            _ => Self::Json,
        }
    }
}

/// Remote server connection settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ServerConfig {
    // @field: SSH host name or address
    pub host: String,

    // @field: SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    // @field: SSH login user
    pub user: String,

    // @field: Private key used for public-key authentication
    pub private_key_file: PathBuf,

    // @field: How the remote host key is verified
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,

    // @field: Database credentials as seen from the remote host
    pub db: DbConfig,
}

/// PostgreSQL connection credentials
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DbConfig {
    /// Database host
    pub host: String,

    /// Database port
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name
    pub database: String,

    /// Role used to connect
    pub username: String,

    /// Password for the role
    #[serde(default = "String::new")]
    pub password: String,
}

/// Remote host identity verification policy
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    // @policy: Host must already be in known_hosts
    Strict,
    // @policy: Unknown hosts are added on first use, changed keys are rejected
    #[default]
    AcceptNew,
    // @policy: Any host key is accepted
    Insecure,
}

impl HostKeyPolicy {
    // @returns: Value for ssh's StrictHostKeyChecking option
    pub fn strict_host_key_checking(&self) -> &'static str {
        match self {
            Self::Strict => "yes",
            Self::AcceptNew => "accept-new",
            Self::Insecure => "no",
        }
    }

    // @returns: Lowercase policy identifier
    pub fn to_lowercase_string(&self) -> String {
        match self {
            Self::Strict => "strict".to_string(),
            Self::AcceptNew => "accept-new".to_string(),
            Self::Insecure => "insecure".to_string(),
        }
    }
}

impl std::fmt::Display for HostKeyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_lowercase_string())
    }
}

impl std::str::FromStr for HostKeyPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "accept-new" => Ok(Self::AcceptNew),
            "insecure" => Ok(Self::Insecure),
            _ => Err(ConfigError::Invalid(format!("Invalid host key policy: {}", s))),
        }
    }
}

/// Log verbosity level
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_pg_port() -> u16 {
    5432
}

fn default_temp_dir() -> String {
    "/tmp".to_string()
}

fn default_maintenance_database() -> String {
    "postgres".to_string()
}

fn default_private_key_file() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("~"))
        .join(".ssh")
        .join("id_ed25519")
}

impl Config {
    /// Load the configuration from a JSON or YAML file.
    ///
    /// There is no fallback: a missing or malformed file is an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let parsed: Result<Config, Box<dyn std::error::Error + Send + Sync>> = match ConfigFormat::from_path(path) {
            ConfigFormat::Json => serde_json::from_str(&raw).map_err(Into::into),
            ConfigFormat::Yaml => serde_yaml::from_str(&raw).map_err(Into::into),
        };
        let mut config = parsed.map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        config.server.private_key_file = expand_home(&config.server.private_key_file);
        Ok(config)
    }

    /// Write the configuration in the format matching the file extension
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let rendered: Result<String, Box<dyn std::error::Error + Send + Sync>> = match ConfigFormat::from_path(path) {
            ConfigFormat::Json => serde_json::to_string_pretty(self).map_err(Into::into),
            ConfigFormat::Yaml => serde_yaml::to_string(self).map_err(Into::into),
        };
        let content = rendered.map_err(|source| ConfigError::Serialize {
            path: path.display().to_string(),
            source,
        })?;

        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    /// Validate the configuration for consistency and required values
    pub fn validate(&self) -> Result<(), ConfigError> {
        require("server.host", &self.server.host)?;
        require("server.user", &self.server.user)?;
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must be non-zero".to_string()));
        }

        if !self.server.private_key_file.is_file() {
            return Err(ConfigError::Invalid(format!(
                "server.private_key_file does not exist: {}",
                self.server.private_key_file.display()
            )));
        }

        self.server.db.validate("server.db")?;
        self.local_db.validate("local_db")?;

        // Temp database names are derived from the local database name.
        let longest = naming::longest_temp_database_name_len(&self.local_db.database);
        if longest > naming::MAX_IDENTIFIER_LEN {
            return Err(ConfigError::Invalid(format!(
                "local_db.database '{}' is too long: temporary database names would be {} bytes (limit {})",
                self.local_db.database,
                longest,
                naming::MAX_IDENTIFIER_LEN
            )));
        }

        require("maintenance_database", &self.maintenance_database)?;
        if self.maintenance_database == self.local_db.database {
            return Err(ConfigError::Invalid(format!(
                "maintenance_database must differ from local_db.database '{}': it is used after that database is dropped",
                self.local_db.database
            )));
        }

        require("temp_dir", &self.temp_dir)?;
        if self.command_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid("command_timeout_secs must be positive".to_string()));
        }

        Ok(())
    }

    /// Template configuration written by `pgpull init`
    pub fn example() -> Self {
        Config {
            server: ServerConfig {
                host: "db.example.com".to_string(),
                port: default_ssh_port(),
                user: "deploy".to_string(),
                private_key_file: default_private_key_file(),
                host_key_policy: HostKeyPolicy::default(),
                db: DbConfig {
                    host: "localhost".to_string(),
                    port: default_pg_port(),
                    database: "app".to_string(),
                    username: "app".to_string(),
                    password: "change-me".to_string(),
                },
            },
            local_db: DbConfig {
                host: "localhost".to_string(),
                port: default_pg_port(),
                database: "app".to_string(),
                username: "postgres".to_string(),
                password: "change-me".to_string(),
            },
            log_level: LogLevel::default(),
            temp_dir: default_temp_dir(),
            command_timeout_secs: None,
            maintenance_database: default_maintenance_database(),
        }
    }
}

impl DbConfig {
    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        require(&format!("{}.host", section), &self.host)?;
        require(&format!("{}.database", section), &self.database)?;
        require(&format!("{}.username", section), &self.username)?;
        if self.port == 0 {
            return Err(ConfigError::Invalid(format!("{}.port must be non-zero", section)));
        }
        Ok(())
    }
}

fn require(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("{} is required", field)));
    }
    Ok(())
}

/// Expand a leading `~/` to the user's home directory
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}
