/*!
 * Tests for configuration loading and validation
 */

use anyhow::Result;
use std::path::PathBuf;

use pgpull::app_config::{Config, HostKeyPolicy, LogLevel};
use pgpull::errors::ConfigError;
use crate::common;

const MINIMAL_CONFIG: &str = r#"{
    "server": {
        "host": "db.example.com",
        "user": "deploy",
        "private_key_file": "/keys/id_ed25519",
        "db": { "host": "localhost", "database": "shop", "username": "shop_owner", "password": "pw" }
    },
    "local_db": { "host": "localhost", "database": "shop", "username": "postgres", "password": "pw" }
}"#;

/// Optional fields fall back to their defaults
#[test]
fn test_load_minimal_config_should_apply_defaults() -> Result<()> {
    let dir = common::create_temp_dir()?;
    let path = common::create_test_file(dir.path(), "config.json", MINIMAL_CONFIG)?;

    let config = Config::load(&path)?;

    assert_eq!(config.server.port, 22);
    assert_eq!(config.server.db.port, 5432);
    assert_eq!(config.local_db.port, 5432);
    assert_eq!(config.server.host_key_policy, HostKeyPolicy::AcceptNew);
    assert_eq!(config.server.private_key_file, PathBuf::from("/keys/id_ed25519"));
    assert_eq!(config.log_level, LogLevel::Info);
    assert_eq!(config.temp_dir, "/tmp");
    assert_eq!(config.command_timeout_secs, None);
    assert_eq!(config.maintenance_database, "postgres");
    Ok(())
}

#[test]
fn test_load_yaml_config_should_match_json_layout() -> Result<()> {
    let dir = common::create_temp_dir()?;
    let yaml = r#"
server:
  host: db.example.com
  port: 2200
  user: deploy
  private_key_file: /keys/id_ed25519
  host_key_policy: strict
  db:
    host: localhost
    database: shop
    username: shop_owner
    password: "p:w"
local_db:
  host: localhost
  database: shop
  username: postgres
  password: pw
maintenance_database: template1
"#;
    let path = common::create_test_file(dir.path(), "config.yml", yaml)?;

    let config = Config::load(&path)?;

    assert_eq!(config.server.port, 2200);
    assert_eq!(config.server.host_key_policy, HostKeyPolicy::Strict);
    assert_eq!(config.server.db.password, "p:w");
    assert_eq!(config.local_db.port, 5432);
    assert_eq!(config.maintenance_database, "template1");
    Ok(())
}

#[test]
fn test_load_malformed_yaml_should_fail_with_parse_error() -> Result<()> {
    let dir = common::create_temp_dir()?;
    let path = common::create_test_file(dir.path(), "config.yaml", "server: [unclosed")?;

    assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
    Ok(())
}

#[test]
fn test_load_full_config_should_read_every_field() -> Result<()> {
    let dir = common::create_temp_dir()?;
    let json = r#"{
        "server": {
            "host": "10.1.1.1", "port": 2200, "user": "ops",
            "private_key_file": "/keys/k", "host_key_policy": "insecure",
            "db": { "host": "127.0.0.1", "port": 6543, "database": "crm", "username": "crm", "password": "a:b" }
        },
        "local_db": { "host": "db.local", "port": 5444, "database": "crm_copy", "username": "me", "password": "x" },
        "log_level": "debug",
        "temp_dir": "/var/tmp",
        "command_timeout_secs": 600
    }"#;
    let path = common::create_test_file(dir.path(), "config.json", json)?;

    let config = Config::load(&path)?;

    assert_eq!(config.server.port, 2200);
    assert_eq!(config.server.host_key_policy, HostKeyPolicy::Insecure);
    assert_eq!(config.server.db.port, 6543);
    assert_eq!(config.server.db.password, "a:b");
    assert_eq!(config.local_db.database, "crm_copy");
    assert_eq!(config.log_level, LogLevel::Debug);
    assert_eq!(config.temp_dir, "/var/tmp");
    assert_eq!(config.command_timeout_secs, Some(600));
    Ok(())
}

/// A missing file is an error, not a default config
#[test]
fn test_load_missing_file_should_fail_with_read_error() {
    let result = Config::load("/nonexistent/pgpull/config.json");
    assert!(matches!(result, Err(ConfigError::Read { .. })));
}

#[test]
fn test_load_malformed_file_should_fail_with_parse_error() -> Result<()> {
    let dir = common::create_temp_dir()?;
    let path = common::create_test_file(dir.path(), "config.json", "{ \"server\": ")?;

    assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
    Ok(())
}

#[test]
fn test_load_missing_section_should_fail_with_parse_error() -> Result<()> {
    let dir = common::create_temp_dir()?;
    let path = common::create_test_file(dir.path(), "config.json", r#"{ "server": {} }"#)?;

    assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
    Ok(())
}

#[test]
fn test_validate_complete_config_should_pass() -> Result<()> {
    let (_dir, config) = common::config_fixture()?;
    assert!(config.validate().is_ok());
    Ok(())
}

#[test]
fn test_validate_with_missing_values_should_fail() -> Result<()> {
    let (_dir, valid) = common::config_fixture()?;

    let mut config = valid.clone();
    config.server.host = "  ".to_string();
    assert!(config.validate().is_err());

    let mut config = valid.clone();
    config.server.db.database = String::new();
    assert!(config.validate().is_err());

    let mut config = valid.clone();
    config.local_db.username = String::new();
    assert!(config.validate().is_err());

    let mut config = valid.clone();
    config.local_db.port = 0;
    assert!(config.validate().is_err());

    let mut config = valid.clone();
    config.command_timeout_secs = Some(0);
    assert!(config.validate().is_err());

    let mut config = valid;
    config.maintenance_database = String::new();
    assert!(config.validate().is_err());
    Ok(())
}

/// The maintenance database must survive the drop of the production database
#[test]
fn test_validate_with_maintenance_database_equal_to_local_should_fail() -> Result<()> {
    let (_dir, mut config) = common::config_fixture()?;
    config.maintenance_database = config.local_db.database.clone();

    let error = config.validate().unwrap_err();
    assert!(error.to_string().contains("maintenance_database"));
    Ok(())
}

#[test]
fn test_validate_with_missing_key_file_should_fail() -> Result<()> {
    let (_dir, mut config) = common::config_fixture()?;
    config.server.private_key_file = PathBuf::from("/nonexistent/id_rsa");

    let error = config.validate().unwrap_err();
    assert!(error.to_string().contains("private_key_file"));
    Ok(())
}

/// Temp database names must fit PostgreSQL's identifier limit
#[test]
fn test_validate_with_long_database_name_should_fail() -> Result<()> {
    let (_dir, mut config) = common::config_fixture()?;

    config.local_db.database = "a".repeat(30);
    assert!(config.validate().is_ok());

    config.local_db.database = "a".repeat(31);
    let error = config.validate().unwrap_err();
    assert!(error.to_string().contains("too long"));
    Ok(())
}

#[test]
fn test_example_config_should_survive_save_and_load() -> Result<()> {
    let dir = common::create_temp_dir()?;
    let path = dir.path().join("config.json");

    let example = Config::example();
    example.save(&path)?;
    let loaded = Config::load(&path)?;

    assert_eq!(loaded, example);
    Ok(())
}

#[test]
fn test_example_config_should_survive_yaml_save_and_load() -> Result<()> {
    let dir = common::create_temp_dir()?;
    let path = dir.path().join("config.yaml");

    let example = Config::example();
    example.save(&path)?;
    assert!(std::fs::read_to_string(&path)?.contains("host_key_policy: accept-new"));

    assert_eq!(Config::load(&path)?, example);
    Ok(())
}
