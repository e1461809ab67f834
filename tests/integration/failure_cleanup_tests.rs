/*!
 * Integration tests for failure handling and cleanup ordering
 */

use anyhow::Result;

use pgpull::errors::MigrationError;
use pgpull::migration::Migration;
use crate::common::{
    self,
    mock_runner::{MockRunner, is_ssh_exit, is_ssh_master, remote_contains, sql_starts_with},
};

fn failed_program(error: &MigrationError) -> &str {
    match error {
        MigrationError::CommandFailed { program, .. } => program.as_str(),
        other => panic!("expected CommandFailed, got {}", other),
    }
}

/// Nothing remote happens when the local database is unreachable
#[tokio::test]
async fn test_unreachable_local_database_should_not_open_ssh() -> Result<()> {
    let (dir, config) = common::config_fixture()?;
    let runner = MockRunner::failing_when(sql_starts_with("SELECT 1"));

    let error = Migration::new(&config, &runner)
        .with_local_temp_dir(dir.path())
        .run()
        .await
        .unwrap_err();

    assert_eq!(failed_program(&error), "psql");
    assert_eq!(runner.commands().len(), 1);
    assert_eq!(runner.count(|c| c.program == "ssh" || c.program == "scp"), 0);
    Ok(())
}

#[tokio::test]
async fn test_ssh_failure_should_stop_before_any_remote_command() -> Result<()> {
    let (dir, config) = common::config_fixture()?;
    let runner = MockRunner::failing_when(is_ssh_master);

    let error = Migration::new(&config, &runner)
        .with_local_temp_dir(dir.path())
        .run()
        .await
        .unwrap_err();

    assert!(matches!(error, MigrationError::Session(_)));
    assert_eq!(runner.commands().len(), 2);
    assert!(runner.remote_lines().is_empty());
    Ok(())
}

/// A failed dump skips copy and restore; only the uploaded credentials are removed
#[tokio::test]
async fn test_dump_failure_should_skip_copy_and_restore() -> Result<()> {
    let (dir, config) = common::config_fixture()?;
    let runner = MockRunner::failing_when(remote_contains("pg_dump"));

    let error = Migration::new(&config, &runner)
        .with_local_temp_dir(dir.path())
        .run()
        .await
        .unwrap_err();

    assert_eq!(failed_program(&error), "pg_dump on db.example.com");
    assert_eq!(runner.count(|c| c.program == "scp" || c.program == "pg_restore"), 0);
    assert_eq!(runner.count(|c| c.program == "psql"), 1);

    let removals: Vec<String> = runner.remote_lines().into_iter().filter(|l| l.starts_with("rm")).collect();
    assert_eq!(removals.len(), 1);
    assert!(removals[0].ends_with(".pgpass"));
    assert_eq!(runner.count(is_ssh_exit), 1);
    Ok(())
}

/// An interrupted upload may leave a partial credentials file, which is still removed
#[tokio::test]
async fn test_upload_failure_should_still_remove_remote_credentials() -> Result<()> {
    let (dir, config) = common::config_fixture()?;
    let runner = MockRunner::failing_when(remote_contains("umask 077"));

    let error = Migration::new(&config, &runner)
        .with_local_temp_dir(dir.path())
        .run()
        .await
        .unwrap_err();

    assert_eq!(failed_program(&error), "sh on db.example.com");
    assert!(!runner.remote_lines().iter().any(|l| l.contains("pg_dump")));

    let removals: Vec<String> = runner.remote_lines().into_iter().filter(|l| l.starts_with("rm")).collect();
    assert_eq!(removals.len(), 1);
    assert!(removals[0].ends_with(".pgpass"));
    assert_eq!(runner.count(is_ssh_exit), 1);
    Ok(())
}

/// A failed restore leaves production untouched and releases every temp resource
#[tokio::test]
async fn test_restore_failure_should_clean_up_without_touching_production() -> Result<()> {
    let (dir, config) = common::config_fixture()?;
    let runner = MockRunner::failing_when(|c| c.program == "pg_restore")
        .with_simulated_copy()
        .with_databases(["postgres", "shop"]);

    let error = Migration::new(&config, &runner)
        .with_local_temp_dir(dir.path())
        .run()
        .await
        .unwrap_err();

    assert_eq!(failed_program(&error), "pg_restore");

    let sql = runner.sql();
    assert!(!sql.iter().any(|s| s == "DROP DATABASE \"shop\""));
    assert!(!sql.iter().any(|s| s.starts_with("ALTER DATABASE")));
    assert!(sql.iter().any(|s| s.starts_with("DROP DATABASE IF EXISTS \"shop_restored_")));
    assert!(sql.iter().any(|s| s.starts_with("DROP DATABASE \"shop_intermediate_")));

    assert_eq!(runner.remote_lines().iter().filter(|l| l.starts_with("rm")).count(), 2);
    assert!(
        std::fs::read_dir(dir.path())?.all(|e| e.map(|e| !e.file_name().to_string_lossy().ends_with(".dump")).unwrap_or(true)),
        "local dump should be removed"
    );
    assert_eq!(runner.databases(), vec!["postgres".to_string(), "shop".to_string()]);
    assert_eq!(runner.count(is_ssh_exit), 1);
    Ok(())
}

/// Once the production database is dropped there is no rollback, but every
/// temporary resource is still released
#[tokio::test]
async fn test_rename_failure_should_release_temporaries_without_recreating_production() -> Result<()> {
    let (dir, config) = common::config_fixture()?;
    let runner = MockRunner::failing_when(sql_starts_with("ALTER DATABASE")).with_databases(["postgres", "shop"]);

    let error = Migration::new(&config, &runner)
        .with_local_temp_dir(dir.path())
        .run()
        .await
        .unwrap_err();

    assert_eq!(failed_program(&error), "psql");
    assert_eq!(error.stderr(), Some("mock failure"));

    let sql = runner.sql();
    assert_eq!(sql.iter().filter(|s| s.as_str() == "DROP DATABASE \"shop\"").count(), 1);
    assert!(!sql.iter().any(|s| s.starts_with("CREATE DATABASE \"shop\"")));

    // production is gone; no temporary database is left behind
    assert_eq!(runner.databases(), vec!["postgres".to_string()]);

    let removals: Vec<String> = runner.remote_lines().into_iter().filter(|l| l.starts_with("rm")).collect();
    assert_eq!(removals.len(), 2);
    assert!(removals[0].ends_with(".pgpass"));
    assert!(removals[1].ends_with(".dump"));
    assert_eq!(runner.count(is_ssh_exit), 1);
    Ok(())
}

/// A failing cleanup action stops the remaining ones but the session is still closed
#[tokio::test]
async fn test_cleanup_failure_should_skip_remaining_actions() -> Result<()> {
    let (dir, config) = common::config_fixture()?;
    let runner = MockRunner::failing_when(sql_starts_with("DROP DATABASE \"shop_intermediate_"));

    let error = Migration::new(&config, &runner)
        .with_local_temp_dir(dir.path())
        .run()
        .await
        .unwrap_err();

    assert_eq!(failed_program(&error), "psql");
    let removals: Vec<String> = runner.remote_lines().into_iter().filter(|l| l.starts_with("rm")).collect();
    assert_eq!(removals.len(), 1, "remote dump removal should be skipped after the failure");
    assert!(removals[0].ends_with(".pgpass"));
    assert_eq!(runner.count(is_ssh_exit), 1);
    Ok(())
}
