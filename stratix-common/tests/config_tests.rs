//! Unit tests for configuration loading and graceful degradation
//!
//! - Missing TOML files SHALL NOT cause termination
//! - Unparseable TOML files SHALL be reported as configuration errors
//! - Config path priority: CLI → environment → platform default
//!
//! Note: Uses serial_test to prevent ENV variable race conditions.

use serde::Deserialize;
use serial_test::serial;
use std::env;
use std::path::{Path, PathBuf};
use stratix_common::config::{load_toml_or_default, resolve_config_path, LoggingConfig};
use stratix_common::Error;
use tempfile::TempDir;

#[derive(Debug, Default, Deserialize, PartialEq)]
struct SampleConfig {
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    logging: LoggingConfig,
}

#[test]
fn test_missing_file_yields_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("does-not-exist.toml");

    let config: SampleConfig = load_toml_or_default(Some(&path)).unwrap();
    assert_eq!(config, SampleConfig::default());
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_no_path_yields_defaults() {
    let config: SampleConfig = load_toml_or_default(None).unwrap();
    assert_eq!(config.port, None);
}

#[test]
fn test_valid_file_is_loaded() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ingest.toml");
    std::fs::write(
        &path,
        "port = 6100\n[logging]\nlevel = \"stratix_ingest=debug\"\n",
    )
    .unwrap();

    let config: SampleConfig = load_toml_or_default(Some(&path)).unwrap();
    assert_eq!(config.port, Some(6100));
    assert_eq!(config.logging.level, "stratix_ingest=debug");
}

#[test]
fn test_malformed_file_is_config_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "port = [not toml").unwrap();

    let result: Result<SampleConfig, _> = load_toml_or_default(Some(&path));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
#[serial]
fn test_cli_path_wins_over_env() {
    env::set_var("STRATIX_TEST_CONFIG", "/tmp/from-env.toml");

    let resolved = resolve_config_path(
        "ingest",
        Some(Path::new("/tmp/from-cli.toml")),
        "STRATIX_TEST_CONFIG",
    );
    assert_eq!(resolved, Some(PathBuf::from("/tmp/from-cli.toml")));

    env::remove_var("STRATIX_TEST_CONFIG");
}

#[test]
#[serial]
fn test_env_path_used_without_cli() {
    env::set_var("STRATIX_TEST_CONFIG", "/tmp/from-env.toml");

    let resolved = resolve_config_path("ingest", None, "STRATIX_TEST_CONFIG");
    assert_eq!(resolved, Some(PathBuf::from("/tmp/from-env.toml")));

    env::remove_var("STRATIX_TEST_CONFIG");
}

#[test]
#[serial]
fn test_platform_default_path_names_module() {
    env::remove_var("STRATIX_TEST_CONFIG");

    if let Some(path) = resolve_config_path("ingest", None, "STRATIX_TEST_CONFIG") {
        assert!(path.ends_with("stratix/ingest.toml"));
    }
}
