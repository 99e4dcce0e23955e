//! Configuration loading as the daemon does it: example file, environment
//! overrides, command-line overrides.

use std::io::Write;

use clap::Parser;
use scipass_core::config::ScipassConfig;
use scipass_core::types::TopologyMode;
use scipass_daemon::cli::DaemonCli;
use serial_test::serial;

const EXAMPLE: &str = include_str!("../../scipass.toml.example");

#[test]
fn test_example_config_parses_and_validates() {
    // Given: the shipped example configuration
    let config = ScipassConfig::parse(EXAMPLE).expect("example should parse");

    // Then: it validates and describes one SciDMZ domain
    config.validate().expect("example should validate");
    assert_eq!(config.switches.len(), 1);
    let domain = &config.switches[0].domains[0];
    assert_eq!(domain.name, "R&E");
    assert_eq!(domain.mode, TopologyMode::BypassFirewall);
    assert_eq!(domain.sensor_groups.len(), 4);
    assert_eq!(domain.lan_prefixes().len(), 5);
}

#[tokio::test]
#[serial]
async fn test_load_applies_environment_overrides() {
    // Given: the example on disk and an override in the environment
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(EXAMPLE.as_bytes()).unwrap();
    // SAFETY: serialized; no other test touches the environment concurrently.
    unsafe { std::env::set_var("SCIPASS_CONTROL_BALANCE_INTERVAL_SECS", "45") };

    // When
    let result = ScipassConfig::load(file.path()).await;
    unsafe { std::env::remove_var("SCIPASS_CONTROL_BALANCE_INTERVAL_SECS") };

    // Then
    let config = result.expect("config should load");
    assert_eq!(config.control.balance_interval_secs, 45);
}

#[tokio::test]
#[serial]
async fn test_load_missing_file_fails() {
    let result = ScipassConfig::load("/nonexistent/scipass.toml").await;
    assert!(result.is_err());
}

#[test]
fn test_cli_overrides_take_precedence() {
    // Given: a config and command-line overrides
    let mut config = ScipassConfig::parse(EXAMPLE).unwrap();
    let cli = DaemonCli::parse_from([
        "scipass-daemon",
        "--log-level",
        "warn",
        "--pid-file",
        "/tmp/other.pid",
    ]);

    // When
    cli.apply_overrides(&mut config.general);

    // Then: overridden fields change, others keep the file values
    assert_eq!(config.general.log_level, "warn");
    assert_eq!(config.general.pid_file, "/tmp/other.pid");
    assert_eq!(config.general.log_format, "json");
    config.validate().unwrap();
}

#[test]
fn test_cli_invalid_log_level_fails_validation() {
    let mut config = ScipassConfig::parse(EXAMPLE).unwrap();
    let cli = DaemonCli::parse_from(["scipass-daemon", "--log-level", "loud"]);

    cli.apply_overrides(&mut config.general);

    assert!(config.validate().is_err());
}

#[test]
fn test_example_round_trips_through_toml() {
    // Given: the parsed example
    let config = ScipassConfig::parse(EXAMPLE).unwrap();

    // When: serialized and parsed again
    let rendered = toml::to_string(&config).expect("config should serialize");
    let reparsed = ScipassConfig::parse(&rendered).expect("rendered config should parse");

    // Then: the domain layout survives
    assert_eq!(
        reparsed.switches[0].domains[0].lan_prefixes(),
        config.switches[0].domains[0].lan_prefixes()
    );
}
