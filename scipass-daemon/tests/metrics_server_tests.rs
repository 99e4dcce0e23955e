//! Metrics recorder installation tests.
//!
//! A process has one global recorder, so only one test installs it.

use scipass_core::config::MetricsConfig;
use scipass_daemon::metrics_server;
use serial_test::serial;

#[test]
#[serial]
fn test_install_metrics_recorder_succeeds_with_valid_config() {
    // Given: a loopback listener on a non-standard port
    let config = MetricsConfig {
        enabled: true,
        listen_addr: "127.0.0.1".to_owned(),
        port: 19_100,
        endpoint: "/metrics".to_owned(),
    };

    // When
    let result = metrics_server::install_metrics_recorder(&config);

    // Then
    assert!(result.is_ok(), "install should succeed: {:?}", result.err());
}

#[test]
#[serial]
fn test_install_metrics_recorder_fails_with_invalid_address() {
    let config = MetricsConfig {
        enabled: true,
        listen_addr: "999.999.999.999".to_owned(),
        port: 9100,
        endpoint: "/metrics".to_owned(),
    };

    let result = metrics_server::install_metrics_recorder(&config);

    assert!(result.is_err(), "invalid address should be rejected");
}

#[test]
#[serial]
fn test_install_metrics_recorder_rejects_unsupported_endpoint() {
    let config = MetricsConfig {
        enabled: true,
        listen_addr: "127.0.0.1".to_owned(),
        port: 19_101,
        endpoint: "/stats".to_owned(),
    };

    let err = metrics_server::install_metrics_recorder(&config).unwrap_err();

    assert!(err.to_string().contains("/stats"));
}
