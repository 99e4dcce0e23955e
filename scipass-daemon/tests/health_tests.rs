//! Health aggregation tests.

use scipass_core::pipeline::HealthStatus;
use scipass_daemon::health::{ModuleHealth, aggregate_status};

fn module(name: &str, enabled: bool, status: HealthStatus) -> ModuleHealth {
    ModuleHealth {
        name: name.to_owned(),
        enabled,
        status,
    }
}

#[test]
fn test_aggregate_status_all_healthy() {
    // Given: every module healthy
    let modules = vec![
        module("control-plane", true, HealthStatus::Healthy),
        module("transport", true, HealthStatus::Healthy),
    ];

    // When / Then
    assert!(aggregate_status(&modules).is_healthy());
}

#[test]
fn test_aggregate_status_empty_is_healthy() {
    assert!(aggregate_status(&[]).is_healthy());
}

#[test]
fn test_aggregate_status_one_degraded() {
    // Given: one degraded module
    let modules = vec![
        module("control-plane", true, HealthStatus::Degraded("command channel closed".to_owned())),
        module("transport", true, HealthStatus::Healthy),
    ];

    // When
    let status = aggregate_status(&modules);

    // Then: the reason names the module and the cause
    match status {
        HealthStatus::Degraded(reason) => {
            assert!(reason.contains("control-plane"));
            assert!(reason.contains("command channel closed"));
        }
        other => panic!("expected Degraded, got {other:?}"),
    }
}

#[test]
fn test_aggregate_status_unhealthy_wins() {
    // Given: one degraded and one unhealthy module
    let modules = vec![
        module("transport", true, HealthStatus::Degraded("slow".to_owned())),
        module("control-plane", true, HealthStatus::Unhealthy("stopped".to_owned())),
    ];

    // When
    let status = aggregate_status(&modules);

    // Then: only the unhealthy reason is reported
    assert_eq!(
        status,
        HealthStatus::Unhealthy("control-plane: stopped".to_owned())
    );
}

#[test]
fn test_aggregate_status_joins_multiple_reasons() {
    let modules = vec![
        module("a", true, HealthStatus::Unhealthy("down".to_owned())),
        module("b", true, HealthStatus::Unhealthy("gone".to_owned())),
    ];

    assert_eq!(
        aggregate_status(&modules),
        HealthStatus::Unhealthy("a: down; b: gone".to_owned())
    );
}

#[test]
fn test_aggregate_status_ignores_disabled_modules() {
    // Given: an unhealthy but disabled module
    let modules = vec![
        module("control-plane", true, HealthStatus::Healthy),
        module("transport", false, HealthStatus::Unhealthy("not configured".to_owned())),
    ];

    // Then: it does not affect the result
    assert!(aggregate_status(&modules).is_healthy());
}
