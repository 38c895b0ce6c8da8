//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Voltage protection policy engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
mod support;

use support::{scenario_config, Harness, PlatformCall};
use voltguard_common::PolicyConfig;
use voltguard_policy::{ManagedDevice, PolicyError, PolicyEventKind, ProtectionState};

fn countdown_ticks(kinds: &[PolicyEventKind]) -> Vec<u32> {
    kinds
        .iter()
        .filter_map(|k| match k {
            PolicyEventKind::CountdownTick { remaining_secs } => Some(*remaining_secs),
            _ => None,
        })
        .collect()
}

#[test]
fn brownout_and_recovery() {
    let h = Harness::new(scenario_config());

    h.feed(11.0, 4);
    assert_eq!(h.policy.state(), ProtectionState::LowVoltage);
    h.feed(11.0, 1);
    assert_eq!(h.policy.state(), ProtectionState::Protected);
    assert_eq!(h.policy.status().protection_count, 0);

    let kinds = h.kinds();
    let shutdown_at = kinds
        .iter()
        .position(|k| *k == PolicyEventKind::ShutdownStart)
        .expect("shutdown started");
    let protected_at = kinds
        .iter()
        .position(|k| *k == PolicyEventKind::Protected)
        .expect("protected");
    assert!(shutdown_at < protected_at);
    assert_eq!(countdown_ticks(&kinds), vec![4, 3, 2, 1, 0]);

    h.clear_events();
    h.feed(19.0, 2);
    assert_eq!(h.policy.state(), ProtectionState::Recovery);
    assert_eq!(h.restarts(), 0);
    h.feed(19.0, 1);

    let kinds = h.kinds();
    assert_eq!(kinds.first(), Some(&PolicyEventKind::StateChanged {
        from: ProtectionState::Protected,
        to: ProtectionState::Recovery,
    }));
    assert_eq!(kinds.last(), Some(&PolicyEventKind::RecoveryComplete));
    assert_eq!(h.restarts(), 1);
    assert_eq!(h.process.restarts.lock()[0], "supply voltage recovered");
    assert_eq!(h.policy.status().protection_count, 1);
    let complete = h.events.lock().last().cloned().expect("event");
    assert_eq!(complete.status.protection_count, 1);

    // the engine is terminal once a restart has been requested
    h.feed(5.5, 10);
    assert_eq!(h.restarts(), 1);
}

#[test]
fn countdown_decreases_strictly_to_zero() {
    let h = Harness::new(PolicyConfig {
        shutdown_delay_secs: 12,
        ..scenario_config()
    });
    h.feed(12.0, 12);
    let ticks = countdown_ticks(&h.kinds());
    assert_eq!(ticks, (0..12).rev().collect::<Vec<_>>());
    assert_eq!(h.policy.state(), ProtectionState::Protected);
}

#[test]
fn recovery_hold_ticks_down_before_restart() {
    let h = Harness::new(scenario_config());
    h.feed(11.0, 5);
    assert_eq!(h.policy.state(), ProtectionState::Protected);
    h.clear_events();

    h.feed(19.0, 3);
    let kinds = h.kinds();
    assert_eq!(
        kinds,
        vec![
            PolicyEventKind::StateChanged {
                from: ProtectionState::Protected,
                to: ProtectionState::Recovery,
            },
            PolicyEventKind::RecoveryStart { voltage: 19.0 },
            PolicyEventKind::RecoveryTick { remaining_secs: 2 },
            PolicyEventKind::RecoveryTick { remaining_secs: 1 },
            PolicyEventKind::RecoveryTick { remaining_secs: 0 },
            PolicyEventKind::RecoveryComplete,
        ]
    );
    assert_eq!(h.restarts(), 1);
}

#[test]
fn voltage_return_cancels_countdown() {
    let h = Harness::new(scenario_config());
    h.feed(11.0, 3);
    assert_eq!(h.policy.status().countdown_remaining_secs, 2);
    h.feed(12.6, 1);
    assert_eq!(h.policy.state(), ProtectionState::Normal);
    assert_eq!(h.policy.status().countdown_remaining_secs, 0);
    h.feed(14.0, 10);
    assert_eq!(h.policy.state(), ProtectionState::Normal);
    assert!(h.platform.calls().is_empty());
    assert!(!h.kinds().contains(&PolicyEventKind::ShutdownStart));
}

#[test]
fn dip_during_hold_returns_to_protected() {
    let h = Harness::new(scenario_config());
    h.feed(11.0, 5);
    h.feed(19.0, 2);
    assert_eq!(h.policy.state(), ProtectionState::Recovery);
    h.clear_events();
    h.feed(17.9, 1);
    assert_eq!(h.policy.state(), ProtectionState::Protected);
    assert_eq!(
        h.kinds(),
        vec![PolicyEventKind::StateChanged {
            from: ProtectionState::Recovery,
            to: ProtectionState::Protected,
        }]
    );
    assert_eq!(h.policy.status().recovery_timer_remaining_secs, 0);
    assert_eq!(h.restarts(), 0);
    assert!(!h.kinds().contains(&PolicyEventKind::RecoveryComplete));

    // a later stable recovery starts the hold from scratch
    h.feed(19.0, 3);
    assert_eq!(h.restarts(), 1);
}

#[test]
fn implausible_readings_never_trigger_protection() {
    let h = Harness::new(PolicyConfig {
        low_voltage_threshold: 100.0,
        recovery_voltage_threshold: 200.0,
        ..scenario_config()
    });
    h.policy.process_tick();
    h.feed(0.0, 10);
    h.feed(4.99, 10);
    h.feed(f64::NAN, 3);
    assert_eq!(h.policy.state(), ProtectionState::Normal);
    assert!(h.kinds().is_empty());

    h.voltage.clear();
    h.policy.process_tick();
    assert_eq!(h.policy.state(), ProtectionState::Normal);
}

#[test]
fn last_good_voltage_carries_through_sensor_dropout() {
    let h = Harness::new(scenario_config());
    h.feed(11.0, 2);
    h.feed(0.0, 3);
    assert_eq!(h.policy.state(), ProtectionState::Protected);
    assert_eq!(h.policy.status().current_voltage, 11.0);
}

#[test]
fn shutdown_sequence_probes_then_cuts_rails() {
    let h = Harness::new(scenario_config());
    h.feed(11.0, 5);
    assert_eq!(
        h.platform.calls(),
        vec![
            PlatformCall::Probe(ManagedDevice::DeviceA),
            PlatformCall::Graceful(ManagedDevice::DeviceA),
            PlatformCall::Power(ManagedDevice::DeviceA, false),
            PlatformCall::Power(ManagedDevice::DeviceB, false),
        ]
    );
}

#[test]
fn disconnected_device_skips_liveness_probe() {
    let h = Harness::new(scenario_config());
    h.platform.status.lock().device_a_connected = false;
    h.feed(11.0, 5);
    let calls = h.platform.calls();
    assert!(!calls.contains(&PlatformCall::Probe(ManagedDevice::DeviceA)));
    assert!(calls.contains(&PlatformCall::Power(ManagedDevice::DeviceA, false)));
}

#[test]
fn collaborator_failures_do_not_block_protection() {
    let h = Harness::new(scenario_config());
    *h.platform.reachable.lock() = Err("link down".into());
    *h.platform.fail_power.lock() = true;
    h.feed(11.0, 5);
    assert_eq!(h.policy.state(), ProtectionState::Protected);
    assert!(!h.platform.calls().contains(&PlatformCall::Graceful(ManagedDevice::DeviceA)));
    assert_eq!(
        h.platform
            .calls()
            .iter()
            .filter(|c| matches!(c, PlatformCall::Power(_, false)))
            .count(),
        2
    );
}

#[test]
fn disabled_steps_are_skipped() {
    let h = Harness::new(PolicyConfig {
        liveness_check_before_shutdown: false,
        enable_device_shutdown: false,
        ..scenario_config()
    });
    h.feed(11.0, 5);
    assert_eq!(h.policy.state(), ProtectionState::Protected);
    assert!(h.platform.calls().is_empty());
}

#[test]
fn fans_stop_once_after_coast_down() {
    let h = Harness::new(PolicyConfig {
        enable_fan_control: true,
        fan_stop_delay_secs: 10,
        enable_device_shutdown: false,
        liveness_check_before_shutdown: false,
        ..scenario_config()
    });
    h.feed(11.0, 5);
    assert_eq!(h.policy.status().fan_stop_remaining_secs, 10);
    h.feed(11.0, 9);
    assert!(h.platform.calls().is_empty());
    h.feed(11.0, 1);
    assert_eq!(h.platform.calls(), vec![PlatformCall::Fans(false)]);
    h.feed(11.0, 20);
    assert_eq!(h.platform.calls(), vec![PlatformCall::Fans(false)]);
}

#[test]
fn auto_recovery_disabled_holds_protected() {
    let h = Harness::new(PolicyConfig {
        auto_recovery_enabled: false,
        ..scenario_config()
    });
    h.feed(11.0, 5);
    h.feed(24.0, 30);
    assert_eq!(h.policy.state(), ProtectionState::Protected);
    assert_eq!(h.restarts(), 0);
}

#[test]
fn setters_validate_without_transitions() {
    let h = Harness::new(scenario_config());
    h.feed(11.0, 2);

    assert!(matches!(
        h.policy.set_thresholds(18.0, 12.0),
        Err(PolicyError::InvalidArgument(_))
    ));
    assert!(h.policy.set_thresholds(0.0, 12.0).is_err());
    assert!(h.policy.set_shutdown_delay(4).is_err());
    assert!(h.policy.set_shutdown_delay(301).is_err());
    assert!(h.policy.set_recovery_hold(0).is_err());
    assert!(h.policy.set_fan_stop_delay(601).is_err());
    assert_eq!(h.policy.thresholds(), (12.6, 18.0));

    h.policy.set_thresholds(10.0, 16.0).unwrap();
    h.policy.set_shutdown_delay(300).unwrap();
    h.policy.set_recovery_hold(1).unwrap();
    h.policy.set_fan_stop_delay(10).unwrap();
    assert_eq!(h.policy.thresholds(), (10.0, 16.0));
    assert_eq!(h.policy.state(), ProtectionState::LowVoltage);
    assert_eq!(h.policy.status().countdown_remaining_secs, 3);

    let config = h.policy.config();
    assert_eq!(config.shutdown_delay_secs, 300);
    assert_eq!(config.recovery_hold_secs, 1);
    assert_eq!(config.fan_stop_delay_secs, 10);
}

#[test]
fn boolean_setters_update_config() {
    let h = Harness::new(PolicyConfig::default());
    assert!(h.policy.should_auto_start());
    h.policy.set_auto_start(false);
    h.policy.set_auto_recovery(false);
    h.policy.set_device_shutdown(false);
    h.policy.set_fan_control(true);
    h.policy.set_liveness_check(false);
    let config = h.policy.config();
    assert!(!h.policy.should_auto_start());
    assert!(!config.auto_recovery_enabled);
    assert!(!config.enable_device_shutdown);
    assert!(config.enable_fan_control);
    assert!(!config.liveness_check_before_shutdown);
}

#[test]
fn debug_mode_emits_status_every_tick() {
    let h = Harness::new(scenario_config());
    h.policy.set_debug_mode(true, None);
    assert!(h.policy.is_debug_mode());
    h.feed(24.0, 3);
    let debug_ticks: Vec<_> = h
        .events
        .lock()
        .iter()
        .filter(|e| e.kind == PolicyEventKind::DebugTick)
        .map(|e| e.status.clone())
        .collect();
    assert_eq!(debug_ticks.len(), 3);
    assert!(debug_ticks.iter().all(|s| s.debug_mode && s.current_voltage == 24.0));

    h.policy.set_debug_mode(true, Some(std::time::Duration::ZERO));
    assert!(!h.policy.is_debug_mode());
    h.clear_events();
    h.feed(24.0, 2);
    assert!(h.kinds().is_empty());
}

#[test]
fn reset_clears_state_and_restarts() {
    let h = Harness::new(scenario_config());
    h.feed(11.0, 5);
    h.policy.reset();
    assert_eq!(h.policy.state(), ProtectionState::Normal);
    assert_eq!(h.restarts(), 1);
    assert_eq!(h.process.restarts.lock()[0], "protection reset requested");
}

#[test]
fn trigger_test_requires_running_engine() {
    let h = Harness::new(scenario_config());
    assert!(matches!(
        h.policy.trigger_test(),
        Err(PolicyError::InvalidState(_))
    ));
    assert!(!h.policy.cancel_test());
}

#[test]
fn status_snapshot_reflects_engine() {
    let h = Harness::new(scenario_config());
    h.feed(11.0, 1);
    let status = h.policy.status();
    assert_eq!(status.state, ProtectionState::LowVoltage);
    assert_eq!(status.state_name, h.policy.state_name());
    assert_eq!(status.current_voltage, 11.0);
    assert_eq!(status.countdown_remaining_secs, 4);
    assert!(!status.running);
    assert!(status.device_status.device_a_powered);
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["state"], "LOW_VOLTAGE");
}
