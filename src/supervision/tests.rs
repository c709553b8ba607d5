use super::*;
use crate::alive::AliveTimerDefinition;
use crate::config::{new_runtime_config, SupervisionConfig};
use crate::entity::{EntityDefinition, EntityKind, EntityRef, SupervisionStatus};
use crate::error::{ConfigError, SupervisionError};
use crate::tag::{DataTagDefinition, QualityStatus, RuleTagDefinition};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;

const PIK_NONE: i64 = -1;

/// P1 (timer 1000, state tag 3001) with E10 (timer 1010, state tag 3010),
/// E11 (comm fault tag 2011, fault when `false`) and SE100 under E10
/// (timer 1100). Data tags 1, 2 on E10 feed rule 50.
fn manager() -> SupervisionManager {
    let config = SupervisionConfig::default();
    let runtime = new_runtime_config(&config);
    runtime.write().unwrap().test_mode = false;
    runtime.write().unwrap().reject_delayed_alive = true;
    let manager = SupervisionManager::new(config, runtime);

    manager
        .register_entity(EntityDefinition::process(1, "P_TEST").with_state_tag(3001))
        .unwrap();
    manager
        .register_entity(EntityDefinition::equipment(10, "E_TEST_1", 1))
        .unwrap();
    manager
        .register_entity(EntityDefinition::equipment(11, "E_TEST_2", 1))
        .unwrap();
    manager
        .register_entity(EntityDefinition::sub_equipment(100, "SE_TEST", 10))
        .unwrap();

    for (timer, related) in [
        (1000, EntityRef::process(1)),
        (1010, EntityRef::equipment(10)),
        (1100, EntityRef::sub_equipment(100)),
    ] {
        manager
            .register_alive_timer(AliveTimerDefinition {
                id: timer,
                related,
                interval_millis: 5000,
            })
            .unwrap();
    }
    manager
        .register_comm_fault_tag(2011, 11, json!(false))
        .unwrap();
    manager
        .register_control_tag(3010, ControlTagRole::State { entity_id: 10 })
        .unwrap();

    for tag in [1, 2] {
        manager
            .register_data_tag(DataTagDefinition::new(
                tag,
                format!("TAG_{}", tag),
                [EntityRef::equipment(10)],
            ))
            .unwrap();
    }
    manager
        .register_rule_tag(RuleTagDefinition::new(50, "RULE", [1, 2]))
        .unwrap();
    manager
}

fn connect(manager: &SupervisionManager) -> i64 {
    let response = manager.on_connection(ProcessConnectionRequest {
        process_name: "P_TEST".to_string(),
        host: "daq-host".to_string(),
        startup_time: Utc::now(),
    });
    response.pik.unwrap_or(PIK_NONE)
}

fn ms(n: i64) -> Duration {
    Duration::milliseconds(n)
}

/// Connect, then a process alive at the returned time.
fn running(manager: &SupervisionManager) -> (i64, DateTime<Utc>) {
    let pik = connect(manager);
    let t = Utc::now();
    assert!(manager.refresh_alive(1000, t).is_applied());
    (pik, t)
}

#[test]
fn test_timer_hierarchy_linked() {
    let manager = manager();
    let process_timer = manager.timers().get(1000).unwrap();
    assert!(process_timer.dependent_timer_ids.contains(&1010));

    let eq_timer = manager.timers().get(1010).unwrap();
    assert!(eq_timer.dependent_timer_ids.contains(&1100));

    assert_eq!(manager.registry().get(10).unwrap().alive_timer_id, Some(1010));
    assert!(!manager.timers().is_active(1000));
}

#[test]
fn test_register_alive_timer_unknown_entity() {
    let manager = manager();
    let result = manager.register_alive_timer(AliveTimerDefinition {
        id: 9999,
        related: EntityRef::equipment(77),
        interval_millis: 1000,
    });
    assert_eq!(
        result.unwrap_err(),
        ConfigError::UnknownEntity {
            kind: EntityKind::Equipment,
            id: 77
        }
    );
}

#[test]
fn test_tag_id_conflicts_with_control_tag() {
    let manager = manager();
    let result = manager.register_data_tag(DataTagDefinition::new(
        2011,
        "CLASH",
        [EntityRef::equipment(11)],
    ));
    assert_eq!(result.unwrap_err(), ConfigError::TagConflict(2011));
}

#[test]
fn test_connection_starts_process_and_timers() {
    let manager = manager();
    let pik = connect(&manager);
    assert_ne!(pik, PIK_NONE);

    let process = manager.registry().get(1).unwrap();
    assert_eq!(process.status, SupervisionStatus::Startup);
    assert_eq!(process.session.pik, Some(pik));
    assert_eq!(process.session.host.as_deref(), Some("daq-host"));
    assert!(process.session.local_config);

    for timer in [1000, 1010, 1100] {
        assert!(manager.timers().is_active(timer));
    }
    assert_eq!(manager.state_tags().get(3001).unwrap().value, "STARTUP");
}

#[test]
fn test_connection_rejected_while_running() {
    let manager = manager();
    running(&manager);

    assert_eq!(connect(&manager), PIK_NONE);

    // test mode lets the DAQ reconnect
    manager.runtime().write().unwrap().test_mode = true;
    assert_ne!(connect(&manager), PIK_NONE);
}

#[test]
fn test_connection_unknown_process_rejected() {
    let manager = manager();
    let response = manager.on_connection(ProcessConnectionRequest {
        process_name: "NOPE".to_string(),
        host: "h".to_string(),
        startup_time: Utc::now(),
    });
    assert!(!response.is_accepted());
    assert_eq!(manager.metrics().snapshot().not_found, 1);
}

#[test]
fn test_configuration_switches_to_server_config() {
    let manager = manager();
    let pik = connect(&manager);

    let mismatch = manager.on_configuration(ProcessConfigurationRequest {
        process_name: "P_TEST".to_string(),
        pik: pik.wrapping_add(1),
    });
    assert!(mismatch.accepted);
    assert!(mismatch.local_config);

    let matching = manager.on_configuration(ProcessConfigurationRequest {
        process_name: "P_TEST".to_string(),
        pik,
    });
    assert!(matching.accepted);
    assert!(!matching.local_config);

    let unknown = manager.on_configuration(ProcessConfigurationRequest {
        process_name: "NOPE".to_string(),
        pik,
    });
    assert!(!unknown.accepted);
}

#[test]
fn test_alive_is_idempotent() {
    let manager = manager();
    let (_, t) = running(&manager);
    let raised = manager.metrics().events_raised();

    // same alive again
    assert_eq!(manager.refresh_alive(1000, t), TransitionOutcome::Unchanged);
    // older alive
    let older = manager.refresh_alive(1000, t - ms(10));
    assert_eq!(
        older.error(),
        Some(&SupervisionError::StaleUpdate {
            what: "alive timer",
            id: 1000
        })
    );

    assert_eq!(manager.metrics().events_raised(), raised);
    assert_eq!(manager.status(1), Some(SupervisionStatus::Running));
}

#[test]
fn test_expiry_boundary_and_single_down() {
    let manager = manager();
    let (_, t) = running(&manager);
    // keep the children fresh
    manager.refresh_alive(1010, t);
    manager.refresh_alive(1100, t);

    assert_eq!(manager.check_alive_timers(t + ms(4999)), 0);
    assert_eq!(manager.status(1), Some(SupervisionStatus::Running));

    assert_eq!(manager.check_alive_timers(t + ms(5000)), 3);
    assert_eq!(manager.status(1), Some(SupervisionStatus::Down));
    assert_eq!(manager.status(10), Some(SupervisionStatus::Down));

    // reported once per outage
    assert_eq!(manager.check_alive_timers(t + ms(9000)), 0);
    assert_eq!(manager.metrics().snapshot().expirations, 3);
}

#[test]
fn test_expiry_invalidates_and_alive_recovers() {
    let manager = manager();
    let (_, t) = running(&manager);
    manager.refresh_alive(1010, t);
    manager.refresh_alive(1100, t);
    manager.check_alive_timers(t + ms(5000));

    for tag in [1, 2, 50] {
        let snapshot = manager.tags().snapshot(tag).unwrap();
        assert!(snapshot.quality.contains(&QualityStatus::ProcessDown));
        assert!(snapshot.quality.contains(&QualityStatus::EquipmentDown));
    }

    let outcome = manager.refresh_alive(1000, t + ms(6000));
    let event = outcome.event().unwrap();
    assert_eq!(event.status, SupervisionStatus::Running);
    assert_eq!(event.message, "Process Alive tag received.");

    // equipment still down
    let tag = manager.tags().snapshot(1).unwrap();
    assert!(!tag.quality.contains(&QualityStatus::ProcessDown));
    assert!(tag.quality.contains(&QualityStatus::EquipmentDown));
}

#[test]
fn test_expiration_revalidated_under_lock() {
    let manager = manager();
    let (_, t) = running(&manager);

    // a fresh alive won the race
    manager.refresh_alive(1000, t + ms(4000));
    assert_eq!(
        manager.on_alive_timer_expiration(1000, t + ms(5000)),
        TransitionOutcome::Unchanged
    );
    assert!(matches!(
        manager.on_alive_timer_expiration(4242, t),
        TransitionOutcome::Rejected(SupervisionError::NotFound { .. })
    ));
}

#[test]
fn test_disconnection_takes_family_down() {
    let manager = manager();
    let (pik, _) = running(&manager);

    // wrong PIK ignored
    let ignored = manager.on_disconnection(ProcessDisconnectionRequest {
        process_id: None,
        process_name: "P_TEST".to_string(),
        pik: pik.wrapping_add(1),
    });
    assert!(ignored.is_empty());

    let events = manager.on_disconnection(ProcessDisconnectionRequest {
        process_id: Some(1),
        process_name: String::new(),
        pik,
    });
    let ids: Vec<i64> = events.iter().map(|e| e.entity_id).collect();
    assert_eq!(ids, vec![1, 10, 11, 100]);
    for event in &events {
        assert_eq!(event.status, SupervisionStatus::Down);
        assert_eq!(event.message, "DAQ process P_TEST was disconnected.");
    }

    for timer in [1000, 1010, 1100] {
        assert!(!manager.timers().is_active(timer));
    }
    assert_eq!(manager.check_alive_timers(Utc::now() + ms(60_000)), 0);

    // no longer running
    let again = manager.on_disconnection(ProcessDisconnectionRequest {
        process_id: Some(1),
        process_name: String::new(),
        pik,
    });
    assert!(again.is_empty());
}

#[test]
fn test_stop_process_is_terminal() {
    let manager = manager();
    running(&manager);

    let events = manager.stop_process(1, "Stopped by operator");
    assert_eq!(events.len(), 4);
    assert!(events.iter().all(|e| e.status == SupervisionStatus::Stopped));
    assert_eq!(manager.registry().get(1).unwrap().session.pik, None);
    assert!(!manager.timers().is_active(1000));

    let outcome = manager.refresh_alive(1000, Utc::now());
    assert_eq!(
        outcome.error(),
        Some(&SupervisionError::InvalidTransition {
            kind: EntityKind::Process,
            id: 1,
            from: SupervisionStatus::Stopped,
            to: SupervisionStatus::Running,
        })
    );
    assert_eq!(manager.metrics().snapshot().invalid_transitions, 1);

    // a new connection restarts it
    assert_ne!(connect(&manager), PIK_NONE);
    assert_eq!(manager.status(1), Some(SupervisionStatus::Startup));
}

#[test]
fn test_comm_fault_tag() {
    let manager = manager();
    let t = Utc::now();

    let down = manager.process_control_tag(SourceControlValue::new(2011, json!(false), t));
    assert_eq!(down.event().unwrap().status, SupervisionStatus::Down);
    assert_eq!(
        down.event().unwrap().message,
        "Communication fault tag indicates that equipment E_TEST_2 is down."
    );

    // older value ignored
    let stale = manager.process_control_tag_value(11, &json!(true), t - ms(1));
    assert!(matches!(
        stale,
        TransitionOutcome::Rejected(SupervisionError::StaleUpdate { .. })
    ));

    let up = manager.process_control_tag_value(11, &json!(true), t + ms(1));
    assert_eq!(up.event().unwrap().status, SupervisionStatus::Running);
}

#[test]
fn test_comm_fault_recovery_needs_live_timer() {
    let manager = manager();
    manager.register_comm_fault_tag(2010, 10, json!(false)).unwrap();
    let (_, t) = running(&manager);
    manager.check_alive_timers(t + ms(60_000));
    assert_eq!(manager.status(10), Some(SupervisionStatus::Down));

    let outcome = manager.process_control_tag(SourceControlValue::new(2010, json!(true), t + ms(61_000)));
    assert!(matches!(
        outcome,
        TransitionOutcome::Rejected(SupervisionError::InvalidTransition { id: 10, .. })
    ));
    assert_eq!(manager.status(10), Some(SupervisionStatus::Down));
}

#[test]
fn test_delayed_alive_rejected() {
    let manager = manager();
    connect(&manager);

    let delayed = SourceControlValue::new(1000, json!(1), Utc::now() - ms(20_000));
    assert_eq!(
        manager.process_control_tag(delayed).error(),
        Some(&SupervisionError::StaleUpdate {
            what: "alive tag",
            id: 1000
        })
    );

    let mut fresh = SourceControlValue::new(1000, json!(1), Utc::now() + ms(5));
    fresh.daq_timestamp = Some(Utc::now() + ms(10));
    assert!(manager.process_control_tag(fresh).is_applied());
    assert_eq!(manager.status(1), Some(SupervisionStatus::Running));
}

#[test]
fn test_unknown_control_tag() {
    let manager = manager();
    let outcome = manager.process_control_tag(SourceControlValue::new(404, json!(1), Utc::now()));
    assert_eq!(
        outcome,
        TransitionOutcome::Rejected(SupervisionError::NotFound {
            what: "control tag",
            id: 404
        })
    );
}

#[test]
fn test_state_tags_follow_status() {
    let manager = manager();
    let (pik, _) = running(&manager);
    assert_eq!(manager.state_tags().get(3001).unwrap().value, "RUNNING_LOCAL");

    manager.on_configuration(ProcessConfigurationRequest {
        process_name: "P_TEST".to_string(),
        pik,
    });
    assert_eq!(manager.refresh_state_tags(), 2);
    assert_eq!(manager.state_tags().get(3001).unwrap().value, "RUNNING");
    assert_eq!(manager.state_tags().get(3010).unwrap().entity, EntityRef::equipment(10));
}

#[test]
fn test_supervision_states_snapshot() {
    let manager = manager();
    let before = Utc::now();
    let states = manager.get_all_supervision_states();

    assert_eq!(states.len(), 4);
    assert!(states.iter().all(|s| s.timestamp >= before));
    assert!(states.iter().all(|s| s.status == SupervisionStatus::Uncertain));
}

#[test]
fn test_refresh_all_pushes_every_entity() {
    let manager = manager();
    manager.process_control_tag(SourceControlValue::new(2011, json!(false), Utc::now()));
    let raised = manager.metrics().events_raised();

    assert_eq!(manager.refresh_all_supervision_status(), 4);
    assert_eq!(manager.metrics().events_raised(), raised + 4);
}

#[test]
fn test_remove_entity_cleans_up() {
    let manager = manager();
    let removed = manager.remove_entity(10);
    let ids: Vec<i64> = removed.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![10, 100]);

    assert!(manager.timers().get(1010).is_none());
    assert!(manager.timers().get(1100).is_none());
    assert!(!manager
        .timers()
        .get(1000)
        .unwrap()
        .dependent_timer_ids
        .contains(&1010));
    assert!(manager.dependencies().resolve(EntityRef::equipment(10)).is_empty());
    assert!(manager.state_tags().get(3010).is_none());

    assert!(manager.remove_entity(10).is_empty());
}

#[test]
fn test_tag_dependency_by_entity_id() {
    let manager = manager();
    manager.register_tag_dependency(7, &[100]).unwrap();

    let resolved = manager.dependencies().resolve(EntityRef::process(1));
    assert!(resolved.data_tag_ids.contains(&7));
    assert_eq!(manager.tags().data_tag(7).unwrap().name, "tag-7");

    assert!(manager.register_tag_dependency(8, &[999]).is_err());
}

#[test]
fn test_remove_tag_updates_rule() {
    let manager = manager();
    assert!(manager.remove_tag(2));
    assert!(manager.tags().snapshot(2).is_none());
    assert!(manager.tags().rule_tag(50).is_some());

    assert!(manager.remove_tag(2011));
    assert!(matches!(
        manager.process_control_tag_value(11, &json!(false), Utc::now()),
        TransitionOutcome::Rejected(SupervisionError::NotFound { .. })
    ));
}

#[test]
fn test_reconnect_restarts_stopped_children() {
    let manager = manager();
    running(&manager);
    manager.stop_process(1, "Stopped by operator");
    assert_eq!(manager.status(10), Some(SupervisionStatus::Stopped));

    assert_ne!(connect(&manager), PIK_NONE);
    for id in [1, 10, 11, 100] {
        assert_eq!(manager.status(id), Some(SupervisionStatus::Startup));
    }

    let t = Utc::now() + ms(10);
    let alive = manager.refresh_alive(1010, t);
    assert_eq!(alive.event().unwrap().status, SupervisionStatus::Running);
    assert_eq!(manager.status(10), Some(SupervisionStatus::Running));

    let up = manager.process_control_tag_value(11, &json!(true), t);
    assert_eq!(up.event().unwrap().status, SupervisionStatus::Running);
}

#[test]
fn test_restart_single_stopped_equipment() {
    let manager = manager();
    running(&manager);

    assert!(manager.stop(10, "Maintenance").is_applied());
    assert!(!manager.timers().is_active(1010));
    assert!(!manager.timers().is_active(1100));
    assert!(matches!(
        manager.refresh_alive(1010, Utc::now()),
        TransitionOutcome::Rejected(SupervisionError::InvalidTransition { id: 10, .. })
    ));

    let restarted = manager.restart(10, "Maintenance finished");
    assert_eq!(restarted.event().unwrap().status, SupervisionStatus::Startup);
    assert!(manager.timers().is_active(1010));
    assert!(manager.timers().is_active(1100));

    // only stopped entities restart
    assert_eq!(manager.restart(10, "again"), TransitionOutcome::Unchanged);
    assert!(matches!(
        manager.restart(1, "process"),
        TransitionOutcome::Rejected(SupervisionError::InvalidTransition { id: 1, .. })
    ));

    let alive = manager.refresh_alive(1010, Utc::now() + ms(10));
    assert_eq!(alive.event().unwrap().status, SupervisionStatus::Running);
}

#[test]
fn test_late_alive_recovers_after_expiry() {
    let manager = manager();
    let (_, t) = running(&manager);
    manager.refresh_alive(1010, t);
    manager.refresh_alive(1100, t);
    manager.on_alive_timer_expiration(1000, t + ms(6000));
    assert_eq!(manager.status(1), Some(SupervisionStatus::Down));

    // newer than the last alive, older than the expiry
    let outcome = manager.refresh_alive(1000, t + ms(5500));
    assert_eq!(outcome.event().unwrap().status, SupervisionStatus::Running);
    assert_eq!(manager.status(1), Some(SupervisionStatus::Running));

    let timer = manager.timers().get(1000).unwrap();
    assert_eq!(timer.last_update, t + ms(5500));
    assert!(!timer.expired);
}

#[test]
fn test_stale_alive_after_disconnect_keeps_timers_stopped() {
    let manager = manager();
    let (pik, t) = running(&manager);
    std::thread::sleep(std::time::Duration::from_millis(30));

    let events = manager.on_disconnection(ProcessDisconnectionRequest {
        process_id: Some(1),
        process_name: String::new(),
        pik,
    });
    assert_eq!(events.len(), 4);

    let outcome = manager.refresh_alive(1000, t + ms(1));
    assert_eq!(
        outcome.error(),
        Some(&SupervisionError::StaleUpdate {
            what: "alive timer",
            id: 1000
        })
    );
    for timer in [1000, 1010, 1100] {
        assert!(!manager.timers().is_active(timer));
    }
    assert_eq!(manager.status(1), Some(SupervisionStatus::Down));
}

#[test]
fn test_unknown_entity_id_reported_without_kind() {
    let manager = manager();
    assert_eq!(
        manager.register_tag_dependency(5, &[777]).unwrap_err(),
        ConfigError::UnknownEntityId(777)
    );
    assert_eq!(
        manager
            .register_comm_fault_tag(2099, 888, json!(false))
            .unwrap_err(),
        ConfigError::UnknownEntityId(888)
    );
}
