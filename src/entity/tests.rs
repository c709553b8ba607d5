use super::*;
use crate::error::ConfigError;
use std::sync::Arc;
use std::thread;

fn hierarchy() -> EntityRegistry {
    let registry = EntityRegistry::new();
    registry.register(EntityDefinition::process(1, "P_TEST")).unwrap();
    registry
        .register(EntityDefinition::equipment(10, "E_TEST_1", 1))
        .unwrap();
    registry
        .register(EntityDefinition::equipment(11, "E_TEST_2", 1))
        .unwrap();
    registry
        .register(EntityDefinition::sub_equipment(100, "SE_TEST", 10))
        .unwrap();
    registry
}

#[test]
fn test_register_builds_hierarchy() {
    let registry = hierarchy();

    let process = registry.get(1).unwrap();
    assert_eq!(process.kind, EntityKind::Process);
    assert_eq!(process.process_id, 1);
    assert_eq!(process.status, SupervisionStatus::Uncertain);
    assert_eq!(process.children.len(), 2);

    let sub = registry.get(100).unwrap();
    assert_eq!(sub.parent_id, Some(10));
    assert_eq!(sub.process_id, 1);
    assert_eq!(registry.owning_process(100), Some(1));
}

#[test]
fn test_register_unknown_parent_fails() {
    let registry = EntityRegistry::new();
    let result = registry.register(EntityDefinition::equipment(10, "E", 99));
    assert_eq!(
        result.unwrap_err(),
        ConfigError::UnknownEntity {
            kind: EntityKind::Process,
            id: 99
        }
    );
}

#[test]
fn test_register_kind_conflict_fails() {
    let registry = hierarchy();
    let result = registry.register(EntityDefinition::process(10, "CLASH"));
    assert!(matches!(result, Err(ConfigError::KindConflict { id: 10, .. })));
}

#[test]
fn test_reregister_keeps_status() {
    let registry = hierarchy();
    registry.set_status(10, SupervisionStatus::Running, Utc::now(), "alive");

    registry
        .register(EntityDefinition::equipment(10, "E_RENAMED", 1).with_state_tag(500))
        .unwrap();

    let eq = registry.get(10).unwrap();
    assert_eq!(eq.name, "E_RENAMED");
    assert_eq!(eq.status, SupervisionStatus::Running);
    assert_eq!(eq.state_tag_id, Some(500));
    assert_eq!(eq.children.len(), 1);
}

#[test]
fn test_lineage_and_descendants() {
    let registry = hierarchy();

    let lineage = registry.lineage(EntityRef::sub_equipment(100)).unwrap();
    assert_eq!(
        lineage,
        vec![
            EntityRef::sub_equipment(100),
            EntityRef::equipment(10),
            EntityRef::process(1)
        ]
    );

    // Wrong kind is not found
    assert!(registry.lineage(EntityRef::equipment(100)).is_none());

    let mut descendants = registry.descendants(1);
    descendants.sort();
    assert_eq!(descendants, vec![10, 11, 100]);
}

#[test]
fn test_remove_cascades_to_descendants() {
    let registry = hierarchy();

    let removed = registry.remove(10);
    let ids: Vec<i64> = removed.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![10, 100]);

    assert!(!registry.contains(100));
    assert!(!registry.get(1).unwrap().children.contains(&10));
    assert_eq!(registry.len(), 2);
}

#[test]
fn test_find_process_by_name() {
    let registry = hierarchy();
    assert_eq!(registry.find_process_by_name("P_TEST").unwrap().id, 1);
    assert!(registry.find_process_by_name("E_TEST_1").is_none());
    assert!(registry.find_process_by_name("nope").is_none());
}

#[test]
fn test_concurrent_status_writes() {
    let registry = Arc::new(EntityRegistry::new());
    for i in 0..10 {
        registry
            .register(EntityDefinition::process(i, format!("P_{}", i)))
            .unwrap();
    }

    let mut handles = vec![];
    for i in 0..10 {
        let registry_clone = Arc::clone(&registry);
        handles.push(thread::spawn(move || {
            registry_clone.set_status(i, SupervisionStatus::Running, Utc::now(), "up");
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(registry
        .all()
        .iter()
        .all(|e| e.status == SupervisionStatus::Running));
}
