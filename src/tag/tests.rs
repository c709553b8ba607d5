use super::*;
use crate::error::SupervisionError;
use serde_json::json;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<TagSnapshot>>,
}

impl TagListener for Recorder {
    fn on_supervision_change(&self, tag: &TagSnapshot) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(tag.clone());
        Ok(())
    }
}

struct Failing;

impl TagListener for Failing {
    fn on_supervision_change(&self, _tag: &TagSnapshot) -> anyhow::Result<()> {
        anyhow::bail!("downstream cache unavailable")
    }

    fn name(&self) -> &str {
        "failing"
    }
}

struct Panicking;

impl TagListener for Panicking {
    fn on_supervision_change(&self, _tag: &TagSnapshot) -> anyhow::Result<()> {
        panic!("listener bug")
    }

    fn name(&self) -> &str {
        "panicking"
    }
}

fn equipment_tag_store() -> TagStore {
    let store = TagStore::new();
    store
        .upsert_data_tag(
            1,
            "TEMP",
            EntityIds::from_refs([EntityRef::equipment(10), EntityRef::process(1)]),
        )
        .unwrap();
    store
}

#[test]
fn test_quality_causes_are_reference_counted() {
    let mut quality = TagQuality::new();
    assert!(quality.is_valid());

    assert!(quality.add_cause(QualityStatus::EquipmentDown, 10));
    assert!(quality.add_cause(QualityStatus::EquipmentDown, 11));
    assert!(!quality.add_cause(QualityStatus::EquipmentDown, 11));

    assert!(quality.remove_cause(QualityStatus::EquipmentDown, 10));
    assert!(quality.contains(QualityStatus::EquipmentDown));

    assert!(quality.remove_cause(QualityStatus::EquipmentDown, 11));
    assert!(!quality.contains(QualityStatus::EquipmentDown));
    assert!(quality.is_valid());

    // Removing an absent cause is harmless
    assert!(!quality.remove_cause(QualityStatus::ProcessDown, 1));
}

#[test]
fn test_independent_flags_survive_recovery() {
    let mut quality = TagQuality::new();
    quality.set(QualityStatus::ValueOutOfBounds);
    quality.add_cause(QualityStatus::ProcessDown, 1);
    quality.remove_cause(QualityStatus::ProcessDown, 1);

    assert_eq!(
        quality.flags().into_iter().collect::<Vec<_>>(),
        vec![QualityStatus::ValueOutOfBounds]
    );
    assert!(!quality.is_valid());
}

#[test]
fn test_flag_for_entity_kind() {
    assert_eq!(
        QualityStatus::for_entity(EntityKind::Process),
        QualityStatus::ProcessDown
    );
    assert_eq!(
        QualityStatus::for_entity(EntityKind::SubEquipment),
        QualityStatus::SubequipmentDown
    );
    assert!(QualityStatus::EquipmentDown.is_supervision());
    assert!(!QualityStatus::Inaccessible.is_supervision());
    assert_eq!(
        serde_json::to_value(QualityStatus::SubequipmentDown).unwrap(),
        json!("SUBEQUIPMENT_DOWN")
    );
}

#[test]
fn test_entity_ids_membership() {
    let ids = EntityIds::from_refs([
        EntityRef::process(1),
        EntityRef::equipment(10),
        EntityRef::sub_equipment(100),
    ]);
    assert!(ids.contains(EntityRef::equipment(10)));
    assert!(!ids.contains(EntityRef::process(10)));
    assert_eq!(ids.refs().len(), 3);

    let mut union = EntityIds::from_refs([EntityRef::equipment(11)]);
    union.union_with(&ids);
    assert_eq!(union.equipment_ids.len(), 2);
}

#[test]
fn test_apply_supervision_notifies_with_snapshot() {
    let store = equipment_tag_store();
    let recorder = Arc::new(Recorder::default());
    store.add_listener(recorder.clone());

    let down = store
        .apply_supervision(1, QualityStatus::EquipmentDown, 10, true)
        .unwrap();
    assert!(!down.valid);
    assert!(down.quality.contains(&QualityStatus::EquipmentDown));

    let up = store
        .apply_supervision(1, QualityStatus::EquipmentDown, 10, false)
        .unwrap();
    assert!(up.valid);

    let seen = recorder.seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].kind, TagKind::Data);
    assert!(!seen[0].valid);
    assert!(seen[1].valid);
}

#[test]
fn test_apply_supervision_unknown_tag() {
    let store = TagStore::new();
    let result = store.apply_supervision(99, QualityStatus::ProcessDown, 1, true);
    assert_eq!(
        result.unwrap_err(),
        SupervisionError::NotFound { what: "tag", id: 99 }
    );
}

#[test]
fn test_failing_listeners_do_not_block_others() {
    let store = equipment_tag_store();
    let recorder = Arc::new(Recorder::default());
    store.add_listener(Arc::new(Failing));
    store.add_listener(Arc::new(Panicking));
    store.add_listener(recorder.clone());

    let result = store.apply_supervision(1, QualityStatus::EquipmentDown, 10, true);
    match result {
        Err(SupervisionError::ListenerFailure { listener, .. }) => {
            assert_eq!(listener, "failing,panicking");
        }
        other => panic!("unexpected result: {:?}", other),
    }

    // Quality was applied and the healthy listener saw it
    assert!(!store.snapshot(1).unwrap().valid);
    assert_eq!(recorder.seen.lock().unwrap().len(), 1);
}

#[test]
fn test_tag_id_conflict() {
    let store = equipment_tag_store();
    let result = store.upsert_rule_tag(1, "RULE", BTreeSet::new(), EntityIds::default());
    assert!(result.is_err());
}

#[test]
fn test_value_update_keeps_quality() {
    let store = equipment_tag_store();
    store.set_quality(1, QualityStatus::Inaccessible).unwrap();
    let snap = store.update_value(1, json!(21.5), Utc::now()).unwrap();
    assert_eq!(snap.value, Some(json!(21.5)));
    assert!(snap.quality.contains(&QualityStatus::Inaccessible));

    let snap = store.clear_quality(1, QualityStatus::Inaccessible).unwrap();
    assert!(snap.valid);
}
