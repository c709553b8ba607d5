//! Reverse indices from supervised entities to the tags depending on them.
//!
//! DataTags register the entities they are attached to. RuleTags register
//! their inputs; the entity union of every rule is computed at registration
//! time from its inputs, so resolution at event time is two map lookups and
//! never walks the rule graph. Because a rule is found through its own union,
//! it is reported once per event however many of its inputs are affected.

use crate::entity::EntityRef;
use crate::error::ConfigError;
use crate::tag::EntityIds;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, warn};


/// Deepest rule-on-rule chain accepted at registration.
pub const MAX_RULE_DEPTH: usize = 64;

/// Tags to update for one supervision event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedTags {
    pub data_tag_ids: BTreeSet<i64>,
    pub rule_tag_ids: BTreeSet<i64>,
}

impl ResolvedTags {
    pub fn len(&self) -> usize {
        self.data_tag_ids.len() + self.rule_tag_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A rule whose entity union changed after a configuration update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdatedRule {
    pub rule_id: i64,
    pub entities: EntityIds,
}

/// Entity → tag reverse indices plus the rule input graph.
///
/// Written by configuration calls, read concurrently on every supervision event.
pub struct DependencyIndex {
    /// DataTag id → attached entities
    data_tags: DashMap<i64, EntityIds>,
    /// RuleTag id → input tag/rule ids
    rule_inputs: DashMap<i64, BTreeSet<i64>>,
    /// RuleTag id → precomputed union of reachable entities
    rule_unions: DashMap<i64, EntityIds>,
    /// Tag or rule id → rules reading it
    dependents: DashMap<i64, BTreeSet<i64>>,
    /// Entity → DataTag ids
    entity_data_tags: DashMap<EntityRef, BTreeSet<i64>>,
    /// Entity → RuleTag ids
    entity_rule_tags: DashMap<EntityRef, BTreeSet<i64>>,
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self {
            data_tags: DashMap::new(),
            rule_inputs: DashMap::new(),
            rule_unions: DashMap::new(),
            dependents: DashMap::new(),
            entity_data_tags: DashMap::new(),
            entity_rule_tags: DashMap::new(),
        }
    }

    /// Register (or re-attach) a DataTag.
    ///
    /// Returns every rule whose union changed as a consequence.
    pub fn register_data_tag(
        &self,
        tag_id: i64,
        entities: EntityIds,
    ) -> Result<Vec<UpdatedRule>, ConfigError> {
        if self.rule_inputs.contains_key(&tag_id) {
            return Err(ConfigError::TagConflict(tag_id));
        }
        if entities.is_empty() {
            return Err(ConfigError::UnattachedTag(tag_id));
        }

        let previous = self.data_tags.insert(tag_id, entities.clone());
        if previous.as_ref() == Some(&entities) {
            return Ok(Vec::new());
        }
        reindex(
            &self.entity_data_tags,
            tag_id,
            previous.as_ref(),
            Some(&entities),
        );
        debug!(tag_id = tag_id, "DataTag dependencies registered");

        Ok(self.propagate_from(tag_id))
    }

    /// Register (or rewire) a RuleTag from its inputs.
    ///
    /// Every input must already be registered. Returns the rule's own union
    /// first, followed by every dependent rule whose union changed.
    pub fn register_rule_tag(
        &self,
        rule_id: i64,
        input_ids: BTreeSet<i64>,
    ) -> Result<Vec<UpdatedRule>, ConfigError> {
        if self.data_tags.contains_key(&rule_id) {
            return Err(ConfigError::TagConflict(rule_id));
        }
        for &input_id in &input_ids {
            if input_id == rule_id {
                return Err(ConfigError::CyclicRule { rule_id, input_id });
            }
            if !self.data_tags.contains_key(&input_id) && !self.rule_inputs.contains_key(&input_id)
            {
                return Err(ConfigError::UnknownRuleInput { rule_id, input_id });
            }
        }
        self.check_acyclic(rule_id, &input_ids)?;

        let union = self.union_of(&input_ids);

        let previous_inputs = self.rule_inputs.insert(rule_id, input_ids.clone());
        if let Some(old) = &previous_inputs {
            for input in old.difference(&input_ids) {
                if let Some(mut deps) = self.dependents.get_mut(input) {
                    deps.remove(&rule_id);
                }
            }
        }
        for &input in &input_ids {
            self.dependents.entry(input).or_default().insert(rule_id);
        }

        let previous_union = self.rule_unions.insert(rule_id, union.clone());
        reindex(
            &self.entity_rule_tags,
            rule_id,
            previous_union.as_ref(),
            Some(&union),
        );
        debug!(rule_id = rule_id, inputs = input_ids.len(), "RuleTag dependencies registered");

        let mut updated = vec![UpdatedRule {
            rule_id,
            entities: union.clone(),
        }];
        if previous_union.as_ref() != Some(&union) {
            updated.extend(self.propagate_from(rule_id));
        }
        Ok(updated)
    }

    /// Remove a tag or rule. Dependent rules drop it from their unions.
    pub fn remove_tag(&self, tag_id: i64) -> Vec<UpdatedRule> {
        if let Some((_, entities)) = self.data_tags.remove(&tag_id) {
            reindex(&self.entity_data_tags, tag_id, Some(&entities), None);
        } else if let Some((_, inputs)) = self.rule_inputs.remove(&tag_id) {
            for input in inputs {
                if let Some(mut deps) = self.dependents.get_mut(&input) {
                    deps.remove(&tag_id);
                }
            }
            if let Some((_, union)) = self.rule_unions.remove(&tag_id) {
                reindex(&self.entity_rule_tags, tag_id, Some(&union), None);
            }
        } else {
            return Vec::new();
        }
        self.propagate_from(tag_id)
    }

    /// Drop every index entry for a removed entity.
    pub fn remove_entity(&self, entity: EntityRef) {
        self.entity_data_tags.remove(&entity);
        self.entity_rule_tags.remove(&entity);
    }

    /// Deduplicated DataTags and RuleTags depending on `entity`.
    ///
    /// Pure read of the reverse indices.
    pub fn resolve(&self, entity: EntityRef) -> ResolvedTags {
        ResolvedTags {
            data_tag_ids: self
                .entity_data_tags
                .get(&entity)
                .map(|ids| ids.clone())
                .unwrap_or_default(),
            rule_tag_ids: self
                .entity_rule_tags
                .get(&entity)
                .map(|ids| ids.clone())
                .unwrap_or_default(),
        }
    }

    pub fn rule_union(&self, rule_id: i64) -> Option<EntityIds> {
        self.rule_unions.get(&rule_id).map(|u| u.clone())
    }

    pub fn data_tag_entities(&self, tag_id: i64) -> Option<EntityIds> {
        self.data_tags.get(&tag_id).map(|e| e.clone())
    }

    pub fn contains_tag(&self, tag_id: i64) -> bool {
        self.data_tags.contains_key(&tag_id) || self.rule_inputs.contains_key(&tag_id)
    }

    /// Union of the entities of the given inputs. Unknown inputs are skipped.
    fn union_of(&self, input_ids: &BTreeSet<i64>) -> EntityIds {
        let mut union = EntityIds::default();
        for input in input_ids {
            if let Some(entities) = self.data_tags.get(input) {
                union.union_with(&entities);
            } else if let Some(entities) = self.rule_unions.get(input) {
                union.union_with(&entities);
            } else {
                warn!(input_id = input, "Rule input no longer registered, ignored in union");
            }
        }
        union
    }

    /// Fails if `rule_id` is reachable from `input_ids`, or if the input
    /// chain is deeper than [`MAX_RULE_DEPTH`].
    fn check_acyclic(&self, rule_id: i64, input_ids: &BTreeSet<i64>) -> Result<(), ConfigError> {
        for &input_id in input_ids {
            let mut visited = BTreeSet::new();
            let mut stack = vec![(input_id, 1usize)];
            while let Some((current, depth)) = stack.pop() {
                if current == rule_id {
                    return Err(ConfigError::CyclicRule { rule_id, input_id });
                }
                if depth > MAX_RULE_DEPTH {
                    return Err(ConfigError::RuleTooDeep {
                        rule_id,
                        max_depth: MAX_RULE_DEPTH,
                    });
                }
                if !visited.insert(current) {
                    continue;
                }
                if let Some(inputs) = self.rule_inputs.get(&current) {
                    stack.extend(inputs.iter().map(|&i| (i, depth + 1)));
                }
            }
        }
        Ok(())
    }

    /// Recompute the union of every rule downstream of `changed`, inputs
    /// before dependents. Returns the rules whose union actually changed.
    fn propagate_from(&self, changed: i64) -> Vec<UpdatedRule> {
        // Collect the affected sub-graph
        let mut affected = BTreeSet::new();
        let mut queue = VecDeque::from([changed]);
        while let Some(current) = queue.pop_front() {
            let deps: Vec<i64> = self
                .dependents
                .get(&current)
                .map(|d| d.iter().copied().collect())
                .unwrap_or_default();
            for dep in deps {
                if affected.insert(dep) {
                    queue.push_back(dep);
                }
            }
        }
        if affected.is_empty() {
            return Vec::new();
        }

        // Kahn ordering restricted to the affected rules
        let mut pending: BTreeMap<i64, usize> = affected
            .iter()
            .map(|&rule| {
                let count = self
                    .rule_inputs
                    .get(&rule)
                    .map(|inputs| inputs.iter().filter(|i| affected.contains(*i)).count())
                    .unwrap_or(0);
                (rule, count)
            })
            .collect();
        let mut ready: VecDeque<i64> = pending
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(&rule, _)| rule)
            .collect();

        let mut updated = Vec::new();
        while let Some(rule) = ready.pop_front() {
            pending.remove(&rule);
            let inputs = self
                .rule_inputs
                .get(&rule)
                .map(|i| i.clone())
                .unwrap_or_default();
            let union = self.union_of(&inputs);
            let previous = self.rule_unions.insert(rule, union.clone());
            if previous.as_ref() != Some(&union) {
                reindex(&self.entity_rule_tags, rule, previous.as_ref(), Some(&union));
                updated.push(UpdatedRule {
                    rule_id: rule,
                    entities: union,
                });
            }

            let deps: Vec<i64> = self
                .dependents
                .get(&rule)
                .map(|d| d.iter().copied().collect())
                .unwrap_or_default();
            for dep in deps {
                if let Some(count) = pending.get_mut(&dep) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        ready.push_back(dep);
                    }
                }
            }
        }

        if !pending.is_empty() {
            warn!(
                rules = ?pending.keys().collect::<Vec<_>>(),
                "Rule unions not recomputed: inputs form a cycle"
            );
        }
        updated
    }
}

impl Default for DependencyIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Move `tag_id` from the entities of `old` to the entities of `new`.
fn reindex(
    index: &DashMap<EntityRef, BTreeSet<i64>>,
    tag_id: i64,
    old: Option<&EntityIds>,
    new: Option<&EntityIds>,
) {
    let old_refs = old.map(|e| e.refs()).unwrap_or_default();
    let new_refs = new.map(|e| e.refs()).unwrap_or_default();

    for entity in old_refs.difference(&new_refs) {
        let now_empty = match index.get_mut(entity) {
            Some(mut ids) => {
                ids.remove(&tag_id);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            index.remove_if(entity, |_, ids| ids.is_empty());
        }
    }
    for entity in new_refs.difference(&old_refs) {
        index.entry(*entity).or_default().insert(tag_id);
    }
}
