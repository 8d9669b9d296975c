//! Workflow Definition Store.
//!
//! Keyed lookup of immutable playbooks. Definitions are shared as
//! `Arc<WorkflowDefinition>`; an update replaces the whole value so
//! executions that already hold the old `Arc` are unaffected. Registration
//! order is preserved because the trigger matcher breaks ties by it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use mitigate_types::definition::WorkflowDefinition;
use uuid::Uuid;

use super::definition::{DefinitionError, prepare_definition};

#[derive(Debug, Clone)]
struct Registered {
    seq: u64,
    definition: Arc<WorkflowDefinition>,
}

/// Concurrent registry of playbooks, read-mostly after startup.
#[derive(Debug, Default)]
pub struct DefinitionStore {
    seq: AtomicU64,
    by_id: DashMap<Uuid, Registered>,
    names: DashMap<String, Uuid>,
}

impl DefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a new definition. Names are unique.
    pub fn create(&self, def: WorkflowDefinition) -> Result<Arc<WorkflowDefinition>, DefinitionError> {
        let def = prepare_definition(def)?;
        if self.by_id.contains_key(&def.id) {
            return Err(DefinitionError::Duplicate(def.id.to_string()));
        }

        match self.names.entry(def.name.clone()) {
            Entry::Occupied(_) => Err(DefinitionError::Duplicate(def.name)),
            Entry::Vacant(slot) => {
                slot.insert(def.id);
                let definition = Arc::new(def);
                self.by_id.insert(
                    definition.id,
                    Registered {
                        seq: self.seq.fetch_add(1, Ordering::Relaxed),
                        definition: Arc::clone(&definition),
                    },
                );
                tracing::debug!(
                    definition = %definition.name,
                    id = %definition.id,
                    steps = definition.steps.len(),
                    "registered definition"
                );
                Ok(definition)
            }
        }
    }

    /// Replace an existing definition wholesale, keeping its registration slot.
    ///
    /// The replacement must carry the same ID; renaming is allowed if the new
    /// name is free.
    pub fn replace(&self, def: WorkflowDefinition) -> Result<Arc<WorkflowDefinition>, DefinitionError> {
        let def = prepare_definition(def)?;
        let Some(previous) = self.by_id.get(&def.id).map(|r| r.value().clone()) else {
            return Err(DefinitionError::ValidationError(format!(
                "definition {} is not registered",
                def.id
            )));
        };

        if previous.definition.name != def.name {
            match self.names.entry(def.name.clone()) {
                Entry::Occupied(_) => return Err(DefinitionError::Duplicate(def.name)),
                Entry::Vacant(slot) => {
                    slot.insert(def.id);
                }
            }
            self.names.remove(&previous.definition.name);
        }

        let definition = Arc::new(def);
        self.by_id.insert(
            definition.id,
            Registered {
                seq: previous.seq,
                definition: Arc::clone(&definition),
            },
        );
        tracing::debug!(definition = %definition.name, id = %definition.id, "replaced definition");
        Ok(definition)
    }

    /// Register or replace, depending on whether the ID is known.
    pub fn upsert(&self, def: WorkflowDefinition) -> Result<Arc<WorkflowDefinition>, DefinitionError> {
        if self.by_id.contains_key(&def.id) {
            self.replace(def)
        } else {
            self.create(def)
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<WorkflowDefinition>> {
        self.by_id.get(id).map(|r| Arc::clone(&r.definition))
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        let id = self.names.get(name).map(|r| *r.value())?;
        self.get(&id)
    }

    /// Look up by UUID or, failing that, by name.
    pub fn resolve(&self, reference: &str) -> Option<Arc<WorkflowDefinition>> {
        match Uuid::parse_str(reference) {
            Ok(id) => self.get(&id),
            Err(_) => self.get_by_name(reference),
        }
    }

    /// All definitions in registration order.
    pub fn list(&self) -> Vec<Arc<WorkflowDefinition>> {
        let mut entries: Vec<Registered> = self.by_id.iter().map(|r| r.value().clone()).collect();
        entries.sort_by_key(|r| r.seq);
        entries.into_iter().map(|r| r.definition).collect()
    }

    /// Active definitions in registration order.
    pub fn list_active(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.list().into_iter().filter(|d| d.active).collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(name: &str) -> WorkflowDefinition {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "category": "reactive",
            "steps": [{
                "id": "notify",
                "name": "Notify",
                "type": "notification",
                "expected_duration_secs": 60,
                "responsible_role": "operations"
            }]
        }))
        .unwrap()
    }

    #[test]
    fn create_get_and_list_in_registration_order() {
        let store = DefinitionStore::new();
        let b = store.create(definition("bravo")).unwrap();
        let a = store.create(definition("alpha")).unwrap();

        assert_eq!(store.get(&a.id).unwrap().name, "alpha");
        assert_eq!(store.get_by_name("bravo").unwrap().id, b.id);
        assert_eq!(store.resolve(&a.id.to_string()).unwrap().name, "alpha");
        assert_eq!(store.resolve("bravo").unwrap().id, b.id);

        let names: Vec<String> = store.list().iter().map(|d| d.name.clone()).collect();
        assert_eq!(names, vec!["bravo", "alpha"]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn duplicate_name_rejected() {
        let store = DefinitionStore::new();
        store.create(definition("alpha")).unwrap();
        let err = store.create(definition("alpha")).unwrap_err();
        assert!(matches!(err, DefinitionError::Duplicate(_)));
    }

    #[test]
    fn invalid_definition_rejected() {
        let store = DefinitionStore::new();
        let mut def = definition("alpha");
        def.steps.clear();
        assert!(store.create(def).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn replace_keeps_slot_and_old_arcs() {
        let store = DefinitionStore::new();
        let first = store.create(definition("alpha")).unwrap();
        store.create(definition("bravo")).unwrap();

        let mut updated = (*first).clone();
        updated.version = "2.0.0".to_string();
        updated.active = false;
        store.replace(updated).unwrap();

        assert_eq!(first.version, "1.0.0", "existing holders keep the old value");
        assert_eq!(store.get(&first.id).unwrap().version, "2.0.0");
        assert_eq!(store.list()[0].id, first.id);

        let active: Vec<String> = store.list_active().iter().map(|d| d.name.clone()).collect();
        assert_eq!(active, vec!["bravo"]);
    }

    #[test]
    fn replace_with_rename() {
        let store = DefinitionStore::new();
        let first = store.create(definition("alpha")).unwrap();
        store.create(definition("bravo")).unwrap();

        let mut renamed = (*first).clone();
        renamed.name = "bravo".to_string();
        assert!(matches!(store.replace(renamed).unwrap_err(), DefinitionError::Duplicate(_)));

        let mut renamed = (*first).clone();
        renamed.name = "charlie".to_string();
        store.replace(renamed).unwrap();
        assert!(store.get_by_name("alpha").is_none());
        assert_eq!(store.get_by_name("charlie").unwrap().id, first.id);
    }

    #[test]
    fn replace_unknown_rejected() {
        let store = DefinitionStore::new();
        assert!(store.replace(definition("alpha")).is_err());
        assert!(store.upsert(definition("alpha")).is_ok());
    }
}
