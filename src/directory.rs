//! Lookups the alarm subsystem needs from the rest of the platform: entity
//! ownership and the latest value of a key.

use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::entity::EntityRef;
use crate::query::{EntityKey, KvValue};

/// Resolves the customer an entity belongs to.
pub trait EntityDirectory: Send + Sync {
    /// `None` when the entity is owned by the tenant directly.
    fn owner_of(&self, tenant_id: Uuid, entity: &EntityRef) -> Option<EntityRef>;
}

/// Latest attribute, time-series or field value of an entity.
pub trait KeyValueSource: Send + Sync {
    fn latest(&self, tenant_id: Uuid, entity: &EntityRef, key: &EntityKey) -> Option<KvValue>;
}

#[derive(Default)]
struct DirectoryState {
    owners: HashMap<(Uuid, EntityRef), EntityRef>,
    values: HashMap<(Uuid, EntityRef, EntityKey), KvValue>,
}

/// Map-backed directory for in-process use and tests.
#[derive(Default)]
pub struct InMemoryDirectory {
    state: RwLock<DirectoryState>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_owner(&self, tenant_id: Uuid, entity: EntityRef, customer: EntityRef) {
        match self.state.write() {
            Ok(mut state) => {
                state.owners.insert((tenant_id, entity), customer);
            }
            Err(_) => log::warn!("Directory lock poisoned; owner of {} not recorded", entity),
        }
    }

    pub fn set_value(&self, tenant_id: Uuid, entity: EntityRef, key: EntityKey, value: impl Into<KvValue>) {
        match self.state.write() {
            Ok(mut state) => {
                state.values.insert((tenant_id, entity, key), value.into());
            }
            Err(_) => log::warn!("Directory lock poisoned; value for {} not recorded", entity),
        }
    }
}

impl EntityDirectory for InMemoryDirectory {
    fn owner_of(&self, tenant_id: Uuid, entity: &EntityRef) -> Option<EntityRef> {
        let state = self.state.read().ok()?;
        state.owners.get(&(tenant_id, *entity)).copied()
    }
}

impl KeyValueSource for InMemoryDirectory {
    fn latest(&self, tenant_id: Uuid, entity: &EntityRef, key: &EntityKey) -> Option<KvValue> {
        let state = self.state.read().ok()?;
        state.values.get(&(tenant_id, *entity, key.clone())).cloned()
    }
}
