//! Computes the entities an alarm is visible on.

use rusqlite::Connection;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::alarm::Alarm;
use crate::directory::EntityDirectory;
use crate::entity::EntityRef;
use crate::error::Result;
use crate::graph::{traverse, RelationEntityTypeFilter, RelationsQuery, SearchDirection};

/// Resolves propagation targets from the alarm's flags and the current graph.
#[derive(Clone)]
pub struct AlarmPropagationResolver {
    directory: Arc<dyn EntityDirectory>,
}

impl AlarmPropagationResolver {
    pub fn new(directory: Arc<dyn EntityDirectory>) -> Self {
        Self { directory }
    }

    /// The originator, then ancestors, owner and tenant as the flags ask.
    ///
    /// Ancestors are every `from` end of an unlimited incoming traversal in
    /// the `COMMON` group, through every parent, restricted to
    /// `propagate_relation_types` when that list is non-empty.
    pub fn resolve(&self, conn: &Connection, alarm: &Alarm) -> Result<Vec<EntityRef>> {
        let mut entities = BTreeSet::new();
        entities.insert(alarm.originator);

        let flags = &alarm.propagation;
        if flags.propagate {
            let mut query = RelationsQuery::new(alarm.originator, SearchDirection::To);
            if !flags.propagate_relation_types.is_empty() {
                let filters = flags
                    .propagate_relation_types
                    .iter()
                    .map(|t| RelationEntityTypeFilter::new(t.as_str(), Vec::new()))
                    .collect();
                query = query.with_filters(filters);
            }
            for edge in traverse(conn, alarm.tenant_id, &query)? {
                entities.insert(edge.from);
            }
        }

        if flags.propagate_to_owner {
            let owner = alarm
                .customer_id
                .map(EntityRef::customer)
                .or_else(|| self.directory.owner_of(alarm.tenant_id, &alarm.originator))
                .unwrap_or_else(|| EntityRef::tenant(alarm.tenant_id));
            entities.insert(owner);
        }

        if flags.propagate_to_tenant {
            entities.insert(EntityRef::tenant(alarm.tenant_id));
        }

        log::debug!(
            "Alarm {} on {} propagates to {} entities",
            alarm.id,
            alarm.originator,
            entities.len()
        );
        Ok(entities.into_iter().collect())
    }
}
