//! Relation facade: writes through [`RelationStore`], cached reads.

use rusqlite::Connection;
use std::sync::Arc;
use uuid::Uuid;

use crate::cache::{query_signature, QueryResultCache};
use crate::config::{Config, RelationsConfig};
use crate::db::Db;
use crate::entity::EntityRef;
use crate::error::Result;
use crate::graph::{
    traverse, traverse_path, EntityRelation, RelationPathQuery, RelationStore, RelationTypeGroup,
    RelationsQuery,
};

/// Entry point for relation reads and writes.
#[derive(Clone)]
pub struct RelationService {
    store: RelationStore,
    limits: RelationsConfig,
}

impl RelationService {
    pub fn new(store: RelationStore, limits: RelationsConfig) -> Self {
        Self { store, limits }
    }

    /// Build the service with a query cache sized from `config.cache`.
    pub fn from_config(db: Db, config: &Config) -> Self {
        let cache = (config.cache.capacity > 0)
            .then(|| Arc::new(QueryResultCache::new(config.cache.capacity)));
        Self::new(RelationStore::new(db, cache), config.relations.clone())
    }

    pub fn store(&self) -> &RelationStore {
        &self.store
    }

    pub async fn save_relation(&self, tenant_id: Uuid, relation: EntityRelation) -> Result<EntityRelation> {
        self.store.save_relation(tenant_id, relation).await
    }

    pub async fn delete_relation(&self, tenant_id: Uuid, relation: &EntityRelation) -> Result<bool> {
        self.store.delete_relation(tenant_id, relation).await
    }

    pub async fn delete_all_for_entity(&self, tenant_id: Uuid, entity: EntityRef) -> Result<usize> {
        self.store.delete_all_for_entity(tenant_id, entity).await
    }

    pub async fn find_by_from(
        &self,
        tenant_id: Uuid,
        from: EntityRef,
        group: RelationTypeGroup,
        relation_type: Option<&str>,
    ) -> Result<Vec<EntityRelation>> {
        self.store.find_by_from(tenant_id, from, group, relation_type).await
    }

    pub async fn find_by_to(
        &self,
        tenant_id: Uuid,
        to: EntityRef,
        group: RelationTypeGroup,
        relation_type: Option<&str>,
    ) -> Result<Vec<EntityRelation>> {
        self.store.find_by_to(tenant_id, to, group, relation_type).await
    }

    pub async fn get_relation(
        &self,
        tenant_id: Uuid,
        from: EntityRef,
        to: EntityRef,
        relation_type: &str,
        group: RelationTypeGroup,
    ) -> Result<Option<EntityRelation>> {
        self.store.get_relation(tenant_id, from, to, relation_type, group).await
    }

    pub async fn check_relation(
        &self,
        tenant_id: Uuid,
        from: EntityRef,
        to: EntityRef,
        relation_type: &str,
        group: RelationTypeGroup,
    ) -> Result<bool> {
        self.store.check_relation(tenant_id, from, to, relation_type, group).await
    }

    /// Hierarchical traversal, served from the cache when possible.
    pub async fn find_by_query(&self, tenant_id: Uuid, query: RelationsQuery) -> Result<Vec<EntityRelation>> {
        let query = canonical(query);
        let signature = query_signature("traverse", &query);
        self.cached(tenant_id, signature, move |conn| traverse(conn, tenant_id, &query))
            .await
    }

    /// Typed path query, capped by the tenant's configured limit.
    pub async fn find_by_path_query(
        &self,
        tenant_id: Uuid,
        query: RelationPathQuery,
    ) -> Result<Vec<EntityRelation>> {
        let limit = self.limits.path_limit_for(tenant_id);
        let signature = query_signature("path", &(&query, limit));
        self.cached(tenant_id, signature, move |conn| {
            traverse_path(conn, tenant_id, &query, limit)
        })
        .await
    }

    async fn cached<F>(
        &self,
        tenant_id: Uuid,
        signature: Option<String>,
        compute: F,
    ) -> Result<Vec<EntityRelation>>
    where
        F: FnOnce(&mut Connection) -> Result<Vec<EntityRelation>> + Send + 'static,
    {
        let cache = self.store.cache().zip(signature);

        let mut generation = None;
        if let Some((cache, signature)) = &cache {
            if let Some(hit) = cache.get(tenant_id, signature) {
                log::trace!("Query cache hit for tenant {}", tenant_id);
                return Ok(hit);
            }
            generation = cache.generation(tenant_id);
        }

        let relations = self.store.db().with_connection(compute).await?;

        if let (Some((cache, signature)), Some(generation)) = (cache, generation) {
            cache.put(tenant_id, signature, generation, relations.clone());
        }
        Ok(relations)
    }
}

/// Normalize a traversal query so equivalent queries share a signature.
fn canonical(mut query: RelationsQuery) -> RelationsQuery {
    query.roots.sort();
    query.roots.dedup();
    query.type_groups.sort();
    query.type_groups.dedup();
    if query.max_level < 0 {
        query.max_level = -1;
    }
    if let Some(filters) = query.filters.as_mut() {
        for filter in filters.iter_mut() {
            filter.entity_types.sort();
            filter.entity_types.dedup();
        }
        filters.sort();
        filters.dedup();
    }
    query
}
