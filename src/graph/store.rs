//! Edge CRUD over the `relations` table.

use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use std::sync::Arc;
use uuid::Uuid;

use crate::cache::QueryResultCache;
use crate::db::Db;
use crate::entity::{column_entity, EntityRef};
use crate::error::{RelgraphError, Result};
use crate::graph::{EntityRelation, RelationTypeGroup, SearchDirection};

const RELATION_COLUMNS: &str =
    "from_id, from_type, to_id, to_type, relation_type_group, relation_type, additional_info";

fn relation_from_row(row: &Row<'_>) -> rusqlite::Result<EntityRelation> {
    let group: String = row.get(4)?;
    let type_group = group.parse::<RelationTypeGroup>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let info: Option<String> = row.get(6)?;
    let additional_info = info
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e)))?;

    Ok(EntityRelation {
        from: column_entity(row, 0, 1)?,
        to: column_entity(row, 2, 3)?,
        type_group,
        relation_type: row.get(5)?,
        additional_info,
    })
}

/// Edges incident to `node` on the side given by `direction`, restricted to
/// `groups` and optionally to one relation type.
///
/// This is the single storage primitive the traversal engines build on.
pub(crate) fn find_edges(
    conn: &Connection,
    tenant_id: Uuid,
    node: &EntityRef,
    direction: SearchDirection,
    groups: &[RelationTypeGroup],
    relation_type: Option<&str>,
) -> Result<Vec<EntityRelation>> {
    if groups.is_empty() {
        return Ok(Vec::new());
    }

    let (id_col, type_col) = match direction {
        SearchDirection::From => ("from_id", "from_type"),
        SearchDirection::To => ("to_id", "to_type"),
    };
    let placeholders = groups.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let mut query = format!(
        "SELECT {} FROM relations \
         WHERE {} = ? AND {} = ? AND tenant_id = ? AND relation_type_group IN ({})",
        RELATION_COLUMNS, id_col, type_col, placeholders
    );

    let mut params: Vec<Box<dyn ToSql>> = vec![
        Box::new(node.id.to_string()),
        Box::new(node.entity_type.as_str()),
        Box::new(tenant_id.to_string()),
    ];
    for group in groups {
        params.push(Box::new(group.as_str()));
    }
    if let Some(t) = relation_type {
        query.push_str(" AND relation_type = ?");
        params.push(Box::new(t.to_string()));
    }

    let mut stmt = conn.prepare_cached(&query)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(params), relation_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn validate_relation(tenant_id: Uuid, relation: &EntityRelation) -> Result<()> {
    if tenant_id.is_nil() {
        return Err(RelgraphError::validation("relation tenant id must be specified"));
    }
    if relation.from.is_nil() {
        return Err(RelgraphError::validation("relation 'from' entity id must be specified"));
    }
    if relation.to.is_nil() {
        return Err(RelgraphError::validation("relation 'to' entity id must be specified"));
    }
    if relation.relation_type.trim().is_empty() {
        return Err(RelgraphError::validation("relation type must be specified"));
    }
    Ok(())
}

/// Edge storage. Every mutation invalidates the tenant's cached queries
/// before returning.
#[derive(Clone)]
pub struct RelationStore {
    db: Db,
    cache: Option<Arc<QueryResultCache>>,
}

impl RelationStore {
    pub fn new(db: Db, cache: Option<Arc<QueryResultCache>>) -> Self {
        Self { db, cache }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn cache(&self) -> Option<&Arc<QueryResultCache>> {
        self.cache.as_ref()
    }

    fn invalidate(&self, tenant_id: Uuid) {
        if let Some(cache) = &self.cache {
            cache.invalidate_tenant(tenant_id);
        }
    }

    /// Insert the edge, or replace the attributes of an existing edge with
    /// the same uniqueness key.
    ///
    /// Fails with a validation error if that key belongs to another tenant.
    pub async fn save_relation(&self, tenant_id: Uuid, relation: EntityRelation) -> Result<EntityRelation> {
        validate_relation(tenant_id, &relation)?;

        let info = relation
            .additional_info
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let rel = relation.clone();
        let result = self
            .db
            .with_connection(move |conn| {
                let written = conn.execute(
                    &format!(
                        "INSERT INTO relations (tenant_id, {}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                         ON CONFLICT (from_id, from_type, relation_type_group, relation_type, to_id, to_type) \
                         DO UPDATE SET additional_info = excluded.additional_info \
                         WHERE relations.tenant_id = excluded.tenant_id",
                        RELATION_COLUMNS
                    ),
                    params![
                        tenant_id.to_string(),
                        rel.from.id.to_string(),
                        rel.from.entity_type.as_str(),
                        rel.to.id.to_string(),
                        rel.to.entity_type.as_str(),
                        rel.type_group.as_str(),
                        rel.relation_type,
                        info,
                    ],
                )?;
                // An edge keeps the tenant that first saved it.
                if written == 0 {
                    return Err(RelgraphError::validation(
                        "relation is already owned by another tenant",
                    ));
                }
                Ok(())
            })
            .await;
        self.invalidate(tenant_id);
        result?;

        log::debug!(
            "Saved relation {} -[{}]-> {} ({})",
            relation.from, relation.relation_type, relation.to, relation.type_group
        );
        Ok(relation)
    }

    /// Delete the edge with the same uniqueness key.
    ///
    /// Returns true only for the call that actually removed the row.
    pub async fn delete_relation(&self, tenant_id: Uuid, relation: &EntityRelation) -> Result<bool> {
        let rel = relation.clone();
        let result = self
            .db
            .with_connection(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM relations \
                     WHERE from_id = ?1 AND from_type = ?2 AND to_id = ?3 AND to_type = ?4 \
                     AND relation_type_group = ?5 AND relation_type = ?6 AND tenant_id = ?7",
                    params![
                        rel.from.id.to_string(),
                        rel.from.entity_type.as_str(),
                        rel.to.id.to_string(),
                        rel.to.entity_type.as_str(),
                        rel.type_group.as_str(),
                        rel.relation_type,
                        tenant_id.to_string(),
                    ],
                )?;
                Ok(removed > 0)
            })
            .await;
        self.invalidate(tenant_id);
        result
    }

    /// Remove every edge touching `entity`, in any type group.
    pub async fn delete_all_for_entity(&self, tenant_id: Uuid, entity: EntityRef) -> Result<usize> {
        let result = self
            .db
            .with_connection(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM relations WHERE tenant_id = ?1 AND \
                     ((from_id = ?2 AND from_type = ?3) OR (to_id = ?2 AND to_type = ?3))",
                    params![tenant_id.to_string(), entity.id.to_string(), entity.entity_type.as_str()],
                )?;
                Ok(removed)
            })
            .await;
        self.invalidate(tenant_id);

        let removed = result?;
        log::debug!("Deleted {} relations of {}", removed, entity);
        Ok(removed)
    }

    /// Outgoing edges of `from` within a group.
    pub async fn find_by_from(
        &self,
        tenant_id: Uuid,
        from: EntityRef,
        group: RelationTypeGroup,
        relation_type: Option<&str>,
    ) -> Result<Vec<EntityRelation>> {
        self.find_incident(tenant_id, from, SearchDirection::From, group, relation_type)
            .await
    }

    /// Incoming edges of `to` within a group.
    pub async fn find_by_to(
        &self,
        tenant_id: Uuid,
        to: EntityRef,
        group: RelationTypeGroup,
        relation_type: Option<&str>,
    ) -> Result<Vec<EntityRelation>> {
        self.find_incident(tenant_id, to, SearchDirection::To, group, relation_type)
            .await
    }

    async fn find_incident(
        &self,
        tenant_id: Uuid,
        node: EntityRef,
        direction: SearchDirection,
        group: RelationTypeGroup,
        relation_type: Option<&str>,
    ) -> Result<Vec<EntityRelation>> {
        let relation_type = relation_type.map(str::to_string);
        self.db
            .with_connection(move |conn| {
                find_edges(conn, tenant_id, &node, direction, &[group], relation_type.as_deref())
            })
            .await
    }

    /// Fetch a single edge by its uniqueness key.
    pub async fn get_relation(
        &self,
        tenant_id: Uuid,
        from: EntityRef,
        to: EntityRef,
        relation_type: &str,
        group: RelationTypeGroup,
    ) -> Result<Option<EntityRelation>> {
        let relation_type = relation_type.to_string();
        self.db
            .with_connection(move |conn| {
                let relation = conn
                    .query_row(
                        &format!(
                            "SELECT {} FROM relations \
                             WHERE from_id = ?1 AND from_type = ?2 AND to_id = ?3 AND to_type = ?4 \
                             AND relation_type_group = ?5 AND relation_type = ?6 AND tenant_id = ?7",
                            RELATION_COLUMNS
                        ),
                        params![
                            from.id.to_string(),
                            from.entity_type.as_str(),
                            to.id.to_string(),
                            to.entity_type.as_str(),
                            group.as_str(),
                            relation_type,
                            tenant_id.to_string(),
                        ],
                        relation_from_row,
                    )
                    .optional()?;
                Ok(relation)
            })
            .await
    }

    /// Whether an edge with this uniqueness key exists.
    pub async fn check_relation(
        &self,
        tenant_id: Uuid,
        from: EntityRef,
        to: EntityRef,
        relation_type: &str,
        group: RelationTypeGroup,
    ) -> Result<bool> {
        Ok(self
            .get_relation(tenant_id, from, to, relation_type, group)
            .await?
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::setup_test_db;
    use crate::entity::EntityType;
    use crate::graph::CONTAINS_TYPE;
    use serde_json::json;

    fn store(db: Db) -> RelationStore {
        RelationStore::new(db, Some(Arc::new(QueryResultCache::new(16))))
    }

    #[tokio::test]
    async fn test_save_and_find() {
        let (db, _temp) = setup_test_db().await;
        let store = store(db);
        let tenant = Uuid::new_v4();
        let asset = EntityRef::random(EntityType::Asset);
        let device = EntityRef::random(EntityType::Device);

        store
            .save_relation(tenant, EntityRelation::new(asset, device, CONTAINS_TYPE))
            .await
            .unwrap();

        let out = store.find_by_from(tenant, asset, RelationTypeGroup::Common, None).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, device);

        let inbound = store
            .find_by_to(tenant, device, RelationTypeGroup::Common, Some(CONTAINS_TYPE))
            .await
            .unwrap();
        assert_eq!(inbound.len(), 1);

        let wrong_type = store
            .find_by_to(tenant, device, RelationTypeGroup::Common, Some("Manages"))
            .await
            .unwrap();
        assert!(wrong_type.is_empty());

        let other_group = store.find_by_from(tenant, asset, RelationTypeGroup::Edge, None).await.unwrap();
        assert!(other_group.is_empty());
    }

    #[tokio::test]
    async fn test_save_upserts_on_key() {
        let (db, _temp) = setup_test_db().await;
        let store = store(db);
        let tenant = Uuid::new_v4();
        let asset = EntityRef::random(EntityType::Asset);
        let device = EntityRef::random(EntityType::Device);

        let rel = EntityRelation::new(asset, device, CONTAINS_TYPE);
        store.save_relation(tenant, rel.clone().with_info(json!({"v": 1}))).await.unwrap();
        store.save_relation(tenant, rel.clone().with_info(json!({"v": 2}))).await.unwrap();

        let out = store.find_by_from(tenant, asset, RelationTypeGroup::Common, None).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].additional_info, Some(json!({"v": 2})));
    }

    #[tokio::test]
    async fn test_save_rejects_missing_fields() {
        let (db, _temp) = setup_test_db().await;
        let store = store(db);
        let tenant = Uuid::new_v4();
        let asset = EntityRef::random(EntityType::Asset);
        let nil_device = EntityRef::new(EntityType::Device, Uuid::nil());

        let err = store
            .save_relation(tenant, EntityRelation::new(asset, nil_device, CONTAINS_TYPE))
            .await
            .unwrap_err();
        assert!(matches!(err, RelgraphError::Validation(_)));

        let err = store
            .save_relation(tenant, EntityRelation::new(nil_device, asset, CONTAINS_TYPE))
            .await
            .unwrap_err();
        assert!(matches!(err, RelgraphError::Validation(_)));

        let device = EntityRef::random(EntityType::Device);
        let err = store
            .save_relation(tenant, EntityRelation::new(asset, device, "  "))
            .await
            .unwrap_err();
        assert!(matches!(err, RelgraphError::Validation(_)));

        let out = store.find_by_from(tenant, asset, RelationTypeGroup::Common, None).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (db, _temp) = setup_test_db().await;
        let store = store(db);
        let tenant = Uuid::new_v4();
        let rel = EntityRelation::new(
            EntityRef::random(EntityType::Asset),
            EntityRef::random(EntityType::Device),
            CONTAINS_TYPE,
        );
        store.save_relation(tenant, rel.clone()).await.unwrap();

        assert!(store.delete_relation(tenant, &rel).await.unwrap());
        assert!(!store.delete_relation(tenant, &rel).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_deletes_single_winner() {
        let (db, _temp) = setup_test_db().await;
        let store = store(db);
        let tenant = Uuid::new_v4();
        let rel = EntityRelation::new(
            EntityRef::random(EntityType::Asset),
            EntityRef::random(EntityType::Device),
            CONTAINS_TYPE,
        );
        store.save_relation(tenant, rel.clone()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let rel = rel.clone();
            handles.push(tokio::spawn(async move { store.delete_relation(tenant, &rel).await }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_delete_all_for_entity() {
        let (db, _temp) = setup_test_db().await;
        let store = store(db);
        let tenant = Uuid::new_v4();
        let asset = EntityRef::random(EntityType::Asset);
        let device = EntityRef::random(EntityType::Device);
        let parent = EntityRef::random(EntityType::Asset);
        let unrelated = EntityRef::random(EntityType::Asset);

        store.save_relation(tenant, EntityRelation::new(parent, asset, CONTAINS_TYPE)).await.unwrap();
        store.save_relation(tenant, EntityRelation::new(asset, device, CONTAINS_TYPE)).await.unwrap();
        store
            .save_relation(
                tenant,
                EntityRelation::new(asset, device, CONTAINS_TYPE).with_group(RelationTypeGroup::Edge),
            )
            .await
            .unwrap();
        store.save_relation(tenant, EntityRelation::new(parent, unrelated, CONTAINS_TYPE)).await.unwrap();

        assert_eq!(store.delete_all_for_entity(tenant, asset).await.unwrap(), 3);
        let left = store.find_by_from(tenant, parent, RelationTypeGroup::Common, None).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].to, unrelated);
    }

    #[tokio::test]
    async fn test_get_and_check_relation() {
        let (db, _temp) = setup_test_db().await;
        let store = store(db);
        let tenant = Uuid::new_v4();
        let asset = EntityRef::random(EntityType::Asset);
        let device = EntityRef::random(EntityType::Device);
        store.save_relation(tenant, EntityRelation::new(asset, device, CONTAINS_TYPE)).await.unwrap();

        assert!(store
            .check_relation(tenant, asset, device, CONTAINS_TYPE, RelationTypeGroup::Common)
            .await
            .unwrap());
        assert!(!store
            .check_relation(tenant, device, asset, CONTAINS_TYPE, RelationTypeGroup::Common)
            .await
            .unwrap());
        assert!(store
            .get_relation(Uuid::new_v4(), asset, device, CONTAINS_TYPE, RelationTypeGroup::Common)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_mutation_invalidates_cache() {
        let (db, _temp) = setup_test_db().await;
        let store = store(db);
        let cache = store.cache().unwrap().clone();
        let tenant = Uuid::new_v4();
        let other = Uuid::new_v4();
        cache.put(tenant, "q".to_string(), 0, vec![]);
        cache.put(other, "q".to_string(), 0, vec![]);

        let rel = EntityRelation::new(
            EntityRef::random(EntityType::Asset),
            EntityRef::random(EntityType::Device),
            CONTAINS_TYPE,
        );
        store.save_relation(tenant, rel).await.unwrap();

        assert!(cache.get(tenant, "q").is_none());
        assert!(cache.get(other, "q").is_some());
    }

    #[tokio::test]
    async fn test_save_keeps_owning_tenant() {
        let (db, _temp) = setup_test_db().await;
        let store = store(db);
        let cache = store.cache().unwrap().clone();
        let owner = Uuid::new_v4();
        let intruder = Uuid::new_v4();
        let asset = EntityRef::random(EntityType::Asset);
        let rel = EntityRelation::new(asset, EntityRef::random(EntityType::Device), CONTAINS_TYPE);

        store.save_relation(owner, rel.clone().with_info(json!({"v": 1}))).await.unwrap();
        cache.put(owner, "q".to_string(), cache.generation(owner).unwrap(), vec![rel.clone()]);

        let err = store
            .save_relation(intruder, rel.clone().with_info(json!({"v": 2})))
            .await
            .unwrap_err();
        assert!(matches!(err, RelgraphError::Validation(_)));

        assert_eq!(cache.get(owner, "q"), Some(vec![rel.clone()]));
        let owned = store.find_by_from(owner, asset, RelationTypeGroup::Common, None).await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].additional_info, Some(json!({"v": 1})));
        assert!(store
            .find_by_from(intruder, asset, RelationTypeGroup::Common, None)
            .await
            .unwrap()
            .is_empty());
        assert!(store.delete_relation(owner, &rel).await.unwrap());
    }
}
