//! Iterative BFS over the relation graph.

use rusqlite::Connection;
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

use crate::entity::EntityRef;
use crate::error::Result;
use crate::graph::store::find_edges;
use crate::graph::{EntityRelation, RelationKey, RelationsQuery};

/// Traverse the relation graph breadth-first from the query roots.
///
/// Every node is expanded at most once for the whole traversal, so cycles
/// and self-loops terminate; an edge into an already visited node is still
/// recorded. Roots sit at level 0 and only nodes below `max_level` are
/// expanded, which makes edges at the cutoff level the last ones returned.
///
/// With `fetch_last_level_only`, an edge survives only if it sits at
/// `max_level` or the node it leads to has no matching onward edge.
pub fn traverse(conn: &Connection, tenant_id: Uuid, query: &RelationsQuery) -> Result<Vec<EntityRelation>> {
    if query.roots.is_empty() || query.max_level == 0 {
        return Ok(Vec::new());
    }
    if matches!(&query.filters, Some(filters) if filters.is_empty()) {
        return Ok(Vec::new());
    }

    let max_level = u32::try_from(query.max_level).ok();
    let direction = query.direction;

    let mut visited: HashSet<EntityRef> = HashSet::new();
    let mut queue: VecDeque<(EntityRef, u32)> = VecDeque::new();
    for root in &query.roots {
        if visited.insert(*root) {
            queue.push_back((*root, 0));
        }
    }

    let mut seen: HashSet<RelationKey> = HashSet::new();
    let mut collected: Vec<(EntityRelation, u32)> = Vec::new();
    // Matching onward edges per expanded node, for last-level pruning.
    let mut onward: HashMap<EntityRef, usize> = HashMap::new();

    while let Some((node, level)) = queue.pop_front() {
        if max_level.is_some_and(|max| level >= max) {
            continue;
        }

        let edges = find_edges(conn, tenant_id, &node, direction, &query.type_groups, None)?;
        let mut matched = 0;
        for edge in edges {
            if !query.matches(&edge) {
                continue;
            }
            matched += 1;

            let next = edge.far_end(direction);
            if visited.insert(next) {
                queue.push_back((next, level + 1));
            }
            if seen.insert(edge.key()) {
                collected.push((edge, level + 1));
            }
        }
        onward.insert(node, matched);
    }

    if query.fetch_last_level_only {
        collected.retain(|(edge, level)| {
            Some(*level) == max_level
                || onward.get(&edge.far_end(direction)).copied().unwrap_or(0) == 0
        });
    }

    log::debug!(
        "Traversal from {} root(s) visited {} nodes, returned {} relations",
        query.roots.len(),
        visited.len(),
        collected.len()
    );

    Ok(collected.into_iter().map(|(edge, _)| edge).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::setup_test_db;
    use crate::db::Db;
    use crate::entity::EntityType;
    use crate::error::RelgraphError;
    use crate::graph::{
        RelationEntityTypeFilter, RelationTypeGroup, SearchDirection, CONTAINS_TYPE, MANAGES_TYPE,
    };
    use rusqlite::params;
    use tempfile::TempDir;

    async fn insert_relations(db: &Db, tenant: Uuid, relations: Vec<EntityRelation>) {
        db.with_connection(move |conn| {
            let tx = conn.transaction()?;
            for rel in &relations {
                tx.execute(
                    "INSERT INTO relations (tenant_id, from_id, from_type, to_id, to_type, relation_type_group, relation_type) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        tenant.to_string(),
                        rel.from.id.to_string(),
                        rel.from.entity_type.as_str(),
                        rel.to.id.to_string(),
                        rel.to.entity_type.as_str(),
                        rel.type_group.as_str(),
                        rel.relation_type,
                    ],
                )?;
            }
            tx.commit()?;
            Ok::<(), RelgraphError>(())
        })
        .await
        .unwrap();
    }

    async fn run(db: &Db, tenant: Uuid, query: RelationsQuery) -> Vec<EntityRelation> {
        db.with_connection(move |conn| traverse(conn, tenant, &query))
            .await
            .unwrap()
    }

    fn assets(n: usize) -> Vec<EntityRef> {
        (0..n).map(|_| EntityRef::random(EntityType::Asset)).collect()
    }

    fn ring(nodes: &[EntityRef]) -> Vec<EntityRelation> {
        (0..nodes.len())
            .map(|i| EntityRelation::new(nodes[i], nodes[(i + 1) % nodes.len()], CONTAINS_TYPE))
            .collect()
    }

    /// Full binary-ish tree; returns (root, edges by level starting at 1).
    fn tree(depth: usize, branching: usize) -> (EntityRef, Vec<Vec<EntityRelation>>) {
        let root = EntityRef::random(EntityType::Asset);
        let mut frontier = vec![root];
        let mut levels = Vec::new();
        for _ in 0..depth {
            let mut next = Vec::new();
            let mut edges = Vec::new();
            for parent in &frontier {
                for _ in 0..branching {
                    let child = EntityRef::random(EntityType::Device);
                    edges.push(EntityRelation::new(*parent, child, CONTAINS_TYPE));
                    next.push(child);
                }
            }
            levels.push(edges);
            frontier = next;
        }
        (root, levels)
    }

    async fn setup() -> (Db, TempDir, Uuid) {
        let (db, temp) = setup_test_db().await;
        (db, temp, Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_cycles_return_each_edge_once() {
        let (db, _temp, tenant) = setup().await;
        for n in [1usize, 2, 3, 5] {
            let nodes = assets(n);
            insert_relations(&db, tenant, ring(&nodes)).await;
            for start in &nodes {
                let found = run(&db, tenant, RelationsQuery::new(*start, SearchDirection::From)).await;
                assert_eq!(found.len(), n, "ring of {} from {}", n, start);
                let incoming = run(&db, tenant, RelationsQuery::new(*start, SearchDirection::To)).await;
                assert_eq!(incoming.len(), n);
            }
        }
    }

    #[tokio::test]
    async fn test_tree_full_and_last_level_only() {
        let (db, _temp, tenant) = setup().await;
        let (root, levels) = tree(3, 2);
        insert_relations(&db, tenant, levels.concat()).await;

        let all = run(&db, tenant, RelationsQuery::new(root, SearchDirection::From)).await;
        assert_eq!(all.len(), 2 + 4 + 8);

        let leaves = run(
            &db,
            tenant,
            RelationsQuery::new(root, SearchDirection::From)
                .with_max_level(3)
                .last_level_only(true),
        )
        .await;
        assert_eq!(leaves.len(), 8);
        for edge in &leaves {
            assert!(levels[2].contains(edge));
        }

        let unlimited_leaves = run(
            &db,
            tenant,
            RelationsQuery::new(root, SearchDirection::From).last_level_only(true),
        )
        .await;
        assert_eq!(unlimited_leaves.len(), 8);
    }

    #[tokio::test]
    async fn test_last_level_only_at_cutoff() {
        let (db, _temp, tenant) = setup().await;
        let (root, levels) = tree(3, 2);
        insert_relations(&db, tenant, levels.concat()).await;

        let cut = run(
            &db,
            tenant,
            RelationsQuery::new(root, SearchDirection::From)
                .with_max_level(2)
                .last_level_only(true),
        )
        .await;
        assert_eq!(cut.len(), 4);
        for edge in &cut {
            assert!(levels[1].contains(edge));
        }
    }

    #[tokio::test]
    async fn test_last_level_only_uneven_branches() {
        let (db, _temp, tenant) = setup().await;
        let [root, a, b, c]: [EntityRef; 4] = assets(4).try_into().unwrap();
        let short = EntityRelation::new(root, a, CONTAINS_TYPE);
        let mid = EntityRelation::new(root, b, CONTAINS_TYPE);
        let deep = EntityRelation::new(b, c, CONTAINS_TYPE);
        insert_relations(&db, tenant, vec![short.clone(), mid, deep.clone()]).await;

        let found = run(
            &db,
            tenant,
            RelationsQuery::new(root, SearchDirection::From).last_level_only(true),
        )
        .await;
        assert_eq!(found.len(), 2);
        assert!(found.contains(&short));
        assert!(found.contains(&deep));
    }

    #[tokio::test]
    async fn test_max_level_bounds() {
        let (db, _temp, tenant) = setup().await;
        let (root, levels) = tree(3, 2);
        insert_relations(&db, tenant, levels.concat()).await;

        let none = run(&db, tenant, RelationsQuery::new(root, SearchDirection::From).with_max_level(0)).await;
        assert!(none.is_empty());

        let direct = run(&db, tenant, RelationsQuery::new(root, SearchDirection::From).with_max_level(1)).await;
        assert_eq!(direct.len(), 2);

        let two = run(&db, tenant, RelationsQuery::new(root, SearchDirection::From).with_max_level(2)).await;
        assert_eq!(two.len(), 6);
    }

    #[tokio::test]
    async fn test_incoming_finds_ancestors() {
        let (db, _temp, tenant) = setup().await;
        let (root, levels) = tree(3, 2);
        insert_relations(&db, tenant, levels.concat()).await;

        let leaf = levels[2][5].to;
        let ancestors = run(&db, tenant, RelationsQuery::new(leaf, SearchDirection::To)).await;
        assert_eq!(ancestors.len(), 3);
        assert!(ancestors.iter().any(|e| e.from == root));
    }

    #[tokio::test]
    async fn test_filters_stop_expansion() {
        let (db, _temp, tenant) = setup().await;
        let root = EntityRef::random(EntityType::Asset);
        let x = EntityRef::random(EntityType::Asset);
        let y = EntityRef::random(EntityType::Device);
        let z = EntityRef::random(EntityType::User);
        let w = EntityRef::random(EntityType::Device);
        insert_relations(
            &db,
            tenant,
            vec![
                EntityRelation::new(root, x, CONTAINS_TYPE),
                EntityRelation::new(x, y, CONTAINS_TYPE),
                EntityRelation::new(root, z, MANAGES_TYPE),
                EntityRelation::new(z, w, CONTAINS_TYPE),
            ],
        )
        .await;

        let contains = run(
            &db,
            tenant,
            RelationsQuery::new(root, SearchDirection::From)
                .with_filters(vec![RelationEntityTypeFilter::new(CONTAINS_TYPE, vec![])]),
        )
        .await;
        assert_eq!(contains.len(), 2);
        assert!(contains.iter().all(|e| e.to != w));

        let devices_only = run(
            &db,
            tenant,
            RelationsQuery::new(root, SearchDirection::From).with_filters(vec![
                RelationEntityTypeFilter::new(CONTAINS_TYPE, vec![EntityType::Device]),
                RelationEntityTypeFilter::new(MANAGES_TYPE, vec![]),
            ]),
        )
        .await;
        // root -Manages-> z, z -Contains-> w; x is an asset so root->x is dropped
        assert_eq!(devices_only.len(), 2);
        assert!(devices_only.iter().any(|e| e.to == w));

        let unknown = run(
            &db,
            tenant,
            RelationsQuery::new(root, SearchDirection::From)
                .with_filters(vec![RelationEntityTypeFilter::new("Nope", vec![])]),
        )
        .await;
        assert!(unknown.is_empty());

        let empty = run(&db, tenant, RelationsQuery::new(root, SearchDirection::From).with_filters(vec![])).await;
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_multi_root_dedups() {
        let (db, _temp, tenant) = setup().await;
        let [a, b, c, d]: [EntityRef; 4] = assets(4).try_into().unwrap();
        insert_relations(
            &db,
            tenant,
            vec![
                EntityRelation::new(a, c, CONTAINS_TYPE),
                EntityRelation::new(b, c, CONTAINS_TYPE),
                EntityRelation::new(c, d, CONTAINS_TYPE),
                EntityRelation::new(a, b, CONTAINS_TYPE),
            ],
        )
        .await;

        let found = run(
            &db,
            tenant,
            RelationsQuery::new(a, SearchDirection::From).with_roots(vec![a, b, a]),
        )
        .await;
        assert_eq!(found.len(), 4);
    }

    #[tokio::test]
    async fn test_type_groups_and_tenants_are_isolated() {
        let (db, _temp, tenant) = setup().await;
        let [a, b, c]: [EntityRef; 3] = assets(3).try_into().unwrap();
        insert_relations(
            &db,
            tenant,
            vec![
                EntityRelation::new(a, b, CONTAINS_TYPE),
                EntityRelation::new(a, c, CONTAINS_TYPE).with_group(RelationTypeGroup::Edge),
            ],
        )
        .await;

        let common = run(&db, tenant, RelationsQuery::new(a, SearchDirection::From)).await;
        assert_eq!(common.len(), 1);

        let both = run(
            &db,
            tenant,
            RelationsQuery::new(a, SearchDirection::From)
                .with_type_groups(vec![RelationTypeGroup::Common, RelationTypeGroup::Edge]),
        )
        .await;
        assert_eq!(both.len(), 2);

        let foreign = run(&db, Uuid::new_v4(), RelationsQuery::new(a, SearchDirection::From)).await;
        assert!(foreign.is_empty());
    }

    #[tokio::test]
    async fn test_long_chain_is_iterative() {
        let (db, _temp, tenant) = setup().await;
        let nodes = assets(1001);
        let chain: Vec<EntityRelation> = nodes
            .windows(2)
            .map(|w| EntityRelation::new(w[0], w[1], CONTAINS_TYPE))
            .collect();
        insert_relations(&db, tenant, chain).await;

        let found = run(&db, tenant, RelationsQuery::new(nodes[0], SearchDirection::From)).await;
        assert_eq!(found.len(), 1000);

        let tail = run(
            &db,
            tenant,
            RelationsQuery::new(nodes[1000], SearchDirection::To).last_level_only(true),
        )
        .await;
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].from, nodes[0]);
    }
}
