//! Fixed-length typed path queries.

use rusqlite::Connection;
use std::collections::HashSet;
use uuid::Uuid;

use crate::entity::EntityRef;
use crate::error::Result;
use crate::graph::store::find_edges;
use crate::graph::{EntityRelation, RelationKey, RelationPathQuery};

/// Walk `query.levels` step by step from the root and return the edges
/// produced by the last step, at most `limit` of them.
///
/// Intermediate steps only feed the next frontier. Collection of the final
/// step stops as soon as `limit` distinct edges are gathered.
pub fn traverse_path(
    conn: &Connection,
    tenant_id: Uuid,
    query: &RelationPathQuery,
    limit: usize,
) -> Result<Vec<EntityRelation>> {
    let Some((last, steps)) = query.levels.split_last() else {
        return Ok(Vec::new());
    };
    if limit == 0 {
        return Ok(Vec::new());
    }
    let groups = [query.type_group];

    let mut frontier: Vec<EntityRef> = vec![query.root];
    for step in steps {
        let mut seen = HashSet::new();
        let mut next = Vec::new();
        for node in &frontier {
            for edge in find_edges(conn, tenant_id, node, step.direction, &groups, Some(step.relation_type.as_str()))? {
                let far = edge.far_end(step.direction);
                if seen.insert(far) {
                    next.push(far);
                }
            }
        }
        if next.is_empty() {
            return Ok(Vec::new());
        }
        frontier = next;
    }

    let mut seen: HashSet<RelationKey> = HashSet::new();
    let mut result = Vec::new();
    'frontier: for node in &frontier {
        for edge in find_edges(conn, tenant_id, node, last.direction, &groups, Some(last.relation_type.as_str()))? {
            if seen.insert(edge.key()) {
                result.push(edge);
                if result.len() == limit {
                    log::debug!("Path query from {} truncated at {} relations", query.root, limit);
                    break 'frontier;
                }
            }
        }
    }

    Ok(result)
}
