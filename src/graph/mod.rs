//! Relation graph: edge storage, BFS traversal and typed path queries.
//!
//! Edges live in the `relations` table and are addressed by entity
//! references. Reads go through [`RelationService`], which consults the
//! query cache; writes go through [`RelationStore`], which invalidates it.

mod path;
mod service;
mod store;
mod traversal;

pub use path::traverse_path;
pub use service::RelationService;
pub use store::RelationStore;
pub use traversal::traverse;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::entity::{EntityRef, EntityType};
use crate::error::RelgraphError;

/// Containment hierarchy, e.g. an asset containing devices.
pub const CONTAINS_TYPE: &str = "Contains";
/// Management relation, e.g. a user managing a device.
pub const MANAGES_TYPE: &str = "Manages";

/// Namespace partitioning the relation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationTypeGroup {
    #[default]
    Common,
    Dashboard,
    RuleChain,
    RuleNode,
    Edge,
}

impl RelationTypeGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationTypeGroup::Common => "COMMON",
            RelationTypeGroup::Dashboard => "DASHBOARD",
            RelationTypeGroup::RuleChain => "RULE_CHAIN",
            RelationTypeGroup::RuleNode => "RULE_NODE",
            RelationTypeGroup::Edge => "EDGE",
        }
    }
}

impl fmt::Display for RelationTypeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationTypeGroup {
    type Err = RelgraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "COMMON" => RelationTypeGroup::Common,
            "DASHBOARD" => RelationTypeGroup::Dashboard,
            "RULE_CHAIN" => RelationTypeGroup::RuleChain,
            "RULE_NODE" => RelationTypeGroup::RuleNode,
            "EDGE" => RelationTypeGroup::Edge,
            other => return Err(RelgraphError::validation(format!("unknown relation type group: {}", other))),
        })
    }
}

/// Which end of an edge a traversal walks from.
///
/// `From` follows outgoing edges (node is `from`, next node is `to`);
/// `To` follows incoming edges (node is `to`, next node is `from`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SearchDirection {
    From,
    To,
}

impl FromStr for SearchDirection {
    type Err = RelgraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FROM" | "OUTGOING" => Ok(SearchDirection::From),
            "TO" | "INCOMING" => Ok(SearchDirection::To),
            other => Err(RelgraphError::validation(format!("unknown search direction: {}", other))),
        }
    }
}

/// A single directed edge (from --relation_type--> to) within a type group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRelation {
    pub from: EntityRef,
    pub to: EntityRef,
    #[serde(rename = "type")]
    pub relation_type: String,
    #[serde(default)]
    pub type_group: RelationTypeGroup,
    /// Free-form JSON attributes attached to the edge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<serde_json::Value>,
}

impl EntityRelation {
    /// Edge in the `COMMON` group without attributes.
    pub fn new(from: EntityRef, to: EntityRef, relation_type: impl Into<String>) -> Self {
        Self {
            from,
            to,
            relation_type: relation_type.into(),
            type_group: RelationTypeGroup::Common,
            additional_info: None,
        }
    }

    pub fn with_group(mut self, type_group: RelationTypeGroup) -> Self {
        self.type_group = type_group;
        self
    }

    pub fn with_info(mut self, info: serde_json::Value) -> Self {
        self.additional_info = Some(info);
        self
    }

    /// Uniqueness key: two edges with the same key are the same edge.
    pub fn key(&self) -> RelationKey {
        RelationKey {
            from: self.from,
            to: self.to,
            type_group: self.type_group,
            relation_type: self.relation_type.clone(),
        }
    }

    /// Node reached when walking this edge in `direction`.
    pub fn far_end(&self, direction: SearchDirection) -> EntityRef {
        match direction {
            SearchDirection::From => self.to,
            SearchDirection::To => self.from,
        }
    }
}

/// Identity of an edge, independent of its attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationKey {
    pub from: EntityRef,
    pub to: EntityRef,
    pub type_group: RelationTypeGroup,
    pub relation_type: String,
}

/// Restricts matched edges to a relation type and, optionally, to the
/// entity types of the node the edge leads to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationEntityTypeFilter {
    pub relation_type: String,
    /// Empty means any entity type.
    #[serde(default)]
    pub entity_types: Vec<EntityType>,
}

impl RelationEntityTypeFilter {
    pub fn new(relation_type: impl Into<String>, entity_types: Vec<EntityType>) -> Self {
        Self {
            relation_type: relation_type.into(),
            entity_types,
        }
    }

    pub(crate) fn matches(&self, relation: &EntityRelation, direction: SearchDirection) -> bool {
        self.relation_type == relation.relation_type
            && (self.entity_types.is_empty()
                || self.entity_types.contains(&relation.far_end(direction).entity_type))
    }
}

/// Hierarchical "who is related to X" query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationsQuery {
    pub roots: Vec<EntityRef>,
    pub direction: SearchDirection,
    /// `-1` (or any negative) is unlimited, `0` returns nothing.
    pub max_level: i32,
    #[serde(default)]
    pub fetch_last_level_only: bool,
    #[serde(default = "default_type_groups")]
    pub type_groups: Vec<RelationTypeGroup>,
    /// `None` matches every edge; `Some(vec![])` matches none.
    #[serde(default)]
    pub filters: Option<Vec<RelationEntityTypeFilter>>,
}

fn default_type_groups() -> Vec<RelationTypeGroup> {
    vec![RelationTypeGroup::Common]
}

impl RelationsQuery {
    /// Unlimited, unfiltered query over the `COMMON` group.
    pub fn new(root: EntityRef, direction: SearchDirection) -> Self {
        Self {
            roots: vec![root],
            direction,
            max_level: -1,
            fetch_last_level_only: false,
            type_groups: default_type_groups(),
            filters: None,
        }
    }

    pub fn with_roots(mut self, roots: Vec<EntityRef>) -> Self {
        self.roots = roots;
        self
    }

    pub fn with_max_level(mut self, max_level: i32) -> Self {
        self.max_level = max_level;
        self
    }

    pub fn last_level_only(mut self, enabled: bool) -> Self {
        self.fetch_last_level_only = enabled;
        self
    }

    pub fn with_type_groups(mut self, groups: Vec<RelationTypeGroup>) -> Self {
        self.type_groups = groups;
        self
    }

    pub fn with_filters(mut self, filters: Vec<RelationEntityTypeFilter>) -> Self {
        self.filters = Some(filters);
        self
    }

    pub(crate) fn matches(&self, relation: &EntityRelation) -> bool {
        match &self.filters {
            None => true,
            Some(filters) => filters.iter().any(|f| f.matches(relation, self.direction)),
        }
    }
}

/// One step of a path query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationPathLevel {
    pub direction: SearchDirection,
    pub relation_type: String,
}

impl RelationPathLevel {
    pub fn new(direction: SearchDirection, relation_type: impl Into<String>) -> Self {
        Self {
            direction,
            relation_type: relation_type.into(),
        }
    }
}

/// Fixed-length path query: every step is typed and directed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationPathQuery {
    pub root: EntityRef,
    pub levels: Vec<RelationPathLevel>,
    #[serde(default)]
    pub type_group: RelationTypeGroup,
}

impl RelationPathQuery {
    pub fn new(root: EntityRef, levels: Vec<RelationPathLevel>) -> Self {
        Self {
            root,
            levels,
            type_group: RelationTypeGroup::Common,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches_far_end_type() {
        let asset = EntityRef::random(EntityType::Asset);
        let device = EntityRef::random(EntityType::Device);
        let rel = EntityRelation::new(asset, device, CONTAINS_TYPE);

        let devices_only = RelationEntityTypeFilter::new(CONTAINS_TYPE, vec![EntityType::Device]);
        assert!(devices_only.matches(&rel, SearchDirection::From));
        // Walking incoming, the far end is the asset
        assert!(!devices_only.matches(&rel, SearchDirection::To));

        let any_type = RelationEntityTypeFilter::new(CONTAINS_TYPE, vec![]);
        assert!(any_type.matches(&rel, SearchDirection::To));
        assert!(!RelationEntityTypeFilter::new(MANAGES_TYPE, vec![]).matches(&rel, SearchDirection::From));
    }

    #[test]
    fn test_query_filter_presence() {
        let root = EntityRef::random(EntityType::Asset);
        let rel = EntityRelation::new(root, EntityRef::random(EntityType::Device), CONTAINS_TYPE);

        let open = RelationsQuery::new(root, SearchDirection::From);
        assert!(open.matches(&rel));

        let closed = open.clone().with_filters(vec![]);
        assert!(!closed.matches(&rel));
    }

    #[test]
    fn test_relation_json_shape() {
        let rel = EntityRelation::new(
            EntityRef::random(EntityType::Asset),
            EntityRef::random(EntityType::Device),
            CONTAINS_TYPE,
        );
        let json = serde_json::to_value(&rel).unwrap();
        assert_eq!(json["type"], "Contains");
        assert_eq!(json["typeGroup"], "COMMON");
        assert!(json.get("additionalInfo").is_none());
    }

    #[test]
    fn test_direction_aliases() {
        assert_eq!("outgoing".parse::<SearchDirection>().unwrap(), SearchDirection::From);
        assert_eq!("TO".parse::<SearchDirection>().unwrap(), SearchDirection::To);
    }
}
