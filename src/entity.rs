//! Entity references: the nodes of the relation graph.

use rusqlite::types::Type;
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::RelgraphError;

/// Kind of entity a reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Tenant,
    Customer,
    User,
    Device,
    Asset,
    EntityView,
    Dashboard,
    Alarm,
    OtaPackage,
    Edge,
    RuleChain,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Tenant => "TENANT",
            EntityType::Customer => "CUSTOMER",
            EntityType::User => "USER",
            EntityType::Device => "DEVICE",
            EntityType::Asset => "ASSET",
            EntityType::EntityView => "ENTITY_VIEW",
            EntityType::Dashboard => "DASHBOARD",
            EntityType::Alarm => "ALARM",
            EntityType::OtaPackage => "OTA_PACKAGE",
            EntityType::Edge => "EDGE",
            EntityType::RuleChain => "RULE_CHAIN",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = RelgraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "TENANT" => EntityType::Tenant,
            "CUSTOMER" => EntityType::Customer,
            "USER" => EntityType::User,
            "DEVICE" => EntityType::Device,
            "ASSET" => EntityType::Asset,
            "ENTITY_VIEW" => EntityType::EntityView,
            "DASHBOARD" => EntityType::Dashboard,
            "ALARM" => EntityType::Alarm,
            "OTA_PACKAGE" => EntityType::OtaPackage,
            "EDGE" => EntityType::Edge,
            "RULE_CHAIN" => EntityType::RuleChain,
            other => return Err(RelgraphError::validation(format!("unknown entity type: {}", other))),
        })
    }
}

/// Typed pointer to an entity, e.g. `DEVICE:0b1e...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub id: Uuid,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, id: Uuid) -> Self {
        Self { entity_type, id }
    }

    pub fn tenant(id: Uuid) -> Self {
        Self::new(EntityType::Tenant, id)
    }

    pub fn customer(id: Uuid) -> Self {
        Self::new(EntityType::Customer, id)
    }

    pub fn device(id: Uuid) -> Self {
        Self::new(EntityType::Device, id)
    }

    pub fn asset(id: Uuid) -> Self {
        Self::new(EntityType::Asset, id)
    }

    /// Random id, handy for fixtures and new entities.
    pub fn random(entity_type: EntityType) -> Self {
        Self::new(entity_type, Uuid::new_v4())
    }

    pub fn is_nil(&self) -> bool {
        self.id.is_nil()
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

impl FromStr for EntityRef {
    type Err = RelgraphError;

    /// Parses the `TYPE:uuid` form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ty, id) = s
            .split_once(':')
            .ok_or_else(|| RelgraphError::validation(format!("expected TYPE:uuid, got {}", s)))?;
        let id = Uuid::parse_str(id.trim())
            .map_err(|e| RelgraphError::validation(format!("invalid entity id {}: {}", id, e)))?;
        Ok(Self::new(ty.trim().parse()?, id))
    }
}

/// Read a TEXT uuid column.
pub(crate) fn column_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read a nullable TEXT uuid column.
pub(crate) fn column_opt_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        Uuid::parse_str(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

/// Read an entity reference stored as an `(id, type)` column pair.
pub(crate) fn column_entity(row: &Row<'_>, id_idx: usize, type_idx: usize) -> rusqlite::Result<EntityRef> {
    let id = column_uuid(row, id_idx)?;
    let raw: String = row.get(type_idx)?;
    let entity_type = raw
        .parse::<EntityType>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(type_idx, Type::Text, Box::new(e)))?;
    Ok(EntityRef::new(entity_type, id))
}
