//! Alarms: lifecycle, propagation over the relation graph and search.

mod locks;
mod propagation;
mod service;
mod store;

pub use propagation::AlarmPropagationResolver;
pub use service::AlarmService;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::entity::EntityRef;
use crate::error::RelgraphError;
use crate::query::{KeyFilter, KvValue};

/// Alarm severity. Ordered so that `Critical` is the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmSeverity {
    Indeterminate,
    Warning,
    Minor,
    Major,
    Critical,
}

impl AlarmSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmSeverity::Indeterminate => "INDETERMINATE",
            AlarmSeverity::Warning => "WARNING",
            AlarmSeverity::Minor => "MINOR",
            AlarmSeverity::Major => "MAJOR",
            AlarmSeverity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for AlarmSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlarmSeverity {
    type Err = RelgraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "INDETERMINATE" => AlarmSeverity::Indeterminate,
            "WARNING" => AlarmSeverity::Warning,
            "MINOR" => AlarmSeverity::Minor,
            "MAJOR" => AlarmSeverity::Major,
            "CRITICAL" => AlarmSeverity::Critical,
            other => return Err(RelgraphError::validation(format!("unknown alarm severity: {}", other))),
        })
    }
}

/// Product of the cleared and acknowledged flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmStatus {
    ActiveUnack,
    ActiveAck,
    ClearedUnack,
    ClearedAck,
}

impl AlarmStatus {
    pub fn from_flags(cleared: bool, acknowledged: bool) -> Self {
        match (cleared, acknowledged) {
            (false, false) => AlarmStatus::ActiveUnack,
            (false, true) => AlarmStatus::ActiveAck,
            (true, false) => AlarmStatus::ClearedUnack,
            (true, true) => AlarmStatus::ClearedAck,
        }
    }

    pub fn is_cleared(&self) -> bool {
        matches!(self, AlarmStatus::ClearedUnack | AlarmStatus::ClearedAck)
    }

    pub fn is_acknowledged(&self) -> bool {
        matches!(self, AlarmStatus::ActiveAck | AlarmStatus::ClearedAck)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmStatus::ActiveUnack => "ACTIVE_UNACK",
            AlarmStatus::ActiveAck => "ACTIVE_ACK",
            AlarmStatus::ClearedUnack => "CLEARED_UNACK",
            AlarmStatus::ClearedAck => "CLEARED_ACK",
        }
    }
}

impl fmt::Display for AlarmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlarmStatus {
    type Err = RelgraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "ACTIVE_UNACK" => AlarmStatus::ActiveUnack,
            "ACTIVE_ACK" => AlarmStatus::ActiveAck,
            "CLEARED_UNACK" => AlarmStatus::ClearedUnack,
            "CLEARED_ACK" => AlarmStatus::ClearedAck,
            other => return Err(RelgraphError::validation(format!("unknown alarm status: {}", other))),
        })
    }
}

/// Coarse filter over the two status flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmSearchStatus {
    #[default]
    Any,
    Active,
    Cleared,
    Ack,
    Unack,
}

impl AlarmSearchStatus {
    pub fn matches(&self, status: AlarmStatus) -> bool {
        match self {
            AlarmSearchStatus::Any => true,
            AlarmSearchStatus::Active => !status.is_cleared(),
            AlarmSearchStatus::Cleared => status.is_cleared(),
            AlarmSearchStatus::Ack => status.is_acknowledged(),
            AlarmSearchStatus::Unack => !status.is_acknowledged(),
        }
    }
}

impl FromStr for AlarmSearchStatus {
    type Err = RelgraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "ANY" => AlarmSearchStatus::Any,
            "ACTIVE" => AlarmSearchStatus::Active,
            "CLEARED" => AlarmSearchStatus::Cleared,
            "ACK" => AlarmSearchStatus::Ack,
            "UNACK" => AlarmSearchStatus::Unack,
            other => return Err(RelgraphError::validation(format!("unknown alarm search status: {}", other))),
        })
    }
}

/// Which entities besides the originator an alarm is visible on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmPropagation {
    /// Propagate to every ancestor of the originator.
    #[serde(default)]
    pub propagate: bool,
    #[serde(default)]
    pub propagate_to_owner: bool,
    #[serde(default)]
    pub propagate_to_tenant: bool,
    /// Relation types followed when `propagate` is set. Empty follows all.
    #[serde(default)]
    pub propagate_relation_types: Vec<String>,
}

impl AlarmPropagation {
    /// Propagate along ancestors connected by any relation type.
    pub fn to_ancestors() -> Self {
        Self {
            propagate: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alarm {
    pub id: Uuid,
    pub created_time: i64,
    pub tenant_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub originator: EntityRef,
    #[serde(rename = "type")]
    pub alarm_type: String,
    pub severity: AlarmSeverity,
    pub acknowledged: bool,
    pub cleared: bool,
    pub assignee_id: Option<Uuid>,
    pub start_ts: i64,
    pub end_ts: i64,
    pub ack_ts: i64,
    pub clear_ts: i64,
    pub assign_ts: i64,
    pub details: Option<serde_json::Value>,
    #[serde(flatten)]
    pub propagation: AlarmPropagation,
}

impl Alarm {
    pub fn status(&self) -> AlarmStatus {
        AlarmStatus::from_flags(self.cleared, self.acknowledged)
    }

    /// Value of an alarm field as seen by key filters.
    pub fn field(&self, name: &str) -> Option<KvValue> {
        let value = match name {
            "id" => KvValue::from(self.id.to_string()),
            "createdTime" => KvValue::from(self.created_time),
            "type" => KvValue::from(self.alarm_type.as_str()),
            "severity" => KvValue::from(self.severity.as_str()),
            "status" => KvValue::from(self.status().as_str()),
            "originator" | "originatorId" => KvValue::from(self.originator.id.to_string()),
            "originatorType" => KvValue::from(self.originator.entity_type.as_str()),
            "startTs" | "startTime" => KvValue::from(self.start_ts),
            "endTs" | "endTime" => KvValue::from(self.end_ts),
            "ackTs" | "ackTime" => KvValue::from(self.ack_ts),
            "clearTs" | "clearTime" => KvValue::from(self.clear_ts),
            "assignTs" | "assignTime" => KvValue::from(self.assign_ts),
            "assignee" | "assigneeId" => KvValue::from(self.assignee_id?.to_string()),
            "acknowledged" => KvValue::from(self.acknowledged),
            "cleared" => KvValue::from(self.cleared),
            "propagate" => KvValue::from(self.propagation.propagate),
            _ => return None,
        };
        Some(value)
    }
}

/// Input of `create_or_update_active_alarm`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmCreateOrUpdateActiveRequest {
    pub tenant_id: Uuid,
    /// Resolved from the entity directory when absent.
    #[serde(default)]
    pub customer_id: Option<Uuid>,
    pub originator: EntityRef,
    #[serde(rename = "type")]
    pub alarm_type: String,
    pub severity: AlarmSeverity,
    /// `0` means now.
    #[serde(default)]
    pub start_ts: i64,
    #[serde(default)]
    pub end_ts: Option<i64>,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
    #[serde(default, flatten)]
    pub propagation: AlarmPropagation,
}

impl AlarmCreateOrUpdateActiveRequest {
    pub fn new(tenant_id: Uuid, originator: EntityRef, alarm_type: impl Into<String>, severity: AlarmSeverity) -> Self {
        Self {
            tenant_id,
            customer_id: None,
            originator,
            alarm_type: alarm_type.into(),
            severity,
            start_ts: 0,
            end_ts: None,
            details: None,
            propagation: AlarmPropagation::default(),
        }
    }

    pub fn at(mut self, start_ts: i64) -> Self {
        self.start_ts = start_ts;
        self
    }

    pub fn ending_at(mut self, end_ts: i64) -> Self {
        self.end_ts = Some(end_ts);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_propagation(mut self, propagation: AlarmPropagation) -> Self {
        self.propagation = propagation;
        self
    }
}

/// Partial update of an existing alarm; `None` fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmUpdateRequest {
    #[serde(default)]
    pub severity: Option<AlarmSeverity>,
    #[serde(default)]
    pub start_ts: Option<i64>,
    #[serde(default)]
    pub end_ts: Option<i64>,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
    #[serde(default)]
    pub propagation: Option<AlarmPropagation>,
    /// `Some(None)` unassigns.
    #[serde(default)]
    pub assignee_id: Option<Option<Uuid>>,
}

/// Outcome of an alarm write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmApiCallResult {
    pub successful: bool,
    pub created: bool,
    pub modified: bool,
    pub severity_changed: bool,
    pub old: Option<Alarm>,
    pub alarm: Option<Alarm>,
    /// Entities the alarm is visible on after the write.
    pub propagated_entities: Vec<EntityRef>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlarmSortProperty {
    #[default]
    CreatedTime,
    StartTs,
    EndTs,
    Severity,
    Type,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortOrder {
    pub property: AlarmSortProperty,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageLink {
    pub page_size: usize,
    pub page: usize,
    /// Case-insensitive substring of the alarm type.
    #[serde(default)]
    pub text_search: Option<String>,
    #[serde(default)]
    pub sort: SortOrder,
}

impl PageLink {
    pub fn new(page_size: usize, page: usize) -> Self {
        Self {
            page_size,
            page,
            text_search: None,
            sort: SortOrder::default(),
        }
    }
}

impl Default for PageLink {
    fn default() -> Self {
        Self::new(100, 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageData<T> {
    pub data: Vec<T>,
    pub total_pages: usize,
    pub total_elements: usize,
    pub has_next: bool,
}

impl<T> PageData<T> {
    /// Cut `page` out of the full, already ordered result.
    pub fn paginate(all: Vec<T>, link: &PageLink) -> Self {
        let total_elements = all.len();
        if link.page_size == 0 {
            return Self {
                data: Vec::new(),
                total_pages: 0,
                total_elements,
                has_next: false,
            };
        }
        let total_pages = (total_elements + link.page_size - 1) / link.page_size;
        let data: Vec<T> = all
            .into_iter()
            .skip(link.page.saturating_mul(link.page_size))
            .take(link.page_size)
            .collect();
        Self {
            data,
            total_pages,
            total_elements,
            has_next: link.page + 1 < total_pages,
        }
    }
}

/// Alarm search scoped to an affected entity and/or an assignee.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmQuery {
    #[serde(default)]
    pub affected_entity: Option<EntityRef>,
    #[serde(default)]
    pub assignee_id: Option<Uuid>,
    #[serde(default)]
    pub search_status: Option<AlarmSearchStatus>,
    #[serde(default)]
    pub status_list: Vec<AlarmStatus>,
    #[serde(default)]
    pub severity_list: Vec<AlarmSeverity>,
    #[serde(default)]
    pub type_list: Vec<String>,
    /// Inclusive lower bound on `createdTime`.
    #[serde(default)]
    pub start_time: Option<i64>,
    /// Inclusive upper bound on `createdTime`.
    #[serde(default)]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub key_filters: Vec<KeyFilter>,
    #[serde(default)]
    pub page_link: PageLink,
}

impl AlarmQuery {
    pub fn affecting(entity: EntityRef) -> Self {
        Self {
            affected_entity: Some(entity),
            ..Self::default()
        }
    }

    pub fn assigned_to(assignee_id: Uuid) -> Self {
        Self {
            assignee_id: Some(assignee_id),
            ..Self::default()
        }
    }
}

/// Alarm count filters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmCountQuery {
    #[serde(default)]
    pub search_status: Option<AlarmSearchStatus>,
    #[serde(default)]
    pub status_list: Vec<AlarmStatus>,
    #[serde(default)]
    pub severity_list: Vec<AlarmSeverity>,
    #[serde(default)]
    pub type_list: Vec<String>,
    #[serde(default)]
    pub start_time: Option<i64>,
    #[serde(default)]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub assignee_id: Option<Uuid>,
    #[serde(default)]
    pub key_filters: Vec<KeyFilter>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityType;

    #[test]
    fn test_severity_ordering() {
        let mut all = vec![
            AlarmSeverity::Minor,
            AlarmSeverity::Critical,
            AlarmSeverity::Indeterminate,
            AlarmSeverity::Major,
            AlarmSeverity::Warning,
        ];
        all.sort();
        assert_eq!(
            all,
            vec![
                AlarmSeverity::Indeterminate,
                AlarmSeverity::Warning,
                AlarmSeverity::Minor,
                AlarmSeverity::Major,
                AlarmSeverity::Critical,
            ]
        );
        assert_eq!("major".parse::<AlarmSeverity>().unwrap(), AlarmSeverity::Major);
    }

    #[test]
    fn test_status_flags_and_search_status() {
        let status = AlarmStatus::from_flags(true, false);
        assert_eq!(status, AlarmStatus::ClearedUnack);
        assert!(AlarmSearchStatus::Cleared.matches(status));
        assert!(AlarmSearchStatus::Unack.matches(status));
        assert!(!AlarmSearchStatus::Active.matches(status));
        assert!(!AlarmSearchStatus::Ack.matches(status));
        assert!(AlarmSearchStatus::Any.matches(status));
        assert_eq!(serde_json::to_value(AlarmStatus::ActiveAck).unwrap(), "ACTIVE_ACK");
    }

    #[test]
    fn test_paginate() {
        let page = PageData::paginate((0..7).collect(), &PageLink::new(3, 1));
        assert_eq!(page.data, vec![3, 4, 5]);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.total_elements, 7);
        assert!(page.has_next);

        let last = PageData::paginate((0..7).collect(), &PageLink::new(3, 2));
        assert_eq!(last.data, vec![6]);
        assert!(!last.has_next);

        let past_end = PageData::paginate((0..7).collect::<Vec<i32>>(), &PageLink::new(3, 9));
        assert!(past_end.data.is_empty());
    }

    #[test]
    fn test_alarm_json_flattens_propagation() {
        let alarm = Alarm {
            id: Uuid::new_v4(),
            created_time: 1,
            tenant_id: Uuid::new_v4(),
            customer_id: None,
            originator: EntityRef::random(EntityType::Device),
            alarm_type: "High Temperature".to_string(),
            severity: AlarmSeverity::Major,
            acknowledged: false,
            cleared: false,
            assignee_id: None,
            start_ts: 1,
            end_ts: 1,
            ack_ts: 0,
            clear_ts: 0,
            assign_ts: 0,
            details: None,
            propagation: AlarmPropagation::to_ancestors(),
        };
        let json = serde_json::to_value(&alarm).unwrap();
        assert_eq!(json["type"], "High Temperature");
        assert_eq!(json["propagate"], true);
        assert_eq!(json["propagateRelationTypes"], serde_json::json!([]));
        assert_eq!(alarm.field("severity"), Some(KvValue::from("MAJOR")));
        assert_eq!(alarm.field("assignee"), None);
    }
}
