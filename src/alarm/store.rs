//! SQL over the `alarms` and `alarm_entities` tables.
//!
//! Everything here runs on a caller-supplied connection so the service can
//! group alarm and propagation writes into one transaction.

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use uuid::Uuid;

use crate::alarm::{Alarm, AlarmPropagation, AlarmSearchStatus, AlarmSeverity, AlarmStatus};
use crate::entity::{column_entity, column_opt_uuid, column_uuid, EntityRef};
use crate::error::Result;

const ALARM_COLUMNS: &str = "a.id, a.created_time, a.tenant_id, a.customer_id, a.originator_id, \
    a.originator_type, a.type, a.severity, a.acknowledged, a.cleared, a.assignee_id, a.start_ts, \
    a.end_ts, a.ack_ts, a.clear_ts, a.assign_ts, a.details, a.propagate, a.propagate_to_owner, \
    a.propagate_to_tenant, a.propagate_relation_types";

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn alarm_from_row(row: &Row<'_>) -> rusqlite::Result<Alarm> {
    let severity: String = row.get(7)?;
    let details: Option<String> = row.get(16)?;
    let relation_types: String = row.get(20)?;

    Ok(Alarm {
        id: column_uuid(row, 0)?,
        created_time: row.get(1)?,
        tenant_id: column_uuid(row, 2)?,
        customer_id: column_opt_uuid(row, 3)?,
        originator: column_entity(row, 4, 5)?,
        alarm_type: row.get(6)?,
        severity: severity.parse::<AlarmSeverity>().map_err(|e| conversion_error(7, e))?,
        acknowledged: row.get(8)?,
        cleared: row.get(9)?,
        assignee_id: column_opt_uuid(row, 10)?,
        start_ts: row.get(11)?,
        end_ts: row.get(12)?,
        ack_ts: row.get(13)?,
        clear_ts: row.get(14)?,
        assign_ts: row.get(15)?,
        details: details
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| conversion_error(16, e))?,
        propagation: AlarmPropagation {
            propagate: row.get(17)?,
            propagate_to_owner: row.get(18)?,
            propagate_to_tenant: row.get(19)?,
            propagate_relation_types: serde_json::from_str(&relation_types)
                .map_err(|e| conversion_error(20, e))?,
        },
    })
}

pub(crate) fn find_by_id(conn: &Connection, tenant_id: Uuid, alarm_id: Uuid) -> Result<Option<Alarm>> {
    let sql = format!("SELECT {} FROM alarms a WHERE a.id = ?1 AND a.tenant_id = ?2", ALARM_COLUMNS);
    let mut stmt = conn.prepare_cached(&sql)?;
    let alarm = stmt
        .query_row(params![alarm_id.to_string(), tenant_id.to_string()], alarm_from_row)
        .optional()?;
    Ok(alarm)
}

/// The single uncleared alarm for `(tenant, originator, type)`, if any.
pub(crate) fn find_active(
    conn: &Connection,
    tenant_id: Uuid,
    originator: &EntityRef,
    alarm_type: &str,
) -> Result<Option<Alarm>> {
    let sql = format!(
        "SELECT {} FROM alarms a \
         WHERE a.tenant_id = ?1 AND a.originator_id = ?2 AND a.originator_type = ?3 \
         AND a.type = ?4 AND a.cleared = 0",
        ALARM_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let alarm = stmt
        .query_row(
            params![
                tenant_id.to_string(),
                originator.id.to_string(),
                originator.entity_type.as_str(),
                alarm_type
            ],
            alarm_from_row,
        )
        .optional()?;
    Ok(alarm)
}

/// Insert the alarm or overwrite the row with the same id.
pub(crate) fn save(conn: &Connection, alarm: &Alarm) -> Result<()> {
    let details = alarm.details.as_ref().map(serde_json::to_string).transpose()?;
    let relation_types = serde_json::to_string(&alarm.propagation.propagate_relation_types)?;
    conn.execute(
        "INSERT INTO alarms (id, created_time, tenant_id, customer_id, originator_id, originator_type, \
             type, severity, acknowledged, cleared, assignee_id, start_ts, end_ts, ack_ts, clear_ts, \
             assign_ts, details, propagate, propagate_to_owner, propagate_to_tenant, propagate_relation_types) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21) \
         ON CONFLICT (id) DO UPDATE SET \
             customer_id = excluded.customer_id, severity = excluded.severity, \
             acknowledged = excluded.acknowledged, cleared = excluded.cleared, \
             assignee_id = excluded.assignee_id, start_ts = excluded.start_ts, end_ts = excluded.end_ts, \
             ack_ts = excluded.ack_ts, clear_ts = excluded.clear_ts, assign_ts = excluded.assign_ts, \
             details = excluded.details, propagate = excluded.propagate, \
             propagate_to_owner = excluded.propagate_to_owner, \
             propagate_to_tenant = excluded.propagate_to_tenant, \
             propagate_relation_types = excluded.propagate_relation_types",
        params![
            alarm.id.to_string(),
            alarm.created_time,
            alarm.tenant_id.to_string(),
            alarm.customer_id.map(|id| id.to_string()),
            alarm.originator.id.to_string(),
            alarm.originator.entity_type.as_str(),
            alarm.alarm_type,
            alarm.severity.as_str(),
            alarm.acknowledged,
            alarm.cleared,
            alarm.assignee_id.map(|id| id.to_string()),
            alarm.start_ts,
            alarm.end_ts,
            alarm.ack_ts,
            alarm.clear_ts,
            alarm.assign_ts,
            details,
            alarm.propagation.propagate,
            alarm.propagation.propagate_to_owner,
            alarm.propagation.propagate_to_tenant,
            relation_types,
        ],
    )?;
    Ok(())
}

/// Swap the alarm's propagation rows for `entities`.
pub(crate) fn replace_propagation(conn: &Connection, alarm_id: Uuid, entities: &[EntityRef]) -> Result<()> {
    conn.execute(
        "DELETE FROM alarm_entities WHERE alarm_id = ?1",
        params![alarm_id.to_string()],
    )?;
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO alarm_entities (alarm_id, entity_id, entity_type) VALUES (?1, ?2, ?3)",
    )?;
    for entity in entities {
        stmt.execute(params![
            alarm_id.to_string(),
            entity.id.to_string(),
            entity.entity_type.as_str()
        ])?;
    }
    Ok(())
}

pub(crate) fn propagated_entities(conn: &Connection, alarm_id: Uuid) -> Result<Vec<EntityRef>> {
    let mut stmt = conn.prepare_cached(
        "SELECT entity_id, entity_type FROM alarm_entities WHERE alarm_id = ?1 \
         ORDER BY entity_type, entity_id",
    )?;
    let rows = stmt.query_map(params![alarm_id.to_string()], |row| column_entity(row, 0, 1))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Remove the alarm and its propagation rows. Returns whether it existed.
pub(crate) fn delete(conn: &Connection, tenant_id: Uuid, alarm_id: Uuid) -> Result<bool> {
    conn.execute(
        "DELETE FROM alarm_entities WHERE alarm_id = ?1",
        params![alarm_id.to_string()],
    )?;
    let removed = conn.execute(
        "DELETE FROM alarms WHERE id = ?1 AND tenant_id = ?2",
        params![alarm_id.to_string(), tenant_id.to_string()],
    )?;
    Ok(removed > 0)
}

/// Storage-level alarm filter. Key filters are applied by the caller.
#[derive(Debug, Default)]
pub(crate) struct AlarmFilter<'a> {
    /// Alarms visible on any of these entities. `Some(&[])` matches nothing.
    pub affected: Option<&'a [EntityRef]>,
    pub customer_id: Option<Uuid>,
    pub assignee_id: Option<Uuid>,
    pub search_status: Option<AlarmSearchStatus>,
    pub status_list: &'a [AlarmStatus],
    pub severity_list: &'a [AlarmSeverity],
    pub type_list: &'a [String],
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

fn search_status_clause(status: AlarmSearchStatus) -> Option<&'static str> {
    match status {
        AlarmSearchStatus::Any => None,
        AlarmSearchStatus::Active => Some("a.cleared = 0"),
        AlarmSearchStatus::Cleared => Some("a.cleared = 1"),
        AlarmSearchStatus::Ack => Some("a.acknowledged = 1"),
        AlarmSearchStatus::Unack => Some("a.acknowledged = 0"),
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

/// Alarms of the tenant matching `filter`, newest first.
pub(crate) fn select(conn: &Connection, tenant_id: Uuid, filter: &AlarmFilter<'_>) -> Result<Vec<Alarm>> {
    let mut clauses: Vec<String> = vec!["a.tenant_id = ?".to_string()];
    let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(tenant_id.to_string())];

    if let Some(affected) = filter.affected {
        if affected.is_empty() {
            return Ok(Vec::new());
        }
        let pairs = vec!["(e.entity_id = ? AND e.entity_type = ?)"; affected.len()].join(" OR ");
        clauses.push(format!(
            "EXISTS (SELECT 1 FROM alarm_entities e WHERE e.alarm_id = a.id AND ({}))",
            pairs
        ));
        for entity in affected {
            params.push(Box::new(entity.id.to_string()));
            params.push(Box::new(entity.entity_type.as_str()));
        }
    }
    if let Some(customer_id) = filter.customer_id {
        clauses.push("a.customer_id = ?".to_string());
        params.push(Box::new(customer_id.to_string()));
    }
    if let Some(assignee_id) = filter.assignee_id {
        clauses.push("a.assignee_id = ?".to_string());
        params.push(Box::new(assignee_id.to_string()));
    }
    if let Some(clause) = filter.search_status.and_then(search_status_clause) {
        clauses.push(clause.to_string());
    }
    if !filter.status_list.is_empty() {
        let pairs = vec!["(a.cleared = ? AND a.acknowledged = ?)"; filter.status_list.len()].join(" OR ");
        clauses.push(format!("({})", pairs));
        for status in filter.status_list {
            params.push(Box::new(status.is_cleared()));
            params.push(Box::new(status.is_acknowledged()));
        }
    }
    if !filter.severity_list.is_empty() {
        clauses.push(format!("a.severity IN ({})", placeholders(filter.severity_list.len())));
        for severity in filter.severity_list {
            params.push(Box::new(severity.as_str()));
        }
    }
    if !filter.type_list.is_empty() {
        clauses.push(format!("a.type IN ({})", placeholders(filter.type_list.len())));
        for t in filter.type_list {
            params.push(Box::new(t.clone()));
        }
    }
    if let Some(start) = filter.start_time {
        clauses.push("a.created_time >= ?".to_string());
        params.push(Box::new(start));
    }
    if let Some(end) = filter.end_time {
        clauses.push("a.created_time <= ?".to_string());
        params.push(Box::new(end));
    }

    let sql = format!(
        "SELECT {} FROM alarms a WHERE {} ORDER BY a.created_time DESC, a.id",
        ALARM_COLUMNS,
        clauses.join(" AND ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(params), alarm_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
