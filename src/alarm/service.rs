//! Alarm lifecycle and search.

use rusqlite::{Transaction, TransactionBehavior};
use std::cmp::Ordering;
use std::sync::Arc;
use uuid::Uuid;

use crate::alarm::locks::{AlarmKey, KeyedLocks};
use crate::alarm::store::{self, AlarmFilter};
use crate::alarm::{
    Alarm, AlarmApiCallResult, AlarmCountQuery, AlarmCreateOrUpdateActiveRequest, AlarmPropagationResolver,
    AlarmQuery, AlarmSearchStatus, AlarmSeverity, AlarmSortProperty, AlarmStatus, AlarmUpdateRequest, PageData,
    SortDirection, SortOrder,
};
use crate::db::Db;
use crate::directory::{EntityDirectory, KeyValueSource};
use crate::entity::{EntityRef, EntityType};
use crate::error::{RelgraphError, Result};
use crate::query::{matches_all, EntityKey, EntityKeyType, KeyFilter, KvValue};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn ts_or_now(ts: i64) -> i64 {
    if ts > 0 {
        ts
    } else {
        now_ms()
    }
}

fn validate_request(request: &AlarmCreateOrUpdateActiveRequest) -> Result<()> {
    if request.tenant_id.is_nil() {
        return Err(RelgraphError::validation("alarm tenant id must be specified"));
    }
    if request.originator.is_nil() {
        return Err(RelgraphError::validation("alarm originator must be specified"));
    }
    if request.alarm_type.trim().is_empty() {
        return Err(RelgraphError::validation("alarm type must be specified"));
    }
    Ok(())
}

fn resolve_key(values: &dyn KeyValueSource, alarm: &Alarm, key: &EntityKey) -> Option<KvValue> {
    match key.key_type {
        EntityKeyType::AlarmField => alarm.field(&key.key),
        _ => values.latest(alarm.tenant_id, &alarm.originator, key),
    }
}

fn compare(a: &Alarm, b: &Alarm, sort: SortOrder) -> Ordering {
    let ord = match sort.property {
        AlarmSortProperty::CreatedTime => a.created_time.cmp(&b.created_time),
        AlarmSortProperty::StartTs => a.start_ts.cmp(&b.start_ts),
        AlarmSortProperty::EndTs => a.end_ts.cmp(&b.end_ts),
        AlarmSortProperty::Severity => a.severity.cmp(&b.severity),
        AlarmSortProperty::Type => a.alarm_type.cmp(&b.alarm_type),
    };
    match sort.direction {
        SortDirection::Asc => ord,
        SortDirection::Desc => ord.reverse(),
    }
}

/// Alarm operations. Every mutation of an alarm holds the lock of its
/// `(tenant, originator, type)` key and commits the alarm row together
/// with its propagation rows.
#[derive(Clone)]
pub struct AlarmService {
    db: Db,
    resolver: AlarmPropagationResolver,
    directory: Arc<dyn EntityDirectory>,
    values: Arc<dyn KeyValueSource>,
    locks: Arc<KeyedLocks>,
}

impl AlarmService {
    pub fn new(db: Db, directory: Arc<dyn EntityDirectory>, values: Arc<dyn KeyValueSource>) -> Self {
        Self {
            db,
            resolver: AlarmPropagationResolver::new(directory.clone()),
            directory,
            values,
            locks: Arc::new(KeyedLocks::new()),
        }
    }

    /// Customer owning `entity`, if the directory knows one.
    fn customer_of(&self, tenant_id: Uuid, entity: &EntityRef) -> Option<Uuid> {
        self.directory
            .owner_of(tenant_id, entity)
            .filter(|owner| owner.entity_type == EntityType::Customer)
            .map(|owner| owner.id)
    }

    /// Update the active alarm for the request's key, or raise a new one.
    pub async fn create_or_update_active_alarm(
        &self,
        request: AlarmCreateOrUpdateActiveRequest,
    ) -> Result<AlarmApiCallResult> {
        validate_request(&request)?;

        let key = AlarmKey::new(request.tenant_id, request.originator, request.alarm_type.as_str());
        let _guard = self.locks.lock(key).await;

        let customer_id = request
            .customer_id
            .or_else(|| self.customer_of(request.tenant_id, &request.originator));
        let resolver = self.resolver.clone();

        let result = self
            .db
            .with_connection(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let ts = ts_or_now(request.start_ts);
                let end_ts = request.end_ts.filter(|end| *end > 0).unwrap_or(ts);

                let existing =
                    store::find_active(&tx, request.tenant_id, &request.originator, &request.alarm_type)?;
                let (alarm, old) = match existing {
                    Some(old) => {
                        let mut alarm = old.clone();
                        alarm.end_ts = alarm.end_ts.max(end_ts);
                        alarm.severity = request.severity;
                        if request.details.is_some() {
                            alarm.details = request.details;
                        }
                        alarm.propagation = request.propagation;
                        if alarm.customer_id.is_none() {
                            alarm.customer_id = customer_id;
                        }
                        (alarm, Some(old))
                    }
                    None => {
                        let alarm = Alarm {
                            id: Uuid::new_v4(),
                            created_time: now_ms(),
                            tenant_id: request.tenant_id,
                            customer_id,
                            originator: request.originator,
                            alarm_type: request.alarm_type,
                            severity: request.severity,
                            acknowledged: false,
                            cleared: false,
                            assignee_id: None,
                            start_ts: ts,
                            end_ts: end_ts.max(ts),
                            ack_ts: 0,
                            clear_ts: 0,
                            assign_ts: 0,
                            details: request.details,
                            propagation: request.propagation,
                        };
                        (alarm, None)
                    }
                };

                let entities = resolver.resolve(&tx, &alarm)?;
                store::save(&tx, &alarm)?;
                store::replace_propagation(&tx, alarm.id, &entities)?;
                tx.commit()?;

                Ok(AlarmApiCallResult {
                    successful: true,
                    created: old.is_none(),
                    modified: old.as_ref() != Some(&alarm),
                    severity_changed: old.as_ref().is_some_and(|o| o.severity != alarm.severity),
                    old,
                    alarm: Some(alarm),
                    propagated_entities: entities,
                })
            })
            .await?;

        if let Some(alarm) = &result.alarm {
            if result.created {
                log::info!(
                    "Created alarm {} ({}, {}) on {}",
                    alarm.id,
                    alarm.alarm_type,
                    alarm.severity,
                    alarm.originator
                );
            } else {
                log::debug!("Updated active alarm {} on {}", alarm.id, alarm.originator);
            }
        }
        Ok(result)
    }

    /// Run `f` on the current row of the alarm inside an IMMEDIATE
    /// transaction while holding the alarm's key lock.
    async fn with_locked_alarm<F, T>(&self, tenant_id: Uuid, alarm_id: Uuid, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>, Alarm) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let current = self
            .find_alarm_by_id(tenant_id, alarm_id)
            .await?
            .ok_or(RelgraphError::AlarmNotFound(alarm_id))?;
        let _guard = self
            .locks
            .lock(AlarmKey::new(tenant_id, current.originator, current.alarm_type))
            .await;

        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let alarm = store::find_by_id(&tx, tenant_id, alarm_id)?
                    .ok_or(RelgraphError::AlarmNotFound(alarm_id))?;
                let out = f(&tx, alarm)?;
                tx.commit()?;
                Ok(out)
            })
            .await
    }

    /// Apply a partial update. Propagation is re-resolved only when the
    /// propagation settings change.
    pub async fn update_alarm(
        &self,
        tenant_id: Uuid,
        alarm_id: Uuid,
        request: AlarmUpdateRequest,
    ) -> Result<AlarmApiCallResult> {
        let resolver = self.resolver.clone();
        let result = self
            .with_locked_alarm(tenant_id, alarm_id, move |tx, old| {
                let mut alarm = old.clone();
                if let Some(severity) = request.severity {
                    alarm.severity = severity;
                }
                if let Some(start_ts) = request.start_ts {
                    alarm.start_ts = start_ts;
                }
                if let Some(end_ts) = request.end_ts {
                    alarm.end_ts = end_ts;
                }
                if request.details.is_some() {
                    alarm.details = request.details;
                }
                if let Some(propagation) = request.propagation {
                    alarm.propagation = propagation;
                }
                if let Some(assignee_id) = request.assignee_id {
                    if alarm.assignee_id != assignee_id {
                        alarm.assignee_id = assignee_id;
                        alarm.assign_ts = now_ms();
                    }
                }
                if alarm.start_ts > alarm.end_ts {
                    return Err(RelgraphError::validation(format!(
                        "alarm start ts {} is after end ts {}",
                        alarm.start_ts, alarm.end_ts
                    )));
                }

                store::save(tx, &alarm)?;
                let entities = if alarm.propagation != old.propagation {
                    let entities = resolver.resolve(tx, &alarm)?;
                    store::replace_propagation(tx, alarm.id, &entities)?;
                    entities
                } else {
                    store::propagated_entities(tx, alarm.id)?
                };

                Ok(AlarmApiCallResult {
                    successful: true,
                    created: false,
                    modified: alarm != old,
                    severity_changed: alarm.severity != old.severity,
                    old: Some(old),
                    alarm: Some(alarm),
                    propagated_entities: entities,
                })
            })
            .await?;
        log::debug!("Updated alarm {}", alarm_id);
        Ok(result)
    }

    /// `ACTIVE_UNACK -> ACTIVE_ACK` or `CLEARED_UNACK -> CLEARED_ACK`.
    pub async fn acknowledge_alarm(&self, tenant_id: Uuid, alarm_id: Uuid, ack_ts: i64) -> Result<Alarm> {
        self.with_locked_alarm(tenant_id, alarm_id, move |tx, mut alarm| {
            if alarm.acknowledged {
                return Err(RelgraphError::InvalidAlarmState {
                    alarm_id,
                    status: alarm.status(),
                    action: "acknowledge",
                });
            }
            alarm.acknowledged = true;
            alarm.ack_ts = ts_or_now(ack_ts);
            store::save(tx, &alarm)?;
            Ok(alarm)
        })
        .await
    }

    /// `ACTIVE_UNACK -> CLEARED_UNACK` or `ACTIVE_ACK -> CLEARED_ACK`.
    pub async fn clear_alarm(
        &self,
        tenant_id: Uuid,
        alarm_id: Uuid,
        clear_ts: i64,
        details: Option<serde_json::Value>,
    ) -> Result<Alarm> {
        self.with_locked_alarm(tenant_id, alarm_id, move |tx, mut alarm| {
            if alarm.cleared {
                return Err(RelgraphError::InvalidAlarmState {
                    alarm_id,
                    status: alarm.status(),
                    action: "clear",
                });
            }
            alarm.cleared = true;
            alarm.clear_ts = ts_or_now(clear_ts);
            if details.is_some() {
                alarm.details = details;
            }
            store::save(tx, &alarm)?;
            Ok(alarm)
        })
        .await
    }

    pub async fn assign_alarm(
        &self,
        tenant_id: Uuid,
        alarm_id: Uuid,
        assignee_id: Uuid,
        assign_ts: i64,
    ) -> Result<Alarm> {
        if assignee_id.is_nil() {
            return Err(RelgraphError::validation("assignee id must be specified"));
        }
        self.with_locked_alarm(tenant_id, alarm_id, move |tx, mut alarm| {
            if alarm.assignee_id == Some(assignee_id) {
                return Ok(alarm);
            }
            alarm.assignee_id = Some(assignee_id);
            alarm.assign_ts = ts_or_now(assign_ts);
            store::save(tx, &alarm)?;
            Ok(alarm)
        })
        .await
    }

    pub async fn unassign_alarm(&self, tenant_id: Uuid, alarm_id: Uuid, unassign_ts: i64) -> Result<Alarm> {
        self.with_locked_alarm(tenant_id, alarm_id, move |tx, mut alarm| {
            if alarm.assignee_id.is_none() {
                return Ok(alarm);
            }
            alarm.assignee_id = None;
            alarm.assign_ts = ts_or_now(unassign_ts);
            store::save(tx, &alarm)?;
            Ok(alarm)
        })
        .await
    }

    /// Remove the alarm and everything it propagated to.
    pub async fn delete_alarm(&self, tenant_id: Uuid, alarm_id: Uuid) -> Result<bool> {
        let deleted = match self
            .with_locked_alarm(tenant_id, alarm_id, move |tx, _| store::delete(tx, tenant_id, alarm_id))
            .await
        {
            Err(RelgraphError::AlarmNotFound(_)) => false,
            other => other?,
        };
        if deleted {
            log::info!("Deleted alarm {}", alarm_id);
        }
        Ok(deleted)
    }

    pub async fn find_alarm_by_id(&self, tenant_id: Uuid, alarm_id: Uuid) -> Result<Option<Alarm>> {
        self.db
            .with_connection(move |conn| store::find_by_id(conn, tenant_id, alarm_id))
            .await
    }

    pub async fn find_latest_active_by_originator_and_type(
        &self,
        tenant_id: Uuid,
        originator: EntityRef,
        alarm_type: &str,
    ) -> Result<Option<Alarm>> {
        let alarm_type = alarm_type.to_string();
        self.db
            .with_connection(move |conn| store::find_active(conn, tenant_id, &originator, &alarm_type))
            .await
    }

    /// Entities the alarm is currently visible on.
    pub async fn find_propagated_entities(&self, alarm_id: Uuid) -> Result<Vec<EntityRef>> {
        self.db
            .with_connection(move |conn| store::propagated_entities(conn, alarm_id))
            .await
    }

    fn passes_key_filters(&self, alarm: &Alarm, filters: &[KeyFilter]) -> bool {
        matches_all(filters, |key| resolve_key(self.values.as_ref(), alarm, key))
    }

    /// One page of alarms visible on `affected_entity` and/or assigned to
    /// `assignee_id`, after key filters and text search.
    pub async fn find_alarms(&self, tenant_id: Uuid, query: AlarmQuery) -> Result<PageData<Alarm>> {
        let AlarmQuery {
            affected_entity,
            assignee_id,
            search_status,
            status_list,
            severity_list,
            type_list,
            start_time,
            end_time,
            key_filters,
            page_link,
        } = query;

        let mut alarms = self
            .db
            .with_connection(move |conn| {
                let affected: Vec<EntityRef> = affected_entity.into_iter().collect();
                let filter = AlarmFilter {
                    affected: affected_entity.map(|_| affected.as_slice()),
                    assignee_id,
                    search_status,
                    status_list: &status_list,
                    severity_list: &severity_list,
                    type_list: &type_list,
                    start_time,
                    end_time,
                    ..AlarmFilter::default()
                };
                store::select(conn, tenant_id, &filter)
            })
            .await?;

        let text = page_link.text_search.as_deref().map(str::to_lowercase);
        alarms.retain(|alarm| {
            text.as_deref()
                .map_or(true, |t| alarm.alarm_type.to_lowercase().contains(t))
                && self.passes_key_filters(alarm, &key_filters)
        });
        alarms.sort_by(|a, b| compare(a, b, page_link.sort));

        Ok(PageData::paginate(alarms, &page_link))
    }

    /// Highest severity among alarms visible on `entity` that match the
    /// given status and assignee filters.
    pub async fn find_highest_alarm_severity(
        &self,
        tenant_id: Uuid,
        entity: EntityRef,
        search_status: Option<AlarmSearchStatus>,
        status: Option<AlarmStatus>,
        assignee_id: Option<Uuid>,
    ) -> Result<Option<AlarmSeverity>> {
        let alarms = self
            .db
            .with_connection(move |conn| {
                let affected = [entity];
                let statuses: Vec<AlarmStatus> = status.into_iter().collect();
                let filter = AlarmFilter {
                    affected: Some(&affected),
                    assignee_id,
                    search_status,
                    status_list: &statuses,
                    ..AlarmFilter::default()
                };
                store::select(conn, tenant_id, &filter)
            })
            .await?;
        Ok(alarms.into_iter().map(|a| a.severity).max())
    }

    /// Count alarms of a tenant, optionally of one customer and visible
    /// on at least one entity of `entity_scope`.
    pub async fn count_alarms_by_query(
        &self,
        tenant_id: Uuid,
        customer_id: Option<Uuid>,
        query: &AlarmCountQuery,
        entity_scope: Option<Vec<EntityRef>>,
    ) -> Result<u64> {
        let owned = query.clone();
        let alarms = self
            .db
            .with_connection(move |conn| {
                let filter = AlarmFilter {
                    affected: entity_scope.as_deref(),
                    customer_id,
                    assignee_id: owned.assignee_id,
                    search_status: owned.search_status,
                    status_list: &owned.status_list,
                    severity_list: &owned.severity_list,
                    type_list: &owned.type_list,
                    start_time: owned.start_time,
                    end_time: owned.end_time,
                };
                store::select(conn, tenant_id, &filter)
            })
            .await?;

        let count = alarms
            .iter()
            .filter(|alarm| self.passes_key_filters(alarm, &query.key_filters))
            .count();
        Ok(count as u64)
    }
}
