//! Write path: validation and per-backend fan-out for creating, replacing,
//! patching and deleting data points.
//!
//! Every batch is validated completely before the first row is written, and
//! validation collects all offending fields instead of stopping at the first.
//! Writes are idempotent under retries and converge under out-of-order
//! delivery: history appends are keyed by version, and current-state tables
//! only accept a row whose version stamp is newer than what they hold.

use crate::{
    accessor::DataPointAccessor,
    error::{ServiceError, ValidationError},
    events::{ChangeEvent, ChangeEventType, EventSink},
    ident::quote_qualified,
    physical::{self, HistRelation},
    query_info::{DataSeriesQueryInfo, FieldTarget, SerializationKey},
    repository::{data_points, file_lookups, staged_batches},
    settings::EngineSettings,
    types::{data_point_id, FactValue, NewDataPoint, VersionStamp},
};
use dataseries_entity::{data_series, file_lookups as file_lookups_entity};
use itertools::Itertools;
use sea_orm::{ActiveValue::Set, ConnectionTrait, Statement};
use serde_json::{json, Map, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use uuid::Uuid;

/// PUT replaces the whole payload: known fields absent from the request are
/// written as explicit nulls. PATCH touches only the fields provided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    Put,
    Patch,
}

pub struct ModificationContext<'a> {
    pub series: &'a data_series::Model,
    pub info: &'a DataSeriesQueryInfo,
    pub settings: &'a EngineSettings,
    pub accessor: &'a dyn DataPointAccessor,
    pub events: &'a dyn EventSink,
    pub stamp: VersionStamp,
}

#[derive(Clone, Debug)]
enum WriteValue {
    Fact(FactValue),
    Dimension(Uuid),
}

#[derive(Clone, Debug)]
struct FieldWrite {
    key: SerializationKey,
    /// `None` is an explicit null write.
    value: Option<WriteValue>,
}

impl FieldWrite {
    fn to_sea_value(&self) -> sea_orm::Value {
        match &self.value {
            Some(WriteValue::Fact(v)) => v.to_sea_value(),
            Some(WriteValue::Dimension(id)) => (*id).into(),
            None => match self.key.target {
                FieldTarget::Fact(kind) => kind.null_value(),
                FieldTarget::Dimension => sea_orm::Value::Uuid(None),
            },
        }
    }
}

#[derive(Clone, Debug)]
struct ValidatedPoint {
    id: Uuid,
    external_id: String,
    writes: Vec<FieldWrite>,
    extra: Option<JsonValue>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BulkOutcome {
    Written { ids: Vec<Uuid> },
    Staged { staged_batch_id: Uuid },
}

fn ensure_unlocked(ctx: &ModificationContext<'_>) -> Result<(), ServiceError> {
    if ctx.series.locked {
        return Err(ServiceError::Locked);
    }
    Ok(())
}

/// Creates or replaces the given points (PUT semantics) in one transaction.
/// Returns the canonical ids in batch order.
pub async fn create_data_points<C: ConnectionTrait>(
    db: &C,
    ctx: &ModificationContext<'_>,
    batch: &[NewDataPoint],
) -> Result<Vec<Uuid>, ServiceError> {
    ensure_unlocked(ctx)?;
    if batch.len() > ctx.settings.max_bulk_size {
        return Err(ValidationError::BatchTooLarge {
            got: batch.len(),
            max: ctx.settings.max_bulk_size,
        }
        .into());
    }
    let validated = validate_batch(ctx, batch, WriteMode::Put).await?;
    write_batch(db, ctx, &validated, WriteMode::Put).await
}

pub async fn create_data_point<C: ConnectionTrait>(
    db: &C,
    ctx: &ModificationContext<'_>,
    point: &NewDataPoint,
) -> Result<Uuid, ServiceError> {
    let ids = create_data_points(db, ctx, std::slice::from_ref(point)).await?;
    Ok(ids[0])
}

/// Full replacement of an existing point. Unlike create, the point must
/// already exist.
pub async fn update_data_point<C: ConnectionTrait>(
    db: &C,
    ctx: &ModificationContext<'_>,
    point: &NewDataPoint,
) -> Result<Uuid, ServiceError> {
    ensure_unlocked(ctx)?;
    ctx.accessor
        .resolve(&point.external_id, ctx.series.id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("data point '{}'", point.external_id)))?;
    create_data_point(db, ctx, point).await
}

/// Large batches are staged in the caller's transaction and executed by the
/// outbox task after commit, so the caller never holds row locks across a
/// bulk write.
pub async fn create_bulk_or_stage<C: ConnectionTrait>(
    db: &C,
    ctx: &ModificationContext<'_>,
    batch: &[NewDataPoint],
) -> Result<BulkOutcome, ServiceError> {
    ensure_unlocked(ctx)?;
    if batch.len() > ctx.settings.max_bulk_size {
        return Err(ValidationError::BatchTooLarge {
            got: batch.len(),
            max: ctx.settings.max_bulk_size,
        }
        .into());
    }
    if batch.len() > ctx.settings.defer_threshold {
        // validate up front so the user hears about bad input synchronously
        validate_batch(ctx, batch, WriteMode::Put).await?;
        let staged_batch_id =
            staged_batches::insert_pending(db, ctx.series.id, batch, ctx.stamp).await?;
        return Ok(BulkOutcome::Staged { staged_batch_id });
    }
    let validated = validate_batch(ctx, batch, WriteMode::Put).await?;
    let ids = write_batch(db, ctx, &validated, WriteMode::Put).await?;
    Ok(BulkOutcome::Written { ids })
}

/// Partial update: only the provided fields change, everything else keeps its
/// current value and history.
pub async fn patch_data_point<C: ConnectionTrait>(
    db: &C,
    ctx: &ModificationContext<'_>,
    point: &NewDataPoint,
) -> Result<Uuid, ServiceError> {
    ensure_unlocked(ctx)?;
    let existing = ctx
        .accessor
        .resolve(&point.external_id, ctx.series.id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("data point '{}'", point.external_id)))?;
    let validated = validate_batch(ctx, std::slice::from_ref(point), WriteMode::Patch).await?;
    write_batch(db, ctx, &validated, WriteMode::Patch).await?;
    Ok(existing.id)
}

/// Soft delete: a tombstone version is appended where history is kept, and
/// the current-state row is marked deleted. The identity stays registered, so
/// a later write revives the point.
pub async fn delete_data_point<C: ConnectionTrait>(
    db: &C,
    ctx: &ModificationContext<'_>,
    identifier: &str,
) -> Result<(), ServiceError> {
    ensure_unlocked(ctx)?;
    let point = ctx
        .accessor
        .resolve(identifier, ctx.series.id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("data point '{identifier}'")))?;

    let info = ctx.info;
    let schema = &info.schema_name;
    if info.backend.has_fact_history() {
        append_tombstones(db, schema, info.data_series_id, &[point.id], ctx.stamp, true).await?;
    }
    if info.backend.has_wide_table() {
        let mat = quote_qualified(schema, &physical::mat_table_name(info.data_series_id));
        let sql = format!(
            "UPDATE {mat} SET \"deleted_at\" = $2, \"point_in_time\" = $2, \"sub_clock\" = $3 \
             WHERE \"id\" = $1 AND (\"point_in_time\", \"sub_clock\") < ($2, $3)"
        );
        db.execute(Statement::from_sql_and_values(
            db.get_database_backend(),
            sql,
            vec![
                point.id.into(),
                ctx.stamp.point_in_time.into(),
                ctx.stamp.sub_clock.into(),
            ],
        ))
        .await?;
    }
    if info.backend.has_flat_history() {
        append_flat_tombstones(db, ctx, &[point.id]).await?;
    }

    ctx.events
        .emit(ChangeEvent {
            tenant_id: ctx.series.tenant_id,
            data_series_id: ctx.series.id,
            event_type: ChangeEventType::DataPointDeleted,
            payload: json!({ "id": point.id, "external_id": point.external_id }),
            stamp: ctx.stamp,
        })
        .await;
    Ok(())
}

async fn validate_batch(
    ctx: &ModificationContext<'_>,
    batch: &[NewDataPoint],
    mode: WriteMode,
) -> Result<Vec<ValidatedPoint>, ServiceError> {
    let duplicates: Vec<String> = batch
        .iter()
        .map(|p| p.external_id.clone())
        .duplicates()
        .collect();
    if !duplicates.is_empty() {
        return Err(ValidationError::DuplicateExternalIds(duplicates).into());
    }

    let info = ctx.info;
    let mut unknown: BTreeSet<String> = BTreeSet::new();
    let mut missing: BTreeSet<String> = BTreeSet::new();
    let mut validated = Vec::with_capacity(batch.len());

    for point in batch {
        if point.external_id.is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "external_id".to_string(),
                message: "must not be empty".to_string(),
            }
            .into());
        }
        let mut writes = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut extras = Map::new();

        for (field, value) in &point.payload {
            let Some(key) = info.field(field) else {
                if info.allow_extra_fields {
                    extras.insert(field.clone(), value.clone());
                } else {
                    unknown.insert(field.clone());
                }
                continue;
            };
            seen.insert(field.as_str());
            let write_value = match key.target {
                FieldTarget::Fact(kind) => {
                    FactValue::parse(kind, field, value)?.map(WriteValue::Fact)
                }
                FieldTarget::Dimension => resolve_dimension(ctx, &key, field, value).await?,
            };
            if write_value.is_none() && !key.optional && mode == WriteMode::Put {
                missing.insert(field.clone());
            }
            writes.push(FieldWrite {
                key,
                value: write_value,
            });
        }

        if mode == WriteMode::Put {
            for key in &info.data_point_serialization_keys {
                if seen.contains(key.external_id.as_str()) {
                    continue;
                }
                if !key.optional {
                    missing.insert(key.external_id.clone());
                }
                writes.push(FieldWrite {
                    key: key.clone(),
                    value: None,
                });
            }
        }

        let extra = match mode {
            WriteMode::Put if info.allow_extra_fields => Some(JsonValue::Object(extras)),
            WriteMode::Patch if !extras.is_empty() => Some(JsonValue::Object(extras)),
            _ => None,
        };
        validated.push(ValidatedPoint {
            id: data_point_id(ctx.series.id, &point.external_id),
            external_id: point.external_id.clone(),
            writes,
            extra,
        });
    }

    if !unknown.is_empty() {
        return Err(ValidationError::UnknownFields(unknown.into_iter().collect()).into());
    }
    if !missing.is_empty() {
        return Err(ValidationError::MissingRequired(missing.into_iter().collect()).into());
    }
    Ok(validated)
}

async fn resolve_dimension(
    ctx: &ModificationContext<'_>,
    key: &SerializationKey,
    field: &str,
    value: &JsonValue,
) -> Result<Option<WriteValue>, ServiceError> {
    if value.is_null() {
        return Ok(None);
    }
    let raw = value.as_str().ok_or_else(|| ValidationError::WrongType {
        field: field.to_string(),
        expected: "a referenced data point identifier",
    })?;
    let reference = key
        .reference_data_series_id
        .ok_or_else(|| anyhow::anyhow!("dimension key without reference series"))?;
    let resolved = ctx.accessor.resolve(raw, reference).await?.ok_or_else(|| {
        ServiceError::Conflict(format!(
            "field '{field}': referenced data point '{raw}' does not exist"
        ))
    })?;
    Ok(Some(WriteValue::Dimension(resolved.id)))
}

async fn write_batch<C: ConnectionTrait>(
    db: &C,
    ctx: &ModificationContext<'_>,
    batch: &[ValidatedPoint],
    mode: WriteMode,
) -> Result<Vec<Uuid>, ServiceError> {
    if batch.is_empty() {
        return Ok(vec![]);
    }
    let info = ctx.info;
    let schema = &info.schema_name;
    let ids: Vec<Uuid> = batch.iter().map(|p| p.id).collect();

    let existing: HashSet<Uuid> = data_points::existing_ids(db, ctx.series.id, &ids)
        .await?
        .into_iter()
        .collect();
    data_points::ensure_many(
        db,
        ctx.series.id,
        batch.iter().map(|p| (p.id, p.external_id.clone())),
    )
    .await?;

    if info.backend.has_fact_history() {
        append_history(db, ctx, batch).await?;
        let created: Vec<Uuid> = ids
            .iter()
            .copied()
            .filter(|id| !existing.contains(id))
            .collect();
        // a liveness version for fresh points, so tombstone lookups resolve
        append_tombstones(db, schema, info.data_series_id, &created, ctx.stamp, false).await?;
    }
    if info.backend.has_wide_table() {
        for point in batch {
            upsert_wide(db, ctx, point, mode).await?;
        }
    }
    if info.backend.has_flat_history() {
        append_flat_versions(db, ctx, batch, mode).await?;
    }
    record_file_lookups(db, ctx, batch).await?;

    for point in batch {
        let event_type = if existing.contains(&point.id) {
            ChangeEventType::DataPointUpdated
        } else {
            ChangeEventType::DataPointCreated
        };
        ctx.events
            .emit(ChangeEvent {
                tenant_id: ctx.series.tenant_id,
                data_series_id: ctx.series.id,
                event_type,
                payload: json!({ "id": point.id, "external_id": point.external_id }),
                stamp: ctx.stamp,
            })
            .await;
    }
    Ok(ids)
}

/// Appends one version row per field write into the per-kind historical
/// relations, batched per relation.
async fn append_history<C: ConnectionTrait>(
    db: &C,
    ctx: &ModificationContext<'_>,
    batch: &[ValidatedPoint],
) -> Result<(), ServiceError> {
    let info = ctx.info;
    let mut per_table: BTreeMap<String, Vec<(Uuid, Uuid, sea_orm::Value)>> = BTreeMap::new();
    let mut extra_rows: Vec<(Uuid, JsonValue)> = Vec::new();

    for point in batch {
        for write in &point.writes {
            let relation = match write.key.target {
                FieldTarget::Fact(kind) => HistRelation::Fact(kind),
                FieldTarget::Dimension => HistRelation::Dimension,
            };
            let table = physical::hist_table_name(info.data_series_id, relation);
            per_table.entry(table).or_default().push((
                point.id,
                write.key.link_id,
                write.to_sea_value(),
            ));
        }
        if let Some(extra) = &point.extra {
            extra_rows.push((point.id, extra.clone()));
        }
    }

    for (table, rows) in per_table {
        let table = quote_qualified(&info.schema_name, &table);
        let mut params: Vec<sea_orm::Value> = vec![
            ctx.stamp.point_in_time.into(),
            ctx.stamp.sub_clock.into(),
        ];
        let mut tuples = Vec::with_capacity(rows.len());
        for (point_id, link_id, value) in rows {
            let base = params.len();
            params.push(point_id.into());
            params.push(link_id.into());
            params.push(value);
            tuples.push(format!("(${}, ${}, $1, $2, ${})", base + 1, base + 2, base + 3));
        }
        let sql = format!(
            "INSERT INTO {table} \
             (\"data_point_id\", \"fact_id\", \"point_in_time\", \"sub_clock\", \"value\") \
             VALUES {}",
            tuples.join(", ")
        );
        db.execute(Statement::from_sql_and_values(
            db.get_database_backend(),
            sql,
            params,
        ))
        .await?;
    }

    if !extra_rows.is_empty() {
        let table = quote_qualified(
            &info.schema_name,
            &physical::hist_extra_table_name(info.data_series_id),
        );
        let mut params: Vec<sea_orm::Value> = vec![
            ctx.stamp.point_in_time.into(),
            ctx.stamp.sub_clock.into(),
        ];
        let mut tuples = Vec::with_capacity(extra_rows.len());
        for (point_id, value) in extra_rows {
            let base = params.len();
            params.push(point_id.into());
            params.push(value.into());
            tuples.push(format!("(${}, $1, $2, ${})", base + 1, base + 2));
        }
        let sql = format!(
            "INSERT INTO {table} \
             (\"data_point_id\", \"point_in_time\", \"sub_clock\", \"value\") \
             VALUES {}",
            tuples.join(", ")
        );
        db.execute(Statement::from_sql_and_values(
            db.get_database_backend(),
            sql,
            params,
        ))
        .await?;
    }
    Ok(())
}

async fn append_tombstones<C: ConnectionTrait>(
    db: &C,
    schema: &str,
    data_series_id: Uuid,
    point_ids: &[Uuid],
    stamp: VersionStamp,
    deleted: bool,
) -> Result<(), ServiceError> {
    if point_ids.is_empty() {
        return Ok(());
    }
    let table = quote_qualified(schema, &physical::hist_del_table_name(data_series_id));
    let mut params: Vec<sea_orm::Value> = vec![
        stamp.point_in_time.into(),
        stamp.sub_clock.into(),
        deleted.into(),
    ];
    let mut tuples = Vec::with_capacity(point_ids.len());
    for id in point_ids {
        params.push((*id).into());
        tuples.push(format!("(${}, $1, $2, $3)", params.len()));
    }
    let sql = format!(
        "INSERT INTO {table} \
         (\"data_point_id\", \"point_in_time\", \"sub_clock\", \"deleted\") \
         VALUES {}",
        tuples.join(", ")
    );
    db.execute(Statement::from_sql_and_values(
        db.get_database_backend(),
        sql,
        params,
    ))
    .await?;
    Ok(())
}

/// Conditional wide upsert: the row only moves forward in version order, so
/// out-of-order and retried writes converge on the newest state.
async fn upsert_wide<C: ConnectionTrait>(
    db: &C,
    ctx: &ModificationContext<'_>,
    point: &ValidatedPoint,
    mode: WriteMode,
) -> Result<(), ServiceError> {
    let info = ctx.info;
    let mat = quote_qualified(&info.schema_name, &physical::mat_table_name(info.data_series_id));

    let mut columns = vec![
        "\"id\"".to_string(),
        "\"external_id\"".to_string(),
        "\"point_in_time\"".to_string(),
        "\"sub_clock\"".to_string(),
    ];
    let mut params: Vec<sea_orm::Value> = vec![
        point.id.into(),
        point.external_id.clone().into(),
        ctx.stamp.point_in_time.into(),
        ctx.stamp.sub_clock.into(),
    ];
    let mut updates = vec![
        "\"point_in_time\" = EXCLUDED.\"point_in_time\"".to_string(),
        "\"sub_clock\" = EXCLUDED.\"sub_clock\"".to_string(),
        "\"deleted_at\" = NULL".to_string(),
    ];
    for write in &point.writes {
        let col = format!("\"{}\"", write.key.column_name);
        columns.push(col.clone());
        params.push(write.to_sea_value());
        updates.push(format!("{col} = EXCLUDED.{col}"));
    }
    if let Some(extra) = &point.extra {
        columns.push("\"extra\"".to_string());
        params.push(extra.clone().into());
        let update = match mode {
            WriteMode::Put => "\"extra\" = EXCLUDED.\"extra\"".to_string(),
            WriteMode::Patch => {
                "\"extra\" = COALESCE(mat.\"extra\", '{}'::jsonb) || EXCLUDED.\"extra\""
                    .to_string()
            }
        };
        updates.push(update);
    }

    let placeholders = (1..=params.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {mat} AS mat ({columns}) VALUES ({placeholders}) \
         ON CONFLICT (\"id\") DO UPDATE SET {updates} \
         WHERE (mat.\"point_in_time\", mat.\"sub_clock\") \
         < (EXCLUDED.\"point_in_time\", EXCLUDED.\"sub_clock\")",
        columns = columns.join(", "),
        updates = updates.join(", "),
    );
    db.execute(Statement::from_sql_and_values(
        db.get_database_backend(),
        sql,
        params,
    ))
    .await?;
    Ok(())
}

fn flat_column_list(info: &DataSeriesQueryInfo) -> String {
    let mut columns = vec![
        "\"id\"".to_string(),
        "\"external_id\"".to_string(),
        "\"point_in_time\"".to_string(),
        "\"sub_clock\"".to_string(),
        "\"deleted\"".to_string(),
        "\"extra\"".to_string(),
    ];
    columns.extend(
        info.data_point_serialization_keys
            .iter()
            .map(|key| format!("\"{}\"", key.column_name)),
    );
    columns.join(", ")
}

/// Appends one full version row per point into the flat history table. Rows
/// are built from the validated writes rather than the wide row, so a write
/// whose stamp lost the wide upsert still lands as its own version.
async fn append_flat_versions<C: ConnectionTrait>(
    db: &C,
    ctx: &ModificationContext<'_>,
    batch: &[ValidatedPoint],
    mode: WriteMode,
) -> Result<(), ServiceError> {
    let info = ctx.info;
    let flat = quote_qualified(&info.schema_name, &physical::flat_table_name(info.data_series_id));
    let columns = flat_column_list(info);

    match mode {
        WriteMode::Put => {
            let mut params: Vec<sea_orm::Value> = vec![
                ctx.stamp.point_in_time.into(),
                ctx.stamp.sub_clock.into(),
            ];
            let mut tuples = Vec::with_capacity(batch.len());
            for point in batch {
                let by_column: BTreeMap<&str, sea_orm::Value> = point
                    .writes
                    .iter()
                    .map(|w| (w.key.column_name.as_str(), w.to_sea_value()))
                    .collect();
                params.push(point.id.into());
                let mut row = vec![format!("${}", params.len())];
                params.push(point.external_id.clone().into());
                row.push(format!("${}", params.len()));
                row.push("$1".to_string());
                row.push("$2".to_string());
                row.push("false".to_string());
                params.push(point.extra.clone().into());
                row.push(format!("${}", params.len()));
                for key in &info.data_point_serialization_keys {
                    // PUT validation writes every serialization key
                    let value = by_column
                        .get(key.column_name.as_str())
                        .cloned()
                        .unwrap_or_else(|| match key.target {
                            FieldTarget::Fact(kind) => kind.null_value(),
                            FieldTarget::Dimension => sea_orm::Value::Uuid(None),
                        });
                    params.push(value);
                    row.push(format!("${}", params.len()));
                }
                tuples.push(format!("({})", row.join(", ")));
            }
            let sql = format!(
                "INSERT INTO {flat} ({columns}) VALUES {} ON CONFLICT DO NOTHING",
                tuples.join(", ")
            );
            db.execute(Statement::from_sql_and_values(
                db.get_database_backend(),
                sql,
                params,
            ))
            .await?;
        }
        WriteMode::Patch => {
            // untouched fields come from the current wide row
            let mat =
                quote_qualified(&info.schema_name, &physical::mat_table_name(info.data_series_id));
            for point in batch {
                let mut params: Vec<sea_orm::Value> = vec![
                    ctx.stamp.point_in_time.into(),
                    ctx.stamp.sub_clock.into(),
                    point.id.into(),
                ];
                let mut select = vec![
                    "$3".to_string(),
                    "m.\"external_id\"".to_string(),
                    "$1".to_string(),
                    "$2".to_string(),
                    "false".to_string(),
                ];
                match &point.extra {
                    Some(extra) => {
                        params.push(extra.clone().into());
                        select.push(format!(
                            "COALESCE(m.\"extra\", '{{}}'::jsonb) || ${}",
                            params.len()
                        ));
                    }
                    None => select.push("m.\"extra\"".to_string()),
                }
                let by_column: BTreeMap<&str, sea_orm::Value> = point
                    .writes
                    .iter()
                    .map(|w| (w.key.column_name.as_str(), w.to_sea_value()))
                    .collect();
                for key in &info.data_point_serialization_keys {
                    match by_column.get(key.column_name.as_str()) {
                        Some(value) => {
                            params.push(value.clone());
                            select.push(format!("${}", params.len()));
                        }
                        None => select.push(format!("m.\"{}\"", key.column_name)),
                    }
                }
                let sql = format!(
                    "INSERT INTO {flat} ({columns}) \
                     SELECT {} FROM {mat} m WHERE m.\"id\" = $3 \
                     ON CONFLICT DO NOTHING",
                    select.join(", ")
                );
                db.execute(Statement::from_sql_and_values(
                    db.get_database_backend(),
                    sql,
                    params,
                ))
                .await?;
            }
        }
    }
    Ok(())
}

/// Appends a tombstone version per point, carrying the last known values off
/// the wide row.
async fn append_flat_tombstones<C: ConnectionTrait>(
    db: &C,
    ctx: &ModificationContext<'_>,
    point_ids: &[Uuid],
) -> Result<(), ServiceError> {
    if point_ids.is_empty() {
        return Ok(());
    }
    let info = ctx.info;
    let mat = quote_qualified(&info.schema_name, &physical::mat_table_name(info.data_series_id));
    let flat = quote_qualified(&info.schema_name, &physical::flat_table_name(info.data_series_id));
    let columns = flat_column_list(info);

    let mut params: Vec<sea_orm::Value> = vec![
        ctx.stamp.point_in_time.into(),
        ctx.stamp.sub_clock.into(),
    ];
    let mut id_placeholders = Vec::with_capacity(point_ids.len());
    for id in point_ids {
        params.push((*id).into());
        id_placeholders.push(format!("${}", params.len()));
    }
    let value_cols = info
        .data_point_serialization_keys
        .iter()
        .map(|key| format!(", m.\"{}\"", key.column_name))
        .collect::<String>();
    let sql = format!(
        "INSERT INTO {flat} ({columns}) \
         SELECT m.\"id\", m.\"external_id\", $1, $2, true, m.\"extra\"{value_cols} \
         FROM {mat} m \
         WHERE m.\"id\" IN ({ids}) \
         ON CONFLICT DO NOTHING",
        ids = id_placeholders.join(", "),
    );
    db.execute(Statement::from_sql_and_values(
        db.get_database_backend(),
        sql,
        params,
    ))
    .await?;
    Ok(())
}

/// Records a lookup row per blob-valued fact, so pruning and truncation can
/// find and delete the underlying objects.
async fn record_file_lookups<C: ConnectionTrait>(
    db: &C,
    ctx: &ModificationContext<'_>,
    batch: &[ValidatedPoint],
) -> Result<(), ServiceError> {
    let mut models = Vec::new();
    for point in batch {
        for write in &point.writes {
            let Some(WriteValue::Fact(value)) = &write.value else {
                continue;
            };
            let Some(blob_key) = value.blob_key() else {
                continue;
            };
            models.push(file_lookups_entity::ActiveModel {
                tenant_id: Set(ctx.series.tenant_id),
                data_series_id: Set(ctx.series.id),
                fact_link_id: Set(write.key.link_id),
                data_point_id: Set(point.id),
                point_in_time: Set(ctx.stamp.point_in_time),
                sub_clock: Set(ctx.stamp.sub_clock),
                blob_key: Set(blob_key.to_string()),
                ..Default::default()
            });
        }
    }
    file_lookups::insert_many(db, models).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{accessor::ResolvedDataPoint, query_info::FactColumnInfo, types::Backend, types::FactKind};
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;

    struct StaticAccessor {
        known: Vec<ResolvedDataPoint>,
    }

    #[async_trait::async_trait]
    impl DataPointAccessor for StaticAccessor {
        async fn resolve(
            &self,
            identifier: &str,
            data_series_id: Uuid,
        ) -> Result<Option<ResolvedDataPoint>, ServiceError> {
            Ok(self
                .known
                .iter()
                .find(|p| p.external_id == identifier && p.data_series_id == data_series_id)
                .cloned())
        }
    }

    fn series_model(id: Uuid, allow_extra: bool) -> data_series::Model {
        data_series::Model {
            id,
            tenant_id: Uuid::new_v4(),
            external_id: "s".to_string(),
            name: "s".to_string(),
            backend: Backend::Materialized.into(),
            locked: false,
            allow_extra_fields: allow_extra,
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn info_with_fields(
        series: &data_series::Model,
        required: &str,
        optional: &str,
    ) -> DataSeriesQueryInfo {
        let mut facts = BTreeMap::new();
        let mut float_map = BTreeMap::new();
        for (name, opt) in [(required, false), (optional, true)] {
            let link = Uuid::new_v4();
            float_map.insert(
                name.to_string(),
                FactColumnInfo {
                    column_name: physical::fact_column_name(link, name),
                    fact_id: Uuid::new_v4(),
                    link_id: link,
                    optional: opt,
                },
            );
        }
        facts.insert(FactKind::Float, float_map);
        let mut info = DataSeriesQueryInfo {
            data_series_id: series.id,
            tenant_id: series.tenant_id,
            backend: Backend::Materialized,
            allow_extra_fields: series.allow_extra_fields,
            schema_name: physical::tenant_schema(series.tenant_id),
            main_query_table: "\"t\"".to_string(),
            alive_filter: "\"deleted_at\" IS NULL".to_string(),
            facts,
            dimensions: BTreeMap::new(),
            extra_query_fields: vec![],
            data_point_serialization_keys: vec![],
        };
        let keys: Vec<SerializationKey> = ["height", "width"]
            .iter()
            .filter_map(|n| info.field(n))
            .collect();
        info.data_point_serialization_keys = keys;
        info
    }

    fn context<'a>(
        series: &'a data_series::Model,
        info: &'a DataSeriesQueryInfo,
        settings: &'a EngineSettings,
        accessor: &'a StaticAccessor,
        events: &'a crate::events::NullEventSink,
    ) -> ModificationContext<'a> {
        ModificationContext {
            series,
            info,
            settings,
            accessor,
            events,
            stamp: VersionStamp::new(Utc::now(), 1),
        }
    }

    #[tokio::test]
    async fn put_adds_explicit_nulls_and_checks_required() {
        let series = series_model(Uuid::new_v4(), false);
        let info = info_with_fields(&series, "height", "width");
        let settings = EngineSettings::default();
        let accessor = StaticAccessor { known: vec![] };
        let events = crate::events::NullEventSink;
        let ctx = context(&series, &info, &settings, &accessor, &events);

        let full = NewDataPoint {
            external_id: "p1".to_string(),
            payload: serde_json::from_value(json!({ "height": 1.0 })).unwrap(),
        };
        let validated = validate_batch(&ctx, &[full], WriteMode::Put).await.unwrap();
        // absent optional field becomes an explicit null write
        assert_eq!(validated[0].writes.len(), 2);

        let missing = NewDataPoint {
            external_id: "p2".to_string(),
            payload: serde_json::from_value(json!({ "width": 2.0 })).unwrap(),
        };
        let err = validate_batch(&ctx, &[missing], WriteMode::Put)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Validation(ValidationError::MissingRequired(ref fields))
                if fields == &["height"]
        ));
    }

    #[tokio::test]
    async fn patch_only_touches_provided_fields() {
        let series = series_model(Uuid::new_v4(), false);
        let info = info_with_fields(&series, "height", "width");
        let settings = EngineSettings::default();
        let accessor = StaticAccessor { known: vec![] };
        let events = crate::events::NullEventSink;
        let ctx = context(&series, &info, &settings, &accessor, &events);

        let point = NewDataPoint {
            external_id: "p1".to_string(),
            payload: serde_json::from_value(json!({ "width": 2.0 })).unwrap(),
        };
        let validated = validate_batch(&ctx, &[point], WriteMode::Patch)
            .await
            .unwrap();
        assert_eq!(validated[0].writes.len(), 1);
        assert_eq!(validated[0].writes[0].key.external_id, "width");
    }

    #[tokio::test]
    async fn unknown_fields_are_collected_unless_extras_allowed() {
        let series = series_model(Uuid::new_v4(), false);
        let info = info_with_fields(&series, "height", "width");
        let settings = EngineSettings::default();
        let accessor = StaticAccessor { known: vec![] };
        let events = crate::events::NullEventSink;
        let ctx = context(&series, &info, &settings, &accessor, &events);

        let point = NewDataPoint {
            external_id: "p1".to_string(),
            payload: serde_json::from_value(
                json!({ "height": 1.0, "bogus": 1, "extra2": "x" }),
            )
            .unwrap(),
        };
        let err = validate_batch(&ctx, &[point.clone()], WriteMode::Patch)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Validation(ValidationError::UnknownFields(ref fields))
                if fields == &["bogus", "extra2"]
        ));

        let mut series = series;
        series.allow_extra_fields = true;
        let mut info = info;
        info.allow_extra_fields = true;
        let ctx = context(&series, &info, &settings, &accessor, &events);
        let validated = validate_batch(&ctx, &[point], WriteMode::Patch)
            .await
            .unwrap();
        let extra = validated[0].extra.as_ref().unwrap();
        assert_eq!(extra["bogus"], json!(1));
        assert_eq!(extra["extra2"], json!("x"));
    }

    #[tokio::test]
    async fn duplicate_external_ids_rejected() {
        let series = series_model(Uuid::new_v4(), false);
        let info = info_with_fields(&series, "height", "width");
        let settings = EngineSettings::default();
        let accessor = StaticAccessor { known: vec![] };
        let events = crate::events::NullEventSink;
        let ctx = context(&series, &info, &settings, &accessor, &events);

        let point = NewDataPoint {
            external_id: "p1".to_string(),
            payload: serde_json::from_value(json!({ "height": 1.0 })).unwrap(),
        };
        let err = validate_batch(&ctx, &[point.clone(), point], WriteMode::Put)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Validation(ValidationError::DuplicateExternalIds(_))
        ));
    }
}
