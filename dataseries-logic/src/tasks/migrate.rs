//! Backend migration task. The series is locked first in its own
//! transaction, the data copy runs outside any long transaction with
//! idempotent statements, and the backend flag only flips at the very end.
//! A failure leaves the series locked for operator inspection instead of
//! half-migrated and writable.

use crate::{
    error::{ServiceError, ValidationError},
    ident::quote_qualified,
    physical::{self, HistRelation},
    query_info::{compute_data_series_query_info, DataSeriesQueryInfo, FieldTarget},
    repository::data_series as data_series_repo,
    types::Backend,
};
use chrono::Utc;
use dataseries_entity::{data_series, user_indexes};
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, Statement,
    TransactionTrait,
};
use uuid::Uuid;

/// Dry-run description of a migration. `steps` is human-readable; the task
/// executes the same sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationPlan {
    pub from: Backend,
    pub to: Backend,
    pub steps: Vec<String>,
}

pub fn plan_backend_migration(
    from: Backend,
    to: Backend,
) -> Result<MigrationPlan, ValidationError> {
    from.validate_transition(to)?;
    let steps = match (from, to) {
        (Backend::V1, Backend::Materialized) => vec![
            "create wide current-state table".to_string(),
            "seed wide table from per-fact history".to_string(),
            "recreate user indexes".to_string(),
        ],
        (Backend::Materialized, Backend::NoHistory) => vec![
            "drop per-fact history tables".to_string(),
        ],
        (Backend::NoHistory, Backend::MaterializedFlatHistory) => vec![
            "create flat history table".to_string(),
            "seed flat history from current state".to_string(),
        ],
        (Backend::MaterializedFlatHistory, Backend::NoHistory) => vec![
            "drop flat history table".to_string(),
        ],
        _ => unreachable!("validated above"),
    };
    Ok(MigrationPlan { from, to, steps })
}

/// Runs a backend migration end to end. `accept` must be set; the plan is
/// returned without side effects otherwise, so callers can show it first.
#[tracing::instrument(skip(db), err)]
pub async fn run_backend_migration(
    db: &DatabaseConnection,
    tenant_id: Uuid,
    data_series_id: Uuid,
    target: Backend,
    accept: bool,
) -> Result<MigrationPlan, ServiceError> {
    let txn = db.begin().await?;
    let series = data_series_repo::lock_for_update(&txn, tenant_id, data_series_id).await?;
    if series.locked {
        return Err(ServiceError::Locked);
    }
    let from = Backend::from(series.backend);
    let plan = plan_backend_migration(from, target)?;
    if !accept {
        txn.rollback().await?;
        return Err(ValidationError::NotAccepted.into());
    }
    let series = data_series_repo::set_locked(&txn, series, true).await?;
    txn.commit().await?;

    let info = compute_data_series_query_info(db, &series).await?;
    match (from, target) {
        (Backend::V1, Backend::Materialized) => {
            physical::create_wide_table(db, &info.schema_name, series.id).await?;
            super::ensure_field_columns(db, &info, &physical::mat_table_name(series.id)).await?;
            seed_wide_from_history(db, &info).await?;
        }
        (Backend::Materialized, Backend::NoHistory) => {
            physical::drop_history_tables(db, &info.schema_name, series.id).await?;
        }
        (Backend::NoHistory, Backend::MaterializedFlatHistory) => {
            physical::create_flat_table(db, &info.schema_name, series.id).await?;
            super::ensure_field_columns(db, &info, &physical::flat_table_name(series.id)).await?;
            seed_flat_from_wide(db, &info).await?;
        }
        (Backend::MaterializedFlatHistory, Backend::NoHistory) => {
            physical::drop_table(
                db,
                &info.schema_name,
                &physical::flat_table_name(series.id),
            )
            .await?;
        }
        _ => unreachable!("validated above"),
    }
    recreate_user_indexes(db, &series, &info, target).await?;

    let txn = db.begin().await?;
    let series = data_series_repo::lock_for_update(&txn, tenant_id, data_series_id).await?;
    data_series_repo::flip_backend_and_unlock(&txn, series, target).await?;
    txn.commit().await?;
    Ok(plan)
}

/// Collapses the per-fact history into one current-state row per point.
/// Conflict-free on retry: already-seeded rows are left alone.
async fn seed_wide_from_history<C: ConnectionTrait>(
    db: &C,
    info: &DataSeriesQueryInfo,
) -> Result<(), ServiceError> {
    let schema = &info.schema_name;
    let mat = quote_qualified(schema, &physical::mat_table_name(info.data_series_id));
    let instant = Utc::now();

    let mut columns = vec![
        "\"id\"".to_string(),
        "\"external_id\"".to_string(),
        "\"point_in_time\"".to_string(),
        "\"sub_clock\"".to_string(),
        "\"deleted_at\"".to_string(),
        "\"extra\"".to_string(),
    ];
    let mut selects = vec![
        "dp.\"id\"".to_string(),
        "dp.\"external_id\"".to_string(),
        "lv.\"point_in_time\"".to_string(),
        "0".to_string(),
        "CASE WHEN COALESCE(dl.\"deleted\", false) THEN lv.\"point_in_time\" END".to_string(),
        "ex.\"value\"".to_string(),
    ];
    let mut joins = Vec::new();
    let mut union_arms = Vec::new();

    for key in &info.data_point_serialization_keys {
        let relation = match key.target {
            FieldTarget::Fact(kind) => HistRelation::Fact(kind),
            FieldTarget::Dimension => HistRelation::Dimension,
        };
        let table = quote_qualified(
            schema,
            &physical::hist_table_name(info.data_series_id, relation),
        );
        let alias = crate::filter::version_alias(&key.column_name);
        joins.push(format!(
            "LEFT JOIN LATERAL (\
             SELECT h.\"value\" FROM {table} h \
             WHERE h.\"data_point_id\" = dp.\"id\" AND h.\"fact_id\" = '{link}' \
             AND h.\"point_in_time\" <= $1 \
             ORDER BY h.\"point_in_time\" DESC, h.\"sub_clock\" DESC LIMIT 1\
             ) \"{alias}\" ON true",
            link = key.link_id,
        ));
        union_arms.push(format!(
            "SELECT h.\"point_in_time\" FROM {table} h \
             WHERE h.\"data_point_id\" = dp.\"id\" AND h.\"fact_id\" = '{link}' \
             AND h.\"point_in_time\" <= $1",
            link = key.link_id,
        ));
        columns.push(format!("\"{}\"", key.column_name));
        selects.push(format!("\"{alias}\".\"value\""));
    }

    let del = quote_qualified(schema, &physical::hist_del_table_name(info.data_series_id));
    union_arms.push(format!(
        "SELECT h.\"point_in_time\" FROM {del} h \
         WHERE h.\"data_point_id\" = dp.\"id\" AND h.\"point_in_time\" <= $1"
    ));
    joins.push(format!(
        "LEFT JOIN LATERAL (\
         SELECT h.\"deleted\" FROM {del} h \
         WHERE h.\"data_point_id\" = dp.\"id\" AND h.\"point_in_time\" <= $1 \
         ORDER BY h.\"point_in_time\" DESC, h.\"sub_clock\" DESC LIMIT 1\
         ) dl ON true"
    ));
    let extra = quote_qualified(schema, &physical::hist_extra_table_name(info.data_series_id));
    joins.push(format!(
        "LEFT JOIN LATERAL (\
         SELECT h.\"value\" FROM {extra} h \
         WHERE h.\"data_point_id\" = dp.\"id\" AND h.\"point_in_time\" <= $1 \
         ORDER BY h.\"point_in_time\" DESC, h.\"sub_clock\" DESC LIMIT 1\
         ) ex ON true"
    ));
    joins.push(format!(
        "LEFT JOIN LATERAL (\
         SELECT max(x.\"point_in_time\") AS point_in_time FROM ({}) x\
         ) lv ON true",
        union_arms.join(" UNION ALL ")
    ));

    let sql = format!(
        "INSERT INTO {mat} ({columns}) \
         SELECT {selects} \
         FROM \"data_points\" dp {joins} \
         WHERE dp.\"data_series_id\" = '{series}' AND lv.\"point_in_time\" IS NOT NULL \
         ON CONFLICT (\"id\") DO NOTHING",
        columns = columns.join(", "),
        selects = selects.join(", "),
        joins = joins.join(" "),
        series = info.data_series_id,
    );
    db.execute(Statement::from_sql_and_values(
        db.get_database_backend(),
        sql,
        vec![instant.into()],
    ))
    .await?;
    Ok(())
}

/// Seeds the flat history with one baseline version per current row.
async fn seed_flat_from_wide<C: ConnectionTrait>(
    db: &C,
    info: &DataSeriesQueryInfo,
) -> Result<(), ServiceError> {
    let schema = &info.schema_name;
    let mat = quote_qualified(schema, &physical::mat_table_name(info.data_series_id));
    let flat = quote_qualified(schema, &physical::flat_table_name(info.data_series_id));
    let fact_cols: Vec<String> = info
        .data_point_serialization_keys
        .iter()
        .map(|key| format!("\"{}\"", key.column_name))
        .collect();
    let col_list = if fact_cols.is_empty() {
        String::new()
    } else {
        format!(", {}", fact_cols.join(", "))
    };
    let select_cols = fact_cols
        .iter()
        .map(|c| format!("m.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let select_list = if select_cols.is_empty() {
        String::new()
    } else {
        format!(", {select_cols}")
    };
    let sql = format!(
        "INSERT INTO {flat} \
         (\"id\", \"external_id\", \"point_in_time\", \"sub_clock\", \"deleted\", \"extra\"{col_list}) \
         SELECT m.\"id\", m.\"external_id\", m.\"point_in_time\", m.\"sub_clock\", \
         m.\"deleted_at\" IS NOT NULL, m.\"extra\"{select_list} \
         FROM {mat} m \
         ON CONFLICT DO NOTHING"
    );
    db.execute(Statement::from_string(db.get_database_backend(), sql))
        .await?;
    Ok(())
}

async fn recreate_user_indexes<C: ConnectionTrait>(
    db: &C,
    series: &data_series::Model,
    info: &DataSeriesQueryInfo,
    target: Backend,
) -> Result<(), ServiceError> {
    if !target.has_wide_table() {
        return Ok(());
    }
    let indexes = user_indexes::Entity::find()
        .filter(user_indexes::Column::DataSeriesId.eq(series.id))
        .filter(user_indexes::Column::DeletedAt.is_null())
        .all(db)
        .await?;
    for index in indexes {
        let targets: Vec<String> =
            serde_json::from_value(index.targets.clone()).unwrap_or_default();
        let columns: Vec<String> = targets
            .iter()
            .filter_map(|t| info.field(t))
            .map(|key| key.column_name)
            .collect();
        if columns.is_empty() {
            continue;
        }
        physical::create_user_index(
            db,
            &info.schema_name,
            &physical::mat_table_name(series.id),
            &physical::user_index_name(series.id, &index.name),
            &columns,
        )
        .await?;
    }
    Ok(())
}
