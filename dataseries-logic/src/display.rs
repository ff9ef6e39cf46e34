//! Assembles full SELECT statements for paginated, filtered, point-in-time
//! and changes-since queries across backends. One row per data point, with
//! the payload assembled server-side as a jsonb object.
//!
//! Pagination is keyset-based: the opaque token encodes the last seen
//! `(inserted_at, id)` (or just `id` where insertion order is not the sort
//! key) and the next-page predicate compares the full ordering tuple, so
//! concurrent inserts can never skip or duplicate rows.

use crate::{
    error::{ServiceError, ValidationError},
    filter::{compile_filter, version_alias, CompiledFilter, Filter},
    ident::{quote_literal, quote_qualified},
    page_token::PageTokenFormat,
    physical,
    query_info::{DataSeriesQueryInfo, FieldTarget},
    types::Backend,
};
use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, FromQueryResult, Statement};
use serde::Serialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PageDirection {
    #[default]
    Forward,
    Backward,
}

#[derive(Clone, Debug, Default)]
pub struct DisplayParams {
    pub filter: Option<Filter>,
    pub page_size: u64,
    pub page_token: Option<String>,
    pub direction: PageDirection,
    pub point_in_time: Option<DateTime<Utc>>,
    pub changes_since: Option<DateTime<Utc>>,
    pub include_versions: bool,
    pub include_deleted: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DataPointRow {
    pub id: Uuid,
    pub external_id: String,
    pub point_in_time: DateTime<Utc>,
    pub payload: JsonValue,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DataPointPage {
    pub items: Vec<DataPointRow>,
    pub next_page_token: Option<String>,
}

#[derive(FromQueryResult)]
struct RawDataPointRow {
    id: Uuid,
    external_id: String,
    point_in_time: DateTime<Utc>,
    inserted_at: Option<DateTime<Utc>>,
    payload: JsonValue,
}

pub async fn query_data_points<C: ConnectionTrait>(
    db: &C,
    info: &DataSeriesQueryInfo,
    params: &DisplayParams,
) -> Result<DataPointPage, ServiceError> {
    if params.include_versions {
        if info.backend != Backend::MaterializedFlatHistory {
            return Err(ValidationError::InvalidValue {
                field: "include_versions".to_string(),
                message: format!("backend {} keeps no flat history", info.backend),
            }
            .into());
        }
        return versions_query(db, &info.full_history(), params).await;
    }
    match info.backend {
        Backend::V1 => history_query(db, info, params).await,
        Backend::Materialized if params.point_in_time.is_some() => {
            history_query(db, info, params).await
        }
        Backend::MaterializedFlatHistory if params.point_in_time.is_some() => {
            flat_current_query(db, info, params).await
        }
        Backend::NoHistory if params.point_in_time.is_some() => {
            Err(ValidationError::InvalidValue {
                field: "point_in_time".to_string(),
                message: "backend no_history keeps no history".to_string(),
            }
            .into())
        }
        _ => wide_query(db, info, params).await,
    }
}

type PageToken = (Option<DateTime<Utc>>, Uuid);

fn parse_token(params: &DisplayParams) -> Result<Option<PageToken>, ServiceError> {
    params
        .page_token
        .clone()
        .map(|raw| {
            PageToken::parse_page_token(raw).map_err(|e| {
                ServiceError::Validation(ValidationError::InvalidValue {
                    field: "page_token".to_string(),
                    message: e.to_string(),
                })
            })
        })
        .transpose()
}

fn compile_params_filter(
    info: &DataSeriesQueryInfo,
    params: &DisplayParams,
    use_materialized: bool,
    param_offset: usize,
) -> Result<CompiledFilter, ServiceError> {
    match &params.filter {
        Some(filter) => Ok(compile_filter(filter, info, use_materialized, param_offset)?),
        None => Ok(CompiledFilter {
            sql: "1=1".to_string(),
            params: vec![],
            referenced_columns: Default::default(),
        }),
    }
}

/// jsonb payload projection over `source_expr(column)` per field, chunked to
/// stay under the jsonb_build_object argument limit.
fn payload_expr(
    info: &DataSeriesQueryInfo,
    value_expr: impl Fn(&str) -> String,
    extra_expr: Option<String>,
) -> String {
    let pairs: Vec<String> = info
        .data_point_serialization_keys
        .iter()
        .map(|key| {
            format!(
                "{}, {}",
                quote_literal(&key.external_id),
                value_expr(&key.column_name)
            )
        })
        .collect();
    let mut parts: Vec<String> = pairs
        .chunks(40)
        .map(|chunk| format!("jsonb_build_object({})", chunk.join(", ")))
        .collect();
    if parts.is_empty() {
        parts.push("'{}'::jsonb".to_string());
    }
    if info.allow_extra_fields {
        if let Some(extra) = extra_expr {
            parts.push(format!("COALESCE({extra}, '{{}}'::jsonb)"));
        }
    }
    parts.join(" || ")
}

fn order_by_clause(direction: PageDirection, ordering_cols: &[&str]) -> String {
    let dir = match direction {
        PageDirection::Forward => "ASC",
        PageDirection::Backward => "DESC",
    };
    ordering_cols
        .iter()
        .map(|c| format!("{c} {dir}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Inclusive comparison against the token tuple: the token row is the first
/// row of the next page.
fn token_predicate(
    direction: PageDirection,
    ordering_cols: &[&str],
    token_placeholders: &[String],
) -> String {
    let cmp = match direction {
        PageDirection::Forward => ">=",
        PageDirection::Backward => "<=",
    };
    format!(
        "({}) {cmp} ({})",
        ordering_cols.join(", "),
        token_placeholders.join(", ")
    )
}

fn page_from_rows(
    rows: Vec<RawDataPointRow>,
    limit: usize,
    with_inserted_at: bool,
) -> DataPointPage {
    let next_page_token = rows.get(limit).map(|row| {
        let token: PageToken = (
            if with_inserted_at { row.inserted_at } else { None },
            row.id,
        );
        token.format_page_token()
    });
    let items = rows
        .into_iter()
        .take(limit)
        .map(|row| DataPointRow {
            id: row.id,
            external_id: row.external_id,
            point_in_time: row.point_in_time,
            payload: row.payload,
        })
        .collect();
    DataPointPage {
        items,
        next_page_token,
    }
}

async fn fetch<C: ConnectionTrait>(
    db: &C,
    sql: String,
    values: Vec<sea_orm::Value>,
) -> Result<Vec<RawDataPointRow>, ServiceError> {
    Ok(RawDataPointRow::find_by_statement(Statement::from_sql_and_values(
        db.get_database_backend(),
        sql,
        values,
    ))
    .all(db)
    .await?)
}

/// Current values straight off the wide table. Serves every non-V1 backend
/// when no historical instant was requested.
async fn wide_query<C: ConnectionTrait>(
    db: &C,
    info: &DataSeriesQueryInfo,
    params: &DisplayParams,
) -> Result<DataPointPage, ServiceError> {
    let filter = compile_params_filter(info, params, true, 0)?;
    let mut values = filter.params.clone();
    let mut conditions = vec![
        if params.include_deleted {
            "1=1".to_string()
        } else {
            format!("t.{}", info.alive_filter)
        },
        filter.sql,
    ];

    if let Some(since) = params.changes_since {
        values.push(since.into());
        conditions.push(format!("t.\"point_in_time\" > ${}", values.len()));
    }

    let ordering = ["t.\"inserted_at\"", "t.\"id\""];
    if let Some((inserted_at, id)) = parse_token(params)? {
        let inserted_at = inserted_at.ok_or_else(|| {
            ServiceError::Validation(ValidationError::InvalidValue {
                field: "page_token".to_string(),
                message: "token is missing the insertion component".to_string(),
            })
        })?;
        values.push(inserted_at.into());
        let p1 = format!("${}", values.len());
        values.push(id.into());
        let p2 = format!("${}", values.len());
        conditions.push(token_predicate(params.direction, &ordering, &[p1, p2]));
    }
    let order_by = order_by_clause(params.direction, &ordering);

    let payload = payload_expr(
        info,
        |col| format!("t.\"{col}\""),
        Some("t.\"extra\"".to_string()),
    );
    let limit = (params.page_size as usize).max(1);
    let sql = format!(
        "SELECT t.\"id\" AS id, t.\"external_id\" AS external_id, \
         t.\"point_in_time\" AS point_in_time, t.\"inserted_at\" AS inserted_at, \
         {payload} AS payload \
         FROM {main} t \
         WHERE {conditions} \
         ORDER BY {order_by} \
         LIMIT {limit_plus}",
        main = info.main_query_table,
        conditions = conditions.join(" AND "),
        limit_plus = limit + 1,
    );
    let rows = fetch(db, sql, values).await?;
    Ok(page_from_rows(rows, limit, true))
}

/// Latest-version-per-fact reconstruction over the per-fact historical
/// relations. Serves V1 entirely, and MATERIALIZED for historical instants.
async fn history_query<C: ConnectionTrait>(
    db: &C,
    info: &DataSeriesQueryInfo,
    params: &DisplayParams,
) -> Result<DataPointPage, ServiceError> {
    let instant = params.point_in_time.unwrap_or_else(Utc::now);
    let mut values: Vec<sea_orm::Value> = vec![instant.into()];
    let filter = compile_params_filter(info, params, false, values.len())?;
    values.extend(filter.params.clone());

    let schema = &info.schema_name;
    let mut joins = Vec::new();
    let mut union_arms = Vec::new();

    for key in &info.data_point_serialization_keys {
        let (table, link_filter) = match key.target {
            FieldTarget::Fact(kind) => (
                physical::hist_table_name(info.data_series_id, physical::HistRelation::Fact(kind)),
                key.link_id,
            ),
            FieldTarget::Dimension => (
                physical::hist_table_name(info.data_series_id, physical::HistRelation::Dimension),
                key.link_id,
            ),
        };
        let table = quote_qualified(schema, &table);
        let alias = version_alias(&key.column_name);
        joins.push(format!(
            "LEFT JOIN LATERAL (\
             SELECT h.\"value\" FROM {table} h \
             WHERE h.\"data_point_id\" = dp.\"id\" AND h.\"fact_id\" = '{link_filter}' \
             AND h.\"point_in_time\" <= $1 \
             ORDER BY h.\"point_in_time\" DESC, h.\"sub_clock\" DESC LIMIT 1\
             ) {alias} ON true"
        ));
        union_arms.push(format!(
            "SELECT h.\"point_in_time\" FROM {table} h \
             WHERE h.\"data_point_id\" = dp.\"id\" AND h.\"fact_id\" = '{link_filter}' \
             AND h.\"point_in_time\" <= $1"
        ));
    }

    let del_table = quote_qualified(schema, &physical::hist_del_table_name(info.data_series_id));
    union_arms.push(format!(
        "SELECT h.\"point_in_time\" FROM {del_table} h \
         WHERE h.\"data_point_id\" = dp.\"id\" AND h.\"point_in_time\" <= $1"
    ));
    joins.push(format!(
        "LEFT JOIN LATERAL (\
         SELECT h.\"deleted\" FROM {del_table} h \
         WHERE h.\"data_point_id\" = dp.\"id\" AND h.\"point_in_time\" <= $1 \
         ORDER BY h.\"point_in_time\" DESC, h.\"sub_clock\" DESC LIMIT 1\
         ) dl ON true"
    ));
    joins.push(format!(
        "LEFT JOIN LATERAL (\
         SELECT max(x.\"point_in_time\") AS point_in_time FROM ({}) x\
         ) lv ON true",
        union_arms.join(" UNION ALL ")
    ));

    let extra_expr = if info.allow_extra_fields {
        let extra_table =
            quote_qualified(schema, &physical::hist_extra_table_name(info.data_series_id));
        joins.push(format!(
            "LEFT JOIN LATERAL (\
             SELECT h.\"value\" FROM {extra_table} h \
             WHERE h.\"data_point_id\" = dp.\"id\" AND h.\"point_in_time\" <= $1 \
             ORDER BY h.\"point_in_time\" DESC, h.\"sub_clock\" DESC LIMIT 1\
             ) ex ON true"
        ));
        Some("ex.\"value\"".to_string())
    } else {
        None
    };

    let mut conditions = vec![
        format!("dp.\"data_series_id\" = '{}'", info.data_series_id),
        "lv.\"point_in_time\" IS NOT NULL".to_string(),
        filter.sql,
    ];
    if !params.include_deleted {
        conditions.push("COALESCE(dl.\"deleted\", false) = false".to_string());
    }
    if let Some(since) = params.changes_since {
        values.push(since.into());
        conditions.push(format!("lv.\"point_in_time\" > ${}", values.len()));
    }
    if let Some((_, id)) = parse_token(params)? {
        values.push(id.into());
        conditions.push(token_predicate(
            params.direction,
            &["dp.\"id\""],
            &[format!("${}", values.len())],
        ));
    }
    let order_by = order_by_clause(params.direction, &["dp.\"id\""]);

    let payload = payload_expr(
        info,
        |col| format!("{}.\"value\"", version_alias(col)),
        extra_expr,
    );
    let limit = (params.page_size as usize).max(1);
    let sql = format!(
        "SELECT dp.\"id\" AS id, dp.\"external_id\" AS external_id, \
         lv.\"point_in_time\" AS point_in_time, NULL::timestamptz AS inserted_at, \
         {payload} AS payload \
         FROM \"data_points\" dp \
         {joins} \
         WHERE {conditions} \
         ORDER BY {order_by} \
         LIMIT {limit_plus}",
        joins = joins.join(" "),
        conditions = conditions.join(" AND "),
        limit_plus = limit + 1,
    );
    let rows = fetch(db, sql, values).await?;
    Ok(page_from_rows(rows, limit, false))
}

/// Point-in-time current state from the flat history table: one DISTINCT ON
/// pass picks the max version per identity at the requested instant.
async fn flat_current_query<C: ConnectionTrait>(
    db: &C,
    info: &DataSeriesQueryInfo,
    params: &DisplayParams,
) -> Result<DataPointPage, ServiceError> {
    let instant = params.point_in_time.unwrap_or_else(Utc::now);
    let mut values: Vec<sea_orm::Value> = vec![instant.into()];
    let filter = compile_params_filter(info, params, true, values.len())?;
    values.extend(filter.params.clone());

    let flat = quote_qualified(
        &info.schema_name,
        &physical::flat_table_name(info.data_series_id),
    );
    let mut conditions = vec![filter.sql];
    if !params.include_deleted {
        conditions.push("t.\"deleted\" = false".to_string());
    }
    if let Some(since) = params.changes_since {
        values.push(since.into());
        conditions.push(format!("t.\"point_in_time\" > ${}", values.len()));
    }
    if let Some((_, id)) = parse_token(params)? {
        values.push(id.into());
        conditions.push(token_predicate(
            params.direction,
            &["t.\"id\""],
            &[format!("${}", values.len())],
        ));
    }
    let order_by = order_by_clause(params.direction, &["t.\"id\""]);

    let payload = payload_expr(
        info,
        |col| format!("t.\"{col}\""),
        Some("t.\"extra\"".to_string()),
    );
    let limit = (params.page_size as usize).max(1);
    let sql = format!(
        "SELECT t.\"id\" AS id, t.\"external_id\" AS external_id, \
         t.\"point_in_time\" AS point_in_time, NULL::timestamptz AS inserted_at, \
         {payload} AS payload \
         FROM (\
         SELECT DISTINCT ON (t0.\"id\") t0.* FROM {flat} t0 \
         WHERE t0.\"point_in_time\" <= $1 \
         ORDER BY t0.\"id\", t0.\"point_in_time\" DESC, t0.\"sub_clock\" DESC\
         ) t \
         WHERE {conditions} \
         ORDER BY {order_by} \
         LIMIT {limit_plus}",
        conditions = conditions.join(" AND "),
        limit_plus = limit + 1,
    );
    let rows = fetch(db, sql, values).await?;
    Ok(page_from_rows(rows, limit, false))
}

/// Full version lists per fact, up to the requested instant, instead of the
/// collapsed current value. Flat-history backends only; `full_info` is the
/// full-history variant of the query info.
async fn versions_query<C: ConnectionTrait>(
    db: &C,
    full_info: &DataSeriesQueryInfo,
    params: &DisplayParams,
) -> Result<DataPointPage, ServiceError> {
    let instant = params.point_in_time.unwrap_or_else(Utc::now);
    let mut values: Vec<sea_orm::Value> = vec![instant.into()];
    let filter = compile_params_filter(full_info, params, true, values.len())?;
    values.extend(filter.params.clone());

    let flat = &full_info.main_query_table;
    let mut conditions = vec!["f.\"point_in_time\" <= $1".to_string(), filter.sql];
    if !params.include_deleted {
        conditions.push("t.\"deleted\" = false".to_string());
    }
    if let Some(since) = params.changes_since {
        values.push(since.into());
        conditions.push(format!("t.\"point_in_time\" > ${}", values.len()));
    }
    if let Some((_, id)) = parse_token(params)? {
        values.push(id.into());
        conditions.push(token_predicate(
            params.direction,
            &["f.\"id\""],
            &[format!("${}", values.len())],
        ));
    }
    let order_by = order_by_clause(params.direction, &["f.\"id\""]);

    let pairs: Vec<String> = full_info
        .data_point_serialization_keys
        .iter()
        .map(|key| {
            format!(
                "{}, jsonb_agg(jsonb_build_object(\
                 'point_in_time', f.\"point_in_time\", \
                 'sub_clock', f.\"sub_clock\", \
                 'value', f.\"{col}\"\
                 ) ORDER BY f.\"point_in_time\", f.\"sub_clock\")",
                quote_literal(&key.external_id),
                col = key.column_name,
            )
        })
        .collect();
    let payload = if pairs.is_empty() {
        "'{}'::jsonb".to_string()
    } else {
        pairs
            .chunks(40)
            .map(|chunk| format!("jsonb_build_object({})", chunk.join(", ")))
            .collect::<Vec<_>>()
            .join(" || ")
    };

    let limit = (params.page_size as usize).max(1);
    let sql = format!(
        "SELECT f.\"id\" AS id, f.\"external_id\" AS external_id, \
         max(f.\"point_in_time\") AS point_in_time, NULL::timestamptz AS inserted_at, \
         {payload} AS payload \
         FROM {flat} f \
         JOIN (\
         SELECT DISTINCT ON (t0.\"id\") t0.* FROM {flat} t0 \
         WHERE t0.\"point_in_time\" <= $1 \
         ORDER BY t0.\"id\", t0.\"point_in_time\" DESC, t0.\"sub_clock\" DESC\
         ) t ON t.\"id\" = f.\"id\" \
         WHERE {conditions} \
         GROUP BY f.\"id\", f.\"external_id\" \
         ORDER BY {order_by} \
         LIMIT {limit_plus}",
        conditions = conditions.join(" AND "),
        limit_plus = limit + 1,
    );
    let rows = fetch(db, sql, values).await?;
    Ok(page_from_rows(rows, limit, false))
}
