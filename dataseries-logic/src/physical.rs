//! Physical layout of the dynamically generated per-series tables, plus the
//! idempotent DDL that manages them. Naming is deterministic: re-running any
//! create/drop is safe after a crashed or retried task.

use crate::{
    ident::{ident_slug, quote_ident, quote_qualified},
    types::FactKind,
};
use sea_orm::{ConnectionTrait, DbErr, Statement};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Historical relations existing per data series for history-keeping
/// backends. Fact and dimension relations are partitioned by the link id so
/// metamodel pruning can drop a whole partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistRelation {
    Fact(FactKind),
    Dimension,
}

impl HistRelation {
    pub const ALL: [HistRelation; 9] = [
        HistRelation::Fact(FactKind::Float),
        HistRelation::Fact(FactKind::String),
        HistRelation::Fact(FactKind::Text),
        HistRelation::Fact(FactKind::Timestamp),
        HistRelation::Fact(FactKind::Image),
        HistRelation::Fact(FactKind::File),
        HistRelation::Fact(FactKind::Json),
        HistRelation::Fact(FactKind::Boolean),
        HistRelation::Dimension,
    ];

    pub fn suffix(&self) -> String {
        match self {
            HistRelation::Fact(kind) => kind.as_str().to_string(),
            HistRelation::Dimension => "dim".to_string(),
        }
    }

    pub fn value_sql_type(&self) -> &'static str {
        match self {
            HistRelation::Fact(kind) => kind.sql_type(),
            HistRelation::Dimension => "uuid",
        }
    }
}

pub fn tenant_schema(tenant_id: Uuid) -> String {
    format!("ds_t_{}", tenant_id.simple())
}

fn series_short(data_series_id: Uuid) -> String {
    data_series_id.simple().to_string()[..12].to_string()
}

pub fn mat_table_name(data_series_id: Uuid) -> String {
    format!("ds_{}__mat", series_short(data_series_id))
}

pub fn flat_table_name(data_series_id: Uuid) -> String {
    format!("ds_{}__flat", series_short(data_series_id))
}

pub fn hist_table_name(data_series_id: Uuid, relation: HistRelation) -> String {
    format!(
        "ds_{}__hist_{}",
        series_short(data_series_id),
        relation.suffix()
    )
}

pub fn hist_partition_name(
    data_series_id: Uuid,
    relation: HistRelation,
    link_id: Uuid,
) -> String {
    format!(
        "{}__p_{}",
        hist_table_name(data_series_id, relation),
        &link_id.simple().to_string()[..8]
    )
}

/// Tombstone versions, one row per delete/revive.
pub fn hist_del_table_name(data_series_id: Uuid) -> String {
    format!("ds_{}__hist_del", series_short(data_series_id))
}

/// Versions of the free-form extra-fields map, for `allow_extra_fields`.
pub fn hist_extra_table_name(data_series_id: Uuid) -> String {
    format!("ds_{}__hist_extra", series_short(data_series_id))
}

pub fn user_index_name(data_series_id: Uuid, name: &str) -> String {
    format!("uidx_{}_{}", series_short(data_series_id), ident_slug(name))
}

/// Physical column for a fact link: a hash of the immutable link id plus the
/// external id as attached, suffixed with a readable slug. Renaming the
/// external id later never renames the column; the name is stored on the
/// link row at attach time.
pub fn fact_column_name(link_id: Uuid, external_id: &str) -> String {
    column_name('f', link_id, external_id)
}

pub fn dimension_column_name(link_id: Uuid, external_id: &str) -> String {
    column_name('d', link_id, external_id)
}

fn column_name(prefix: char, link_id: Uuid, external_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(link_id.as_bytes());
    hasher.update(external_id.as_bytes());
    let digest = hasher.finalize();
    let mut name = format!(
        "{}_{:02x}{:02x}{:02x}{:02x}_{}",
        prefix,
        digest[0],
        digest[1],
        digest[2],
        digest[3],
        ident_slug(external_id)
    );
    // postgres identifier limit
    name.truncate(63);
    name
}

async fn execute<C: ConnectionTrait>(db: &C, sql: String) -> Result<(), DbErr> {
    db.execute(Statement::from_string(db.get_database_backend(), sql))
        .await?;
    Ok(())
}

pub async fn create_tenant_schema<C: ConnectionTrait>(
    db: &C,
    schema: &str,
) -> Result<(), DbErr> {
    execute(
        db,
        format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)),
    )
    .await
}

pub async fn create_history_tables<C: ConnectionTrait>(
    db: &C,
    schema: &str,
    data_series_id: Uuid,
) -> Result<(), DbErr> {
    for relation in HistRelation::ALL {
        let table = quote_qualified(schema, &hist_table_name(data_series_id, relation));
        execute(
            db,
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 \"data_point_id\" uuid NOT NULL, \
                 \"fact_id\" uuid NOT NULL, \
                 \"point_in_time\" timestamptz NOT NULL, \
                 \"sub_clock\" bigint NOT NULL, \
                 \"value\" {value_type}\
                 ) PARTITION BY LIST (\"fact_id\")",
                value_type = relation.value_sql_type(),
            ),
        )
        .await?;
    }
    let del = quote_qualified(schema, &hist_del_table_name(data_series_id));
    execute(
        db,
        format!(
            "CREATE TABLE IF NOT EXISTS {del} (\
             \"data_point_id\" uuid NOT NULL, \
             \"point_in_time\" timestamptz NOT NULL, \
             \"sub_clock\" bigint NOT NULL, \
             \"deleted\" boolean NOT NULL\
             )"
        ),
    )
    .await?;
    let extra = quote_qualified(schema, &hist_extra_table_name(data_series_id));
    execute(
        db,
        format!(
            "CREATE TABLE IF NOT EXISTS {extra} (\
             \"data_point_id\" uuid NOT NULL, \
             \"point_in_time\" timestamptz NOT NULL, \
             \"sub_clock\" bigint NOT NULL, \
             \"value\" jsonb NOT NULL\
             )"
        ),
    )
    .await
}

pub async fn create_history_partition<C: ConnectionTrait>(
    db: &C,
    schema: &str,
    data_series_id: Uuid,
    relation: HistRelation,
    link_id: Uuid,
) -> Result<(), DbErr> {
    let parent = quote_qualified(schema, &hist_table_name(data_series_id, relation));
    let partition = quote_qualified(
        schema,
        &hist_partition_name(data_series_id, relation, link_id),
    );
    execute(
        db,
        format!(
            "CREATE TABLE IF NOT EXISTS {partition} PARTITION OF {parent} \
             FOR VALUES IN ('{link_id}')"
        ),
    )
    .await?;
    execute(
        db,
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {partition} \
             (\"data_point_id\", \"point_in_time\", \"sub_clock\")",
            quote_ident(&format!(
                "{}_version_idx",
                hist_partition_name(data_series_id, relation, link_id)
            )),
        ),
    )
    .await
}

pub async fn drop_history_partition<C: ConnectionTrait>(
    db: &C,
    schema: &str,
    data_series_id: Uuid,
    relation: HistRelation,
    link_id: Uuid,
) -> Result<(), DbErr> {
    let partition = quote_qualified(
        schema,
        &hist_partition_name(data_series_id, relation, link_id),
    );
    execute(db, format!("DROP TABLE IF EXISTS {partition}")).await
}

pub async fn drop_history_tables<C: ConnectionTrait>(
    db: &C,
    schema: &str,
    data_series_id: Uuid,
) -> Result<(), DbErr> {
    for relation in HistRelation::ALL {
        let table = quote_qualified(schema, &hist_table_name(data_series_id, relation));
        execute(db, format!("DROP TABLE IF EXISTS {table} CASCADE")).await?;
    }
    for table in [
        hist_del_table_name(data_series_id),
        hist_extra_table_name(data_series_id),
    ] {
        execute(
            db,
            format!("DROP TABLE IF EXISTS {}", quote_qualified(schema, &table)),
        )
        .await?;
    }
    Ok(())
}

pub async fn create_wide_table<C: ConnectionTrait>(
    db: &C,
    schema: &str,
    data_series_id: Uuid,
) -> Result<(), DbErr> {
    let table = quote_qualified(schema, &mat_table_name(data_series_id));
    execute(
        db,
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             \"id\" uuid PRIMARY KEY, \
             \"external_id\" varchar NOT NULL, \
             \"point_in_time\" timestamptz NOT NULL, \
             \"sub_clock\" bigint NOT NULL, \
             \"inserted_at\" timestamptz NOT NULL DEFAULT now(), \
             \"deleted_at\" timestamptz, \
             \"extra\" jsonb\
             )"
        ),
    )
    .await
}

pub async fn create_flat_table<C: ConnectionTrait>(
    db: &C,
    schema: &str,
    data_series_id: Uuid,
) -> Result<(), DbErr> {
    let table = quote_qualified(schema, &flat_table_name(data_series_id));
    execute(
        db,
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             \"id\" uuid NOT NULL, \
             \"external_id\" varchar NOT NULL, \
             \"point_in_time\" timestamptz NOT NULL, \
             \"sub_clock\" bigint NOT NULL, \
             \"deleted\" boolean NOT NULL DEFAULT false, \
             \"inserted_at\" timestamptz NOT NULL DEFAULT now(), \
             \"extra\" jsonb, \
             UNIQUE (\"id\", \"point_in_time\", \"sub_clock\")\
             )"
        ),
    )
    .await
}

pub async fn add_column<C: ConnectionTrait>(
    db: &C,
    schema: &str,
    table: &str,
    column: &str,
    sql_type: &str,
) -> Result<(), DbErr> {
    execute(
        db,
        format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {sql_type}",
            quote_qualified(schema, table),
            quote_ident(column),
        ),
    )
    .await
}

pub async fn drop_column<C: ConnectionTrait>(
    db: &C,
    schema: &str,
    table: &str,
    column: &str,
) -> Result<(), DbErr> {
    execute(
        db,
        format!(
            "ALTER TABLE {} DROP COLUMN IF EXISTS {}",
            quote_qualified(schema, table),
            quote_ident(column),
        ),
    )
    .await
}

pub async fn drop_table<C: ConnectionTrait>(
    db: &C,
    schema: &str,
    table: &str,
) -> Result<(), DbErr> {
    execute(
        db,
        format!(
            "DROP TABLE IF EXISTS {} CASCADE",
            quote_qualified(schema, table)
        ),
    )
    .await
}

pub async fn create_user_index<C: ConnectionTrait>(
    db: &C,
    schema: &str,
    table: &str,
    index_name: &str,
    columns: &[String],
) -> Result<(), DbErr> {
    let cols = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    execute(
        db,
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({cols})",
            quote_ident(index_name),
            quote_qualified(schema, table),
        ),
    )
    .await
}

pub async fn drop_user_index<C: ConnectionTrait>(
    db: &C,
    schema: &str,
    index_name: &str,
) -> Result<(), DbErr> {
    execute(
        db,
        format!(
            "DROP INDEX IF EXISTS {}",
            quote_qualified(schema, index_name)
        ),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_names_are_deterministic_and_rename_safe() {
        let link = Uuid::new_v4();
        let a = fact_column_name(link, "Room Temperature");
        let b = fact_column_name(link, "Room Temperature");
        assert_eq!(a, b);
        assert!(a.starts_with("f_"));
        assert!(a.ends_with("_room_temperature"));
        // a different link with the same external id maps elsewhere
        assert_ne!(a, fact_column_name(Uuid::new_v4(), "Room Temperature"));
    }

    #[test]
    fn column_names_respect_identifier_limit() {
        let name = fact_column_name(Uuid::new_v4(), &"x".repeat(200));
        assert!(name.len() <= 63);
    }

    #[test]
    fn table_names_embed_series_short_id() {
        let ds: Uuid = "8f2e5c3a-1111-2222-3333-444455556666".parse().unwrap();
        assert_eq!(mat_table_name(ds), "ds_8f2e5c3a1111__mat");
        assert_eq!(
            hist_table_name(ds, HistRelation::Fact(FactKind::Float)),
            "ds_8f2e5c3a1111__hist_float"
        );
        assert_eq!(
            hist_table_name(ds, HistRelation::Dimension),
            "ds_8f2e5c3a1111__hist_dim"
        );
    }
}
