//! History and metamodel pruning. Data pruning removes superseded versions
//! older than a cutoff while always keeping the version that is current at
//! the cutoff. Metamodel pruning reclaims the physical leftovers of links
//! that were soft-detached long enough ago.

use crate::{
    blob::BlobStorage,
    error::ServiceError,
    ident::quote_qualified,
    physical::{self, HistRelation},
    query_info::DataSeriesQueryInfo,
    repository::file_lookups,
    types::FactKind,
};
use chrono::{DateTime, Utc};
use dataseries_entity::{consumers, data_series, data_series_facts, dimensions, user_indexes};
use sea_orm::{
    ColumnTrait, ConnectionTrait, EntityTrait, FromQueryResult, QueryFilter, Statement,
};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub history_rows_removed: u64,
    pub flat_rows_removed: u64,
    pub tombstoned_rows_removed: u64,
    pub blobs_deleted: u64,
}

#[derive(FromQueryResult)]
struct VersionRow {
    data_point_id: Uuid,
    point_in_time: DateTime<Utc>,
    sub_clock: i64,
}

/// Removes superseded versions older than `cutoff`. A version is removable
/// only if a newer version of the same field (or row) exists at or before
/// the cutoff, so reads at any instant past the cutoff are unaffected.
#[tracing::instrument(skip_all, fields(data_series_id = %info.data_series_id, %cutoff), err)]
pub async fn prune_history<C: ConnectionTrait>(
    db: &C,
    info: &DataSeriesQueryInfo,
    blobs: &dyn BlobStorage,
    cutoff: DateTime<Utc>,
) -> Result<PruneReport, ServiceError> {
    let mut report = PruneReport::default();
    let schema = &info.schema_name;

    if info.backend.has_fact_history() {
        for relation in HistRelation::ALL {
            let table = quote_qualified(
                schema,
                &physical::hist_table_name(info.data_series_id, relation),
            );
            let superseded = "EXISTS (\
                 SELECT 1 FROM {t} n \
                 WHERE n.\"data_point_id\" = h.\"data_point_id\" \
                 AND n.\"fact_id\" = h.\"fact_id\" \
                 AND n.\"point_in_time\" <= $1 \
                 AND (n.\"point_in_time\", n.\"sub_clock\") \
                 > (h.\"point_in_time\", h.\"sub_clock\")\
                 )"
            .replace("{t}", &table);
            let is_blob = matches!(
                relation,
                HistRelation::Fact(FactKind::Image) | HistRelation::Fact(FactKind::File)
            );
            if is_blob {
                let sql = format!(
                    "DELETE FROM {table} h \
                     WHERE h.\"point_in_time\" < $1 AND {superseded} \
                     RETURNING h.\"data_point_id\" AS data_point_id, \
                     h.\"point_in_time\" AS point_in_time, h.\"sub_clock\" AS sub_clock"
                );
                let victims = VersionRow::find_by_statement(Statement::from_sql_and_values(
                    db.get_database_backend(),
                    sql,
                    vec![cutoff.into()],
                ))
                .all(db)
                .await?;
                report.history_rows_removed += victims.len() as u64;
                let tuples: Vec<(Uuid, DateTime<Utc>, i64)> = victims
                    .into_iter()
                    .map(|v| (v.data_point_id, v.point_in_time, v.sub_clock))
                    .collect();
                report.blobs_deleted +=
                    delete_blob_versions(db, info.data_series_id, blobs, &tuples).await?;
            } else {
                let sql = format!(
                    "DELETE FROM {table} h WHERE h.\"point_in_time\" < $1 AND {superseded}"
                );
                let res = db
                    .execute(Statement::from_sql_and_values(
                        db.get_database_backend(),
                        sql,
                        vec![cutoff.into()],
                    ))
                    .await?;
                report.history_rows_removed += res.rows_affected();
            }
        }
        for table in [
            physical::hist_del_table_name(info.data_series_id),
            physical::hist_extra_table_name(info.data_series_id),
        ] {
            let table = quote_qualified(schema, &table);
            let sql = format!(
                "DELETE FROM {table} h \
                 WHERE h.\"point_in_time\" < $1 AND EXISTS (\
                 SELECT 1 FROM {table} n \
                 WHERE n.\"data_point_id\" = h.\"data_point_id\" \
                 AND n.\"point_in_time\" <= $1 \
                 AND (n.\"point_in_time\", n.\"sub_clock\") \
                 > (h.\"point_in_time\", h.\"sub_clock\")\
                 )"
            );
            let res = db
                .execute(Statement::from_sql_and_values(
                    db.get_database_backend(),
                    sql,
                    vec![cutoff.into()],
                ))
                .await?;
            report.history_rows_removed += res.rows_affected();
        }
    }

    if info.backend.has_flat_history() {
        let flat = quote_qualified(schema, &physical::flat_table_name(info.data_series_id));
        let sql = format!(
            "DELETE FROM {flat} h \
             WHERE h.\"point_in_time\" < $1 AND EXISTS (\
             SELECT 1 FROM {flat} n \
             WHERE n.\"id\" = h.\"id\" \
             AND n.\"point_in_time\" <= $1 \
             AND (n.\"point_in_time\", n.\"sub_clock\") \
             > (h.\"point_in_time\", h.\"sub_clock\")\
             ) \
             RETURNING h.\"id\" AS data_point_id, \
             h.\"point_in_time\" AS point_in_time, h.\"sub_clock\" AS sub_clock"
        );
        let victims = VersionRow::find_by_statement(Statement::from_sql_and_values(
            db.get_database_backend(),
            sql,
            vec![cutoff.into()],
        ))
        .all(db)
        .await?;
        report.flat_rows_removed += victims.len() as u64;
        let tuples: Vec<(Uuid, DateTime<Utc>, i64)> = victims
            .into_iter()
            .map(|v| (v.data_point_id, v.point_in_time, v.sub_clock))
            .collect();
        report.blobs_deleted +=
            delete_blob_versions(db, info.data_series_id, blobs, &tuples).await?;
    }

    if info.backend.has_wide_table() {
        let mat = quote_qualified(schema, &physical::mat_table_name(info.data_series_id));
        let sql = format!(
            "DELETE FROM {mat} WHERE \"deleted_at\" < $1 \
             RETURNING \"id\" AS data_point_id, \
             \"point_in_time\" AS point_in_time, \"sub_clock\" AS sub_clock"
        );
        let victims = VersionRow::find_by_statement(Statement::from_sql_and_values(
            db.get_database_backend(),
            sql,
            vec![cutoff.into()],
        ))
        .all(db)
        .await?;
        report.tombstoned_rows_removed += victims.len() as u64;
        if info.backend.keeps_history() {
            // the surviving history/flat rows still reference their blobs;
            // only lookups of the removed row version go
            let tuples: Vec<(Uuid, DateTime<Utc>, i64)> = victims
                .into_iter()
                .map(|v| (v.data_point_id, v.point_in_time, v.sub_clock))
                .collect();
            report.blobs_deleted +=
                delete_blob_versions(db, info.data_series_id, blobs, &tuples).await?;
        } else {
            // no other relation holds a version of these points
            let ids: Vec<Uuid> = victims.into_iter().map(|v| v.data_point_id).collect();
            let keys = file_lookups::take_for_points(db, info.data_series_id, &ids).await?;
            report.blobs_deleted += keys.len() as u64;
            for key in keys {
                blobs.delete(&key).await?;
            }
        }
    }
    Ok(report)
}

async fn delete_blob_versions<C: ConnectionTrait>(
    db: &C,
    data_series_id: Uuid,
    blobs: &dyn BlobStorage,
    versions: &[(Uuid, DateTime<Utc>, i64)],
) -> Result<u64, ServiceError> {
    let keys = file_lookups::take_versions(db, data_series_id, versions).await?;
    let count = keys.len() as u64;
    for key in keys {
        blobs.delete(&key).await?;
    }
    Ok(count)
}

/// Reclaims metamodel relations soft-deleted before `cutoff`: fact and
/// dimension links (columns, history partitions, blob lookups, then the link
/// rows), consumers, and user indexes.
#[tracing::instrument(skip_all, fields(data_series_id = %info.data_series_id, %cutoff), err)]
pub async fn prune_metamodel<C: ConnectionTrait>(
    db: &C,
    series: &data_series::Model,
    info: &DataSeriesQueryInfo,
    blobs: &dyn BlobStorage,
    cutoff: DateTime<Utc>,
) -> Result<u64, ServiceError> {
    let schema = &info.schema_name;
    let backend = info.backend;
    let mut reclaimed = 0u64;

    let dead_fact_links = data_series_facts::Entity::find()
        .filter(data_series_facts::Column::DataSeriesId.eq(series.id))
        .filter(data_series_facts::Column::DeletedAt.lt(cutoff))
        .find_also_related(dataseries_entity::facts::Entity)
        .all(db)
        .await?;
    for (link, fact) in dead_fact_links {
        if backend.has_wide_table() {
            physical::drop_column(
                db,
                schema,
                &physical::mat_table_name(series.id),
                &link.column_name,
            )
            .await?;
        }
        if backend.has_flat_history() {
            physical::drop_column(
                db,
                schema,
                &physical::flat_table_name(series.id),
                &link.column_name,
            )
            .await?;
        }
        if backend.has_fact_history() {
            if let Some(fact) = fact {
                physical::drop_history_partition(
                    db,
                    schema,
                    series.id,
                    HistRelation::Fact(fact.kind.into()),
                    link.id,
                )
                .await?;
            }
        }
        for key in file_lookups::take_for_link(db, link.id).await? {
            blobs.delete(&key).await?;
        }
        data_series_facts::Entity::delete_by_id(link.id).exec(db).await?;
        reclaimed += 1;
    }

    let dead_dimensions = dimensions::Entity::find()
        .filter(dimensions::Column::DataSeriesId.eq(series.id))
        .filter(dimensions::Column::DeletedAt.lt(cutoff))
        .all(db)
        .await?;
    for link in dead_dimensions {
        if backend.has_wide_table() {
            physical::drop_column(
                db,
                schema,
                &physical::mat_table_name(series.id),
                &link.column_name,
            )
            .await?;
        }
        if backend.has_flat_history() {
            physical::drop_column(
                db,
                schema,
                &physical::flat_table_name(series.id),
                &link.column_name,
            )
            .await?;
        }
        if backend.has_fact_history() {
            physical::drop_history_partition(
                db,
                schema,
                series.id,
                HistRelation::Dimension,
                link.id,
            )
            .await?;
        }
        dimensions::Entity::delete_by_id(link.id).exec(db).await?;
        reclaimed += 1;
    }

    let dead_consumers = consumers::Entity::find()
        .filter(consumers::Column::DataSeriesId.eq(series.id))
        .filter(consumers::Column::DeletedAt.lt(cutoff))
        .all(db)
        .await?;
    for consumer in dead_consumers {
        consumers::Entity::delete_by_id(consumer.id).exec(db).await?;
        reclaimed += 1;
    }

    let dead_indexes = user_indexes::Entity::find()
        .filter(user_indexes::Column::DataSeriesId.eq(series.id))
        .filter(user_indexes::Column::DeletedAt.lt(cutoff))
        .all(db)
        .await?;
    for index in dead_indexes {
        // already dropped at soft-delete time; a repeated drop is a no-op
        physical::drop_user_index(
            db,
            schema,
            &physical::user_index_name(series.id, &index.name),
        )
        .await?;
        user_indexes::Entity::delete_by_id(index.id).exec(db).await?;
        reclaimed += 1;
    }
    Ok(reclaimed)
}
