use crate::error::ServiceError;
use chrono::{DateTime, Utc};
use dataseries_entity::file_lookups::{ActiveModel, Column, Entity, Model};
use sea_orm::{
    ColumnTrait, ConnectionTrait, EntityTrait, FromQueryResult, QueryFilter, Statement,
};
use uuid::Uuid;

pub async fn insert_many<C: ConnectionTrait>(
    db: &C,
    models: Vec<ActiveModel>,
) -> Result<(), ServiceError> {
    if models.is_empty() {
        return Ok(());
    }
    Entity::insert_many(models).exec_without_returning(db).await?;
    Ok(())
}

/// Removes and returns all lookups of one fact/dimension link. The returned
/// keys are handed to blob deletion.
pub async fn take_for_link<C: ConnectionTrait>(
    db: &C,
    fact_link_id: Uuid,
) -> Result<Vec<String>, ServiceError> {
    let rows: Vec<Model> = Entity::find()
        .filter(Column::FactLinkId.eq(fact_link_id))
        .all(db)
        .await?;
    Entity::delete_many()
        .filter(Column::FactLinkId.eq(fact_link_id))
        .exec(db)
        .await?;
    Ok(rows.into_iter().map(|m| m.blob_key).collect())
}

/// Removes every lookup of the given points, returning their keys. Only for
/// points whose last remaining version row just went away.
pub async fn take_for_points<C: ConnectionTrait>(
    db: &C,
    data_series_id: Uuid,
    point_ids: &[Uuid],
) -> Result<Vec<String>, ServiceError> {
    if point_ids.is_empty() {
        return Ok(vec![]);
    }
    let rows: Vec<Model> = Entity::find()
        .filter(Column::DataSeriesId.eq(data_series_id))
        .filter(Column::DataPointId.is_in(point_ids.to_vec()))
        .all(db)
        .await?;
    Entity::delete_many()
        .filter(Column::DataSeriesId.eq(data_series_id))
        .filter(Column::DataPointId.is_in(point_ids.to_vec()))
        .exec(db)
        .await?;
    Ok(rows.into_iter().map(|m| m.blob_key).collect())
}

pub async fn take_for_series<C: ConnectionTrait>(
    db: &C,
    data_series_id: Uuid,
) -> Result<Vec<String>, ServiceError> {
    let rows: Vec<Model> = Entity::find()
        .filter(Column::DataSeriesId.eq(data_series_id))
        .all(db)
        .await?;
    Entity::delete_many()
        .filter(Column::DataSeriesId.eq(data_series_id))
        .exec(db)
        .await?;
    Ok(rows.into_iter().map(|m| m.blob_key).collect())
}

#[derive(FromQueryResult)]
struct BlobKeyRow {
    blob_key: String,
}

/// Removes lookups matching exact superseded versions, returning their keys.
pub async fn take_versions<C: ConnectionTrait>(
    db: &C,
    data_series_id: Uuid,
    versions: &[(Uuid, DateTime<Utc>, i64)],
) -> Result<Vec<String>, ServiceError> {
    if versions.is_empty() {
        return Ok(vec![]);
    }
    let mut params: Vec<sea_orm::Value> = vec![data_series_id.into()];
    let mut tuples = Vec::with_capacity(versions.len());
    for (data_point_id, point_in_time, sub_clock) in versions {
        let base = params.len();
        params.push((*data_point_id).into());
        params.push((*point_in_time).into());
        params.push((*sub_clock).into());
        tuples.push(format!("(${}, ${}, ${})", base + 1, base + 2, base + 3));
    }
    let sql = format!(
        "DELETE FROM \"file_lookups\" \
         WHERE \"data_series_id\" = $1 \
         AND (\"data_point_id\", \"point_in_time\", \"sub_clock\") IN ({}) \
         RETURNING \"blob_key\"",
        tuples.join(", ")
    );
    let rows = BlobKeyRow::find_by_statement(Statement::from_sql_and_values(
        db.get_database_backend(),
        sql,
        params,
    ))
    .all(db)
    .await?;
    Ok(rows.into_iter().map(|r| r.blob_key).collect())
}
