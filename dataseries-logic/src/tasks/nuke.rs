//! Irreversible removal of a soft-deleted data series: every physical table,
//! identity, blob and metamodel row goes. Refuses to touch a series that is
//! still alive.

use crate::{
    blob::BlobStorage,
    error::ServiceError,
    physical,
    repository::{data_points, data_series as data_series_repo, file_lookups},
    types::Backend,
};
use dataseries_entity::{
    consumers, data_series_facts, dimensions, staged_batches, user_indexes,
};
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use uuid::Uuid;

#[tracing::instrument(skip(db, blobs), err)]
pub async fn nuke_data_series<C: ConnectionTrait>(
    db: &C,
    tenant_id: Uuid,
    data_series_id: Uuid,
    blobs: &dyn BlobStorage,
) -> Result<(), ServiceError> {
    let series = data_series_repo::get_any(db, tenant_id, data_series_id).await?;
    if series.deleted_at.is_none() {
        return Err(ServiceError::Conflict(format!(
            "data series {data_series_id} is not deleted; soft-delete it first"
        )));
    }
    let backend = Backend::from(series.backend);
    let schema = physical::tenant_schema(series.tenant_id);

    if backend.has_wide_table() {
        physical::drop_table(db, &schema, &physical::mat_table_name(series.id)).await?;
    }
    if backend.has_flat_history() {
        physical::drop_table(db, &schema, &physical::flat_table_name(series.id)).await?;
    }
    if backend.has_fact_history() {
        physical::drop_history_tables(db, &schema, series.id).await?;
    }
    for index in user_indexes::Entity::find()
        .filter(user_indexes::Column::DataSeriesId.eq(series.id))
        .all(db)
        .await?
    {
        physical::drop_user_index(
            db,
            &schema,
            &physical::user_index_name(series.id, &index.name),
        )
        .await?;
    }

    for key in file_lookups::take_for_series(db, series.id).await? {
        blobs.delete(&key).await?;
    }
    data_points::delete_for_series(db, series.id).await?;

    data_series_facts::Entity::delete_many()
        .filter(data_series_facts::Column::DataSeriesId.eq(series.id))
        .exec(db)
        .await?;
    dimensions::Entity::delete_many()
        .filter(dimensions::Column::DataSeriesId.eq(series.id))
        .exec(db)
        .await?;
    consumers::Entity::delete_many()
        .filter(consumers::Column::DataSeriesId.eq(series.id))
        .exec(db)
        .await?;
    user_indexes::Entity::delete_many()
        .filter(user_indexes::Column::DataSeriesId.eq(series.id))
        .exec(db)
        .await?;
    staged_batches::Entity::delete_many()
        .filter(staged_batches::Column::DataSeriesId.eq(series.id))
        .exec(db)
        .await?;
    data_series_repo::hard_delete(db, series.id).await?;
    Ok(())
}
