use crate::error::ServiceError;
use chrono::Utc;
use dataseries_entity::data_points::{ActiveModel, Column, Entity};
use sea_orm::{
    sea_query::OnConflict, ActiveValue::Set, ColumnTrait, ConnectionTrait, EntityTrait,
    QueryFilter,
};
use uuid::Uuid;

/// Registers identities for a batch. Ids are deterministic, so re-inserting
/// an existing identity is a no-op.
pub async fn ensure_many<C: ConnectionTrait>(
    db: &C,
    data_series_id: Uuid,
    points: impl IntoIterator<Item = (Uuid, String)>,
) -> Result<(), ServiceError> {
    let now = Utc::now();
    let models: Vec<ActiveModel> = points
        .into_iter()
        .map(|(id, external_id)| ActiveModel {
            id: Set(id),
            data_series_id: Set(data_series_id),
            external_id: Set(external_id),
            created_at: Set(now),
        })
        .collect();
    if models.is_empty() {
        return Ok(());
    }
    Entity::insert_many(models)
        .on_conflict(OnConflict::column(Column::Id).do_nothing().to_owned())
        .exec_without_returning(db)
        .await?;
    Ok(())
}

/// Which of the given identities are already registered. Callers use the
/// difference to tell creations from updates.
pub async fn existing_ids<C: ConnectionTrait>(
    db: &C,
    data_series_id: Uuid,
    ids: &[Uuid],
) -> Result<Vec<Uuid>, ServiceError> {
    if ids.is_empty() {
        return Ok(vec![]);
    }
    Ok(Entity::find()
        .filter(Column::DataSeriesId.eq(data_series_id))
        .filter(Column::Id.is_in(ids.iter().copied()))
        .all(db)
        .await?
        .into_iter()
        .map(|m| m.id)
        .collect())
}

pub async fn delete_for_series<C: ConnectionTrait>(
    db: &C,
    data_series_id: Uuid,
) -> Result<u64, ServiceError> {
    let res = Entity::delete_many()
        .filter(Column::DataSeriesId.eq(data_series_id))
        .exec(db)
        .await?;
    Ok(res.rows_affected)
}
