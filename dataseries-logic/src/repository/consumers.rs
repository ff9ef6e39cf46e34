use crate::error::ServiceError;
use dataseries_entity::consumers::{Column, Entity, Model};
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use uuid::Uuid;

pub async fn alive_for_series<C: ConnectionTrait>(
    db: &C,
    data_series_id: Uuid,
) -> Result<Vec<Model>, ServiceError> {
    Ok(Entity::find()
        .filter(Column::DataSeriesId.eq(data_series_id))
        .filter(Column::DeletedAt.is_null())
        .all(db)
        .await?)
}
