use crate::{
    error::ServiceError,
    types::{NewDataPoint, VersionStamp},
};
use chrono::{Duration, Utc};
use dataseries_entity::{
    sea_orm_active_enums::StagedBatchStatusType,
    staged_batches::{ActiveModel, Column, Entity, Model},
};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
    QueryOrder,
};
use uuid::Uuid;

/// Stages a validated batch in the caller's transaction. The outbox task
/// picks it up after commit, keyed by the returned id.
pub async fn insert_pending<C: ConnectionTrait>(
    db: &C,
    data_series_id: Uuid,
    batch: &[NewDataPoint],
    stamp: VersionStamp,
) -> Result<Uuid, ServiceError> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    ActiveModel {
        id: Set(id),
        data_series_id: Set(data_series_id),
        payload: Set(serde_json::to_value(batch).map_err(anyhow::Error::from)?),
        point_in_time: Set(stamp.point_in_time),
        sub_clock: Set(stamp.sub_clock),
        status: Set(StagedBatchStatusType::Pending),
        error: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await?;
    Ok(id)
}

pub async fn get<C: ConnectionTrait>(db: &C, id: Uuid) -> Result<Model, ServiceError> {
    Entity::find_by_id(id)
        .one(db)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("staged batch {id}")))
}

pub async fn mark_done<C: ConnectionTrait>(db: &C, model: Model) -> Result<(), ServiceError> {
    let mut active: ActiveModel = model.into();
    active.status = Set(StagedBatchStatusType::Done);
    active.updated_at = Set(Utc::now());
    active.update(db).await?;
    Ok(())
}

pub async fn mark_failed<C: ConnectionTrait>(
    db: &C,
    model: Model,
    error: String,
) -> Result<(), ServiceError> {
    let mut active: ActiveModel = model.into();
    active.status = Set(StagedBatchStatusType::Failed);
    active.error = Set(Some(error));
    active.updated_at = Set(Utc::now());
    active.update(db).await?;
    Ok(())
}

/// Pending batches whose task never ran (crash between commit and enqueue).
pub async fn list_stuck<C: ConnectionTrait>(
    db: &C,
    stuck_after_secs: u64,
) -> Result<Vec<Model>, ServiceError> {
    let cutoff = Utc::now() - Duration::seconds(stuck_after_secs as i64);
    Ok(Entity::find()
        .filter(Column::Status.eq(StagedBatchStatusType::Pending))
        .filter(Column::CreatedAt.lt(cutoff))
        .order_by_asc(Column::CreatedAt)
        .all(db)
        .await?)
}
