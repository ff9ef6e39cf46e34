use crate::{error::ServiceError, types::Backend};
use chrono::Utc;
use dataseries_entity::data_series::{ActiveModel, Column, Entity, Model};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
    QuerySelect,
};
use uuid::Uuid;

/// Live series only; soft-deleted rows resolve as not-found.
pub async fn get_alive<C: ConnectionTrait>(
    db: &C,
    tenant_id: Uuid,
    data_series_id: Uuid,
) -> Result<Model, ServiceError> {
    Entity::find_by_id(data_series_id)
        .filter(Column::TenantId.eq(tenant_id))
        .filter(Column::DeletedAt.is_null())
        .one(db)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("data series {data_series_id}")))
}

/// Soft-deleted rows included; used by nuke and operator tooling.
pub async fn get_any<C: ConnectionTrait>(
    db: &C,
    tenant_id: Uuid,
    data_series_id: Uuid,
) -> Result<Model, ServiceError> {
    Entity::find_by_id(data_series_id)
        .filter(Column::TenantId.eq(tenant_id))
        .one(db)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("data series {data_series_id}")))
}

pub async fn find_by_external_id<C: ConnectionTrait>(
    db: &C,
    tenant_id: Uuid,
    external_id: &str,
) -> Result<Option<Model>, ServiceError> {
    Ok(Entity::find()
        .filter(Column::TenantId.eq(tenant_id))
        .filter(Column::ExternalId.eq(external_id))
        .filter(Column::DeletedAt.is_null())
        .one(db)
        .await?)
}

/// Row-level lock for migration tasks. Blocks other migrations of the same
/// series without touching unrelated ones.
pub async fn lock_for_update<C: ConnectionTrait>(
    db: &C,
    tenant_id: Uuid,
    data_series_id: Uuid,
) -> Result<Model, ServiceError> {
    Entity::find_by_id(data_series_id)
        .filter(Column::TenantId.eq(tenant_id))
        .filter(Column::DeletedAt.is_null())
        .lock_exclusive()
        .one(db)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("data series {data_series_id}")))
}

pub async fn set_locked<C: ConnectionTrait>(
    db: &C,
    model: Model,
    locked: bool,
) -> Result<Model, ServiceError> {
    let mut active: ActiveModel = model.into();
    active.locked = Set(locked);
    active.updated_at = Set(Utc::now());
    Ok(active.update(db).await?)
}

pub async fn flip_backend_and_unlock<C: ConnectionTrait>(
    db: &C,
    model: Model,
    backend: Backend,
) -> Result<Model, ServiceError> {
    let mut active: ActiveModel = model.into();
    active.backend = Set(backend.into());
    active.locked = Set(false);
    active.updated_at = Set(Utc::now());
    Ok(active.update(db).await?)
}

pub async fn soft_delete<C: ConnectionTrait>(db: &C, model: Model) -> Result<Model, ServiceError> {
    let mut active: ActiveModel = model.into();
    active.deleted_at = Set(Some(Utc::now()));
    active.updated_at = Set(Utc::now());
    Ok(active.update(db).await?)
}

pub async fn hard_delete<C: ConnectionTrait>(db: &C, data_series_id: Uuid) -> Result<(), ServiceError> {
    Entity::delete_by_id(data_series_id).exec(db).await?;
    Ok(())
}
