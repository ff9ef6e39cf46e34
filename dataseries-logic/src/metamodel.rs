//! Metamodel management: data series lifecycle, fact/dimension attachment,
//! consumers and user-defined indexes. Structural DDL runs here, always
//! derived from the deterministic naming in [`crate::physical`] and always
//! idempotent, so a retried task never half-applies.

use crate::{
    error::{ServiceError, ValidationError},
    physical::{self, HistRelation},
    repository::data_series as data_series_repo,
    types::{Backend, FactKind},
};
use chrono::Utc;
use dataseries_entity::{
    consumers, data_series, data_series_facts, dimensions, facts, user_indexes,
};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct NewDataSeries {
    pub external_id: String,
    pub name: String,
    pub backend: Backend,
    pub allow_extra_fields: bool,
}

pub async fn create_data_series<C: ConnectionTrait>(
    db: &C,
    tenant_id: Uuid,
    input: NewDataSeries,
) -> Result<data_series::Model, ServiceError> {
    if data_series_repo::find_by_external_id(db, tenant_id, &input.external_id)
        .await?
        .is_some()
    {
        return Err(ServiceError::Conflict(format!(
            "data series '{}' already exists",
            input.external_id
        )));
    }
    let now = Utc::now();
    let series = data_series::ActiveModel {
        id: Set(Uuid::new_v4()),
        tenant_id: Set(tenant_id),
        external_id: Set(input.external_id),
        name: Set(input.name),
        backend: Set(input.backend.into()),
        locked: Set(false),
        allow_extra_fields: Set(input.allow_extra_fields),
        deleted_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await?;
    ensure_physical_structures(db, &series).await?;
    Ok(series)
}

/// Creates every table the series' backend needs. Safe to re-run; migration
/// tasks call this for the destination backend before copying data.
pub async fn ensure_physical_structures<C: ConnectionTrait>(
    db: &C,
    series: &data_series::Model,
) -> Result<(), ServiceError> {
    let backend = Backend::from(series.backend);
    let schema = physical::tenant_schema(series.tenant_id);
    physical::create_tenant_schema(db, &schema).await?;
    if backend.has_wide_table() {
        physical::create_wide_table(db, &schema, series.id).await?;
    }
    if backend.has_fact_history() {
        physical::create_history_tables(db, &schema, series.id).await?;
    }
    if backend.has_flat_history() {
        physical::create_flat_table(db, &schema, series.id).await?;
    }
    Ok(())
}

/// Marks the series deleted. Physical tables and identities survive until a
/// nuke task reclaims them; until then the series resolves as not-found.
pub async fn soft_delete_data_series<C: ConnectionTrait>(
    db: &C,
    series: data_series::Model,
) -> Result<data_series::Model, ServiceError> {
    if series.locked {
        return Err(ServiceError::Locked);
    }
    data_series_repo::soft_delete(db, series).await
}

pub async fn create_fact<C: ConnectionTrait>(
    db: &C,
    name: String,
    kind: FactKind,
    optional: bool,
) -> Result<facts::Model, ServiceError> {
    Ok(facts::ActiveModel {
        id: Set(Uuid::new_v4()),
        kind: Set(kind.into()),
        name: Set(name),
        optional: Set(optional),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await?)
}

/// Attaches a fact under the given external id. The physical column name is
/// computed from the fresh link id and stored on the link row, so renaming
/// the external id later never touches the column.
pub async fn attach_fact<C: ConnectionTrait>(
    db: &C,
    series: &data_series::Model,
    fact_id: Uuid,
    external_id: String,
) -> Result<data_series_facts::Model, ServiceError> {
    if series.locked {
        return Err(ServiceError::Locked);
    }
    ensure_field_free(db, series.id, &external_id).await?;
    let fact = facts::Entity::find_by_id(fact_id)
        .one(db)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("fact {fact_id}")))?;
    let kind = FactKind::from(fact.kind);

    let link_id = Uuid::new_v4();
    let column_name = physical::fact_column_name(link_id, &external_id);
    let link = data_series_facts::ActiveModel {
        id: Set(link_id),
        data_series_id: Set(series.id),
        fact_id: Set(fact_id),
        external_id: Set(external_id),
        column_name: Set(column_name.clone()),
        deleted_at: Set(None),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await?;

    let backend = Backend::from(series.backend);
    let schema = physical::tenant_schema(series.tenant_id);
    if backend.has_wide_table() {
        physical::add_column(
            db,
            &schema,
            &physical::mat_table_name(series.id),
            &column_name,
            kind.sql_type(),
        )
        .await?;
    }
    if backend.has_flat_history() {
        physical::add_column(
            db,
            &schema,
            &physical::flat_table_name(series.id),
            &column_name,
            kind.sql_type(),
        )
        .await?;
    }
    if backend.has_fact_history() {
        physical::create_history_partition(
            db,
            &schema,
            series.id,
            HistRelation::Fact(kind),
            link_id,
        )
        .await?;
    }
    Ok(link)
}

/// External-id rename. The stored column name is untouched, so neither data
/// nor indexes move.
pub async fn rename_fact_link<C: ConnectionTrait>(
    db: &C,
    series: &data_series::Model,
    link: data_series_facts::Model,
    new_external_id: String,
) -> Result<data_series_facts::Model, ServiceError> {
    if link.external_id != new_external_id {
        ensure_field_free(db, series.id, &new_external_id).await?;
    }
    let mut active: data_series_facts::ActiveModel = link.into();
    active.external_id = Set(new_external_id);
    Ok(active.update(db).await?)
}

/// Soft-detaches the link. The column, partition and blobs are reclaimed by
/// the metamodel prune task once the retention window passes.
pub async fn detach_fact<C: ConnectionTrait>(
    db: &C,
    series: &data_series::Model,
    link: data_series_facts::Model,
) -> Result<data_series_facts::Model, ServiceError> {
    if series.locked {
        return Err(ServiceError::Locked);
    }
    let mut active: data_series_facts::ActiveModel = link.into();
    active.deleted_at = Set(Some(Utc::now()));
    Ok(active.update(db).await?)
}

#[derive(Clone, Debug)]
pub struct NewDimension {
    pub reference_data_series_id: Uuid,
    pub external_id: String,
    pub name: String,
    pub optional: bool,
}

pub async fn attach_dimension<C: ConnectionTrait>(
    db: &C,
    series: &data_series::Model,
    input: NewDimension,
) -> Result<dimensions::Model, ServiceError> {
    if series.locked {
        return Err(ServiceError::Locked);
    }
    ensure_field_free(db, series.id, &input.external_id).await?;
    data_series_repo::get_alive(db, series.tenant_id, input.reference_data_series_id).await?;

    let link_id = Uuid::new_v4();
    let column_name = physical::dimension_column_name(link_id, &input.external_id);
    let link = dimensions::ActiveModel {
        id: Set(link_id),
        data_series_id: Set(series.id),
        reference_data_series_id: Set(input.reference_data_series_id),
        external_id: Set(input.external_id),
        name: Set(input.name),
        column_name: Set(column_name.clone()),
        optional: Set(input.optional),
        deleted_at: Set(None),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await?;

    let backend = Backend::from(series.backend);
    let schema = physical::tenant_schema(series.tenant_id);
    if backend.has_wide_table() {
        physical::add_column(
            db,
            &schema,
            &physical::mat_table_name(series.id),
            &column_name,
            "uuid",
        )
        .await?;
    }
    if backend.has_flat_history() {
        physical::add_column(
            db,
            &schema,
            &physical::flat_table_name(series.id),
            &column_name,
            "uuid",
        )
        .await?;
    }
    if backend.has_fact_history() {
        physical::create_history_partition(db, &schema, series.id, HistRelation::Dimension, link_id)
            .await?;
    }
    Ok(link)
}

pub async fn detach_dimension<C: ConnectionTrait>(
    db: &C,
    series: &data_series::Model,
    link: dimensions::Model,
) -> Result<dimensions::Model, ServiceError> {
    if series.locked {
        return Err(ServiceError::Locked);
    }
    let mut active: dimensions::ActiveModel = link.into();
    active.deleted_at = Set(Some(Utc::now()));
    Ok(active.update(db).await?)
}

/// How an in-place change request maps onto the physical layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeAction {
    /// Metadata-only; applied directly.
    Update,
    /// The physical structure must be rebuilt; requires explicit acceptance
    /// because stored references are discarded.
    Recreate,
}

#[derive(Clone, Debug)]
pub struct DimensionChange {
    pub reference_data_series_id: Uuid,
    pub name: String,
    pub optional: bool,
}

pub fn plan_dimension_change(current: &dimensions::Model, change: &DimensionChange) -> ChangeAction {
    if current.reference_data_series_id != change.reference_data_series_id {
        ChangeAction::Recreate
    } else {
        ChangeAction::Update
    }
}

/// Applies a dimension change. A retargeted reference invalidates every
/// stored id, so that path soft-detaches the old link and attaches a fresh
/// one, and only runs with `accept`.
pub async fn apply_dimension_change<C: ConnectionTrait>(
    db: &C,
    series: &data_series::Model,
    link: dimensions::Model,
    change: DimensionChange,
    accept: bool,
) -> Result<(ChangeAction, dimensions::Model), ServiceError> {
    match plan_dimension_change(&link, &change) {
        ChangeAction::Update => {
            let mut active: dimensions::ActiveModel = link.into();
            active.name = Set(change.name);
            active.optional = Set(change.optional);
            Ok((ChangeAction::Update, active.update(db).await?))
        }
        ChangeAction::Recreate => {
            if !accept {
                return Err(ValidationError::NotAccepted.into());
            }
            let external_id = link.external_id.clone();
            detach_dimension(db, series, link).await?;
            let fresh = attach_dimension(
                db,
                series,
                NewDimension {
                    reference_data_series_id: change.reference_data_series_id,
                    external_id,
                    name: change.name,
                    optional: change.optional,
                },
            )
            .await?;
            Ok((ChangeAction::Recreate, fresh))
        }
    }
}

pub async fn add_consumer<C: ConnectionTrait>(
    db: &C,
    series: &data_series::Model,
    name: String,
    endpoint: String,
) -> Result<consumers::Model, ServiceError> {
    Ok(consumers::ActiveModel {
        id: Set(Uuid::new_v4()),
        data_series_id: Set(series.id),
        name: Set(name),
        endpoint: Set(endpoint),
        deleted_at: Set(None),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await?)
}

pub async fn remove_consumer<C: ConnectionTrait>(
    db: &C,
    consumer: consumers::Model,
) -> Result<consumers::Model, ServiceError> {
    let mut active: consumers::ActiveModel = consumer.into();
    active.deleted_at = Set(Some(Utc::now()));
    Ok(active.update(db).await?)
}

/// Resolves field external ids to physical columns and creates the index on
/// the wide table. V1 keeps the definition but has no table to index; the
/// index materializes on migration.
pub async fn create_user_index<C: ConnectionTrait>(
    db: &C,
    series: &data_series::Model,
    info: &crate::query_info::DataSeriesQueryInfo,
    name: String,
    targets: Vec<String>,
) -> Result<user_indexes::Model, ServiceError> {
    if series.locked {
        return Err(ServiceError::Locked);
    }
    let columns = resolve_index_columns(info, &targets)?;
    let model = user_indexes::ActiveModel {
        id: Set(Uuid::new_v4()),
        data_series_id: Set(series.id),
        name: Set(name.clone()),
        targets: Set(serde_json::to_value(&targets).map_err(anyhow::Error::from)?),
        deleted_at: Set(None),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await?;

    if Backend::from(series.backend).has_wide_table() {
        let schema = physical::tenant_schema(series.tenant_id);
        physical::create_user_index(
            db,
            &schema,
            &physical::mat_table_name(series.id),
            &physical::user_index_name(series.id, &name),
            &columns,
        )
        .await?;
    }
    Ok(model)
}

pub async fn drop_user_index<C: ConnectionTrait>(
    db: &C,
    series: &data_series::Model,
    index: user_indexes::Model,
) -> Result<(), ServiceError> {
    let schema = physical::tenant_schema(series.tenant_id);
    physical::drop_user_index(
        db,
        &schema,
        &physical::user_index_name(series.id, &index.name),
    )
    .await?;
    let mut active: user_indexes::ActiveModel = index.into();
    active.deleted_at = Set(Some(Utc::now()));
    active.update(db).await?;
    Ok(())
}

pub fn plan_index_change(current: &user_indexes::Model, new_targets: &[String]) -> ChangeAction {
    let current_targets: Vec<String> =
        serde_json::from_value(current.targets.clone()).unwrap_or_default();
    if current_targets != new_targets {
        ChangeAction::Recreate
    } else {
        ChangeAction::Update
    }
}

pub async fn apply_index_change<C: ConnectionTrait>(
    db: &C,
    series: &data_series::Model,
    info: &crate::query_info::DataSeriesQueryInfo,
    index: user_indexes::Model,
    new_name: String,
    new_targets: Vec<String>,
    accept: bool,
) -> Result<(ChangeAction, user_indexes::Model), ServiceError> {
    match plan_index_change(&index, &new_targets) {
        ChangeAction::Update => {
            let schema = physical::tenant_schema(series.tenant_id);
            if index.name != new_name && Backend::from(series.backend).has_wide_table() {
                // renaming keeps the index; only the catalog name moves
                physical::drop_user_index(
                    db,
                    &schema,
                    &physical::user_index_name(series.id, &index.name),
                )
                .await?;
                let columns = resolve_index_columns(info, &new_targets)?;
                physical::create_user_index(
                    db,
                    &schema,
                    &physical::mat_table_name(series.id),
                    &physical::user_index_name(series.id, &new_name),
                    &columns,
                )
                .await?;
            }
            let mut active: user_indexes::ActiveModel = index.into();
            active.name = Set(new_name);
            Ok((ChangeAction::Update, active.update(db).await?))
        }
        ChangeAction::Recreate => {
            if !accept {
                return Err(ValidationError::NotAccepted.into());
            }
            drop_user_index(db, series, index).await?;
            let fresh = create_user_index(db, series, info, new_name, new_targets).await?;
            Ok((ChangeAction::Recreate, fresh))
        }
    }
}

fn resolve_index_columns(
    info: &crate::query_info::DataSeriesQueryInfo,
    targets: &[String],
) -> Result<Vec<String>, ServiceError> {
    if targets.is_empty() {
        return Err(ValidationError::InvalidValue {
            field: "targets".to_string(),
            message: "index needs at least one field".to_string(),
        }
        .into());
    }
    let mut columns = Vec::with_capacity(targets.len());
    let mut unknown = Vec::new();
    for target in targets {
        match info.field(target) {
            Some(key) => columns.push(key.column_name),
            None => unknown.push(target.clone()),
        }
    }
    if !unknown.is_empty() {
        return Err(ValidationError::UnknownFields(unknown).into());
    }
    Ok(columns)
}

/// A field external id must be unique across facts and dimensions of the
/// series, counting only alive links.
async fn ensure_field_free<C: ConnectionTrait>(
    db: &C,
    data_series_id: Uuid,
    external_id: &str,
) -> Result<(), ServiceError> {
    let fact_taken = data_series_facts::Entity::find()
        .filter(data_series_facts::Column::DataSeriesId.eq(data_series_id))
        .filter(data_series_facts::Column::ExternalId.eq(external_id))
        .filter(data_series_facts::Column::DeletedAt.is_null())
        .one(db)
        .await?
        .is_some();
    let dimension_taken = dimensions::Entity::find()
        .filter(dimensions::Column::DataSeriesId.eq(data_series_id))
        .filter(dimensions::Column::ExternalId.eq(external_id))
        .filter(dimensions::Column::DeletedAt.is_null())
        .one(db)
        .await?
        .is_some();
    if fact_taken || dimension_taken {
        return Err(ServiceError::Conflict(format!(
            "field '{external_id}' is already attached"
        )));
    }
    Ok(())
}
