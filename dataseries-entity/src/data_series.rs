use super::sea_orm_active_enums::BackendType;
use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "data_series")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub external_id: String,
    pub name: String,
    pub backend: BackendType,
    pub locked: bool,
    pub allow_extra_fields: bool,
    pub deleted_at: Option<DateTimeUtc>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::data_series_facts::Entity")]
    DataSeriesFacts,
    #[sea_orm(has_many = "super::dimensions::Entity")]
    Dimensions,
    #[sea_orm(has_many = "super::data_points::Entity")]
    DataPoints,
    #[sea_orm(has_many = "super::consumers::Entity")]
    Consumers,
}

impl Related<super::data_series_facts::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DataSeriesFacts.def()
    }
}

impl Related<super::dimensions::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Dimensions.def()
    }
}

impl Related<super::data_points::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DataPoints.def()
    }
}

impl Related<super::consumers::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Consumers.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
