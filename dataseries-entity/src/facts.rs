use super::sea_orm_active_enums::FactKindType;
use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "facts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub kind: FactKindType,
    pub name: String,
    pub optional: bool,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::data_series_facts::Entity")]
    DataSeriesFacts,
}

impl Related<super::data_series_facts::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DataSeriesFacts.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
