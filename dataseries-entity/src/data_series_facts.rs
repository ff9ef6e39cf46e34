use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "data_series_facts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub data_series_id: Uuid,
    pub fact_id: Uuid,
    pub external_id: String,
    pub column_name: String,
    pub deleted_at: Option<DateTimeUtc>,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::data_series::Entity",
        from = "Column::DataSeriesId",
        to = "super::data_series::Column::Id"
    )]
    DataSeries,
    #[sea_orm(
        belongs_to = "super::facts::Entity",
        from = "Column::FactId",
        to = "super::facts::Column::Id"
    )]
    Facts,
}

impl Related<super::data_series::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DataSeries.def()
    }
}

impl Related<super::facts::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Facts.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
