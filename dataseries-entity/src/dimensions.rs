use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "dimensions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub data_series_id: Uuid,
    pub reference_data_series_id: Uuid,
    pub external_id: String,
    pub name: String,
    pub column_name: String,
    pub optional: bool,
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
}

impl Related<super::data_series::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DataSeries.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
