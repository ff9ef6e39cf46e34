use sea_orm::entity::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Copy, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "backend_type")]
pub enum BackendType {
    #[sea_orm(string_value = "v1")]
    V1,
    #[sea_orm(string_value = "materialized")]
    Materialized,
    #[sea_orm(string_value = "no_history")]
    NoHistory,
    #[sea_orm(string_value = "materialized_flat_history")]
    MaterializedFlatHistory,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Copy, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "fact_kind_type")]
pub enum FactKindType {
    #[sea_orm(string_value = "float")]
    Float,
    #[sea_orm(string_value = "string")]
    String,
    #[sea_orm(string_value = "text")]
    Text,
    #[sea_orm(string_value = "timestamp")]
    Timestamp,
    #[sea_orm(string_value = "image")]
    Image,
    #[sea_orm(string_value = "file")]
    File,
    #[sea_orm(string_value = "json")]
    Json,
    #[sea_orm(string_value = "boolean")]
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Copy, EnumIter, DeriveActiveEnum)]
#[sea_orm(
    rs_type = "String",
    db_type = "Enum",
    enum_name = "staged_batch_status_type"
)]
pub enum StagedBatchStatusType {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "done")]
    Done,
    #[sea_orm(string_value = "failed")]
    Failed,
}
