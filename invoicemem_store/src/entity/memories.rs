use sea_orm::entity::prelude::*;

/// One row per memory. The full record lives in `payload`; the other
/// columns exist for filtering and compare-and-swap.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "memories")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub vendor_id: Option<String>,
    pub memory_type: String,
    pub confidence: f64,
    pub archived: bool,
    pub version: i64,
    #[sea_orm(column_type = "Text")]
    pub payload: String,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
