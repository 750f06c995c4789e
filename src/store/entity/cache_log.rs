use sea_orm::entity::prelude::*;

/// One cache admission. `id` orders the rows chronologically.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "cache_log")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id:       i64,
    pub order_id: i64,
    pub app_key:  String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
