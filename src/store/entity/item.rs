use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "items")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id:          i64,
    pub chrt_id:     i64,
    pub price:       i64,
    pub rid:         String,
    pub name:        String,
    pub sale:        i32,
    pub size:        String,
    pub total_price: i64,
    pub nm_id:       i64,
    pub brand:       String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
