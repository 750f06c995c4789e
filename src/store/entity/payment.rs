use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "payments")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id:            i64,
    pub transaction:   String,
    pub currency:      String,
    pub provider:      String,
    pub amount:        i64,
    pub payment_dt:    i64,
    pub bank:          String,
    pub delivery_cost: i64,
    pub goods_total:   i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
