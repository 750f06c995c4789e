use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "order_migration"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Orders::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Orders::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Orders::OrderUid).string().not_null())
                    .col(ColumnDef::new(Orders::Entry).string().not_null())
                    .col(ColumnDef::new(Orders::InternalSignature).string().not_null())
                    .col(ColumnDef::new(Orders::PaymentId).big_integer().not_null())
                    .col(ColumnDef::new(Orders::Locale).string().not_null())
                    .col(ColumnDef::new(Orders::CustomerId).string().not_null())
                    .col(ColumnDef::new(Orders::TrackNumber).string().not_null())
                    .col(ColumnDef::new(Orders::DeliveryService).string().not_null())
                    .col(ColumnDef::new(Orders::Shardkey).string().not_null())
                    .col(ColumnDef::new(Orders::SmId).big_integer().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-orders-payment_id")
                            .from(Orders::Table, Orders::PaymentId)
                            .to(Payments::Table, Payments::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-orders-order_uid")
                    .table(Orders::Table)
                    .col(Orders::OrderUid)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager.drop_table(Table::drop().table(Orders::Table).to_owned()).await
    }
}

#[derive(Iden)]
enum Orders {
    Table,
    Id,
    OrderUid,
    Entry,
    InternalSignature,
    PaymentId,
    Locale,
    CustomerId,
    TrackNumber,
    DeliveryService,
    Shardkey,
    SmId,
}

#[derive(Iden)]
enum Payments {
    Table,
    Id,
}
