use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "item_migration"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Items::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Items::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Items::ChrtId).big_integer().not_null())
                    .col(ColumnDef::new(Items::Price).big_integer().not_null())
                    .col(ColumnDef::new(Items::Rid).string().not_null())
                    .col(ColumnDef::new(Items::Name).string().not_null())
                    .col(ColumnDef::new(Items::Sale).integer().not_null())
                    .col(ColumnDef::new(Items::Size).string().not_null())
                    .col(ColumnDef::new(Items::TotalPrice).big_integer().not_null())
                    .col(ColumnDef::new(Items::NmId).big_integer().not_null())
                    .col(ColumnDef::new(Items::Brand).string().not_null())
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager.drop_table(Table::drop().table(Items::Table).to_owned()).await
    }
}

#[derive(Iden)]
enum Items {
    Table,
    Id,
    ChrtId,
    Price,
    Rid,
    Name,
    Sale,
    Size,
    TotalPrice,
    NmId,
    Brand,
}
