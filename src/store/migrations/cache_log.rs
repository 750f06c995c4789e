use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "cache_log_migration"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // order_id carries no foreign key: rows of evicted or vanished orders are harmless and only ever read back
        // through the LIMIT of the recovery query.
        manager
            .create_table(
                Table::create()
                    .table(CacheLog::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CacheLog::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CacheLog::OrderId).big_integer().not_null())
                    .col(ColumnDef::new(CacheLog::AppKey).string().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-cache_log-app_key-id")
                    .table(CacheLog::Table)
                    .col(CacheLog::AppKey)
                    .col(CacheLog::Id)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager.drop_table(Table::drop().table(CacheLog::Table).to_owned()).await
    }
}

#[derive(Iden)]
enum CacheLog {
    Table,
    Id,
    OrderId,
    AppKey,
}
