#[cfg(feature = "pg")]
pub mod pg;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::fmt::Debug;

use async_trait::async_trait;
use sea_orm::DatabaseConnection;
use sea_orm::DbErr;
use sea_orm_migration::MigratorTrait;
use tracing::debug;

use super::Migrator;

#[async_trait]
pub trait DatabaseDriver: Debug + Sync + Send + 'static {
    fn name(&self) -> &'static str;
    fn connection(&self) -> DatabaseConnection;
    /// Backend-specific session tuning.
    async fn configure(&self) -> Result<(), DbErr>;
    async fn checkpoint(&self) -> Result<(), DbErr>;

    /// Configure the connection and bring the schema up to date.
    async fn prepare(&self) -> Result<(), DbErr> {
        self.configure().await?;
        Migrator::up(&self.connection(), None).await?;
        debug!("{} schema is up to date", self.name());
        Ok(())
    }
}
