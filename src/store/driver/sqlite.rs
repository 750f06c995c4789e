use std::path::Path;

use async_trait::async_trait;
use fieldx::fxstruct;
use sea_orm::ConnectOptions;
use sea_orm::ConnectionTrait;
use sea_orm::DatabaseConnection;
use sea_orm::DbErr;
use tracing::error;
use tracing::info;

use super::DatabaseDriver;

#[derive(Debug)]
#[fxstruct(sync, no_new)]
pub struct Sqlite {
    connection: DatabaseConnection,
    #[fieldx(get(copy))]
    in_memory:  bool,
}

impl Sqlite {
    pub async fn connect(db_path: &Path) -> Result<Self, DbErr> {
        let schema = format!("sqlite://{}?mode=rwc", db_path.display());
        let mut opts = ConnectOptions::new(&schema);
        opts.sqlx_logging(false);

        let db = sea_orm::Database::connect(opts)
            .await
            .inspect_err(|e| error!("Error connecting to database {schema}: {e}"))?;
        info!("Opened SQLite database {}", db_path.display());

        Ok(Self {
            connection: db,
            in_memory:  false,
        })
    }

    /// A private in-memory database. Lives as long as its single pooled connection.
    pub async fn connect_memory() -> Result<Self, DbErr> {
        let mut opts = ConnectOptions::new("sqlite::memory:");
        opts.max_connections(1).min_connections(1).sqlx_logging(false);

        let db = sea_orm::Database::connect(opts)
            .await
            .inspect_err(|e| error!("Error opening in-memory database: {e}"))?;

        Ok(Self {
            connection: db,
            in_memory:  true,
        })
    }
}

#[async_trait]
impl DatabaseDriver for Sqlite {
    fn name(&self) -> &'static str {
        "SQLite"
    }

    fn connection(&self) -> DatabaseConnection {
        self.connection.clone()
    }

    async fn configure(&self) -> Result<(), DbErr> {
        let db = &self.connection;

        db.execute_unprepared("PRAGMA foreign_keys=ON;").await?;
        if !self.in_memory {
            db.execute_unprepared("PRAGMA journal_mode=WAL;").await?;
            db.execute_unprepared("PRAGMA synchronous=NORMAL;").await?;
        }

        Ok(())
    }

    async fn checkpoint(&self) -> Result<(), DbErr> {
        if !self.in_memory {
            self.connection.execute_unprepared("PRAGMA wal_checkpoint;").await?;
        }

        Ok(())
    }
}
