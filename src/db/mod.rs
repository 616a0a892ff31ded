//! Database module providing connection management and query layers.
//!
//! The persistent store is the orchestrator's sole point of synchronization;
//! every component reads and writes through the pool.

pub mod exports;
pub mod file_transfers;
pub mod jobs;
pub mod modis;
pub mod reports;
pub mod website_updates;

use std::path::PathBuf;

use sea_orm::{Database, DatabaseConnection};
use secrecy::ExposeSecret;

use crate::config::{DbEngine, DbSettings};
use crate::error::{AppError, AppResult};
use crate::migration::Migrator;
use sea_orm_migration::MigratorTrait;

/// Database connection pool wrapper around a SeaORM connection.
#[derive(Clone)]
pub struct DbPool {
    conn: DatabaseConnection,
}

impl DbPool {
    /// Connect using the configured backend.
    pub async fn connect(settings: &DbSettings) -> AppResult<Self> {
        let url = Self::build_url(settings)?;
        Self::connect_url(&url).await
    }

    /// Connect to an explicit database URL (also used by tests with
    /// `sqlite::memory:`).
    pub async fn connect_url(url: &str) -> AppResult<Self> {
        let conn = Database::connect(url)
            .await
            .map_err(|e| AppError::Database(format!("Failed to connect to database: {}", e)))?;
        Ok(DbPool { conn })
    }

    fn build_url(settings: &DbSettings) -> AppResult<String> {
        match settings.engine {
            DbEngine::Sqlite => {
                let dir: &PathBuf = settings.db_path.as_ref().ok_or_else(|| {
                    AppError::Database("db_path is required for the sqlite engine".to_string())
                })?;
                std::fs::create_dir_all(dir).map_err(|e| {
                    AppError::Database(format!("Failed to create database directory: {}", e))
                })?;
                let file = dir.join(&settings.db_name);
                Ok(format!("sqlite://{}?mode=rwc", file.display()))
            }
            DbEngine::Postgres => {
                let host = settings.host.as_deref().unwrap_or("localhost");
                let port = settings.port.unwrap_or(5432);
                let user = settings.user.clone().unwrap_or_default();
                let password = settings
                    .password
                    .as_ref()
                    .map(|p| p.expose_secret().to_string())
                    .unwrap_or_default();
                Ok(format!(
                    "postgres://{}:{}@{}:{}/{}",
                    user, password, host, port, settings.db_name
                ))
            }
        }
    }

    /// Run pending migrations.
    pub async fn run_migrations(&self) -> AppResult<()> {
        Migrator::up(&self.conn, None)
            .await
            .map_err(|e| AppError::Database(format!("Failed to run migrations: {}", e)))?;
        Ok(())
    }

    /// Access to the underlying connection for executing queries.
    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }
}
