//! SeaORM database migrations.
//!
//! Schema-builder DSL only, so the same migrations run on the embedded
//! SQLite engine and on PostgreSQL.

pub use sea_orm_migration::prelude::*;

mod m20250610_000001_create_jobs;
mod m20250610_000002_create_exports;
mod m20250610_000003_create_modis;
mod m20250610_000004_create_reports;
mod m20250610_000005_create_website_updates;
mod m20250610_000006_create_file_transfers;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250610_000001_create_jobs::Migration),
            Box::new(m20250610_000002_create_exports::Migration),
            Box::new(m20250610_000003_create_modis::Migration),
            Box::new(m20250610_000004_create_reports::Migration),
            Box::new(m20250610_000005_create_website_updates::Migration),
            Box::new(m20250610_000006_create_file_transfers::Migration),
        ]
    }
}
