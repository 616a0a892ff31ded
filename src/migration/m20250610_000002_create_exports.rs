//! Create exports table.
//!
//! One row per remote task. The `(state, next_check_at)` and `lease_until`
//! indices back the poller's due-task scan.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Export::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Export::Id)
                            .string_len(36)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Export::JobId).string_len(36).not_null())
                    .col(ColumnDef::new(Export::State).string().not_null())
                    .col(ColumnDef::new(Export::Type).string().not_null())
                    .col(ColumnDef::new(Export::Name).string().not_null())
                    .col(ColumnDef::new(Export::Target).string().not_null())
                    .col(ColumnDef::new(Export::Path).text().not_null())
                    .col(ColumnDef::new(Export::TaskId).string())
                    .col(ColumnDef::new(Export::TaskStatus).string().not_null())
                    .col(ColumnDef::new(Export::Error).text())
                    .col(
                        ColumnDef::new(Export::NextCheckAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Export::LeaseUntil).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(Export::PollIntervalSec)
                            .integer()
                            .not_null()
                            .default(15),
                    )
                    .col(
                        ColumnDef::new(Export::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Export::DeadlineAt).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(Export::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Export::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_exports_job_id")
                            .from(Export::Table, Export::JobId)
                            .to(Job::Table, Job::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_exports_job_id")
                    .table(Export::Table)
                    .col(Export::JobId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_exports_due")
                    .table(Export::Table)
                    .col(Export::State)
                    .col(Export::NextCheckAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_exports_lease")
                    .table(Export::Table)
                    .col(Export::LeaseUntil)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Export::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Export {
    #[sea_orm(iden = "exports")]
    Table,
    Id,
    JobId,
    State,
    Type,
    Name,
    Target,
    Path,
    TaskId,
    TaskStatus,
    Error,
    NextCheckAt,
    LeaseUntil,
    PollIntervalSec,
    Attempts,
    DeadlineAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Job {
    #[sea_orm(iden = "jobs")]
    Table,
    Id,
}
