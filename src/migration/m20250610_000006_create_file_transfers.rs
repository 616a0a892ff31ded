//! Create file_transfers table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(FileTransfer::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(FileTransfer::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(FileTransfer::JobId)
                            .string_len(36)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(FileTransfer::ExportId)
                            .string_len(36)
                            .not_null(),
                    )
                    .col(ColumnDef::new(FileTransfer::SourcePath).text().not_null())
                    .col(
                        ColumnDef::new(FileTransfer::DestinationPath)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(FileTransfer::Status).string().not_null())
                    .col(
                        ColumnDef::new(FileTransfer::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(FileTransfer::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_file_transfers_job_id")
                            .from(FileTransfer::Table, FileTransfer::JobId)
                            .to(Job::Table, Job::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_file_transfers_export_id")
                            .from(FileTransfer::Table, FileTransfer::ExportId)
                            .to(Export::Table, Export::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_file_transfers_job_id")
                    .table(FileTransfer::Table)
                    .col(FileTransfer::JobId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_file_transfers_export_id")
                    .table(FileTransfer::Table)
                    .col(FileTransfer::ExportId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(FileTransfer::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum FileTransfer {
    #[sea_orm(iden = "file_transfers")]
    Table,
    Id,
    JobId,
    ExportId,
    SourcePath,
    DestinationPath,
    Status,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Job {
    #[sea_orm(iden = "jobs")]
    Table,
    Id,
}

#[derive(DeriveIden)]
enum Export {
    #[sea_orm(iden = "exports")]
    Table,
    Id,
}
