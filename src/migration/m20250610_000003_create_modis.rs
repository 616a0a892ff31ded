//! Create modis table (per-job upstream collection snapshots).

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Modis::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Modis::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Modis::JobId).string_len(36).not_null())
                    .col(ColumnDef::new(Modis::Name).string().not_null())
                    .col(ColumnDef::new(Modis::Collection).string().not_null())
                    .col(ColumnDef::new(Modis::Images).integer().not_null())
                    .col(ColumnDef::new(Modis::LastImage).string().not_null())
                    .col(
                        ColumnDef::new(Modis::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Modis::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_modis_job_id")
                            .from(Modis::Table, Modis::JobId)
                            .to(Job::Table, Job::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_modis_job_id")
                    .table(Modis::Table)
                    .col(Modis::JobId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Modis::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Modis {
    #[sea_orm(iden = "modis")]
    Table,
    Id,
    JobId,
    Name,
    Collection,
    Images,
    LastImage,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Job {
    #[sea_orm(iden = "jobs")]
    Table,
    Id,
}
