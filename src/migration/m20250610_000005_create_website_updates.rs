//! Create website_updates table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(WebsiteUpdate::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(WebsiteUpdate::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(WebsiteUpdate::JobId)
                            .string_len(36)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebsiteUpdate::Status)
                            .string()
                            .not_null()
                            .default("PENDING"),
                    )
                    .col(ColumnDef::new(WebsiteUpdate::PullRequestId).string())
                    .col(ColumnDef::new(WebsiteUpdate::PullRequestUrl).string())
                    .col(
                        ColumnDef::new(WebsiteUpdate::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(WebsiteUpdate::LastError).text())
                    .col(
                        ColumnDef::new(WebsiteUpdate::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebsiteUpdate::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_website_updates_job_id")
                            .from(WebsiteUpdate::Table, WebsiteUpdate::JobId)
                            .to(Job::Table, Job::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_websites_job_id")
                    .table(WebsiteUpdate::Table)
                    .col(WebsiteUpdate::JobId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(WebsiteUpdate::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum WebsiteUpdate {
    #[sea_orm(iden = "website_updates")]
    Table,
    Id,
    JobId,
    Status,
    PullRequestId,
    PullRequestUrl,
    Attempts,
    LastError,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Job {
    #[sea_orm(iden = "jobs")]
    Table,
    Id,
}
