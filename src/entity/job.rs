//! Job entity for SeaORM.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "jobs")]
pub struct Model {
    /// 36-char UUID string.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// RUNNING, COMPLETED, FAILED
    pub job_status: String,
    /// PENDING, RUNNING, COMPLETED, FAILED, NOT_REQUIRED
    pub image_export_status: String,
    pub stats_export_status: String,
    pub website_update_status: String,
    pub report_status: String,
    /// Accumulated `|`-delimited error messages.
    #[sea_orm(column_type = "Text", nullable)]
    pub error: Option<String>,
    pub timezone: String,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::export::Entity")]
    Exports,
    #[sea_orm(has_many = "super::modis::Entity")]
    Modis,
    #[sea_orm(has_many = "super::report::Entity")]
    Reports,
    #[sea_orm(has_many = "super::website_update::Entity")]
    WebsiteUpdates,
    #[sea_orm(has_many = "super::file_transfer::Entity")]
    FileTransfers,
}

impl Related<super::export::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Exports.def()
    }
}

impl Related<super::modis::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Modis.def()
    }
}

impl Related<super::report::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Reports.def()
    }
}

impl Related<super::website_update::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::WebsiteUpdates.def()
    }
}

impl Related<super::file_transfer::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::FileTransfers.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
