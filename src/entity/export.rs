//! Export entity for SeaORM: one remote-task handle owned by one job.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "exports")]
pub struct Model {
    /// 36-char UUID string.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub job_id: String,
    /// Orchestrator-level projection: RUNNING, COMPLETED, FAILED, TIMED_OUT, UNKNOWN
    pub state: String,
    /// image | table
    #[sea_orm(column_name = "type")]
    pub kind: String,
    /// Target artifact name.
    pub name: String,
    /// gee | storage | drive
    pub target: String,
    /// Target location (collection path or output directory).
    #[sea_orm(column_type = "Text")]
    pub path: String,
    /// Remote task handle; null until (and unless) submission succeeded.
    pub task_id: Option<String>,
    /// Raw remote state string, as last reported.
    pub task_status: String,
    #[sea_orm(column_type = "Text", nullable)]
    pub error: Option<String>,
    pub next_check_at: DateTimeUtc,
    pub lease_until: Option<DateTimeUtc>,
    pub poll_interval_sec: i32,
    pub attempts: i32,
    pub deadline_at: Option<DateTimeUtc>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::job::Entity",
        from = "Column::JobId",
        to = "super::job::Column::Id",
        on_delete = "Cascade"
    )]
    Job,
    #[sea_orm(has_many = "super::file_transfer::Entity")]
    FileTransfers,
}

impl Related<super::job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Job.def()
    }
}

impl Related<super::file_transfer::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::FileTransfers.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
