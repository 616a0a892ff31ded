//! External-collaborator adapters: remote compute tasks, object storage,
//! the git host, and report delivery.

pub mod github;
pub mod mailer;
pub mod storage;
pub mod tasks;

pub use github::GitHubAppClient;
pub use mailer::EmailService;
pub use storage::ObjectStore;
pub use tasks::{GeoComputeClient, TaskService};
