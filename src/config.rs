//! Application configuration loaded from a hierarchical TOML document.
//!
//! One loader builds an immutable settings tree: the user document is
//! deserialized over per-field defaults, `*_file` options are resolved by
//! reading the referenced file, and cross-field invariants are validated up
//! front. Any problem is fatal before the scheduler starts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use secrecy::SecretString;
use serde::Deserialize;

/// Environment variable naming the settings file when `--toml` is not given.
pub const CONFIG_ENV_VAR: &str = "IPA_CONFIG_TOML";

/// Environment variable flagging a containerized deployment (stdout logging
/// plus the liveness endpoint).
pub const CONTAINERIZED_ENV_VAR: &str = "IPA_CONTAINERIZED";

/// Port the liveness endpoint binds when containerized.
pub const HEALTHCHECK_PORT: u16 = 8080;

/// Packaged default values.
pub mod defaults {
    pub const DEFAULT_TIMEZONE: &str = "UTC";
    pub const DEFAULT_DAILY_CRON: &str = "0 2 * * *";
    pub const DEFAULT_INTERVAL_MINUTES: u64 = 3;
    pub const DEFAULT_DB_NAME: &str = "ipa_orchestrator.db";
    pub const DEFAULT_LOG_FILE: &str = "./ipa_orchestrator.log";
    pub const DEFAULT_HEARTBEAT_FILE: &str = "./ipa_heartbeat.txt";
    pub const DEFAULT_MAIN_BRANCH: &str = "main";
    /// First month the upstream archive can produce a complete image for.
    pub const DEFAULT_MIN_MONTH: &str = "2000-03";
    pub const DEFAULT_TERRA_COLLECTION: &str = "MODIS/061/MOD10A1";
    pub const DEFAULT_AQUA_COLLECTION: &str = "MODIS/061/MYD10A1";
}

/// Configuration errors. All fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse settings TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation failed:\n{}", .0.iter().map(|e| format!("  - {}", e)).collect::<Vec<_>>().join("\n"))]
    Validation(Vec<String>),
}

/// Read a `*_file` indirection: the trimmed contents of the referenced file.
fn value_from_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// Identity used for the compute service and the object store.
#[derive(Debug, Clone, Deserialize)]
pub struct GoogleSettings {
    /// Path to the service-account credential document.
    pub credentials_file: PathBuf,
}

/// Report delivery settings. When `enable_email` is set, all of
/// host/port/user/password/from/to must be set too.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EmailSettings {
    pub enable_email: bool,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user_file: Option<PathBuf>,
    pub user: Option<String>,
    pub password_file: Option<PathBuf>,
    pub password: Option<SecretString>,
    pub from_address: Option<String>,
    pub to_address: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub file: PathBuf,
    pub encoding: String,
    pub format: String,
    pub date_format: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: PathBuf::from(defaults::DEFAULT_LOG_FILE),
            encoding: "utf-8".to_string(),
            format: "{timestamp} {target} {level}: {message}".to_string(),
            date_format: "%Y-%m-%d %H:%M:%S".to_string(),
        }
    }
}

/// Settings for the image stage worker.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageExportSettings {
    pub aoi_asset_path: String,
    pub dem_asset_path: String,
    pub monthly_collection_path: Option<String>,
    pub monthly_image_prefix: Option<String>,
    /// Explicit list of months to export (`YYYY-MM`). When absent, every
    /// month from `min_month` through the previous month is a candidate.
    pub months_list: Option<Vec<String>>,
    #[serde(default = "default_min_month")]
    pub min_month: String,
    pub max_exports: Option<usize>,
    /// Upstream daily source collections, keyed by a short name used in the
    /// per-job snapshot rows.
    #[serde(default = "default_source_collections")]
    pub source_collections: BTreeMap<String, String>,
}

fn default_min_month() -> String {
    defaults::DEFAULT_MIN_MONTH.to_string()
}

fn default_source_collections() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("terra".to_string(), defaults::DEFAULT_TERRA_COLLECTION.to_string()),
        ("aqua".to_string(), defaults::DEFAULT_AQUA_COLLECTION.to_string()),
    ])
}

/// Where stats manifests and table outputs live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestSource {
    Storage,
    File,
}

/// Settings for the stats stage worker.
///
/// Each `*_tbl_prefix` names one table family; together with the group's
/// export sub-path and boolean gate they drive descriptor planning.
#[derive(Debug, Clone, Deserialize)]
pub struct StatsExportSettings {
    // Input collections (shared with image_export, cross-copied at load time
    // when omitted here).
    pub monthly_collection_path: Option<String>,
    pub monthly_image_prefix: Option<String>,
    pub yearly_collection_path: Option<String>,
    pub yearly_image_prefix: Option<String>,

    // Common output
    pub export_target: crate::models::ExportTarget,
    pub storage_bucket: Option<String>,
    pub base_export_path: PathBuf,
    #[serde(default)]
    pub basin_codes: Vec<String>,
    #[serde(default)]
    pub exclude_basin_codes: Vec<String>,
    pub max_exports: Option<usize>,
    /// Common prefix preceding every family prefix,
    /// e.g. `<common>_<family>_<basin>.csv`.
    pub common_tbl_pre_prefix: Option<String>,

    // Elevation statistics
    #[serde(default = "default_true")]
    pub elevation_stats: bool,
    pub elevation_tbl_export_path: Option<PathBuf>,
    pub sca_elev_basin_tbl_prefix: Option<String>,

    // Month (across-years) statistics
    #[serde(default = "default_true")]
    pub month_stats: bool,
    pub month_tbl_export_path: Option<PathBuf>,
    pub sca_m_basin_tbl_prefix: Option<String>,
    pub sca_m_elev_basin_tbl_prefix: Option<String>,
    pub sca_m_trend_basin_tbl_prefix: Option<String>,

    // Year-month statistics
    #[serde(default = "default_true")]
    pub monthly_stats: bool,
    pub year_month_tbl_export_path: Option<PathBuf>,
    pub sca_y_m_basin_tbl_prefix: Option<String>,
    pub sca_ym_basin_tbl_prefix: Option<String>,
    pub sca_ym_elev_basin_tbl_prefix: Option<String>,
    pub snowline_ym_basin_tbl_prefix: Option<String>,

    // Yearly statistics
    #[serde(default = "default_true")]
    pub yearly_stats: bool,
    pub year_tbl_export_path: Option<PathBuf>,
    pub sca_y_basin_tbl_prefix: Option<String>,
    pub sca_y_elev_basin_tbl_prefix: Option<String>,
    pub sca_y_t_area_basin_tbl_prefix: Option<String>,
    pub sca_y_t_elev_basin_tbl_prefix: Option<String>,
    pub snowline_y_basin_tbl_prefix: Option<String>,

    // Manifest
    pub manifest_source: ManifestSource,
    pub manifest_path: PathBuf,
    #[serde(default)]
    pub skip_manifest: bool,
}

fn default_true() -> bool {
    true
}

/// Database backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbEngine {
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbSettings {
    #[serde(rename = "type")]
    pub engine: DbEngine,
    pub db_path: Option<PathBuf>,
    #[serde(default = "default_db_name")]
    pub db_name: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user_file: Option<PathBuf>,
    pub user: Option<String>,
    pub password_file: Option<PathBuf>,
    pub password: Option<SecretString>,
}

fn default_db_name() -> String {
    defaults::DEFAULT_DB_NAME.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DailyJobSettings {
    #[serde(default = "default_daily_cron")]
    pub cron: String,
}

impl Default for DailyJobSettings {
    fn default() -> Self {
        Self {
            cron: default_daily_cron(),
        }
    }
}

fn default_daily_cron() -> String {
    defaults::DEFAULT_DAILY_CRON.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestrationJobSettings {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
}

impl Default for OrchestrationJobSettings {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
        }
    }
}

fn default_interval_minutes() -> u64 {
    defaults::DEFAULT_INTERVAL_MINUTES
}

/// Git-host app identity for the website repository.
#[derive(Debug, Clone, Deserialize)]
pub struct GithubSettings {
    /// HTTPS URL of the website repository.
    pub repo_url: String,
    /// GitHub App client id used as the JWT issuer.
    pub app_id: String,
    /// Path to the app's RS256 private key (PEM).
    pub private_key_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebsiteSettings {
    pub github: GithubSettings,
    /// Base path of the published assets inside the object store.
    pub gcs_base_assets_path: PathBuf,
    /// Directory the working copy is cloned under.
    pub local_repo_path: PathBuf,
    /// Base path inside the repository the assets are copied to.
    pub repo_base_assets_path: PathBuf,
    pub work_branch: String,
    #[serde(default = "default_main_branch")]
    pub main_branch: String,
}

fn default_main_branch() -> String {
    defaults::DEFAULT_MAIN_BRANCH.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatSettings {
    #[serde(default = "default_heartbeat_file")]
    pub heartbeat_file: PathBuf,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            heartbeat_file: default_heartbeat_file(),
        }
    }
}

fn default_heartbeat_file() -> PathBuf {
    PathBuf::from(defaults::DEFAULT_HEARTBEAT_FILE)
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutomationSettings {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub db: DbSettings,
    #[serde(default)]
    pub daily_job: DailyJobSettings,
    #[serde(default)]
    pub orchestration_job: OrchestrationJobSettings,
    pub website: WebsiteSettings,
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,
}

fn default_timezone() -> String {
    defaults::DEFAULT_TIMEZONE.to_string()
}

/// The full settings tree.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub google: GoogleSettings,
    #[serde(default)]
    pub email: EmailSettings,
    #[serde(default)]
    pub logging: LogSettings,
    pub image_export: ImageExportSettings,
    pub stats_export: StatsExportSettings,
    pub automation: AutomationSettings,
}

impl Settings {
    /// Load, resolve indirections and validate a settings document.
    pub fn load_from_toml(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut settings: Settings = toml::from_str(&raw)?;
        settings.resolve_file_values()?;
        settings.cross_copy_shared_fields();
        settings.validate()?;
        Ok(settings)
    }

    /// Resolve every `*_file` option into its sibling value field.
    /// An explicit inline value wins over the file indirection.
    fn resolve_file_values(&mut self) -> Result<(), ConfigError> {
        if self.email.user.is_none() {
            if let Some(path) = &self.email.user_file {
                self.email.user = Some(value_from_file(path)?);
            }
        }
        if self.email.password.is_none() {
            if let Some(path) = &self.email.password_file {
                self.email.password = Some(SecretString::from(value_from_file(path)?));
            }
        }
        let db = &mut self.automation.db;
        if db.user.is_none() {
            if let Some(path) = &db.user_file {
                db.user = Some(value_from_file(path)?);
            }
        }
        if db.password.is_none() {
            if let Some(path) = &db.password_file {
                db.password = Some(SecretString::from(value_from_file(path)?));
            }
        }
        Ok(())
    }

    /// Fields shared between the image and stats workers are copied once at
    /// load time instead of being re-derived inside each stage.
    fn cross_copy_shared_fields(&mut self) {
        let stats = &mut self.stats_export;
        if stats.monthly_collection_path.is_none() {
            stats.monthly_collection_path = self.image_export.monthly_collection_path.clone();
        }
        if stats.monthly_image_prefix.is_none() {
            stats.monthly_image_prefix = self.image_export.monthly_image_prefix.clone();
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.email.enable_email {
            let mut missing = Vec::new();
            if self.email.host.is_none() {
                missing.push("host");
            }
            if self.email.port.is_none() {
                missing.push("port");
            }
            if self.email.user.is_none() {
                missing.push("user");
            }
            if self.email.password.is_none() {
                missing.push("password");
            }
            if self.email.from_address.is_none() {
                missing.push("from_address");
            }
            if self.email.to_address.is_empty() {
                missing.push("to_address");
            }
            if !missing.is_empty() {
                errors.push(format!(
                    "email.enable_email is set but the following fields are missing: {}",
                    missing.join(", ")
                ));
            }
        }

        if chrono_tz::Tz::from_str(&self.automation.timezone).is_err() {
            errors.push(format!(
                "automation.timezone '{}' is not a valid IANA timezone",
                self.automation.timezone
            ));
        }

        if let Err(e) = crate::scheduler::parse_cron_expr(&self.automation.daily_job.cron) {
            errors.push(format!(
                "automation.daily_job.cron '{}' is invalid: {}",
                self.automation.daily_job.cron, e
            ));
        }

        if self.automation.orchestration_job.interval_minutes == 0 {
            errors.push("automation.orchestration_job.interval_minutes must be positive".into());
        }

        match self.automation.db.engine {
            DbEngine::Sqlite => {
                if self.automation.db.db_path.is_none() {
                    errors.push("automation.db.db_path is required for the sqlite engine".into());
                }
            }
            DbEngine::Postgres => {
                let db = &self.automation.db;
                if db.host.is_none() || db.port.is_none() || db.user.is_none() || db.password.is_none() {
                    errors.push(
                        "automation.db host, port, user and password are required for the postgres engine"
                            .into(),
                    );
                }
            }
        }

        if self.stats_export.export_target == crate::models::ExportTarget::Storage
            && self.stats_export.storage_bucket.is_none()
        {
            errors.push(
                "stats_export.storage_bucket is required when export_target is 'storage'".into(),
            );
        }

        if let Some(months) = &self.image_export.months_list {
            for month in months {
                if !crate::pipeline::months::is_valid_year_month(month) {
                    errors.push(format!(
                        "image_export.months_list entry '{}' is not a valid YYYY-MM month",
                        month
                    ));
                } else if *month < self.image_export.min_month {
                    errors.push(format!(
                        "image_export.months_list entry '{}' is before min_month '{}'",
                        month, self.image_export.min_month
                    ));
                }
            }
        }
        if !crate::pipeline::months::is_valid_year_month(&self.image_export.min_month) {
            errors.push(format!(
                "image_export.min_month '{}' is not a valid YYYY-MM month",
                self.image_export.min_month
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Parsed timezone for scheduler triggers and report timestamps.
    pub fn timezone(&self) -> chrono_tz::Tz {
        // Validated at load time.
        chrono_tz::Tz::from_str(&self.automation.timezone).unwrap_or(chrono_tz::UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_toml() -> String {
        r#"
[google]
credentials_file = "/etc/ipa/service-account.json"

[image_export]
aoi_asset_path = "projects/snow/assets/aoi"
dem_asset_path = "projects/snow/assets/dem"
monthly_collection_path = "projects/snow/assets/monthly"
monthly_image_prefix = "Snow_TAC"

[stats_export]
export_target = "storage"
storage_bucket = "snow-stats"
base_export_path = "stats"
manifest_source = "storage"
manifest_path = "stats/manifests"
month_tbl_export_path = "month"
sca_m_basin_tbl_prefix = "SCA_m_BNA_"
basin_codes = ["023", "038"]

[automation]
timezone = "America/Santiago"

[automation.db]
type = "sqlite"
db_path = "./data"

[automation.website]
gcs_base_assets_path = "stats"
local_repo_path = "./repos"
repo_base_assets_path = "public/assets"
work_branch = "stats-auto-update"

[automation.website.github]
repo_url = "https://github.com/example/website"
app_id = "12345"
private_key_path = "/etc/ipa/app-key.pem"
"#
        .to_string()
    }

    fn load(toml_text: &str) -> Result<Settings, ConfigError> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml_text.as_bytes()).unwrap();
        Settings::load_from_toml(file.path())
    }

    #[test]
    fn test_minimal_document_loads_with_defaults() {
        let settings = load(&minimal_toml()).unwrap();
        assert_eq!(settings.automation.daily_job.cron, "0 2 * * *");
        assert_eq!(settings.automation.orchestration_job.interval_minutes, 3);
        assert_eq!(settings.automation.db.db_name, defaults::DEFAULT_DB_NAME);
        assert!(!settings.email.enable_email);
        assert_eq!(settings.image_export.source_collections.len(), 2);
        assert_eq!(settings.timezone(), chrono_tz::America::Santiago);
    }

    #[test]
    fn test_shared_fields_cross_copied_into_stats() {
        let settings = load(&minimal_toml()).unwrap();
        assert_eq!(
            settings.stats_export.monthly_collection_path.as_deref(),
            Some("projects/snow/assets/monthly")
        );
        assert_eq!(
            settings.stats_export.monthly_image_prefix.as_deref(),
            Some("Snow_TAC")
        );
    }

    #[test]
    fn test_email_enabled_requires_all_fields() {
        let toml_text = minimal_toml() + "\n[email]\nenable_email = true\nhost = \"smtp.example.com\"\n";
        let err = load(&toml_text).unwrap_err();
        match err {
            ConfigError::Validation(errors) => {
                assert!(errors.iter().any(|e| e.contains("enable_email")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        let toml_text = minimal_toml().replace("America/Santiago", "Mars/Olympus");
        assert!(matches!(load(&toml_text), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_invalid_cron_rejected() {
        let toml_text = minimal_toml()
            + "\n[automation.daily_job]\ncron = \"not a cron\"\n";
        assert!(matches!(load(&toml_text), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_storage_target_requires_bucket() {
        let toml_text = minimal_toml().replace("storage_bucket = \"snow-stats\"\n", "");
        assert!(matches!(load(&toml_text), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_months_list_before_min_month_rejected() {
        let toml_text = minimal_toml().replace(
            "monthly_image_prefix = \"Snow_TAC\"",
            "monthly_image_prefix = \"Snow_TAC\"\nmonths_list = [\"1999-05\"]",
        );
        assert!(matches!(load(&toml_text), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_value_from_file_indirection() {
        let mut secret = tempfile::NamedTempFile::new().unwrap();
        secret.write_all(b"hunter2\n").unwrap();
        let toml_text = minimal_toml()
            + &format!(
                "\n[email]\nenable_email = true\nhost = \"smtp.example.com\"\nport = 587\nuser = \"pipeline\"\npassword_file = \"{}\"\nfrom_address = \"pipeline@example.com\"\nto_address = [\"ops@example.com\"]\n",
                secret.path().display()
            );
        let settings = load(&toml_text).unwrap();
        use secrecy::ExposeSecret;
        assert_eq!(
            settings.email.password.as_ref().unwrap().expose_secret(),
            "hunter2"
        );
    }
}
