//! Stats export builders.
//!
//! Each configured table family (a prefix plus an export sub-path, grouped
//! per frequency bucket) is one concrete builder producing remote table-task
//! descriptors, one per retained basin code. Selection is data-driven from
//! the settings document; the geospatial computation behind each family is
//! the remote service's concern.

use std::path::Path;

use crate::config::StatsExportSettings;
use crate::models::TableTaskDescriptor;
use crate::pipeline::months::fix_name_prefix;

/// Frequency bucket a table family belongs to. Each bucket has its own
/// manifest and source collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Monthly,
    Yearly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }

    /// Name of this bucket's manifest blob.
    pub fn manifest_name(&self) -> String {
        format!("{}_manifest.json", self.as_str())
    }
}

/// One table family: a named statistic exported per basin.
#[derive(Debug, Clone)]
pub struct TableFamily {
    pub key: &'static str,
    pub prefix: String,
    /// Export sub-path relative to `base_export_path`.
    pub export_path: String,
    pub frequency: Frequency,
}

/// A stats export builder plans the remote table tasks for one family.
pub trait StatsExportBuilder: Send + Sync {
    fn family(&self) -> &TableFamily;

    /// Descriptors for every retained basin, ordered by basin code.
    fn produce(&self, settings: &StatsExportSettings, source_collection: &str)
        -> Vec<TableTaskDescriptor>;
}

/// Per-basin table builder: `<common><family_prefix><basin>.csv` under the
/// family's export path. All configured families share this shape.
pub struct BasinTableBuilder {
    family: TableFamily,
}

impl BasinTableBuilder {
    pub fn new(family: TableFamily) -> Self {
        Self { family }
    }
}

impl StatsExportBuilder for BasinTableBuilder {
    fn family(&self) -> &TableFamily {
        &self.family
    }

    fn produce(
        &self,
        settings: &StatsExportSettings,
        source_collection: &str,
    ) -> Vec<TableTaskDescriptor> {
        let common = settings
            .common_tbl_pre_prefix
            .as_deref()
            .map(fix_name_prefix)
            .unwrap_or_default();
        let output_dir = join_export_path(&settings.base_export_path, &self.family.export_path);

        let mut basins: Vec<&String> = settings
            .basin_codes
            .iter()
            .filter(|code| !settings.exclude_basin_codes.contains(code))
            .collect();
        basins.sort();
        basins.dedup();

        basins
            .into_iter()
            .map(|basin| TableTaskDescriptor {
                name: format!("{}{}{}.csv", common, self.family.prefix, basin),
                path: output_dir.clone(),
                target: settings.export_target,
                basin_code: basin.clone(),
                source_collection: source_collection.to_string(),
            })
            .collect()
    }
}

fn join_export_path(base: &Path, sub: &str) -> String {
    let base = base.to_string_lossy();
    let base = base.trim_matches('/');
    let sub = sub.trim_matches('/');
    if sub.is_empty() {
        base.to_string()
    } else if base.is_empty() {
        sub.to_string()
    } else {
        format!("{}/{}", base, sub)
    }
}

/// Assemble the builders for one bucket from the settings document. A family
/// participates when its group gate is on and both its prefix and the
/// group's export path are configured.
pub fn builders_for_bucket(
    settings: &StatsExportSettings,
    frequency: Frequency,
) -> Vec<Box<dyn StatsExportBuilder>> {
    let mut builders: Vec<Box<dyn StatsExportBuilder>> = Vec::new();

    let mut push = |key: &'static str,
                    gate: bool,
                    export_path: &Option<std::path::PathBuf>,
                    prefix: &Option<String>| {
        if !gate {
            return;
        }
        let (Some(export_path), Some(prefix)) = (export_path, prefix) else {
            return;
        };
        builders.push(Box::new(BasinTableBuilder::new(TableFamily {
            key,
            prefix: prefix.clone(),
            export_path: export_path.to_string_lossy().to_string(),
            frequency,
        })));
    };

    match frequency {
        Frequency::Monthly => {
            push(
                "sca_elev",
                settings.elevation_stats,
                &settings.elevation_tbl_export_path,
                &settings.sca_elev_basin_tbl_prefix,
            );
            push(
                "sca_m",
                settings.month_stats,
                &settings.month_tbl_export_path,
                &settings.sca_m_basin_tbl_prefix,
            );
            push(
                "sca_m_elev",
                settings.month_stats,
                &settings.month_tbl_export_path,
                &settings.sca_m_elev_basin_tbl_prefix,
            );
            push(
                "sca_m_trend",
                settings.month_stats,
                &settings.month_tbl_export_path,
                &settings.sca_m_trend_basin_tbl_prefix,
            );
            push(
                "sca_y_m",
                settings.monthly_stats,
                &settings.year_month_tbl_export_path,
                &settings.sca_y_m_basin_tbl_prefix,
            );
            push(
                "sca_ym",
                settings.monthly_stats,
                &settings.year_month_tbl_export_path,
                &settings.sca_ym_basin_tbl_prefix,
            );
            push(
                "sca_ym_elev",
                settings.monthly_stats,
                &settings.year_month_tbl_export_path,
                &settings.sca_ym_elev_basin_tbl_prefix,
            );
            push(
                "snowline_ym",
                settings.monthly_stats,
                &settings.year_month_tbl_export_path,
                &settings.snowline_ym_basin_tbl_prefix,
            );
        }
        Frequency::Yearly => {
            push(
                "sca_y",
                settings.yearly_stats,
                &settings.year_tbl_export_path,
                &settings.sca_y_basin_tbl_prefix,
            );
            push(
                "sca_y_elev",
                settings.yearly_stats,
                &settings.year_tbl_export_path,
                &settings.sca_y_elev_basin_tbl_prefix,
            );
            push(
                "sca_y_t_area",
                settings.yearly_stats,
                &settings.year_tbl_export_path,
                &settings.sca_y_t_area_basin_tbl_prefix,
            );
            push(
                "sca_y_t_elev",
                settings.yearly_stats,
                &settings.year_tbl_export_path,
                &settings.sca_y_t_elev_basin_tbl_prefix,
            );
            push(
                "snowline_y",
                settings.yearly_stats,
                &settings.year_tbl_export_path,
                &settings.snowline_y_basin_tbl_prefix,
            );
        }
    }

    builders
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExportTarget;
    use std::path::PathBuf;

    fn settings() -> StatsExportSettings {
        StatsExportSettings {
            monthly_collection_path: Some("projects/snow/assets/monthly".to_string()),
            monthly_image_prefix: Some("Snow_TAC".to_string()),
            yearly_collection_path: None,
            yearly_image_prefix: None,
            export_target: ExportTarget::Storage,
            storage_bucket: Some("snow-stats".to_string()),
            base_export_path: PathBuf::from("stats"),
            basin_codes: vec!["038".to_string(), "023".to_string(), "023".to_string()],
            exclude_basin_codes: vec!["099".to_string()],
            max_exports: None,
            common_tbl_pre_prefix: Some("MCD".to_string()),
            elevation_stats: false,
            elevation_tbl_export_path: None,
            sca_elev_basin_tbl_prefix: None,
            month_stats: true,
            month_tbl_export_path: Some(PathBuf::from("month")),
            sca_m_basin_tbl_prefix: Some("SCA_m_BNA_".to_string()),
            sca_m_elev_basin_tbl_prefix: None,
            sca_m_trend_basin_tbl_prefix: None,
            monthly_stats: false,
            year_month_tbl_export_path: None,
            sca_y_m_basin_tbl_prefix: None,
            sca_ym_basin_tbl_prefix: None,
            sca_ym_elev_basin_tbl_prefix: None,
            snowline_ym_basin_tbl_prefix: None,
            yearly_stats: true,
            year_tbl_export_path: Some(PathBuf::from("year")),
            sca_y_basin_tbl_prefix: Some("SCA_y_BNA_".to_string()),
            sca_y_elev_basin_tbl_prefix: None,
            sca_y_t_area_basin_tbl_prefix: None,
            sca_y_t_elev_basin_tbl_prefix: None,
            snowline_y_basin_tbl_prefix: None,
            manifest_source: crate::config::ManifestSource::Storage,
            manifest_path: PathBuf::from("stats/manifests"),
            skip_manifest: false,
        }
    }

    #[test]
    fn test_monthly_bucket_selects_configured_families_only() {
        let builders = builders_for_bucket(&settings(), Frequency::Monthly);
        let keys: Vec<&str> = builders.iter().map(|b| b.family().key).collect();
        assert_eq!(keys, vec!["sca_m"]);
    }

    #[test]
    fn test_descriptors_per_basin_sorted_and_deduped() {
        let settings = settings();
        let builders = builders_for_bucket(&settings, Frequency::Monthly);
        let descriptors = builders[0].produce(&settings, "projects/snow/assets/monthly");
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].name, "MCD_SCA_m_BNA_023.csv");
        assert_eq!(descriptors[1].name, "MCD_SCA_m_BNA_038.csv");
        assert_eq!(descriptors[0].path, "stats/month");
        assert_eq!(descriptors[0].target, ExportTarget::Storage);
    }

    #[test]
    fn test_excluded_basins_dropped() {
        let mut settings = settings();
        settings.exclude_basin_codes = vec!["038".to_string()];
        let builders = builders_for_bucket(&settings, Frequency::Monthly);
        let descriptors = builders[0].produce(&settings, "projects/snow/assets/monthly");
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].basin_code, "023");
    }

    #[test]
    fn test_yearly_bucket() {
        let builders = builders_for_bucket(&settings(), Frequency::Yearly);
        let keys: Vec<&str> = builders.iter().map(|b| b.family().key).collect();
        assert_eq!(keys, vec!["sca_y"]);

        let mut settings = settings();
        settings.sca_y_t_area_basin_tbl_prefix = Some("SCA_y_t_area_BNA_".to_string());
        settings.sca_y_t_elev_basin_tbl_prefix = Some("SCA_y_t_elev_BNA_".to_string());
        let builders = builders_for_bucket(&settings, Frequency::Yearly);
        let keys: Vec<&str> = builders.iter().map(|b| b.family().key).collect();
        assert_eq!(keys, vec!["sca_y", "sca_y_t_area", "sca_y_t_elev"]);
    }
}
