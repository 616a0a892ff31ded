//! Archive and rollback service.
//!
//! Published table outputs are moved into an `archive/` sub-tree with a
//! date-stamped suffix before their replacements are generated. On a failed
//! export the archived prior version is copied back over the published path.
//!
//! Archive filename contract: `<stem>_LUYYYYMMDD<suffix>` where `YYYYMMDD`
//! is the UTC date of archival.

use chrono::NaiveDate;
use tracing::{debug, error, info, warn};

use crate::db::DbPool;
use crate::error::AppResult;
use crate::models::TransferStatus;
use crate::services::ObjectStore;

/// Split a file name into stem and suffix (`"a.csv"` → `("a", ".csv")`).
fn stem_and_suffix(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    }
}

/// `<stem>_LUYYYYMMDD<suffix>` for a given archival date.
pub fn date_stamped_name(name: &str, date: NaiveDate) -> String {
    let (stem, suffix) = stem_and_suffix(name);
    format!("{}_LU{}{}", stem, date.format("%Y%m%d"), suffix)
}

/// The `YYYYMMDD` stamp of an archive file matching this stem and suffix,
/// if it follows the contract.
pub fn parse_archive_stamp(file_name: &str, stem: &str, suffix: &str) -> Option<String> {
    let rest = file_name.strip_prefix(stem)?.strip_prefix("_LU")?;
    let stamp = rest.strip_suffix(suffix)?;
    if stamp.len() == 8 && stamp.bytes().all(|b| b.is_ascii_digit()) {
        Some(stamp.to_string())
    } else {
        None
    }
}

/// Join path segments with `/`, skipping empties.
fn join_key(segments: &[&str]) -> String {
    segments
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| s.trim_matches('/'))
        .collect::<Vec<_>>()
        .join("/")
}

/// Archive directory for an output file: `<base>/archive/<rel-parent>`.
pub fn archive_dir(base_export_path: &str, output_dir: &str) -> String {
    let rel = output_dir
        .strip_prefix(base_export_path)
        .unwrap_or(output_dir)
        .trim_matches('/');
    join_key(&[base_export_path, "archive", rel])
}

/// Move currently published files into the archive with today's date stamp.
///
/// A file that does not exist at the published path counts as successfully
/// archived (there is nothing to preserve). Returns `(name, succeeded)`
/// pairs; a failed move means the replacement task must not run, or the
/// prior version would be lost.
pub async fn move_published_to_archive(
    storage: &ObjectStore,
    names: &[String],
    output_dir: &str,
    base_export_path: &str,
    today: NaiveDate,
) -> Vec<(String, bool)> {
    let dest_dir = archive_dir(base_export_path, output_dir);
    let mut results = Vec::with_capacity(names.len());
    for name in names {
        let src_key = join_key(&[output_dir, name]);
        let dest_key = join_key(&[&dest_dir, &date_stamped_name(name, today)]);
        let succeeded = match storage.exists(&src_key).await {
            Ok(false) => true,
            Ok(true) => match storage.rename(&src_key, &dest_key).await {
                Ok(()) => {
                    debug!("Archived {} to {}", src_key, dest_key);
                    true
                }
                Err(e) => {
                    warn!("Failed to archive {}: {}", src_key, e);
                    false
                }
            },
            Err(e) => {
                warn!("Failed to check {}: {}", src_key, e);
                false
            }
        };
        results.push((name.clone(), succeeded));
    }
    results
}

/// Record a FileTransfer row for one export's output file.
///
/// Today's date-stamped archive file is checked first; failing that, the
/// lexicographically newest `_LU` stamp wins; with no archived version at
/// all the transfer is recorded as NO_ARCHIVE.
pub async fn record_file_transfer(
    db: &DbPool,
    storage: &ObjectStore,
    job_id: &str,
    export_id: &str,
    output_dir: &str,
    name: &str,
    base_export_path: &str,
    today: NaiveDate,
) -> AppResult<()> {
    let source_path = join_key(&[output_dir, name]);
    let dest_dir = archive_dir(base_export_path, output_dir);
    let (stem, suffix) = stem_and_suffix(name);

    // 1. Today's archive file.
    let todays_key = join_key(&[&dest_dir, &date_stamped_name(name, today)]);
    if storage.exists(&todays_key).await? {
        db.insert_file_transfer(
            job_id,
            export_id,
            &source_path,
            &todays_key,
            TransferStatus::HasArchive,
        )
        .await?;
        return Ok(());
    }

    // 2. Newest matching archive file.
    let prefix = format!("{}/", dest_dir);
    let mut candidates: Vec<String> = storage
        .list(&prefix)
        .await?
        .into_iter()
        .filter(|key| {
            key.rsplit('/')
                .next()
                .and_then(|file| parse_archive_stamp(file, stem, suffix))
                .is_some()
        })
        .collect();
    candidates.sort();
    if let Some(newest) = candidates.pop() {
        db.insert_file_transfer(
            job_id,
            export_id,
            &source_path,
            &newest,
            TransferStatus::HasArchive,
        )
        .await?;
        return Ok(());
    }

    // 3. Nothing archived.
    db.insert_file_transfer(job_id, export_id, &source_path, "", TransferStatus::NoArchive)
        .await?;
    Ok(())
}

/// Copy archived prior versions back over the published paths of every
/// FAILED export with an archive, marking the transfers ROLLED_BACK.
pub async fn rollback_file_transfers(
    db: &DbPool,
    storage: &ObjectStore,
    job_id: &str,
) -> AppResult<()> {
    let candidates = db.rollback_candidates(job_id).await?;
    if candidates.is_empty() {
        debug!("No file rollbacks required for job {}", job_id);
        return Ok(());
    }

    for transfer in candidates {
        if transfer.source_path.is_empty() || transfer.destination_path.is_empty() {
            warn!(
                "Skipping rollback for export {} due to missing paths",
                transfer.export_id
            );
            continue;
        }
        match storage.exists(&transfer.destination_path).await {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    "Rollback source file does not exist: {}",
                    transfer.destination_path
                );
                continue;
            }
            Err(e) => {
                error!("Failed to check {}: {}", transfer.destination_path, e);
                continue;
            }
        }
        match storage
            .copy(&transfer.destination_path, &transfer.source_path)
            .await
        {
            Ok(()) => {
                info!(
                    "Rolled back file {} from {}",
                    transfer.source_path, transfer.destination_path
                );
                db.mark_transfer_rolled_back(transfer.id).await?;
            }
            Err(e) => {
                error!(
                    "Error rolling back file {} from {}: {}",
                    transfer.source_path, transfer.destination_path, e
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_date_stamped_name() {
        assert_eq!(
            date_stamped_name("SCA_m_BNA_023.csv", date(2024, 2, 5)),
            "SCA_m_BNA_023_LU20240205.csv"
        );
        assert_eq!(date_stamped_name("plain", date(2024, 2, 5)), "plain_LU20240205");
    }

    #[test]
    fn test_parse_archive_stamp() {
        assert_eq!(
            parse_archive_stamp("SCA_m_BNA_023_LU20240205.csv", "SCA_m_BNA_023", ".csv"),
            Some("20240205".to_string())
        );
        assert_eq!(
            parse_archive_stamp("SCA_m_BNA_023_LU2024.csv", "SCA_m_BNA_023", ".csv"),
            None
        );
        assert_eq!(
            parse_archive_stamp("Other_LU20240205.csv", "SCA_m_BNA_023", ".csv"),
            None
        );
        // Another basin sharing the stem prefix must not match.
        assert_eq!(
            parse_archive_stamp("SCA_m_BNA_0238_LU20240205.csv", "SCA_m_BNA_023", ".csv"),
            None
        );
    }

    #[test]
    fn test_archive_dir() {
        assert_eq!(archive_dir("stats", "stats/month"), "stats/archive/month");
        assert_eq!(archive_dir("stats", "elsewhere/month"), "stats/archive/elsewhere/month");
        assert_eq!(archive_dir("stats", "stats"), "stats/archive");
    }
}
