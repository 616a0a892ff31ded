//! Month planning for the image stage: candidate sequences, subtraction of
//! already-exported months, and completeness checks against the upstream
//! daily collections.

use std::collections::BTreeSet;

use chrono::{Datelike, NaiveDate};

/// Days of upstream data required past the end of a month before it counts
/// as complete.
pub const LEADING_BUFFER_DAYS: i64 = 2;
/// Days of upstream data required before the start of a month.
pub const TRAILING_BUFFER_DAYS: i64 = 2;

/// Whether a string is a valid `YYYY-MM` month.
pub fn is_valid_year_month(s: &str) -> bool {
    parse_year_month(s).is_some()
}

fn parse_year_month(s: &str) -> Option<NaiveDate> {
    let (year, month) = s.split_once('-')?;
    if year.len() != 4 || month.len() != 2 {
        return None;
    }
    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, 1)
}

fn first_day(month: &str) -> Option<NaiveDate> {
    parse_year_month(month)
}

fn last_day(month: &str) -> Option<NaiveDate> {
    let first = parse_year_month(month)?;
    let next = if first.month() == 12 {
        NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)?
    };
    Some(next - chrono::Duration::days(1))
}

fn year_month_of(date: NaiveDate) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

/// Normalize an image name prefix to end in `_` or `-`.
pub fn fix_name_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('_') || prefix.ends_with('-') {
        prefix.to_string()
    } else {
        format!("{}_", prefix)
    }
}

/// Every month from `min_month` through the month before `today`, ascending.
pub fn month_sequence(min_month: &str, today: NaiveDate) -> Vec<String> {
    let Some(mut cursor) = parse_year_month(min_month) else {
        return Vec::new();
    };
    let current = year_month_of(today);
    let mut months = Vec::new();
    loop {
        let ym = year_month_of(cursor);
        if ym >= current {
            break;
        }
        months.push(ym);
        cursor = if cursor.month() == 12 {
            NaiveDate::from_ymd_opt(cursor.year() + 1, 1, 1).unwrap()
        } else {
            NaiveDate::from_ymd_opt(cursor.year(), cursor.month() + 1, 1).unwrap()
        };
    }
    months
}

/// Months already present as named image assets (`<prefix>YYYY[-_]MM`).
pub fn exported_months(asset_names: &[String], prefix: &str) -> BTreeSet<String> {
    let prefix = fix_name_prefix(prefix);
    asset_names
        .iter()
        .filter_map(|name| {
            let rest = name.strip_prefix(&prefix)?;
            if rest.len() != 7 {
                return None;
            }
            let normalized = rest.replace('_', "-");
            is_valid_year_month(&normalized).then_some(normalized)
        })
        .collect()
}

/// Candidate months minus those already exported, ascending.
pub fn pending_months(candidates: &[String], exported: &BTreeSet<String>) -> Vec<String> {
    let mut pending: Vec<String> = candidates
        .iter()
        .filter(|m| !exported.contains(*m))
        .cloned()
        .collect();
    pending.sort();
    pending.dedup();
    pending
}

/// Availability of one month within one upstream source collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonthAvailability {
    /// All required images are present, buffers included.
    Complete,
    /// The bounded window holds no images at all.
    NoImages,
    /// Images exist but the upstream has not moved past the leading buffer;
    /// the month may still fill in.
    PendingCompletion,
    /// The current month is never exported.
    CurrentMonth,
}

/// Check each month against one source's available daily image dates.
///
/// A month is complete when the buffered window `[first - trailing,
/// last + leading]` holds at least one image and some image date is at or
/// past the last leading-buffer date (the upstream has moved on).
pub fn check_months_complete(
    months: &[String],
    reference_dates: &[NaiveDate],
    today: NaiveDate,
) -> Vec<(String, MonthAvailability)> {
    let current = year_month_of(today);
    let mut results = Vec::with_capacity(months.len());
    for month in months {
        if *month == current {
            results.push((month.clone(), MonthAvailability::CurrentMonth));
            continue;
        }
        let (Some(first), Some(last)) = (first_day(month), last_day(month)) else {
            results.push((month.clone(), MonthAvailability::NoImages));
            continue;
        };
        let window_start = first - chrono::Duration::days(TRAILING_BUFFER_DAYS);
        let window_end = last + chrono::Duration::days(LEADING_BUFFER_DAYS);

        let any_in_window = reference_dates
            .iter()
            .any(|d| *d >= window_start && *d <= window_end);
        if !any_in_window {
            results.push((month.clone(), MonthAvailability::NoImages));
            continue;
        }

        let moved_past = reference_dates.iter().any(|d| *d >= window_end);
        if !moved_past {
            results.push((month.clone(), MonthAvailability::PendingCompletion));
            continue;
        }

        results.push((month.clone(), MonthAvailability::Complete));
    }
    results
}

/// Final export plan across all sources: months complete in at least one
/// source, and pending completion in none.
pub fn select_months_to_export(
    per_source: &[Vec<(String, MonthAvailability)>],
) -> Vec<String> {
    let mut complete = BTreeSet::new();
    let mut pending = BTreeSet::new();
    for source in per_source {
        for (month, availability) in source {
            match availability {
                MonthAvailability::Complete => {
                    complete.insert(month.clone());
                }
                MonthAvailability::PendingCompletion => {
                    pending.insert(month.clone());
                }
                _ => {}
            }
        }
    }
    complete.difference(&pending).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn date_range(from: NaiveDate, to: NaiveDate) -> Vec<NaiveDate> {
        let mut dates = Vec::new();
        let mut cursor = from;
        while cursor <= to {
            dates.push(cursor);
            cursor += chrono::Duration::days(1);
        }
        dates
    }

    #[test]
    fn test_month_sequence_stops_before_current_month() {
        let months = month_sequence("2023-11", date(2024, 2, 10));
        assert_eq!(months, vec!["2023-11", "2023-12", "2024-01"]);
    }

    #[test]
    fn test_month_sequence_empty_when_min_is_current() {
        assert!(month_sequence("2024-02", date(2024, 2, 10)).is_empty());
    }

    #[test]
    fn test_exported_months_accepts_both_separators() {
        let names = vec![
            "Snow_TAC_2023_12".to_string(),
            "Snow_TAC_2024-01".to_string(),
            "Snow_TAC_notamonth".to_string(),
            "Other_2024_01".to_string(),
        ];
        let exported = exported_months(&names, "Snow_TAC");
        assert!(exported.contains("2023-12"));
        assert!(exported.contains("2024-01"));
        assert_eq!(exported.len(), 2);
    }

    #[test]
    fn test_fix_name_prefix() {
        assert_eq!(fix_name_prefix("Snow_TAC"), "Snow_TAC_");
        assert_eq!(fix_name_prefix("Snow_TAC_"), "Snow_TAC_");
        assert_eq!(fix_name_prefix("Snow-"), "Snow-");
        assert_eq!(fix_name_prefix(""), "");
    }

    #[test]
    fn test_current_month_always_excluded() {
        let months = vec!["2024-02".to_string()];
        let dates = date_range(date(2024, 1, 1), date(2024, 2, 28));
        let results = check_months_complete(&months, &dates, date(2024, 2, 15));
        assert_eq!(results[0].1, MonthAvailability::CurrentMonth);
    }

    #[test]
    fn test_complete_month_requires_leading_buffer() {
        let months = vec!["2024-01".to_string()];
        // Upstream reaches Feb 2: exactly the last leading-buffer date.
        let dates = date_range(date(2023, 12, 29), date(2024, 2, 2));
        let results = check_months_complete(&months, &dates, date(2024, 3, 15));
        assert_eq!(results[0].1, MonthAvailability::Complete);

        // Upstream stops one day short of the buffer: still pending.
        let dates = date_range(date(2023, 12, 29), date(2024, 2, 1));
        let results = check_months_complete(&months, &dates, date(2024, 3, 15));
        assert_eq!(results[0].1, MonthAvailability::PendingCompletion);
    }

    #[test]
    fn test_month_with_no_images_is_empty() {
        let months = vec!["2022-06".to_string()];
        let dates = date_range(date(2024, 1, 1), date(2024, 1, 31));
        let results = check_months_complete(&months, &dates, date(2024, 2, 15));
        // No images in the window itself, even though upstream moved past it.
        assert_eq!(results[0].1, MonthAvailability::NoImages);
    }

    #[test]
    fn test_select_complete_in_either_pending_in_neither() {
        let source_a = vec![
            ("2024-01".to_string(), MonthAvailability::Complete),
            ("2024-02".to_string(), MonthAvailability::Complete),
            ("2024-03".to_string(), MonthAvailability::NoImages),
        ];
        let source_b = vec![
            ("2024-01".to_string(), MonthAvailability::NoImages),
            ("2024-02".to_string(), MonthAvailability::PendingCompletion),
            ("2024-03".to_string(), MonthAvailability::Complete),
        ];
        let selected = select_months_to_export(&[source_a, source_b]);
        // 2024-01 complete in A, pending nowhere; 2024-02 pending in B drops
        // out; 2024-03 complete in B.
        assert_eq!(selected, vec!["2024-01".to_string(), "2024-03".to_string()]);
    }

    #[test]
    fn test_pending_months_subtracts_exported() {
        let candidates = vec!["2024-01".to_string(), "2024-02".to_string()];
        let exported = BTreeSet::from(["2024-01".to_string()]);
        assert_eq!(pending_months(&candidates, &exported), vec!["2024-02"]);
    }
}
