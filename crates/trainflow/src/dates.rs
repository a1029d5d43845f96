use chrono::{Days, NaiveDate};

/// Accepts `YYYYMMDD` or `YYYY-MM-DD`.
pub fn parse_date_arg(raw: &str) -> Result<NaiveDate, String> {
    let trimmed = raw.trim();
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .or_else(|| trainflow_core::store::parse_date_tag(trimmed))
        .ok_or_else(|| format!("'{raw}' is not a date (expected YYYYMMDD or YYYY-MM-DD)"))
}

/// The `lookback` days before `today`, oldest first. `today` itself is excluded.
pub fn lookback_dates(today: NaiveDate, lookback: u32) -> Vec<NaiveDate> {
    (1..=u64::from(lookback))
        .rev()
        .filter_map(|offset| today.checked_sub_days(Days::new(offset)))
        .collect()
}

/// Sorted, deduplicated copy of the requested dates.
pub fn normalize(mut dates: Vec<NaiveDate>) -> Vec<NaiveDate> {
    dates.sort();
    dates.dedup();
    dates
}
