//! Cell-level parsers for history table rows.
//!
//! Optional data comes back as `None` when the cell is a placeholder or
//! malformed; only the finish time and days held are reported as failures
//! by the row driver.

use chrono::NaiveDate;

pub const PLACEHOLDER: &str = "-";
pub const LESS_THAN_ONE_DAY: &str = "<1";

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").ok()
}

/// `M'SS"mmm` to milliseconds, e.g. `1'23"456` -> 83456.
pub fn parse_finish_time(text: &str) -> Option<u32> {
    let (minutes, rest) = text.trim().split_once('\'')?;
    let (seconds, millis) = rest.split_once('"')?;
    let minutes = parse_digits(minutes)?;
    let seconds = parse_digits(seconds)?;
    let millis = parse_digits(millis)?;
    minutes
        .checked_mul(60_000)?
        .checked_add(seconds.checked_mul(1000)?)?
        .checked_add(millis)
}

fn parse_digits(text: &str) -> Option<u32> {
    let text = text.trim();
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

/// Days held; the site shows `<1` for records broken within a day.
pub fn parse_days(text: &str) -> Option<u32> {
    match text.trim() {
        LESS_THAN_ONE_DAY => Some(0),
        other => parse_digits(other),
    }
}

/// Lap splits in seconds to rounded milliseconds. One unusable cell drops
/// the whole sequence.
pub fn parse_lap_times<S: AsRef<str>>(cells: &[S]) -> Option<Vec<u32>> {
    if cells.is_empty() {
        return None;
    }
    cells
        .iter()
        .map(|cell| parse_lap_seconds(cell.as_ref()))
        .collect()
}

fn parse_lap_seconds(text: &str) -> Option<u32> {
    let text = text.trim();
    if text.is_empty() || text == PLACEHOLDER {
        return None;
    }
    let seconds: f64 = text.parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let millis = (seconds * 1000.0).round();
    (millis <= f64::from(u32::MAX)).then_some(millis as u32)
}

/// Dash-delimited per-lap counts, e.g. `3-3-2`; `None` unless there is
/// exactly one count per lap.
pub fn parse_counts(text: &str, lap_count: usize) -> Option<Vec<u32>> {
    let counts = text
        .trim()
        .split('-')
        .map(parse_digits)
        .collect::<Option<Vec<_>>>()?;
    (counts.len() == lap_count).then_some(counts)
}

/// Build parts: `-` means the part is unknown.
pub fn parse_component(text: &str) -> Option<String> {
    let text = text.trim();
    (text != PLACEHOLDER).then(|| text.to_string())
}

/// Player name from a profile link such as `display.php?player=Some%20One`.
pub fn player_from_href(href: &str) -> Option<String> {
    let (_, value) = href.split_once("?player=")?;
    let value = value.split('&').next().unwrap_or(value);
    urlencoding::decode(value).ok().map(|name| name.into_owned())
}
