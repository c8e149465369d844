//! Record extraction from mkwrs.com course pages.
//!
//! Each course/engine-class page has a "History" heading followed by a table
//! of every world record ever set. Regular courses put one record per row.
//! Baby Park (seven laps) splits each record over a top row and a bottom row.

pub mod fields;

use chrono::NaiveDate;
use mkwr_core::{Course, EngineClass, Record, BABY_PARK_LAP_COUNT};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::debug;

pub const HISTORY_HEADING: &str = "History";
/// Non-lap columns in a regular row; add the course's lap count for the width.
pub const REGULAR_FIXED_COLUMNS: usize = 11;
pub const PAIRED_TOP_ROW_WIDTH: usize = 15;
pub const PAIRED_BOTTOM_ROW_MIN_WIDTH: usize = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("invalid selector {selector:?}: {reason}")]
    Selector { selector: &'static str, reason: String },
    #[error("no table follows the \"History\" heading")]
    MissingHistoryTable,
    #[error("row {row}: malformed finish time {text:?}")]
    FinishTime { row: usize, text: String },
    #[error("row {row}: malformed days held {text:?}")]
    Days { row: usize, text: String },
    #[error("row {row}: missing {field}")]
    MissingField { row: usize, field: &'static str },
    #[error("row {row}: record has no bottom row")]
    MissingBottomRow { row: usize },
    #[error("row {row}: bottom row has {cells} cells, expected at least 3")]
    ShortBottomRow { row: usize, cells: usize },
}

/// How records are laid out in a course's history table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLayout {
    /// One record per row of exactly `width` cells.
    Single { width: usize, lap_count: usize },
    /// One record per top row of [`PAIRED_TOP_ROW_WIDTH`] cells plus the row after it.
    Paired { lap_count: usize },
}

impl RowLayout {
    pub fn for_course(course: &Course<'_>) -> Self {
        if course.lap_count == BABY_PARK_LAP_COUNT {
            RowLayout::Paired {
                lap_count: course.lap_count,
            }
        } else {
            RowLayout::Single {
                width: REGULAR_FIXED_COLUMNS + course.lap_count,
                lap_count: course.lap_count,
            }
        }
    }
}

struct Selectors {
    heading: Selector,
    row: Selector,
    cell: Selector,
    anchor: Selector,
    image: Selector,
}

impl Selectors {
    fn new() -> Result<Self, ExtractionError> {
        Ok(Self {
            heading: parse_selector("h2")?,
            row: parse_selector("tr")?,
            cell: parse_selector("td")?,
            anchor: parse_selector("a[href]")?,
            image: parse_selector("img[title]")?,
        })
    }
}

fn parse_selector(selector: &'static str) -> Result<Selector, ExtractionError> {
    Selector::parse(selector).map_err(|e| ExtractionError::Selector {
        selector,
        reason: e.to_string(),
    })
}

type Row<'a> = Vec<ElementRef<'a>>;

/// Parses `html` and extracts its history records.
pub fn extract_page(
    html: &str,
    course: &Course<'_>,
    class: EngineClass,
) -> Result<Vec<Record>, ExtractionError> {
    extract(&Html::parse_document(html), course, class)
}

/// Extracts every record in the document's history table, tagged with
/// `course` and `class`.
pub fn extract(
    document: &Html,
    course: &Course<'_>,
    class: EngineClass,
) -> Result<Vec<Record>, ExtractionError> {
    let selectors = Selectors::new()?;
    let table = history_table(document, &selectors)?;
    let rows: Vec<Row<'_>> = table
        .select(&selectors.row)
        .map(|row| row.select(&selectors.cell).collect())
        .collect();

    let extractor = RowExtractor {
        selectors: &selectors,
        course,
        class,
    };
    let records = match RowLayout::for_course(course) {
        RowLayout::Single { width, lap_count } => extractor.single_rows(&rows, width, lap_count)?,
        RowLayout::Paired { lap_count } => extractor.paired_rows(&rows, lap_count)?,
    };
    debug!(
        course = course.name,
        class = %class,
        rows = rows.len(),
        records = records.len(),
        "extracted history table"
    );
    Ok(records)
}

fn history_table<'a>(document: &'a Html, selectors: &Selectors) -> Result<ElementRef<'a>, ExtractionError> {
    document
        .select(&selectors.heading)
        .find(|heading| heading.text().collect::<String>().trim() == HISTORY_HEADING)
        .and_then(|heading| {
            heading
                .next_siblings()
                .filter_map(ElementRef::wrap)
                .find(|sibling| sibling.value().name() == "table")
        })
        .ok_or(ExtractionError::MissingHistoryTable)
}

fn cell_text(cell: &ElementRef<'_>) -> String {
    cell.text().collect::<String>().trim().to_string()
}

/// Columns shared by both layouts: date, time, player, country, days, laps.
struct RecordHead {
    date: Option<NaiveDate>,
    time_ms: u32,
    video_link: Option<String>,
    player: String,
    country: String,
    days: u32,
    lap_times: Option<Vec<u32>>,
}

struct RowExtractor<'s, 'c> {
    selectors: &'s Selectors,
    course: &'s Course<'c>,
    class: EngineClass,
}

impl RowExtractor<'_, '_> {
    fn single_rows(&self, rows: &[Row<'_>], width: usize, lap_count: usize) -> Result<Vec<Record>, ExtractionError> {
        let mut records = Vec::new();
        for (index, cells) in rows.iter().enumerate() {
            if cells.len() != width {
                continue;
            }
            let head = self.head(index, cells, lap_count)?;
            let tail = &cells[5 + lap_count..];
            records.push(self.record(
                head,
                fields::parse_counts(&cell_text(&tail[0]), lap_count),
                // tail[1] is the mushroom column, which is not kept for regular courses.
                None,
                [&tail[2], &tail[3], &tail[4], &tail[5]],
            ));
        }
        Ok(records)
    }

    /// Walks rows one at a time; a top row of the expected width consumes
    /// itself and the row below it. The bottom row's width is not checked
    /// beyond what is needed to read it.
    fn paired_rows(&self, rows: &[Row<'_>], lap_count: usize) -> Result<Vec<Record>, ExtractionError> {
        let mut records = Vec::new();
        let mut index = 0;
        while index < rows.len() {
            let top = &rows[index];
            if top.len() != PAIRED_TOP_ROW_WIDTH {
                index += 1;
                continue;
            }
            let bottom = rows
                .get(index + 1)
                .ok_or(ExtractionError::MissingBottomRow { row: index })?;
            if bottom.len() < PAIRED_BOTTOM_ROW_MIN_WIDTH {
                return Err(ExtractionError::ShortBottomRow {
                    row: index + 1,
                    cells: bottom.len(),
                });
            }

            let head = self.head(index, top, lap_count)?;
            let tail = &top[5 + lap_count..];
            records.push(self.record(
                head,
                fields::parse_counts(&cell_text(&tail[0]), lap_count),
                fields::parse_counts(&cell_text(&bottom[0]), lap_count),
                [&tail[1], &tail[2], &bottom[1], &bottom[2]],
            ));
            index += 2;
        }
        Ok(records)
    }

    fn head(&self, row: usize, cells: &[ElementRef<'_>], lap_count: usize) -> Result<RecordHead, ExtractionError> {
        let time_text = cell_text(&cells[1]);
        let time_ms = fields::parse_finish_time(&time_text)
            .ok_or(ExtractionError::FinishTime { row, text: time_text })?;
        let video_link = cells[1]
            .select(&self.selectors.anchor)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(str::to_string);

        let player = cells[2]
            .select(&self.selectors.anchor)
            .filter_map(|a| a.value().attr("href"))
            .find_map(fields::player_from_href)
            .ok_or(ExtractionError::MissingField { row, field: "player" })?;
        let country = cells[3]
            .select(&self.selectors.image)
            .find_map(|img| img.value().attr("title"))
            .map(str::to_string)
            .ok_or(ExtractionError::MissingField { row, field: "country" })?;

        let days_text = cell_text(&cells[4]);
        let days = fields::parse_days(&days_text).ok_or(ExtractionError::Days { row, text: days_text })?;

        let lap_cells: Vec<String> = cells[5..5 + lap_count].iter().map(cell_text).collect();

        Ok(RecordHead {
            date: fields::parse_date(&cell_text(&cells[0])),
            time_ms,
            video_link,
            player,
            country,
            days,
            lap_times: fields::parse_lap_times(lap_cells.as_slice()),
        })
    }

    fn record(
        &self,
        head: RecordHead,
        coins: Option<Vec<u32>>,
        mushrooms: Option<Vec<u32>>,
        build: [&ElementRef<'_>; 4],
    ) -> Record {
        let [character, kart, tyres, glider] = build.map(|cell| fields::parse_component(&cell_text(cell)));
        Record {
            course: self.course.id,
            engine_class: self.class,
            date: head.date,
            time_ms: head.time_ms,
            player: head.player,
            country: head.country,
            days: head.days,
            lap_times: head.lap_times,
            coins,
            mushrooms,
            character,
            kart,
            tyres,
            glider,
            video_link: head.video_link,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mkwr_core::{CourseRegistry, BABY_PARK};

    fn registry() -> CourseRegistry {
        CourseRegistry::embedded().expect("registry")
    }

    fn page(rows: &[String]) -> String {
        format!(
            "<html><body><h2>Current</h2><table><tr><td>ignored</td></tr></table>\
             <h2>History</h2><table>{}</table></body></html>",
            rows.join("")
        )
    }

    fn cells(values: &[&str]) -> String {
        let tds: String = values.iter().map(|v| format!("<td>{v}</td>")).collect();
        format!("<tr>{tds}</tr>")
    }

    const PLAYER: &str = r#"<a href="display.php?player=Test%20Player">Test Player</a>"#;
    const FLAG: &str = r#"<img src="flags/jp.png" title="Japan">"#;

    fn regular_row(time: &str, laps: [&str; 3], coins: &str) -> String {
        let mut values = vec!["2020-02-02", time, PLAYER, FLAG, "<1"];
        values.extend(laps);
        values.extend([coins, "1-1-1", "Mario", "-", "Roller", "-"]);
        cells(&values)
    }

    fn top_row(time: &str) -> String {
        let mut values = vec!["2019-09-09", time, PLAYER, FLAG, "4"];
        values.extend(["8.1", "8.2", "8.3", "8.4", "8.5", "8.6", "8.7"]);
        values.extend(["1-1-1-1-1-1-1", "Baby Peach", "Biddybuggy"]);
        cells(&values)
    }

    fn bottom_row(extra: usize) -> String {
        let mut values = vec!["0-0-0-0-0-0-1", "Azure Roller", "Cloud Glider"];
        values.extend(std::iter::repeat("x").take(extra));
        cells(&values)
    }

    #[test]
    fn regular_rows_need_exact_width() {
        let registry = registry();
        let course = registry.require("Mario Kart Stadium").unwrap();
        let html = page(&[
            "<tr><th>Date</th><th>Time</th></tr>".to_string(),
            regular_row("1'35\"617", ["32.581", "31.476", "31.560"], "3-3-3"),
            cells(&["Records before 2.0"]),
            cells(&["a"; 15]),
            regular_row("1'34\"998", ["-", "31.500", "31.499"], "3-2"),
        ]);

        let records = extract_page(&html, &course, EngineClass::Standard).unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.course, course.id);
        assert_eq!(first.engine_class, EngineClass::Standard);
        assert_eq!(first.time_ms, 95_617);
        assert_eq!(first.player, "Test Player");
        assert_eq!(first.country, "Japan");
        assert_eq!(first.days, 0);
        assert_eq!(first.lap_times, Some(vec![32_581, 31_476, 31_560]));
        assert_eq!(first.coins, Some(vec![3, 3, 3]));
        assert_eq!(first.mushrooms, None);
        assert_eq!(first.character.as_deref(), Some("Mario"));
        assert_eq!(first.kart, None);
        assert_eq!(first.tyres.as_deref(), Some("Roller"));
        assert_eq!(first.glider, None);

        let second = &records[1];
        assert_eq!(second.lap_times, None);
        assert_eq!(second.coins, None);
    }

    #[test]
    fn paired_rows_consume_two_rows_per_record() {
        let registry = registry();
        let course = registry.require(BABY_PARK).unwrap();
        let html = page(&[
            cells(&["heading"]),
            top_row("0'57\"123"),
            bottom_row(0),
            cells(&["2018", "divider"]),
            cells(&[]),
            top_row("0'56\"999"),
            bottom_row(2),
            cells(&["trailing heading"]),
        ]);

        let records = extract_page(&html, &course, EngineClass::High).unwrap();
        assert_eq!(records.len(), 2);
        for record in &records {
            assert_eq!(record.course, course.id);
            assert_eq!(record.engine_class, EngineClass::High);
            assert_eq!(record.days, 4);
            assert_eq!(
                record.lap_times,
                Some(vec![8_100, 8_200, 8_300, 8_400, 8_500, 8_600, 8_700])
            );
            assert_eq!(record.coins, Some(vec![1; 7]));
            assert_eq!(record.mushrooms, Some(vec![0, 0, 0, 0, 0, 0, 1]));
            assert_eq!(record.character.as_deref(), Some("Baby Peach"));
            assert_eq!(record.kart.as_deref(), Some("Biddybuggy"));
            assert_eq!(record.tyres.as_deref(), Some("Azure Roller"));
            assert_eq!(record.glider.as_deref(), Some("Cloud Glider"));
        }
        assert_eq!(records[0].time_ms, 57_123);
        assert_eq!(records[1].time_ms, 56_999);
    }

    #[test]
    fn paired_top_row_is_taken_even_when_next_row_is_another_top() {
        let registry = registry();
        let course = registry.require(BABY_PARK).unwrap();
        let html = page(&[top_row("0'57\"123"), top_row("0'56\"999"), bottom_row(0)]);

        let records = extract_page(&html, &course, EngineClass::Standard).unwrap();
        // The second top row was consumed as a bottom row; the third row is too narrow to start a record.
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].mushrooms, None);
        assert_eq!(records[0].tyres.as_deref(), Some("0'56\"999"));
    }

    #[test]
    fn paired_record_without_bottom_row_fails() {
        let registry = registry();
        let course = registry.require(BABY_PARK).unwrap();

        let html = page(&[top_row("0'57\"123")]);
        assert_eq!(
            extract_page(&html, &course, EngineClass::Standard),
            Err(ExtractionError::MissingBottomRow { row: 0 })
        );

        let html = page(&[top_row("0'57\"123"), cells(&["1-1-1-1-1-1-1", "Roller"])]);
        assert_eq!(
            extract_page(&html, &course, EngineClass::Standard),
            Err(ExtractionError::ShortBottomRow { row: 1, cells: 2 })
        );
    }

    #[test]
    fn malformed_finish_time_aborts_extraction() {
        let registry = registry();
        let course = registry.require("Water Park").unwrap();
        let html = page(&[
            regular_row("1'35\"617", ["32.581", "31.476", "31.560"], "3-3-3"),
            regular_row("1:35.617", ["32.581", "31.476", "31.560"], "3-3-3"),
        ]);
        assert_eq!(
            extract_page(&html, &course, EngineClass::Standard),
            Err(ExtractionError::FinishTime {
                row: 1,
                text: "1:35.617".to_string()
            })
        );
    }

    #[test]
    fn missing_player_link_is_an_error() {
        let registry = registry();
        let course = registry.require("Water Park").unwrap();
        let row = regular_row("1'35\"617", ["32.581", "31.476", "31.560"], "3-3-3")
            .replace(PLAYER, "Anonymous");
        assert_eq!(
            extract_page(&page(&[row]), &course, EngineClass::Standard),
            Err(ExtractionError::MissingField { row: 0, field: "player" })
        );
    }

    #[test]
    fn page_without_history_heading_fails() {
        let registry = registry();
        let course = registry.require("Water Park").unwrap();
        let html = "<html><body><h2>Current</h2><table></table></body></html>";
        assert_eq!(
            extract_page(html, &course, EngineClass::Standard),
            Err(ExtractionError::MissingHistoryTable)
        );
    }
}
