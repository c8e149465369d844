//! Course registry and world-record domain model for MKWR.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// SHA-256 of the compact JSON encoding of `data/courses.json`.
pub const COURSES_DATA_HASH: &str =
    "2e51b7ed99b413da7bce323aba12ca53a668ce0e2db22eb5b11bd32ac0a10e08";
/// SHA-256 of the compact JSON encoding of `data/cups.json`.
pub const CUPS_DATA_HASH: &str = "8b120f6496c083766c30073a0fd418f1ad78a569ab4eb70da5ed3caaa13e8f09";

pub const COURSES_FILE: &str = "courses.json";
pub const CUPS_FILE: &str = "cups.json";

/// The one course whose history table spans two rows per record.
pub const BABY_PARK: &str = "GCN Baby Park";
pub const COURSES_PER_CUP: usize = 4;
pub const REGULAR_LAP_COUNT: usize = 3;
pub const BABY_PARK_LAP_COUNT: usize = 7;

const EMBEDDED_COURSES: &str = include_str!("../../../data/courses.json");
const EMBEDDED_CUPS: &str = include_str!("../../../data/cups.json");

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("integrity check failed for {file}: expected {expected}, got {actual}")]
    Integrity {
        file: String,
        expected: String,
        actual: String,
    },
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{courses} courses cannot be split into {cups} cups of 4")]
    Shape { courses: usize, cups: usize },
    #[error("unknown course {0:?}")]
    UnknownCourse(String),
}

/// Position of a course in the registry's fixed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CourseId(u16);

impl CourseId {
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl TryFrom<i64> for CourseId {
    type Error = std::num::TryFromIntError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u16::try_from(value).map(Self)
    }
}

impl fmt::Display for CourseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Engine class of a record: 150cc (standard) or 200cc (high).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineClass {
    Standard,
    High,
}

impl EngineClass {
    /// Scrape order: standard first, then high.
    pub const ALL: [EngineClass; 2] = [EngineClass::Standard, EngineClass::High];

    pub fn is_high(self) -> bool {
        matches!(self, EngineClass::High)
    }

    pub fn from_is_high(is_high: bool) -> Self {
        if is_high {
            EngineClass::High
        } else {
            EngineClass::Standard
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EngineClass::Standard => "150cc",
            EngineClass::High => "200cc",
        }
    }
}

impl fmt::Display for EngineClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EngineClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" | "150" | "150cc" => Ok(EngineClass::Standard),
            "high" | "200" | "200cc" => Ok(EngineClass::High),
            other => Err(format!("unknown engine class {other:?} (expected 150cc or 200cc)")),
        }
    }
}

/// One world record from a course/engine-class history table.
///
/// `lap_times`, `coins` and `mushrooms` are either complete (one entry per
/// lap of the course) or `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub course: CourseId,
    pub engine_class: EngineClass,
    pub date: Option<NaiveDate>,
    pub time_ms: u32,
    pub player: String,
    pub country: String,
    pub days: u32,
    pub lap_times: Option<Vec<u32>>,
    pub coins: Option<Vec<u32>>,
    pub mushrooms: Option<Vec<u32>>,
    pub character: Option<String>,
    pub kart: Option<String>,
    pub tyres: Option<String>,
    pub glider: Option<String>,
    pub video_link: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("course id {0} is not in the registry")]
    UnknownCourse(CourseId),
    #[error("{field} has {actual} entries but course {course} has {expected} laps")]
    LapFieldLength {
        course: CourseId,
        field: &'static str,
        expected: usize,
        actual: usize,
    },
}

impl Record {
    /// Checks the record against the registry it claims to belong to.
    pub fn validate(&self, registry: &CourseRegistry) -> Result<(), RecordError> {
        let course = registry
            .course(self.course)
            .ok_or(RecordError::UnknownCourse(self.course))?;
        for (field, values) in [
            ("lap_times", &self.lap_times),
            ("coins", &self.coins),
            ("mushrooms", &self.mushrooms),
        ] {
            if let Some(values) = values {
                if values.len() != course.lap_count {
                    return Err(RecordError::LapFieldLength {
                        course: self.course,
                        field,
                        expected: course.lap_count,
                        actual: values.len(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Borrowed view of one registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Course<'a> {
    pub id: CourseId,
    pub name: &'a str,
    pub cup: &'a str,
    pub lap_count: usize,
}

pub fn lap_count(course_name: &str) -> usize {
    if course_name == BABY_PARK {
        BABY_PARK_LAP_COUNT
    } else {
        REGULAR_LAP_COUNT
    }
}

/// Fixed, integrity-checked list of courses and the cups that group them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseRegistry {
    courses: Vec<String>,
    cups: Vec<String>,
}

impl CourseRegistry {
    /// Registry built from the reference data compiled into the binary.
    pub fn embedded() -> Result<Self, RegistryError> {
        Self::from_json(EMBEDDED_COURSES, EMBEDDED_CUPS)
    }

    /// Loads `courses.json` and `cups.json` from `dir`.
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let dir = dir.as_ref();
        let read = |name: &str| {
            let path = dir.join(name);
            std::fs::read_to_string(&path).map_err(|source| RegistryError::Io { path, source })
        };
        Self::from_json(&read(COURSES_FILE)?, &read(CUPS_FILE)?)
    }

    pub fn from_json(courses_json: &str, cups_json: &str) -> Result<Self, RegistryError> {
        let courses = parse_checked(COURSES_FILE, courses_json, COURSES_DATA_HASH)?;
        let cups = parse_checked(CUPS_FILE, cups_json, CUPS_DATA_HASH)?;
        if courses.len() != cups.len() * COURSES_PER_CUP {
            return Err(RegistryError::Shape {
                courses: courses.len(),
                cups: cups.len(),
            });
        }
        Ok(Self { courses, cups })
    }

    /// Hex SHA-256 over the compact JSON form of a name list.
    pub fn content_hash(names: &[String]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"[");
        for (i, name) in names.iter().enumerate() {
            if i > 0 {
                hasher.update(b",");
            }
            // A `&String` always serializes; the fallback is unreachable.
            let quoted = serde_json::to_string(name).unwrap_or_default();
            hasher.update(quoted.as_bytes());
        }
        hasher.update(b"]");
        hex::encode(hasher.finalize())
    }

    pub fn courses(&self) -> &[String] {
        &self.courses
    }

    pub fn cups(&self) -> &[String] {
        &self.cups
    }

    pub fn len(&self) -> usize {
        self.courses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.courses.is_empty()
    }

    pub fn contains(&self, id: CourseId) -> bool {
        id.index() < self.courses.len()
    }

    pub fn course(&self, id: CourseId) -> Option<Course<'_>> {
        let name = self.courses.get(id.index())?;
        let cup = self.cups.get(id.index() / COURSES_PER_CUP)?;
        Some(Course {
            id,
            name,
            cup,
            lap_count: lap_count(name),
        })
    }

    pub fn name(&self, id: CourseId) -> Option<&str> {
        self.courses.get(id.index()).map(String::as_str)
    }

    pub fn id_of(&self, name: &str) -> Option<CourseId> {
        self.courses
            .iter()
            .position(|c| c == name)
            .and_then(|i| u16::try_from(i).ok())
            .map(CourseId::new)
    }

    /// Like [`Self::id_of`], but reports an unknown name as an error.
    pub fn require(&self, name: &str) -> Result<Course<'_>, RegistryError> {
        self.id_of(name)
            .and_then(|id| self.course(id))
            .ok_or_else(|| RegistryError::UnknownCourse(name.to_string()))
    }

    pub fn cup_of(&self, id: CourseId) -> Option<&str> {
        self.course(id).map(|c| c.cup)
    }

    pub fn courses_in_cup(&self, cup: &str) -> Option<&[String]> {
        let index = self.cups.iter().position(|c| c == cup)?;
        let start = index * COURSES_PER_CUP;
        self.courses.get(start..start + COURSES_PER_CUP)
    }

    /// All courses in registry order.
    pub fn iter(&self) -> impl Iterator<Item = Course<'_>> + '_ {
        (0..self.courses.len())
            .filter_map(|i| u16::try_from(i).ok())
            .filter_map(|i| self.course(CourseId::new(i)))
    }
}

/// Parses a name list and checks its content hash. Data that no longer
/// parses as a list of strings fails the same integrity check.
fn parse_checked(file: &str, json: &str, expected: &str) -> Result<Vec<String>, RegistryError> {
    let names: Vec<String> = serde_json::from_str(json).map_err(|err| RegistryError::Integrity {
        file: file.to_string(),
        expected: expected.to_string(),
        actual: format!("unparseable ({err})"),
    })?;
    let actual = CourseRegistry::content_hash(&names);
    if actual != expected {
        return Err(RegistryError::Integrity {
            file: file.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(names)
}

/// Formats milliseconds as `M:SS.mmm`, e.g. 5128 -> `0:05.128`.
pub fn format_finish_time(ms: u32) -> String {
    let minutes = ms / 60_000;
    let seconds = (ms % 60_000) / 1000;
    let millis = ms % 1000;
    format!("{minutes}:{seconds:02}.{millis:03}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_record(course: CourseId) -> Record {
        Record {
            course,
            engine_class: EngineClass::Standard,
            date: NaiveDate::from_ymd_opt(2024, 1, 15),
            time_ms: 83_456,
            player: "Player".into(),
            country: "Japan".into(),
            days: 3,
            lap_times: Some(vec![27_000, 28_000, 28_456]),
            coins: Some(vec![3, 3, 2]),
            mushrooms: None,
            character: Some("Yoshi".into()),
            kart: None,
            tyres: None,
            glider: None,
            video_link: None,
        }
    }

    #[test]
    fn embedded_registry_passes_integrity_check() {
        let registry = CourseRegistry::embedded().expect("embedded registry");
        assert_eq!(registry.len(), 96);
        assert_eq!(registry.cups().len(), 24);
        assert_eq!(registry.courses()[0], "Mario Kart Stadium");
        assert_eq!(registry.cups()[0], "Mushroom");
    }

    #[test]
    fn one_changed_character_fails_integrity_check() {
        let tampered = EMBEDDED_COURSES.replacen("Water Park", "Water Pork", 1);
        let err = CourseRegistry::from_json(&tampered, EMBEDDED_CUPS).unwrap_err();
        assert!(matches!(err, RegistryError::Integrity { ref file, .. } if file == COURSES_FILE));

        let tampered = EMBEDDED_CUPS.replacen("Spiny", "Spinny", 1);
        let err = CourseRegistry::from_json(EMBEDDED_COURSES, &tampered).unwrap_err();
        assert!(matches!(err, RegistryError::Integrity { ref file, .. } if file == CUPS_FILE));
    }

    #[test]
    fn tamper_that_breaks_json_syntax_is_an_integrity_failure() {
        let tampered = EMBEDDED_COURSES.replacen("\"Water Park\"", "\"Water Park'", 1);
        assert_ne!(tampered, EMBEDDED_COURSES);
        let err = CourseRegistry::from_json(&tampered, EMBEDDED_CUPS).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Integrity { ref file, ref expected, .. }
                if file == COURSES_FILE && expected == COURSES_DATA_HASH
        ));
    }

    #[test]
    fn whitespace_does_not_affect_content_hash() {
        let compact: Vec<String> = serde_json::from_str(EMBEDDED_CUPS).unwrap();
        let reformatted = serde_json::to_string(&compact).unwrap();
        assert!(CourseRegistry::from_json(EMBEDDED_COURSES, &reformatted).is_ok());
    }

    #[test]
    fn lap_count_is_seven_only_for_baby_park() {
        let registry = CourseRegistry::embedded().unwrap();
        let baby_park = registry.require(BABY_PARK).unwrap();
        assert_eq!(baby_park.lap_count, 7);
        assert_eq!(baby_park.cup, "Crossing");
        let irregular = registry.iter().filter(|c| c.lap_count != 3).count();
        assert_eq!(irregular, 1);
    }

    #[test]
    fn cups_own_four_consecutive_courses() {
        let registry = CourseRegistry::embedded().unwrap();
        assert_eq!(
            registry.courses_in_cup("Crossing").unwrap(),
            ["GCN Baby Park", "GBA Cheese Land", "Wild Woods", "Animal Crossing"]
        );
        let id = registry.id_of("Wii Rainbow Road").unwrap();
        assert_eq!(registry.cup_of(id), Some("Spiny"));
        assert!(registry.courses_in_cup("Banana Peel").is_none());
    }

    #[test]
    fn load_from_dir_reads_both_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(COURSES_FILE), EMBEDDED_COURSES).unwrap();
        std::fs::write(dir.path().join(CUPS_FILE), EMBEDDED_CUPS).unwrap();
        let registry = CourseRegistry::load_from_dir(dir.path()).unwrap();
        assert_eq!(registry, CourseRegistry::embedded().unwrap());

        std::fs::remove_file(dir.path().join(CUPS_FILE)).unwrap();
        assert!(matches!(
            CourseRegistry::load_from_dir(dir.path()),
            Err(RegistryError::Io { .. })
        ));
    }

    #[test]
    fn validate_rejects_unknown_course_and_partial_laps() {
        let registry = CourseRegistry::embedded().unwrap();
        assert!(sample_record(CourseId::new(0)).validate(&registry).is_ok());

        let unknown = sample_record(CourseId::new(96));
        assert_eq!(
            unknown.validate(&registry),
            Err(RecordError::UnknownCourse(CourseId::new(96)))
        );

        let mut partial = sample_record(CourseId::new(0));
        partial.coins = Some(vec![3, 3]);
        assert!(matches!(
            partial.validate(&registry),
            Err(RecordError::LapFieldLength { field: "coins", expected: 3, actual: 2, .. })
        ));

        // Three laps are wrong for the seven-lap course.
        let baby_park = registry.id_of(BABY_PARK).unwrap();
        assert!(sample_record(baby_park).validate(&registry).is_err());
    }

    #[test]
    fn engine_class_parses_common_spellings() {
        assert_eq!("200cc".parse::<EngineClass>(), Ok(EngineClass::High));
        assert_eq!("Standard".parse::<EngineClass>(), Ok(EngineClass::Standard));
        assert!("100cc".parse::<EngineClass>().is_err());
        assert!(EngineClass::from_is_high(true).is_high());
    }

    #[test]
    fn finish_time_formatting_pads_fields() {
        assert_eq!(format_finish_time(5128), "0:05.128");
        assert_eq!(format_finish_time(83_456), "1:23.456");
        assert_eq!(format_finish_time(600_000), "10:00.000");
    }
}
