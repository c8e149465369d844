use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use mkwr_core::{CourseId, CourseRegistry, EngineClass, Record, RecordError};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow};
use sqlx::{ConnectOptions, Connection, QueryBuilder, Row, Sqlite, SqliteConnection};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

pub const SNAPSHOT_EXTENSION: &str = "db";
pub const DEFAULT_KEEP_SNAPSHOTS: usize = 5;
pub const SCHEMA_VERSION: i64 = 1;

const ID_FORMAT: &str = "%Y-%m-%dT%H%M%S%.6f";
const ID_PARSE_FORMAT: &str = "%Y-%m-%dT%H%M%S%.f";

const CREATE_TABLE: &str = "
    CREATE TABLE records (
        course INTEGER NOT NULL,
        engine_class INTEGER NOT NULL,
        date DATE,
        time_ms INTEGER NOT NULL,
        player TEXT NOT NULL,
        country TEXT NOT NULL,
        days INTEGER NOT NULL,
        lap_times TEXT,
        coins TEXT,
        mushrooms TEXT,
        character TEXT,
        kart TEXT,
        tyres TEXT,
        glider TEXT,
        video_link TEXT
    )";
const SET_SCHEMA_VERSION: &str = "PRAGMA user_version = 1";
const INSERT_RECORD: &str = "
    INSERT INTO records (
        course, engine_class, date, time_ms, player, country, days,
        lap_times, coins, mushrooms, character, kart, tyres, glider, video_link
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";
const SELECT_RECORDS: &str = "
    SELECT course, engine_class, date, time_ms, player, country, days,
           lap_times, coins, mushrooms, character, kart, tyres, glider, video_link
    FROM records WHERE 1 = 1";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("{0}")]
    NotFound(String),
    #[error("refusing to write a snapshot with no records")]
    Empty,
    #[error("invalid record: {0}")]
    InvalidRecord(#[from] RecordError),
    #[error("snapshot {0} already exists")]
    AlreadyExists(SnapshotId),
    #[error("snapshot {id} is corrupt: {reason}")]
    Corrupt { id: SnapshotId, reason: String },
    #[error("snapshot {id} has schema version {found}, expected 1")]
    UnsupportedSchema { id: SnapshotId, found: i64 },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

fn io_error(context: String) -> impl FnOnce(std::io::Error) -> SnapshotError {
    move |source| SnapshotError::Io { context, source }
}

/// Identifier of a snapshot: its UTC creation time, e.g. `2024-01-15T103045.123456`.
///
/// The fixed-width format makes lexical order equal to temporal order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn from_timestamp(timestamp: DateTime<Utc>) -> Self {
        Self(timestamp.format(ID_FORMAT).to_string())
    }

    /// Accepts only ids in canonical form.
    pub fn parse(value: &str) -> Option<Self> {
        let naive = NaiveDateTime::parse_from_str(value, ID_PARSE_FORMAT).ok()?;
        let id = Self::from_timestamp(naive.and_utc());
        (id.0 == value).then_some(id)
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(&self.0, ID_PARSE_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn file_name(&self) -> String {
        format!("{}.{SNAPSHOT_EXTENSION}", self.0)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Row filter for [`SnapshotStore::read`]. Date bounds are inclusive; rows
/// without a date never match a bounded query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub course: Option<CourseId>,
    pub engine_class: Option<EngineClass>,
    pub min_date: Option<NaiveDate>,
    pub max_date: Option<NaiveDate>,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn course_class(course: CourseId, class: EngineClass) -> Self {
        Self {
            course: Some(course),
            engine_class: Some(class),
            ..Self::default()
        }
    }

    pub fn engine_class(class: EngineClass) -> Self {
        Self {
            engine_class: Some(class),
            ..Self::default()
        }
    }

    pub fn between(mut self, min_date: Option<NaiveDate>, max_date: Option<NaiveDate>) -> Self {
        self.min_date = min_date;
        self.max_date = max_date;
        self
    }
}

/// Encodes a lap sequence as comma-separated integers, e.g. `3,3,2`.
pub fn encode_sequence(values: &[u32]) -> String {
    values
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

pub fn decode_sequence(text: &str) -> Option<Vec<u32>> {
    if text.is_empty() {
        return None;
    }
    text.split(',').map(|part| part.parse().ok()).collect()
}

/// Directory of immutable, timestamp-named SQLite snapshot files.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    registry: Arc<CourseRegistry>,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>, registry: Arc<CourseRegistry>) -> Self {
        Self {
            root: root.into(),
            registry,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry(&self) -> &CourseRegistry {
        &self.registry
    }

    pub fn path_for(&self, id: &SnapshotId) -> PathBuf {
        self.root.join(id.file_name())
    }

    /// All snapshot ids, oldest first. A missing directory holds no snapshots.
    pub async fn list(&self) -> Result<Vec<SnapshotId>, SnapshotError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error(format!("listing {}", self.root.display()))(err)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_error(format!("listing {}", self.root.display())))?
        {
            let name = entry.file_name();
            let Some(stem) = name
                .to_str()
                .and_then(|n| n.strip_suffix(&format!(".{SNAPSHOT_EXTENSION}")))
            else {
                continue;
            };
            if let Some(id) = SnapshotId::parse(stem) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub async fn latest(&self) -> Result<SnapshotId, SnapshotError> {
        self.list().await?.pop().ok_or_else(|| {
            SnapshotError::NotFound(
                "no record snapshots found; run the scraper first".to_string(),
            )
        })
    }

    pub async fn second_latest(&self) -> Result<SnapshotId, SnapshotError> {
        let mut ids = self.list().await?;
        if ids.len() < 2 {
            return Err(SnapshotError::NotFound(format!(
                "need two snapshots to compare, found {}",
                ids.len()
            )));
        }
        ids.pop();
        ids.pop().ok_or_else(|| SnapshotError::NotFound("no previous snapshot".to_string()))
    }

    /// Persists `records` as a new snapshot named after the current UTC time.
    pub async fn write(&self, records: &[Record]) -> Result<SnapshotId, SnapshotError> {
        self.write_at(Utc::now(), records).await
    }

    /// Validates every record, writes to a temp file and renames it into
    /// place after the transaction commits.
    pub async fn write_at(
        &self,
        timestamp: DateTime<Utc>,
        records: &[Record],
    ) -> Result<SnapshotId, SnapshotError> {
        if records.is_empty() {
            return Err(SnapshotError::Empty);
        }
        for record in records {
            record.validate(&self.registry)?;
        }

        fs::create_dir_all(&self.root)
            .await
            .map_err(io_error(format!("creating {}", self.root.display())))?;

        let id = SnapshotId::from_timestamp(timestamp);
        let final_path = self.path_for(&id);
        if fs::try_exists(&final_path)
            .await
            .map_err(io_error(format!("checking {}", final_path.display())))?
        {
            return Err(SnapshotError::AlreadyExists(id));
        }

        let temp_path = self
            .root
            .join(format!(".{}.{SNAPSHOT_EXTENSION}.tmp", Uuid::new_v4()));
        if let Err(err) = write_database(&temp_path, records).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_error(format!(
                "renaming {} -> {}",
                temp_path.display(),
                final_path.display()
            ))(err));
        }

        info!(snapshot = %id, records = records.len(), "snapshot written");
        Ok(id)
    }

    /// Records of snapshot `id` matching `filter`, in storage order.
    pub async fn read(
        &self,
        id: &SnapshotId,
        filter: &RecordFilter,
    ) -> Result<Vec<Record>, SnapshotError> {
        let path = self.path_for(id);
        if !fs::try_exists(&path)
            .await
            .map_err(io_error(format!("checking {}", path.display())))?
        {
            return Err(SnapshotError::NotFound(format!("snapshot {id} does not exist")));
        }

        let mut conn = SqliteConnectOptions::new()
            .filename(&path)
            .read_only(true)
            .connect()
            .await?;

        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&mut conn)
            .await?;
        if version != SCHEMA_VERSION {
            conn.close().await?;
            return Err(SnapshotError::UnsupportedSchema {
                id: id.clone(),
                found: version,
            });
        }

        let mut query = QueryBuilder::<Sqlite>::new(SELECT_RECORDS);
        if let Some(course) = filter.course {
            query.push(" AND course = ").push_bind(course.index() as i64);
        }
        if let Some(class) = filter.engine_class {
            query.push(" AND engine_class = ").push_bind(class.is_high());
        }
        if let Some(min_date) = filter.min_date {
            query.push(" AND date >= ").push_bind(min_date);
        }
        if let Some(max_date) = filter.max_date {
            query.push(" AND date <= ").push_bind(max_date);
        }
        query.push(" ORDER BY rowid");

        let rows = query.build().fetch_all(&mut conn).await?;
        conn.close().await?;

        let records = rows
            .iter()
            .map(|row| self.decode_row(id, row))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(snapshot = %id, records = records.len(), ?filter, "snapshot read");
        Ok(records)
    }

    /// Deletes all but the `keep` most recent snapshots and returns the
    /// removed ids. Files that vanish concurrently are not an error.
    pub async fn prune(&self, keep: usize) -> Result<Vec<SnapshotId>, SnapshotError> {
        let ids = self.list().await?;
        let excess = ids.len().saturating_sub(keep);
        let mut removed = Vec::with_capacity(excess);
        for id in ids.into_iter().take(excess) {
            let path = self.path_for(&id);
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(io_error(format!("removing {}", path.display()))(err)),
            }
            info!(snapshot = %id, "pruned old snapshot");
            removed.push(id);
        }
        Ok(removed)
    }

    fn decode_row(&self, id: &SnapshotId, row: &SqliteRow) -> Result<Record, SnapshotError> {
        let corrupt = |reason: String| SnapshotError::Corrupt {
            id: id.clone(),
            reason,
        };

        let course_index: i64 = row.try_get("course")?;
        let course = CourseId::try_from(course_index)
            .ok()
            .filter(|course| self.registry.contains(*course))
            .ok_or_else(|| corrupt(format!("course index {course_index} is not in the registry")))?;

        let time_ms: i64 = row.try_get("time_ms")?;
        let days: i64 = row.try_get("days")?;
        let sequence = |column: &str| -> Result<Option<Vec<u32>>, SnapshotError> {
            match row.try_get::<Option<String>, _>(column)? {
                None => Ok(None),
                Some(text) => decode_sequence(&text)
                    .map(Some)
                    .ok_or_else(|| corrupt(format!("{column} holds {text:?}"))),
            }
        };

        Ok(Record {
            course,
            engine_class: EngineClass::from_is_high(row.try_get("engine_class")?),
            date: row.try_get("date")?,
            time_ms: u32::try_from(time_ms).map_err(|_| corrupt(format!("time_ms {time_ms}")))?,
            player: row.try_get("player")?,
            country: row.try_get("country")?,
            days: u32::try_from(days).map_err(|_| corrupt(format!("days {days}")))?,
            lap_times: sequence("lap_times")?,
            coins: sequence("coins")?,
            mushrooms: sequence("mushrooms")?,
            character: row.try_get("character")?,
            kart: row.try_get("kart")?,
            tyres: row.try_get("tyres")?,
            glider: row.try_get("glider")?,
            video_link: row.try_get("video_link")?,
        })
    }
}

async fn write_database(path: &Path, records: &[Record]) -> Result<(), SnapshotError> {
    let mut conn = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete)
        .connect()
        .await?;
    let result = insert_records(&mut conn, records).await;
    conn.close().await?;
    result
}

async fn insert_records(
    conn: &mut SqliteConnection,
    records: &[Record],
) -> Result<(), SnapshotError> {
    let mut tx = conn.begin().await?;
    sqlx::query(CREATE_TABLE).execute(&mut *tx).await?;
    sqlx::query(SET_SCHEMA_VERSION).execute(&mut *tx).await?;
    for record in records {
        sqlx::query(INSERT_RECORD)
            .bind(record.course.index() as i64)
            .bind(record.engine_class.is_high())
            .bind(record.date)
            .bind(i64::from(record.time_ms))
            .bind(&record.player)
            .bind(&record.country)
            .bind(i64::from(record.days))
            .bind(record.lap_times.as_deref().map(encode_sequence))
            .bind(record.coins.as_deref().map(encode_sequence))
            .bind(record.mushrooms.as_deref().map(encode_sequence))
            .bind(&record.character)
            .bind(&record.kart)
            .bind(&record.tyres)
            .bind(&record.glider)
            .bind(&record.video_link)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}
