//! Best-time changes between consecutive snapshots.

use std::collections::BTreeMap;

use mkwr_core::{CourseId, EngineClass, Record};
use mkwr_storage::{RecordFilter, SnapshotError, SnapshotId, SnapshotStore};
use serde::Serialize;
use tracing::info;

/// A course/engine-class pair whose best time dropped between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewRecord {
    pub course: CourseId,
    pub engine_class: EngineClass,
    pub previous_time_ms: u32,
    pub improvement_ms: u32,
    /// The record holding the new best time.
    pub record: Record,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDelta {
    pub previous: SnapshotId,
    pub current: SnapshotId,
    pub new_records: Vec<NewRecord>,
}

/// Lowest-time record per course/engine-class pair. The first record wins a tie.
pub fn best_times(records: &[Record]) -> BTreeMap<(CourseId, EngineClass), &Record> {
    let mut best: BTreeMap<(CourseId, EngineClass), &Record> = BTreeMap::new();
    for record in records {
        best.entry((record.course, record.engine_class))
            .and_modify(|held| {
                if record.time_ms < held.time_ms {
                    *held = record;
                }
            })
            .or_insert(record);
    }
    best
}

/// Pairs whose best time in `current` is strictly lower than in `previous`,
/// ordered by course then engine class. Pairs absent from `previous` are
/// not reported.
pub fn compute_new_records(previous: &[Record], current: &[Record]) -> Vec<NewRecord> {
    let previous = best_times(previous);
    best_times(current)
        .into_iter()
        .filter_map(|(key, best)| {
            let before = previous.get(&key)?;
            (best.time_ms < before.time_ms).then(|| NewRecord {
                course: key.0,
                engine_class: key.1,
                previous_time_ms: before.time_ms,
                improvement_ms: before.time_ms - best.time_ms,
                record: best.clone(),
            })
        })
        .collect()
}

/// Compares the two most recent snapshots in `store`.
pub async fn new_records_since_previous(store: &SnapshotStore) -> Result<SnapshotDelta, SnapshotError> {
    let previous = store.second_latest().await?;
    let current = store.latest().await?;
    let filter = RecordFilter::all();
    let before = store.read(&previous, &filter).await?;
    let after = store.read(&current, &filter).await?;

    let new_records = compute_new_records(&before, &after);
    info!(
        previous = %previous,
        current = %current,
        new_records = new_records.len(),
        "compared snapshots"
    );
    Ok(SnapshotDelta {
        previous,
        current,
        new_records,
    })
}
