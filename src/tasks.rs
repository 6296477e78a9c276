//! Task snapshot import/export.
//!
//! Snapshots move through local files only and never pass through the
//! caching layer.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Eisenhower matrix quadrant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quadrant {
  #[serde(rename = "INBOX")]
  Inbox,
  /// Urgent and important
  A,
  /// Important, not urgent
  B,
  /// Urgent, not important
  C,
  /// Neither
  D,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
  pub id: String,
  pub content: String,
  pub quadrant: Quadrant,
  pub created_at: i64,
  pub completed: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub completed_at: Option<i64>,
}

/// Read a snapshot file.
///
/// Accepted when it is a JSON array that is either empty or whose first
/// record carries an `id`.
pub fn import_tasks(path: &Path) -> Result<Vec<Task>> {
  let contents = std::fs::read_to_string(path)
    .map_err(|e| eyre!("Failed to read backup file {}: {}", path.display(), e))?;

  let value: serde_json::Value = serde_json::from_str(&contents)
    .map_err(|e| eyre!("Failed to parse backup file {}: {}", path.display(), e))?;

  let valid = match value.as_array() {
    Some(records) => records.first().map_or(true, |first| {
      first
        .get("id")
        .and_then(|id| id.as_str())
        .is_some_and(|id| !id.is_empty())
    }),
    None => false,
  };
  if !valid {
    return Err(eyre!("Invalid backup file format: {}", path.display()));
  }

  serde_json::from_value(value)
    .map_err(|e| eyre!("Invalid task record in {}: {}", path.display(), e))
}

/// Calendar date a backup taken at `now` is named after, in UTC.
pub fn backup_date<Tz: TimeZone>(now: DateTime<Tz>) -> NaiveDate {
  now.with_timezone(&Utc).date_naive()
}

/// File name used for a backup taken on `date`.
pub fn backup_file_name(date: NaiveDate) -> String {
  format!("InnerOrder_Backup_{}.json", date.format("%Y-%m-%d"))
}

/// Write tasks as pretty-printed JSON into `dir`, returning the file path.
pub fn export_tasks(tasks: &[Task], dir: &Path, date: NaiveDate) -> Result<PathBuf> {
  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create export directory {}: {}", dir.display(), e))?;

  let path = dir.join(backup_file_name(date));
  let data =
    serde_json::to_string_pretty(tasks).map_err(|e| eyre!("Failed to serialize tasks: {}", e))?;

  std::fs::write(&path, data)
    .map_err(|e| eyre!("Failed to write backup file {}: {}", path.display(), e))?;

  Ok(path)
}
