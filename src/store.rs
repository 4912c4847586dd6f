use std::{
    io,
    path::{Path, PathBuf},
};

use chrono::Utc;
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};

use crate::defs::{FanAssignment, FanStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("Malformed assignment row: {row:?}")]
    MalformedRow { row: String },

    #[error("Wrote {written} assignment rows, expected {expected}")]
    RowCount { written: usize, expected: usize },
}

/* == Assignment store == */

/// Durable `(room, status, pin)` rows behind the registry's load/save
/// contract. Saves are full replacements committed with a rename, so a
/// crash mid-write leaves the previous state intact.
pub struct AssignmentStore {
    path: PathBuf,
}

impl AssignmentStore {
    const HEADER: &'static str = "room,status,pin";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        AssignmentStore { path: path.into() }
    }

    pub async fn load(&self) -> Result<Vec<FanAssignment>, StoreError> {
        let data = match fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(
                    path = %self.path.display(),
                    "Assignment file not found, no fans loaded"
                );
                return Ok(Vec::new());
            }
            Err(error) => return Err(error.into()),
        };

        data.lines()
            .skip(1)
            .filter(|line| !line.is_empty())
            .map(parse_row)
            .collect()
    }

    pub async fn save(&self, assignments: &[FanAssignment]) -> Result<(), StoreError> {
        let mut contents = String::from(Self::HEADER);
        contents.push('\n');

        for fan in assignments {
            contents.push_str(&format!("{},{},{}\n", fan.room, fan.status, fan.pin));
        }

        let staging = self.path.with_extension("tmp");
        fs::write(&staging, &contents).await?;

        // Verify the row count landed on disk before replacing the old state
        let written = fs::read_to_string(&staging).await?;
        let rows = written.lines().skip(1).filter(|l| !l.is_empty()).count();

        if rows != assignments.len() {
            let _ = fs::remove_file(&staging).await;
            return Err(StoreError::RowCount {
                written: rows,
                expected: assignments.len(),
            });
        }

        fs::rename(&staging, &self.path).await?;
        Ok(())
    }
}

fn parse_row(row: &str) -> Result<FanAssignment, StoreError> {
    let malformed = || StoreError::MalformedRow { row: row.to_owned() };

    let mut fields = row.split(',');
    let room = fields.next().ok_or_else(malformed)?;
    let status = fields.next().ok_or_else(malformed)?;
    let pin = fields.next().ok_or_else(malformed)?;

    if room.is_empty() || fields.next().is_some() {
        return Err(malformed());
    }

    Ok(FanAssignment {
        room: room.to_owned(),
        status: status.parse().map_err(|_| malformed())?,
        pin: pin.parse().map_err(|_| malformed())?,
        last_co2: None,
    })
}

/* == Runtime log == */

/// Append-only `(room, action, timestamp)` event feed consumed by external
/// analytics. Append failures are logged, never raised.
pub struct RuntimeLog {
    path: PathBuf,
}

impl RuntimeLog {
    const HEADER: &'static str = "room,action,timestamp";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        RuntimeLog { path: path.into() }
    }

    pub async fn append(&self, room: &str, action: FanStatus) {
        if let Err(error) = append_row(&self.path, room, action).await {
            tracing::warn!(%error, room, "Failed to append runtime log entry");
        }
    }
}

async fn append_row(path: &Path, room: &str, action: FanStatus) -> io::Result<()> {
    let mut row = String::new();

    if !fs::try_exists(path).await? {
        row.push_str(RuntimeLog::HEADER);
        row.push('\n');
    }

    row.push_str(&format!("{room},{action},{}\n", Utc::now().to_rfc3339()));

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;

    file.write_all(row.as_bytes()).await
}
