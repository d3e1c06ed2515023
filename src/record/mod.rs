use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::Serialize;
use thiserror::Error;

/// Topic stamped on every record file.
pub const TOPIC: &str = "energy_log/notify";

/// Timestamp format inside the record.
const MESSAGE_TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// Timestamp format in the record file name.
const FILE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Aggregate stream a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Mean power over one minute, in W.
    InstantaneousPower,
    /// Energy over one half hour, in kWh.
    Energy,
}

impl RecordKind {
    /// Synthetic device id that tells the two streams apart downstream.
    pub const fn device_id(self) -> u32 {
        match self {
            Self::InstantaneousPower => 2,
            Self::Energy => 3,
        }
    }

    pub const fn topic(self) -> &'static str {
        TOPIC
    }

    pub const fn unit(self) -> &'static str {
        match self {
            Self::InstantaneousPower => "W",
            Self::Energy => "kWh",
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InstantaneousPower => "instantaneous_power",
            Self::Energy => "energy",
        }
    }
}

/// One aggregation result.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRecord {
    pub kind: RecordKind,
    /// Local wall-clock time of the aggregation boundary.
    pub timestamp: NaiveDateTime,
    pub value: f64,
}

#[derive(Serialize)]
struct Envelope<'a> {
    topic: &'a str,
    message: Message,
}

#[derive(Serialize)]
struct Message {
    device_id: u32,
    datetime: String,
    power: f64,
}

impl AggregateRecord {
    pub fn new(kind: RecordKind, timestamp: NaiveDateTime, value: f64) -> Self {
        Self {
            kind,
            timestamp,
            value,
        }
    }

    pub fn device_id(&self) -> u32 {
        self.kind.device_id()
    }

    /// Deterministic file name: `{device_id}_{YYYY-MM-DDTHH:MM:SS}.json`.
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}.json",
            self.device_id(),
            self.timestamp.format(FILE_TIME_FORMAT)
        )
    }

    /// Serialize to the JSON document written to disk.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&Envelope {
            topic: self.kind.topic(),
            message: Message {
                device_id: self.device_id(),
                datetime: self.timestamp.format(MESSAGE_TIME_FORMAT).to_string(),
                power: self.value,
            },
        })
    }
}

/// Errors raised while persisting a record.
#[derive(Error, Debug)]
pub enum EmitError {
    #[error("serializing record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("writing {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
}

/// Persists aggregate records.
pub trait Emitter: Send + Sync {
    /// Returns the emitter name for logging.
    fn name(&self) -> &str;

    /// Persist one record, returning where it went.
    fn emit(&self, record: &AggregateRecord) -> Result<PathBuf, EmitError>;
}

/// Writes each record to its own JSON file in a directory.
#[derive(Debug, Clone)]
pub struct FileEmitter {
    data_dir: PathBuf,
}

impl FileEmitter {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

impl Emitter for FileEmitter {
    fn name(&self) -> &str {
        "file"
    }

    fn emit(&self, record: &AggregateRecord) -> Result<PathBuf, EmitError> {
        let body = record.to_json()?;
        let path = self.data_dir.join(record.file_name());

        std::fs::write(&path, body).map_err(|source| EmitError::Write {
            path: path.clone(),
            source,
        })?;

        Ok(path)
    }
}
