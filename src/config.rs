//! Queue configuration.
//!
//! Numeric options follow a single policy: a value outside its valid range is
//! ignored (with a warning) and the default is used instead.

use std::path::PathBuf;

use serde_json::Value;

use crate::{Error, Result};

/// Default maximum chunk file size (1 GiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024 * 1024;
/// Default number of closed chunks a producer retains.
pub const DEFAULT_CHUNKS_TO_KEEP: u64 = 8;
/// Default number of records pulled per consumer refill.
pub const DEFAULT_BATCH_SIZE: usize = 128;
/// Exclusive upper bound for the consumer batch size.
pub const MAX_BATCH_SIZE: usize = 1024 * 1024;
/// Default LMDB map size (1 GiB).
pub const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;
/// Default maximum number of named databases (one per topic).
pub const DEFAULT_MAX_DBS: u32 = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnvConfig {
    pub map_size: usize,
    pub max_dbs: u32,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            map_size: DEFAULT_MAP_SIZE,
            max_dbs: DEFAULT_MAX_DBS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProducerConfig {
    /// Maximum bytes per chunk file. A record larger than this still gets a
    /// chunk of its own.
    pub chunk_size: u64,
    /// Closed chunks kept on disk behind the active one.
    pub chunks_to_keep: u64,
    /// Sync chunk data to disk before the index head is committed.
    pub sync: bool,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunks_to_keep: DEFAULT_CHUNKS_TO_KEEP,
            sync: true,
        }
    }
}

impl ProducerConfig {
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        if chunk_size == 0 {
            log::warn!("ignoring chunk size 0, using {DEFAULT_CHUNK_SIZE}");
            self.chunk_size = DEFAULT_CHUNK_SIZE;
        } else {
            self.chunk_size = chunk_size;
        }
        self
    }

    pub fn with_chunks_to_keep(mut self, chunks_to_keep: u64) -> Self {
        self.chunks_to_keep = chunks_to_keep;
        self
    }

    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }
}

/// Where a consumer starts when its saved chunk is no longer on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartMode {
    /// Resume from the saved position; fail with `MissingChunk` if retention
    /// removed it.
    ResumeStrict,
    /// Resume from the saved position; if it is gone, snap to the oldest
    /// retained chunk.
    ResumeEarliest,
    /// Resume from the saved position; if it is gone, snap to the producer head.
    ResumeLatest,
}

impl Default for StartMode {
    fn default() -> Self {
        Self::ResumeStrict
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub batch_size: usize,
    pub start_mode: StartMode,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            start_mode: StartMode::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        if batch_size > 0 && batch_size < MAX_BATCH_SIZE {
            self.batch_size = batch_size;
        } else {
            log::warn!("ignoring batch size {batch_size}, using {DEFAULT_BATCH_SIZE}");
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        self
    }

    pub fn with_start_mode(mut self, start_mode: StartMode) -> Self {
        self.start_mode = start_mode;
        self
    }
}

/// Construction options as handed over by a host binding or tool, e.g.
/// `{"path": "/var/q", "topic": "events", "name": "indexer", "batchSize": 64}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueOptions {
    pub path: PathBuf,
    pub topic: String,
    pub name: Option<String>,
    pub chunk_size: Option<u64>,
    pub chunks_to_keep: Option<u64>,
    pub batch_size: Option<u64>,
}

impl QueueOptions {
    pub fn new(path: impl Into<PathBuf>, topic: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            topic: topic.into(),
            name: None,
            chunk_size: None,
            chunks_to_keep: None,
            batch_size: None,
        }
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::InvalidConfig("options must be an object".to_string()))?;
        let path = required_string(value, "path")?;
        let topic = required_string(value, "topic")?;
        let name = match object.get("name") {
            Some(Value::String(name)) => Some(name.clone()),
            _ => None,
        };
        Ok(Self {
            path: PathBuf::from(path),
            topic,
            name,
            chunk_size: number_option(value, "chunkSize"),
            chunks_to_keep: number_option(value, "chunksToKeep"),
            batch_size: number_option(value, "batchSize"),
        })
    }

    pub fn producer_config(&self) -> ProducerConfig {
        let mut config = ProducerConfig::default();
        if let Some(chunk_size) = self.chunk_size {
            config = config.with_chunk_size(chunk_size);
        }
        if let Some(chunks_to_keep) = self.chunks_to_keep {
            config = config.with_chunks_to_keep(chunks_to_keep);
        }
        config
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        let mut config = ConsumerConfig::default();
        if let Some(batch_size) = self.batch_size {
            let batch_size = usize::try_from(batch_size).unwrap_or(0);
            config = config.with_batch_size(batch_size);
        }
        config
    }

    pub fn consumer_name(&self) -> Result<&str> {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => Ok(name),
            _ => Err(Error::InvalidConfig("consumer requires a name".to_string())),
        }
    }
}

fn required_string(value: &Value, key: &str) -> Result<String> {
    match value.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        _ => Err(Error::InvalidConfig(format!("missing option `{key}`"))),
    }
}

fn number_option(value: &Value, key: &str) -> Option<u64> {
    let raw = value.get(key)?;
    match raw.as_f64() {
        Some(n) if n.is_finite() && n >= 0.0 => Some(n as u64),
        _ => {
            log::warn!("ignoring malformed option `{key}`: {raw}");
            None
        }
    }
}
