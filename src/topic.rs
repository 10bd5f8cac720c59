//! Per-topic index records.
//!
//! Every accessor takes a caller-supplied [`Txn`] so several reads and writes
//! can be composed into one atomic step; values only become durable when that
//! transaction commits. Accessors never touch chunk files.
//!
//! Record layout inside the topic namespace:
//!
//! ```text
//! producer_head               u64 LE   next logical offset to write
//! producer_head_file          u64 LE chunk, u64 LE byte offset
//! consumer_head/<name>        u64 LE   next logical offset <name> reads
//! consumer_head_file/<name>   u64 LE chunk, u64 LE byte offset
//! chunk_base/<chunk u64 BE>   u64 LE   logical offset of the chunk's first record
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::chunk::ChunkCursor;
use crate::env::{Environment, TopicDb, Txn};
use crate::{Error, Result};

const PRODUCER_HEAD: &[u8] = b"producer_head";
const PRODUCER_HEAD_FILE: &[u8] = b"producer_head_file";
const CONSUMER_HEAD_PREFIX: &[u8] = b"consumer_head/";
const CONSUMER_HEAD_FILE_PREFIX: &[u8] = b"consumer_head_file/";
const CHUNK_BASE_PREFIX: &[u8] = b"chunk_base/";
// `data.mdb` and `lock.mdb` live next to the topic directories.
const STORE_FILE_SUFFIX: &str = ".mdb";

/// Read-only snapshot of a topic's positions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicStatus {
    pub producer_head: u64,
    pub consumer_heads: BTreeMap<String, u64>,
}

/// A named queue inside an [`Environment`].
#[derive(Clone)]
pub struct Topic {
    env: Environment,
    name: String,
    db: TopicDb,
    chunk_dir: PathBuf,
}

impl Topic {
    pub fn open(env: &Environment, name: &str) -> Result<Self> {
        validate_topic_name(name)?;
        let db = env.get_topic_db(name)?;
        Ok(Self {
            env: env.clone(),
            name: name.to_string(),
            db,
            chunk_dir: env.path().join(name),
        })
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding this topic's chunk files.
    pub fn chunk_dir(&self) -> &Path {
        &self.chunk_dir
    }

    pub fn producer_head(&self, txn: &Txn<'_>) -> Result<u64> {
        read_u64(txn.get(self.db, PRODUCER_HEAD)?)
    }

    pub fn set_producer_head(&self, txn: &mut Txn<'_>, head: u64) -> Result<()> {
        txn.put(self.db, PRODUCER_HEAD, &head.to_le_bytes())
    }

    pub fn producer_head_file(&self, txn: &Txn<'_>) -> Result<ChunkCursor> {
        read_cursor(txn.get(self.db, PRODUCER_HEAD_FILE)?)
    }

    pub fn set_producer_head_file(&self, txn: &mut Txn<'_>, cursor: ChunkCursor) -> Result<()> {
        txn.put(self.db, PRODUCER_HEAD_FILE, &encode_cursor(cursor))
    }

    /// Next logical offset for `name`; 0 if it never committed a position.
    pub fn consumer_head(&self, txn: &Txn<'_>, name: &str) -> Result<u64> {
        read_u64(txn.get(self.db, &consumer_key(CONSUMER_HEAD_PREFIX, name))?)
    }

    pub fn set_consumer_head(&self, txn: &mut Txn<'_>, name: &str, head: u64) -> Result<()> {
        txn.put(
            self.db,
            &consumer_key(CONSUMER_HEAD_PREFIX, name),
            &head.to_le_bytes(),
        )
    }

    pub fn consumer_head_file(&self, txn: &Txn<'_>, name: &str) -> Result<ChunkCursor> {
        read_cursor(txn.get(self.db, &consumer_key(CONSUMER_HEAD_FILE_PREFIX, name))?)
    }

    pub fn set_consumer_head_file(
        &self,
        txn: &mut Txn<'_>,
        name: &str,
        cursor: ChunkCursor,
    ) -> Result<()> {
        txn.put(
            self.db,
            &consumer_key(CONSUMER_HEAD_FILE_PREFIX, name),
            &encode_cursor(cursor),
        )
    }

    /// Whether `name` has ever committed a position.
    pub fn is_registered(&self, txn: &Txn<'_>, name: &str) -> Result<bool> {
        Ok(txn
            .get(self.db, &consumer_key(CONSUMER_HEAD_FILE_PREFIX, name))?
            .is_some())
    }

    /// Logical offset of the first record stored in `chunk`, if recorded.
    pub fn chunk_base(&self, txn: &Txn<'_>, chunk: u64) -> Result<Option<u64>> {
        match txn.get(self.db, &chunk_base_key(chunk))? {
            Some(bytes) => decode_u64(bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn set_chunk_base(&self, txn: &mut Txn<'_>, chunk: u64, base: u64) -> Result<()> {
        txn.put(self.db, &chunk_base_key(chunk), &base.to_le_bytes())
    }

    pub fn remove_chunk_base(&self, txn: &mut Txn<'_>, chunk: u64) -> Result<()> {
        txn.delete(self.db, &chunk_base_key(chunk))?;
        Ok(())
    }

    /// Snapshot of the producer head and every registered consumer head.
    pub fn status(&self) -> Result<TopicStatus> {
        let txn = self.env.read_txn()?;
        let producer_head = self.producer_head(&txn)?;
        let mut consumer_heads = BTreeMap::new();
        for (key, value) in txn.scan_prefix(self.db, CONSUMER_HEAD_PREFIX)? {
            let name = String::from_utf8_lossy(&key[CONSUMER_HEAD_PREFIX.len()..]).into_owned();
            consumer_heads.insert(name, decode_u64(&value)?);
        }
        txn.commit()?;
        Ok(TopicStatus {
            producer_head,
            consumer_heads,
        })
    }
}

fn validate_topic_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidConfig("topic name cannot be empty".to_string()));
    }
    if name.starts_with('.') || name.contains(['/', '\\', '\0']) {
        return Err(Error::InvalidConfig(format!(
            "topic name `{name}` is not a valid directory name"
        )));
    }
    if name.ends_with(STORE_FILE_SUFFIX) {
        return Err(Error::InvalidConfig(format!(
            "topic name `{name}` collides with the store's own files"
        )));
    }
    Ok(())
}

fn consumer_key(prefix: &[u8], name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + name.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(name.as_bytes());
    key
}

fn chunk_base_key(chunk: u64) -> Vec<u8> {
    // Big-endian so chunk bases sort by chunk index.
    let mut key = Vec::with_capacity(CHUNK_BASE_PREFIX.len() + 8);
    key.extend_from_slice(CHUNK_BASE_PREFIX);
    key.extend_from_slice(&chunk.to_be_bytes());
    key
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let buf: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::CorruptIndex("head record has unexpected size"))?;
    Ok(u64::from_le_bytes(buf))
}

fn read_u64(bytes: Option<&[u8]>) -> Result<u64> {
    bytes.map_or(Ok(0), decode_u64)
}

fn encode_cursor(cursor: ChunkCursor) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[0..8].copy_from_slice(&cursor.chunk.to_le_bytes());
    buf[8..16].copy_from_slice(&cursor.offset.to_le_bytes());
    buf
}

fn read_cursor(bytes: Option<&[u8]>) -> Result<ChunkCursor> {
    let Some(bytes) = bytes else {
        return Ok(ChunkCursor::default());
    };
    if bytes.len() != 16 {
        return Err(Error::CorruptIndex("cursor record has unexpected size"));
    }
    Ok(ChunkCursor::new(decode_u64(&bytes[0..8])?, decode_u64(&bytes[8..16])?))
}
