//! Named, independently positioned readers.
//!
//! A consumer pulls records in batches. Each refill commits the consumer's
//! new position before any record of the batch is handed out, so delivery is
//! at-most-once: records cached in memory when the process dies are skipped
//! on restart, never repeated.

use std::collections::VecDeque;

use crate::chunk::{discover_chunks, ChunkCursor, ChunkStore};
use crate::config::{ConsumerConfig, QueueOptions, StartMode};
use crate::env::{Environment, EnvironmentRegistry, Txn};
use crate::topic::Topic;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerState {
    /// Position not loaded from the index yet.
    Resuming,
    /// Records of the current batch remain in memory.
    Cached,
    /// The current batch is drained; the next pop refills.
    Exhausted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Position {
    head: u64,
    cursor: ChunkCursor,
}

pub struct Consumer {
    topic: Topic,
    name: String,
    config: ConsumerConfig,
    chunks: ChunkStore,
    position: Option<Position>,
    batch: VecDeque<Vec<u8>>,
    // Logical offset of the front of `batch`.
    next_offset: u64,
    last_offset: Option<u64>,
}

impl Consumer {
    pub fn open(env: &Environment, topic: &str, name: &str, config: ConsumerConfig) -> Result<Self> {
        Self::for_topic(Topic::open(env, topic)?, name, config)
    }

    pub fn from_options(registry: &EnvironmentRegistry, options: &QueueOptions) -> Result<Self> {
        let name = options.consumer_name()?;
        let env = registry.get_or_open(&options.path)?;
        Self::open(&env, &options.topic, name, options.consumer_config())
    }

    pub fn for_topic(topic: Topic, name: &str, config: ConsumerConfig) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::InvalidConfig("consumer requires a name".to_string()));
        }
        let chunks = ChunkStore::open(topic.chunk_dir())?;
        Ok(Self {
            topic,
            name: name.to_string(),
            config,
            chunks,
            position: None,
            batch: VecDeque::new(),
            next_offset: 0,
            last_offset: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn state(&self) -> ConsumerState {
        if !self.batch.is_empty() {
            ConsumerState::Cached
        } else if self.position.is_none() {
            ConsumerState::Resuming
        } else {
            ConsumerState::Exhausted
        }
    }

    /// Logical offset of the record most recently returned by [`pop`].
    ///
    /// [`pop`]: Consumer::pop
    pub fn offset(&self) -> Option<u64> {
        self.last_offset
    }

    /// Next record, or `None` when the consumer has caught up with the
    /// producer.
    pub fn pop(&mut self) -> Result<Option<Vec<u8>>> {
        if self.batch.is_empty() && !self.refill()? {
            return Ok(None);
        }
        Ok(self.take_front())
    }

    pub fn pop_string(&mut self) -> Result<Option<String>> {
        Ok(self.pop()?.map(String::from_utf8).transpose()?)
    }

    fn take_front(&mut self) -> Option<Vec<u8>> {
        let record = self.batch.pop_front()?;
        self.last_offset = Some(self.next_offset);
        self.next_offset += 1;
        Some(record)
    }

    fn refill(&mut self) -> Result<bool> {
        let txn = self.topic.env().read_txn()?;
        let producer_head = self.topic.producer_head(&txn)?;
        let producer_cursor = self.topic.producer_head_file(&txn)?;
        let position = match self.position {
            Some(position) => position,
            None => self.load_position(&txn, producer_head, producer_cursor)?,
        };
        let mut position = self.reconcile(&txn, position, producer_head, producer_cursor)?;
        txn.commit()?;
        self.position = Some(position);

        let mut records = Vec::new();
        let mut cursor = position.cursor;
        loop {
            if position.head > producer_head {
                return Err(Error::CorruptIndex("consumer head is ahead of producer head"));
            }
            let wanted = (producer_head - position.head).min(self.config.batch_size as u64) as usize;
            if records.len() >= wanted {
                break;
            }

            // Retention may remove the next chunk while this batch is read.
            if !self.chunks.chunk_exists(cursor.chunk) {
                if !records.is_empty() {
                    break;
                }
                let txn = self.topic.env().read_txn()?;
                let stale = Position {
                    head: position.head,
                    cursor,
                };
                position = self.reconcile(&txn, stale, producer_head, producer_cursor)?;
                txn.commit()?;
                self.position = Some(position);
                if !self.chunks.chunk_exists(position.cursor.chunk) {
                    break;
                }
                cursor = position.cursor;
                continue;
            }

            let limit = if cursor.chunk == producer_cursor.chunk {
                Some(producer_cursor.offset)
            } else if cursor.chunk < producer_cursor.chunk {
                None
            } else {
                return Err(Error::CorruptIndex("consumer cursor is ahead of producer cursor"));
            };
            let read = self.chunks.read(cursor, wanted - records.len(), limit)?;
            records.extend(read.records);
            cursor = read.cursor;

            if read.end_of_chunk && cursor.chunk < producer_cursor.chunk {
                cursor = ChunkCursor::new(cursor.chunk + 1, 0);
            } else if records.len() < wanted {
                return Err(Error::CorruptIndex("chunk data ends before the producer head"));
            }
        }
        if records.is_empty() {
            return Ok(false);
        }

        let head = position.head + records.len() as u64;
        let mut txn = self.topic.env().write_txn()?;
        self.topic.set_consumer_head(&mut txn, &self.name, head)?;
        self.topic.set_consumer_head_file(&mut txn, &self.name, cursor)?;
        txn.commit()?;

        log::trace!(
            "consumer {} of {} took {} records (head {})",
            self.name,
            self.topic.name(),
            records.len(),
            head
        );
        self.next_offset = position.head;
        self.position = Some(Position { head, cursor });
        self.batch = records.into();
        Ok(true)
    }

    fn load_position(
        &self,
        txn: &Txn<'_>,
        producer_head: u64,
        producer_cursor: ChunkCursor,
    ) -> Result<Position> {
        if self.topic.is_registered(txn, &self.name)? {
            return Ok(Position {
                head: self.topic.consumer_head(txn, &self.name)?,
                cursor: self.topic.consumer_head_file(txn, &self.name)?,
            });
        }

        if producer_head == 0 || self.chunks.chunk_exists(0) {
            return Ok(Position {
                head: 0,
                cursor: ChunkCursor::default(),
            });
        }
        if self.config.start_mode == StartMode::ResumeEarliest {
            if let Some(earliest) = self.earliest(txn, None)? {
                log::info!(
                    "new consumer {} of {} starts at oldest retained offset {}",
                    self.name,
                    self.topic.name(),
                    earliest.head
                );
                return Ok(earliest);
            }
        }
        log::info!(
            "new consumer {} of {} starts at producer head {}",
            self.name,
            self.topic.name(),
            producer_head
        );
        Ok(Position {
            head: producer_head,
            cursor: producer_cursor,
        })
    }

    /// Map a position whose chunk was removed by retention onto data that is
    /// still on disk, following the configured start mode.
    fn reconcile(
        &self,
        txn: &Txn<'_>,
        position: Position,
        producer_head: u64,
        producer_cursor: ChunkCursor,
    ) -> Result<Position> {
        if self.chunks.chunk_exists(position.cursor.chunk) {
            return Ok(position);
        }

        // Nothing was skipped if the position sat at the end of the removed
        // chunk.
        let next = position.cursor.chunk + 1;
        if self.topic.chunk_base(txn, next)? == Some(position.head) && self.chunks.chunk_exists(next)
        {
            return Ok(Position {
                head: position.head,
                cursor: ChunkCursor::new(next, 0),
            });
        }
        let latest = Position {
            head: producer_head,
            cursor: producer_cursor,
        };
        if position.head == producer_head {
            return Ok(latest);
        }

        match self.config.start_mode {
            StartMode::ResumeStrict => Err(Error::MissingChunk(position.cursor.chunk)),
            StartMode::ResumeLatest => {
                log::warn!(
                    "consumer {}: chunk {} is gone, skipping to producer head {}",
                    self.name,
                    position.cursor.chunk,
                    producer_head
                );
                Ok(latest)
            }
            StartMode::ResumeEarliest => {
                let earliest = self
                    .earliest(txn, Some(position.cursor.chunk))?
                    .ok_or(Error::MissingChunk(position.cursor.chunk))?;
                log::warn!(
                    "consumer {}: chunk {} is gone, skipping to chunk {} (offset {})",
                    self.name,
                    position.cursor.chunk,
                    earliest.cursor.chunk,
                    earliest.head
                );
                Ok(earliest)
            }
        }
    }

    /// Start of the oldest retained chunk after `after` that has a recorded
    /// base offset.
    fn earliest(&self, txn: &Txn<'_>, after: Option<u64>) -> Result<Option<Position>> {
        for chunk in discover_chunks(self.chunks.dir())? {
            if after.map_or(false, |after| chunk <= after) {
                continue;
            }
            if let Some(head) = self.topic.chunk_base(txn, chunk)? {
                return Ok(Some(Position {
                    head,
                    cursor: ChunkCursor::new(chunk, 0),
                }));
            }
        }
        Ok(None)
    }
}
