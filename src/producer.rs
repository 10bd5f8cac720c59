//! Single writer of a topic.
//!
//! A push is two steps: the records are appended to the chunk files, then the
//! new producer head, write cursor and chunk bases are committed in one index
//! transaction. Consumers only read up to the committed cursor, so a push
//! either becomes visible as a whole or not at all.
//!
//! Chunks that fall out of the retention window are deleted only after that
//! commit succeeds, oldest first, so the chunks on disk always form one
//! contiguous run and a failed push never has to restore a deleted file.

use std::ops::Range;

use crate::chunk::{AppendOutcome, ChunkCursor, ChunkStore};
use crate::config::{ProducerConfig, QueueOptions};
use crate::env::{Environment, EnvironmentRegistry};
use crate::lock::ProducerLock;
use crate::topic::Topic;
use crate::Result;

pub struct Producer {
    topic: Topic,
    chunks: ChunkStore,
    _lock: ProducerLock,
    #[cfg(test)]
    fail_next_commit: bool,
}

impl Producer {
    pub fn open(env: &Environment, topic: &str, config: ProducerConfig) -> Result<Self> {
        Self::for_topic(Topic::open(env, topic)?, config)
    }

    pub fn from_options(registry: &EnvironmentRegistry, options: &QueueOptions) -> Result<Self> {
        let env = registry.get_or_open(&options.path)?;
        Self::open(&env, &options.topic, options.producer_config())
    }

    /// Take the topic's producer lock and discard chunk data written after
    /// the last committed push.
    pub fn for_topic(topic: Topic, config: ProducerConfig) -> Result<Self> {
        let mut chunks = ChunkStore::with_config(topic.chunk_dir(), config)?;
        let lock = ProducerLock::acquire(topic.chunk_dir())?;

        let txn = topic.env().read_txn()?;
        let head = topic.producer_head(&txn)?;
        let cursor = topic.producer_head_file(&txn)?;
        txn.commit()?;

        chunks.recover(cursor)?;
        log::info!(
            "producer opened topic {} at head {} (chunk {}, offset {})",
            topic.name(),
            head,
            cursor.chunk,
            cursor.offset
        );
        Ok(Self {
            topic,
            chunks,
            _lock: lock,
            #[cfg(test)]
            fail_next_commit: false,
        })
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Committed producer head: the logical offset the next record gets.
    pub fn head(&self) -> Result<u64> {
        let txn = self.topic.env().read_txn()?;
        let head = self.topic.producer_head(&txn)?;
        txn.commit()?;
        Ok(head)
    }

    /// Append `records` atomically and return the logical offsets they were
    /// given. An empty batch performs no I/O and returns `None`.
    pub fn push<R: AsRef<[u8]>>(&mut self, records: &[R]) -> Result<Option<Range<u64>>> {
        if records.is_empty() {
            return Ok(None);
        }

        let txn = self.topic.env().read_txn()?;
        let head = self.topic.producer_head(&txn)?;
        let cursor = self.topic.producer_head_file(&txn)?;
        txn.commit()?;

        let outcome = match self.chunks.append(cursor, head, records) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.roll_back(cursor);
                return Err(err);
            }
        };
        let next = head + records.len() as u64;
        if let Err(err) = self.commit(next, &outcome) {
            self.roll_back(cursor);
            return Err(err);
        }
        // The push is durable at this point; a chunk that cannot be removed
        // now is picked up again by the next rotation.
        if let Err(err) = self.chunks.remove_chunks(&outcome.expired) {
            log::error!(
                "retention failed in {}: {}",
                self.topic.chunk_dir().display(),
                err
            );
        }
        log::trace!(
            "pushed {} records to {} (head {})",
            records.len(),
            self.topic.name(),
            next
        );
        Ok(Some(head..next))
    }

    fn commit(&mut self, head: u64, outcome: &AppendOutcome) -> Result<()> {
        let mut txn = self.topic.env().write_txn()?;
        self.topic.set_producer_head(&mut txn, head)?;
        self.topic.set_producer_head_file(&mut txn, outcome.cursor)?;
        for &(chunk, base) in &outcome.started {
            self.topic.set_chunk_base(&mut txn, chunk, base)?;
        }
        for &chunk in &outcome.expired {
            self.topic.remove_chunk_base(&mut txn, chunk)?;
        }
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_commit) {
            txn.abort();
            return Err(crate::Error::Commit(heed::Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "commit failure injected by test",
            ))));
        }
        txn.commit()
    }

    fn roll_back(&mut self, committed: ChunkCursor) {
        if let Err(err) = self.chunks.recover(committed) {
            log::error!(
                "failed to discard uncommitted data in {}: {}",
                self.topic.chunk_dir().display(),
                err
            );
        }
    }
}
