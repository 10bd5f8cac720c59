//! Rotating chunk files.
//!
//! A topic's records live in numbered files inside the topic directory:
//!
//! ```text
//! {path}/{topic}/
//!   chunk_000000000      ← oldest retained chunk
//!   chunk_000000001
//!   chunk_000000002      ← active chunk
//! ```
//!
//! Each chunk is a plain sequence of `[u32 LE length][payload]` frames with no
//! file header. A `(chunk, byte offset)` pair is a [`ChunkCursor`].
//!
//! The store never decides what is committed. Writers resume from the cursor
//! recorded in the index (see [`ChunkStore::recover`]) and readers pass the
//! committed end of the active chunk as a read limit, so bytes written by a
//! push whose index commit never happened are never observed.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::config::ProducerConfig;
use crate::{Error, Result};

/// Size of the length prefix in front of every record.
pub const LEN_PREFIX_SIZE: u64 = 4;

const CHUNK_PREFIX: &str = "chunk_";

/// Physical position inside a topic's chunk files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkCursor {
    pub chunk: u64,
    pub offset: u64,
}

impl ChunkCursor {
    pub fn new(chunk: u64, offset: u64) -> Self {
        Self { chunk, offset }
    }
}

/// Result of [`ChunkStore::append`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Cursor just past the last written record.
    pub cursor: ChunkCursor,
    /// `(chunk, logical offset)` for every chunk whose first record was
    /// written by this append.
    pub started: Vec<(u64, u64)>,
    /// Chunks that fall out of the retention window once this append is
    /// committed. Nothing is deleted by `append` itself.
    pub expired: Vec<u64>,
}

/// Result of [`ChunkStore::read`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReadBatch {
    pub records: Vec<Vec<u8>>,
    /// Cursor just past the last returned record.
    pub cursor: ChunkCursor,
    /// The read stopped because it reached the end of the readable data in
    /// this chunk.
    pub end_of_chunk: bool,
}

struct ActiveChunk {
    index: u64,
    file: File,
}

struct MappedChunk {
    index: u64,
    file: File,
    map: Option<Mmap>,
}

/// Append/read access to one topic's chunk files.
pub struct ChunkStore {
    dir: PathBuf,
    config: ProducerConfig,
    active: Option<ActiveChunk>,
    mapped: Option<MappedChunk>,
}

// ============================================================================
// Chunk Naming
// ============================================================================

/// Chunk filename for an index (e.g. "chunk_000000042").
pub fn chunk_filename(index: u64) -> String {
    format!("{CHUNK_PREFIX}{index:09}")
}

pub fn chunk_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(chunk_filename(index))
}

/// Returns the chunk index if `name` is a chunk filename.
pub fn parse_chunk_filename(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(CHUNK_PREFIX)?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok()
}

/// Sorted indices of all chunk files in `dir`.
pub fn discover_chunks(dir: &Path) -> Result<Vec<u64>> {
    let mut chunks = Vec::new();
    if !dir.exists() {
        return Ok(chunks);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if let Some(index) = name.to_str().and_then(parse_chunk_filename) {
            chunks.push(index);
        }
    }
    chunks.sort_unstable();
    Ok(chunks)
}

/// Bytes a record occupies on disk, including its length prefix.
pub fn frame_len(payload_len: usize) -> Result<u64> {
    u32::try_from(payload_len).map_err(|_| Error::RecordTooLarge(payload_len))?;
    Ok(LEN_PREFIX_SIZE + payload_len as u64)
}

fn corrupt(chunk: u64, msg: &'static str) -> Error {
    Error::ChunkIo {
        chunk,
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, msg),
    }
}

impl ChunkStore {
    /// Open a store for reading; writes use the default producer settings.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_config(dir, ProducerConfig::default())
    }

    pub fn with_config(dir: impl Into<PathBuf>, config: ProducerConfig) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            config,
            active: None,
            mapped: None,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Oldest chunk still on disk.
    pub fn oldest_chunk(&self) -> Result<Option<u64>> {
        Ok(discover_chunks(&self.dir)?.first().copied())
    }

    pub fn chunk_exists(&self, index: u64) -> bool {
        chunk_path(&self.dir, index).is_file()
    }

    /// Append `records` starting at `cursor`; `base` is the logical offset of
    /// the first record.
    ///
    /// When the next record would push a non-empty chunk past the configured
    /// chunk size, the chunk is closed, writing continues at offset 0 of the
    /// next chunk. After a rotation the outcome lists the chunks retention
    /// would remove; the caller deletes them with [`ChunkStore::remove_chunks`]
    /// once the new position is committed.
    pub fn append<R: AsRef<[u8]>>(
        &mut self,
        cursor: ChunkCursor,
        base: u64,
        records: &[R],
    ) -> Result<AppendOutcome> {
        let mut outcome = AppendOutcome {
            cursor,
            ..AppendOutcome::default()
        };
        if records.is_empty() {
            return Ok(outcome);
        }

        let start_chunk = cursor.chunk;
        let mut cursor = cursor;
        let mut buf_start = cursor.offset;
        let mut buf = Vec::new();
        let mut logical = base;
        for record in records {
            let payload = record.as_ref();
            let frame = frame_len(payload.len())?;
            if cursor.offset > 0 && cursor.offset.saturating_add(frame) > self.config.chunk_size {
                self.write_at(cursor.chunk, buf_start, &buf)?;
                buf.clear();
                self.close_chunk(cursor)?;

                cursor = ChunkCursor::new(cursor.chunk + 1, 0);
                buf_start = 0;
                self.start_chunk(cursor.chunk)?;
                log::info!(
                    "rotated {} to chunk {}",
                    self.dir.display(),
                    cursor.chunk
                );
            }
            if cursor.offset == 0 {
                outcome.started.push((cursor.chunk, logical));
            }
            buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            buf.extend_from_slice(payload);
            cursor.offset += frame;
            logical += 1;
        }
        self.write_at(cursor.chunk, buf_start, &buf)?;
        if self.config.sync {
            self.sync_active()?;
        }

        if cursor.chunk != start_chunk {
            outcome.expired = self.retention_candidates(cursor.chunk)?;
        }
        outcome.cursor = cursor;
        Ok(outcome)
    }

    /// Read up to `max_records` records starting at `cursor`.
    ///
    /// `limit` bounds the readable bytes of the chunk (the committed end of
    /// the active chunk); `None` reads to the end of the file. Reads never
    /// continue into the next chunk.
    pub fn read(
        &mut self,
        cursor: ChunkCursor,
        max_records: usize,
        limit: Option<u64>,
    ) -> Result<ReadBatch> {
        let chunk = cursor.chunk;
        let data = self.chunk_data(chunk, limit)?;
        let mut offset = usize::try_from(cursor.offset)
            .map_err(|_| corrupt(chunk, "cursor exceeds addressable range"))?;
        if offset > data.len() {
            return Err(corrupt(chunk, "cursor beyond end of chunk"));
        }

        let mut records = Vec::new();
        while records.len() < max_records && offset < data.len() {
            let prefix_end = offset + LEN_PREFIX_SIZE as usize;
            if prefix_end > data.len() {
                return Err(corrupt(chunk, "truncated length prefix"));
            }
            let mut len_buf = [0u8; 4];
            len_buf.copy_from_slice(&data[offset..prefix_end]);
            let len = u32::from_le_bytes(len_buf) as usize;
            let end = prefix_end
                .checked_add(len)
                .filter(|&end| end <= data.len())
                .ok_or_else(|| corrupt(chunk, "length prefix exceeds chunk bounds"))?;
            records.push(data[prefix_end..end].to_vec());
            offset = end;
        }

        Ok(ReadBatch {
            end_of_chunk: offset == data.len(),
            records,
            cursor: ChunkCursor::new(chunk, offset as u64),
        })
    }

    /// Bring the files back in line with the last committed write cursor:
    /// truncate the committed chunk to the cursor and delete any chunk past
    /// it.
    pub fn recover(&mut self, committed: ChunkCursor) -> Result<()> {
        self.active = None;
        self.mapped = None;

        let path = chunk_path(&self.dir, committed.chunk);
        match OpenOptions::new().write(true).open(&path) {
            Ok(file) => {
                let len = file
                    .metadata()
                    .map_err(Error::chunk_io(committed.chunk))?
                    .len();
                if len < committed.offset {
                    return Err(corrupt(
                        committed.chunk,
                        "chunk is shorter than its committed cursor",
                    ));
                }
                if len > committed.offset {
                    log::warn!(
                        "discarding {} uncommitted bytes from {}",
                        len - committed.offset,
                        path.display()
                    );
                    file.set_len(committed.offset)
                        .map_err(Error::chunk_io(committed.chunk))?;
                    file.sync_all().map_err(Error::chunk_io(committed.chunk))?;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if committed.offset > 0 {
                    return Err(Error::MissingChunk(committed.chunk));
                }
            }
            Err(err) => return Err(Error::chunk_io(committed.chunk)(err)),
        }

        for index in discover_chunks(&self.dir)? {
            if index > committed.chunk {
                log::warn!(
                    "removing uncommitted chunk {}",
                    chunk_path(&self.dir, index).display()
                );
                remove_chunk(&self.dir, index)?;
            }
        }
        Ok(())
    }

    /// Chunks older than `chunks_to_keep` closed chunks behind `active`,
    /// oldest first.
    pub fn retention_candidates(&self, active: u64) -> Result<Vec<u64>> {
        let keep_from = active.saturating_sub(self.config.chunks_to_keep);
        Ok(discover_chunks(&self.dir)?
            .into_iter()
            .take_while(|&index| index < keep_from)
            .collect())
    }

    /// Delete `chunks` in the given order, stopping at the first failure so
    /// the chunks left on disk stay contiguous.
    pub fn remove_chunks(&self, chunks: &[u64]) -> Result<()> {
        for &index in chunks {
            remove_chunk(&self.dir, index)?;
        }
        if !chunks.is_empty() {
            log::info!(
                "retention removed chunks {:?} from {}",
                chunks,
                self.dir.display()
            );
        }
        Ok(())
    }

    /// Delete chunks older than `chunks_to_keep` closed chunks behind `active`.
    pub fn apply_retention(&self, active: u64) -> Result<Vec<u64>> {
        let expired = self.retention_candidates(active)?;
        self.remove_chunks(&expired)?;
        Ok(expired)
    }

    fn active_file(&mut self, index: u64) -> Result<&mut File> {
        if self.active.as_ref().map_or(true, |active| active.index != index) {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(chunk_path(&self.dir, index))
                .map_err(Error::chunk_io(index))?;
            self.active = Some(ActiveChunk { index, file });
        }
        match self.active.as_mut() {
            Some(active) => Ok(&mut active.file),
            None => Err(corrupt(index, "active chunk missing")),
        }
    }

    fn start_chunk(&mut self, index: u64) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(chunk_path(&self.dir, index))
            .map_err(Error::chunk_io(index))?;
        self.active = Some(ActiveChunk { index, file });
        Ok(())
    }

    fn close_chunk(&mut self, end: ChunkCursor) -> Result<()> {
        let file = self.active_file(end.chunk)?;
        file.set_len(end.offset).map_err(Error::chunk_io(end.chunk))?;
        file.sync_all().map_err(Error::chunk_io(end.chunk))?;
        Ok(())
    }

    fn write_at(&mut self, index: u64, offset: u64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let file = self.active_file(index)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(Error::chunk_io(index))?;
        file.write_all(buf).map_err(Error::chunk_io(index))?;
        Ok(())
    }

    fn sync_active(&mut self) -> Result<()> {
        if let Some(active) = self.active.as_ref() {
            active
                .file
                .sync_data()
                .map_err(Error::chunk_io(active.index))?;
        }
        Ok(())
    }

    fn chunk_data(&mut self, index: u64, limit: Option<u64>) -> Result<&[u8]> {
        if self.mapped.as_ref().map_or(true, |mapped| mapped.index != index) {
            let file = match File::open(chunk_path(&self.dir, index)) {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::MissingChunk(index))
                }
                Err(err) => return Err(Error::chunk_io(index)(err)),
            };
            self.mapped = Some(MappedChunk {
                index,
                file,
                map: None,
            });
        }
        let mapped = self
            .mapped
            .as_mut()
            .ok_or_else(|| corrupt(index, "chunk map missing"))?;

        let len = mapped.file.metadata().map_err(Error::chunk_io(index))?.len();
        let end = match limit {
            Some(limit) if limit > len => {
                return Err(corrupt(index, "chunk is shorter than its committed cursor"))
            }
            Some(limit) => limit,
            None => len,
        };
        if end == 0 {
            return Ok(&[]);
        }
        if mapped.map.as_ref().map_or(true, |map| map.len() as u64 != len) {
            // Safety: chunk bytes below the committed cursor are never
            // rewritten, and reads stay below `end <= len`.
            let map = unsafe { Mmap::map(&mapped.file) }.map_err(Error::chunk_io(index))?;
            mapped.map = Some(map);
        }
        match mapped.map.as_ref() {
            Some(map) => Ok(&map[..end as usize]),
            None => Err(corrupt(index, "chunk map missing")),
        }
    }
}

fn remove_chunk(dir: &Path, index: u64) -> Result<()> {
    match std::fs::remove_file(chunk_path(dir, index)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::chunk_io(index)(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir, chunk_size: u64, chunks_to_keep: u64) -> ChunkStore {
        let config = ProducerConfig::default()
            .with_chunk_size(chunk_size)
            .with_chunks_to_keep(chunks_to_keep)
            .with_sync(false);
        ChunkStore::with_config(dir.path().join("topic"), config).expect("chunk store")
    }

    fn records(count: usize, len: usize) -> Vec<Vec<u8>> {
        (0..count).map(|i| vec![i as u8; len]).collect()
    }

    #[test]
    fn test_chunk_naming() {
        assert_eq!(chunk_filename(0), "chunk_000000000");
        assert_eq!(chunk_filename(42), "chunk_000000042");

        assert_eq!(parse_chunk_filename("chunk_000000042"), Some(42));
        assert_eq!(parse_chunk_filename("chunk_7"), Some(7));
        assert_eq!(parse_chunk_filename("chunk_"), None);
        assert_eq!(parse_chunk_filename("chunk_12a"), None);
        assert_eq!(parse_chunk_filename("producer.lock"), None);
    }

    #[test]
    fn test_append_then_read() {
        let dir = TempDir::new().expect("temp dir");
        let mut chunks = store(&dir, 1024, 8);

        let batch: Vec<&[u8]> = vec![&b"alpha"[..], &b""[..], &b"charlie"[..]];
        let outcome = chunks.append(ChunkCursor::default(), 0, &batch).expect("append");
        assert_eq!(outcome.cursor, ChunkCursor::new(0, 4 + 5 + 4 + 4 + 7));
        assert_eq!(outcome.started, vec![(0, 0)]);
        assert!(outcome.expired.is_empty());

        let read = chunks
            .read(ChunkCursor::default(), 10, Some(outcome.cursor.offset))
            .expect("read");
        assert_eq!(read.records, vec![b"alpha".to_vec(), Vec::new(), b"charlie".to_vec()]);
        assert_eq!(read.cursor, outcome.cursor);
        assert!(read.end_of_chunk);
    }

    #[test]
    fn test_read_respects_max_records_and_limit() {
        let dir = TempDir::new().expect("temp dir");
        let mut chunks = store(&dir, 1024, 8);
        let first = chunks
            .append(ChunkCursor::default(), 0, &records(2, 8))
            .expect("append");
        // Bytes past `first.cursor` are not visible when it is the limit.
        chunks.append(first.cursor, 2, &records(2, 8)).expect("append");

        let read = chunks
            .read(ChunkCursor::default(), 1, Some(first.cursor.offset))
            .expect("read");
        assert_eq!(read.records.len(), 1);
        assert!(!read.end_of_chunk);

        let read = chunks.read(read.cursor, 10, Some(first.cursor.offset)).expect("read");
        assert_eq!(read.records.len(), 1);
        assert_eq!(read.cursor, first.cursor);
        assert!(read.end_of_chunk);

        let read = chunks.read(read.cursor, 10, None).expect("read");
        assert_eq!(read.records.len(), 2);
    }

    #[test]
    fn test_rotation_when_chunk_is_full() {
        let dir = TempDir::new().expect("temp dir");
        let mut chunks = store(&dir, 64, 8);

        // 20 byte payloads take 24 bytes on disk: two fit in a 64 byte chunk.
        let outcome = chunks
            .append(ChunkCursor::default(), 0, &records(10, 20))
            .expect("append");
        assert_eq!(outcome.cursor, ChunkCursor::new(4, 48));
        assert_eq!(
            outcome.started,
            vec![(0, 0), (1, 2), (2, 4), (3, 6), (4, 8)]
        );
        assert_eq!(discover_chunks(chunks.dir()).expect("discover chunks"), vec![0, 1, 2, 3, 4]);

        let mut seen = Vec::new();
        for chunk in 0..5 {
            let limit = if chunk == 4 { Some(48) } else { None };
            let read = chunks.read(ChunkCursor::new(chunk, 0), 100, limit).expect("read");
            assert!(read.end_of_chunk);
            seen.extend(read.records);
        }
        assert_eq!(seen, records(10, 20));
    }

    #[test]
    fn test_oversized_record_gets_its_own_chunk() {
        let dir = TempDir::new().expect("temp dir");
        let mut chunks = store(&dir, 16, 8);
        let batch = vec![vec![1u8; 4], vec![2u8; 100], vec![3u8; 4]];
        let outcome = chunks.append(ChunkCursor::default(), 0, &batch).expect("append");
        assert_eq!(outcome.cursor, ChunkCursor::new(2, 8));
        assert_eq!(outcome.started, vec![(0, 0), (1, 1), (2, 2)]);

        let read = chunks.read(ChunkCursor::new(1, 0), 10, None).expect("read");
        assert_eq!(read.records, vec![vec![2u8; 100]]);
    }

    #[test]
    fn test_retention_keeps_configured_closed_chunks() {
        let dir = TempDir::new().expect("temp dir");
        let mut chunks = store(&dir, 64, 2);
        let outcome = chunks
            .append(ChunkCursor::default(), 0, &records(10, 20))
            .expect("append");
        // Retention is only reported by the append; every chunk is still on disk.
        assert_eq!(outcome.expired, vec![0, 1]);
        assert_eq!(discover_chunks(chunks.dir()).expect("discover chunks"), vec![0, 1, 2, 3, 4]);

        chunks.remove_chunks(&outcome.expired).expect("remove chunks");
        assert_eq!(discover_chunks(chunks.dir()).expect("discover chunks"), vec![2, 3, 4]);
        assert!(chunks.apply_retention(outcome.cursor.chunk).expect("retention").is_empty());
        assert_eq!(chunks.oldest_chunk().expect("oldest chunk"), Some(2));

        let err = chunks.read(ChunkCursor::new(0, 0), 10, None).expect_err("must fail");
        assert!(matches!(err, Error::MissingChunk(0)));
    }

    #[test]
    fn test_corrupt_length_prefix() {
        let dir = TempDir::new().expect("temp dir");
        let mut chunks = store(&dir, 1024, 8);
        let outcome = chunks
            .append(ChunkCursor::default(), 0, &records(1, 8))
            .expect("append");

        let path = chunk_path(chunks.dir(), 0);
        let mut bytes = std::fs::read(&path).expect("read");
        bytes[0..4].copy_from_slice(&1000u32.to_le_bytes());
        std::fs::write(&path, &bytes).expect("write");

        let mut reader = ChunkStore::open(chunks.dir()).expect("open");
        let err = reader
            .read(ChunkCursor::default(), 10, Some(outcome.cursor.offset))
            .expect_err("must fail");
        match err {
            Error::ChunkIo { chunk, source } => {
                assert_eq!(chunk, 0);
                assert_eq!(source.kind(), std::io::ErrorKind::InvalidData);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_recover_discards_uncommitted_bytes() {
        let dir = TempDir::new().expect("temp dir");
        let mut chunks = store(&dir, 64, 8);
        let committed = chunks
            .append(ChunkCursor::default(), 0, &records(1, 20))
            .expect("append")
            .cursor;
        // Uncommitted push that spilled into chunk 1.
        chunks.append(committed, 1, &records(3, 20)).expect("append");
        assert_eq!(discover_chunks(chunks.dir()).expect("discover chunks"), vec![0, 1]);

        chunks.recover(committed).expect("recover");
        assert_eq!(discover_chunks(chunks.dir()).expect("discover chunks"), vec![0]);
        let len = std::fs::metadata(chunk_path(chunks.dir(), 0)).expect("metadata").len();
        assert_eq!(len, committed.offset);

        let read = chunks.read(ChunkCursor::default(), 10, None).expect("read");
        assert_eq!(read.records, records(1, 20));
    }

    #[test]
    fn test_record_too_large_for_prefix() {
        assert!(frame_len(u32::MAX as usize).is_ok());
        #[cfg(target_pointer_width = "64")]
        assert!(matches!(
            frame_len(u32::MAX as usize + 1),
            Err(Error::RecordTooLarge(_))
        ));
    }
}
