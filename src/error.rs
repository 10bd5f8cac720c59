use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot open store at {}: {source}", path.display())]
    StoreOpen {
        path: PathBuf,
        #[source]
        source: heed::Error,
    },
    #[error("chunk {chunk} io error: {source}")]
    ChunkIo {
        chunk: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("index commit failed: {0}")]
    Commit(#[source] heed::Error),
    #[error("chunk {0} is missing (removed by retention)")]
    MissingChunk(u64),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("index error: {0}")]
    Index(#[from] heed::Error),
    #[error("corrupt index: {0}")]
    CorruptIndex(&'static str),
    #[error("write attempted in a read-only transaction")]
    ReadOnlyTxn,
    #[error("another producer holds {}", .0.display())]
    ProducerActive(PathBuf),
    #[error("record of {0} bytes exceeds the length prefix range")]
    RecordTooLarge(usize),
    #[error("record is not valid utf-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn chunk_io(chunk: u64) -> impl FnOnce(std::io::Error) -> Error {
        move |source| Error::ChunkIo { chunk, source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
