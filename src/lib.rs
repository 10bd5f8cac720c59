//! Persistent, append-only, multi-consumer queue.
//!
//! Records are stored in rotating chunk files per topic while all positions
//! live in a transactional LMDB index next to them. One producer appends to
//! a topic; any number of named consumers read it independently and resume
//! where they left off.

pub mod chunk;
pub mod config;
pub mod consumer;
pub mod env;
pub mod error;
pub mod lock;
pub mod producer;
pub mod topic;

pub use chunk::{ChunkCursor, ChunkStore};
pub use config::{ConsumerConfig, EnvConfig, ProducerConfig, QueueOptions, StartMode};
pub use consumer::{Consumer, ConsumerState};
pub use env::{Environment, EnvironmentRegistry, Txn};
pub use error::{Error, Result};
pub use producer::Producer;
pub use topic::{Topic, TopicStatus};
