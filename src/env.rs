//! Transactional metadata index.
//!
//! One LMDB environment per directory holds the index of every topic stored
//! there. The [`EnvironmentRegistry`] hands out a shared [`Environment`] per
//! canonical path so a process never opens the same store twice; the handle
//! is closed once its last clone is dropped.
//!
//! All store access goes through [`Txn`], which exposes an ordered byte-key
//! interface (get / put / delete / prefix scan) over per-topic namespaces.
//! Nothing above this module talks to LMDB directly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use parking_lot::Mutex;

use crate::config::EnvConfig;
use crate::{Error, Result};

const TOPIC_DB_PREFIX: &str = "topic:";

/// Handle to a topic's metadata namespace.
#[derive(Clone, Copy)]
pub struct TopicDb {
    db: Database<Bytes, Bytes>,
}

struct EnvInner {
    path: PathBuf,
    env: Env,
    topics: Mutex<HashMap<String, TopicDb>>,
}

/// Shared handle to one open metadata store.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvInner>,
}

/// Process-level cache of open environments keyed by canonical path.
///
/// The registry only keeps weak references: an environment stays open while
/// some topic, producer or consumer still holds it.
pub struct EnvironmentRegistry {
    config: EnvConfig,
    envs: Mutex<HashMap<PathBuf, Weak<EnvInner>>>,
}

impl Default for EnvironmentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvironmentRegistry {
    pub fn new() -> Self {
        Self::with_config(EnvConfig::default())
    }

    pub fn with_config(config: EnvConfig) -> Self {
        Self {
            config,
            envs: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_open(&self, path: impl AsRef<Path>) -> Result<Environment> {
        let path = path.as_ref();
        let store_open = |source: std::io::Error| Error::StoreOpen {
            path: path.to_path_buf(),
            source: heed::Error::Io(source),
        };
        std::fs::create_dir_all(path).map_err(store_open)?;
        let canonical = std::fs::canonicalize(path).map_err(store_open)?;

        let mut envs = self.envs.lock();
        if let Some(inner) = envs.get(&canonical).and_then(Weak::upgrade) {
            return Ok(Environment { inner });
        }
        envs.retain(|_, env| env.strong_count() > 0);

        let env = open_env(&canonical, &self.config)?;
        log::debug!("opened metadata store at {}", canonical.display());
        let inner = Arc::new(EnvInner {
            path: canonical.clone(),
            env,
            topics: Mutex::new(HashMap::new()),
        });
        envs.insert(canonical, Arc::downgrade(&inner));
        Ok(Environment { inner })
    }

    /// Number of environments currently held open through this registry.
    pub fn open_count(&self) -> usize {
        self.envs
            .lock()
            .values()
            .filter(|env| env.strong_count() > 0)
            .count()
    }
}

fn open_env(path: &Path, config: &EnvConfig) -> Result<Env> {
    // Safety: the registry guarantees a single open environment per path in
    // this process.
    unsafe {
        EnvOpenOptions::new()
            .map_size(config.map_size)
            .max_dbs(config.max_dbs)
            .open(path)
    }
    .map_err(|source| Error::StoreOpen {
        path: path.to_path_buf(),
        source,
    })
}

impl Environment {
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Start a transaction. Write transactions are serialized against each
    /// other; read transactions observe a consistent snapshot.
    ///
    /// A thread must not begin a second write transaction while it still
    /// holds one on the same environment.
    pub fn begin_txn(&self, write: bool) -> Result<Txn<'_>> {
        let state = if write {
            TxnState::Write(self.inner.env.write_txn()?)
        } else {
            TxnState::Read(self.inner.env.read_txn()?)
        };
        Ok(Txn { state: Some(state) })
    }

    pub fn read_txn(&self) -> Result<Txn<'_>> {
        self.begin_txn(false)
    }

    pub fn write_txn(&self) -> Result<Txn<'_>> {
        self.begin_txn(true)
    }

    /// Open or create the metadata namespace for a topic.
    pub fn get_topic_db(&self, name: &str) -> Result<TopicDb> {
        let mut topics = self.inner.topics.lock();
        if let Some(db) = topics.get(name) {
            return Ok(*db);
        }
        let db_name = format!("{TOPIC_DB_PREFIX}{name}");
        let mut txn = self.inner.env.write_txn()?;
        let db = self
            .inner
            .env
            .create_database::<Bytes, Bytes>(&mut txn, Some(&db_name))?;
        txn.commit().map_err(Error::Commit)?;
        let handle = TopicDb { db };
        topics.insert(name.to_string(), handle);
        Ok(handle)
    }

    #[cfg(test)]
    pub(crate) fn ptr_eq(&self, other: &Environment) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

enum TxnState<'env> {
    Read(RoTxn<'env>),
    Write(RwTxn<'env>),
}

/// Scoped index transaction.
///
/// A transaction ends with [`Txn::commit`] or [`Txn::abort`]. One that goes
/// out of scope unfinished (for example on an early error return) is aborted
/// and logged, so its lock or snapshot is always released.
pub struct Txn<'env> {
    state: Option<TxnState<'env>>,
}

impl<'env> Txn<'env> {
    pub fn is_write(&self) -> bool {
        matches!(self.state, Some(TxnState::Write(_)))
    }

    fn ro(&self) -> Result<&RoTxn<'env>> {
        match &self.state {
            Some(TxnState::Read(txn)) => Ok(txn),
            Some(TxnState::Write(txn)) => Ok(&**txn),
            None => Err(Error::CorruptIndex("transaction already finished")),
        }
    }

    fn rw(&mut self) -> Result<&mut RwTxn<'env>> {
        match &mut self.state {
            Some(TxnState::Write(txn)) => Ok(txn),
            _ => Err(Error::ReadOnlyTxn),
        }
    }

    pub fn get(&self, ns: TopicDb, key: &[u8]) -> Result<Option<&[u8]>> {
        Ok(ns.db.get(self.ro()?, key)?)
    }

    pub fn put(&mut self, ns: TopicDb, key: &[u8], value: &[u8]) -> Result<()> {
        ns.db.put(self.rw()?, key, value)?;
        Ok(())
    }

    pub fn delete(&mut self, ns: TopicDb, key: &[u8]) -> Result<bool> {
        Ok(ns.db.delete(self.rw()?, key)?)
    }

    /// All entries whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, ns: TopicDb, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut entries = Vec::new();
        for entry in ns.db.prefix_iter(self.ro()?, prefix)? {
            let (key, value) = entry?;
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }

    pub fn commit(mut self) -> Result<()> {
        match self.state.take() {
            Some(TxnState::Read(txn)) => txn.commit().map_err(Error::Commit),
            Some(TxnState::Write(txn)) => txn.commit().map_err(Error::Commit),
            None => Ok(()),
        }
    }

    pub fn abort(mut self) {
        if let Some(TxnState::Write(txn)) = self.state.take() {
            txn.abort();
        }
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            let kind = match state {
                TxnState::Read(_) => "read",
                TxnState::Write(_) => "write",
            };
            log::warn!("{kind} transaction dropped without commit or abort; aborted");
        }
    }
}
