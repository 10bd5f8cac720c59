use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

const PRODUCER_LOCK_FILE: &str = "producer.lock";

/// Exclusive advisory lock held by the single producer of a topic.
///
/// The lock is tied to the open file description, so it is released when
/// the producer is dropped or its process dies.
pub struct ProducerLock {
    path: PathBuf,
    _file: File,
}

impl ProducerLock {
    pub fn acquire(topic_dir: &Path) -> Result<Self> {
        let path = topic_dir.join(PRODUCER_LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        if !try_lock(&file)? {
            return Err(Error::ProducerActive(path));
        }
        write_lock_record(&file)?;
        Ok(Self { path, _file: file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_lock(file: &File) -> Result<bool> {
    use std::os::unix::io::AsRawFd;

    let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if res == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        return Ok(false);
    }
    Err(Error::Io(err))
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> Result<bool> {
    Ok(true)
}

fn write_lock_record(file: &File) -> Result<()> {
    let record = format!("{}\n", std::process::id());
    let mut handle = file.try_clone()?;
    handle.set_len(0)?;
    handle.seek(SeekFrom::Start(0))?;
    handle.write_all(record.as_bytes())?;
    Ok(())
}
