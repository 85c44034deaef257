//! File-backed replay buffer for reconnection support.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use thiserror::Error;
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};

const EXTENSION: &str = "log";

/// Replay buffer error.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("replay buffer I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ReplayError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Append-only log of every line forwarded for one query.
///
/// Lines are flushed as they are appended, so a reconnecting client always
/// replays everything forwarded before it attached, in the same order.
#[derive(Debug)]
pub struct ReplayBuffer {
    path: PathBuf,
    file: File,
    appended: usize,
}

impl ReplayBuffer {
    /// Path of the buffer for a given correlation id.
    #[must_use]
    pub fn path_for(dir: &Path, correlation_id: &str) -> PathBuf {
        dir.join(format!("{correlation_id}.{EXTENSION}"))
    }

    /// Create (or truncate) the buffer for a correlation id.
    ///
    /// # Errors
    /// Returns error if the directory or file cannot be created.
    pub async fn create(dir: &Path, correlation_id: &str) -> Result<Self, ReplayError> {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| ReplayError::io(dir, e))?;
        let path = Self::path_for(dir, correlation_id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|e| ReplayError::io(&path, e))?;
        Ok(Self {
            path,
            file,
            appended: 0,
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of lines appended so far.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.appended
    }

    /// Whether nothing has been appended yet.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.appended == 0
    }

    /// Append one line.
    ///
    /// # Errors
    /// Returns error if the write fails.
    pub async fn append(&mut self, line: &str) -> Result<(), ReplayError> {
        let mut record = String::with_capacity(line.len() + 1);
        record.push_str(line);
        record.push('\n');
        self.file
            .write_all(record.as_bytes())
            .await
            .map_err(|e| ReplayError::io(&self.path, e))?;
        self.file
            .flush()
            .await
            .map_err(|e| ReplayError::io(&self.path, e))?;
        self.appended += 1;
        Ok(())
    }

    /// Read every buffered line back, in file order.
    ///
    /// # Errors
    /// Returns error if the file cannot be read.
    pub async fn read_lines(&self) -> Result<Vec<String>, ReplayError> {
        let raw = fs::read(&self.path)
            .await
            .map_err(|e| ReplayError::io(&self.path, e))?;
        // Split on `\n` only; a `\r` the agent left on a line is part of it.
        Ok(String::from_utf8_lossy(&raw)
            .split_terminator('\n')
            .map(str::to_owned)
            .collect())
    }

    /// Delete the buffer, reclaiming its space.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be removed.
    pub async fn remove(self) -> Result<(), ReplayError> {
        let Self { path, file, .. } = self;
        drop(file);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ReplayError::io(&path, e)),
        }
    }
}

/// Delete buffers under `dir` that have not been written to for `ttl`.
///
/// Buffers survive a run that saw a disconnect; this is what eventually
/// reclaims them. Returns the number of files removed.
///
/// # Errors
/// Returns error if the directory exists but cannot be listed.
pub async fn evict_stale(dir: &Path, ttl: Duration) -> Result<usize, ReplayError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(ReplayError::io(dir, e)),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ReplayError::io(dir, e))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
            continue;
        }
        let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
            continue;
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age < ttl {
            continue;
        }
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(path = %path.display(), ?age, "Evicted stale replay buffer");
                removed += 1;
            }
            Err(e) => tracing::warn!(path = %path.display(), "Failed to evict replay buffer: {e}"),
        }
    }
    Ok(removed)
}
