//! Append-only storage for accepted bets.
//!
//! [`BetStore`] keeps every accepted bet in memory and writes each batch
//! through to a [`BetBackend`] before it becomes visible. The store is not
//! synchronized on its own: the central keeps it next to the settlement
//! barrier behind one lock (see [`crate::central`]), so a batch is always
//! written or read as a whole.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use thiserror::Error;
use tracing::warn;

use crate::bet::{BetParseError, BetRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bet storage i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("stored row {line} is corrupt: {source}")]
    Corrupt { line: usize, source: BetParseError },
}

/// Where bet rows are persisted.
///
/// `append_rows` must leave the backend unchanged when it fails.
pub trait BetBackend: Send {
    fn append_rows(&mut self, rows: &[BetRecord]) -> Result<(), StoreError>;
    fn read_all_rows(&self) -> Result<Vec<BetRecord>, StoreError>;
}

/// Persists nothing. Bets live only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryBackend;

impl BetBackend for MemoryBackend {
    fn append_rows(&mut self, _rows: &[BetRecord]) -> Result<(), StoreError> {
        Ok(())
    }

    fn read_all_rows(&self) -> Result<Vec<BetRecord>, StoreError> {
        Ok(Vec::new())
    }
}

/// Appends comma-separated rows to a file, one bet per line.
#[derive(Debug)]
pub struct CsvFileBackend {
    file: File,
}

impl CsvFileBackend {
    /// Opens `path` for appending, creating it when missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        Ok(Self { file })
    }

    /// Runs `write` against the file and truncates back to the previous
    /// length if it fails, so a torn batch never reaches disk.
    fn write_or_rollback<F>(&mut self, write: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut File) -> io::Result<()>,
    {
        let committed = self.file.metadata()?.len();
        if let Err(err) = write(&mut self.file) {
            if let Err(rollback) = self.file.set_len(committed) {
                warn!(error = %rollback, committed, "failed to roll back partial bets write");
            }
            return Err(err.into());
        }
        Ok(())
    }
}

impl BetBackend for CsvFileBackend {
    fn append_rows(&mut self, rows: &[BetRecord]) -> Result<(), StoreError> {
        // One write per batch so rows of different batches never interleave.
        let mut buf = String::new();
        for row in rows {
            buf.push_str(&row.to_row());
            buf.push('\n');
        }
        self.write_or_rollback(|file| {
            file.write_all(buf.as_bytes())?;
            file.flush()
        })
    }

    fn read_all_rows(&self) -> Result<Vec<BetRecord>, StoreError> {
        let contents = io::read_to_string(&self.file)?;
        contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, line)| {
                BetRecord::parse_row(line).map_err(|source| StoreError::Corrupt {
                    line: index + 1,
                    source,
                })
            })
            .collect()
    }
}

pub struct BetStore {
    backend: Box<dyn BetBackend>,
    rows: Vec<BetRecord>,
}

impl BetStore {
    /// Loads whatever the backend already holds. This is the only read the
    /// store ever makes against its backend.
    pub fn new(backend: Box<dyn BetBackend>) -> Result<Self, StoreError> {
        let rows = backend.read_all_rows()?;
        Ok(Self { backend, rows })
    }

    pub fn in_memory() -> Self {
        Self {
            backend: Box::new(MemoryBackend),
            rows: Vec::new(),
        }
    }

    /// Opens a file-backed store. Rows already in the file stay visible.
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::new(Box::new(CsvFileBackend::open(path)?))
    }

    /// Makes every bet of the batch visible to later snapshots, in order.
    /// On error nothing of the batch is visible.
    pub fn append(&mut self, bets: &[BetRecord]) -> Result<(), StoreError> {
        if bets.is_empty() {
            return Ok(());
        }
        self.backend.append_rows(bets)?;
        self.rows.extend_from_slice(bets);
        Ok(())
    }

    /// Every bet appended so far, in append order.
    pub fn snapshot(&self) -> &[BetRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl std::fmt::Debug for BetStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BetStore").field("len", &self.rows.len()).finish()
    }
}
