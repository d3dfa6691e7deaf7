// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Append-only file of RLP items, rewritten atomically on rotation.

use ethers::utils::rlp::{self, Decodable, Encodable, Rlp};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("no active journal")]
    NoActiveJournal,
    #[error("journal io on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<JournalError> for crate::error::BridgeError {
    fn from(err: JournalError) -> Self {
        match err {
            JournalError::NoActiveJournal => crate::error::BridgeError::NoActiveAddressJournal,
            JournalError::Io { .. } => crate::error::BridgeError::Fatal(err.to_string()),
        }
    }
}

/// Runs `f` on the blocking thread pool with the journal taken out of
/// `slot`, and puts it back afterwards. Returns `None` when `slot` is empty.
/// A failed blocking task drops the journal, leaving `slot` empty.
pub async fn run_blocking<J, R, F>(slot: &mut Option<J>, f: F) -> Option<R>
where
    J: Send + 'static,
    R: Send + 'static,
    F: FnOnce(&mut J) -> R + Send + 'static,
{
    let mut journal = slot.take()?;
    match tokio::task::spawn_blocking(move || {
        let result = f(&mut journal);
        (journal, result)
    })
    .await
    {
        Ok((journal, result)) => {
            *slot = Some(journal);
            Some(result)
        }
        Err(e) => {
            error!("Journal task failed: {}", e);
            None
        }
    }
}

pub struct RlpJournal<T> {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    _item: PhantomData<T>,
}

impl<T: Encodable + Decodable> RlpJournal<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
            _item: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> JournalError {
        JournalError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Replays every intact item of the file into `add` and opens the file
    /// for appending. A corrupt tail is logged and ignored. Returns the
    /// number of replayed items.
    pub fn load(&mut self, mut add: impl FnMut(T)) -> Result<usize, JournalError> {
        let mut loaded = 0;
        if self.path.exists() {
            let data = fs::read(&self.path).map_err(|e| self.io_err(e))?;
            let mut offset = 0;
            while offset < data.len() {
                let rlp = Rlp::new(&data[offset..]);
                let size = match rlp.payload_info() {
                    Ok(info) => info.total(),
                    Err(e) => {
                        warn!("Journal {:?} truncated at byte {}: {}", self.path, offset, e);
                        break;
                    }
                };
                if offset + size > data.len() {
                    warn!("Journal {:?} ends with a partial item", self.path);
                    break;
                }
                match rlp::decode::<T>(&data[offset..offset + size]) {
                    Ok(item) => {
                        add(item);
                        loaded += 1;
                    }
                    Err(e) => warn!("Skipping undecodable journal item at {}: {}", offset, e),
                }
                offset += size;
            }
            info!("Loaded {} items from journal {:?}", loaded, self.path);
        }
        self.open_writer()?;
        Ok(loaded)
    }

    fn open_writer(&mut self) -> Result<(), JournalError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_err(e))?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    pub fn insert(&mut self, item: &T) -> Result<(), JournalError> {
        let path = self.path.clone();
        let writer = self.writer.as_mut().ok_or(JournalError::NoActiveJournal)?;
        writer
            .write_all(&rlp::encode(item))
            .and_then(|_| writer.flush())
            .map_err(|source| JournalError::Io { path, source })
    }

    /// Replaces the file content with `items` through a synced temporary
    /// file and a rename, then keeps appending to the new file.
    pub fn rotate<'a>(&mut self, items: impl IntoIterator<Item = &'a T>) -> Result<usize, JournalError>
    where
        T: 'a,
    {
        self.writer = None;
        let tmp = self.path.with_extension("new");
        let mut count = 0;
        {
            let file = File::create(&tmp).map_err(|e| self.io_err(e))?;
            let mut writer = BufWriter::new(file);
            for item in items {
                writer.write_all(&rlp::encode(item)).map_err(|e| self.io_err(e))?;
                count += 1;
            }
            let file = writer.into_inner().map_err(|e| self.io_err(e.into_error()))?;
            file.sync_all().map_err(|e| self.io_err(e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))?;
        self.open_writer()?;
        Ok(count)
    }

    pub fn close(&mut self) -> Result<(), JournalError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|e| self.io_err(e))?;
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }
}
