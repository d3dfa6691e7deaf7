// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Durable list of bridge pairs and whether their events are subscribed.

use crate::error::{BridgeError, BridgeResult};
use crate::journal::RlpJournal;
use crate::types::BridgeJournalEntry;
use ethers::types::Address;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

pub const ADDRESS_JOURNAL_FILE: &str = "bridge_addrs.rlp";

pub struct AddressJournal {
    journal: RlpJournal<BridgeJournalEntry>,
    // keyed by child side address
    entries: BTreeMap<Address, BridgeJournalEntry>,
}

impl AddressJournal {
    /// Opens the journal at `path`, replaying existing entries. Later
    /// records of the same pair override earlier ones.
    pub fn open(path: impl Into<PathBuf>) -> BridgeResult<Self> {
        let mut journal = RlpJournal::new(path);
        let mut entries = BTreeMap::new();
        journal.load(|entry: BridgeJournalEntry| {
            entries.insert(entry.local_address, entry);
        })?;
        info!(
            "Address journal {:?} holds {} bridge pairs",
            journal.path(),
            entries.len()
        );
        Ok(Self { journal, entries })
    }

    pub fn entries(&self) -> Vec<BridgeJournalEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.entry_of(address).is_some()
    }

    /// The pair `address` belongs to, on either side.
    pub fn entry_of(&self, address: &Address) -> Option<&BridgeJournalEntry> {
        self.entries
            .get(address)
            .or_else(|| self.entries.values().find(|e| e.remote_address == *address))
    }

    pub fn counterpart_of(&self, address: &Address) -> Option<Address> {
        self.entry_of(address)
            .and_then(|entry| entry.counterpart_of(address))
    }

    /// Appends a new pair. Neither address may already be journaled.
    pub fn insert(&mut self, local: Address, remote: Address) -> BridgeResult<()> {
        if local.is_zero() || remote.is_zero() {
            return Err(BridgeError::EmptyBridgeAddress);
        }
        for address in [local, remote] {
            if self.contains(&address) {
                return Err(BridgeError::DuplicatedJournal(address));
            }
        }
        let entry = BridgeJournalEntry::new(local, remote);
        self.journal.insert(&entry)?;
        self.entries.insert(local, entry);
        Ok(())
    }

    /// Flips the subscribed flag of the pair holding `address` and rotates.
    pub fn set_subscribed(&mut self, address: &Address, subscribed: bool) -> BridgeResult<()> {
        let local = self
            .entry_of(address)
            .map(|e| e.local_address)
            .ok_or(BridgeError::NoBridgeInfo(*address))?;
        if let Some(entry) = self.entries.get_mut(&local) {
            if entry.subscribed == subscribed {
                return Ok(());
            }
            entry.subscribed = subscribed;
        }
        self.rotate()
    }

    /// Drops the pair holding `address` and rotates.
    pub fn remove(&mut self, address: &Address) -> BridgeResult<BridgeJournalEntry> {
        let local = self
            .entry_of(address)
            .map(|e| e.local_address)
            .ok_or(BridgeError::NoBridgeInfo(*address))?;
        let removed = self
            .entries
            .remove(&local)
            .ok_or(BridgeError::NoBridgeInfo(local))?;
        self.rotate()?;
        Ok(removed)
    }

    pub fn rotate(&mut self) -> BridgeResult<()> {
        self.journal.rotate(self.entries.values())?;
        Ok(())
    }

    pub fn close(&mut self) -> BridgeResult<()> {
        self.journal.close()?;
        Ok(())
    }
}
