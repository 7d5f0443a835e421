//! LMDB-backed transfer journal.
//!
//! Every state transition an operator commits is appended here as a
//! hash-chained record, giving crash recovery a durable source of truth
//! and audits a tamper-evident trail. Keys are
//! `[transfer_id bytes][seq: 8 bytes big-endian]`; values are
//! JSON-serialized [`JournalRecord`]s. A separate `heads` database tracks
//! the last `(seq, hash)` per transfer so appends are O(1).

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use bitcoin::hashes::{Hash as _, sha256};
use heed::types::Bytes as HeedBytes;
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};

use crate::StorageError;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A journaled transfer event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JournalEvent {
    TransferCreated {
        transfer_type: String,
        sender: String,
        receiver: String,
        leaf_count: usize,
    },
    RefundsSigned,
    SenderTweakApplied,
    ChainConfirmed {
        height: u64,
    },
    ChainReorged,
    ReceiverTweakApplied,
    RefundsFinalized,
    StatusChanged {
        from: String,
        to: String,
    },
}

/// One hash-chained journal record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Zero-based sequence within the transfer's chain.
    pub seq: u64,
    /// The event.
    pub event: JournalEvent,
    /// Hash of the previous record; all-zero for the first.
    pub prev_hash: [u8; 32],
}

impl JournalRecord {
    /// The chain hash of this record: `sha256(prev_hash || seq_be || json(event))`.
    fn chain_hash(&self) -> Result<[u8; 32], StorageError> {
        let event_json = serde_json::to_vec(&self.event)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let mut payload = Vec::with_capacity(32 + 8 + event_json.len());
        payload.extend_from_slice(&self.prev_hash);
        payload.extend_from_slice(&self.seq.to_be_bytes());
        payload.extend_from_slice(&event_json);
        Ok(sha256::Hash::hash(&payload).to_byte_array())
    }
}

// ---------------------------------------------------------------------------
// TransferJournal
// ---------------------------------------------------------------------------

/// LMDB-backed journal using heed.
pub struct TransferJournal {
    env: Env,
    entries: Database<HeedBytes, HeedBytes>,
    heads: Database<HeedBytes, HeedBytes>,
}

#[derive(Serialize, Deserialize)]
struct Head {
    seq: u64,
    hash: [u8; 32],
}

fn entry_key(transfer_id: &str, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(transfer_id.len() + 8);
    key.extend_from_slice(transfer_id.as_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

impl TransferJournal {
    /// Open or create the LMDB environment at the given directory.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(path).map_err(|e| StorageError::Internal(e.to_string()))?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(256 * 1024 * 1024)
                .max_dbs(2)
                .open(path)
                .map_err(|e| StorageError::Internal(e.to_string()))?
        };

        let mut wtxn = env
            .write_txn()
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        let entries: Database<HeedBytes, HeedBytes> = env
            .create_database(&mut wtxn, Some("entries"))
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        let heads: Database<HeedBytes, HeedBytes> = env
            .create_database(&mut wtxn, Some("heads"))
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        Ok(Self { env, entries, heads })
    }

    /// Append an event to a transfer's chain.
    pub fn append(&self, transfer_id: &str, event: JournalEvent) -> Result<(), StorageError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let head: Option<Head> = self
            .heads
            .get(&wtxn, transfer_id.as_bytes())
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .map(|bytes| {
                serde_json::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
            })
            .transpose()?;

        let (seq, prev_hash) = match head {
            Some(h) => (h.seq + 1, h.hash),
            None => (0, [0u8; 32]),
        };

        let record = JournalRecord {
            seq,
            event,
            prev_hash,
        };
        let hash = record.chain_hash()?;

        let record_json = serde_json::to_vec(&record)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.entries
            .put(&mut wtxn, &entry_key(transfer_id, seq), &record_json)
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let head_json = serde_json::to_vec(&Head { seq, hash })
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.heads
            .put(&mut wtxn, transfer_id.as_bytes(), &head_json)
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| StorageError::Internal(e.to_string()))
    }

    /// All records for a transfer, in sequence order.
    pub fn records(&self, transfer_id: &str) -> Result<Vec<JournalRecord>, StorageError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let mut out = Vec::new();
        let iter = self
            .entries
            .prefix_iter(&rtxn, transfer_id.as_bytes())
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        for item in iter {
            let (_key, value) = item.map_err(|e| StorageError::Internal(e.to_string()))?;
            let record: JournalRecord = serde_json::from_slice(value)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            out.push(record);
        }
        out.sort_by_key(|r| r.seq);
        Ok(out)
    }

    /// Verify a transfer's hash chain, returning the record count.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ConstraintViolation`] on a broken chain.
    pub fn verify_chain(&self, transfer_id: &str) -> Result<usize, StorageError> {
        let records = self.records(transfer_id)?;
        let mut expected_prev = [0u8; 32];
        for (i, record) in records.iter().enumerate() {
            if record.seq != i as u64 {
                return Err(StorageError::ConstraintViolation("journal sequence gap"));
            }
            if record.prev_hash != expected_prev {
                return Err(StorageError::ConstraintViolation("journal hash chain broken"));
            }
            expected_prev = record.chain_hash()?;
        }
        Ok(records.len())
    }

    /// Dump every chain to a JSON file, returning the record count.
    pub fn dump_to_file(&self, path: &Path) -> Result<usize, StorageError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let mut by_transfer: HashMap<String, Vec<JournalRecord>> = HashMap::new();
        let iter = self
            .entries
            .iter(&rtxn)
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        let mut count = 0;
        for item in iter {
            let (key, value) = item.map_err(|e| StorageError::Internal(e.to_string()))?;
            let id_bytes = &key[..key.len().saturating_sub(8)];
            let id = String::from_utf8_lossy(id_bytes).into_owned();
            let record: JournalRecord = serde_json::from_slice(value)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            by_transfer.entry(id).or_default().push(record);
            count += 1;
        }

        let json = serde_json::to_string_pretty(&by_transfer)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        fs::write(path, json).map_err(|e| StorageError::Internal(e.to_string()))?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, TransferJournal) {
        let dir = tempfile::tempdir().expect("tempdir");
        let journal = TransferJournal::open(dir.path()).expect("open journal");
        (dir, journal)
    }

    #[test]
    fn append_and_read_back_in_order() {
        let (_dir, journal) = open_temp();

        journal
            .append(
                "t1",
                JournalEvent::TransferCreated {
                    transfer_type: "transfer".into(),
                    sender: "aa".into(),
                    receiver: "bb".into(),
                    leaf_count: 1,
                },
            )
            .unwrap();
        journal.append("t1", JournalEvent::RefundsSigned).unwrap();
        journal.append("t1", JournalEvent::SenderTweakApplied).unwrap();

        let records = journal.records("t1").unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].seq, 0);
        assert_eq!(records[1].event, JournalEvent::RefundsSigned);
        assert_eq!(records[0].prev_hash, [0u8; 32]);
    }

    #[test]
    fn chains_are_per_transfer() {
        let (_dir, journal) = open_temp();

        journal.append("t1", JournalEvent::RefundsSigned).unwrap();
        journal.append("t2", JournalEvent::RefundsSigned).unwrap();
        journal.append("t1", JournalEvent::SenderTweakApplied).unwrap();

        assert_eq!(journal.records("t1").unwrap().len(), 2);
        assert_eq!(journal.records("t2").unwrap().len(), 1);
        assert_eq!(journal.verify_chain("t1").unwrap(), 2);
        assert_eq!(journal.verify_chain("t2").unwrap(), 1);
    }

    #[test]
    fn verify_chain_accepts_empty_and_links_hashes() {
        let (_dir, journal) = open_temp();
        assert_eq!(journal.verify_chain("missing").unwrap(), 0);

        journal.append("t1", JournalEvent::RefundsSigned).unwrap();
        journal
            .append(
                "t1",
                JournalEvent::StatusChanged {
                    from: "sender_initiated".into(),
                    to: "sender_key_tweak_pending".into(),
                },
            )
            .unwrap();

        let records = journal.records("t1").unwrap();
        assert_eq!(records[1].prev_hash, records[0].chain_hash().unwrap());
        assert_eq!(journal.verify_chain("t1").unwrap(), 2);
    }

    #[test]
    fn journal_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let journal = TransferJournal::open(dir.path()).unwrap();
            journal.append("t1", JournalEvent::RefundsSigned).unwrap();
        }
        let journal = TransferJournal::open(dir.path()).unwrap();
        journal.append("t1", JournalEvent::SenderTweakApplied).unwrap();
        assert_eq!(journal.verify_chain("t1").unwrap(), 2);
    }
}
