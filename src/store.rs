//! Durable store seam and its sled implementation
//!
//! Every table is a key prefix inside one sled database, so a write that spans
//! tables can still go through a single atomic [`sled::Batch`]. Rows are CBOR.
use super::error::StoreError;
use log::{debug, trace};
use sled::Batch;
use sled::transaction::{TransactionError, abort};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Listings,
    Requests,
    Threads,
    Messages,
    Stages,
    Profiles,
    Adhesions,
    Blobs,
}

impl Table {
    pub fn prefix(&self) -> &'static str {
        match self {
            Table::Listings => "listings/",
            Table::Requests => "requests/",
            Table::Threads => "threads/",
            Table::Messages => "messages/",
            Table::Stages => "stages/",
            Table::Profiles => "profiles/",
            Table::Adhesions => "adhesions/",
            Table::Blobs => "blobs/",
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix())
    }

    fn strip(&self, raw: &[u8]) -> String {
        let raw = String::from_utf8_lossy(raw);
        raw.strip_prefix(self.prefix()).unwrap_or(&raw).to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        table: Table,
        key: String,
        row: Vec<u8>,
    },
    Delete {
        table: Table,
        key: String,
    },
}

/// Precondition for [`DurableStore::apply_if`]: the row must still hold `expected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guard {
    pub table: Table,
    pub key: String,
    pub expected: Vec<u8>,
}

/// Row level change pushed by a [`Subscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Insert { key: String, row: Vec<u8> },
    Update { key: String, row: Vec<u8> },
    Delete { key: String },
}

impl ChangeEvent {
    pub fn key(&self) -> &str {
        match self {
            ChangeEvent::Insert { key, .. }
            | ChangeEvent::Update { key, .. }
            | ChangeEvent::Delete { key } => key,
        }
    }
}

pub trait DurableStore: Send + Sync {
    fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    /// Writes the row only if the key is free, otherwise [`StoreError::Conflict`].
    fn insert(&self, table: Table, key: &str, row: Vec<u8>) -> Result<(), StoreError>;
    /// Replaces `expected` with `row`; any other current value is a [`StoreError::Conflict`].
    fn update(&self, table: Table, key: &str, expected: &[u8], row: Vec<u8>) -> Result<(), StoreError>;
    fn delete(&self, table: Table, key: &str) -> Result<(), StoreError>;
    /// Rows whose key starts with `prefix`, in key order.
    fn query(&self, table: Table, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
    /// Applies every write or none of them.
    fn apply(&self, writes: Vec<WriteOp>) -> Result<(), StoreError>;
    /// Like [`DurableStore::apply`], but only while `guard` holds, otherwise [`StoreError::Conflict`].
    fn apply_if(&self, guard: &Guard, writes: Vec<WriteOp>) -> Result<(), StoreError>;
    fn subscribe(&self, table: Table, prefix: &str) -> Result<Subscription, StoreError>;
}

pub fn encode_row<T: minicbor::Encode<()>>(row: &T) -> Result<Vec<u8>, StoreError> {
    minicbor::to_vec(row).map_err(|e| StoreError::Corrupt {
        key: String::new(),
        reason: e.to_string(),
    })
}

pub fn decode_row<T>(key: &str, raw: &[u8]) -> Result<T, StoreError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    minicbor::decode(raw).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Live feed of changes under one key prefix. Dropping it unsubscribes.
pub struct Subscription {
    table: Table,
    subscriber: sled::Subscriber,
    known: HashSet<String>,
}

impl Subscription {
    pub fn new(table: Table, subscriber: sled::Subscriber, known: HashSet<String>) -> Self {
        Self {
            table,
            subscriber,
            known,
        }
    }

    pub fn table(&self) -> Table {
        self.table
    }

    /// Next pending event without blocking.
    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        self.next_timeout(Duration::ZERO)
    }

    pub fn next_timeout(&mut self, timeout: Duration) -> Option<ChangeEvent> {
        let event = self.subscriber.next_timeout(timeout).ok()?;
        let change = match event {
            sled::Event::Insert { key, value } => {
                let key = self.table.strip(&key);
                if self.known.insert(key.clone()) {
                    ChangeEvent::Insert {
                        key,
                        row: value.to_vec(),
                    }
                } else {
                    ChangeEvent::Update {
                        key,
                        row: value.to_vec(),
                    }
                }
            }
            sled::Event::Remove { key } => {
                let key = self.table.strip(&key);
                self.known.remove(&key);
                ChangeEvent::Delete { key }
            }
        };
        trace!("feed {:?}: {}", self.table, change.key());
        Some(change)
    }
}

pub struct SledStore {
    instance: Arc<sled::Db>,
}

impl SledStore {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self { instance }
    }

    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db = sled::open(path)?;
        Ok(Self::new(Arc::new(db)))
    }
}

impl DurableStore for SledStore {
    fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .instance
            .get(table.full_key(key))?
            .map(|row| row.to_vec()))
    }

    fn insert(&self, table: Table, key: &str, row: Vec<u8>) -> Result<(), StoreError> {
        let full = table.full_key(key);
        self.instance
            .compare_and_swap(&full, None as Option<&[u8]>, Some(row))?
            .map_err(|_| StoreError::Conflict { key: full })
    }

    fn update(&self, table: Table, key: &str, expected: &[u8], row: Vec<u8>) -> Result<(), StoreError> {
        let full = table.full_key(key);
        self.instance
            .compare_and_swap(&full, Some(expected), Some(row))?
            .map_err(|_| StoreError::Conflict { key: full })
    }

    fn delete(&self, table: Table, key: &str) -> Result<(), StoreError> {
        self.instance.remove(table.full_key(key))?;
        Ok(())
    }

    fn query(&self, table: Table, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut rows = Vec::new();
        for entry in self.instance.scan_prefix(table.full_key(prefix)) {
            let (key, value) = entry?;
            rows.push((table.strip(&key), value.to_vec()));
        }
        Ok(rows)
    }

    fn apply(&self, writes: Vec<WriteOp>) -> Result<(), StoreError> {
        let mut batch = Batch::default();
        for write in writes {
            match write {
                WriteOp::Put { table, key, row } => batch.insert(table.full_key(&key).as_bytes(), row),
                WriteOp::Delete { table, key } => batch.remove(table.full_key(&key).as_bytes()),
            }
        }
        self.instance.apply_batch(batch)?;
        Ok(())
    }

    fn apply_if(&self, guard: &Guard, writes: Vec<WriteOp>) -> Result<(), StoreError> {
        let guard_key = guard.table.full_key(&guard.key);
        let writes: Vec<(String, Option<Vec<u8>>)> = writes
            .into_iter()
            .map(|write| match write {
                WriteOp::Put { table, key, row } => (table.full_key(&key), Some(row)),
                WriteOp::Delete { table, key } => (table.full_key(&key), None),
            })
            .collect();

        let result = self.instance.transaction(|tx| {
            let current = tx.get(guard_key.as_bytes())?;
            if current.as_deref() != Some(guard.expected.as_slice()) {
                return abort(());
            }
            for (key, row) in &writes {
                match row {
                    Some(row) => {
                        tx.insert(key.as_bytes(), row.clone())?;
                    }
                    None => {
                        tx.remove(key.as_bytes())?;
                    }
                }
            }
            Ok(())
        });

        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(())) => Err(StoreError::Conflict { key: guard_key }),
            Err(TransactionError::Storage(err)) => Err(err.into()),
        }
    }

    fn subscribe(&self, table: Table, prefix: &str) -> Result<Subscription, StoreError> {
        let full = table.full_key(prefix);
        // subscribe before the scan so nothing written in between is missed
        let subscriber = self.instance.watch_prefix(full.as_bytes());
        let known = self
            .query(table, prefix)?
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        debug!("subscribed to {full}");
        Ok(Subscription::new(table, subscriber, known))
    }
}
