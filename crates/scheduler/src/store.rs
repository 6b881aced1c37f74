//! Transactional persistence capability.
//!
//! A store runs bodies against a [`StateTransaction`] handle: the body sees
//! the decoded existing document (already migrated), may replace it with
//! `set_state`, and the store commits atomically afterwards. Decode and read
//! problems are soft — they surface on the handle so the scheduler can log
//! and continue with in-memory state — while commit failures are hard errors
//! returned to the caller.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use crate::state::{self, Migration, RuntimeState};

/// In-flight view of one transaction.
pub struct StateTransaction {
    existing: Option<RuntimeState>,
    current: RuntimeState,
    migration: Option<Migration>,
    read_error: Option<String>,
    dirty: bool,
}

impl StateTransaction {
    fn new(
        existing: Option<RuntimeState>,
        migration: Option<Migration>,
        read_error: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let current = existing
            .clone()
            .unwrap_or_else(|| RuntimeState::empty(now));
        Self {
            existing,
            current,
            migration,
            read_error,
            dirty: false,
        }
    }

    /// The state as it was on entry, if any document existed and decoded.
    pub fn existing_state(&self) -> Option<&RuntimeState> {
        self.existing.as_ref()
    }

    /// The state this transaction will commit if left untouched.
    pub fn current_state(&self) -> &RuntimeState {
        &self.current
    }

    /// Replace the state; marks the transaction for commit.
    pub fn set_state(&mut self, next: RuntimeState) {
        self.current = next;
        self.dirty = true;
    }

    /// The schema migration applied while decoding, if any.
    pub fn migration(&self) -> Option<Migration> {
        self.migration
    }

    /// Why the existing document could not be used, if reading failed.
    pub fn read_error(&self) -> Option<&str> {
        self.read_error.as_deref()
    }
}

pub type TransactionBody = Box<dyn FnOnce(&mut StateTransaction) + Send>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O: {0}")]
    Io(String),

    #[error("serialization: {0}")]
    Serialize(String),
}

/// Durable document storage with transactional replace semantics.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Run `body` against the current document. Commits the new state iff
    /// the body called `set_state`; on error the old document is unchanged.
    async fn transaction(
        &self,
        now: DateTime<Utc>,
        body: TransactionBody,
    ) -> Result<(), StoreError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// JSON file store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// File-backed store: one pretty-printed JSON document, committed by writing
/// a sibling temp file and renaming it into place.
pub struct JsonFileStore {
    path: PathBuf,
    gate: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn transaction(
        &self,
        now: DateTime<Utc>,
        body: TransactionBody,
    ) -> Result<(), StoreError> {
        let _serialized = self.gate.lock().await;

        let path = self.path.clone();
        let raw = tokio::task::spawn_blocking(move || read_document(&path))
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;

        let (existing, migration, read_error) = match raw {
            Ok(Some(value)) => match state::decode(value) {
                Ok((decoded, migration)) => (Some(decoded), migration, None),
                Err(e) => (None, None, Some(e.to_string())),
            },
            Ok(None) => (None, None, None),
            Err(e) => (None, None, Some(e)),
        };

        let mut tx = StateTransaction::new(existing, migration, read_error, now);
        body(&mut tx);

        if tx.dirty {
            let json = serde_json::to_string_pretty(&tx.current)
                .map_err(|e| StoreError::Serialize(e.to_string()))?;
            let path = self.path.clone();
            tokio::task::spawn_blocking(move || write_document(&path, &json))
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?
                .map_err(|e| StoreError::Io(e.to_string()))?;
        }
        Ok(())
    }
}

fn read_document(path: &Path) -> Result<Option<Value>, String> {
    match std::fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text).map(Some).map_err(|e| e.to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.to_string()),
    }
}

fn write_document(path: &Path, json: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-memory store for tests and non-durable embedders. Holds the raw JSON
/// document so legacy-version payloads can be seeded, and supports read /
/// write fault injection.
#[derive(Default)]
pub struct MemoryStore {
    document: Mutex<Option<Value>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a raw document, e.g. a v1 payload for migration tests.
    pub fn seed(&self, document: Value) {
        *self.document.lock() = Some(document);
    }

    pub fn document(&self) -> Option<Value> {
        self.document.lock().clone()
    }

    /// The committed document, decoded (after migration). None if nothing
    /// was ever committed or seeded.
    pub fn state(&self) -> Option<RuntimeState> {
        self.document
            .lock()
            .clone()
            .and_then(|v| state::decode(v).ok())
            .map(|(s, _)| s)
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn transaction(
        &self,
        now: DateTime<Utc>,
        body: TransactionBody,
    ) -> Result<(), StoreError> {
        let (existing, migration, read_error) = if self.fail_reads.load(Ordering::SeqCst) {
            (None, None, Some("injected read failure".to_string()))
        } else {
            match self.document.lock().clone() {
                None => (None, None, None),
                Some(value) => match state::decode(value) {
                    Ok((decoded, migration)) => (Some(decoded), migration, None),
                    Err(e) => (None, None, Some(e.to_string())),
                },
            }
        };

        let mut tx = StateTransaction::new(existing, migration, read_error, now);
        body(&mut tx);

        if tx.dirty {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Io("injected write failure".to_string()));
            }
            let value = serde_json::to_value(&tx.current)
                .map_err(|e| StoreError::Serialize(e.to_string()))?;
            *self.document.lock() = Some(value);
        }
        Ok(())
    }
}
