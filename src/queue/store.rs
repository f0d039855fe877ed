//! Durable slot storage and the persistent queue built on it.

use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};
use tracing::{error, warn};

use super::action::QueuedAction;

/// Slot holding actions that exhausted a bounded retry policy.
pub const DEAD_LETTER_SLOT: &str = "nura_pos_offline_dead_letter_v1";

/// How often `append` re-reads after losing a versioned write to another writer.
const APPEND_RETRIES: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("storage unavailable: {0}")]
  Unavailable(String),
  #[error("stored queue at version {version} is corrupt: {source}")]
  Corrupt {
    version: i64,
    #[source]
    source: serde_json::Error,
  },
  #[error("slot changed concurrently (expected version {expected})")]
  Conflict { expected: i64 },
}

impl From<rusqlite::Error> for StoreError {
  fn from(e: rusqlite::Error) -> Self {
    StoreError::Unavailable(e.to_string())
  }
}

/// Raw slot contents plus the version that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
  pub value: String,
  pub version: i64,
}

/// Durable named slots with versioned writes.
///
/// Version 0 means "never written". Every successful write bumps the version,
/// which lets independent writers detect that they worked from a stale read.
pub trait SlotStorage: Send + Sync {
  fn get(&self, name: &str) -> Result<Option<Slot>, StoreError>;

  /// Unconditional replace. Returns the new version.
  fn put(&self, name: &str, value: &str) -> Result<i64, StoreError>;

  /// Replace only if the slot is still at `expected`. Returns false on a lost race.
  fn put_if_version(&self, name: &str, expected: i64, value: &str) -> Result<bool, StoreError>;
}

/// SQLite-backed slots.
pub struct SqliteSlots {
  conn: Mutex<Connection>,
}

impl SqliteSlots {
  pub fn new(conn: Connection) -> Self {
    Self {
      conn: Mutex::new(conn),
    }
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))
  }
}

impl SlotStorage for SqliteSlots {
  fn get(&self, name: &str) -> Result<Option<Slot>, StoreError> {
    let conn = self.lock()?;
    let slot = conn
      .query_row(
        "SELECT value, version FROM slots WHERE name = ?",
        params![name],
        |row| {
          Ok(Slot {
            value: row.get(0)?,
            version: row.get(1)?,
          })
        },
      )
      .optional()?;
    Ok(slot)
  }

  fn put(&self, name: &str, value: &str) -> Result<i64, StoreError> {
    let conn = self.lock()?;
    let version = conn.query_row(
      "INSERT INTO slots (name, value, version, updated_at) VALUES (?1, ?2, 1, datetime('now'))
       ON CONFLICT(name) DO UPDATE SET
         value = excluded.value,
         version = slots.version + 1,
         updated_at = excluded.updated_at
       RETURNING version",
      params![name, value],
      |row| row.get(0),
    )?;
    Ok(version)
  }

  fn put_if_version(&self, name: &str, expected: i64, value: &str) -> Result<bool, StoreError> {
    let conn = self.lock()?;
    let changed = if expected == 0 {
      conn.execute(
        "INSERT INTO slots (name, value, version, updated_at) VALUES (?1, ?2, 1, datetime('now'))
         ON CONFLICT(name) DO NOTHING",
        params![name, value],
      )?
    } else {
      conn.execute(
        "UPDATE slots SET value = ?1, version = version + 1, updated_at = datetime('now')
         WHERE name = ?2 AND version = ?3",
        params![value, name, expected],
      )?
    };
    Ok(changed == 1)
  }
}

/// The queue as read at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
  pub actions: Vec<QueuedAction>,
  pub version: i64,
}

/// Ordered list of pending actions persisted as one JSON array in a slot.
///
/// The whole list is the unit of persistence: every write replaces it.
pub struct QueueStore<S: SlotStorage> {
  slots: Arc<S>,
  slot: String,
}

impl<S: SlotStorage> QueueStore<S> {
  pub fn new(slots: Arc<S>, slot: impl Into<String>) -> Self {
    Self {
      slots,
      slot: slot.into(),
    }
  }

  /// Another queue sharing the same storage under a different slot name.
  pub fn sibling(&self, slot: impl Into<String>) -> Self {
    Self {
      slots: Arc::clone(&self.slots),
      slot: slot.into(),
    }
  }

  /// Read the queue, reporting storage and parse failures.
  pub fn load(&self) -> Result<QueueSnapshot, StoreError> {
    let Some(slot) = self.slots.get(&self.slot)? else {
      return Ok(QueueSnapshot::default());
    };
    if slot.value.trim().is_empty() {
      return Ok(QueueSnapshot {
        actions: Vec::new(),
        version: slot.version,
      });
    }

    let actions = serde_json::from_str(&slot.value).map_err(|source| StoreError::Corrupt {
      version: slot.version,
      source,
    })?;
    Ok(QueueSnapshot {
      actions,
      version: slot.version,
    })
  }

  /// Read the queue; any failure is logged and reads as empty.
  pub fn read(&self) -> Vec<QueuedAction> {
    match self.load() {
      Ok(snapshot) => snapshot.actions,
      Err(e) => {
        error!(slot = %self.slot, error = %e, "Error reading offline queue");
        Vec::new()
      }
    }
  }

  /// Replace the stored queue.
  pub fn save(&self, actions: &[QueuedAction]) -> Result<i64, StoreError> {
    let json = encode(actions)?;
    self.slots.put(&self.slot, &json)
  }

  /// Replace the stored queue; a failure is logged and the write is lost.
  pub fn write(&self, actions: &[QueuedAction]) {
    if let Err(e) = self.save(actions) {
      error!(slot = %self.slot, error = %e, "Error saving offline queue");
    }
  }

  /// Replace the stored queue only if nobody wrote it since `version` was read.
  pub fn save_if_unchanged(&self, version: i64, actions: &[QueuedAction]) -> Result<(), StoreError> {
    let json = encode(actions)?;
    if self.slots.put_if_version(&self.slot, version, &json)? {
      Ok(())
    } else {
      Err(StoreError::Conflict { expected: version })
    }
  }

  /// Add an action at the tail. Returns the new queue length.
  ///
  /// Read-modify-write guarded by the slot version, so an append racing with
  /// another process retries on a fresh read instead of overwriting it.
  pub fn append(&self, action: QueuedAction) -> Result<usize, StoreError> {
    for _ in 0..APPEND_RETRIES {
      let snapshot = match self.load() {
        Ok(snapshot) => snapshot,
        Err(StoreError::Corrupt { version, source }) => {
          warn!(slot = %self.slot, error = %source, "Discarding unreadable offline queue");
          QueueSnapshot {
            actions: Vec::new(),
            version,
          }
        }
        Err(e) => return Err(e),
      };

      let mut actions = snapshot.actions;
      actions.push(action.clone());
      match self.save_if_unchanged(snapshot.version, &actions) {
        Ok(()) => return Ok(actions.len()),
        Err(StoreError::Conflict { .. }) => continue,
        Err(e) => return Err(e),
      }
    }

    Err(StoreError::Unavailable(format!(
      "gave up appending to '{}' after {} concurrent writes",
      self.slot, APPEND_RETRIES
    )))
  }

}

fn encode(actions: &[QueuedAction]) -> Result<String, StoreError> {
  serde_json::to_string(actions).map_err(|e| StoreError::Unavailable(e.to_string()))
}
