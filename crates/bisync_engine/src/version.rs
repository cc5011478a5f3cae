//! Version snapshots and rollback.
//!
//! Snapshots are taken only when the engine lands on `Synced` and are
//! immutable afterwards. History is a bounded ring: inserting past capacity
//! evicts the oldest snapshot. Rollback either hands back a complete,
//! integrity-checked document or fails without side effects.

use crate::clock::Timestamp;
use crate::document::Document;
use crate::error::{SyncError, SyncResult};
use crate::state::SystemState;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::fmt;
use tracing::debug;
use uuid::Uuid;

/// Unique snapshot identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionId(Uuid);

impl VersionId {
    /// Generates a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for VersionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for VersionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotTrigger {
    /// A conversion completed.
    SyncCompletion,
    /// The engine started.
    Init,
}

/// Everything a snapshot restores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedState {
    /// Always `Synced`.
    pub state: SystemState,
    /// Both sides and the model.
    pub document: Document,
}

impl CapturedState {
    /// Encodes to CBOR.
    pub fn to_cbor(&self) -> SyncResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf).map_err(|e| SyncError::Codec(e.to_string()))?;
        Ok(buf)
    }

    /// Decodes from CBOR.
    pub fn from_cbor(bytes: &[u8]) -> SyncResult<Self> {
        ciborium::de::from_reader(bytes).map_err(|e| SyncError::Codec(e.to_string()))
    }
}

/// An immutable capture of a synced document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    id: VersionId,
    ordinal: u64,
    timestamp: Timestamp,
    trigger: SnapshotTrigger,
    captured: CapturedState,
    checksum: [u8; 32],
}

impl VersionSnapshot {
    fn capture(
        ordinal: u64,
        timestamp: Timestamp,
        trigger: SnapshotTrigger,
        document: &Document,
    ) -> SyncResult<Self> {
        let captured = CapturedState {
            state: SystemState::Synced,
            document: document.clone(),
        };
        let checksum = digest(&captured.to_cbor()?);
        Ok(Self {
            id: VersionId::new(),
            ordinal,
            timestamp,
            trigger,
            captured,
            checksum,
        })
    }

    /// Snapshot id.
    pub fn id(&self) -> VersionId {
        self.id
    }

    /// Position in creation order, starting at 1.
    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    /// When the snapshot was taken.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Why the snapshot was taken.
    pub fn trigger(&self) -> SnapshotTrigger {
        self.trigger
    }

    /// The captured state.
    pub fn captured(&self) -> &CapturedState {
        &self.captured
    }

    /// Canonical CBOR of the captured state, excluding id and timestamp.
    pub fn captured_bytes(&self) -> SyncResult<Vec<u8>> {
        self.captured.to_cbor()
    }

    /// SHA-256 of [`captured_bytes`](Self::captured_bytes) at creation.
    pub fn checksum(&self) -> [u8; 32] {
        self.checksum
    }

    /// Re-derives the checksum and compares.
    pub fn verify(&self) -> SyncResult<()> {
        let actual = digest(&self.captured_bytes()?);
        if actual == self.checksum {
            Ok(())
        } else {
            Err(SyncError::SnapshotCorrupted { id: self.id })
        }
    }
}

fn digest(bytes: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(bytes));
    out
}

/// The outcome of a successful rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackResult {
    /// The restored snapshot.
    pub version: VersionId,
    /// Its ordinal.
    pub ordinal: u64,
    /// The complete restored document.
    pub document: Document,
}

/// Owns the snapshot history.
#[derive(Debug)]
pub struct VersionManager {
    history: VecDeque<VersionSnapshot>,
    capacity: usize,
    next_ordinal: u64,
}

impl VersionManager {
    /// Creates an empty history holding at most `capacity` snapshots.
    pub fn new(capacity: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            next_ordinal: 1,
        }
    }

    /// Takes a snapshot of `document`.
    ///
    /// Rejected unless `state` is `Synced`. Evicts the oldest snapshot when
    /// the history is full.
    pub fn snapshot(
        &mut self,
        state: SystemState,
        trigger: SnapshotTrigger,
        document: &Document,
        at: Timestamp,
    ) -> SyncResult<VersionSnapshot> {
        if state != SystemState::Synced {
            return Err(SyncError::SnapshotRejected { state });
        }

        let snapshot = VersionSnapshot::capture(self.next_ordinal, at, trigger, document)?;
        self.next_ordinal += 1;

        if self.history.len() == self.capacity {
            if let Some(evicted) = self.history.pop_front() {
                debug!(ordinal = evicted.ordinal, "evicted oldest version");
            }
        }
        self.history.push_back(snapshot.clone());
        Ok(snapshot)
    }

    /// Resolves and checks the snapshot to restore.
    ///
    /// `None` selects the most recent snapshot. Nothing is modified; the
    /// caller swaps the returned document in as a whole.
    pub fn rollback(&self, id: Option<VersionId>) -> SyncResult<RollbackResult> {
        let snapshot = match id {
            Some(id) => self.get(id).ok_or(SyncError::VersionNotFound(id))?,
            None => self.latest().ok_or(SyncError::HistoryEmpty)?,
        };
        snapshot.verify()?;

        Ok(RollbackResult {
            version: snapshot.id,
            ordinal: snapshot.ordinal,
            document: snapshot.captured.document.clone(),
        })
    }

    /// Returns the snapshot with `id`.
    pub fn get(&self, id: VersionId) -> Option<&VersionSnapshot> {
        self.history.iter().find(|s| s.id == id)
    }

    /// Returns the most recent snapshot.
    pub fn latest(&self) -> Option<&VersionSnapshot> {
        self.history.back()
    }

    /// Returns the oldest retained snapshot.
    pub fn oldest(&self) -> Option<&VersionSnapshot> {
        self.history.front()
    }

    /// Returns the history, oldest first.
    pub fn history(&self) -> Vec<VersionSnapshot> {
        self.history.iter().cloned().collect()
    }

    /// Number of retained snapshots.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// Returns true if no snapshot is retained.
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Maximum number of retained snapshots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Flips a checksum byte so rollback paths can be exercised.
    #[cfg(test)]
    pub(crate) fn corrupt(&mut self, id: VersionId) {
        if let Some(snapshot) = self.history.iter_mut().find(|s| s.id == id) {
            snapshot.checksum[0] ^= 0xff;
        }
    }
}
