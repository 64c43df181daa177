//! Durable offline queue
//!
//! Every driver action lands here before it is submitted, so a crash or a
//! dead link never loses it. Items keep creation order and are replayed
//! one at a time by the [`ReplayWorker`].
//!
//! # Tables
//!
//! | Table | Key | Value | Purpose |
//! |-------|-----|-------|---------|
//! | `queue` | `position` | `QueueItem` | Pending items in creation order |
//! | `queue_index` | `id` | `position` | Lookup by idempotency key |
//! | `rejected` | `id` | `RejectedItem` | Terminal server rejections |
//! | `meta` | name | `u64` | Position counter |

mod replay;

pub use replay::{QueueEvent, ReplayWorker};

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use shared::error::{AppError, ErrorCode};
use shared::message::{DriverAction, Envelope, SubmitPayload};

use crate::error::{QueueError, QueueResult};

const QUEUE_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("queue");

const QUEUE_INDEX_TABLE: TableDefinition<&str, u64> = TableDefinition::new("queue_index");

const REJECTED_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("rejected");

const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

const NEXT_POSITION: &str = "next_position";

/// Replay state of a queued item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Queued,
    /// Gave up after the attempt cap; blocks everything behind it
    FailedToSync,
}

/// One recorded driver action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Idempotency key, also the hub's command id
    pub id: String,
    /// Creation order on this device
    pub position: u64,
    pub route_id: String,
    pub action: DriverAction,
    /// Route sequence the device had applied when recording
    pub observed_sequence: Option<u64>,
    pub created_at: i64,
    pub attempts: u32,
    pub state: SyncState,
    pub last_error: Option<String>,
}

impl QueueItem {
    /// Wire form of the submission
    pub fn to_envelope(&self) -> Result<Envelope, serde_json::Error> {
        let submit = SubmitPayload {
            action: self.action.clone(),
            observed_sequence: self.observed_sequence,
            created_at: self.created_at,
        };
        Envelope::submission(self.route_id.clone(), self.id.clone(), &submit)
    }

    pub fn is_blocked(&self) -> bool {
        self.state == SyncState::FailedToSync
    }

    /// Typed error for an item that gave up, `None` while still queued
    pub fn sync_error(&self) -> Option<AppError> {
        if !self.is_blocked() {
            return None;
        }
        let message = self
            .last_error
            .clone()
            .unwrap_or_else(|| "Item could not be synchronized".to_string());
        Some(
            AppError::with_message(ErrorCode::OfflineReplayExhausted, message)
                .with_detail("id", self.id.clone())
                .with_detail("attempts", self.attempts),
        )
    }
}

/// An item the hub refused for good
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedItem {
    pub item: QueueItem,
    pub error: AppError,
    pub rejected_at: i64,
}

/// Offline queue backed by redb
#[derive(Clone)]
pub struct OfflineQueue {
    db: Arc<Database>,
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue").finish_non_exhaustive()
    }
}

impl OfflineQueue {
    /// Open or create the queue file
    pub fn open(path: impl AsRef<Path>) -> QueueResult<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Volatile queue, for devices without storage and for tests
    pub fn open_in_memory() -> QueueResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> QueueResult<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(QUEUE_TABLE)?;
            let _ = write_txn.open_table(QUEUE_INDEX_TABLE)?;
            let _ = write_txn.open_table(REJECTED_TABLE)?;
            let _ = write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Append an action; the returned item carries its idempotency key
    pub fn enqueue(
        &self,
        route_id: &str,
        action: DriverAction,
        observed_sequence: Option<u64>,
    ) -> QueueResult<QueueItem> {
        let write_txn = self.db.begin_write()?;
        let item = {
            let mut meta = write_txn.open_table(META_TABLE)?;
            let position = meta.get(NEXT_POSITION)?.map(|g| g.value()).unwrap_or(1);
            meta.insert(NEXT_POSITION, position + 1)?;

            let item = QueueItem {
                id: shared::util::new_id(),
                position,
                route_id: route_id.to_string(),
                action,
                observed_sequence,
                created_at: shared::util::now_millis(),
                attempts: 0,
                state: SyncState::Queued,
                last_error: None,
            };
            let value = serde_json::to_vec(&item)?;
            write_txn.open_table(QUEUE_TABLE)?.insert(position, value.as_slice())?;
            write_txn
                .open_table(QUEUE_INDEX_TABLE)?
                .insert(item.id.as_str(), position)?;
            item
        };
        write_txn.commit()?;
        tracing::debug!(id = %item.id, route_id = %item.route_id, position = item.position, "Action queued");
        Ok(item)
    }

    /// Oldest item, the only one replay may work on
    pub fn head(&self) -> QueueResult<Option<QueueItem>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(QUEUE_TABLE)?;
        match table.first()? {
            Some((_, value)) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// All queued items in creation order
    pub fn items(&self) -> QueueResult<Vec<QueueItem>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(QUEUE_TABLE)?;
        let mut items = Vec::new();
        for result in table.iter()? {
            let (_, value) = result?;
            items.push(serde_json::from_slice(value.value())?);
        }
        Ok(items)
    }

    pub fn get(&self, id: &str) -> QueueResult<Option<QueueItem>> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(QUEUE_INDEX_TABLE)?;
        let Some(position) = index.get(id)?.map(|g| g.value()) else {
            return Ok(None);
        };
        let table = read_txn.open_table(QUEUE_TABLE)?;
        match table.get(position)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Items that gave up syncing
    pub fn failed(&self) -> QueueResult<Vec<QueueItem>> {
        Ok(self.items()?.into_iter().filter(QueueItem::is_blocked).collect())
    }

    pub fn len(&self) -> QueueResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(QUEUE_TABLE)?;
        Ok(table.len()?)
    }

    pub fn is_empty(&self) -> QueueResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Rewrite one item in place
    fn update<F>(&self, id: &str, f: F) -> QueueResult<QueueItem>
    where
        F: FnOnce(&mut QueueItem) -> QueueResult<()>,
    {
        let write_txn = self.db.begin_write()?;
        let item = {
            let position = write_txn
                .open_table(QUEUE_INDEX_TABLE)?
                .get(id)?
                .map(|g| g.value())
                .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
            let mut table = write_txn.open_table(QUEUE_TABLE)?;
            let mut item: QueueItem = match table.get(position)? {
                Some(value) => serde_json::from_slice(value.value())?,
                None => return Err(QueueError::NotFound(id.to_string())),
            };
            f(&mut item)?;
            let value = serde_json::to_vec(&item)?;
            table.insert(position, value.as_slice())?;
            item
        };
        write_txn.commit()?;
        Ok(item)
    }

    /// Remove an item, returning it
    fn take(&self, id: &str) -> QueueResult<Option<QueueItem>> {
        let write_txn = self.db.begin_write()?;
        let item = {
            let mut index = write_txn.open_table(QUEUE_INDEX_TABLE)?;
            let Some(position) = index.remove(id)?.map(|g| g.value()) else {
                return Ok(None);
            };
            let mut table = write_txn.open_table(QUEUE_TABLE)?;
            let removed = table.remove(position)?;
            match removed {
                Some(value) => Some(serde_json::from_slice::<QueueItem>(value.value())?),
                None => None,
            }
        };
        write_txn.commit()?;
        Ok(item)
    }

    /// Count one failed attempt
    pub fn record_attempt(&self, id: &str, error: &str) -> QueueResult<QueueItem> {
        self.update(id, |item| {
            item.attempts += 1;
            item.last_error = Some(error.to_string());
            Ok(())
        })
    }

    /// Stop replaying the item until the driver decides
    pub fn mark_failed(&self, id: &str) -> QueueResult<QueueItem> {
        let item = self.update(id, |item| {
            item.state = SyncState::FailedToSync;
            Ok(())
        })?;
        tracing::warn!(id = %item.id, attempts = item.attempts, error = ?item.last_error, "Queue item failed to sync");
        Ok(item)
    }

    /// Driver asked to try a failed item again from scratch
    pub fn retry(&self, id: &str) -> QueueResult<QueueItem> {
        self.update(id, |item| {
            if item.state != SyncState::FailedToSync {
                return Err(QueueError::NotFailed(item.id.clone()));
            }
            item.state = SyncState::Queued;
            item.attempts = 0;
            Ok(())
        })
    }

    /// Driver gave up on a failed item
    ///
    /// Only failed items can be discarded; a queued one may still be in
    /// flight.
    pub fn discard(&self, id: &str) -> QueueResult<QueueItem> {
        match self.get(id)? {
            None => return Err(QueueError::NotFound(id.to_string())),
            Some(item) if item.state != SyncState::FailedToSync => {
                return Err(QueueError::NotFailed(id.to_string()));
            }
            Some(_) => {}
        }
        let item = self
            .take(id)?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        tracing::info!(id = %item.id, route_id = %item.route_id, "Queue item discarded");
        Ok(item)
    }

    /// The hub holds the change; forget the item
    pub fn acknowledge(&self, id: &str) -> QueueResult<bool> {
        Ok(self.take(id)?.is_some())
    }

    /// The hub refused the item for good; move it to the rejected list
    pub fn reject(&self, id: &str, error: AppError) -> QueueResult<RejectedItem> {
        let write_txn = self.db.begin_write()?;
        let rejected = {
            let position = write_txn
                .open_table(QUEUE_INDEX_TABLE)?
                .remove(id)?
                .map(|g| g.value())
                .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
            let mut table = write_txn.open_table(QUEUE_TABLE)?;
            let removed = table.remove(position)?;
            let item: QueueItem = match removed {
                Some(value) => serde_json::from_slice(value.value())?,
                None => return Err(QueueError::NotFound(id.to_string())),
            };
            let rejected = RejectedItem {
                item,
                error,
                rejected_at: shared::util::now_millis(),
            };
            let value = serde_json::to_vec(&rejected)?;
            write_txn
                .open_table(REJECTED_TABLE)?
                .insert(id, value.as_slice())?;
            rejected
        };
        write_txn.commit()?;
        tracing::warn!(id = %id, code = ?rejected.error.code, "Queue item rejected by hub");
        Ok(rejected)
    }

    /// Rejections the driver has not dismissed, oldest first
    pub fn rejected(&self) -> QueueResult<Vec<RejectedItem>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(REJECTED_TABLE)?;
        let mut items: Vec<RejectedItem> = Vec::new();
        for result in table.iter()? {
            let (_, value) = result?;
            items.push(serde_json::from_slice(value.value())?);
        }
        items.sort_by_key(|r| (r.rejected_at, r.item.position));
        Ok(items)
    }

    /// Driver has seen the rejection
    pub fn dismiss_rejected(&self, id: &str) -> QueueResult<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = write_txn.open_table(REJECTED_TABLE)?.remove(id)?.is_some();
        write_txn.commit()?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::route::StopStatus;

    fn arrival(order_id: &str) -> DriverAction {
        DriverAction::StopStatus {
            order_id: order_id.to_string(),
            status: StopStatus::Arrived,
            occurred_at: 1_000,
            evidence_ref: None,
            failure_reason: None,
        }
    }

    #[test]
    fn test_items_keep_creation_order() {
        let queue = OfflineQueue::open_in_memory().unwrap();
        let a = queue.enqueue("r-1", arrival("o-1"), Some(3)).unwrap();
        let b = queue.enqueue("r-1", arrival("o-2"), Some(3)).unwrap();
        assert!(a.position < b.position);
        assert_ne!(a.id, b.id);

        assert_eq!(queue.head().unwrap().unwrap().id, a.id);
        let ids: Vec<_> = queue.items().unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, [a.id.clone(), b.id.clone()]);

        assert!(queue.acknowledge(&a.id).unwrap());
        assert!(!queue.acknowledge(&a.id).unwrap());
        assert_eq!(queue.head().unwrap().unwrap().id, b.id);
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.redb");
        let id = {
            let queue = OfflineQueue::open(&path).unwrap();
            queue.enqueue("r-1", arrival("o-1"), None).unwrap().id
        };

        let queue = OfflineQueue::open(&path).unwrap();
        let head = queue.head().unwrap().unwrap();
        assert_eq!(head.id, id);
        // Positions keep growing after a restart
        let next = queue.enqueue("r-1", arrival("o-2"), None).unwrap();
        assert!(next.position > head.position);
    }

    #[test]
    fn test_failed_item_retry_and_discard() {
        let queue = OfflineQueue::open_in_memory().unwrap();
        let item = queue.enqueue("r-1", arrival("o-1"), None).unwrap();

        // Still queued: neither retry nor discard apply
        assert!(matches!(queue.retry(&item.id), Err(QueueError::NotFailed(_))));
        assert!(matches!(queue.discard(&item.id), Err(QueueError::NotFailed(_))));

        queue.record_attempt(&item.id, "timeout").unwrap();
        let attempted = queue.record_attempt(&item.id, "timeout").unwrap();
        assert_eq!(attempted.attempts, 2);

        assert!(attempted.sync_error().is_none());
        let failed = queue.mark_failed(&item.id).unwrap();
        assert!(failed.is_blocked());
        let err = failed.sync_error().unwrap();
        assert_eq!(err.code, ErrorCode::OfflineReplayExhausted);
        assert_eq!(err.message, "timeout");
        assert_eq!(queue.failed().unwrap().len(), 1);

        let retried = queue.retry(&item.id).unwrap();
        assert_eq!(retried.state, SyncState::Queued);
        assert_eq!(retried.attempts, 0);

        queue.mark_failed(&item.id).unwrap();
        let discarded = queue.discard(&item.id).unwrap();
        assert_eq!(discarded.id, item.id);
        assert!(queue.is_empty().unwrap());
        assert!(matches!(queue.discard(&item.id), Err(QueueError::NotFound(_))));
    }

    #[test]
    fn test_rejection_moves_to_rejected_list() {
        let queue = OfflineQueue::open_in_memory().unwrap();
        let item = queue.enqueue("r-1", arrival("o-1"), None).unwrap();

        let rejected = queue
            .reject(&item.id, AppError::illegal_transition("stop o-1: completed -> arrived"))
            .unwrap();
        assert_eq!(rejected.item.id, item.id);
        assert!(queue.is_empty().unwrap());
        assert_eq!(queue.rejected().unwrap().len(), 1);

        assert!(queue.dismiss_rejected(&item.id).unwrap());
        assert!(queue.rejected().unwrap().is_empty());
    }

    #[test]
    fn test_envelope_carries_key_and_observed_sequence() {
        let queue = OfflineQueue::open_in_memory().unwrap();
        let item = queue.enqueue("r-1", arrival("o-1"), Some(7)).unwrap();
        let envelope = item.to_envelope().unwrap();
        assert_eq!(envelope.idempotency_key.as_deref(), Some(item.id.as_str()));
        assert_eq!(envelope.route_id, "r-1");
        let submit: SubmitPayload = envelope.parse().unwrap();
        assert_eq!(submit.observed_sequence, Some(7));
    }
}
