//! Actor-based concurrency for the ledger
//!
//! Every write goes through one tokio task (single writer). Recording an
//! event, deriving its entries and committing them happens inside one
//! message, so two transfers touching the same tank can never interleave
//! their derive-and-append steps.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │          Ledger facade / admin CLI (many callers)     │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │               LedgerHandle (Clone)                    │
//! │         Sends messages to actor mailbox              │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              LedgerActor (Single Task)                │
//! │   validate → UnitOfWork { record, derive, append }    │
//! │                       │                               │
//! │                       ▼                               │
//! │           UnitOfWork::commit()                        │
//! │          (atomic write to RocksDB)                    │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! Reads do not pass through the actor; they go to [`Storage`] directly
//! and see committed state only.

use crate::catalog::Catalog;
use crate::derivation::{validate_entry, validate_event, Deriver};
use crate::integrity::{self, RebuildOptions, RebuildSummary};
use crate::metrics::Metrics;
use crate::types::{EntryId, EventId, LedgerEntry, SourceEventRecord};
use crate::{Error, Result, Storage};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Message sent to the ledger actor
pub enum LedgerMessage {
    /// Record an event and derive its entries
    Record {
        event: SourceEventRecord,
        response: oneshot::Sender<Result<Vec<LedgerEntry>>>,
    },

    /// Delete an event together with its entries
    DeleteEvent {
        event_id: EventId,
        response: oneshot::Sender<Result<usize>>,
    },

    /// Append a hand-built entry
    AppendEntry {
        entry: LedgerEntry,
        response: oneshot::Sender<Result<EntryId>>,
    },

    /// Replay the event log
    Rebuild {
        options: RebuildOptions,
        response: oneshot::Sender<Result<RebuildSummary>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that processes ledger writes
pub struct LedgerActor {
    /// Storage backend
    storage: Arc<Storage>,

    /// Tank and batch lookups
    catalog: Arc<dyn Catalog>,

    /// Entry derivation rules
    deriver: Deriver,

    /// Metrics collector
    metrics: Metrics,

    /// Mailbox for incoming messages
    mailbox: mpsc::Receiver<LedgerMessage>,
}

impl LedgerActor {
    /// Create new actor
    pub fn new(
        storage: Arc<Storage>,
        catalog: Arc<dyn Catalog>,
        deriver: Deriver,
        metrics: Metrics,
        mailbox: mpsc::Receiver<LedgerMessage>,
    ) -> Self {
        Self {
            storage,
            catalog,
            deriver,
            metrics,
            mailbox,
        }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                LedgerMessage::Shutdown => break,
                msg => self.handle_message(msg),
            }
        }
        tracing::info!("Ledger actor stopped");
    }

    /// Handle a single message
    fn handle_message(&mut self, msg: LedgerMessage) {
        match msg {
            LedgerMessage::Record { event, response } => {
                let result = self.record(event);
                log_failure("record", &result);
                let _ = response.send(result);
            }

            LedgerMessage::DeleteEvent { event_id, response } => {
                let result = self.delete_event(event_id);
                log_failure("delete_event", &result);
                let _ = response.send(result);
            }

            LedgerMessage::AppendEntry { entry, response } => {
                let result = self.append_entry(entry);
                log_failure("append_entry", &result);
                let _ = response.send(result);
            }

            LedgerMessage::Rebuild { options, response } => {
                let result = self.rebuild(&options);
                log_failure("rebuild", &result);
                let _ = response.send(result);
            }

            LedgerMessage::Shutdown => {
                // Handled in main loop
            }
        }
    }

    fn record(&self, event: SourceEventRecord) -> Result<Vec<LedgerEntry>> {
        let started = Instant::now();
        validate_event(&event, self.catalog.as_ref())?;

        let mut uow = self.storage.begin();
        uow.record_event(event.clone())?;
        for entry in self.deriver.derive(&uow, &event)? {
            uow.append_entry(entry)?;
        }
        let created = uow.staged_entries().to_vec();
        uow.commit()?;

        self.metrics
            .record_derived(event.kind(), created.len(), started.elapsed().as_secs_f64());
        tracing::info!(
            event_id = %event.id(),
            kind = event.kind(),
            tenant = %event.tenant(),
            entries = created.len(),
            "Event recorded"
        );
        Ok(created)
    }

    fn delete_event(&self, event_id: EventId) -> Result<usize> {
        let mut uow = self.storage.begin();
        let deleted = uow.delete_event(event_id)?;
        uow.commit()?;

        self.metrics.record_event_deleted();
        tracing::info!(event_id = %event_id, entries = deleted, "Event deleted");
        Ok(deleted)
    }

    fn append_entry(&self, entry: LedgerEntry) -> Result<EntryId> {
        let mut uow = self.storage.begin();
        validate_entry(&entry, self.catalog.as_ref(), &uow)?;
        let id = uow.append_entry(entry)?;
        uow.commit()?;

        self.metrics.record_entries(1);
        Ok(id)
    }

    fn rebuild(&self, options: &RebuildOptions) -> Result<RebuildSummary> {
        let summary = integrity::rebuild(&self.storage, &self.deriver, options)?;
        if !summary.dry_run {
            self.metrics.record_rebuild(summary.entries_created);
        }
        Ok(summary)
    }
}

fn log_failure<T>(operation: &str, result: &Result<T>) {
    match result {
        Ok(_) => {}
        Err(e @ (Error::Validation(_) | Error::TankNotFound(_) | Error::EventNotFound(_))) => {
            tracing::warn!(operation, error = %e, "Rejected ledger write");
        }
        Err(Error::Cancelled(_)) => {}
        Err(e) => {
            tracing::error!(operation, error = %e, "Ledger write failed");
        }
    }
}

/// Handle for sending messages to the actor
#[derive(Clone, Debug)]
pub struct LedgerHandle {
    sender: mpsc::Sender<LedgerMessage>,
}

impl LedgerHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<LedgerMessage>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> LedgerMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Record an event, returning the entries derived from it
    pub async fn record(&self, event: SourceEventRecord) -> Result<Vec<LedgerEntry>> {
        self.request(|response| LedgerMessage::Record { event, response })
            .await
    }

    /// Delete an event and its entries, returning how many entries went
    pub async fn delete_event(&self, event_id: EventId) -> Result<usize> {
        self.request(|response| LedgerMessage::DeleteEvent { event_id, response })
            .await
    }

    /// Append one entry
    pub async fn append_entry(&self, entry: LedgerEntry) -> Result<EntryId> {
        self.request(|response| LedgerMessage::AppendEntry { entry, response })
            .await
    }

    /// Replay the event log
    pub async fn rebuild(&self, options: RebuildOptions) -> Result<RebuildSummary> {
        self.request(|response| LedgerMessage::Rebuild { options, response })
            .await
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(LedgerMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the ledger actor
pub fn spawn_ledger_actor(
    storage: Arc<Storage>,
    catalog: Arc<dyn Catalog>,
    deriver: Deriver,
    metrics: Metrics,
    mailbox_capacity: usize,
) -> (LedgerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(mailbox_capacity); // Bounded channel for backpressure
    let actor = LedgerActor::new(storage, catalog, deriver, metrics, rx);

    let task = tokio::spawn(async move {
        actor.run().await;
    });

    (LedgerHandle::new(tx), task)
}
