//! Single-writer access to the issue store document.
//!
//! Every concurrently running issue pipeline holds a cloned [`StoreHandle`];
//! all mutations funnel through one writer task, which applies them in
//! arrival order and persists after each via write-to-temp-then-rename.
//! Two issues completing phases at the same instant both survive in the
//! final document.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::errors::StoreError;
use crate::phase::PhaseStatus;
use crate::resume::PhaseMarker;
use crate::store::record::{IssueRecord, StoreDocument};

/// The store document plus its on-disk location. Owned by the writer task;
/// direct use is limited to startup and tests.
#[derive(Debug)]
pub struct IssueStore {
    path: PathBuf,
    doc: StoreDocument,
}

impl IssueStore {
    /// Load the document, or start empty when the file does not exist yet.
    /// An unreadable or unparsable document is an error so callers can take
    /// the rebuild path instead of silently dropping state.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Ok(Self {
                path: path.to_path_buf(),
                doc: StoreDocument::empty(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|source| StoreError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;

        let doc: StoreDocument =
            serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            doc,
        })
    }

    /// Rebuild a store whose document was corrupt, reconstructing phase
    /// state for the given issues purely from their external markers.
    pub fn rebuild(
        path: &Path,
        issues: impl IntoIterator<Item = (i64, String, Vec<PhaseMarker>)>,
    ) -> Self {
        let mut doc = StoreDocument::empty();
        for (id, title, markers) in issues {
            let mut record = IssueRecord::new(id, title);
            for marker in markers {
                let phase = record.phase_mut(marker.phase);
                match marker.status {
                    PhaseStatus::Completed => phase.complete_from_marker(marker.timestamp),
                    PhaseStatus::Failed => {
                        phase.started_at = Some(marker.timestamp);
                        phase.completed_at = Some(marker.timestamp);
                        phase.status = PhaseStatus::Failed;
                        phase.error = marker.error.clone();
                    }
                    // Pending/in-progress/skipped markers carry no durable
                    // progress worth resurrecting.
                    _ => {}
                }
            }
            record.refresh();
            doc.issues.insert(id, record);
        }
        Self {
            path: path.to_path_buf(),
            doc,
        }
    }

    /// Persist atomically: serialize to a sibling temp file, then rename.
    pub fn save(&mut self) -> Result<(), StoreError> {
        self.doc.last_updated = Utc::now();
        let content = serde_json::to_string_pretty(&self.doc)
            .context("Failed to serialize issue store")
            .map_err(StoreError::Other)?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(|source| StoreError::WriteFailed {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| StoreError::WriteFailed {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    pub fn document(&self) -> &StoreDocument {
        &self.doc
    }
}

type UpdateFn = Box<dyn FnOnce(&mut IssueRecord) + Send>;

enum StoreCommand {
    Upsert {
        id: i64,
        title: String,
        reply: oneshot::Sender<Result<IssueRecord, StoreError>>,
    },
    Update {
        id: i64,
        apply: UpdateFn,
        reply: oneshot::Sender<Result<IssueRecord, StoreError>>,
    },
    Get {
        id: i64,
        reply: oneshot::Sender<Option<IssueRecord>>,
    },
    Snapshot {
        reply: oneshot::Sender<StoreDocument>,
    },
}

/// Cloneable async handle to the store's writer task. All access runs a
/// closure against the owned record, mirroring the one-guarded-store
/// discipline, but with writes strictly serialized through a channel.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    /// Spawn the writer task and return its handle.
    pub fn spawn(store: IssueStore) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(writer_loop(store, rx));
        Self { tx }
    }

    /// Create the record if missing; returns the current record either way.
    pub async fn upsert(&self, id: i64, title: &str) -> Result<IssueRecord, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Upsert {
                id,
                title: title.to_string(),
                reply,
            })
            .await
            .map_err(|_| StoreError::WriterGone)?;
        rx.await.map_err(|_| StoreError::WriterGone)?
    }

    /// Apply a mutation to one issue record. The derived status is
    /// recomputed and the document persisted before this returns.
    pub async fn update<F>(&self, id: i64, apply: F) -> Result<IssueRecord, StoreError>
    where
        F: FnOnce(&mut IssueRecord) + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Update {
                id,
                apply: Box::new(apply),
                reply,
            })
            .await
            .map_err(|_| StoreError::WriterGone)?;
        rx.await.map_err(|_| StoreError::WriterGone)?
    }

    pub async fn get(&self, id: i64) -> Result<Option<IssueRecord>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Get { id, reply })
            .await
            .map_err(|_| StoreError::WriterGone)?;
        rx.await.map_err(|_| StoreError::WriterGone)
    }

    pub async fn snapshot(&self) -> Result<StoreDocument, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Snapshot { reply })
            .await
            .map_err(|_| StoreError::WriterGone)?;
        rx.await.map_err(|_| StoreError::WriterGone)
    }
}

async fn writer_loop(mut store: IssueStore, mut rx: mpsc::Receiver<StoreCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            StoreCommand::Upsert { id, title, reply } => {
                let result = {
                    let record = store
                        .doc
                        .issues
                        .entry(id)
                        .or_insert_with(|| IssueRecord::new(id, title));
                    let record = record.clone();
                    store.save().map(|_| record)
                };
                let _ = reply.send(result);
            }
            StoreCommand::Update { id, apply, reply } => {
                let result = match store.doc.issues.get_mut(&id) {
                    Some(record) => {
                        apply(record);
                        record.refresh();
                        let record = record.clone();
                        store.save().map(|_| record)
                    }
                    None => Err(StoreError::IssueNotFound { id }),
                };
                if let Err(ref e) = result {
                    warn!(issue = id, error = %e, "store update failed");
                }
                let _ = reply.send(result);
            }
            StoreCommand::Get { id, reply } => {
                let _ = reply.send(store.doc.issues.get(&id).cloned());
            }
            StoreCommand::Snapshot { reply } => {
                let _ = reply.send(store.doc.clone());
            }
        }
    }
    debug!("store writer task exiting");
}
