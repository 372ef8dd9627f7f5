use crate::Snapshot;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// `latest()` was asked of a store holding no snapshots.
    #[error("no snapshot has been saved yet")]
    NoData,

    #[error("snapshot store error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Persists whole snapshots and hands back the most recently saved one.
pub trait SnapshotStore {
    fn save(&mut self, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// Last-write-wins by save order, never a merge of several runs.
    fn latest(&self) -> Result<Snapshot, StoreError>;
}
