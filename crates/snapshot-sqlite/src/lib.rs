mod insert;
mod open;
mod query;
mod schema;

pub use open::Db;

use fleetaudit_core::{Snapshot, SnapshotStore, StoreError};

impl SnapshotStore for Db {
    fn save(&mut self, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.insert_snapshot(snapshot)?;
        Ok(())
    }

    fn latest(&self) -> Result<Snapshot, StoreError> {
        self.latest_snapshot()?.ok_or(StoreError::NoData)
    }
}
