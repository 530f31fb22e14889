//! Session persistence: a small snapshot of the track list that survives
//! navigation, and a durable byte store for the files behind it.

mod durable;
mod ephemeral;
mod snapshot;

pub use durable::{DurableRecord, DurableStore, FileDurableStore, MemoryDurableStore};
pub use ephemeral::{EphemeralStore, MemoryEphemeralStore};
pub use snapshot::{
    SNAPSHOT_KEY, SnapshotDebouncer, TrackSnapshot, decode_snapshot, encode_snapshot,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] rmp_serde::encode::Error),

    #[error("Deserialization error: {0}")]
    Deserialize(#[from] rmp_serde::decode::Error),

    #[error("Snapshot error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("stored record for '{id}' is corrupt: {reason}")]
    Corrupt { id: String, reason: String },
}
