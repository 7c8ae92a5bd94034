//! Remote Sync API protocol: wire bodies and the authoritative version rules

mod authority;
mod wire;

pub use authority::Authority;
pub use wire::{
    BulkSyncRequest, BulkSyncResponse, ChangesResponse, ChannelMessage, ConflictBody, ItemResult,
    PushItem, RemoteItem, WriteAccepted, WriteOutcome,
};
