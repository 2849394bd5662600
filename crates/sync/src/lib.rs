//! Remote coordination server client.
//!
//! [`SyncEndpoint`] is the wire contract; [`RemoteSync`] layers the
//! idempotent Sync-In / Sync-Out rules over the local queue store.

pub mod client;
pub mod endpoint;
pub mod remote;

pub use endpoint::{HttpSyncEndpoint, RemoteTask, StatusUpdate, SyncEndpoint};
pub use remote::RemoteSync;
