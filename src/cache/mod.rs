//! Blob cache for the Bazel HTTP remote-cache protocol.
//!
//! [`CacheBackend`] stages blobs on local disk only while they move between a
//! client and the durable [`RemoteStore`](crate::storage::RemoteStore);
//! concurrent operations on one key are coalesced by [`inflight::InFlight`].

pub mod backend;
pub mod inflight;
pub mod key;

pub use backend::{BackendError, BackendOptions, CacheBackend};
pub use key::{CacheKey, CacheKind, Digest};
