//! Offline-first caching and sync core.
//!
//! Keeps the application usable without a network: responses are cached by
//! an interception worker, entity snapshots and buffered mutations live in
//! local stores, and the reconciler replays buffered mutations once the
//! backend is reachable again.

pub mod backend;
pub mod buffer;
pub mod config;
pub mod connectivity;
pub mod entity;
pub mod location;
pub mod logging;
pub mod offline;
pub mod profile;
pub mod reconciler;
pub mod scans;
pub mod store;
pub mod worker;

#[cfg(test)]
mod testing;
