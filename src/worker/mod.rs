//! Network interception layer.
//!
//! A worker task sits between the application and the network. It decides
//! per request whether to answer from the cache set, go to the network, or
//! synthesize a fallback, and tells the foreground about mutations that could
//! not reach the backend.

mod cache;
mod classify;
mod http;
mod message;
mod network;
mod service;

pub use cache::{CacheKind, CacheSet, CachedResponse, HttpCache};
pub use classify::{Policy, RouteClass};
pub use http::{Method, Request, RequestMode, Response, ResponseKind};
pub use message::{MutationRequest, OfflineRequest, WorkerMessage};
pub use network::{HttpNetwork, Network, NetworkError};
pub use service::{ServiceWorker, WorkerHandle, SYNC_TAG};
