#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! # About Zen Query
//!
//! Zen Query is an asynchronous data synchronization engine built on [tokio](https://tokio.rs).
//!
//! Heavily inspired by [Tanstack Query](https://tanstack.com/query/latest/).
//!
//! Given a fetcher and a stable key, it keeps remote data cached and in sync,
//! and exposes it through observable state.
//!
//! A Query provides:
//! - caching
//! - de-duplication
//! - invalidation
//! - retries with exponential backoff and jitter
//! - background refetching on reconnect, focus and intervals
//! - memory management with cache lifetimes
//! - cancellation
//! - pagination, streams and derived queries
//! - optimistic updates with rollback
//! - an offline mutation queue, replayed on reconnect
//! - persistence through a pluggable [`QueryPersister`]
//!
//! ## The main entry points are:
//! - [`QueryCache`] - The registry every query lives in. Create one per application and pass it around.
//! - [`QueryCache::query`] - A keyed, cached piece of remote data.
//! - [`QueryCache::infinite_query`] / [`QueryCache::stream_query`] - Paginated and stream backed queries.
//! - [`QueryCache::mutation`] - Imperative changes with lifecycle hooks and offline queueing.
//! - [`QueryCache::scope`] - Groups queries that are torn down together.
//!
//! # A Simple Example
//!
//! ```
//! use std::time::Duration;
//! use zen_query::*;
//!
//! // The result of the query fetcher.
//! #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
//! struct TrackData {
//!     name: String,
//! }
//!
//! // Query fetcher.
//! async fn get_track(id: u32) -> Result<TrackData, BoxError> {
//!     Ok(TrackData {
//!         name: format!("track {id}"),
//!     })
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), QueryError> {
//!     let cache = QueryCache::new();
//!
//!     let track = cache.query(
//!         &("track", 7),
//!         |_cancel| get_track(7),
//!         QueryOptions::default().set_stale_time(Duration::from_secs(30)),
//!     )?;
//!
//!     // Fetches once, then serves the cached value while it is fresh.
//!     let data = track.fetch(false).await?;
//!     assert_eq!(data.name, "track 7");
//!     assert!(!track.is_stale());
//!
//!     // Observe changes.
//!     track.subscribe(|state| println!("track is {:?}", state.status));
//!     track.set_data(TrackData { name: "renamed".into() })?;
//!     Ok(())
//! }
//! ```
//!
//! # Offline mutations
//!
//! Mutations with a key are queued while offline and replayed once
//! [`QueryCache::set_online`] reports the network is back.
//!
//! ```
//! use zen_query::*;
//!
//! #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
//! struct NewPost {
//!     title: String,
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), QueryError> {
//!     let cache = QueryCache::new();
//!     cache.set_online(false);
//!
//!     let create_post = cache.mutation(
//!         |post: NewPost| async move { Ok::<_, BoxError>(post.title.len()) },
//!         MutationOptions::new().mutation_key("create_post", MutationAction::Create),
//!     );
//!
//!     let result = create_post.mutate(NewPost { title: "hello".into() }).await?;
//!     assert_eq!(result, None);
//!     assert_eq!(cache.mutation_queue().len(), 1);
//!
//!     let report = cache.mutation_queue().replay().await;
//!     assert_eq!(report.succeeded, 1);
//!     Ok(())
//! }
//! ```

/// Subscriptions to cache-wide query events.
pub mod cache_observer;
mod cache_store;
mod cancel_token;
mod clock;
mod derived_query;
mod error;
mod infinite_query;
mod lifecycle;
mod mutation;
mod mutation_queue;
mod observable;
mod query;
mod query_cache;
mod query_key;
mod query_options;
/// Durable storage of query data and queued mutations.
pub mod query_persister;
mod query_scope;
mod query_state;
mod retry;
mod stream_query;
mod util;

pub use cache_observer::{CacheEvent, CacheObserver, CacheObserverKey};
pub use cache_store::CacheEntry;
pub use cancel_token::*;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use derived_query::*;
pub use error::*;
pub use infinite_query::*;
pub use lifecycle::AppLifecycle;
pub use mutation::*;
pub use mutation_queue::{
    ExhaustedPolicy, MutationAction, MutationJob, MutationQueue, MutationQueueConfig,
    ReplayReport,
};
pub use observable::*;
pub use query::{Query, QueryValue};
pub use query_cache::{CacheStats, QueryCache, QueryCacheBuilder, QueryCacheConfig};
pub use query_key::{normalize, QueryKey};
pub use query_options::*;
pub use query_persister::{MemoryPersister, PersistedQuery, QueryPersister};
pub use query_scope::*;
pub use query_state::*;
pub use retry::RetryPolicy;
pub use stream_query::*;
