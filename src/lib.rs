//! # Tears Query - async state synchronization
//!
//! Tears Query caches the results of asynchronous reads ("queries") and
//! coordinates asynchronous writes ("mutations"). Given a key that
//! identifies a piece of remote data, it fetches, deduplicates, retries,
//! invalidates and garbage-collects that data, and notifies observers of
//! every state change in batches.
//!
//! ## Architecture
//!
//! 1. **Client**: [`QueryClient`] owns both caches, the default options and
//!    the environment managers
//! 2. **Caches**: [`QueryCache`](query::QueryCache) and
//!    [`MutationCache`](mutation::MutationCache) hold the entities
//! 3. **Entities**: [`Query`](query::Query) and
//!    [`Mutation`](mutation::Mutation) are state machines driven by a
//!    retryer
//! 4. **Observers**: [`QueryObserver`](query::observer::QueryObserver) and
//!    friends decide when to fetch and derive the results subscribers see
//! 5. **Environment**: focus and online managers, the notify scheduler and
//!    the garbage collector
//!
//! ## Example
//!
//! ```rust
//! use tears_query::QueryClient;
//! use tears_query::query::QueryOptions;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), tears_query::QueryError> {
//! let client = QueryClient::new();
//! let options = QueryOptions::new("greeting", |_ctx| async {
//!     Ok("hello".to_string())
//! });
//!
//! let data = client.fetch_query(options).await?;
//! assert_eq!(*data, "hello");
//! assert_eq!(
//!     client.get_query_data::<String>("greeting").as_deref(),
//!     Some(&"hello".to_string()),
//! );
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod filters;
pub mod gc;
pub mod hydration;
pub mod key;
pub mod mutation;
pub mod notify;
pub mod prelude;
pub mod query;
mod retryer;
pub mod structural_sharing;
pub mod subscription;
pub mod time;

pub use client::{DefaultOptions, QueryClient, QueryClientConfig, RefetchOptions, RefetchType};
pub use config::{MutationConfig, NetworkMode, QueryConfig, Resolvable, Retry, RetryDelay, StaleTime};
pub use error::{CancelOptions, CancelledError, HydrationError, QueryError, is_cancelled_error};
pub use filters::{MutationFilters, QueryFilters, QueryTypeFilter};
pub use hydration::{DehydrateOptions, DehydratedState, dehydrate, hydrate};
pub use key::QueryKey;
