//! Prelude module for convenient imports.
//!
//! ```
//! use tears_query::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`QueryClient`] - The client owning both caches
//! - [`QueryOptions`], [`QueryObserver`] - Reading data
//! - [`MutationOptions`], [`MutationObserver`] - Writing data
//! - [`QueryFilters`], [`MutationFilters`] - Selecting entities
//! - [`QueryError`] - The error type of every operation

pub use crate::client::{QueryClient, RefetchType};
pub use crate::config::{MutationConfig, QueryConfig, StaleTime};
pub use crate::error::{CancelOptions, QueryError};
pub use crate::filters::{MutationFilters, QueryFilters};
pub use crate::key::QueryKey;
pub use crate::mutation::{MutateOptions, MutationObserver, MutationOptions};
pub use crate::query::infinite::{InfiniteQueryObserver, InfiniteQueryOptions};
pub use crate::query::observer::QueryObserver;
pub use crate::query::{QueryData, QueryOptions};
