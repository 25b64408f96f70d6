//! Selecting queries and mutations for bulk client operations.

use std::fmt;
use std::sync::Arc;

use crate::key::QueryKey;
use crate::mutation::{AnyMutation, MutationStatus};
use crate::query::{AnyQuery, FetchStatus, QueryStatus};

/// Which queries to match by observer activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryTypeFilter {
    #[default]
    All,
    /// At least one enabled observer.
    Active,
    Inactive,
}

type QueryPredicate = Arc<dyn Fn(&dyn AnyQuery) -> bool + Send + Sync>;
type MutationPredicate = Arc<dyn Fn(&dyn AnyMutation) -> bool + Send + Sync>;

/// Matches queries. An empty filter matches everything.
#[derive(Clone, Default)]
pub struct QueryFilters {
    /// Prefix to match, or the whole key when `exact` is set.
    pub query_key: Option<QueryKey>,
    pub exact: bool,
    pub kind: QueryTypeFilter,
    pub stale: Option<bool>,
    pub status: Option<QueryStatus>,
    pub fetch_status: Option<FetchStatus>,
    pub predicate: Option<QueryPredicate>,
}

impl fmt::Debug for QueryFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFilters")
            .field("query_key", &self.query_key)
            .field("exact", &self.exact)
            .field("kind", &self.kind)
            .field("stale", &self.stale)
            .field("status", &self.status)
            .field("fetch_status", &self.fetch_status)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl QueryFilters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queries whose key starts with `query_key`.
    #[must_use]
    pub fn key(query_key: impl Into<QueryKey>) -> Self {
        Self {
            query_key: Some(query_key.into()),
            ..Self::default()
        }
    }

    /// The query with exactly this key.
    #[must_use]
    pub fn exact(query_key: impl Into<QueryKey>) -> Self {
        Self {
            query_key: Some(query_key.into()),
            exact: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn kind(mut self, kind: QueryTypeFilter) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub const fn stale(mut self, stale: bool) -> Self {
        self.stale = Some(stale);
        self
    }

    #[must_use]
    pub const fn status(mut self, status: QueryStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub const fn fetch_status(mut self, fetch_status: FetchStatus) -> Self {
        self.fetch_status = Some(fetch_status);
        self
    }

    #[must_use]
    pub fn predicate(mut self, f: impl Fn(&dyn AnyQuery) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn matches(&self, query: &dyn AnyQuery) -> bool {
        if let Some(key) = &self.query_key {
            if self.exact {
                if query.query_hash() != key.hash() {
                    return false;
                }
            } else if !query.query_key().starts_with(key) {
                return false;
            }
        }

        match self.kind {
            QueryTypeFilter::All => {}
            QueryTypeFilter::Active if !query.is_active() => return false,
            QueryTypeFilter::Inactive if query.is_active() => return false,
            QueryTypeFilter::Active | QueryTypeFilter::Inactive => {}
        }

        if self.stale.is_some_and(|stale| stale != query.is_stale()) {
            return false;
        }

        if self.status.is_some() || self.fetch_status.is_some() {
            let snapshot = query.snapshot();
            if self.status.is_some_and(|s| s != snapshot.status)
                || self.fetch_status.is_some_and(|s| s != snapshot.fetch_status)
            {
                return false;
            }
        }

        self.predicate.as_ref().is_none_or(|predicate| predicate(query))
    }
}

/// Matches mutations. An empty filter matches everything.
#[derive(Clone, Default)]
pub struct MutationFilters {
    pub mutation_key: Option<QueryKey>,
    pub exact: bool,
    pub status: Option<MutationStatus>,
    pub predicate: Option<MutationPredicate>,
}

impl fmt::Debug for MutationFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationFilters")
            .field("mutation_key", &self.mutation_key)
            .field("exact", &self.exact)
            .field("status", &self.status)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl MutationFilters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn key(mutation_key: impl Into<QueryKey>) -> Self {
        Self {
            mutation_key: Some(mutation_key.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn exact(mut self, exact: bool) -> Self {
        self.exact = exact;
        self
    }

    #[must_use]
    pub const fn status(mut self, status: MutationStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn predicate(
        mut self,
        f: impl Fn(&dyn AnyMutation) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn matches(&self, mutation: &dyn AnyMutation) -> bool {
        if let Some(key) = &self.mutation_key {
            let Some(mutation_key) = mutation.mutation_key() else {
                return false;
            };
            let matched = if self.exact {
                mutation_key.hash() == key.hash()
            } else {
                mutation_key.starts_with(key)
            };
            if !matched {
                return false;
            }
        }

        if self.status.is_some_and(|status| status != mutation.status()) {
            return false;
        }

        self.predicate
            .as_ref()
            .is_none_or(|predicate| predicate(mutation))
    }
}
