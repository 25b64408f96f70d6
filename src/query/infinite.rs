//! Paginated queries.
//!
//! An infinite query stores its pages and their parameters as one
//! [`InfiniteData`] value. Fetching the next or previous page appends or
//! prepends a single page; any other fetch refetches every cached page in
//! order, starting from the first cached parameter.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::observer::{QueryObserver, QueryObserverOptions, QueryObserverResult};
use super::options::FetchArgs;
use super::{
    FetchDirection, FetchMeta, FetchOptions, QueryData, QueryFn, QueryFunctionContext,
    QueryOptions,
};
use crate::client::QueryClient;
use crate::config::QueryConfig;
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::subscription::Unsubscribe;

/// Pages of an infinite query with the parameter each was fetched with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfiniteData<P, Param> {
    pub pages: Vec<P>,
    pub page_params: Vec<Param>,
}

impl<P, Param> Default for InfiniteData<P, Param> {
    fn default() -> Self {
        Self {
            pages: Vec::new(),
            page_params: Vec::new(),
        }
    }
}

type PageFn<P, Param> =
    Arc<dyn Fn(QueryFunctionContext<Param>) -> BoxFuture<'static, Result<P, QueryError>> + Send + Sync>;

/// Computes a neighbouring page parameter from
/// `(page, all_pages, page_param, all_page_params)`, where `page` is the
/// last page for the next parameter and the first page for the previous
/// one. `None` means there is no such page.
pub type PageParamFn<P, Param> =
    Arc<dyn Fn(&P, &[P], &Param, &[Param]) -> Option<Param> + Send + Sync>;

struct Pager<P, Param> {
    page_fn: PageFn<P, Param>,
    initial_page_param: Param,
    get_next_page_param: PageParamFn<P, Param>,
    get_previous_page_param: Option<PageParamFn<P, Param>>,
    max_pages: Option<usize>,
}

impl<P: QueryData, Param: QueryData> Pager<P, Param> {
    fn next_param(&self, data: &InfiniteData<P, Param>) -> Option<Param> {
        let page = data.pages.last()?;
        let param = data.page_params.last()?;
        (self.get_next_page_param)(page, &data.pages, param, &data.page_params)
    }

    fn previous_param(&self, data: &InfiniteData<P, Param>) -> Option<Param> {
        let get_previous = self.get_previous_page_param.as_ref()?;
        let page = data.pages.first()?;
        let param = data.page_params.first()?;
        get_previous(page, &data.pages, param, &data.page_params)
    }

    async fn fetch_page(
        &self,
        mut data: InfiniteData<P, Param>,
        param: Option<Param>,
        direction: FetchDirection,
        context: &QueryFunctionContext,
    ) -> Result<InfiniteData<P, Param>, QueryError> {
        let Some(param) = param else {
            return Ok(data);
        };
        let page = (self.page_fn)(context.with_page(param.clone(), direction)).await?;
        match direction {
            FetchDirection::Forward => {
                data.pages.push(page);
                data.page_params.push(param);
                if let Some(max) = self.max_pages.filter(|max| *max > 0)
                    && data.pages.len() > max
                {
                    data.pages.remove(0);
                    data.page_params.remove(0);
                }
            }
            FetchDirection::Backward => {
                data.pages.insert(0, page);
                data.page_params.insert(0, param);
                if let Some(max) = self.max_pages.filter(|max| *max > 0)
                    && data.pages.len() > max
                {
                    data.pages.pop();
                    data.page_params.pop();
                }
            }
        }
        Ok(data)
    }

    async fn fetch(
        &self,
        args: FetchArgs<InfiniteData<P, Param>>,
    ) -> Result<InfiniteData<P, Param>, QueryError> {
        let previous = args.previous.filter(|data| !data.pages.is_empty());

        if let (Some(direction), Some(old)) = (args.fetch_more, &previous) {
            let param = match direction {
                FetchDirection::Forward => self.next_param(old),
                FetchDirection::Backward => self.previous_param(old),
            };
            return self
                .fetch_page(InfiniteData::clone(old), param, direction, &args.context)
                .await;
        }

        let remaining = previous.as_ref().map_or(1, |old| old.pages.len());
        let mut result = InfiniteData::default();
        for index in 0..remaining {
            let param = if index == 0 {
                previous
                    .as_ref()
                    .and_then(|old| old.page_params.first().cloned())
                    .unwrap_or_else(|| self.initial_page_param.clone())
            } else {
                match self.next_param(&result) {
                    Some(param) => param,
                    None => break,
                }
            };
            result = self
                .fetch_page(result, Some(param), FetchDirection::Forward, &args.context)
                .await?;
        }
        Ok(result)
    }
}

/// Options of an infinite query.
pub struct InfiniteQueryOptions<P: QueryData, Param: QueryData> {
    pub query: QueryOptions<InfiniteData<P, Param>>,
    pager: Arc<Pager<P, Param>>,
}

impl<P: QueryData, Param: QueryData> Clone for InfiniteQueryOptions<P, Param> {
    fn clone(&self) -> Self {
        Self {
            query: self.query.clone(),
            pager: self.pager.clone(),
        }
    }
}

impl<P: QueryData, Param: QueryData + fmt::Debug> fmt::Debug for InfiniteQueryOptions<P, Param> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfiniteQueryOptions")
            .field("query", &self.query)
            .field("initial_page_param", &self.pager.initial_page_param)
            .field("max_pages", &self.pager.max_pages)
            .finish_non_exhaustive()
    }
}

impl<P: QueryData, Param: QueryData> InfiniteQueryOptions<P, Param> {
    pub fn new<F, Fut>(
        query_key: impl Into<QueryKey>,
        initial_page_param: Param,
        page_fn: F,
        get_next_page_param: impl Fn(&P, &[P], &Param, &[Param]) -> Option<Param> + Send + Sync + 'static,
    ) -> Self
    where
        F: Fn(QueryFunctionContext<Param>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<P, QueryError>> + Send + 'static,
    {
        Self {
            query: QueryOptions::key(query_key),
            pager: Arc::new(Pager {
                page_fn: Arc::new(move |ctx| page_fn(ctx).boxed()),
                initial_page_param,
                get_next_page_param: Arc::new(get_next_page_param),
                get_previous_page_param: None,
                max_pages: None,
            }),
        }
    }

    fn map_pager(mut self, f: impl FnOnce(&mut Pager<P, Param>)) -> Self {
        let current = &self.pager;
        let mut pager = Pager {
            page_fn: current.page_fn.clone(),
            initial_page_param: current.initial_page_param.clone(),
            get_next_page_param: current.get_next_page_param.clone(),
            get_previous_page_param: current.get_previous_page_param.clone(),
            max_pages: current.max_pages,
        };
        f(&mut pager);
        self.pager = Arc::new(pager);
        self
    }

    #[must_use]
    pub fn get_previous_page_param(
        self,
        f: impl Fn(&P, &[P], &Param, &[Param]) -> Option<Param> + Send + Sync + 'static,
    ) -> Self {
        self.map_pager(|pager| pager.get_previous_page_param = Some(Arc::new(f)))
    }

    /// Keeps at most `max_pages` pages, dropping from the opposite end.
    #[must_use]
    pub fn max_pages(self, max_pages: usize) -> Self {
        self.map_pager(|pager| pager.max_pages = Some(max_pages))
    }

    #[must_use]
    pub fn config(mut self, f: impl FnOnce(QueryConfig) -> QueryConfig) -> Self {
        self.query = self.query.config(f);
        self
    }

    /// Whether a page after the last cached one exists.
    #[must_use]
    pub fn has_next_page(&self, data: Option<&InfiniteData<P, Param>>) -> bool {
        data.is_some_and(|data| self.pager.next_param(data).is_some())
    }

    #[must_use]
    pub fn has_previous_page(&self, data: Option<&InfiniteData<P, Param>>) -> bool {
        data.is_some_and(|data| self.pager.previous_param(data).is_some())
    }

    /// Plain query options whose query function drives the pager.
    #[must_use]
    pub fn to_query_options(&self) -> QueryOptions<InfiniteData<P, Param>> {
        let pager = self.pager.clone();
        self.query.clone().query_fn(QueryFn::raw(move |args| {
            let pager = pager.clone();
            async move { pager.fetch(args).await.map(Some) }.boxed()
        }))
    }
}

/// Result of an [`InfiniteQueryObserver`].
#[derive(Debug)]
pub struct InfiniteQueryObserverResult<P, Param> {
    pub result: QueryObserverResult<InfiniteData<P, Param>>,
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub is_fetching_next_page: bool,
    pub is_fetching_previous_page: bool,
    pub is_fetch_next_page_error: bool,
    pub is_fetch_previous_page_error: bool,
}

impl<P, Param> Clone for InfiniteQueryObserverResult<P, Param> {
    fn clone(&self) -> Self {
        Self {
            result: self.result.clone(),
            has_next_page: self.has_next_page,
            has_previous_page: self.has_previous_page,
            is_fetching_next_page: self.is_fetching_next_page,
            is_fetching_previous_page: self.is_fetching_previous_page,
            is_fetch_next_page_error: self.is_fetch_next_page_error,
            is_fetch_previous_page_error: self.is_fetch_previous_page_error,
        }
    }
}

impl<P, Param> InfiniteQueryObserverResult<P, Param> {
    /// Refetching everything, not just loading one more page.
    #[must_use]
    pub fn is_refetching(&self) -> bool {
        self.result.is_refetching() && !self.is_fetching_next_page && !self.is_fetching_previous_page
    }

    #[must_use]
    pub fn is_refetch_error(&self) -> bool {
        self.result.is_refetch_error()
            && !self.is_fetch_next_page_error
            && !self.is_fetch_previous_page_error
    }
}

fn infinite_result<P: QueryData, Param: QueryData>(
    options: &InfiniteQueryOptions<P, Param>,
    result: QueryObserverResult<InfiniteData<P, Param>>,
) -> InfiniteQueryObserverResult<P, Param> {
    let direction = result.fetch_direction;
    let forward = direction == Some(FetchDirection::Forward);
    let backward = direction == Some(FetchDirection::Backward);
    InfiniteQueryObserverResult {
        has_next_page: options.has_next_page(result.data.as_deref()),
        has_previous_page: options.has_previous_page(result.data.as_deref()),
        is_fetching_next_page: result.is_fetching() && forward,
        is_fetching_previous_page: result.is_fetching() && backward,
        is_fetch_next_page_error: result.is_error() && forward,
        is_fetch_previous_page_error: result.is_error() && backward,
        result,
    }
}

/// Observes an infinite query and loads more pages on request.
pub struct InfiniteQueryObserver<P: QueryData, Param: QueryData> {
    observer: QueryObserver<InfiniteData<P, Param>>,
    options: InfiniteQueryOptions<P, Param>,
}

impl<P: QueryData, Param: QueryData> InfiniteQueryObserver<P, Param> {
    pub fn new(client: &QueryClient, options: InfiniteQueryOptions<P, Param>) -> Self {
        Self {
            observer: QueryObserver::with_options(
                client,
                QueryObserverOptions::new(options.to_query_options()),
            ),
            options,
        }
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&InfiniteQueryObserverResult<P, Param>) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let options = self.options.clone();
        self.observer
            .subscribe(move |result| listener(&infinite_result(&options, result.clone())))
    }

    #[must_use]
    pub fn get_current_result(&self) -> InfiniteQueryObserverResult<P, Param> {
        infinite_result(&self.options, self.observer.get_current_result())
    }

    #[must_use]
    pub fn observer(&self) -> &QueryObserver<InfiniteData<P, Param>> {
        &self.observer
    }

    pub async fn fetch_next_page(&self) -> InfiniteQueryObserverResult<P, Param> {
        self.fetch_more(FetchDirection::Forward).await
    }

    pub async fn fetch_previous_page(&self) -> InfiniteQueryObserverResult<P, Param> {
        self.fetch_more(FetchDirection::Backward).await
    }

    async fn fetch_more(&self, direction: FetchDirection) -> InfiniteQueryObserverResult<P, Param> {
        let result = self
            .observer
            .fetch(FetchOptions {
                cancel_refetch: true,
                meta: Some(FetchMeta {
                    fetch_more: Some(direction),
                }),
            })
            .await;
        infinite_result(&self.options, result)
    }

    /// Refetches every cached page.
    pub async fn refetch(&self) -> InfiniteQueryObserverResult<P, Param> {
        let result = self.observer.refetch().await;
        infinite_result(&self.options, result)
    }

    pub fn set_options(&mut self, options: InfiniteQueryOptions<P, Param>) {
        self.observer
            .set_options(QueryObserverOptions::new(options.to_query_options()));
        self.options = options;
    }

    pub fn destroy(&self) {
        self.observer.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    type Calls = Arc<Mutex<Vec<(i32, Vec<i32>, i32, Vec<i32>)>>>;

    fn numbered(next_calls: &Calls, previous_calls: &Calls) -> InfiniteQueryOptions<i32, i32> {
        let (n, p) = (next_calls.clone(), previous_calls.clone());
        InfiniteQueryOptions::new(
            "numbers",
            1,
            |ctx: QueryFunctionContext<i32>| async move { Ok(ctx.page_param) },
            move |last: &i32, pages: &[i32], param: &i32, params: &[i32]| {
                n.lock().push((*last, pages.to_vec(), *param, params.to_vec()));
                Some(param + 1)
            },
        )
        .get_previous_page_param(move |first, pages, param, params| {
            p.lock().push((*first, pages.to_vec(), *param, params.to_vec()));
            Some(param - 1)
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_pages_drops_from_the_opposite_end() {
        let client = QueryClient::new();
        let (next_calls, previous_calls) = (Calls::default(), Calls::default());
        let observer = InfiniteQueryObserver::new(
            &client,
            numbered(&next_calls, &previous_calls).max_pages(2),
        );
        let _unsubscribe = observer.subscribe(|_| {});

        let first = observer.refetch().await;
        assert_eq!(first.result.data.as_deref().map(|d| d.pages.clone()), Some(vec![1]));

        let second = observer.fetch_next_page().await;
        assert_eq!(
            second.result.data.as_deref().map(|d| d.pages.clone()),
            Some(vec![1, 2])
        );

        let third = observer.fetch_previous_page().await;
        let data = third.result.data.expect("pages");
        assert_eq!(data.pages, vec![0, 1]);
        assert_eq!(data.page_params, vec![0, 1]);

        assert!(
            next_calls
                .lock()
                .contains(&(1, vec![1], 1, vec![1]))
        );
        assert!(
            previous_calls
                .lock()
                .contains(&(1, vec![1, 2], 1, vec![1, 2]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_walks_every_cached_page() {
        let client = QueryClient::new();
        let (next_calls, previous_calls) = (Calls::default(), Calls::default());
        let options = numbered(&next_calls, &previous_calls);
        let observer = InfiniteQueryObserver::new(&client, options);
        let _unsubscribe = observer.subscribe(|_| {});
        tokio::task::yield_now().await;

        observer.fetch_next_page().await;
        observer.fetch_next_page().await;
        let refetched = observer.refetch().await;
        let data = refetched.result.data.expect("pages");
        assert_eq!(data.pages, vec![1, 2, 3]);
        assert!(refetched.has_next_page);
        assert!(refetched.has_previous_page);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_next_param_keeps_data() {
        let client = QueryClient::new();
        let options = InfiniteQueryOptions::new(
            "single",
            0u32,
            |ctx: QueryFunctionContext<u32>| async move { Ok(ctx.page_param) },
            |_: &u32, _: &[u32], _: &u32, _: &[u32]| None,
        );
        let observer = InfiniteQueryObserver::new(&client, options);
        let _unsubscribe = observer.subscribe(|_| {});
        let loaded = observer.refetch().await;
        assert!(!loaded.has_next_page);

        let after = observer.fetch_next_page().await;
        let data = after.result.data.expect("pages");
        assert_eq!(data.pages, vec![0]);
        assert!(!after.is_fetching_next_page);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_infinite_query_through_client() {
        let client = QueryClient::new();
        let (next_calls, previous_calls) = (Calls::default(), Calls::default());
        let data = client
            .fetch_infinite_query(numbered(&next_calls, &previous_calls))
            .await
            .expect("first page loads");
        assert_eq!(data.pages, vec![1]);
        assert_eq!(data.page_params, vec![1]);
    }
}
