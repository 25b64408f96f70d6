//! Queries fed by a stream of chunks.
//!
//! Every chunk is folded into the cached data as it arrives, so observers
//! see partial results while the stream is still running. The fetch
//! settles when the stream ends.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream};
use futures::{FutureExt, StreamExt};

use super::options::FetchArgs;
use super::{QueryData, QueryFn, QueryFunctionContext, QueryStatus, SetDataOptions};
use crate::error::QueryError;

/// How a refetch of already-streamed data behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefetchMode {
    /// Clears the data and puts the query back into `pending`.
    #[default]
    Reset,
    /// Keeps the data and appends new chunks to it.
    Append,
    /// Keeps showing the old data until the stream ends, then swaps it.
    Replace,
}

type StreamFn<Item> = Arc<
    dyn Fn(QueryFunctionContext) -> BoxFuture<'static, Result<BoxStream<'static, Result<Item, QueryError>>, QueryError>>
        + Send
        + Sync,
>;

type Reducer<Item, T> = Arc<dyn Fn(&T, Item) -> T + Send + Sync>;

/// Builds a [`QueryFn`] that consumes a stream.
pub struct StreamedQuery<Item, T> {
    stream_fn: StreamFn<Item>,
    reducer: Reducer<Item, T>,
    initial_value: T,
    refetch_mode: RefetchMode,
}

impl<Item, T: fmt::Debug> fmt::Debug for StreamedQuery<Item, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamedQuery")
            .field("initial_value", &self.initial_value)
            .field("refetch_mode", &self.refetch_mode)
            .finish_non_exhaustive()
    }
}

impl<Item: QueryData> StreamedQuery<Item, Vec<Item>> {
    /// Collects chunks into a list.
    pub fn new<F, Fut, S>(stream_fn: F) -> Self
    where
        F: Fn(QueryFunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, QueryError>> + Send + 'static,
        S: Stream<Item = Result<Item, QueryError>> + Send + 'static,
    {
        Self::with_reducer(stream_fn, Vec::new(), |items: &Vec<Item>, chunk| {
            let mut items = items.clone();
            items.push(chunk);
            items
        })
    }
}

impl<Item: Clone + Send + 'static, T: QueryData> StreamedQuery<Item, T> {
    /// Folds chunks with `reducer`, starting from `initial_value`.
    pub fn with_reducer<F, Fut, S>(
        stream_fn: F,
        initial_value: T,
        reducer: impl Fn(&T, Item) -> T + Send + Sync + 'static,
    ) -> Self
    where
        F: Fn(QueryFunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, QueryError>> + Send + 'static,
        S: Stream<Item = Result<Item, QueryError>> + Send + 'static,
    {
        Self {
            stream_fn: Arc::new(move |ctx| {
                stream_fn(ctx)
                    .map(|stream| stream.map(|s| s.boxed()))
                    .boxed()
            }),
            reducer: Arc::new(reducer),
            initial_value,
            refetch_mode: RefetchMode::default(),
        }
    }

    #[must_use]
    pub fn refetch_mode(mut self, refetch_mode: RefetchMode) -> Self {
        self.refetch_mode = refetch_mode;
        self
    }

    #[must_use]
    pub fn into_query_fn(self) -> QueryFn<T> {
        let this = Arc::new(self);
        QueryFn::raw(move |args| {
            let this = this.clone();
            async move { this.run(args).await }.boxed()
        })
    }

    async fn run(&self, args: FetchArgs<T>) -> Result<Option<T>, QueryError> {
        let query = args.query.upgrade();
        let is_refetch = args.previous.is_some();
        if is_refetch
            && self.refetch_mode == RefetchMode::Reset
            && let Some(query) = &query
        {
            query.set_state(|state| {
                state.status = QueryStatus::Pending;
                state.data = None;
                state.error = None;
            });
        }

        let replace = is_refetch && self.refetch_mode == RefetchMode::Replace;
        let mut result = self.initial_value.clone();
        let mut stream = (self.stream_fn)(args.context.clone()).await?;
        while let Some(chunk) = stream.next().await {
            if args.context.signal.is_aborted() {
                break;
            }
            let chunk = chunk?;
            if !replace && let Some(query) = &query {
                let previous = query.data();
                let base = previous.as_deref().unwrap_or(&self.initial_value);
                query.set_data((self.reducer)(base, chunk.clone()), manual())?;
            }
            result = (self.reducer)(&result, chunk);
        }

        if replace
            && !args.context.signal.is_aborted()
            && let Some(query) = &query
        {
            query.set_data(result.clone(), manual())?;
        }

        Ok(Some(
            query
                .and_then(|query| query.data())
                .map_or(result, |data| T::clone(&data)),
        ))
    }
}

fn manual() -> SetDataOptions {
    SetDataOptions {
        manual: true,
        ..SetDataOptions::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::QueryClient;
    use crate::query::QueryOptions;
    use futures::stream;
    use std::time::Duration;

    fn ticking(values: Vec<u32>) -> impl Stream<Item = Result<u32, QueryError>> + Send {
        stream::unfold(values.into_iter(), |mut values| async move {
            let value = values.next()?;
            tokio::time::sleep(Duration::from_millis(10)).await;
            Some((Ok(value), values))
        })
    }

    fn streamed(mode: RefetchMode, rounds: Arc<parking_lot::Mutex<u32>>) -> QueryOptions<Vec<u32>> {
        QueryOptions::key("stream").query_fn(
            StreamedQuery::new(move |_| {
                let round = {
                    let mut rounds = rounds.lock();
                    *rounds += 1;
                    *rounds
                };
                async move { Ok(ticking(vec![round * 10 + 1, round * 10 + 2])) }
            })
            .refetch_mode(mode)
            .into_query_fn(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_are_visible_while_streaming() {
        let client = QueryClient::new();
        let options = streamed(RefetchMode::Reset, Arc::default());
        let query = client.get_query_cache().build(&client, options.clone());
        let promise = query.fetch(Some(options), Default::default());

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(query.data().as_deref(), Some(&vec![11]));
        assert!(query.is_fetching());

        let data = promise.await.expect("stream completes");
        assert_eq!(*data, vec![11, 12]);
        assert!(!query.is_fetching());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_mode_clears_data_on_refetch() {
        let client = QueryClient::new();
        let options = streamed(RefetchMode::Reset, Arc::default());
        client.fetch_query(options.clone()).await.expect("first stream");

        let query = client.get_query_cache().build(&client, options.clone());
        let promise = query.fetch(Some(options), Default::default());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(query.data().is_none());
        assert_eq!(query.state().status, QueryStatus::Pending);

        assert_eq!(*promise.await.expect("second stream"), vec![21, 22]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_mode_swaps_at_the_end() {
        let client = QueryClient::new();
        let options = streamed(RefetchMode::Replace, Arc::default());
        client.fetch_query(options.clone()).await.expect("first stream");

        let query = client.get_query_cache().build(&client, options.clone());
        let promise = query.fetch(Some(options), Default::default());
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(query.data().as_deref(), Some(&vec![11, 12]));

        assert_eq!(*promise.await.expect("second stream"), vec![21, 22]);
        assert_eq!(query.data().as_deref(), Some(&vec![21, 22]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_mode_extends_data() {
        let client = QueryClient::new();
        let options = streamed(RefetchMode::Append, Arc::default());
        client.fetch_query(options.clone()).await.expect("first stream");
        let data = client.fetch_query(options).await.expect("second stream");
        assert_eq!(*data, vec![11, 12, 21, 22]);
    }
}
