//! Mock event source for testing.
//!
//! [`MockSource`] emits values on demand so environment signals can be
//! driven deterministically, without real connectivity or focus events.
//!
//! ```
//! use tears_query::subscription::{mock::MockSource, online::OnlineManager};
//!
//! let online = OnlineManager::new();
//! let mock = MockSource::<bool>::new();
//! let source = mock.clone();
//! online.set_event_stream(move || source.stream());
//! ```

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;

/// A mock event source that emits values on demand.
///
/// Uses a broadcast channel internally, so it can be cloned and shared
/// between the test code and whatever consumes [`MockSource::stream`].
#[derive(Debug, Clone)]
pub struct MockSource<T: Clone> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> MockSource<T> {
    /// Creates a new mock source.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of buffered messages (defaults to 100 if using `new()`)
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { sender: tx }
    }

    /// Creates a new mock source with default capacity (100).
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(100)
    }

    /// Emits a value to every open stream.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no active receivers.
    pub fn emit(&self, value: T) -> Result<usize, broadcast::error::SendError<T>> {
        self.sender.send(value)
    }

    /// Returns the number of active receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Opens a new stream of emitted values.
    #[must_use]
    pub fn stream(&self) -> BoxStream<'static, T> {
        let rx = self.sender.subscribe();
        tokio_stream::wrappers::BroadcastStream::new(rx)
            .filter_map(|result| async move { result.ok() })
            .boxed()
    }
}

impl<T: Clone + Send + 'static> Default for MockSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_source_creation() {
        let mock = MockSource::<i32>::new();
        assert_eq!(mock.receiver_count(), 0);
    }

    #[test]
    fn test_emit() {
        let mock = MockSource::<i32>::new();

        // No receivers yet
        assert!(mock.emit(42).is_err());

        let _rx = mock.sender.subscribe();
        assert_eq!(mock.receiver_count(), 1);

        assert_eq!(mock.emit(42).expect("should emit to receiver"), 1);
    }

    #[test]
    fn test_clone() {
        let mock1 = MockSource::<i32>::new();
        let mock2 = mock1.clone();

        // Same underlying channel
        let _rx = mock1.sender.subscribe();
        assert_eq!(mock2.receiver_count(), 1);
    }

    #[tokio::test]
    async fn test_stream_receives_values() {
        let mock = MockSource::<bool>::new();
        let mut stream = mock.stream();

        mock.emit(true).expect("should emit to stream");
        mock.emit(false).expect("should emit to stream");

        let mut values = Vec::new();
        for _ in 0..2 {
            if let Some(value) = stream.next().await {
                values.push(value);
            }
        }

        assert_eq!(values, vec![true, false]);
    }
}
