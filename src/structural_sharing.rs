//! Reference-preserving data replacement.
//!
//! When a fetch returns data equal to what is cached, the cached `Arc` is
//! kept so consumers comparing by pointer see no change. [`DeepShare`]
//! extends this to collections of shared values, reusing every unchanged
//! element.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use crate::error::QueryError;

/// Decides how new data replaces previous data.
pub trait ShareStrategy<T>: Send + Sync {
    /// Produces the value to store. Returning an error settles the fetch
    /// with that error.
    fn share(&self, previous: Option<&Arc<T>>, next: T) -> Result<Arc<T>, QueryError>;
}

/// Keeps the previous value when the new one is equal.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaceEqual;

impl<T: PartialEq + Send + Sync> ShareStrategy<T> for ReplaceEqual {
    fn share(&self, previous: Option<&Arc<T>>, next: T) -> Result<Arc<T>, QueryError> {
        Ok(replace_equal(previous, next))
    }
}

/// Always stores the new value.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSharing;

impl<T: Send + Sync> ShareStrategy<T> for NoSharing {
    fn share(&self, _previous: Option<&Arc<T>>, next: T) -> Result<Arc<T>, QueryError> {
        Ok(Arc::new(next))
    }
}

/// Recursively reuses unchanged parts through [`DeepShare`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Deep;

impl<T: DeepShare + PartialEq + Send + Sync> ShareStrategy<T> for Deep {
    fn share(&self, previous: Option<&Arc<T>>, next: T) -> Result<Arc<T>, QueryError> {
        Ok(match previous {
            Some(previous) if **previous == next => previous.clone(),
            Some(previous) => Arc::new(next.share_from(previous)),
            None => Arc::new(next),
        })
    }
}

/// Wraps a closure as a strategy.
pub struct ShareFn<F>(pub F);

impl<F> fmt::Debug for ShareFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ShareFn(..)")
    }
}

impl<T, F> ShareStrategy<T> for ShareFn<F>
where
    F: Fn(Option<&Arc<T>>, T) -> Result<Arc<T>, QueryError> + Send + Sync,
{
    fn share(&self, previous: Option<&Arc<T>>, next: T) -> Result<Arc<T>, QueryError> {
        (self.0)(previous, next)
    }
}

/// Returns `previous` if it equals `next`, else a fresh `Arc`.
pub fn replace_equal<T: PartialEq>(previous: Option<&Arc<T>>, next: T) -> Arc<T> {
    match previous {
        Some(previous) if **previous == next => previous.clone(),
        _ => Arc::new(next),
    }
}

/// Types whose shared sub-values can be carried over from a previous value.
pub trait DeepShare: Sized {
    /// Rebuilds `self`, substituting equal parts of `previous`.
    #[must_use]
    fn share_from(self, previous: &Self) -> Self;
}

impl<U: PartialEq + DeepShare + Clone> DeepShare for Arc<U> {
    fn share_from(self, previous: &Self) -> Self {
        if Arc::ptr_eq(&self, previous) || *self == **previous {
            return previous.clone();
        }
        let inner = Arc::unwrap_or_clone(self);
        Arc::new(inner.share_from(previous))
    }
}

impl<U: DeepShare> DeepShare for Vec<U> {
    fn share_from(self, previous: &Self) -> Self {
        let mut previous = previous.iter();
        self.into_iter()
            .map(|item| match previous.next() {
                Some(old) => item.share_from(old),
                None => item,
            })
            .collect()
    }
}

impl<U: DeepShare> DeepShare for Option<U> {
    fn share_from(self, previous: &Self) -> Self {
        match (self, previous) {
            (Some(next), Some(old)) => Some(next.share_from(old)),
            (next, _) => next,
        }
    }
}

impl<K: Ord, U: DeepShare> DeepShare for BTreeMap<K, U> {
    fn share_from(self, previous: &Self) -> Self {
        self.into_iter()
            .map(|(key, value)| {
                let value = match previous.get(&key) {
                    Some(old) => value.share_from(old),
                    None => value,
                };
                (key, value)
            })
            .collect()
    }
}

impl<K: Eq + Hash, U: DeepShare, S: BuildHasher + Default> DeepShare for HashMap<K, U, S> {
    fn share_from(self, previous: &Self) -> Self {
        self.into_iter()
            .map(|(key, value)| {
                let value = match previous.get(&key) {
                    Some(old) => value.share_from(old),
                    None => value,
                };
                (key, value)
            })
            .collect()
    }
}

macro_rules! leaf_share {
    ($($ty:ty),+ $(,)?) => {
        $(impl DeepShare for $ty {
            fn share_from(self, _previous: &Self) -> Self {
                self
            }
        })+
    };
}

leaf_share!(
    bool,
    char,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    f32,
    f64,
    String,
    serde_json::Value,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Todo {
        id: u32,
        title: String,
    }

    impl DeepShare for Todo {
        fn share_from(self, _previous: &Self) -> Self {
            self
        }
    }

    #[test]
    fn test_replace_equal_keeps_previous_arc() {
        let previous = Arc::new(vec![1, 2, 3]);
        let next = ReplaceEqual
            .share(Some(&previous), vec![1, 2, 3])
            .expect("sharing cannot fail");
        assert!(Arc::ptr_eq(&previous, &next));

        let changed = ReplaceEqual
            .share(Some(&previous), vec![1, 2])
            .expect("sharing cannot fail");
        assert!(!Arc::ptr_eq(&previous, &changed));
    }

    #[test]
    fn test_no_sharing_always_replaces() {
        let previous = Arc::new(1);
        let next = NoSharing.share(Some(&previous), 1).expect("infallible");
        assert!(!Arc::ptr_eq(&previous, &next));
    }

    #[test]
    fn test_deep_reuses_unchanged_elements() {
        let a = Arc::new(Todo {
            id: 1,
            title: "a".to_string(),
        });
        let b = Arc::new(Todo {
            id: 2,
            title: "b".to_string(),
        });
        let previous = Arc::new(vec![a.clone(), b.clone()]);
        let next = vec![
            Arc::new(Todo {
                id: 1,
                title: "a".to_string(),
            }),
            Arc::new(Todo {
                id: 2,
                title: "changed".to_string(),
            }),
        ];

        let shared = Deep.share(Some(&previous), next).expect("infallible");
        assert!(!Arc::ptr_eq(&previous, &shared));
        assert!(Arc::ptr_eq(&shared[0], &a));
        assert!(!Arc::ptr_eq(&shared[1], &b));
        assert_eq!(shared[1].title, "changed");
    }

    #[test]
    fn test_deep_map_reuses_by_key() {
        let kept = Arc::new(Todo {
            id: 1,
            title: "kept".to_string(),
        });
        let previous = BTreeMap::from([("one".to_string(), kept.clone())]);
        let next = BTreeMap::from([
            (
                "one".to_string(),
                Arc::new(Todo {
                    id: 1,
                    title: "kept".to_string(),
                }),
            ),
            (
                "two".to_string(),
                Arc::new(Todo {
                    id: 2,
                    title: "new".to_string(),
                }),
            ),
        ]);
        let shared = next.share_from(&previous);
        assert!(Arc::ptr_eq(&shared["one"], &kept));
    }

    #[test]
    fn test_custom_strategy_can_fail() {
        let strategy = ShareFn(|_: Option<&Arc<i32>>, _: i32| {
            Err(QueryError::Serialization("not serializable".to_string()))
        });
        assert!(strategy.share(None, 1).is_err());
    }
}
