//! Pairs up items that arrive independently under the same key.
//!
//! The intermediary of a virtual channel receives one funding (or
//! settlement) proposal per endpoint on different channels and may only
//! accept them together.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchError {
    #[error("no matching item within {0:?}")]
    Timeout(Duration),
}

struct Waiting<T> {
    ticket: u64,
    item: T,
    partner: oneshot::Sender<T>,
}

pub struct Matcher<K, T> {
    waiting: Mutex<HashMap<K, Vec<Waiting<T>>>>,
    next_ticket: AtomicU64,
}

impl<K, T> Default for Matcher<K, T> {
    fn default() -> Self {
        Self {
            waiting: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(0),
        }
    }
}

/// Removes a waiting item when its `pair` call returns or is dropped.
struct Ticket<'a, K: Eq + Hash + Clone, T> {
    matcher: &'a Matcher<K, T>,
    key: K,
    ticket: u64,
}

impl<K: Eq + Hash + Clone, T> Drop for Ticket<'_, K, T> {
    fn drop(&mut self) {
        let mut waiting = self.matcher.lock();
        if let Some(items) = waiting.get_mut(&self.key) {
            items.retain(|w| w.ticket != self.ticket);
            if items.is_empty() {
                waiting.remove(&self.key);
            }
        }
    }
}

impl<K: Eq + Hash + Clone, T> Matcher<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Vec<Waiting<T>>>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of items waiting for a partner under `key`.
    pub fn waiting(&self, key: &K) -> usize {
        self.lock().get(key).map_or(0, Vec::len)
    }

    /// Waits until another call with the same `key` provides an item for which
    /// `matches(waiting, item)` holds and returns that item. The partner gets
    /// `item`.
    pub async fn pair<F>(&self, key: K, item: T, matches: F, timeout: Duration) -> Result<T, MatchError>
    where
        F: Fn(&T, &T) -> bool,
    {
        let (rx, _ticket) = {
            let mut waiting = self.lock();
            let items = waiting.entry(key.clone()).or_default();
            let mut item = item;
            // Partners whose call was dropped can't receive, skip them.
            while let Some(pos) = items.iter().position(|w| matches(&w.item, &item)) {
                let w = items.remove(pos);
                match w.partner.send(item) {
                    Ok(()) => {
                        if items.is_empty() {
                            waiting.remove(&key);
                        }
                        return Ok(w.item);
                    }
                    Err(returned) => item = returned,
                }
            }

            let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            items.push(Waiting {
                ticket,
                item,
                partner: tx,
            });
            (
                rx,
                Ticket {
                    matcher: self,
                    key,
                    ticket,
                },
            )
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(partner)) => Ok(partner),
            _ => Err(MatchError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn pairs_matching_items() {
        let m = Arc::new(Matcher::<u32, (&'static str, u32)>::new());
        let m2 = m.clone();
        let first = tokio::spawn(async move {
            m2.pair(1, ("left", 10), |a, b| a.0 != b.0, TIMEOUT).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(m.waiting(&1), 1);

        let partner = m.pair(1, ("right", 10), |a, b| a.0 != b.0, TIMEOUT).await;
        assert_eq!(partner, Ok(("left", 10)));
        assert_eq!(first.await.unwrap(), Ok(("right", 10)));
        assert_eq!(m.waiting(&1), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_match() {
        let m = Matcher::<u32, u32>::new();
        let (a, b) = tokio::join!(
            m.pair(1, 0, |_, _| true, Duration::from_millis(20)),
            m.pair(2, 0, |_, _| true, Duration::from_millis(20)),
        );
        assert!(a.is_err());
        assert!(b.is_err());
        assert_eq!(m.waiting(&1), 0);
        assert_eq!(m.waiting(&2), 0);
    }

    #[tokio::test]
    async fn predicate_is_respected() {
        let m = Matcher::<u32, &'static str>::new();
        let (a, b) = tokio::join!(
            m.pair(1, "same", |x, y| x != y, Duration::from_millis(20)),
            m.pair(1, "same", |x, y| x != y, Duration::from_millis(20)),
        );
        assert_eq!(a, Err(MatchError::Timeout(Duration::from_millis(20))));
        assert!(b.is_err());
    }

    #[tokio::test]
    async fn dropped_call_is_not_matched() {
        let m = Matcher::<u32, u32>::new();
        {
            let pending = m.pair(1, 5, |_, _| true, TIMEOUT);
            // Poll once so the item is queued, then drop it.
            let _ = tokio::time::timeout(Duration::from_millis(5), pending).await;
        }
        assert_eq!(m.waiting(&1), 0);
        assert!(m
            .pair(1, 6, |_, _| true, Duration::from_millis(20))
            .await
            .is_err());
    }
}
