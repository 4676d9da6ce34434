//! Event fan-out with disposable subscriptions.
//!
//! [`EventSource`] delivers each emission to the subscribers registered at
//! that moment; a subscriber registered later never sees it. Subscriptions
//! buffer into a bounded ring (overflow drops oldest) and unsubscribe on
//! drop. The once/err adapters turn a single emission into a future for
//! `futures::future::select` races.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll, Waker};

use futures::Stream;

/// Ring-buffer capacity a subscription gets unless overridden.
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 100;

struct SubState<T> {
    buf: VecDeque<T>,
    capacity: usize,
    /// Keep only the first event ever buffered (once-adapter mode).
    single: bool,
    dropped: u64,
    waker: Option<Waker>,
    closed: bool,
}

struct SourceInner<T> {
    subscribers: Vec<(u64, Arc<Mutex<SubState<T>>>)>,
    next_id: u64,
    closed: bool,
}

/// Fan-out emitter for one event kind.
pub struct EventSource<T> {
    inner: Arc<Mutex<SourceInner<T>>>,
}

impl<T> Clone for EventSource<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for EventSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl<T> EventSource<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SourceInner {
                subscribers: Vec::new(),
                next_id: 0,
                closed: false,
            })),
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        self.subscribe_with_capacity(DEFAULT_SUBSCRIPTION_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription<T> {
        self.subscribe_inner(capacity, false)
    }

    fn subscribe_inner(&self, capacity: usize, single: bool) -> Subscription<T> {
        let state = Arc::new(Mutex::new(SubState {
            buf: VecDeque::new(),
            capacity: capacity.max(1),
            single,
            dropped: 0,
            waker: None,
            closed: false,
        }));
        let mut inner = lock(&self.inner);
        if inner.closed {
            lock(&state).closed = true;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push((id, Arc::clone(&state)));
        Subscription {
            id,
            source: Arc::downgrade(&self.inner),
            state,
        }
    }

    /// End the stream for every subscriber; later emits are ignored.
    pub fn close(&self) {
        let mut inner = lock(&self.inner);
        inner.closed = true;
        for (_, state) in &inner.subscribers {
            let mut state = lock(state);
            state.closed = true;
            if let Some(waker) = state.waker.take() {
                waker.wake();
            }
        }
        inner.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }
}

impl<T: Clone> EventSource<T> {
    /// Deliver `value` to every current subscriber.
    pub fn emit(&self, value: &T) {
        let inner = lock(&self.inner);
        if inner.closed {
            return;
        }
        for (_, state) in &inner.subscribers {
            let mut state = lock(state);
            if state.closed {
                continue;
            }
            if state.single && !state.buf.is_empty() {
                continue;
            }
            if state.buf.len() == state.capacity {
                state.buf.pop_front();
                state.dropped += 1;
            }
            state.buf.push_back(value.clone());
            if let Some(waker) = state.waker.take() {
                waker.wake();
            }
        }
    }

    /// Future of the first emission after this call. `None` when the
    /// source closes without emitting.
    pub fn once(&self) -> OnceEvent<T> {
        OnceEvent {
            sub: Some(self.subscribe_inner(1, true)),
        }
    }

    /// Rejects-on-emission adapter: `Err(event)` on the first emission,
    /// `Ok(())` when the source closes quietly.
    pub fn once_err(&self) -> ErrOnEmit<T> {
        ErrOnEmit { inner: self.once() }
    }
}

/// A live subscription; unsubscribes from its source on drop.
pub struct Subscription<T> {
    id: u64,
    source: Weak<Mutex<SourceInner<T>>>,
    state: Arc<Mutex<SubState<T>>>,
}

impl<T> Subscription<T> {
    /// Events discarded because the ring buffer was full.
    pub fn dropped(&self) -> u64 {
        lock(&self.state).dropped
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let mut state = lock(&self.state);
        if let Some(value) = state.buf.pop_front() {
            return Poll::Ready(Some(value));
        }
        if state.closed {
            return Poll::Ready(None);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.source.upgrade() {
            lock(&inner).subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Future of a single emission. Unsubscribes on completion and on drop.
pub struct OnceEvent<T> {
    sub: Option<Subscription<T>>,
}

impl<T: Clone> Future for OnceEvent<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(sub) = self.sub.as_mut() else {
            return Poll::Ready(None);
        };
        match Pin::new(sub).poll_next(cx) {
            Poll::Ready(item) => {
                self.sub = None;
                Poll::Ready(item)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Error-event adapter: resolves `Err` on emission.
pub struct ErrOnEmit<T> {
    inner: OnceEvent<T>,
}

impl<T: Clone> Future for ErrOnEmit<T> {
    type Output = Result<(), T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Err(event)),
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use futures::future::Either;

    use super::*;

    #[tokio::test]
    async fn delivers_in_emission_order() {
        let source = EventSource::new();
        let mut sub = source.subscribe();

        source.emit(&1u32);
        source.emit(&2);
        source.emit(&3);
        source.close();

        let got: Vec<u32> = (&mut sub).collect().await;
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let source = EventSource::new();
        source.emit(&"early".to_string());

        let mut sub = source.subscribe();
        source.emit(&"late".to_string());
        source.close();

        assert_eq!(sub.next().await.as_deref(), Some("late"));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn ring_overflow_drops_oldest() {
        let source = EventSource::new();
        let mut sub = source.subscribe_with_capacity(2);

        source.emit(&1u32);
        source.emit(&2);
        source.emit(&3);
        source.close();

        let got: Vec<u32> = (&mut sub).collect().await;
        assert_eq!(got, vec![2, 3]);
        assert_eq!(sub.dropped(), 1);
    }

    #[test]
    fn drop_unsubscribes() {
        let source = EventSource::<u32>::new();
        let sub = source.subscribe();
        assert_eq!(source.subscriber_count(), 1);
        drop(sub);
        assert_eq!(source.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn once_resolves_with_first_emission() {
        let source = EventSource::new();
        let once = source.once();
        source.emit(&7u32);
        source.emit(&8);
        assert_eq!(once.await, Some(7));
    }

    #[tokio::test]
    async fn once_err_races_against_success() {
        let ok_source = EventSource::<u32>::new();
        let err_source = EventSource::<String>::new();

        let race = futures::future::select(ok_source.once(), err_source.once_err());
        err_source.emit(&"boom".to_string());

        match race.await {
            Either::Right((Err(reason), _)) => assert_eq!(reason, "boom"),
            _ => panic!("error adapter should have won the race"),
        }
        // Both adapters are gone; the sources are clean.
        assert_eq!(ok_source.subscriber_count(), 0);
        assert_eq!(err_source.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn close_ends_pending_streams() {
        let source = EventSource::<u32>::new();
        let mut sub = source.subscribe();
        let waiter = tokio::spawn(async move { sub.next().await });
        tokio::task::yield_now().await;

        source.close();
        assert_eq!(waiter.await.unwrap(), None);
    }
}
