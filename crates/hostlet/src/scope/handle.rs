//! Single-shot disposal handles and LIFO disposal stacks.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

type Disposer = Box<dyn FnOnce() + Send>;
type AsyncDisposer = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), String>> + Send>;
type SharedDisposal = Shared<BoxFuture<'static, Result<(), String>>>;

/// Wraps a disposer that runs at most once.
///
/// `release()` is idempotent, and dropping an unreleased handle also
/// disposes, so the resource is freed on every exit path.
pub struct ScopedHandle {
    disposer: Option<Disposer>,
}

impl ScopedHandle {
    pub fn new(disposer: impl FnOnce() + Send + 'static) -> Self {
        Self {
            disposer: Some(Box::new(disposer)),
        }
    }

    /// Run the disposer if it has not run yet.
    pub fn release(&mut self) {
        if let Some(disposer) = self.disposer.take() {
            disposer();
        }
    }

    pub fn is_released(&self) -> bool {
        self.disposer.is_none()
    }
}

impl Drop for ScopedHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ScopedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedHandle")
            .field("released", &self.is_released())
            .finish()
    }
}

/// LIFO stack of sync handles. `dispose()` releases in reverse
/// acquisition order, once.
#[derive(Default)]
pub struct DisposalStack {
    items: Vec<ScopedHandle>,
    disposed: bool,
}

impl DisposalStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a disposer to run when the stack unwinds.
    pub fn defer(&mut self, disposer: impl FnOnce() + Send + 'static) {
        self.items.push(ScopedHandle::new(disposer));
    }

    pub fn push(&mut self, handle: ScopedHandle) {
        self.items.push(handle);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Release every handle in reverse acquisition order.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        while let Some(mut handle) = self.items.pop() {
            handle.release();
        }
    }
}

impl Drop for DisposalStack {
    fn drop(&mut self) {
        self.dispose();
    }
}

struct AsyncHandleInner {
    disposer: Option<AsyncDisposer>,
    pending: Option<SharedDisposal>,
}

/// Async counterpart of [`ScopedHandle`].
///
/// The disposer is awaited at most once; concurrent `release()` calls all
/// await the same in-flight future and observe the same result.
pub struct AsyncScopedHandle {
    inner: Arc<Mutex<AsyncHandleInner>>,
}

impl AsyncScopedHandle {
    pub fn new<F, Fut>(disposer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(AsyncHandleInner {
                disposer: Some(Box::new(move || disposer().boxed())),
                pending: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AsyncHandleInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_released(&self) -> bool {
        self.lock().disposer.is_none()
    }

    /// Await the disposer, sharing the in-flight future across callers.
    pub async fn release(&self) -> Result<(), String> {
        let shared = {
            let mut inner = self.lock();
            if let Some(disposer) = inner.disposer.take() {
                let shared = disposer().shared();
                inner.pending = Some(shared.clone());
                shared
            } else if let Some(pending) = &inner.pending {
                pending.clone()
            } else {
                return Ok(());
            }
        };
        shared.await
    }
}

impl Clone for AsyncScopedHandle {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for AsyncScopedHandle {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 && !self.is_released() {
            tracing::warn!("async scoped handle dropped without release");
        }
    }
}

struct AsyncEntry {
    label: &'static str,
    handle: AsyncScopedHandle,
}

/// LIFO stack of async handles.
///
/// `dispose()` releases in reverse acquisition order, never
/// short-circuits, and returns the collected failure messages for the
/// caller to aggregate.
#[derive(Default)]
pub struct AsyncDisposalStack {
    items: Vec<AsyncEntry>,
    disposed: bool,
}

impl AsyncDisposalStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer<F, Fut>(&mut self, label: &'static str, disposer: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.push(label, AsyncScopedHandle::new(disposer));
    }

    pub fn push(&mut self, label: &'static str, handle: AsyncScopedHandle) {
        self.items.push(AsyncEntry { label, handle });
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Unwind the stack. Subsequent calls are no-ops returning no failures.
    pub async fn dispose(&mut self) -> Vec<String> {
        if self.disposed {
            return Vec::new();
        }
        self.disposed = true;
        let mut failures = Vec::new();
        while let Some(entry) = self.items.pop() {
            if let Err(reason) = entry.handle.release().await {
                tracing::error!(step = entry.label, %reason, "disposal step failed");
                failures.push(format!("{}: {}", entry.label, reason));
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn release_runs_disposer_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let mut handle = ScopedHandle::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!handle.is_released());
        handle.release();
        handle.release();
        handle.release();

        assert!(handle.is_released());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_releases_unreleased_handle() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let c = Arc::clone(&count);
            let _handle = ScopedHandle::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stack_disposes_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = DisposalStack::new();
        for i in 0..3 {
            let order = Arc::clone(&order);
            stack.defer(move || order.lock().unwrap().push(i));
        }

        stack.dispose();
        stack.dispose();

        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn async_release_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handle = AsyncScopedHandle::new(move || async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        handle.release().await.unwrap();
        handle.release().await.unwrap();

        assert!(handle.is_released());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_async_releases_share_one_disposal() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handle = AsyncScopedHandle::new(move || async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let a = handle.clone();
        let b = handle.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.release().await }),
            tokio::spawn(async move { b.release().await }),
        );

        ra.unwrap().unwrap();
        rb.unwrap().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn async_stack_collects_failures_in_unwind_order() {
        let mut stack = AsyncDisposalStack::new();
        stack.defer("first", || async { Err("one".to_string()) });
        stack.defer("second", || async { Ok(()) });
        stack.defer("third", || async { Err("three".to_string()) });

        let failures = stack.dispose().await;
        assert_eq!(failures, vec!["third: three", "first: one"]);

        assert!(stack.dispose().await.is_empty());
    }
}
