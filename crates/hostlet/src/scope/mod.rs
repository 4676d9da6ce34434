//! Scoped resource primitives.
//!
//! Everything the engine acquires (listener, socket, child handle, event
//! subscriptions) is wrapped in a single-shot handle so teardown is
//! deterministic: release runs the disposer at most once, and stacks
//! unwind in reverse acquisition order.

mod events;
mod handle;

pub use events::{ErrOnEmit, EventSource, OnceEvent, Subscription, DEFAULT_SUBSCRIPTION_CAPACITY};
pub use handle::{AsyncDisposalStack, AsyncScopedHandle, DisposalStack, ScopedHandle};
