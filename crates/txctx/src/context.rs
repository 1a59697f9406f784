//! Execution Context
//!
//! An immutable, parent-linked chain carrying request-scoped values,
//! cancellation and deadlines across call boundaries. Every derived context
//! points at its parent; deriving never mutates the parent, so a context can be
//! cloned and handed to concurrent tasks freely.
//!
//! Values are keyed by *type*: `ctx.with_value(MyKey, value)` binds `value`
//! under `TypeId::of::<MyKey>()`. A module that keeps its key type private is
//! the only code able to read or shadow its binding.
//!
//! ```
//! use txctx::Context;
//!
//! struct RequestId;
//!
//! let ctx = Context::background().with_value(RequestId, 42u64);
//! assert_eq!(ctx.value::<RequestId, u64>(), Some(&42));
//! assert_eq!(Context::background().value::<RequestId, u64>(), None);
//! ```

use std::any::{Any, TypeId};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Immutable execution context
#[derive(Clone)]
pub struct Context {
    node: Arc<Node>,
}

struct Node {
    parent: Option<Context>,
    kind: Kind,
}

enum Kind {
    Background,
    Value {
        key: TypeId,
        value: Box<dyn Any + Send + Sync>,
    },
    Cancel(Arc<CancelState>),
}

struct CancelState {
    token: CancellationToken,
    /// Effective deadline: already clamped to every ancestor's deadline
    deadline: Option<Instant>,
    cause: OnceLock<Error>,
}

impl Context {
    /// The empty root context: never canceled, no deadline, no values
    pub fn background() -> Self {
        Self {
            node: Arc::new(Node {
                parent: None,
                kind: Kind::Background,
            }),
        }
    }

    fn child(&self, kind: Kind) -> Self {
        Self {
            node: Arc::new(Node {
                parent: Some(self.clone()),
                kind,
            }),
        }
    }

    fn ancestors(&self) -> impl Iterator<Item = &Node> {
        std::iter::successors(Some(&*self.node), |&node| {
            node.parent.as_ref().map(|parent| &*parent.node)
        })
    }

    fn cancel_states(&self) -> impl Iterator<Item = &CancelState> {
        self.ancestors().filter_map(|node| match &node.kind {
            Kind::Cancel(state) => Some(&**state),
            _ => None,
        })
    }

    /// Derive a context binding `value` under the type of `key`
    pub fn with_value<K, V>(&self, _key: K, value: V) -> Self
    where
        K: 'static,
        V: Any + Send + Sync,
    {
        self.child(Kind::Value {
            key: TypeId::of::<K>(),
            value: Box::new(value),
        })
    }

    /// Nearest value bound under key type `K`
    ///
    /// Returns `None` when nothing is bound for `K`, or when the nearest
    /// binding holds something other than a `V`.
    pub fn value<K, V>(&self) -> Option<&V>
    where
        K: 'static,
        V: Any,
    {
        let key = TypeId::of::<K>();
        self.ancestors()
            .find_map(|node| match &node.kind {
                Kind::Value { key: bound, value } if *bound == key => Some(&**value),
                _ => None,
            })
            .and_then(|value| value.downcast_ref::<V>())
    }

    /// Derive a cancelable context
    ///
    /// Canceling the handle cancels the returned context and everything derived
    /// from it. The parent is unaffected.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        self.cancel_child(self.deadline())
    }

    /// Derive a context that expires at `deadline`, or at the parent's
    /// deadline if that comes first
    pub fn with_deadline(&self, deadline: Instant) -> (Self, CancelHandle) {
        let effective = match self.deadline() {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        self.cancel_child(Some(effective))
    }

    /// Derive a context that expires after `timeout`
    ///
    /// A timeout too large to represent as an instant adds no deadline of its
    /// own; the parent's deadline, if any, still applies.
    pub fn with_timeout(&self, timeout: Duration) -> (Self, CancelHandle) {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.with_cancel(),
        }
    }

    fn cancel_child(&self, deadline: Option<Instant>) -> (Self, CancelHandle) {
        let token = match self.cancel_states().next() {
            Some(parent) => parent.token.child_token(),
            None => CancellationToken::new(),
        };
        let state = Arc::new(CancelState {
            token,
            deadline,
            cause: OnceLock::new(),
        });
        let ctx = self.child(Kind::Cancel(Arc::clone(&state)));
        (ctx, CancelHandle { state })
    }

    /// Deadline after which the context is done, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.cancel_states().next().and_then(|state| state.deadline)
    }

    /// Why the context is done, or `None` while it is still live
    pub fn err(&self) -> Option<Error> {
        let nearest = self.cancel_states().next()?;
        if nearest.token.is_cancelled() {
            let cause = self
                .cancel_states()
                .find_map(|state| state.cause.get().cloned())
                .unwrap_or(Error::Canceled);
            return Some(cause);
        }
        match nearest.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Error::DeadlineExceeded),
            _ => None,
        }
    }

    /// True once the context is canceled or past its deadline
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves when the context is canceled or its deadline passes.
    /// Never resolves for contexts without either.
    pub async fn done(&self) {
        let Some(state) = self.cancel_states().next() else {
            return std::future::pending().await;
        };
        match state.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = state.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => state.token.cancelled().await,
        }
    }

    /// Drive `fut` unless the context finishes first
    ///
    /// Fails immediately, without polling `fut`, when the context is already
    /// done. If the context is canceled or expires while `fut` is pending,
    /// `fut` is dropped and the context's error is returned.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            res = fut => res,
            _ = self.done() => Err(self.err().unwrap_or(Error::Canceled)),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = self
            .ancestors()
            .filter(|node| matches!(node.kind, Kind::Value { .. }))
            .count();
        f.debug_struct("Context")
            .field("depth", &self.ancestors().count())
            .field("values", &values)
            .field("deadline", &self.deadline())
            .field("err", &self.err())
            .finish()
    }
}

/// Cancels the context it was created with
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    /// Cancel the context and all contexts derived from it. Later calls are no-ops.
    pub fn cancel(&self) {
        if self.state.token.is_cancelled() {
            return;
        }
        let cause = match self.state.deadline {
            Some(deadline) if Instant::now() >= deadline => Error::DeadlineExceeded,
            _ => Error::Canceled,
        };
        let _ = self.state.cause.set(cause);
        self.state.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.token.is_cancelled()
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct KeyA;
    struct KeyB;

    #[test]
    fn test_context_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Context>();
        assert_send_sync::<CancelHandle>();
    }

    #[test]
    fn test_background_is_empty() {
        let ctx = Context::background();
        assert!(ctx.err().is_none());
        assert!(ctx.deadline().is_none());
        assert!(!ctx.is_done());
        assert!(ctx.value::<KeyA, u32>().is_none());
    }

    #[test]
    fn test_value_lookup_walks_to_root() {
        let root = Context::background().with_value(KeyA, 1u32);
        let child = root.with_value(KeyB, "b".to_string());
        let (grandchild, _cancel) = child.with_cancel();

        assert_eq!(grandchild.value::<KeyA, u32>(), Some(&1));
        assert_eq!(grandchild.value::<KeyB, String>().map(String::as_str), Some("b"));
        assert!(root.value::<KeyB, String>().is_none());
    }

    #[test]
    fn test_nearest_binding_shadows_outer() {
        let outer = Context::background().with_value(KeyA, 1u32);
        let inner = outer.with_value(KeyA, 2u32);

        assert_eq!(inner.value::<KeyA, u32>(), Some(&2));
        assert_eq!(outer.value::<KeyA, u32>(), Some(&1));
    }

    #[test]
    fn test_value_type_mismatch_is_absent() {
        let ctx = Context::background().with_value(KeyA, 1u32);
        assert!(ctx.value::<KeyA, String>().is_none());
    }

    #[test]
    fn test_cancel_reaches_children_not_parent() {
        let (parent, parent_cancel) = Context::background().with_cancel();
        let (child, child_cancel) = parent.with_cancel();
        let grandchild = child.with_value(KeyA, 7u8);

        child_cancel.cancel();
        assert_eq!(child.err(), Some(Error::Canceled));
        assert_eq!(grandchild.err(), Some(Error::Canceled));
        assert!(parent.err().is_none());

        parent_cancel.cancel();
        assert_eq!(parent.err(), Some(Error::Canceled));
        assert_eq!(grandchild.value::<KeyA, u8>(), Some(&7));
    }

    #[test]
    fn test_parent_cancel_propagates() {
        let (parent, cancel) = Context::background().with_cancel();
        let (child, _child_cancel) = parent.with_cancel();

        cancel.cancel();
        cancel.cancel();
        assert!(child.is_done());
        assert_eq!(child.err(), Some(Error::Canceled));
    }

    #[tokio::test]
    async fn test_timeout_expires() {
        let (ctx, _cancel) = Context::background().with_timeout(Duration::from_millis(10));
        assert!(ctx.err().is_none());

        ctx.done().await;
        assert_eq!(ctx.err(), Some(Error::DeadlineExceeded));
    }

    #[test]
    fn test_unrepresentable_timeout_adds_no_deadline() {
        let (ctx, cancel) = Context::background().with_timeout(Duration::MAX);
        assert!(ctx.deadline().is_none());
        assert!(ctx.err().is_none());

        cancel.cancel();
        assert_eq!(ctx.err(), Some(Error::Canceled));
    }

    #[tokio::test]
    async fn test_unrepresentable_timeout_keeps_parent_deadline() {
        let (parent, _p) = Context::background().with_timeout(Duration::from_millis(20));
        let (child, _c) = parent.with_timeout(Duration::MAX);

        assert_eq!(child.deadline(), parent.deadline());
        child.done().await;
        assert_eq!(child.err(), Some(Error::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_child_deadline_is_clamped_to_parent() {
        let (parent, _p) = Context::background().with_timeout(Duration::from_millis(20));
        let (child, _c) = parent.with_timeout(Duration::from_secs(60));

        assert_eq!(child.deadline(), parent.deadline());

        child.done().await;
        assert_eq!(child.err(), Some(Error::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_run_aborts_on_cancel() {
        let (ctx, cancel) = Context::background().with_cancel();

        let (res, _) = tokio::join!(
            ctx.run(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(1)
            }),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                cancel.cancel();
            }
        );

        assert_eq!(res, Err(Error::Canceled));
    }

    #[tokio::test]
    async fn test_run_fails_fast_when_done() {
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();

        let polled = AtomicBool::new(false);
        let res = ctx
            .run(async {
                polled.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert_eq!(res, Err(Error::Canceled));
        assert!(!polled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_passes_result_through() {
        let ctx = Context::background();
        assert_eq!(ctx.run(async { Ok(5) }).await, Ok(5));
        assert_eq!(
            ctx.run(async { Err::<(), _>(Error::NoRows) }).await,
            Err(Error::NoRows)
        );
    }
}
