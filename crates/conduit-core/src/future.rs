use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::RpcError;

/// The write half of an [`AsyncResult`]. Single-assignment is enforced by ownership: `set`
/// and `set_exception` both consume `self`, so there is no runtime check needed to reject a
/// second completion — the type system makes a second call impossible to write.
pub struct Promise<T> {
    inner: oneshot::Sender<Result<T, RpcError>>,
}

impl<T> Promise<T> {
    pub fn set(self, value: T) {
        // The receiver may already have been dropped (caller gave up); that is not our
        // problem to report.
        let _ = self.inner.send(Ok(value));
    }

    pub fn set_exception(self, error: RpcError) {
        let _ = self.inner.send(Err(error));
    }
}

/// A single-assignment future. Completes at most once, with either a value or an
/// [`RpcError`]. Built on top of [`oneshot::Receiver`], which already gives us the
/// single-producer guarantee; this type adds the `wait`/`safe_link` vocabulary the spec
/// calls for.
pub struct AsyncResult<T> {
    inner: oneshot::Receiver<Result<T, RpcError>>,
}

/// Creates a fresh promise/future pair.
pub fn promise<T>() -> (Promise<T>, AsyncResult<T>) {
    let (tx, rx) = oneshot::channel();
    (Promise { inner: tx }, AsyncResult { inner: rx })
}

impl<T> Future for AsyncResult<T> {
    type Output = Result<T, RpcError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // The promise was dropped without completing — a sink panicked or was torn
            // down mid-call without routing a return message. Surface it as InternalError
            // rather than hanging the caller forever.
            Poll::Ready(Err(_canceled)) => Poll::Ready(Err(RpcError::internal(
                "promise dropped without completion",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: Send + 'static> AsyncResult<T> {
    /// Waits for completion, surfacing `RpcError::Timeout` if `timeout` elapses first. This
    /// is a local wait only — it does not install anything in the shared timer queue or
    /// touch the dispatcher's `Deadline` machinery, which is a separate, earlier-arming
    /// mechanism (see `conduit-timer::TimeoutSink`).
    pub async fn wait(self, timeout: Duration) -> Result<T, RpcError> {
        match tokio::time::timeout(timeout, self).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => Err(RpcError::Timeout),
        }
    }

    /// Blocks the current OS thread until the result is available. Must not be called from
    /// within a Tokio worker thread that is expected to keep polling other tasks; intended
    /// for synchronous call sites bridging into an otherwise async codebase.
    pub fn get(self) -> Result<T, RpcError> {
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(self))
    }

    /// Chains a continuation that runs on a freshly spawned task, capturing its outcome in
    /// a new `AsyncResult`. Mirrors the source's `SafeLink`: the continuation never runs on
    /// the caller's stack, so a panicking or slow continuation cannot stall whoever is
    /// polling `self`.
    pub fn safe_link<F, Fut, U>(self, f: F) -> AsyncResult<U>
    where
        F: FnOnce(Result<T, RpcError>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U, RpcError>> + Send + 'static,
        U: Send + 'static,
    {
        let (continuation_promise, continuation_result) = promise();
        tokio::spawn(async move {
            let outcome = self.await;
            match f(outcome).await {
                Ok(value) => continuation_promise.set(value),
                Err(error) => continuation_promise.set_exception(error),
            }
        });
        continuation_result
    }
}
