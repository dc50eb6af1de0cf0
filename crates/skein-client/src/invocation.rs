use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::{AbortHandle, AbortRegistration, Abortable, Aborted, BoxFuture};
use skein_core::RpcError;

use crate::Reply;

/// An in-flight call or batch.
///
/// Nothing is sent until the invocation is polled. Aborting resolves it to
/// [`Reply::Cancelled`] instead of an error, as does a graceful-abort status from
/// the server.
#[must_use = "invocations do nothing unless awaited"]
pub struct Invocation {
    inner: Abortable<BoxFuture<'static, Result<Reply, RpcError>>>,
    handle: AbortHandle,
}

impl Invocation {
    pub(crate) fn new(fut: BoxFuture<'static, Result<Reply, RpcError>>) -> Self {
        let (handle, registration) = AbortHandle::new_pair();
        Invocation {
            inner: Abortable::new(fut, registration),
            handle,
        }
    }

    /// An invocation that fails immediately, without touching the network.
    pub(crate) fn failed(err: RpcError) -> Self {
        Self::new(async move { Err(err) }.boxed())
    }

    /// Cancel the call. The transport request is dropped.
    pub fn abort(&self) {
        tracing::debug!("aborting invocation");
        self.handle.abort();
    }

    /// A handle that can cancel this invocation from elsewhere.
    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.handle.is_aborted()
    }
}

/// Cancel `fut` when `signal` fires.
pub(crate) fn with_signal(
    fut: BoxFuture<'static, Result<Reply, RpcError>>,
    signal: Option<AbortRegistration>,
) -> BoxFuture<'static, Result<Reply, RpcError>> {
    match signal {
        None => fut,
        Some(registration) => Abortable::new(fut, registration)
            .map(|outcome| outcome.unwrap_or_else(|Aborted| Err(RpcError::aborted())))
            .boxed(),
    }
}

impl Future for Invocation {
    type Output = Result<Reply, RpcError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut().inner.poll_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(Aborted)) => Poll::Ready(Ok(Reply::Cancelled)),
            Poll::Ready(Ok(Err(err))) if err.is_abort() => Poll::Ready(Ok(Reply::Cancelled)),
            Poll::Ready(Ok(result)) => Poll::Ready(result),
        }
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("aborted", &self.handle.is_aborted())
            .finish()
    }
}
