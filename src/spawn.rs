//! spawn a per-request task on whichever runtime feature is enabled.
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

#[inline]
pub fn spawn_without_return<F>(f: F)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    #[cfg(feature = "tokio-runtime")]
    {
        tokio::spawn(f);
    }

    #[cfg(all(not(feature = "tokio-runtime"), feature = "async-io-runtime"))]
    {
        async_global_executor::spawn(f).detach();
    }
}

/// a future that resolves when a connection's background task finishes,
/// hiding the two supported runtimes' differing join-handle shapes (tokio
/// wraps the output in a `Result` that only fails on panic/cancellation;
/// async-global-executor's `Task` is already a plain future) behind one
/// `Future<Output = io::Result<()>>`.
#[cfg(feature = "tokio-runtime")]
pub struct ConnectionHandle(tokio::task::JoinHandle<io::Result<()>>);

#[cfg(all(not(feature = "tokio-runtime"), feature = "async-io-runtime"))]
pub struct ConnectionHandle(async_global_executor::Task<io::Result<()>>);

pub fn spawn_connection<F>(f: F) -> ConnectionHandle
where
    F: Future<Output = io::Result<()>> + Send + 'static,
{
    #[cfg(feature = "tokio-runtime")]
    {
        ConnectionHandle(tokio::spawn(f))
    }

    #[cfg(all(not(feature = "tokio-runtime"), feature = "async-io-runtime"))]
    {
        ConnectionHandle(async_global_executor::spawn(f))
    }
}

impl Future for ConnectionHandle {
    type Output = io::Result<()>;

    #[cfg(feature = "tokio-runtime")]
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|res| {
            res.unwrap_or_else(|err| Err(io::Error::new(io::ErrorKind::Other, err)))
        })
    }

    #[cfg(all(not(feature = "tokio-runtime"), feature = "async-io-runtime"))]
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}
