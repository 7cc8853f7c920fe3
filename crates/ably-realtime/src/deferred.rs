//! One-shot asynchronous results handed back by every public operation.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::future::try_join_all;
use tokio::sync::oneshot;

use crate::Error;
use crate::protocol::{ErrorInfo, error_code};

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, Error>> + Send>>;

/// The eventual result of an operation executed by the client's event loop.
///
/// A `Deferred` is a future: `.await` it to get the result. It resolves or
/// rejects exactly once. Dropping it does not cancel the operation.
#[must_use = "a Deferred does nothing unless awaited; the operation itself still runs"]
pub struct Deferred<T> {
    inner: BoxFuture<T>,
}

impl<T: Send + 'static> Deferred<T> {
    /// A connected resolver/deferred pair.
    pub(crate) fn pair() -> (Resolver<T>, Deferred<T>) {
        let (tx, rx) = oneshot::channel();
        let inner = Box::pin(async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(abandoned()),
            }
        });
        (Resolver { tx: Some(tx) }, Deferred { inner })
    }

    /// An already-rejected result.
    pub fn failed(err: Error) -> Self {
        Deferred {
            inner: Box::pin(std::future::ready(Err(err))),
        }
    }

    /// An already-resolved result.
    pub fn ready(value: T) -> Self {
        Deferred {
            inner: Box::pin(std::future::ready(Ok(value))),
        }
    }

    /// Resolves once every item resolves; rejects with the first failure.
    pub fn all(items: Vec<Deferred<T>>) -> Deferred<Vec<T>> {
        Deferred {
            inner: Box::pin(try_join_all(items)),
        }
    }

    /// Register success and error continuations. `on_success` maps the value;
    /// `on_error` observes the failure, which is passed on unchanged.
    pub fn then<U, F, G>(self, on_success: F, on_error: G) -> Deferred<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
        G: FnOnce(&Error) + Send + 'static,
    {
        Deferred {
            inner: Box::pin(async move {
                match self.inner.await {
                    Ok(value) => Ok(on_success(value)),
                    Err(e) => {
                        on_error(&e);
                        Err(e)
                    }
                }
            }),
        }
    }
}

impl<T> Future for Deferred<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Deferred")
    }
}

/// The settling side of a [`Deferred`]. Consumed on use; dropping an
/// unsettled resolver rejects the deferred.
pub(crate) struct Resolver<T> {
    tx: Option<oneshot::Sender<Result<T, Error>>>,
}

impl<T> Resolver<T> {
    pub(crate) fn resolve(self, value: T) {
        self.settle(Ok(value));
    }

    pub(crate) fn reject(self, err: Error) {
        self.settle(Err(err));
    }

    pub(crate) fn settle(mut self, result: Result<T, Error>) {
        if let Some(tx) = self.tx.take() {
            // The caller may have dropped the Deferred; nothing to do then.
            let _ = tx.send(result);
        }
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(abandoned()));
        }
    }
}

fn abandoned() -> Error {
    Error::Connection(ErrorInfo::new(
        error_code::INTERNAL,
        Some(500),
        "operation abandoned: the client event loop has stopped",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_once() {
        let (resolver, deferred) = Deferred::pair();
        resolver.resolve(5);
        assert_eq!(deferred.await.unwrap(), 5);
    }

    #[tokio::test]
    async fn dropped_resolver_rejects() {
        let (resolver, deferred) = Deferred::<()>::pair();
        drop(resolver);
        let err = deferred.await.unwrap_err();
        assert_eq!(err.code(), error_code::INTERNAL);
    }

    #[tokio::test]
    async fn all_fails_on_first_failure() {
        let (r1, d1) = Deferred::pair();
        let (r2, d2) = Deferred::pair();
        let (r3, d3) = Deferred::<()>::pair();
        r2.reject(Error::Delivery(ErrorInfo::new(50000, Some(500), "nacked")));
        let all = Deferred::all(vec![d1, d2, d3]);
        let err = all.await.unwrap_err();
        assert!(matches!(err, Error::Delivery(_)));
        // Remaining resolvers can still be settled without effect.
        r1.resolve(());
        r3.resolve(());
    }

    #[tokio::test]
    async fn all_succeeds_when_every_item_succeeds() {
        let (r1, d1) = Deferred::pair();
        let (r2, d2) = Deferred::pair();
        r2.resolve(2);
        r1.resolve(1);
        assert_eq!(Deferred::all(vec![d1, d2]).await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn then_runs_the_matching_continuation() {
        let ok = Deferred::ready(20).then(|v| v + 1, |_| panic!("no error expected"));
        assert_eq!(ok.await.unwrap(), 21);

        let (tx, rx) = std::sync::mpsc::channel();
        let failed = Deferred::<u8>::failed(Error::Timeout(ErrorInfo::new(50003, Some(504), "late")))
            .then(|v| v, move |e| tx.send(e.code()).unwrap());
        assert!(failed.await.is_err());
        assert_eq!(rx.recv().unwrap(), 50003);
    }
}
