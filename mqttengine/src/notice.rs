use tokio::sync::oneshot;

use crate::client::ClientError;
use crate::eventloop::Command;

use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

type NoticeResult<T> = Result<T, ClientError>;

/// Eventloop side of a pending call. Resolved exactly once
#[derive(Debug)]
pub struct NoticeTx<T>(oneshot::Sender<NoticeResult<T>>);

impl<T> NoticeTx<T> {
    pub fn new() -> (Self, oneshot::Receiver<NoticeResult<T>>) {
        let (notice_tx, notice_rx) = oneshot::channel();
        (NoticeTx(notice_tx), notice_rx)
    }

    pub fn success(self, value: T) {
        _ = self.0.send(Ok(value));
    }

    pub fn error(self, e: ClientError) {
        _ = self.0.send(Err(e));
    }

    /// The caller stopped waiting
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Caller side of a pending call. Dropping it before it resolves tells the
/// eventloop to forget about request `id`
#[derive(Debug)]
pub struct NoticeFuture<T> {
    rx: oneshot::Receiver<NoticeResult<T>>,
    cancel: Option<(u64, flume::Sender<Command>)>,
}

impl<T> NoticeFuture<T> {
    pub fn new(
        rx: oneshot::Receiver<NoticeResult<T>>,
        id: u64,
        tx: flume::Sender<Command>,
    ) -> NoticeFuture<T> {
        NoticeFuture {
            rx,
            cancel: Some((id, tx)),
        }
    }
}

impl<T> Future for NoticeFuture<T> {
    type Output = NoticeResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = ready!(Pin::new(&mut self.rx).poll(cx));
        self.cancel = None;

        match result {
            Ok(result) => Poll::Ready(result),
            Err(_) => Poll::Ready(Err(ClientError::EventLoopGone)),
        }
    }
}

impl<T> Drop for NoticeFuture<T> {
    fn drop(&mut self) {
        if let Some((id, tx)) = self.cancel.take() {
            // a full queue means the eventloop finds out through the
            // closed resolver instead
            if tx.try_send(Command::Cancel(id)).is_err() {
                trace!("Couldn't post cancellation of request {}", id);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use matches::assert_matches;

    #[tokio::test]
    async fn dropping_a_pending_notice_posts_cancel() {
        let (tx, rx) = flume::bounded(4);
        let (notice, notice_rx) = NoticeTx::<()>::new();

        let future = NoticeFuture::new(notice_rx, 7, tx);
        drop(future);

        assert_matches!(rx.try_recv(), Ok(Command::Cancel(7)));
        assert!(notice.is_closed());
    }

    #[tokio::test]
    async fn resolved_notice_doesnt_cancel() {
        let (tx, rx) = flume::bounded(4);
        let (notice, notice_rx) = NoticeTx::new();

        let future = NoticeFuture::new(notice_rx, 7, tx);
        notice.success(10);
        assert_eq!(future.await.unwrap(), 10);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn vanished_eventloop_is_reported() {
        let (tx, _rx) = flume::bounded(4);
        let (notice, notice_rx) = NoticeTx::<()>::new();

        let future = NoticeFuture::new(notice_rx, 7, tx);
        drop(notice);
        assert_matches!(future.await, Err(ClientError::EventLoopGone));
    }
}
