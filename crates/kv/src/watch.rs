use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::{KvError, KvEvent};

/// Receiving half of a change-feed subscription.
///
/// Yields buffered events in revision order. If the producer dropped the
/// subscription because its buffer filled up, the stream ends with a single
/// `KvError::Overflowed` after the buffered events.
pub struct KvWatch {
    rx: mpsc::Receiver<KvEvent>,
    overflowed: Arc<AtomicBool>,
    done: bool,
}

impl KvWatch {
    pub fn new(rx: mpsc::Receiver<KvEvent>, overflowed: Arc<AtomicBool>) -> Self {
        Self { rx, overflowed, done: false }
    }
}

impl Stream for KvWatch {
    type Item = Result<KvEvent, KvError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(ev)) => Poll::Ready(Some(Ok(ev))),
            Poll::Ready(None) => {
                self.done = true;
                if self.overflowed.load(Ordering::Acquire) {
                    Poll::Ready(Some(Err(KvError::Overflowed)))
                } else {
                    Poll::Ready(None)
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
