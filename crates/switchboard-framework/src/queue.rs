//! The update intake queue between a transport and the dispatcher.
//!
//! A bounded queue applies backpressure: [`UpdateSender::send`] waits for
//! room, it never drops.

use std::fmt;

use tokio::sync::mpsc;

use switchboard_core::BoxedUpdate;

use crate::error::{DispatchError, DispatchResult};

/// Creates an intake queue. `None` means unbounded.
///
/// A capacity of zero is raised to one.
pub fn update_queue(capacity: Option<usize>) -> (UpdateSender, UpdateReceiver) {
    match capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (
                UpdateSender { inner: SenderInner::Bounded(tx) },
                UpdateReceiver { inner: ReceiverInner::Bounded(rx) },
            )
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                UpdateSender { inner: SenderInner::Unbounded(tx) },
                UpdateReceiver { inner: ReceiverInner::Unbounded(rx) },
            )
        }
    }
}

#[derive(Clone)]
enum SenderInner {
    Bounded(mpsc::Sender<BoxedUpdate>),
    Unbounded(mpsc::UnboundedSender<BoxedUpdate>),
}

/// The transport's end of the queue. Cheap to clone.
#[derive(Clone)]
pub struct UpdateSender {
    inner: SenderInner,
}

impl UpdateSender {
    /// Enqueues an update, waiting for room if the queue is bounded and full.
    pub async fn send(&self, update: BoxedUpdate) -> DispatchResult<()> {
        match &self.inner {
            SenderInner::Bounded(tx) => tx.send(update).await.map_err(|_| DispatchError::QueueClosed),
            SenderInner::Unbounded(tx) => tx.send(update).map_err(|_| DispatchError::QueueClosed),
        }
    }

    /// Enqueues an update without waiting.
    pub fn try_send(&self, update: BoxedUpdate) -> DispatchResult<()> {
        match &self.inner {
            SenderInner::Bounded(tx) => tx.try_send(update).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => DispatchError::QueueClosed,
            }),
            SenderInner::Unbounded(tx) => tx.send(update).map_err(|_| DispatchError::QueueClosed),
        }
    }

    /// Whether the dispatcher side is gone.
    pub fn is_closed(&self) -> bool {
        match &self.inner {
            SenderInner::Bounded(tx) => tx.is_closed(),
            SenderInner::Unbounded(tx) => tx.is_closed(),
        }
    }
}

impl fmt::Debug for UpdateSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bounded = matches!(self.inner, SenderInner::Bounded(_));
        f.debug_struct("UpdateSender")
            .field("bounded", &bounded)
            .field("closed", &self.is_closed())
            .finish()
    }
}

enum ReceiverInner {
    Bounded(mpsc::Receiver<BoxedUpdate>),
    Unbounded(mpsc::UnboundedReceiver<BoxedUpdate>),
}

/// The dispatcher's end of the queue.
pub struct UpdateReceiver {
    inner: ReceiverInner,
}

impl UpdateReceiver {
    /// Next update in enqueue order. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<BoxedUpdate> {
        match &mut self.inner {
            ReceiverInner::Bounded(rx) => rx.recv().await,
            ReceiverInner::Unbounded(rx) => rx.recv().await,
        }
    }

    /// Stops accepting updates. Already queued ones can still be received.
    pub fn close(&mut self) {
        match &mut self.inner {
            ReceiverInner::Bounded(rx) => rx.close(),
            ReceiverInner::Unbounded(rx) => rx.close(),
        }
    }
}

impl fmt::Debug for UpdateReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateReceiver").finish_non_exhaustive()
    }
}
