//! Observers are the transport-owned endpoints a hub fans events out to.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::monitor::error::PushError;
use crate::monitor::event::HubEvent;

/// A remote subscriber of a hub.
///
/// The transport owns the observer; a hub only keeps a weak reference to it.
/// When the remote side disconnects the transport cancels the token returned
/// by [`Observer::closed`], and the hub unregisters the observer.
#[async_trait]
pub trait Observer: Send + Sync {
    /// Unique per connection.
    fn id(&self) -> &str;

    async fn push(&self, batch: &[HubEvent]) -> Result<(), PushError>;

    fn closed(&self) -> CancellationToken;
}

/// In-process observer delivering batches through a bounded channel.
///
/// A full channel makes `push` wait, which the hub turns into an
/// unsubscribe once its push timeout elapses.
#[derive(Debug)]
pub struct ChannelObserver {
    id: String,
    sender: mpsc::Sender<Vec<HubEvent>>,
    closed: CancellationToken,
}

impl ChannelObserver {
    pub fn new(id: &str, capacity: usize) -> (Arc<Self>, ObserverReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();

        let observer = Arc::new(Self {
            id: id.to_string(),
            sender,
            closed: closed.clone(),
        });

        (observer, ObserverReceiver { receiver, closed })
    }
}

#[async_trait]
impl Observer for ChannelObserver {
    fn id(&self) -> &str {
        &self.id
    }

    async fn push(&self, batch: &[HubEvent]) -> Result<(), PushError> {
        if self.closed.is_cancelled() {
            return Err(PushError::Closed);
        }

        self.sender.send(batch.to_vec()).await.map_err(|_| {
            self.closed.cancel();
            PushError::Closed
        })
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Receiving end of a [`ChannelObserver`]. Dropping it signals disconnect.
#[derive(Debug)]
pub struct ObserverReceiver {
    receiver: mpsc::Receiver<Vec<HubEvent>>,
    closed: CancellationToken,
}

impl ObserverReceiver {
    pub async fn recv(&mut self) -> Option<Vec<HubEvent>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Vec<HubEvent>> {
        self.receiver.try_recv().ok()
    }

    /// Signals disconnect without dropping already delivered batches.
    pub fn close(&mut self) {
        self.closed.cancel();
        self.receiver.close();
    }
}

impl Drop for ObserverReceiver {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}
