//! Bridges a stream chain to plain `mpsc` channels, for application code that
//! would rather poll a queue than implement [`StreamNode`].

use std::sync::{Arc, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};

use crate::stream::{StreamError, StreamLinks, StreamNode};

pub const DEFAULT_CHANNEL_BUFFER: usize = 10;

/// Leaf node. Frames from the remote peer queue up for
/// [`next_received`](Self::next_received); frames pushed into
/// [`sender`](Self::sender) go out once [`run`](Self::run) is driving them.
///
/// [`run`](Self::run) ends when the chain is closed, or once
/// [`finish`](Self::finish) was called and every handed out sender is gone.
pub struct StreamToChannelAdapter {
    links: StreamLinks,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    inbound_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound_tx: std::sync::Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    closed: watch::Sender<bool>,
}

impl StreamToChannelAdapter {
    pub fn new(buffer: usize) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(buffer);
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer);
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            links: StreamLinks::leaf(),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx: std::sync::Mutex::new(Some(outbound_tx)),
            outbound_rx: Mutex::new(Some(outbound_rx)),
            closed,
        })
    }

    /// Queue toward the remote peer. `None` after [`finish`](Self::finish)
    /// or once the chain is closed.
    pub fn sender(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.outbound_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stops handing out senders; [`run`](Self::run) returns once the
    /// existing ones are dropped and their frames are sent.
    pub fn finish(&self) {
        self.outbound_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub async fn next_received(&self) -> Option<Vec<u8>> {
        self.inbound_rx.lock().await.recv().await
    }

    /// Forwards queued outgoing frames to the parent until the queue closes,
    /// the chain is closed or a send fails. Only the first caller drives the
    /// queue.
    pub async fn run(&self) -> Result<(), StreamError> {
        let Some(mut outbound) = self.outbound_rx.lock().await.take() else {
            return Ok(());
        };
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Ok(());
        }
        loop {
            tokio::select! {
                _ = closed.changed() => return Ok(()),
                message = outbound.recv() => match message {
                    Some(message) => self.send(message).await?,
                    None => return Ok(()),
                },
            }
        }
    }
}

#[async_trait]
impl StreamNode for StreamToChannelAdapter {
    fn links(&self) -> &StreamLinks {
        &self.links
    }

    async fn receive(&self, message: Vec<u8>) -> Result<(), StreamError> {
        self.inbound_tx.send(message).await.map_err(|_| StreamError::Closed)
    }

    async fn perform_closure(&self) -> Result<(), StreamError> {
        self.finish();
        self.closed.send_replace(true);
        self.links.set_opened(false);
        Ok(())
    }
}
