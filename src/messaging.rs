//! # Length-Prefixed Messaging
//!
//! Framing used by stream transports:
//!
//! ```text
//! [length: u32 BE][length bytes of payload]
//! ```
//!
//! - [`Message`] is assembled incrementally from arbitrary fragments.
//! - [`MessageReader`] pulls socket bytes through a small scratch buffer and
//!   keeps whatever belongs to the next frame.
//! - [`MessageWriter`] is the single consumer of a connection's outgoing
//!   queue, so frames from concurrent senders never interleave.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{trace, warn};

// ============================================================================
// Limits
// ============================================================================

/// Largest payload accepted from a length header (1 GiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024 * 1024;

const LENGTH_PREFIX_BYTES: usize = 4;

/// Body buffers start this small and double on demand, so a hostile length
/// header alone cannot reserve memory.
const INITIAL_BODY_CAPACITY: usize = 256;

/// Scratch buffer used by [`MessageReader`].
pub const READ_BUFFER_SIZE: usize = 256;

/// Capacity of a connection's outgoing queue.
pub const WRITE_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("invalid message size {0}")]
    InvalidSize(u64),
    #[error("channel closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Message
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct Message {
    header: [u8; LENGTH_PREFIX_BYTES],
    header_len: usize,
    size: Option<usize>,
    body: Vec<u8>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a complete payload.
    pub fn read_from(payload: Vec<u8>) -> Result<Self, MessageError> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(MessageError::InvalidSize(payload.len() as u64));
        }
        Ok(Self {
            header: (payload.len() as u32).to_be_bytes(),
            header_len: LENGTH_PREFIX_BYTES,
            size: Some(payload.len()),
            body: payload,
        })
    }

    /// Payload length, `None` until the length header has been read.
    pub fn size(&self) -> Option<usize> {
        self.size
    }

    pub fn is_complete(&self) -> bool {
        self.size == Some(self.body.len())
    }

    /// Feeds raw frame bytes. Returns how many bytes of `bytes` were used;
    /// anything past the end of this frame is left for the caller.
    pub fn append(&mut self, bytes: &[u8]) -> Result<usize, MessageError> {
        let mut used = 0;

        if self.size.is_none() {
            let take = (LENGTH_PREFIX_BYTES - self.header_len).min(bytes.len());
            self.header[self.header_len..self.header_len + take].copy_from_slice(&bytes[..take]);
            self.header_len += take;
            used += take;

            if self.header_len < LENGTH_PREFIX_BYTES {
                return Ok(used);
            }
            let size = u32::from_be_bytes(self.header) as usize;
            if size > MAX_MESSAGE_SIZE {
                return Err(MessageError::InvalidSize(size as u64));
            }
            self.size = Some(size);
        }

        if let Some(size) = self.size {
            let take = (size - self.body.len()).min(bytes.len() - used);
            self.grow_for(take, size);
            self.body.extend_from_slice(&bytes[used..used + take]);
            used += take;
        }

        Ok(used)
    }

    fn grow_for(&mut self, additional: usize, size: usize) {
        let needed = self.body.len() + additional;
        if needed <= self.body.capacity() {
            return;
        }
        let mut capacity = self.body.capacity().max(INITIAL_BODY_CAPACITY);
        while capacity < needed {
            capacity *= 2;
        }
        let capacity = capacity.min(size.max(needed));
        self.body.reserve_exact(capacity - self.body.len());
    }

    pub fn payload(&self) -> &[u8] {
        &self.body
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.body
    }

    /// Length prefix followed by the payload.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(LENGTH_PREFIX_BYTES + self.body.len());
        frame.extend_from_slice(&(self.body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&self.body);
        frame
    }
}

// ============================================================================
// Reader
// ============================================================================

pub struct MessageReader<R> {
    source: R,
    scratch: Box<[u8]>,
    start: usize,
    end: usize,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(source: R) -> Self {
        Self::with_buffer_size(source, READ_BUFFER_SIZE)
    }

    pub fn with_buffer_size(source: R, buffer_size: usize) -> Self {
        Self {
            source,
            scratch: vec![0u8; buffer_size.max(1)].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    /// Reads the next complete message. End of stream is
    /// [`MessageError::Closed`] and is not retried.
    pub async fn read(&mut self) -> Result<Message, MessageError> {
        let mut message = Message::new();
        loop {
            if self.start < self.end {
                let used = message.append(&self.scratch[self.start..self.end])?;
                self.start += used;
                if message.is_complete() {
                    trace!(len = message.payload().len(), "frame read");
                    return Ok(message);
                }
            }

            let read = self.source.read(&mut self.scratch).await?;
            if read == 0 {
                return Err(MessageError::Closed);
            }
            self.start = 0;
            self.end = read;
        }
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Cheap-to-clone handle that enqueues messages for a [`MessageWriter`].
#[derive(Clone)]
pub struct MessageSender {
    queue: mpsc::Sender<Message>,
}

impl MessageSender {
    pub async fn send(&self, message: Message) -> Result<(), MessageError> {
        self.queue.send(message).await.map_err(|_| MessageError::Closed)
    }
}

pub struct MessageWriter<W> {
    sink: W,
    queue: mpsc::Receiver<Message>,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(sink: W) -> (Self, MessageSender) {
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        (Self { sink, queue: rx }, MessageSender { queue: tx })
    }

    /// Writes one message directly, bypassing the queue. Only valid while
    /// [`run`](Self::run) is not draining yet.
    pub async fn write(&mut self, message: &Message) -> Result<(), MessageError> {
        self.sink.write_all(&message.to_frame()).await?;
        self.sink.flush().await?;
        Ok(())
    }

    /// Drains the queue until every sender is gone or the socket fails.
    pub async fn run(mut self) -> Result<(), MessageError> {
        while let Some(message) = self.queue.recv().await {
            if let Err(e) = self.write(&message).await {
                warn!(error = %e, "frame write failed");
                return Err(e);
            }
        }
        Ok(())
    }
}
