use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};

use bytes::Bytes;

use crate::byte_stream::{ByteStream, ByteView, PendingRead, ReadResult};
use crate::error::QuicError;
use crate::frame::{HeaderList, HeadersKind};
use crate::send_buffer::WriteAck;
use crate::session::SessionShared;
use crate::session_state::SessionInner;
use crate::stream_id::{Direction, StreamId};
use crate::stream_state::{HalfState, StreamEvent, StreamReader, StreamShared};

/// A handle to a stream of a session. Clones refer to the same stream.
///
/// Data arrives through the stream's [ByteStream] (see [Stream::readable]); the `read*` methods
///  are conveniences that manage a reader internally. Mixing them with a reader obtained from
///  [Stream::readable] fails because the byte stream is locked.
#[derive(Clone)]
pub struct Stream {
    session: Weak<SessionShared>,
    shared: Arc<StreamShared>,
}

impl Debug for Stream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Stream({})", self.shared.id)
    }
}

impl Stream {
    pub(crate) fn new(session: Weak<SessionShared>, shared: Arc<StreamShared>) -> Stream {
        Stream { session, shared }
    }

    pub fn id(&self) -> StreamId {
        self.shared.id
    }

    pub fn direction(&self) -> Direction {
        self.shared.id.direction()
    }

    fn with_session<R>(&self, f: impl FnOnce(&mut SessionInner) -> R) -> Option<R> {
        self.session.upgrade()
            .map(|session| session.with_inner(f))
    }

    /// Queues data for sending. The returned ack resolves when this and all earlier writes are
    ///  acknowledged by the peer. Writing to a finished or reset stream is a no-op.
    pub fn write(&self, data: impl Into<Bytes>) -> WriteAck {
        let data = data.into();
        let id = self.id();
        self.with_session(|inner| inner.stream_write(id, data))
            .unwrap_or_else(|| WriteAck::ready(Ok(())))
    }

    /// Finishes the write half. The ack resolves when the FIN is acknowledged.
    pub fn end(&self) -> WriteAck {
        let id = self.id();
        self.with_session(|inner| inner.stream_end(id))
            .unwrap_or_else(|| WriteAck::ready(Ok(())))
    }

    pub fn close(&self) -> WriteAck {
        self.end()
    }

    /// Aborts both halves. Unread data is discarded, pending reads and writes fail with `reason`.
    pub fn destroy(&self, reason: Option<QuicError>) {
        let id = self.id();
        self.with_session(|inner| inner.stream_destroy(id, reason));
    }

    /// Aborts the write half only
    pub fn reset(&self, code: u64) {
        let id = self.id();
        self.with_session(|inner| inner.stream_reset(id, code));
    }

    /// Aborts the read half only, asking the peer to stop sending
    pub fn stop_sending(&self, code: u64) {
        let id = self.id();
        self.with_session(|inner| inner.stream_stop_sending(id, code));
    }

    /// The byte stream carrying the received data, `None` for local uni streams
    pub fn readable(&self) -> Option<ByteStream> {
        self.shared.readable.clone()
    }

    fn readable_stream(&self) -> Result<&ByteStream, QuicError> {
        self.shared.readable.as_ref()
            .ok_or_else(|| QuicError::invalid_state(format!("stream {} is not readable", self.id())))
    }

    fn default_read(&self) -> Result<PendingRead<Bytes>, QuicError> {
        let readable = self.readable_stream()?;
        let mut reader = self.shared.reader.lock().unwrap();
        if let Some(StreamReader::Default(r)) = reader.as_ref() {
            return Ok(r.read());
        }

        // dropping a reader releases its lock on the byte stream
        *reader = None;
        let r = readable.get_reader()?;
        let pending = r.read();
        *reader = Some(StreamReader::Default(r));
        Ok(pending)
    }

    fn byob_read(&self, view: ByteView) -> Result<PendingRead<ByteView>, QuicError> {
        let readable = self.readable_stream()?;
        let mut reader = self.shared.reader.lock().unwrap();
        if let Some(StreamReader::Byob(r)) = reader.as_ref() {
            return Ok(r.read(view));
        }

        *reader = None;
        let r = readable.get_byob_reader()?;
        let pending = r.read(view);
        *reader = Some(StreamReader::Byob(r));
        Ok(pending)
    }

    /// The next chunk of data, as it arrived
    pub async fn read(&self) -> Result<ReadResult<Bytes>, QuicError> {
        self.default_read()?.await
    }

    /// Reads into the caller's buffer. At the end of the stream, the result is `done` with an
    ///  empty view over the same buffer.
    pub async fn read_into(&self, view: ByteView) -> Result<ReadResult<ByteView>, QuicError> {
        if view.is_empty() {
            return Err(QuicError::arg_type("view", "a ByteView with a non-zero length"));
        }
        self.byob_read(view)?.await
    }

    pub async fn read_to_end(&self) -> Result<Vec<u8>, QuicError> {
        let mut result = Vec::new();
        loop {
            let chunk = self.read().await?;
            if let Some(data) = chunk.value {
                result.extend_from_slice(&data);
            }
            if chunk.done {
                return Ok(result);
            }
        }
    }

    /// Reads everything and decodes it with the stream's default encoding
    pub async fn read_to_string(&self) -> Result<String, QuicError> {
        let data = self.read_to_end().await?;
        Ok(self.shared.default_encoding.decode(&data))
    }

    pub fn send_headers(&self, kind: HeadersKind, headers: HeaderList) -> Result<(), QuicError> {
        let id = self.id();
        self.with_session(|inner| inner.stream_send_headers(id, kind, headers))
            .unwrap_or_else(|| Err(QuicError::invalid_state("session is closed")))
    }

    /// Opens a push stream for this (client-initiated bidi) stream. Servers only.
    pub fn push_stream(&self, headers: HeaderList) -> Result<Stream, QuicError> {
        let id = self.id();
        self.with_session(|inner| inner.push_stream(id, headers))
            .unwrap_or_else(|| Err(QuicError::invalid_state("session is closed")))
    }

    /// The next non-data event, or `None` once the stream is closed
    pub async fn next_event(&self) -> Option<StreamEvent> {
        self.shared.events.lock().await.recv().await
    }

    fn status(&self) -> (bool, HalfState, HalfState) {
        let id = self.id();
        self.with_session(|inner| inner.stream_status(id))
            .unwrap_or((false, HalfState::Ended, HalfState::Ended))
    }

    /// true until the stream is announced to the peer
    pub fn is_pending(&self) -> bool {
        self.status().0
    }

    pub fn read_state(&self) -> HalfState {
        self.status().1
    }

    pub fn write_state(&self) -> HalfState {
        self.status().2
    }
}
