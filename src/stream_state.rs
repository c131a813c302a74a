use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use bytes::{Buf, Bytes};
use tokio::sync::mpsc;
use tracing::trace;

use crate::byte_stream::{ByobReader, ByteSource, ByteStream, ByteStreamController, DefaultReader};
use crate::config::Encoding;
use crate::error::TransportErrorCode;
use crate::frame::{HeaderList, HeadersKind};
use crate::safe_converter::SafeCast;
use crate::send_buffer::SendBuffer;
use crate::session::SessionShared;
use crate::stream_id::StreamId;

/// The state of one direction of a stream. `Ended` and `Reset` are terminal.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HalfState {
    Open,
    /// graceful end: FIN sent (write half) or received and delivered (read half)
    Ended,
    Reset,
}
impl HalfState {
    pub fn is_terminal(self) -> bool {
        self != HalfState::Open
    }
}

/// Things happening on a stream that are not data
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StreamEvent {
    Headers { kind: HeadersKind, headers: HeaderList },
    /// the peer aborted its write half
    Reset { code: u64 },
    /// the peer asked us to stop writing; the write half was reset in response
    StopSending { code: u64 },
}

pub(crate) enum StreamReader {
    Default(DefaultReader),
    Byob(ByobReader),
}

/// The part of a stream that lives outside the session lock: everything the application touches
///  without going through the session state machine
pub(crate) struct StreamShared {
    pub id: StreamId,
    /// `None` for streams that are not readable locally
    pub readable: Option<ByteStream>,
    pub default_encoding: Encoding,
    pub events: tokio::sync::Mutex<mpsc::UnboundedReceiver<StreamEvent>>,
    /// the reader used by the stream's convenience read methods, created on demand
    pub reader: Mutex<Option<StreamReader>>,
}

/// Bridges consumer-side byte stream activity back into the session: reads re-open the flow
///  control window, cancelling the readable side is a STOP_SENDING.
pub(crate) struct StreamSource {
    pub session: Weak<SessionShared>,
    pub id: StreamId,
}

impl ByteSource for StreamSource {
    fn pull(&self) {
        if let Some(session) = self.session.upgrade() {
            session.on_stream_pull(self.id);
        }
    }

    fn cancel(&self, reason: &str) {
        if let Some(session) = self.session.upgrade() {
            session.on_stream_cancel(self.id, reason);
        }
    }
}

/// The receiving half of a stream: reassembly of out-of-order data, final size bookkeeping and
///  the flow control window announced to the peer.
pub(crate) struct RecvState {
    pub controller: ByteStreamController,
    reassembly: BTreeMap<u64, Bytes>,
    /// everything below this offset was handed to the byte stream
    delivered: u64,
    /// highest offset received, which is what counts for flow control
    highest: u64,
    final_size: Option<u64>,
    fin_delivered: bool,
    /// the limit announced to the peer
    max_stream_data: u64,
    window: u64,
    /// consumption already accounted for in connection level flow control
    reported: u64,
}

impl RecvState {
    pub fn new(controller: ByteStreamController, window: u64) -> RecvState {
        RecvState {
            controller,
            reassembly: BTreeMap::new(),
            delivered: 0,
            highest: 0,
            final_size: None,
            fin_delivered: false,
            max_stream_data: window,
            window,
            reported: 0,
        }
    }

    pub fn is_fin_delivered(&self) -> bool {
        self.fin_delivered
    }

    /// Process a STREAM frame. Returns the increase of the highest received offset, i.e. the
    ///  amount of connection level flow control credit this frame consumes.
    pub fn on_data(&mut self, offset: u64, data: Bytes, fin: bool) -> Result<u64, TransportErrorCode> {
        let end = offset + data.len().safe_cast();

        if let Some(final_size) = self.final_size {
            if end > final_size || (fin && end != final_size) {
                return Err(TransportErrorCode::FinalSizeError);
            }
        }
        if fin {
            if end < self.highest {
                return Err(TransportErrorCode::FinalSizeError);
            }
            self.final_size = Some(end);
        }
        if end > self.max_stream_data {
            return Err(TransportErrorCode::FlowControlError);
        }

        let increase = end.saturating_sub(self.highest);
        self.highest = self.highest.max(end);

        if end > self.delivered && !data.is_empty() {
            let (start, data) = if offset < self.delivered {
                let skip = (self.delivered - offset) as usize;
                (self.delivered, data.slice(skip..))
            }
            else {
                (offset, data)
            };

            let keep_existing = self.reassembly.get(&start)
                .map(|existing| existing.len() >= data.len())
                .unwrap_or(false);
            if !keep_existing {
                self.reassembly.insert(start, data);
            }
        }

        self.deliver();
        Ok(increase)
    }

    fn deliver(&mut self) {
        while let Some(entry) = self.reassembly.first_entry() {
            let start = *entry.key();
            if start > self.delivered {
                break;
            }
            let mut data = entry.remove();
            let end = start + data.len().safe_cast();
            if end <= self.delivered {
                continue;
            }
            data.advance((self.delivered - start) as usize);
            self.delivered = end;
            self.push_to_byte_stream(data);
        }

        if !self.fin_delivered && self.final_size == Some(self.delivered) {
            self.fin_delivered = true;
            if self.controller.is_closed_or_closing() {
                return;
            }
            trace!("end of stream reached at offset {}", self.delivered);
            let _ = self.controller.close();
            if let Some(request) = self.controller.byob_request() {
                let _ = request.respond(0);
            }
        }
    }

    /// Data goes straight into a waiting reader's buffer if there is one, and into the queue
    ///  otherwise
    fn push_to_byte_stream(&mut self, mut data: Bytes) {
        if self.controller.is_closed_or_closing() {
            return;
        }
        while !data.is_empty() {
            if let Some(request) = self.controller.byob_request() {
                let n = match request.fill(&data) {
                    Ok(n) if n > 0 => n,
                    _ => break,
                };
                if request.respond(n).is_err() {
                    break;
                }
                data.advance(n);
            }
            else {
                break;
            }
        }
        if !data.is_empty() {
            let _ = self.controller.enqueue(data);
        }
    }

    /// Validate a RESET_STREAM's final size. Returns the connection level flow control credit
    ///  consumed by the remainder of the stream.
    pub fn on_reset(&mut self, final_size: u64) -> Result<u64, TransportErrorCode> {
        if let Some(known) = self.final_size {
            if known != final_size {
                return Err(TransportErrorCode::FinalSizeError);
            }
        }
        if final_size < self.highest {
            return Err(TransportErrorCode::FinalSizeError);
        }
        if final_size > self.max_stream_data {
            return Err(TransportErrorCode::FlowControlError);
        }
        let increase = final_size - self.highest;
        self.highest = final_size;
        self.final_size = Some(final_size);
        self.reassembly.clear();
        Ok(increase)
    }

    /// bytes the application actually took out of the byte stream
    pub fn consumed(&self) -> u64 {
        self.delivered - self.controller.queue_total_size().safe_cast()
    }

    /// Extends the announced limit once half of the window is used up, returning the new limit
    ///  for a MAX_STREAM_DATA frame
    pub fn window_update(&mut self) -> Option<u64> {
        if self.final_size.is_some() {
            return None;
        }
        let consumed = self.consumed();
        if self.max_stream_data - consumed < self.window / 2 {
            self.max_stream_data = consumed + self.window;
            Some(self.max_stream_data)
        }
        else {
            None
        }
    }

    pub fn max_stream_data(&self) -> u64 {
        self.max_stream_data
    }

    /// consumption since the last call, for connection level flow control
    pub fn take_consumed(&mut self) -> u64 {
        let consumed = self.consumed().max(self.reported);
        let result = consumed - self.reported;
        self.reported = consumed;
        result
    }

    /// When the read half is aborted, everything received so far will never be consumed, and it
    ///  is released for connection level flow control at once
    pub fn take_abandoned(&mut self) -> u64 {
        let result = self.highest.saturating_sub(self.reported);
        self.reported = self.reported.max(self.highest);
        result
    }
}

pub(crate) struct StreamState {
    pub id: StreamId,
    /// locally reserved, but not yet announced to the peer (handshake incomplete or stream limit
    ///  exhausted)
    pub pending: bool,
    pub read: HalfState,
    pub write: HalfState,
    pub recv: Option<RecvState>,
    pub send: Option<SendBuffer>,
    pub events: mpsc::UnboundedSender<StreamEvent>,
    pub shared: Arc<StreamShared>,
}

impl StreamState {
    pub fn emit(&self, event: StreamEvent) {
        trace!("stream {:?}: {:?}", self.id, event);
        let _ = self.events.send(event);
    }

    /// both halves are terminal, and nothing is left that needs acknowledgement
    pub fn is_reapable(&self) -> bool {
        self.read.is_terminal()
            && self.write.is_terminal()
            && self.send.as_ref().map(|s| s.is_fully_acked()).unwrap_or(true)
    }
}
