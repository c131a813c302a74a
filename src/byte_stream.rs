//! A readable byte stream modelled on the WHATWG `ReadableByteStream`, reduced to byte-sized
//!  elements.
//!
//! There is a consumer side ([ByteStream] and its readers) and a producer side
//!  ([ByteStreamController]). Consumers either read engine-allocated chunks ([DefaultReader]) or
//!  bring their own buffer ([ByobReader]): a BYOB read hands a [ByteView] to the stream, and
//!  the producer fills exactly that storage, either directly through a [ByobRequest] or implicitly
//!  by enqueueing chunks that are then copied into it.
//!
//! The subtle part is the lifecycle of the low-level 'pull-into' requests. Releasing a reader
//!  rejects its pending reads, but the first outstanding pull-into request stays alive (detached
//!  from any reader), so that a producer that is in the middle of filling it can still respond.
//!  Data from such a detached request goes to the queue and from there to the next reader.
//!
//! All operations are synchronous and register their effects at call time; only the results of
//!  reads are delivered asynchronously through [PendingRead].

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::QuicError;

/// A caller-owned byte region: a backing buffer and the window into it that a read should fill.
///
/// The backing buffer is moved into the stream while a read is pending, and moved back out with
///  the result, so the result always refers to the caller's original storage.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ByteView {
    buffer: Vec<u8>,
    offset: usize,
    len: usize,
}

impl ByteView {
    /// a view of the entire buffer
    pub fn new(buffer: Vec<u8>) -> ByteView {
        let len = buffer.len();
        ByteView { buffer, offset: 0, len }
    }

    pub fn with_range(buffer: Vec<u8>, offset: usize, len: usize) -> Result<ByteView, QuicError> {
        match offset.checked_add(len) {
            Some(end) if end <= buffer.len() => Ok(ByteView { buffer, offset, len }),
            _ => Err(QuicError::out_of_range("offset + len", format!("{}+{}", offset, len), &format!("[0, {}]", buffer.len()))),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[self.offset..self.offset + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer[self.offset..self.offset + self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_offset(&self) -> usize {
        self.offset
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// identifies the backing storage, e.g. to check that a read did not reallocate
    pub fn storage_addr(&self) -> usize {
        self.buffer.as_ptr() as usize
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReadResult<T> {
    /// `None` only for `done` results that carry no view (default reads, cancelled BYOB reads)
    pub value: Option<T>,
    pub done: bool,
}

type ReadOutcome<T> = Result<ReadResult<T>, QuicError>;

/// The result of a read, available once data, end of stream or an error is there. The read
///  itself is registered when it is issued, not when this future is first polled.
pub struct PendingRead<T> {
    rx: oneshot::Receiver<ReadOutcome<T>>,
}

impl<T> PendingRead<T> {
    fn ready(outcome: ReadOutcome<T>) -> PendingRead<T> {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        PendingRead { rx }
    }

    fn pending() -> (oneshot::Sender<ReadOutcome<T>>, PendingRead<T>) {
        let (tx, rx) = oneshot::channel();
        (tx, PendingRead { rx })
    }

    /// the result if it is already available
    pub fn try_take(&mut self) -> Option<ReadOutcome<T>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Self::dropped())),
        }
    }

    fn dropped() -> QuicError {
        QuicError::Aborted("the byte stream was dropped".to_string())
    }
}

impl<T> Future for PendingRead<T> {
    type Output = ReadOutcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Self::dropped())),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The producer's hooks: `pull` is called (without any locks held) after consumer-side operations
///  while the stream wants more data, `cancel` when a consumer cancels the stream.
pub trait ByteSource: Send + Sync {
    fn pull(&self);
    fn cancel(&self, reason: &str);
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ByteStreamOptions {
    /// queued bytes beyond which `desired_size` turns non-positive
    pub high_water_mark: usize,
    /// If set, default reads create pull-into requests of this size, so a producer can use
    ///  [ByteStreamController::byob_request] regardless of the reader type
    pub auto_allocate_chunk_size: Option<usize>,
}

impl Default for ByteStreamOptions {
    fn default() -> Self {
        ByteStreamOptions {
            high_water_mark: 16 * 1024,
            auto_allocate_chunk_size: None,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ByteStreamState {
    Readable,
    Closed,
    Errored(QuicError),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ReaderType {
    Default,
    Byob,
    /// the reader that issued the request was released
    None,
}

struct PullIntoDescriptor {
    /// `None` while the producer holds the view (see [ByobRequest::take_view])
    buffer: Option<Vec<u8>>,
    buffer_len: usize,
    byte_offset: usize,
    byte_length: usize,
    bytes_filled: usize,
    minimum_fill: usize,
    reader_type: ReaderType,
}

impl PullIntoDescriptor {
    fn into_view(self) -> ByteView {
        ByteView {
            buffer: self.buffer.unwrap_or_default(),
            offset: self.byte_offset,
            len: self.bytes_filled,
        }
    }

    fn into_chunk(self) -> Bytes {
        let start = self.byte_offset;
        let end = self.byte_offset + self.bytes_filled;
        Bytes::from(self.buffer.unwrap_or_default()).slice(start..end)
    }

    fn filled_bytes(&self) -> &[u8] {
        match &self.buffer {
            Some(buffer) => &buffer[self.byte_offset..self.byte_offset + self.bytes_filled],
            None => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ReaderKind {
    Default,
    Byob,
}

struct ReaderSlot {
    id: u64,
    kind: ReaderKind,
    read_requests: VecDeque<oneshot::Sender<ReadOutcome<Bytes>>>,
    read_into_requests: VecDeque<oneshot::Sender<ReadOutcome<ByteView>>>,
}

struct ByteStreamInner {
    state: ByteStreamState,
    close_requested: bool,
    queue: VecDeque<Bytes>,
    queue_total: usize,
    pending_pull_intos: VecDeque<PullIntoDescriptor>,
    reader: Option<ReaderSlot>,
    next_reader_id: u64,
    /// the id of the currently valid [ByobRequest], if any
    byob_request: Option<u64>,
    next_byob_request_id: u64,
    high_water_mark: usize,
    auto_allocate_chunk_size: Option<usize>,
}

impl ByteStreamInner {
    fn desired_size(&self) -> Option<i64> {
        match &self.state {
            ByteStreamState::Errored(_) => None,
            ByteStreamState::Closed => Some(0),
            ByteStreamState::Readable => Some(self.high_water_mark as i64 - self.queue_total as i64),
        }
    }

    fn should_call_pull(&self) -> bool {
        if self.state != ByteStreamState::Readable || self.close_requested {
            return false;
        }
        if let Some(reader) = &self.reader {
            if !reader.read_requests.is_empty() || !reader.read_into_requests.is_empty() {
                return true;
            }
        }
        self.desired_size().unwrap_or(0) > 0
    }

    fn has_reader(&self, id: u64) -> bool {
        self.reader.as_ref().map(|r| r.id) == Some(id)
    }

    fn invalidate_byob_request(&mut self) {
        self.byob_request = None;
    }

    fn enqueue_chunk_to_queue(&mut self, chunk: Bytes) {
        self.queue_total += chunk.len();
        self.queue.push_back(chunk);
    }

    fn reset_queue(&mut self) {
        self.queue.clear();
        self.queue_total = 0;
    }

    fn clear_pending_pull_intos(&mut self) {
        self.invalidate_byob_request();
        self.pending_pull_intos.clear();
    }

    fn handle_queue_drain(&mut self) {
        if self.queue_total == 0 && self.close_requested {
            self.close_stream();
        }
    }

    /// moves the stream to `Closed`, settling pending default reads
    fn close_stream(&mut self) {
        self.state = ByteStreamState::Closed;
        if let Some(reader) = &mut self.reader {
            for tx in reader.read_requests.drain(..) {
                let _ = tx.send(Ok(ReadResult { value: None, done: true }));
            }
        }
    }

    fn error_stream(&mut self, e: QuicError) {
        if self.state != ByteStreamState::Readable {
            return;
        }
        self.clear_pending_pull_intos();
        self.reset_queue();
        self.state = ByteStreamState::Errored(e.clone());

        if let Some(reader) = &mut self.reader {
            for tx in reader.read_requests.drain(..) {
                let _ = tx.send(Err(e.clone()));
            }
            for tx in reader.read_into_requests.drain(..) {
                let _ = tx.send(Err(e.clone()));
            }
        }
    }

    /// Rejects the reads that are pending right now and discards queued data, but leaves the
    ///  stream `Closed`: reads issued afterwards resolve `done`.
    fn abort_stream(&mut self, e: QuicError) {
        if self.state != ByteStreamState::Readable {
            return;
        }
        self.clear_pending_pull_intos();
        self.reset_queue();
        self.state = ByteStreamState::Closed;

        if let Some(reader) = &mut self.reader {
            for tx in reader.read_requests.drain(..) {
                let _ = tx.send(Err(e.clone()));
            }
            for tx in reader.read_into_requests.drain(..) {
                let _ = tx.send(Err(e.clone()));
            }
        }
    }

    /// Copies as much queued data into the descriptor as fits. Returns true if the descriptor
    ///  reached its minimum fill.
    fn fill_pull_into_from_queue(queue: &mut VecDeque<Bytes>, queue_total: &mut usize, desc: &mut PullIntoDescriptor) -> bool {
        let buffer = match &mut desc.buffer {
            Some(buffer) => buffer,
            None => return false,
        };

        let max_bytes_to_copy = (*queue_total).min(desc.byte_length - desc.bytes_filled);
        let mut remaining = max_bytes_to_copy;
        while remaining > 0 {
            let head = match queue.front_mut() {
                Some(head) => head,
                None => break,
            };
            let n = remaining.min(head.len());
            let dest_start = desc.byte_offset + desc.bytes_filled;
            buffer[dest_start..dest_start + n].copy_from_slice(&head[..n]);

            if n == head.len() {
                queue.pop_front();
            }
            else {
                let _ = head.split_to(n);
            }
            *queue_total -= n;
            desc.bytes_filled += n;
            remaining -= n;
        }

        desc.bytes_filled >= desc.minimum_fill
    }

    fn process_pull_intos_using_queue(&mut self) -> Vec<PullIntoDescriptor> {
        let mut filled = Vec::new();
        while self.queue_total > 0 {
            let ready = match self.pending_pull_intos.front_mut() {
                Some(desc) => Self::fill_pull_into_from_queue(&mut self.queue, &mut self.queue_total, desc),
                None => break,
            };
            if !ready {
                break;
            }
            if let Some(desc) = self.pending_pull_intos.pop_front() {
                filled.push(desc);
            }
        }
        filled
    }

    fn process_read_requests_using_queue(&mut self) {
        loop {
            let has_request = self.reader.as_ref()
                .map(|r| !r.read_requests.is_empty())
                .unwrap_or(false);
            if !has_request || self.queue_total == 0 {
                return;
            }
            let chunk = match self.queue.pop_front() {
                Some(chunk) => chunk,
                None => return,
            };
            self.queue_total -= chunk.len();
            self.handle_queue_drain();
            self.fulfill_read_request(chunk, false);
        }
    }

    fn fulfill_read_request(&mut self, chunk: Bytes, done: bool) {
        if let Some(tx) = self.reader.as_mut().and_then(|r| r.read_requests.pop_front()) {
            let value = if done { None } else { Some(chunk) };
            let _ = tx.send(Ok(ReadResult { value, done }));
        }
    }

    fn commit_pull_into(&mut self, desc: PullIntoDescriptor) {
        let done = self.state == ByteStreamState::Closed;
        match desc.reader_type {
            ReaderType::Default => {
                let chunk = desc.into_chunk();
                self.fulfill_read_request(chunk, done);
            }
            ReaderType::Byob => {
                if let Some(tx) = self.reader.as_mut().and_then(|r| r.read_into_requests.pop_front()) {
                    let _ = tx.send(Ok(ReadResult { value: Some(desc.into_view()), done }));
                }
            }
            ReaderType::None => {}
        }
    }

    fn commit_pull_intos(&mut self, filled: Vec<PullIntoDescriptor>) {
        for desc in filled {
            self.commit_pull_into(desc);
        }
    }

    /// The head request's reader is gone: its filled part goes to the queue for the next reader
    fn enqueue_detached_pull_into_to_queue(&mut self) {
        if let Some(desc) = self.pending_pull_intos.pop_front() {
            if desc.bytes_filled > 0 {
                let chunk = Bytes::copy_from_slice(desc.filled_bytes());
                self.enqueue_chunk_to_queue(chunk);
            }
        }
    }

    fn respond_internal(&mut self, bytes_written: usize) {
        self.invalidate_byob_request();
        if self.state == ByteStreamState::Closed {
            self.respond_in_closed_state();
        }
        else {
            self.respond_in_readable_state(bytes_written);
        }
    }

    fn respond_in_closed_state(&mut self) {
        if self.pending_pull_intos.front().map(|d| d.reader_type) == Some(ReaderType::None) {
            self.pending_pull_intos.pop_front();
        }

        let is_byob = self.reader.as_ref().map(|r| r.kind) == Some(ReaderKind::Byob);
        if is_byob {
            loop {
                let has_request = self.reader.as_ref()
                    .map(|r| !r.read_into_requests.is_empty())
                    .unwrap_or(false);
                if !has_request {
                    break;
                }
                match self.pending_pull_intos.pop_front() {
                    Some(desc) => self.commit_pull_into(desc),
                    None => break,
                }
            }
        }
    }

    fn respond_in_readable_state(&mut self, bytes_written: usize) {
        let reader_type = match self.pending_pull_intos.front_mut() {
            Some(first) => {
                first.bytes_filled += bytes_written;
                if first.reader_type != ReaderType::None && first.bytes_filled < first.minimum_fill {
                    return;
                }
                first.reader_type
            }
            None => return,
        };

        if reader_type == ReaderType::None {
            self.enqueue_detached_pull_into_to_queue();
            let filled = self.process_pull_intos_using_queue();
            self.commit_pull_intos(filled);
            return;
        }

        if let Some(desc) = self.pending_pull_intos.pop_front() {
            let filled = self.process_pull_intos_using_queue();
            self.commit_pull_into(desc);
            self.commit_pull_intos(filled);
        }
    }

    /// the checks shared by both ways of answering a [ByobRequest]
    fn check_byob_request(&self, id: u64) -> Result<(), QuicError> {
        if self.byob_request != Some(id) {
            return Err(QuicError::sequencing("this BYOB request was already answered or invalidated"));
        }
        if self.pending_pull_intos.is_empty() {
            return Err(QuicError::sequencing("there is no pending BYOB request"));
        }
        Ok(())
    }
}

struct ByteStreamShared {
    inner: Mutex<ByteStreamInner>,
    source: Option<Arc<dyn ByteSource>>,
}

impl ByteStreamShared {
    fn call_pull_if(&self, should_call: bool) {
        if should_call {
            if let Some(source) = &self.source {
                source.pull();
            }
        }
    }

    fn cancel(&self, reason: &str) -> Result<(), QuicError> {
        {
            let mut inner = self.inner.lock().unwrap();
            match &inner.state {
                ByteStreamState::Closed => return Ok(()),
                ByteStreamState::Errored(e) => return Err(e.clone()),
                ByteStreamState::Readable => {}
            }

            trace!("cancelling byte stream: {}", reason);
            inner.close_stream();
            if let Some(reader) = &mut inner.reader {
                for tx in reader.read_into_requests.drain(..) {
                    let _ = tx.send(Ok(ReadResult { value: None, done: true }));
                }
            }
            inner.clear_pending_pull_intos();
            inner.reset_queue();
        }

        if let Some(source) = &self.source {
            source.cancel(reason);
        }
        Ok(())
    }

    fn release(&self, reader_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.has_reader(reader_id) {
            return;
        }
        let reader = inner.reader.take();

        if let Some(mut first) = inner.pending_pull_intos.pop_front() {
            first.reader_type = ReaderType::None;
            inner.pending_pull_intos.clear();
            inner.pending_pull_intos.push_back(first);
        }

        if let Some(reader) = reader {
            for tx in reader.read_requests {
                let _ = tx.send(Err(QuicError::ReaderReleased));
            }
            for tx in reader.read_into_requests {
                let _ = tx.send(Err(QuicError::ReaderReleased));
            }
        }
    }
}

/// The consumer side of a byte stream
#[derive(Clone)]
pub struct ByteStream {
    shared: Arc<ByteStreamShared>,
}

impl ByteStream {
    pub fn new(options: ByteStreamOptions, source: Option<Arc<dyn ByteSource>>) -> (ByteStream, ByteStreamController) {
        let shared = Arc::new(ByteStreamShared {
            inner: Mutex::new(ByteStreamInner {
                state: ByteStreamState::Readable,
                close_requested: false,
                queue: VecDeque::new(),
                queue_total: 0,
                pending_pull_intos: VecDeque::new(),
                reader: None,
                next_reader_id: 0,
                byob_request: None,
                next_byob_request_id: 0,
                high_water_mark: options.high_water_mark,
                auto_allocate_chunk_size: options.auto_allocate_chunk_size,
            }),
            source,
        });

        (ByteStream { shared: shared.clone() }, ByteStreamController { shared })
    }

    pub fn get_reader(&self) -> Result<DefaultReader, QuicError> {
        let id = self.lock(ReaderKind::Default)?;
        Ok(DefaultReader { shared: self.shared.clone(), id })
    }

    pub fn get_byob_reader(&self) -> Result<ByobReader, QuicError> {
        let id = self.lock(ReaderKind::Byob)?;
        Ok(ByobReader { shared: self.shared.clone(), id })
    }

    fn lock(&self, kind: ReaderKind) -> Result<u64, QuicError> {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.reader.is_some() {
            return Err(QuicError::invalid_state("the stream is already locked to a reader"));
        }
        let id = inner.next_reader_id;
        inner.next_reader_id += 1;
        inner.reader = Some(ReaderSlot {
            id,
            kind,
            read_requests: VecDeque::new(),
            read_into_requests: VecDeque::new(),
        });
        Ok(id)
    }

    pub fn is_locked(&self) -> bool {
        self.shared.inner.lock().unwrap().reader.is_some()
    }

    /// cancel an unlocked stream
    pub fn cancel(&self, reason: &str) -> Result<(), QuicError> {
        if self.is_locked() {
            return Err(QuicError::invalid_state("cannot cancel a locked stream"));
        }
        self.shared.cancel(reason)
    }

    pub fn state(&self) -> ByteStreamState {
        self.shared.inner.lock().unwrap().state.clone()
    }

    pub fn desired_size(&self) -> Option<i64> {
        self.shared.inner.lock().unwrap().desired_size()
    }
}

pub struct DefaultReader {
    shared: Arc<ByteStreamShared>,
    id: u64,
}

impl DefaultReader {
    pub fn read(&self) -> PendingRead<Bytes> {
        let (result, should_pull) = {
            let mut inner = self.shared.inner.lock().unwrap();
            if !inner.has_reader(self.id) {
                return PendingRead::ready(Err(QuicError::ReaderReleased));
            }

            match &inner.state {
                ByteStreamState::Closed => return PendingRead::ready(Ok(ReadResult { value: None, done: true })),
                ByteStreamState::Errored(e) => return PendingRead::ready(Err(e.clone())),
                ByteStreamState::Readable => {}
            }

            let result = if let Some(chunk) = inner.queue.pop_front() {
                inner.queue_total -= chunk.len();
                inner.handle_queue_drain();
                PendingRead::ready(Ok(ReadResult { value: Some(chunk), done: false }))
            }
            else {
                if let Some(size) = inner.auto_allocate_chunk_size {
                    inner.pending_pull_intos.push_back(PullIntoDescriptor {
                        buffer: Some(vec![0; size]),
                        buffer_len: size,
                        byte_offset: 0,
                        byte_length: size,
                        bytes_filled: 0,
                        minimum_fill: 1,
                        reader_type: ReaderType::Default,
                    });
                }
                let (tx, pending) = PendingRead::pending();
                if let Some(reader) = &mut inner.reader {
                    reader.read_requests.push_back(tx);
                }
                pending
            };
            (result, inner.should_call_pull())
        };

        self.shared.call_pull_if(should_pull);
        result
    }

    pub fn cancel(&self, reason: &str) -> Result<(), QuicError> {
        if !self.shared.inner.lock().unwrap().has_reader(self.id) {
            return Err(QuicError::ReaderReleased);
        }
        self.shared.cancel(reason)
    }

    /// Detach from the stream, rejecting pending reads. This happens implicitly on drop.
    pub fn release(&self) {
        self.shared.release(self.id);
    }
}

impl Drop for DefaultReader {
    fn drop(&mut self) {
        self.shared.release(self.id);
    }
}

pub struct ByobReader {
    shared: Arc<ByteStreamShared>,
    id: u64,
}

impl ByobReader {
    pub fn read(&self, view: ByteView) -> PendingRead<ByteView> {
        self.read_with_min(view, 1)
    }

    /// Resolve only once at least `min` bytes are filled (or the stream ends)
    pub fn read_with_min(&self, view: ByteView, min: usize) -> PendingRead<ByteView> {
        if view.is_empty() {
            return PendingRead::ready(Err(QuicError::arg_type("view", "a non-empty byte view")));
        }
        if min == 0 {
            return PendingRead::ready(Err(QuicError::arg_type("min", "a positive integer")));
        }
        if min > view.len() {
            return PendingRead::ready(Err(QuicError::out_of_range("min", min, &format!("[1, {}]", view.len()))));
        }

        let (result, should_pull) = {
            let mut guard = self.shared.inner.lock().unwrap();
            let inner = &mut *guard;
            if !inner.has_reader(self.id) {
                return PendingRead::ready(Err(QuicError::ReaderReleased));
            }

            match &inner.state {
                ByteStreamState::Errored(e) => return PendingRead::ready(Err(e.clone())),
                ByteStreamState::Closed => {
                    let empty = ByteView { buffer: view.buffer, offset: view.offset, len: 0 };
                    return PendingRead::ready(Ok(ReadResult { value: Some(empty), done: true }));
                }
                ByteStreamState::Readable => {}
            }

            let mut desc = PullIntoDescriptor {
                buffer_len: view.buffer.len(),
                buffer: Some(view.buffer),
                byte_offset: view.offset,
                byte_length: view.len,
                bytes_filled: 0,
                minimum_fill: min,
                reader_type: ReaderType::Byob,
            };

            let (tx, pending) = PendingRead::pending();

            if !inner.pending_pull_intos.is_empty() {
                inner.pending_pull_intos.push_back(desc);
                if let Some(reader) = &mut inner.reader {
                    reader.read_into_requests.push_back(tx);
                }
                return pending;
            }

            let had_queued_data = inner.queue_total > 0;
            if had_queued_data && ByteStreamInner::fill_pull_into_from_queue(&mut inner.queue, &mut inner.queue_total, &mut desc) {
                inner.handle_queue_drain();
                let _ = tx.send(Ok(ReadResult { value: Some(desc.into_view()), done: false }));
            }
            else if had_queued_data && inner.close_requested {
                let e = QuicError::invalid_state("the stream ended before the view's minimum fill");
                inner.error_stream(e.clone());
                let _ = tx.send(Err(e));
                return pending;
            }
            else {
                inner.pending_pull_intos.push_back(desc);
                if let Some(reader) = &mut inner.reader {
                    reader.read_into_requests.push_back(tx);
                }
            }
            (pending, inner.should_call_pull())
        };

        self.shared.call_pull_if(should_pull);
        result
    }

    pub fn cancel(&self, reason: &str) -> Result<(), QuicError> {
        if !self.shared.inner.lock().unwrap().has_reader(self.id) {
            return Err(QuicError::ReaderReleased);
        }
        self.shared.cancel(reason)
    }

    pub fn release(&self) {
        self.shared.release(self.id);
    }
}

impl Drop for ByobReader {
    fn drop(&mut self) {
        self.shared.release(self.id);
    }
}

/// The producer side of a byte stream. Producer operations never call back into the [ByteSource].
#[derive(Clone)]
pub struct ByteStreamController {
    shared: Arc<ByteStreamShared>,
}

impl ByteStreamController {
    pub fn enqueue(&self, chunk: Bytes) -> Result<(), QuicError> {
        if chunk.is_empty() {
            return Err(QuicError::arg_value("chunk", "must not be empty"));
        }

        let mut inner = self.shared.inner.lock().unwrap();
        if inner.close_requested || inner.state != ByteStreamState::Readable {
            return Err(QuicError::sequencing("cannot enqueue into a closed or closing stream"));
        }

        if let Some(first) = inner.pending_pull_intos.front() {
            let detached = first.reader_type == ReaderType::None;
            inner.invalidate_byob_request();
            if detached {
                inner.enqueue_detached_pull_into_to_queue();
            }
        }

        match inner.reader.as_ref().map(|r| r.kind) {
            Some(ReaderKind::Default) => {
                inner.process_read_requests_using_queue();
                let has_read_requests = inner.reader.as_ref()
                    .map(|r| !r.read_requests.is_empty())
                    .unwrap_or(false);
                if has_read_requests {
                    if !inner.pending_pull_intos.is_empty() {
                        inner.pending_pull_intos.pop_front();
                    }
                    inner.fulfill_read_request(chunk, false);
                }
                else {
                    inner.enqueue_chunk_to_queue(chunk);
                }
            }
            Some(ReaderKind::Byob) => {
                inner.enqueue_chunk_to_queue(chunk);
                let filled = inner.process_pull_intos_using_queue();
                inner.commit_pull_intos(filled);
            }
            None => inner.enqueue_chunk_to_queue(chunk),
        }
        Ok(())
    }

    /// Signal the end of the stream. Queued data is still delivered. Pending BYOB reads settle
    ///  only when the producer answers the current request with `respond(0)`.
    pub fn close(&self) -> Result<(), QuicError> {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.close_requested || inner.state != ByteStreamState::Readable {
            return Err(QuicError::sequencing("the stream is already closed or closing"));
        }
        if inner.queue_total > 0 {
            inner.close_requested = true;
            return Ok(());
        }
        inner.close_stream();
        Ok(())
    }

    pub fn error(&self, e: QuicError) {
        self.shared.inner.lock().unwrap().error_stream(e);
    }

    /// Like [ByteStreamController::error] for the reads that are pending, but the stream ends up
    ///  closed rather than errored
    pub fn abort(&self, e: QuicError) {
        self.shared.inner.lock().unwrap().abort_stream(e);
    }

    /// The request for the oldest pending pull-into, if there is one. Repeated calls return the
    ///  same request until it is answered.
    pub fn byob_request(&self) -> Option<ByobRequest> {
        let mut inner = self.shared.inner.lock().unwrap();
        if let Some(id) = inner.byob_request {
            return Some(ByobRequest { shared: self.shared.clone(), id });
        }
        if inner.pending_pull_intos.is_empty() {
            return None;
        }
        let id = inner.next_byob_request_id;
        inner.next_byob_request_id += 1;
        inner.byob_request = Some(id);
        Some(ByobRequest { shared: self.shared.clone(), id })
    }

    pub fn queue_total_size(&self) -> usize {
        self.shared.inner.lock().unwrap().queue_total
    }

    pub fn desired_size(&self) -> Option<i64> {
        self.shared.inner.lock().unwrap().desired_size()
    }

    pub fn is_closed_or_closing(&self) -> bool {
        let inner = self.shared.inner.lock().unwrap();
        inner.close_requested || inner.state != ByteStreamState::Readable
    }
}

/// A producer's handle on the oldest pending pull-into. It becomes invalid once it is answered
///  (or the stream is cancelled, errored or receives an enqueue), and answering an invalid request
///  is a sequencing error.
pub struct ByobRequest {
    shared: Arc<ByteStreamShared>,
    id: u64,
}

impl ByobRequest {
    /// number of bytes that can still be written into the view
    pub fn view_len(&self) -> Result<usize, QuicError> {
        let inner = self.shared.inner.lock().unwrap();
        inner.check_byob_request(self.id)?;
        Ok(inner.pending_pull_intos.front()
            .map(|d| d.byte_length - d.bytes_filled)
            .unwrap_or(0))
    }

    /// Copy data to the start of the view, returning how many bytes fit. This does not answer the
    ///  request - call [Self::respond] with the number of bytes written.
    pub fn fill(&self, data: &[u8]) -> Result<usize, QuicError> {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.check_byob_request(self.id)?;
        let desc = match inner.pending_pull_intos.front_mut() {
            Some(desc) => desc,
            None => return Err(QuicError::sequencing("there is no pending BYOB request")),
        };
        let start = desc.byte_offset + desc.bytes_filled;
        let n = data.len().min(desc.byte_length - desc.bytes_filled);
        match &mut desc.buffer {
            Some(buffer) => buffer[start..start + n].copy_from_slice(&data[..n]),
            None => return Err(QuicError::sequencing("the view was taken by the producer")),
        }
        Ok(n)
    }

    /// Take the view out of the stream, e.g. to hand it to an I/O operation. The request must then
    ///  be answered with [Self::respond_with_new_view].
    pub fn take_view(&self) -> Result<ByteView, QuicError> {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.check_byob_request(self.id)?;
        let desc = match inner.pending_pull_intos.front_mut() {
            Some(desc) => desc,
            None => return Err(QuicError::sequencing("there is no pending BYOB request")),
        };
        match desc.buffer.take() {
            Some(buffer) => Ok(ByteView {
                buffer,
                offset: desc.byte_offset + desc.bytes_filled,
                len: desc.byte_length - desc.bytes_filled,
            }),
            None => Err(QuicError::sequencing("the view was already taken")),
        }
    }

    pub fn respond(&self, bytes_written: usize) -> Result<(), QuicError> {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.check_byob_request(self.id)?;

        let (bytes_filled, byte_length, has_buffer) = match inner.pending_pull_intos.front() {
            Some(first) => (first.bytes_filled, first.byte_length, first.buffer.is_some()),
            None => return Err(QuicError::sequencing("there is no pending BYOB request")),
        };
        if !has_buffer {
            return Err(QuicError::sequencing("the view was taken - use respond_with_new_view"));
        }

        if inner.state == ByteStreamState::Closed {
            if bytes_written != 0 {
                return Err(QuicError::sequencing("bytes written must be 0 after the stream was closed"));
            }
        }
        else {
            if bytes_written == 0 {
                return Err(QuicError::arg_value("bytes_written", "must be positive while the stream is readable"));
            }
            if bytes_filled + bytes_written > byte_length {
                return Err(QuicError::out_of_range("bytes_written", bytes_written, &format!("[1, {}]", byte_length - bytes_filled)));
            }
        }

        inner.respond_internal(bytes_written);
        Ok(())
    }

    /// Answer the request with a view over a (possibly different) buffer of the same size, at the
    ///  same position
    pub fn respond_with_new_view(&self, view: ByteView) -> Result<(), QuicError> {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.check_byob_request(self.id)?;

        let (expected_offset, buffer_len, remaining) = match inner.pending_pull_intos.front() {
            Some(first) => (first.byte_offset + first.bytes_filled, first.buffer_len, first.byte_length - first.bytes_filled),
            None => return Err(QuicError::sequencing("there is no pending BYOB request")),
        };

        if inner.state == ByteStreamState::Closed {
            if !view.is_empty() {
                return Err(QuicError::sequencing("the view must be empty after the stream was closed"));
            }
        }
        else if view.is_empty() {
            return Err(QuicError::arg_value("view", "must not be empty while the stream is readable"));
        }
        if view.offset != expected_offset {
            return Err(QuicError::out_of_range("view.byte_offset", view.offset, &expected_offset.to_string()));
        }
        if view.buffer.len() != buffer_len {
            return Err(QuicError::out_of_range("view.buffer_len", view.buffer.len(), &buffer_len.to_string()));
        }
        if view.len > remaining {
            return Err(QuicError::out_of_range("view.len", view.len, &format!("[0, {}]", remaining)));
        }

        let bytes_written = view.len;
        if let Some(first) = inner.pending_pull_intos.front_mut() {
            first.buffer = Some(view.buffer);
        }
        inner.respond_internal(bytes_written);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn new_stream() -> (ByteStream, ByteStreamController) {
        ByteStream::new(ByteStreamOptions::default(), None)
    }

    fn take<T>(pending: &mut PendingRead<T>) -> ReadOutcome<T> {
        pending.try_take().expect("read should be settled")
    }

    #[test]
    fn test_default_read_queued_and_pending() {
        let (stream, controller) = new_stream();
        controller.enqueue(Bytes::from_static(b"ab")).unwrap();

        let reader = stream.get_reader().unwrap();
        let mut first = reader.read();
        assert_eq!(take(&mut first).unwrap(), ReadResult { value: Some(Bytes::from_static(b"ab")), done: false });

        let mut second = reader.read();
        assert!(second.try_take().is_none());
        controller.enqueue(Bytes::from_static(b"cd")).unwrap();
        assert_eq!(take(&mut second).unwrap().value, Some(Bytes::from_static(b"cd")));
    }

    #[test]
    fn test_second_reader_is_invalid_state() {
        let (stream, _controller) = new_stream();
        let _reader = stream.get_reader().unwrap();
        assert!(matches!(stream.get_byob_reader(), Err(QuicError::InvalidState(_))));
        assert!(matches!(stream.get_reader(), Err(QuicError::InvalidState(_))));
    }

    #[test]
    fn test_reader_drop_unlocks() {
        let (stream, _controller) = new_stream();
        drop(stream.get_reader().unwrap());
        assert!(!stream.is_locked());
        assert!(stream.get_byob_reader().is_ok());
    }

    #[rstest]
    #[case::default_reader(false)]
    #[case::byob_reader(true)]
    fn test_terminal_read_is_idempotent(#[case] byob: bool) {
        let (stream, controller) = new_stream();
        controller.close().unwrap();

        if byob {
            let reader = stream.get_byob_reader().unwrap();
            for _ in 0..3 {
                let view = ByteView::new(vec![0; 4]);
                let addr = view.storage_addr();
                let result = take(&mut reader.read(view)).unwrap();
                assert!(result.done);
                let value = result.value.unwrap();
                assert_eq!(value.len(), 0);
                assert_eq!(value.storage_addr(), addr);
            }
        }
        else {
            let reader = stream.get_reader().unwrap();
            for _ in 0..3 {
                assert_eq!(take(&mut reader.read()).unwrap(), ReadResult { value: None, done: true });
            }
        }
    }

    #[rstest]
    #[case::empty(0)]
    #[case::partial(3)]
    #[case::full(8)]
    fn test_byob_fill_exactness(#[case] k: usize) {
        let (stream, controller) = new_stream();
        let reader = stream.get_byob_reader().unwrap();

        let view = ByteView::with_range(vec![0; 12], 2, 8).unwrap();
        let addr = view.storage_addr();
        let mut pending = reader.read(view);

        let request = controller.byob_request().unwrap();
        assert_eq!(request.view_len().unwrap(), 8);
        assert_eq!(request.fill(&[7u8; 8][..k]).unwrap(), k);

        if k == 0 {
            assert!(matches!(request.respond(0), Err(QuicError::InvalidArgValue { .. })));
            return;
        }
        request.respond(k).unwrap();

        let result = take(&mut pending).unwrap();
        assert!(!result.done);
        let value = result.value.unwrap();
        assert_eq!(value.len(), k);
        assert_eq!(value.byte_offset(), 2);
        assert_eq!(value.storage_addr(), addr);
        assert_eq!(value.as_slice(), &vec![7u8; k][..]);
    }

    #[test]
    fn test_respond_beyond_capacity_is_out_of_range() {
        let (stream, controller) = new_stream();
        let reader = stream.get_byob_reader().unwrap();
        let _pending = reader.read(ByteView::new(vec![0; 4]));

        let request = controller.byob_request().unwrap();
        assert!(matches!(request.respond(5), Err(QuicError::OutOfRange { .. })));
        // the failed respond does not consume the request
        assert!(request.respond(4).is_ok());
    }

    #[test]
    fn test_release_then_fulfill_handoff() {
        let (stream, controller) = new_stream();

        let reader1 = stream.get_byob_reader().unwrap();
        let mut read1 = reader1.read(ByteView::new(vec![0; 4]));
        let request = controller.byob_request().unwrap();

        reader1.release();
        assert_eq!(take(&mut read1), Err(QuicError::ReaderReleased));

        let reader2 = stream.get_byob_reader().unwrap();
        let view_b = ByteView::new(vec![0; 4]);
        let addr_b = view_b.storage_addr();
        let mut read2 = reader2.read(view_b);
        assert!(read2.try_take().is_none());

        // the request still refers to reader1's view
        assert_eq!(request.fill(b"xyz").unwrap(), 3);
        request.respond(3).unwrap();

        let result = take(&mut read2).unwrap();
        let value = result.value.unwrap();
        assert_eq!(value.as_slice(), b"xyz");
        assert_eq!(value.storage_addr(), addr_b);
    }

    #[test]
    fn test_double_respond_is_sequencing_error() {
        let (stream, controller) = new_stream();
        let reader = stream.get_byob_reader().unwrap();
        let _pending = reader.read(ByteView::new(vec![0; 4]));

        let request = controller.byob_request().unwrap();
        request.respond(1).unwrap();
        assert!(matches!(request.respond(1), Err(QuicError::Sequencing(_))));
        assert!(matches!(request.respond_with_new_view(ByteView::new(vec![0; 4])), Err(QuicError::Sequencing(_))));
    }

    #[test]
    fn test_respond_after_close() {
        let (stream, controller) = new_stream();
        let reader = stream.get_byob_reader().unwrap();
        let view = ByteView::new(vec![0; 4]);
        let addr = view.storage_addr();
        let mut pending = reader.read(view);

        let request = controller.byob_request().unwrap();
        controller.close().unwrap();
        assert!(pending.try_take().is_none());

        assert!(matches!(request.respond(1), Err(QuicError::Sequencing(_))));
        request.respond(0).unwrap();
        assert!(matches!(request.respond(0), Err(QuicError::Sequencing(_))));

        let result = take(&mut pending).unwrap();
        assert!(result.done);
        let value = result.value.unwrap();
        assert!(value.is_empty());
        assert_eq!(value.storage_addr(), addr);
    }

    #[test]
    fn test_respond_after_cancel_and_error() {
        let (stream, controller) = new_stream();
        let reader = stream.get_byob_reader().unwrap();
        let mut pending = reader.read(ByteView::new(vec![0; 4]));
        let request = controller.byob_request().unwrap();

        reader.cancel("not interested").unwrap();
        assert_eq!(take(&mut pending).unwrap(), ReadResult { value: None, done: true });
        assert!(matches!(request.respond(1), Err(QuicError::Sequencing(_))));

        let (stream, controller) = new_stream();
        let reader = stream.get_byob_reader().unwrap();
        let mut pending = reader.read(ByteView::new(vec![0; 4]));
        let request = controller.byob_request().unwrap();
        controller.error(QuicError::StreamReset(7));
        assert_eq!(take(&mut pending), Err(QuicError::StreamReset(7)));
        assert!(matches!(request.respond(1), Err(QuicError::Sequencing(_))));
    }

    #[rstest]
    #[case::default_reader(false)]
    #[case::byob_reader(true)]
    fn test_abort_rejects_pending_then_reads_are_done(#[case] byob: bool) {
        let (stream, controller) = new_stream();

        if byob {
            let reader = stream.get_byob_reader().unwrap();
            let mut pending = reader.read(ByteView::new(vec![0; 64]));
            controller.abort(QuicError::StreamReset(3));
            assert_eq!(take(&mut pending), Err(QuicError::StreamReset(3)));
            assert!(controller.byob_request().is_none());

            for _ in 0..3 {
                let view = ByteView::new(vec![0; 4]);
                let addr = view.storage_addr();
                let result = take(&mut reader.read(view)).unwrap();
                assert!(result.done);
                let value = result.value.unwrap();
                assert_eq!(value.len(), 0);
                assert_eq!(value.storage_addr(), addr);
            }
        }
        else {
            let reader = stream.get_reader().unwrap();
            let mut pending = reader.read();
            controller.abort(QuicError::StreamReset(3));
            assert_eq!(take(&mut pending), Err(QuicError::StreamReset(3)));

            for _ in 0..3 {
                assert_eq!(take(&mut reader.read()).unwrap(), ReadResult { value: None, done: true });
            }
        }
        assert_eq!(stream.state(), ByteStreamState::Closed);
    }

    #[test]
    fn test_abort_discards_queued_data() {
        let (stream, controller) = new_stream();
        controller.enqueue(Bytes::from_static(b"never read")).unwrap();
        controller.abort(QuicError::Aborted("gone".to_string()));
        assert_eq!(controller.queue_total_size(), 0);

        let reader = stream.get_reader().unwrap();
        assert_eq!(take(&mut reader.read()).unwrap(), ReadResult { value: None, done: true });
        // aborting again changes nothing
        controller.abort(QuicError::StreamReset(1));
        assert_eq!(stream.state(), ByteStreamState::Closed);
    }

    #[test]
    fn test_respond_with_new_view() {
        let (stream, controller) = new_stream();
        let reader = stream.get_byob_reader().unwrap();
        let mut pending = reader.read(ByteView::with_range(vec![0; 6], 1, 4).unwrap());

        let request = controller.byob_request().unwrap();
        let mut view = request.take_view().unwrap();
        assert!(matches!(request.respond(1), Err(QuicError::Sequencing(_))));
        assert_eq!(view.len(), 4);
        view.as_mut_slice()[..2].copy_from_slice(b"hi");

        let wrong_offset = ByteView::with_range(vec![0; 6], 0, 2).unwrap();
        assert!(matches!(request.respond_with_new_view(wrong_offset), Err(QuicError::OutOfRange { .. })));

        let answer = ByteView::with_range(view.into_buffer(), 1, 2).unwrap();
        request.respond_with_new_view(answer).unwrap();

        let value = take(&mut pending).unwrap().value.unwrap();
        assert_eq!(value.as_slice(), b"hi");
        assert_eq!(value.byte_offset(), 1);
    }

    #[test]
    fn test_byob_read_from_queue_and_min() {
        let (stream, controller) = new_stream();
        controller.enqueue(Bytes::from_static(b"abc")).unwrap();

        let reader = stream.get_byob_reader().unwrap();
        let mut pending = reader.read_with_min(ByteView::new(vec![0; 5]), 5);
        assert!(pending.try_take().is_none());
        assert_eq!(controller.queue_total_size(), 0);

        controller.enqueue(Bytes::from_static(b"defg")).unwrap();
        let value = take(&mut pending).unwrap().value.unwrap();
        assert_eq!(value.as_slice(), b"abcde");
        assert_eq!(controller.queue_total_size(), 2);

        let value = take(&mut reader.read(ByteView::new(vec![0; 5]))).unwrap().value.unwrap();
        assert_eq!(value.as_slice(), b"fg");
    }

    #[rstest]
    #[case::empty_view(ByteView::new(vec![]), 1, "InvalidArgType")]
    #[case::zero_min(ByteView::new(vec![0; 2]), 0, "InvalidArgType")]
    #[case::min_too_big(ByteView::new(vec![0; 2]), 3, "OutOfRange")]
    fn test_byob_read_argument_errors(#[case] view: ByteView, #[case] min: usize, #[case] expected: &str) {
        let (stream, _controller) = new_stream();
        let reader = stream.get_byob_reader().unwrap();
        let kind = match take(&mut reader.read_with_min(view, min)) {
            Err(QuicError::InvalidArgType { .. }) => "InvalidArgType",
            Err(QuicError::OutOfRange { .. }) => "OutOfRange",
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(kind, expected);
    }

    #[test]
    fn test_close_with_queued_data_drains_first() {
        let (stream, controller) = new_stream();
        controller.enqueue(Bytes::from_static(b"x")).unwrap();
        controller.close().unwrap();
        assert!(matches!(controller.enqueue(Bytes::from_static(b"y")), Err(QuicError::Sequencing(_))));
        assert_eq!(stream.state(), ByteStreamState::Readable);

        let reader = stream.get_reader().unwrap();
        assert_eq!(take(&mut reader.read()).unwrap().value, Some(Bytes::from_static(b"x")));
        assert_eq!(stream.state(), ByteStreamState::Closed);
        assert!(take(&mut reader.read()).unwrap().done);
    }

    #[test]
    fn test_read_on_released_reader() {
        let (stream, _controller) = new_stream();
        let reader = stream.get_reader().unwrap();
        reader.release();
        assert_eq!(take(&mut reader.read()), Err(QuicError::ReaderReleased));
        assert_eq!(reader.cancel("x"), Err(QuicError::ReaderReleased));
    }

    #[test]
    fn test_auto_allocate_default_read() {
        let (stream, controller) = ByteStream::new(ByteStreamOptions {
            high_water_mark: 0,
            auto_allocate_chunk_size: Some(16),
        }, None);
        let reader = stream.get_reader().unwrap();
        let mut pending = reader.read();

        let request = controller.byob_request().unwrap();
        assert_eq!(request.view_len().unwrap(), 16);
        request.fill(b"auto").unwrap();
        request.respond(4).unwrap();
        assert_eq!(take(&mut pending).unwrap().value, Some(Bytes::from_static(b"auto")));
    }

    struct CountingSource {
        pulls: AtomicUsize,
        cancels: AtomicUsize,
    }
    impl ByteSource for CountingSource {
        fn pull(&self) {
            self.pulls.fetch_add(1, Ordering::SeqCst);
        }
        fn cancel(&self, _reason: &str) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_source_callbacks() {
        let source = Arc::new(CountingSource { pulls: AtomicUsize::new(0), cancels: AtomicUsize::new(0) });
        let (stream, controller) = ByteStream::new(ByteStreamOptions::default(), Some(source.clone()));

        controller.enqueue(Bytes::from_static(b"abc")).unwrap();
        assert_eq!(source.pulls.load(Ordering::SeqCst), 0);

        let reader = stream.get_reader().unwrap();
        let _ = reader.read();
        assert_eq!(source.pulls.load(Ordering::SeqCst), 1);

        reader.cancel("done").unwrap();
        assert_eq!(source.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(stream.state(), ByteStreamState::Closed);
    }

    #[test]
    fn test_desired_size() {
        let (stream, controller) = ByteStream::new(ByteStreamOptions { high_water_mark: 4, auto_allocate_chunk_size: None }, None);
        assert_eq!(stream.desired_size(), Some(4));
        controller.enqueue(Bytes::from_static(b"abcdef")).unwrap();
        assert_eq!(stream.desired_size(), Some(-2));
        controller.error(QuicError::Aborted("x".to_string()));
        assert_eq!(stream.desired_size(), None);
    }

    #[test]
    fn test_pending_read_as_future() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (stream, controller) = new_stream();
            let reader = stream.get_reader().unwrap();
            let pending = reader.read();
            tokio::spawn(async move {
                controller.enqueue(Bytes::from_static(b"later")).unwrap();
            });
            assert_eq!(pending.await.unwrap().value, Some(Bytes::from_static(b"later")));
        });
    }
}
