use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::QuicError;
use crate::range_set::RangeSet;
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// Resolves once all data of a write (and of all earlier writes on the same stream) is
///  acknowledged by the peer, or fails if the stream is reset or destroyed first.
pub struct WriteAck {
    rx: oneshot::Receiver<Result<(), QuicError>>,
}

impl WriteAck {
    pub(crate) fn ready(result: Result<(), QuicError>) -> WriteAck {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        WriteAck { rx }
    }

    /// the result if it is already available
    pub fn try_take(&mut self) -> Option<Result<(), QuicError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Self::dropped())),
        }
    }

    fn dropped() -> QuicError {
        QuicError::Aborted("the stream was dropped".to_string())
    }
}

impl Future for WriteAck {
    type Output = Result<(), QuicError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Self::dropped())),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum FinState {
    Open,
    /// `finish` was called, and the FIN still has to be sent (or was lost)
    Queued,
    Sent,
    Acked,
}

/// A chunk of stream data to put into a STREAM frame
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Segment {
    pub offset: u64,
    pub data: Bytes,
    pub fin: bool,
    /// bytes that were never sent before, i.e. that count against connection level flow control
    pub new_bytes: u64,
}

/// The outbound half of a stream: data waiting to be sent (or re-sent), flow control credit
///  granted by the peer, and acknowledgement tracking.
///
/// Data is not retained after it is sent; a lost STREAM frame carries its data back in via
///  [SendBuffer::on_lost]. Acknowledgements are tracked per byte range, and the waiters of
///  writes are resolved strictly in write order based on the contiguously acknowledged prefix -
///  so an ACK for a later packet never resolves a later write before an earlier one.
///
/// The FIN counts as one virtual byte at offset `final_size` for acknowledgement tracking.
pub struct SendBuffer {
    pending: BTreeMap<u64, Bytes>,
    write_offset: u64,
    /// highest offset ever sent - everything below was sent at least once
    sent_offset: u64,
    /// peer-granted limit for this stream (MAX_STREAM_DATA)
    max_stream_data: u64,
    acked: RangeSet,
    fin: FinState,
    waiters: VecDeque<(u64, oneshot::Sender<Result<(), QuicError>>)>,
}

impl SendBuffer {
    pub fn new(max_stream_data: u64) -> SendBuffer {
        SendBuffer {
            pending: BTreeMap::new(),
            write_offset: 0,
            sent_offset: 0,
            max_stream_data,
            acked: RangeSet::new(),
            fin: FinState::Open,
            waiters: VecDeque::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.fin != FinState::Open
    }

    pub fn write(&mut self, data: Bytes) -> WriteAck {
        if !data.is_empty() {
            self.pending.insert(self.write_offset, data.clone());
            self.write_offset += data.len().safe_cast();
        }
        self.add_waiter(self.write_offset)
    }

    /// queue the FIN after all data written so far
    pub fn finish(&mut self) -> WriteAck {
        if self.fin == FinState::Open {
            self.fin = FinState::Queued;
        }
        self.add_waiter(self.write_offset + 1)
    }

    fn add_waiter(&mut self, end: u64) -> WriteAck {
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back((end, tx));
        self.resolve_waiters();
        WriteAck { rx }
    }

    pub fn final_size(&self) -> u64 {
        self.write_offset
    }

    /// offset up to which new data may be sent
    pub fn max_stream_data(&self) -> u64 {
        self.max_stream_data
    }

    /// returns true if the limit was raised
    pub fn raise_max_stream_data(&mut self, max: u64) -> bool {
        if max > self.max_stream_data {
            self.max_stream_data = max;
            true
        }
        else {
            false
        }
    }

    /// true if there is something that could be sent if there were credit
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || self.fin == FinState::Queued
    }

    /// true if there is pending data, but the stream's flow control credit does not allow sending
    ///  any of it
    pub fn is_blocked(&self) -> bool {
        match self.pending.first_key_value() {
            Some((&offset, _)) => offset >= self.sent_offset && self.sent_offset >= self.max_stream_data,
            None => false,
        }
    }

    /// Take the next segment of at most `max_len` data bytes, sending at most `connection_credit`
    ///  bytes that were never sent before.
    pub fn next_segment(&mut self, max_len: usize, connection_credit: u64) -> Option<Segment> {
        if let Some((&offset, _)) = self.pending.first_key_value() {
            let data = self.pending.remove(&offset)?;
            let end = offset + data.len().safe_cast();

            let allowed_end = if end > self.sent_offset {
                let new_data_limit = self.max_stream_data.min(self.sent_offset + connection_credit);
                self.sent_offset.max(offset).max(new_data_limit.min(end))
            }
            else {
                end
            };
            let allowed_end = allowed_end.min(offset + max_len.safe_cast());

            if allowed_end <= offset {
                self.pending.insert(offset, data);
                return None;
            }

            let len: usize = (allowed_end - offset).prechecked_cast();
            let mut data = data;
            if len < data.len() {
                let rest = data.split_off(len);
                self.pending.insert(allowed_end, rest);
            }

            let new_bytes = allowed_end.saturating_sub(self.sent_offset.max(offset));
            self.sent_offset = self.sent_offset.max(allowed_end);

            let fin = self.fin == FinState::Queued && self.pending.is_empty() && allowed_end == self.write_offset;
            if fin {
                self.fin = FinState::Sent;
            }
            return Some(Segment { offset, data, fin, new_bytes });
        }

        if self.fin == FinState::Queued {
            self.fin = FinState::Sent;
            return Some(Segment {
                offset: self.write_offset,
                data: Bytes::new(),
                fin: true,
                new_bytes: 0,
            });
        }
        None
    }

    pub fn on_acked(&mut self, offset: u64, len: u64, fin: bool) {
        self.acked.insert(offset..offset + len);
        if fin {
            self.acked.insert_one(self.write_offset);
            self.fin = FinState::Acked;
        }
        self.resolve_waiters();
    }

    /// a STREAM frame was lost: queue whatever of it is not acknowledged for resending
    pub fn on_lost(&mut self, offset: u64, data: Bytes, fin: bool) {
        let end = offset + data.len().safe_cast();
        if !data.is_empty() && self.acked.contiguous_end(offset) < end {
            self.pending.entry(offset).or_insert(data);
        }
        if fin && self.fin == FinState::Sent {
            self.fin = FinState::Queued;
        }
    }

    fn resolve_waiters(&mut self) {
        let acked_end = self.acked.contiguous_end(0);
        while let Some((end, _)) = self.waiters.front() {
            if *end > acked_end {
                break;
            }
            if let Some((_, tx)) = self.waiters.pop_front() {
                let _ = tx.send(Ok(()));
            }
        }
    }

    /// Abort sending: pending writes fail with `err`, nothing more is sent. Returns the final size
    ///  for the RESET_STREAM frame, i.e. the amount of data that was sent.
    pub fn reset(&mut self, err: QuicError) -> u64 {
        self.pending.clear();
        self.fin = FinState::Acked;
        for (_, tx) in self.waiters.drain(..) {
            let _ = tx.send(Err(err.clone()));
        }
        self.sent_offset
    }

    /// everything that was written is acknowledged, including the FIN
    pub fn is_fully_acked(&self) -> bool {
        self.fin == FinState::Acked && self.waiters.is_empty()
    }

    pub fn num_waiters(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn seg(offset: u64, data: &'static [u8], fin: bool, new_bytes: u64) -> Segment {
        Segment { offset, data: Bytes::from_static(data), fin, new_bytes }
    }

    #[test]
    fn test_fifo_acks_under_reordering() {
        let mut buf = SendBuffer::new(1000);
        let mut ack1 = buf.write(Bytes::from_static(b"aaa"));
        let mut ack2 = buf.write(Bytes::from_static(b"bbb"));
        let mut ack3 = buf.write(Bytes::from_static(b"ccc"));

        assert_eq!(buf.next_segment(3, 1000), Some(seg(0, b"aaa", false, 3)));
        assert_eq!(buf.next_segment(3, 1000), Some(seg(3, b"bbb", false, 3)));
        assert_eq!(buf.next_segment(3, 1000), Some(seg(6, b"ccc", false, 3)));

        buf.on_acked(6, 3, false);
        buf.on_acked(3, 3, false);
        assert!(ack1.try_take().is_none());
        assert!(ack2.try_take().is_none());
        assert!(ack3.try_take().is_none());

        buf.on_acked(0, 3, false);
        assert_eq!(ack1.try_take(), Some(Ok(())));
        assert_eq!(ack2.try_take(), Some(Ok(())));
        assert_eq!(ack3.try_take(), Some(Ok(())));
    }

    #[test]
    fn test_lost_data_is_resent() {
        let mut buf = SendBuffer::new(1000);
        let mut ack = buf.write(Bytes::from_static(b"hello"));
        let segment = buf.next_segment(100, 1000).unwrap();
        assert_eq!(buf.next_segment(100, 1000), None);

        buf.on_lost(segment.offset, segment.data.clone(), segment.fin);
        assert_eq!(buf.next_segment(100, 1000), Some(seg(0, b"hello", false, 0)));

        buf.on_acked(0, 5, false);
        assert_eq!(ack.try_take(), Some(Ok(())));

        // a late loss report for acknowledged data is ignored
        buf.on_lost(0, Bytes::from_static(b"hello"), false);
        assert!(!buf.has_pending());
    }

    #[rstest]
    #[case::stream_credit(4, 100, 4)]
    #[case::connection_credit(100, 2, 2)]
    #[case::max_len(100, 100, 6)]
    fn test_flow_control_limits(#[case] max_stream_data: u64, #[case] connection_credit: u64, #[case] expected_len: usize) {
        let mut buf = SendBuffer::new(max_stream_data);
        let _ack = buf.write(Bytes::from_static(b"0123456789"));
        let segment = buf.next_segment(6, connection_credit).unwrap();
        assert_eq!(segment.offset, 0);
        assert_eq!(segment.data.len(), expected_len);
        assert_eq!(segment.new_bytes, expected_len as u64);
        assert!(buf.has_pending());
    }

    #[test]
    fn test_blocked_until_credit_is_raised() {
        let mut buf = SendBuffer::new(3);
        let _ack = buf.write(Bytes::from_static(b"abcdef"));
        assert_eq!(buf.next_segment(100, 100), Some(seg(0, b"abc", false, 3)));
        assert_eq!(buf.next_segment(100, 100), None);
        assert!(buf.is_blocked());

        assert!(buf.raise_max_stream_data(10));
        assert!(!buf.raise_max_stream_data(5));
        assert_eq!(buf.next_segment(100, 100), Some(seg(3, b"def", false, 3)));
    }

    #[test]
    fn test_fin_with_last_data_and_fin_ack() {
        let mut buf = SendBuffer::new(1000);
        let mut data_ack = buf.write(Bytes::from_static(b"xy"));
        let mut fin_ack = buf.finish();
        assert!(buf.is_finished());

        assert_eq!(buf.next_segment(100, 100), Some(seg(0, b"xy", true, 2)));
        assert_eq!(buf.next_segment(100, 100), None);

        buf.on_acked(0, 2, false);
        assert_eq!(data_ack.try_take(), Some(Ok(())));
        assert!(fin_ack.try_take().is_none());

        buf.on_acked(0, 2, true);
        assert_eq!(fin_ack.try_take(), Some(Ok(())));
        assert!(buf.is_fully_acked());
    }

    #[test]
    fn test_lost_fin_is_resent_alone() {
        let mut buf = SendBuffer::new(1000);
        let _ack = buf.write(Bytes::from_static(b"xy"));
        let _ack = buf.finish();
        let segment = buf.next_segment(100, 100).unwrap();
        buf.on_acked(0, 2, false);
        buf.on_lost(segment.offset, segment.data, true);

        assert_eq!(buf.next_segment(100, 100), Some(seg(2, b"", true, 0)));
    }

    #[test]
    fn test_reset_rejects_pending_writes() {
        let mut buf = SendBuffer::new(1000);
        let mut ack = buf.write(Bytes::from_static(b"abc"));
        let _ = buf.next_segment(2, 100);

        assert_eq!(buf.reset(QuicError::StreamReset(3)), 2);
        assert_eq!(ack.try_take(), Some(Err(QuicError::StreamReset(3))));
        assert!(!buf.has_pending());
    }

    #[test]
    fn test_empty_write_resolves_with_prefix() {
        let mut buf = SendBuffer::new(1000);
        let mut ack = buf.write(Bytes::new());
        assert_eq!(ack.try_take(), Some(Ok(())));
    }
}
