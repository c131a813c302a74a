use std::ops::Range;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes};
use bytes_varint::VarIntSupportMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::buf_ext::{put_bytes, put_string, try_get_bytes, try_get_string, try_get_varint, try_get_varint_usize};
use crate::error::ErrorSource;
use crate::stream_id::{Direction, StreamId};

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
enum FrameType {
    Ping = 0x01,
    Ack = 0x02,
    ResetStream = 0x04,
    StopSending = 0x05,
    Crypto = 0x06,
    SessionTicket = 0x07,
    Stream = 0x08,
    MaxData = 0x10,
    MaxStreamData = 0x11,
    MaxStreams = 0x12,
    PathChallenge = 0x1a,
    PathResponse = 0x1b,
    ConnectionClose = 0x1c,
    HandshakeDone = 0x1e,
    Datagram = 0x30,
    Headers = 0x40,
}

/// The kinds of header blocks an HTTP/3 style layer attaches to a stream. The engine transports
///  them without interpreting them.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum HeadersKind {
    Initial = 0,
    Informational = 1,
    Trailing = 2,
    Push = 3,
}

pub type HeaderList = Vec<(String, String)>;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    Ping,
    /// acknowledged packet number ranges, highest first
    Ack { ranges: Vec<Range<u64>> },
    ResetStream { id: StreamId, code: u64, final_size: u64 },
    StopSending { id: StreamId, code: u64 },
    /// a complete handshake message, `seq` numbering the messages of one side from zero
    Crypto { seq: u64, data: Bytes },
    SessionTicket { ticket: Bytes },
    Stream { id: StreamId, offset: u64, fin: bool, data: Bytes },
    MaxData { max: u64 },
    MaxStreamData { id: StreamId, max: u64 },
    MaxStreams { direction: Direction, max: u64 },
    PathChallenge { data: [u8; 8] },
    PathResponse { data: [u8; 8] },
    ConnectionClose { source: ErrorSource, code: u64, reason: String },
    HandshakeDone,
    Datagram { data: Bytes },
    Headers { id: StreamId, kind: HeadersKind, headers: HeaderList },
}

impl Frame {
    /// Upper bound for the bytes a STREAM frame adds on top of its data
    pub const STREAM_FRAME_OVERHEAD: usize = 1 + 9 + 10 + 1 + 10;
    /// Upper bound for the bytes a DATAGRAM frame adds on top of its data
    pub const DATAGRAM_FRAME_OVERHEAD: usize = 1 + 10;

    /// Everything except ACK and CONNECTION_CLOSE makes the receiver send an ACK
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(self, Frame::Ack { .. } | Frame::ConnectionClose { .. })
    }

    /// Frames that are sent again if the packet carrying them is lost. Datagrams are unreliable
    ///  by definition, and PING / path probes are only meaningful when they are fresh.
    pub fn is_retransmittable(&self) -> bool {
        !matches!(self,
            Frame::Ack { .. } |
            Frame::ConnectionClose { .. } |
            Frame::Datagram { .. } |
            Frame::Ping |
            Frame::PathChallenge { .. } |
            Frame::PathResponse { .. }
        )
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            Frame::Ping => {
                buf.put_u8(FrameType::Ping.into());
            }
            Frame::Ack { ranges } => {
                buf.put_u8(FrameType::Ack.into());
                buf.put_usize_varint(ranges.len());
                for range in ranges {
                    buf.put_u64_varint(range.start);
                    buf.put_u64_varint(range.end - range.start);
                }
            }
            Frame::ResetStream { id, code, final_size } => {
                buf.put_u8(FrameType::ResetStream.into());
                buf.put_u64_varint(id.raw());
                buf.put_u64_varint(*code);
                buf.put_u64_varint(*final_size);
            }
            Frame::StopSending { id, code } => {
                buf.put_u8(FrameType::StopSending.into());
                buf.put_u64_varint(id.raw());
                buf.put_u64_varint(*code);
            }
            Frame::Crypto { seq, data } => {
                buf.put_u8(FrameType::Crypto.into());
                buf.put_u64_varint(*seq);
                put_bytes(buf, data);
            }
            Frame::SessionTicket { ticket } => {
                buf.put_u8(FrameType::SessionTicket.into());
                put_bytes(buf, ticket);
            }
            Frame::Stream { id, offset, fin, data } => {
                buf.put_u8(FrameType::Stream.into());
                buf.put_u64_varint(id.raw());
                buf.put_u64_varint(*offset);
                buf.put_u8(if *fin { 1 } else { 0 });
                put_bytes(buf, data);
            }
            Frame::MaxData { max } => {
                buf.put_u8(FrameType::MaxData.into());
                buf.put_u64_varint(*max);
            }
            Frame::MaxStreamData { id, max } => {
                buf.put_u8(FrameType::MaxStreamData.into());
                buf.put_u64_varint(id.raw());
                buf.put_u64_varint(*max);
            }
            Frame::MaxStreams { direction, max } => {
                buf.put_u8(FrameType::MaxStreams.into());
                buf.put_u8(match direction {
                    Direction::Bidi => 0,
                    Direction::Uni => 1,
                });
                buf.put_u64_varint(*max);
            }
            Frame::PathChallenge { data } => {
                buf.put_u8(FrameType::PathChallenge.into());
                buf.put_slice(data);
            }
            Frame::PathResponse { data } => {
                buf.put_u8(FrameType::PathResponse.into());
                buf.put_slice(data);
            }
            Frame::ConnectionClose { source, code, reason } => {
                buf.put_u8(FrameType::ConnectionClose.into());
                buf.put_u8(match source {
                    ErrorSource::Transport => 0,
                    ErrorSource::Application => 1,
                });
                buf.put_u64_varint(*code);
                put_string(buf, reason);
            }
            Frame::HandshakeDone => {
                buf.put_u8(FrameType::HandshakeDone.into());
            }
            Frame::Datagram { data } => {
                buf.put_u8(FrameType::Datagram.into());
                put_bytes(buf, data);
            }
            Frame::Headers { id, kind, headers } => {
                buf.put_u8(FrameType::Headers.into());
                buf.put_u64_varint(id.raw());
                buf.put_u8((*kind).into());
                buf.put_usize_varint(headers.len());
                for (name, value) in headers {
                    put_string(buf, name);
                    put_string(buf, value);
                }
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Frame> {
        let frame_type = FrameType::try_from(buf.try_get_u8()?)
            .map_err(|e| anyhow!("unknown frame type: {}", e))?;

        let frame = match frame_type {
            FrameType::Ping => Frame::Ping,
            FrameType::Ack => {
                let num_ranges = try_get_varint_usize(buf)?;
                let mut ranges = Vec::with_capacity(num_ranges);
                for _ in 0..num_ranges {
                    let start = try_get_varint(buf)?;
                    let len = try_get_varint(buf)?;
                    let end = start.checked_add(len)
                        .ok_or_else(|| anyhow!("ACK range overflow"))?;
                    ranges.push(start..end);
                }
                Frame::Ack { ranges }
            }
            FrameType::ResetStream => Frame::ResetStream {
                id: StreamId::from_raw(try_get_varint(buf)?)?,
                code: try_get_varint(buf)?,
                final_size: try_get_varint(buf)?,
            },
            FrameType::StopSending => Frame::StopSending {
                id: StreamId::from_raw(try_get_varint(buf)?)?,
                code: try_get_varint(buf)?,
            },
            FrameType::Crypto => Frame::Crypto { seq: try_get_varint(buf)?, data: try_get_bytes(buf)? },
            FrameType::SessionTicket => Frame::SessionTicket { ticket: try_get_bytes(buf)? },
            FrameType::Stream => {
                let id = StreamId::from_raw(try_get_varint(buf)?)?;
                let offset = try_get_varint(buf)?;
                let fin = match buf.try_get_u8()? {
                    0 => false,
                    1 => true,
                    other => bail!("invalid FIN marker {}", other),
                };
                let data = try_get_bytes(buf)?;
                Frame::Stream { id, offset, fin, data }
            }
            FrameType::MaxData => Frame::MaxData { max: try_get_varint(buf)? },
            FrameType::MaxStreamData => Frame::MaxStreamData {
                id: StreamId::from_raw(try_get_varint(buf)?)?,
                max: try_get_varint(buf)?,
            },
            FrameType::MaxStreams => {
                let direction = match buf.try_get_u8()? {
                    0 => Direction::Bidi,
                    1 => Direction::Uni,
                    other => bail!("invalid stream direction {}", other),
                };
                Frame::MaxStreams { direction, max: try_get_varint(buf)? }
            }
            FrameType::PathChallenge => Frame::PathChallenge { data: Self::try_get_path_data(buf)? },
            FrameType::PathResponse => Frame::PathResponse { data: Self::try_get_path_data(buf)? },
            FrameType::ConnectionClose => {
                let source = match buf.try_get_u8()? {
                    0 => ErrorSource::Transport,
                    1 => ErrorSource::Application,
                    other => bail!("invalid error source {}", other),
                };
                Frame::ConnectionClose {
                    source,
                    code: try_get_varint(buf)?,
                    reason: try_get_string(buf)?,
                }
            }
            FrameType::HandshakeDone => Frame::HandshakeDone,
            FrameType::Datagram => Frame::Datagram { data: try_get_bytes(buf)? },
            FrameType::Headers => {
                let id = StreamId::from_raw(try_get_varint(buf)?)?;
                let kind = HeadersKind::try_from(buf.try_get_u8()?)
                    .map_err(|e| anyhow!("invalid headers kind: {}", e))?;
                let num_headers = try_get_varint_usize(buf)?;
                let mut headers = Vec::with_capacity(num_headers);
                for _ in 0..num_headers {
                    let name = try_get_string(buf)?;
                    let value = try_get_string(buf)?;
                    headers.push((name, value));
                }
                Frame::Headers { id, kind, headers }
            }
        };
        Ok(frame)
    }

    /// parse a packet's complete payload
    pub fn deser_all(mut payload: Bytes) -> anyhow::Result<Vec<Frame>> {
        let mut frames = Vec::new();
        while payload.has_remaining() {
            frames.push(Self::deser(&mut payload)?);
        }
        Ok(frames)
    }

    fn try_get_path_data(buf: &mut impl Buf) -> anyhow::Result<[u8; 8]> {
        if buf.remaining() < 8 {
            bail!("truncated path validation data");
        }
        let mut data = [0u8; 8];
        buf.copy_to_slice(&mut data);
        Ok(data)
    }

    pub fn serialized_len(&self) -> usize {
        let mut buf = Vec::new();
        self.ser(&mut buf);
        buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;
    use crate::stream_id::Side;

    fn sid(raw: u64) -> StreamId {
        StreamId::from_raw(raw).unwrap()
    }

    #[rstest]
    #[case::ping(Frame::Ping, vec![0x01])]
    #[case::handshake_done(Frame::HandshakeDone, vec![0x1e])]
    #[case::ack(Frame::Ack { ranges: vec![7..9, 0..3] }, vec![0x02, 2, 7, 2, 0, 3])]
    #[case::stream(Frame::Stream { id: sid(4), offset: 5, fin: true, data: Bytes::from_static(b"hi") }, vec![0x08, 4, 5, 1, 2, b'h', b'i'])]
    #[case::reset(Frame::ResetStream { id: sid(2), code: 9, final_size: 300 }, vec![0x04, 2, 9, 0xac, 0x02])]
    #[case::crypto(Frame::Crypto { seq: 1, data: Bytes::from_static(b"ab") }, vec![0x06, 1, 2, b'a', b'b'])]
    #[case::max_streams(Frame::MaxStreams { direction: Direction::Uni, max: 3 }, vec![0x12, 1, 3])]
    #[case::close(Frame::ConnectionClose { source: ErrorSource::Application, code: 1, reason: "x".to_string() }, vec![0x1c, 1, 1, 1, b'x'])]
    #[case::path(Frame::PathChallenge { data: [1, 2, 3, 4, 5, 6, 7, 8] }, vec![0x1a, 1, 2, 3, 4, 5, 6, 7, 8])]
    #[case::headers(Frame::Headers { id: sid(0), kind: HeadersKind::Push, headers: vec![("a".to_string(), "b".to_string())] }, vec![0x40, 0, 3, 1, 1, b'a', 1, b'b'])]
    fn test_ser(#[case] frame: Frame, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(frame.serialized_len(), expected.len());

        let parsed = Frame::deser_all(buf.freeze()).unwrap();
        assert_eq!(parsed, vec![frame]);
    }

    #[test]
    fn test_deser_all_multiple_frames() {
        let frames = vec![
            Frame::MaxData { max: 1_000_000 },
            Frame::StopSending { id: StreamId::new(Side::Server, Direction::Bidi, 3), code: 0 },
            Frame::Datagram { data: Bytes::from_static(&[1, 2, 3]) },
        ];
        let mut buf = BytesMut::new();
        for f in &frames {
            f.ser(&mut buf);
        }
        assert_eq!(Frame::deser_all(buf.freeze()).unwrap(), frames);
    }

    #[rstest]
    #[case::unknown_type(vec![0x77])]
    #[case::truncated_stream(vec![0x08, 4, 5, 1, 9, b'h'])]
    #[case::bad_fin(vec![0x08, 4, 5, 2, 0])]
    #[case::truncated_path(vec![0x1b, 1, 2])]
    #[case::bad_headers_kind(vec![0x40, 0, 9, 0])]
    fn test_deser_invalid(#[case] raw: Vec<u8>) {
        assert!(Frame::deser_all(Bytes::from(raw)).is_err());
    }

    #[rstest]
    #[case::ack(Frame::Ack { ranges: vec![] }, false, false)]
    #[case::close(Frame::ConnectionClose { source: ErrorSource::Transport, code: 0, reason: String::new() }, false, false)]
    #[case::ping(Frame::Ping, true, false)]
    #[case::datagram(Frame::Datagram { data: Bytes::new() }, true, false)]
    #[case::stream(Frame::Stream { id: sid(0), offset: 0, fin: false, data: Bytes::new() }, true, true)]
    #[case::max_data(Frame::MaxData { max: 1 }, true, true)]
    fn test_frame_classification(#[case] frame: Frame, #[case] ack_eliciting: bool, #[case] retransmittable: bool) {
        assert_eq!(frame.is_ack_eliciting(), ack_eliciting);
        assert_eq!(frame.is_retransmittable(), retransmittable);
    }

    #[test]
    fn test_stream_overhead_bound() {
        let frame = Frame::Stream {
            id: sid(StreamId::MAX),
            offset: u64::MAX,
            fin: true,
            data: Bytes::from(vec![0u8; 200]),
        };
        assert!(frame.serialized_len() <= 200 + Frame::STREAM_FRAME_OVERHEAD);
    }
}
