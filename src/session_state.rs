use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::byte_stream::{ByteStream, ByteStreamOptions};
use crate::config::{SessionConfig, StreamOptions};
use crate::connection_id::{ConnectionId, StatelessResetToken};
use crate::error::{CloseCode, QuicError, TransportErrorCode};
use crate::events::SessionStats;
use crate::frame::{Frame, HeaderList, HeadersKind};
use crate::handshake::{Handshake, HandshakeEvent, HandshakeProvider, SecureInfo};
use crate::packet::{Packet, PacketHeader, PacketKind};
use crate::range_set::RangeSet;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::send_buffer::{SendBuffer, WriteAck};
use crate::session::{CloseInfo, SessionEvent, SessionShared};
use crate::stream::Stream;
use crate::stream_id::{Direction, Side, StreamId, StreamIdAllocator};
use crate::stream_state::{HalfState, RecvState, StreamEvent, StreamShared, StreamSource, StreamState};
use crate::transport_params::TransportParams;

/// The phases of a session. They only move forward, except for Secure <-> Migrating.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum SessionPhase {
    Initial,
    Handshaking,
    Secure,
    Migrating,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum HandshakeStatus {
    Pending,
    Secure(SecureInfo),
    Failed(QuicError),
}

/// One outbound datagram
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Transmit {
    pub to: SocketAddr,
    pub payload: Bytes,
}

struct SentPacket {
    time: Instant,
    /// the retransmittable frames of the packet
    frames: Vec<Frame>,
}

/// Everything a session state machine needs to be created
pub(crate) struct SessionSetup {
    pub side: Side,
    pub config: SessionConfig,
    pub handshake_provider: Arc<dyn HandshakeProvider>,
    pub local_cid: ConnectionId,
    pub remote_cid: ConnectionId,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub local_reset_token: StatelessResetToken,
    pub max_payload_size: usize,
    pub weak_self: Weak<SessionShared>,
}

/// The receiving ends for what a session state machine reports to the outside
pub(crate) struct SessionChannels {
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub handshake: watch::Receiver<HandshakeStatus>,
    pub closed: watch::Receiver<bool>,
}

const MAX_ACK_RANGES: usize = 16;
/// packet numbers further back than this are forgotten for duplicate detection and ACKs
const RECEIVED_PACKETS_HISTORY: u64 = 10_000;

/// The synchronous state machine of a session. It is driven from three places: datagrams from
///  the endpoint's receive loop ([SessionInner::on_packet]), timers in the session's driver task
///  ([SessionInner::on_timeout]), and application calls. Output is collected in
///  [SessionInner::poll_transmits] and sent by the driver.
///
/// This struct never calls consumer-side byte stream operations: reads only happen in
///  application code, outside of the session lock.
pub(crate) struct SessionInner {
    side: Side,
    phase: SessionPhase,
    config: SessionConfig,
    max_payload_size: usize,

    local_cid: ConnectionId,
    remote_cid: ConnectionId,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    local_reset_token: StatelessResetToken,
    peer_reset_token: Option<StatelessResetToken>,

    handshake: Box<dyn Handshake>,
    /// clients use Initial packets until they hear from the server
    received_from_peer: bool,
    crypto_send_seq: u64,
    crypto_recv_seq: u64,
    crypto_reorder: BTreeMap<u64, Bytes>,
    local_params: TransportParams,
    remote_params: Option<TransportParams>,
    secure_info: Option<SecureInfo>,
    peer_certificate: Option<Bytes>,

    streams: FxHashMap<StreamId, StreamState>,
    allocator: StreamIdAllocator,
    /// locally opened streams that are not announced yet, in open order
    pending_streams: Vec<StreamId>,

    /// connection level flow control: what the peer allows us to send
    send_max_data: u64,
    data_sent: u64,
    /// connection level flow control: what we allow the peer to send
    recv_max_data: u64,
    recv_window: u64,
    data_received: u64,
    data_consumed: u64,

    next_packet_number: u64,
    sent_packets: BTreeMap<u64, SentPacket>,
    received_packets: RangeSet,
    ack_needed: bool,
    control_frames: VecDeque<Frame>,

    idle_timeout: Option<Duration>,
    idle_deadline: Option<Instant>,
    path_challenge: Option<[u8; 8]>,

    closing_code: Option<u64>,
    close_frame: Option<Frame>,

    events: mpsc::UnboundedSender<SessionEvent>,
    handshake_status: watch::Sender<HandshakeStatus>,
    closed: watch::Sender<bool>,
    stats: SessionStats,
    weak_self: Weak<SessionShared>,
}

impl SessionInner {
    pub fn new(setup: SessionSetup) -> (SessionInner, SessionChannels) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (handshake_tx, handshake_rx) = watch::channel(HandshakeStatus::Pending);
        let (closed_tx, closed_rx) = watch::channel(false);

        let local_params = TransportParams {
            max_idle_timeout: setup.config.idle_timeout,
            stateless_reset_token: Some(setup.local_reset_token),
            ..setup.config.transport_params.clone()
        };
        let handshake = match setup.side {
            Side::Client => setup.handshake_provider.client_session(&setup.config, &local_params),
            Side::Server => setup.handshake_provider.server_session(&setup.config, &local_params),
        };

        let mut allocator = StreamIdAllocator::new(setup.side);
        allocator.raise_limit(setup.side.peer(), Direction::Bidi, local_params.initial_max_streams_bidi);
        allocator.raise_limit(setup.side.peer(), Direction::Uni, local_params.initial_max_streams_uni);

        // a client resuming a session knows the server's limits before the handshake
        let mut send_max_data = 0;
        if setup.side == Side::Client {
            if let Some(remembered) = &setup.config.remote_transport_params {
                allocator.raise_limit(Side::Client, Direction::Bidi, remembered.initial_max_streams_bidi);
                allocator.raise_limit(Side::Client, Direction::Uni, remembered.initial_max_streams_uni);
                send_max_data = remembered.initial_max_data;
            }
        }

        let inner = SessionInner {
            side: setup.side,
            phase: SessionPhase::Initial,
            max_payload_size: setup.max_payload_size,
            local_cid: setup.local_cid,
            remote_cid: setup.remote_cid,
            peer_addr: setup.peer_addr,
            local_addr: setup.local_addr,
            local_reset_token: setup.local_reset_token,
            peer_reset_token: None,
            handshake,
            received_from_peer: setup.side == Side::Server,
            crypto_send_seq: 0,
            crypto_recv_seq: 0,
            crypto_reorder: BTreeMap::new(),
            recv_max_data: local_params.initial_max_data,
            recv_window: local_params.initial_max_data,
            local_params,
            remote_params: None,
            secure_info: None,
            peer_certificate: None,
            streams: FxHashMap::default(),
            allocator,
            pending_streams: Vec::new(),
            send_max_data,
            data_sent: 0,
            data_received: 0,
            data_consumed: 0,
            next_packet_number: 0,
            sent_packets: BTreeMap::new(),
            received_packets: RangeSet::new(),
            ack_needed: false,
            control_frames: VecDeque::new(),
            idle_timeout: None,
            idle_deadline: None,
            path_challenge: None,
            closing_code: None,
            close_frame: None,
            events: events_tx,
            handshake_status: handshake_tx,
            closed: closed_tx,
            stats: SessionStats::default(),
            weak_self: setup.weak_self,
            config: setup.config,
        };

        let channels = SessionChannels {
            events: events_rx,
            handshake: handshake_rx,
            closed: closed_rx,
        };
        (inner, channels)
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn local_cid(&self) -> ConnectionId {
        self.local_cid
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_certificate(&self) -> Option<Bytes> {
        self.peer_certificate.clone()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.clone()
    }

    /// Closed, and the final packet (if any) was handed out for sending
    pub fn is_drained(&self) -> bool {
        self.phase == SessionPhase::Closed && self.close_frame.is_none()
    }

    /// Kick off the handshake: a client queues its first flight
    pub fn start(&mut self, now: Instant) {
        if self.phase != SessionPhase::Initial {
            return;
        }
        self.phase = SessionPhase::Handshaking;
        if !self.config.idle_timeout.is_zero() {
            self.idle_deadline = Some(now + self.config.idle_timeout);
        }
        match self.handshake.start() {
            Ok(events) => self.on_handshake_events(events, now),
            Err(e) => self.close_with_transport_error(TransportErrorCode::CryptoError, &e.to_string()),
        }
    }

    //----------------------------------- receiving

    pub fn on_packet(&mut self, packet: Packet, from: SocketAddr, datagram_len: usize, now: Instant) {
        if self.phase == SessionPhase::Closed {
            trace!("session is closed - dropping {:?}", packet);
            return;
        }

        let frames = match Frame::deser_all(packet.payload.clone()) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("received packet with unparseable frames from {:?}: {}", from, e);
                self.close_with_transport_error(TransportErrorCode::FrameEncodingError, &e.to_string());
                return;
            }
        };

        if self.remote_params.is_none() && frames.iter().any(|f| !Self::is_handshake_frame(f)) {
            debug!("{:?} carries stream level frames before the handshake progressed - dropping it unacknowledged", packet);
            return;
        }

        if self.side == Side::Client && !self.received_from_peer {
            if let Some(scid) = packet.header.scid {
                debug!("server chose connection id {:?}", scid);
                self.remote_cid = scid;
            }
        }
        self.received_from_peer = true;

        let ack_eliciting = frames.iter().any(|f| f.is_ack_eliciting());
        if ack_eliciting {
            self.ack_needed = true;
        }
        if !self.received_packets.insert_one(packet.packet_number) {
            trace!("duplicate packet #{} - ignoring", packet.packet_number);
            return;
        }
        if let Some(max) = self.received_packets.max() {
            if max > RECEIVED_PACKETS_HISTORY {
                self.received_packets.remove_below(max - RECEIVED_PACKETS_HISTORY);
            }
        }

        self.stats.packets_received += 1;
        self.stats.bytes_received += datagram_len.safe_cast();
        self.reset_idle_deadline(now);

        if self.phase == SessionPhase::Migrating {
            debug!("received packet on the new path - migration complete");
            self.phase = SessionPhase::Secure;
        }
        if from != self.peer_addr && self.secure_info.is_some() {
            debug!("peer address changed from {:?} to {:?} - validating the new path", self.peer_addr, from);
            self.peer_addr = from;
            let challenge: [u8; 8] = rand::random();
            self.path_challenge = Some(challenge);
            self.control_frames.push_back(Frame::PathChallenge { data: challenge });
        }

        trace!("processing {:?}: {:?}", packet, frames);
        for frame in frames {
            self.on_frame(frame, now);
            if self.phase == SessionPhase::Closed {
                break;
            }
        }
    }

    fn is_handshake_frame(frame: &Frame) -> bool {
        matches!(frame, Frame::Crypto { .. } | Frame::Ack { .. } | Frame::Ping | Frame::ConnectionClose { .. })
    }

    fn on_frame(&mut self, frame: Frame, now: Instant) {
        match frame {
            Frame::Ping | Frame::HandshakeDone => {}
            Frame::Ack { ranges } => self.on_ack(ranges),
            Frame::ResetStream { id, code, final_size } => self.on_reset_stream(id, code, final_size),
            Frame::StopSending { id, code } => self.on_stop_sending(id, code),
            Frame::Crypto { seq, data } => self.on_crypto(seq, data, now),
            Frame::SessionTicket { ticket } => {
                if self.side == Side::Client {
                    let remote_params = self.remote_params.clone().unwrap_or_default();
                    self.emit(SessionEvent::SessionTicket { ticket, remote_params });
                }
            }
            Frame::Stream { id, offset, fin, data } => self.on_stream_data(id, offset, fin, data),
            Frame::MaxData { max } => {
                self.send_max_data = self.send_max_data.max(max);
            }
            Frame::MaxStreamData { id, max } => self.on_max_stream_data(id, max),
            Frame::MaxStreams { direction, max } => {
                if self.allocator.raise_limit(self.side, direction, max) {
                    debug!("peer raised the {:?} stream limit to {}", direction, max);
                    self.materialize_pending_streams();
                }
            }
            Frame::PathChallenge { data } => self.control_frames.push_back(Frame::PathResponse { data }),
            Frame::PathResponse { data } => {
                if self.path_challenge == Some(data) {
                    self.path_challenge = None;
                    debug!("path to {:?} validated", self.peer_addr);
                    self.emit(SessionEvent::PathValidated(self.peer_addr));
                }
            }
            Frame::ConnectionClose { source, code, reason } => {
                info!("peer closed the connection: {:?} code {}, reason '{}'", source, code, reason);
                let info = CloseInfo {
                    code: CloseCode { code, source, silent: false },
                    reason,
                    idle_timeout: false,
                    stateless_reset: false,
                };
                self.enter_closed(info, false, false, None);
            }
            Frame::Datagram { data } => {
                self.stats.datagrams_received += 1;
                self.emit(SessionEvent::Datagram(data));
            }
            Frame::Headers { id, kind, headers } => {
                if let Some(stream) = self.stream_for_frame(id).and_then(|id| self.streams.get(&id)) {
                    stream.emit(StreamEvent::Headers { kind, headers });
                }
            }
        }
    }

    fn on_crypto(&mut self, seq: u64, data: Bytes, now: Instant) {
        if seq < self.crypto_recv_seq {
            trace!("duplicate handshake message #{}", seq);
            return;
        }
        self.crypto_reorder.insert(seq, data);

        while let Some(data) = self.crypto_reorder.remove(&self.crypto_recv_seq) {
            self.crypto_recv_seq += 1;
            match self.handshake.on_crypto(data) {
                Ok(events) => self.on_handshake_events(events, now),
                Err(e) => {
                    warn!("handshake failed: {}", e);
                    self.close_with_transport_error(TransportErrorCode::CryptoError, &e.to_string());
                }
            }
            if self.phase == SessionPhase::Closed {
                return;
            }
        }
    }

    fn on_handshake_events(&mut self, events: Vec<HandshakeEvent>, now: Instant) {
        for event in events {
            match event {
                HandshakeEvent::Send(data) => {
                    let seq = self.crypto_send_seq;
                    self.crypto_send_seq += 1;
                    self.control_frames.push_back(Frame::Crypto { seq, data });
                }
                HandshakeEvent::RemoteParams(params) => self.on_remote_params(params),
                HandshakeEvent::PeerCertificate(cert) => self.peer_certificate = Some(cert),
                HandshakeEvent::Keylog(line) => self.emit(SessionEvent::Keylog(line)),
                HandshakeEvent::Secure(info) => self.on_secure(info, now),
            }
        }
    }

    fn on_remote_params(&mut self, params: TransportParams) {
        debug!("peer transport parameters: {:?}", params);
        self.allocator.raise_limit(self.side, Direction::Bidi, params.initial_max_streams_bidi);
        self.allocator.raise_limit(self.side, Direction::Uni, params.initial_max_streams_uni);
        self.send_max_data = self.send_max_data.max(params.initial_max_data);
        self.peer_reset_token = params.stateless_reset_token;
        self.idle_timeout = TransportParams::effective_idle_timeout(self.config.idle_timeout, params.max_idle_timeout);

        for stream in self.streams.values_mut() {
            if let Some(send) = stream.send.as_mut() {
                send.raise_max_stream_data(Self::initial_send_credit(self.side, &params, stream.id));
            }
        }
        self.remote_params = Some(params);
    }

    fn on_secure(&mut self, info: SecureInfo, now: Instant) {
        if self.phase >= SessionPhase::Closing {
            return;
        }
        info!("session {:?} is secure: {:?}", self.local_cid, info);
        self.phase = SessionPhase::Secure;
        self.secure_info = Some(info.clone());
        self.reset_idle_deadline(now);

        self.emit(SessionEvent::Secure(info.clone()));
        self.handshake_status.send_replace(HandshakeStatus::Secure(info));

        if self.side == Side::Server {
            self.control_frames.push_back(Frame::HandshakeDone);
            if let Some(ticket) = self.handshake.issue_ticket() {
                self.control_frames.push_back(Frame::SessionTicket { ticket });
            }
        }

        self.materialize_pending_streams();
    }

    fn reset_idle_deadline(&mut self, now: Instant) {
        let timeout = if self.secure_info.is_some() {
            self.idle_timeout
        }
        else {
            Some(self.config.idle_timeout).filter(|t| !t.is_zero())
        };
        self.idle_deadline = timeout.map(|t| now + t);
    }

    fn on_ack(&mut self, ranges: Vec<std::ops::Range<u64>>) {
        for range in ranges {
            let acked: Vec<u64> = self.sent_packets.range(range)
                .map(|(&pn, _)| pn)
                .collect();
            for pn in acked {
                if let Some(packet) = self.sent_packets.remove(&pn) {
                    for frame in packet.frames {
                        self.on_frame_acked(frame);
                    }
                }
            }
        }
    }

    fn on_frame_acked(&mut self, frame: Frame) {
        if let Frame::Stream { id, offset, fin, data } = frame {
            if let Some(send) = self.streams.get_mut(&id).and_then(|s| s.send.as_mut()) {
                send.on_acked(offset, data.len().safe_cast(), fin);
            }
            self.try_reap(id);
        }
    }

    /// Resolves the stream a frame refers to, opening peer-initiated streams implicitly. Returns
    ///  `None` if the frame should be ignored, or if it caused the connection to close.
    fn stream_for_frame(&mut self, id: StreamId) -> Option<StreamId> {
        if id.initiator() == self.side {
            if !self.allocator.was_opened(id) {
                self.close_with_transport_error(TransportErrorCode::StreamStateError, &format!("peer referenced stream {} that was never opened", id));
                return None;
            }
        }
        else if !self.allocator.was_opened(id) {
            if self.phase == SessionPhase::Closing {
                debug!("refusing stream {} while closing", id);
                self.control_frames.push_back(Frame::StopSending { id, code: 0 });
                if id.direction() == Direction::Bidi {
                    self.control_frames.push_back(Frame::ResetStream { id, code: 0, final_size: 0 });
                }
                return None;
            }
            match self.allocator.accept_remote(id) {
                Ok(new_ids) => {
                    for new_id in new_ids {
                        debug!("peer opened stream {}", new_id);
                        let stream = self.create_stream(new_id, &StreamOptions::default(), false);
                        self.emit(SessionEvent::Stream(stream));
                    }
                }
                Err(e) => {
                    self.close_with_transport_error(TransportErrorCode::StreamLimitError, &e.to_string());
                    return None;
                }
            }
        }

        if self.streams.contains_key(&id) {
            Some(id)
        }
        else {
            trace!("frame for stream {}, which is closed already - ignoring", id);
            None
        }
    }

    fn on_stream_data(&mut self, id: StreamId, offset: u64, fin: bool, data: Bytes) {
        if !id.is_readable_by(self.side) {
            self.close_with_transport_error(TransportErrorCode::StreamStateError, &format!("STREAM frame for send-only stream {}", id));
            return;
        }
        let Some(id) = self.stream_for_frame(id) else { return };

        let result = match self.streams.get_mut(&id) {
            Some(stream) if stream.read == HalfState::Open => {
                match stream.recv.as_mut() {
                    Some(recv) => {
                        let result = recv.on_data(offset, data, fin);
                        if recv.is_fin_delivered() {
                            stream.read = HalfState::Ended;
                        }
                        result
                    }
                    None => Ok(0),
                }
            }
            _ => return,
        };

        match result {
            Ok(increase) => {
                self.data_received += increase;
                if self.data_received > self.recv_max_data {
                    self.close_with_transport_error(TransportErrorCode::FlowControlError, "connection level flow control limit exceeded");
                    return;
                }
            }
            Err(code) => {
                self.close_with_transport_error(code, &format!("invalid STREAM frame for stream {}", id));
                return;
            }
        }

        self.update_receive_windows(id);
        self.try_reap(id);
    }

    fn on_reset_stream(&mut self, id: StreamId, code: u64, final_size: u64) {
        if !id.is_readable_by(self.side) {
            self.close_with_transport_error(TransportErrorCode::StreamStateError, &format!("RESET_STREAM for send-only stream {}", id));
            return;
        }
        let Some(id) = self.stream_for_frame(id) else { return };

        let result = match self.streams.get_mut(&id) {
            Some(stream) if stream.read == HalfState::Open => {
                match stream.recv.as_mut() {
                    Some(recv) => match recv.on_reset(final_size) {
                        Ok(increase) => {
                            self.data_consumed += recv.take_abandoned();
                            recv.controller.abort(QuicError::StreamReset(code));
                            stream.read = HalfState::Reset;
                            stream.emit(StreamEvent::Reset { code });
                            Ok(increase)
                        }
                        Err(e) => Err(e),
                    },
                    None => Ok(0),
                }
            }
            _ => return,
        };

        match result {
            Ok(increase) => {
                self.data_received += increase;
                if self.data_received > self.recv_max_data {
                    self.close_with_transport_error(TransportErrorCode::FlowControlError, "connection level flow control limit exceeded");
                    return;
                }
            }
            Err(code) => {
                self.close_with_transport_error(code, &format!("invalid RESET_STREAM for stream {}", id));
                return;
            }
        }
        self.update_receive_windows(id);
        self.try_reap(id);
    }

    fn on_stop_sending(&mut self, id: StreamId, code: u64) {
        if !id.is_writable_by(self.side) {
            self.close_with_transport_error(TransportErrorCode::StreamStateError, &format!("STOP_SENDING for receive-only stream {}", id));
            return;
        }
        let Some(id) = self.stream_for_frame(id) else { return };

        if let Some(stream) = self.streams.get_mut(&id) {
            if let Some(send) = stream.send.as_mut() {
                if !send.is_fully_acked() {
                    let final_size = send.reset(QuicError::StreamReset(code));
                    self.control_frames.push_back(Frame::ResetStream { id, code, final_size });
                    stream.write = HalfState::Reset;
                }
            }
            stream.emit(StreamEvent::StopSending { code });
        }
        self.try_reap(id);
    }

    fn on_max_stream_data(&mut self, id: StreamId, max: u64) {
        if !id.is_writable_by(self.side) {
            self.close_with_transport_error(TransportErrorCode::StreamStateError, &format!("MAX_STREAM_DATA for receive-only stream {}", id));
            return;
        }
        let Some(id) = self.stream_for_frame(id) else { return };
        if let Some(send) = self.streams.get_mut(&id).and_then(|s| s.send.as_mut()) {
            send.raise_max_stream_data(max);
        }
    }

    /// A STATELESS_RESET datagram arrived. Returns true if it was meant for this session.
    pub fn on_stateless_reset(&mut self, token: &StatelessResetToken) -> bool {
        if self.phase == SessionPhase::Closed || self.peer_reset_token.as_ref() != Some(token) {
            return false;
        }
        info!("session {:?} was reset by the peer", self.local_cid);
        let info = CloseInfo {
            code: CloseCode::silent(TransportErrorCode::NoError),
            reason: "stateless reset".to_string(),
            idle_timeout: false,
            stateless_reset: true,
        };
        self.enter_closed(info, false, false, None);
        true
    }

    //----------------------------------- flow control

    /// Re-opens the stream's and the connection's receive windows as the application consumes data
    pub fn update_receive_windows(&mut self, id: StreamId) {
        if let Some(stream) = self.streams.get_mut(&id) {
            if let Some(recv) = stream.recv.as_mut() {
                self.data_consumed += recv.take_consumed();
                if stream.read == HalfState::Open {
                    if let Some(max) = recv.window_update() {
                        trace!("stream {}: raising receive limit to {}", id, max);
                        self.control_frames.push_back(Frame::MaxStreamData { id, max });
                    }
                }
            }
        }

        if self.phase < SessionPhase::Closing && self.recv_max_data - self.data_consumed.min(self.recv_max_data) < self.recv_window / 2 {
            self.recv_max_data = self.data_consumed + self.recv_window;
            trace!("raising connection receive limit to {}", self.recv_max_data);
            self.control_frames.push_back(Frame::MaxData { max: self.recv_max_data });
        }
    }

    fn initial_send_credit(side: Side, remote: &TransportParams, id: StreamId) -> u64 {
        match id.direction() {
            Direction::Uni => remote.initial_max_stream_data_uni,
            Direction::Bidi if id.initiator() == side => remote.initial_max_stream_data_bidi_remote,
            Direction::Bidi => remote.initial_max_stream_data_bidi_local,
        }
    }

    fn receive_window(&self, id: StreamId) -> u64 {
        match id.direction() {
            Direction::Uni => self.local_params.initial_max_stream_data_uni,
            Direction::Bidi if id.initiator() == self.side => self.local_params.initial_max_stream_data_bidi_local,
            Direction::Bidi => self.local_params.initial_max_stream_data_bidi_remote,
        }
    }

    //----------------------------------- streams

    fn create_stream(&mut self, id: StreamId, options: &StreamOptions, pending: bool) -> Stream {
        let readable = id.is_readable_by(self.side);
        let writable = id.is_writable_by(self.side);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let (byte_stream, recv) = if readable {
            let source = Arc::new(StreamSource {
                session: self.weak_self.clone(),
                id,
            });
            let byte_stream_options = ByteStreamOptions {
                high_water_mark: options.high_water_mark.prechecked_cast(),
                auto_allocate_chunk_size: None,
            };
            let (byte_stream, controller) = ByteStream::new(byte_stream_options, Some(source));
            (Some(byte_stream), Some(RecvState::new(controller, self.receive_window(id))))
        }
        else {
            (None, None)
        };

        let send_credit = self.remote_params.as_ref()
            .or(if self.side == Side::Client { self.config.remote_transport_params.as_ref() } else { None })
            .map(|params| Self::initial_send_credit(self.side, params, id))
            .unwrap_or(0);
        let send = writable.then(|| SendBuffer::new(send_credit));

        let shared = Arc::new(StreamShared {
            id,
            readable: byte_stream,
            default_encoding: options.default_encoding,
            events: tokio::sync::Mutex::new(events_rx),
            reader: Mutex::new(None),
        });

        self.streams.insert(id, StreamState {
            id,
            pending,
            read: if readable { HalfState::Open } else { HalfState::Ended },
            write: if writable { HalfState::Open } else { HalfState::Ended },
            recv,
            send,
            events: events_tx,
            shared: shared.clone(),
        });

        match id.direction() {
            Direction::Bidi => self.stats.bidi_streams_opened += 1,
            Direction::Uni => self.stats.uni_streams_opened += 1,
        }
        Stream::new(self.weak_self.clone(), shared)
    }

    pub fn open_stream(&mut self, options: &StreamOptions) -> Result<Stream, QuicError> {
        options.validate()?;
        if self.phase >= SessionPhase::Closing {
            return Err(QuicError::invalid_state("session is closing or closed"));
        }

        let direction = if options.half_open { Direction::Uni } else { Direction::Bidi };
        let id = if self.allocator.limit(self.side, direction).is_some() {
            self.allocator.next_id(self.side, direction)?
        }
        else {
            self.allocator.reserve(direction)
        };

        let pending = self.secure_info.is_none();
        debug!("opening stream {}{}", id, if pending { " (pending)" } else { "" });
        let stream = self.create_stream(id, options, pending);
        if pending {
            self.pending_streams.push(id);
        }
        Ok(stream)
    }

    /// Announce pending streams that are within the peer's limits, in open order
    fn materialize_pending_streams(&mut self) {
        if self.secure_info.is_none() {
            return;
        }
        for id in mem::take(&mut self.pending_streams) {
            if !self.streams.contains_key(&id) {
                continue;
            }
            if self.allocator.limit(self.side, id.direction()) == Some(0) {
                debug!("peer does not allow {:?} streams - failing pending stream {}", id.direction(), id);
                self.fail_stream(id, QuicError::OperationFailed(format!("peer does not allow {:?} streams", id.direction())));
            }
            else if self.allocator.is_within_limit(id) {
                trace!("materializing stream {}", id);
                if let Some(stream) = self.streams.get_mut(&id) {
                    stream.pending = false;
                }
            }
            else {
                self.pending_streams.push(id);
            }
        }
    }

    /// drop a stream that was never announced to the peer
    fn fail_stream(&mut self, id: StreamId, err: QuicError) {
        if let Some(mut stream) = self.streams.remove(&id) {
            if let Some(send) = stream.send.as_mut() {
                send.reset(err.clone());
            }
            if let Some(recv) = &stream.recv {
                recv.controller.abort(err);
            }
        }
    }

    fn try_reap(&mut self, id: StreamId) {
        let reapable = self.streams.get(&id)
            .map(|s| s.is_reapable())
            .unwrap_or(false);
        if !reapable {
            return;
        }

        self.streams.remove(&id);
        self.pending_streams.retain(|&p| p != id);
        trace!("stream {} is closed", id);

        if id.initiator() != self.side && self.phase < SessionPhase::Closing {
            let max = self.allocator.limit(id.initiator(), id.direction()).unwrap_or(0) + 1;
            self.allocator.raise_limit(id.initiator(), id.direction(), max);
            self.control_frames.push_back(Frame::MaxStreams { direction: id.direction(), max });
        }
        self.check_close_progress();
    }

    pub fn stream_write(&mut self, id: StreamId, data: Bytes) -> WriteAck {
        match self.streams.get_mut(&id) {
            Some(stream) if stream.write == HalfState::Open => match stream.send.as_mut() {
                Some(send) => send.write(data),
                None => WriteAck::ready(Ok(())),
            },
            _ => WriteAck::ready(Ok(())),
        }
    }

    pub fn stream_end(&mut self, id: StreamId) -> WriteAck {
        match self.streams.get_mut(&id) {
            Some(stream) if stream.write == HalfState::Open => match stream.send.as_mut() {
                Some(send) => {
                    stream.write = HalfState::Ended;
                    send.finish()
                }
                None => WriteAck::ready(Ok(())),
            },
            _ => WriteAck::ready(Ok(())),
        }
    }

    /// abort the write half (RESET_STREAM)
    pub fn stream_reset(&mut self, id: StreamId, code: u64) {
        self.abort_write(id, code, QuicError::StreamReset(code));
        self.try_reap(id);
    }

    /// abort the read half (STOP_SENDING)
    pub fn stream_stop_sending(&mut self, id: StreamId, code: u64) {
        self.abort_read(id, code, QuicError::Aborted(format!("reading was stopped with code {}", code)));
        self.try_reap(id);
    }

    pub fn stream_destroy(&mut self, id: StreamId, reason: Option<QuicError>) {
        let err = reason.unwrap_or_else(|| QuicError::Aborted("stream was destroyed".to_string()));
        debug!("destroying stream {}: {}", id, err);
        self.abort_write(id, 0, err.clone());
        self.abort_read(id, 0, err);
        self.try_reap(id);
    }

    fn abort_write(&mut self, id: StreamId, code: u64, err: QuicError) {
        let Some(stream) = self.streams.get_mut(&id) else { return };
        let Some(send) = stream.send.as_mut() else { return };
        if send.is_fully_acked() {
            return;
        }
        let final_size = send.reset(err);
        stream.write = HalfState::Reset;
        if !stream.pending {
            self.control_frames.push_back(Frame::ResetStream { id, code, final_size });
        }
    }

    fn abort_read(&mut self, id: StreamId, code: u64, err: QuicError) {
        let Some(stream) = self.streams.get_mut(&id) else { return };
        if stream.read != HalfState::Open {
            return;
        }
        let Some(recv) = stream.recv.as_mut() else { return };
        recv.controller.abort(err);
        self.data_consumed += recv.take_abandoned();
        stream.read = HalfState::Reset;
        if !stream.pending {
            self.control_frames.push_back(Frame::StopSending { id, code });
        }
    }

    /// The reader of a stream's byte stream consumed data, or wants more
    pub fn on_stream_pull(&mut self, id: StreamId) {
        if self.phase < SessionPhase::Closed {
            self.update_receive_windows(id);
        }
    }

    /// The application cancelled a stream's byte stream
    pub fn on_stream_cancel(&mut self, id: StreamId, reason: &str) {
        debug!("stream {}: readable side was cancelled: {}", id, reason);
        self.stream_stop_sending(id, 0);
    }

    pub fn stream_send_headers(&mut self, id: StreamId, kind: HeadersKind, headers: HeaderList) -> Result<(), QuicError> {
        let stream = self.streams.get(&id)
            .ok_or_else(|| QuicError::invalid_state("stream is closed"))?;
        if stream.pending {
            return Err(QuicError::invalid_state("stream is pending until the handshake is complete"));
        }
        if stream.write != HalfState::Open {
            return Err(QuicError::invalid_state("stream is not writable"));
        }
        self.control_frames.push_back(Frame::Headers { id, kind, headers });
        Ok(())
    }

    /// Opens a server-initiated uni stream carrying push headers, associated with a
    ///  client-initiated bidi stream
    pub fn push_stream(&mut self, parent: StreamId, headers: HeaderList) -> Result<Stream, QuicError> {
        if self.side != Side::Server {
            return Err(QuicError::invalid_state("only servers can push streams"));
        }
        if parent.initiator() != Side::Client || parent.direction() != Direction::Bidi {
            return Err(QuicError::arg_value("stream", "push streams require a client-initiated bidirectional stream"));
        }
        if !self.streams.contains_key(&parent) {
            return Err(QuicError::invalid_state("stream is closed"));
        }

        let push = self.open_stream(&StreamOptions::uni())?;
        self.stream_send_headers(push.id(), HeadersKind::Push, headers)?;
        Ok(push)
    }

    pub fn stream_status(&self, id: StreamId) -> (bool, HalfState, HalfState) {
        match self.streams.get(&id) {
            Some(stream) => (stream.pending, stream.read, stream.write),
            None => (false, HalfState::Ended, HalfState::Ended),
        }
    }

    //----------------------------------- session level operations

    pub fn send_datagram(&mut self, data: Bytes) -> Result<(), QuicError> {
        if !matches!(self.phase, SessionPhase::Secure | SessionPhase::Migrating) {
            return Err(QuicError::invalid_state("datagrams require an established session"));
        }
        let max_len = self.max_payload_size
            - Packet::overhead(&self.remote_cid, None)
            - Frame::DATAGRAM_FRAME_OVERHEAD;
        if data.len() > max_len {
            return Err(QuicError::out_of_range("datagram", data.len(), &format!("[0, {}]", max_len)));
        }
        self.stats.datagrams_sent += 1;
        self.control_frames.push_back(Frame::Datagram { data });
        Ok(())
    }

    pub fn check_migration_allowed(&self) -> Result<(), QuicError> {
        if !matches!(self.phase, SessionPhase::Secure | SessionPhase::Migrating) {
            return Err(QuicError::invalid_state("session must be secure to migrate"));
        }
        if self.remote_params.as_ref().map(|p| p.disable_active_migration).unwrap_or(false) {
            return Err(QuicError::OperationFailed("peer disabled active migration".to_string()));
        }
        Ok(())
    }

    /// Switch to a new local address. The PING on the new path is what tells the peer.
    pub fn migrate(&mut self, local_addr: SocketAddr) -> Result<(), QuicError> {
        self.check_migration_allowed()?;
        info!("session {:?} migrating from {:?} to {:?}", self.local_cid, self.local_addr, local_addr);
        self.local_addr = local_addr;
        self.phase = SessionPhase::Migrating;
        self.control_frames.push_back(Frame::Ping);
        Ok(())
    }

    /// Graceful close: CONNECTION_CLOSE is sent once all streams are closed
    pub fn close(&mut self, code: u64) {
        match self.phase {
            SessionPhase::Closing | SessionPhase::Closed => {}
            SessionPhase::Initial | SessionPhase::Handshaking => {
                debug!("closing session {:?} during handshake", self.local_cid);
                let send_frame = self.received_from_peer;
                self.enter_closed(CloseInfo::local(CloseCode::application(code)), send_frame, true, None);
            }
            SessionPhase::Secure | SessionPhase::Migrating => {
                debug!("session {:?} is closing, waiting for {} streams", self.local_cid, self.streams.len());
                self.phase = SessionPhase::Closing;
                self.closing_code = Some(code);
                for id in mem::take(&mut self.pending_streams) {
                    self.fail_stream(id, QuicError::Aborted("session is closing".to_string()));
                }
                self.check_close_progress();
            }
        }
    }

    fn check_close_progress(&mut self) {
        if self.phase == SessionPhase::Closing && self.streams.is_empty() {
            let code = self.closing_code.unwrap_or(0);
            self.enter_closed(CloseInfo::local(CloseCode::application(code)), true, true, None);
        }
    }

    /// Immediate close, notifying the peer
    pub fn destroy(&mut self, error: Option<QuicError>) {
        let code = match &error {
            Some(_) => CloseCode::transport(TransportErrorCode::InternalError),
            None => CloseCode::application(0),
        };
        self.destroy_with_code(code, error);
    }

    pub fn destroy_with_code(&mut self, code: CloseCode, error: Option<QuicError>) {
        let send_frame = self.received_from_peer;
        let mut info = CloseInfo::local(code);
        if let Some(e) = &error {
            info.reason = e.to_string();
        }
        self.enter_closed(info, send_frame, true, error);
    }

    /// Drop all state without telling the peer
    pub fn destroy_silently(&mut self) {
        self.enter_closed(CloseInfo::local(CloseCode::silent(TransportErrorCode::NoError)), false, true, None);
    }

    fn close_with_transport_error(&mut self, code: TransportErrorCode, reason: &str) {
        warn!("closing session {:?} with {:?}: {}", self.local_cid, code, reason);
        let mut info = CloseInfo::local(CloseCode::transport(code));
        info.reason = reason.to_string();
        let send_frame = self.received_from_peer;
        self.enter_closed(info, send_frame, false, None);
    }

    /// The single place where a session becomes Closed. Everything that is still pending is
    ///  settled, and `Close` is the last event.
    fn enter_closed(&mut self, info: CloseInfo, send_frame: bool, local: bool, error: Option<QuicError>) {
        if self.phase == SessionPhase::Closed {
            return;
        }
        info!("session {:?} closed: {:?}", self.local_cid, info);
        self.phase = SessionPhase::Closed;

        let err = if info.stateless_reset {
            QuicError::StatelessReset
        }
        else if info.idle_timeout {
            QuicError::IdleTimeout
        }
        else if info.code.is_transport(TransportErrorCode::ConnectionRefused) && !local {
            QuicError::ConnectionRefused
        }
        else {
            QuicError::ConnectionClosed(info.code)
        };

        if self.secure_info.is_none() {
            let handshake_error = if local && !info.idle_timeout { QuicError::HandshakeCanceled } else { err.clone() };
            self.handshake_status.send_replace(HandshakeStatus::Failed(handshake_error));
        }

        for (_, mut stream) in self.streams.drain() {
            if let Some(send) = stream.send.as_mut() {
                send.reset(err.clone());
            }
            if stream.read == HalfState::Open {
                if let Some(recv) = &stream.recv {
                    recv.controller.abort(err.clone());
                }
            }
        }
        self.pending_streams.clear();
        self.control_frames.clear();
        self.sent_packets.clear();
        self.crypto_reorder.clear();
        self.ack_needed = false;
        self.idle_deadline = None;

        if send_frame {
            self.close_frame = Some(Frame::ConnectionClose {
                source: info.code.source,
                code: info.code.code,
                reason: info.reason.clone(),
            });
        }

        if let Some(error) = error {
            self.emit(SessionEvent::Error(error));
        }
        self.emit(SessionEvent::Close(info));
        self.closed.send_replace(true);
    }

    fn emit(&self, event: SessionEvent) {
        trace!("session event: {:?}", event);
        let _ = self.events.send(event);
    }

    //----------------------------------- timers

    pub fn next_deadline(&self) -> Option<Instant> {
        if self.phase == SessionPhase::Closed {
            return None;
        }
        let retransmit = self.sent_packets.values().next()
            .map(|p| p.time + self.config.retransmit_interval);
        match (self.idle_deadline, retransmit) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn on_timeout(&mut self, now: Instant) {
        if self.phase == SessionPhase::Closed {
            return;
        }

        if let Some(deadline) = self.idle_deadline {
            if now >= deadline {
                info!("session {:?} timed out", self.local_cid);
                let info = CloseInfo {
                    code: CloseCode::silent(TransportErrorCode::NoError),
                    reason: "idle timeout".to_string(),
                    idle_timeout: true,
                    stateless_reset: false,
                };
                self.enter_closed(info, false, false, None);
                return;
            }
        }

        let interval = self.config.retransmit_interval;
        let lost: Vec<u64> = self.sent_packets.iter()
            .take_while(|(_, p)| p.time + interval <= now)
            .map(|(&pn, _)| pn)
            .collect();
        for pn in lost {
            if let Some(packet) = self.sent_packets.remove(&pn) {
                debug!("packet #{} was lost", pn);
                self.stats.packets_lost += 1;
                for frame in packet.frames {
                    self.on_frame_lost(frame);
                }
            }
        }
    }

    fn on_frame_lost(&mut self, frame: Frame) {
        match frame {
            Frame::Stream { id, offset, fin, data } => {
                if let Some(stream) = self.streams.get_mut(&id) {
                    if stream.write != HalfState::Reset {
                        if let Some(send) = stream.send.as_mut() {
                            send.on_lost(offset, data, fin);
                        }
                    }
                }
            }
            Frame::MaxData { .. } => self.control_frames.push_back(Frame::MaxData { max: self.recv_max_data }),
            Frame::MaxStreamData { id, .. } => {
                if let Some(recv) = self.streams.get(&id).and_then(|s| s.recv.as_ref()) {
                    self.control_frames.push_back(Frame::MaxStreamData { id, max: recv.max_stream_data() });
                }
            }
            Frame::MaxStreams { direction, .. } => {
                let max = self.allocator.limit(self.side.peer(), direction).unwrap_or(0);
                self.control_frames.push_back(Frame::MaxStreams { direction, max });
            }
            Frame::Headers { id, .. } if !self.streams.contains_key(&id) => {}
            frame => self.control_frames.push_back(frame),
        }
    }

    //----------------------------------- sending

    fn next_header(&self) -> PacketHeader {
        if self.secure_info.is_some() {
            return PacketHeader {
                kind: PacketKind::Short,
                dcid: self.remote_cid,
                scid: None,
            };
        }
        let kind = if self.side == Side::Client && !self.received_from_peer {
            PacketKind::Initial
        }
        else {
            PacketKind::Handshake
        };
        PacketHeader {
            kind,
            dcid: self.remote_cid,
            scid: Some(self.local_cid),
        }
    }

    /// Everything that is ready to be sent, packed into as few datagrams as possible
    pub fn poll_transmits(&mut self, now: Instant) -> Vec<Transmit> {
        let mut result = Vec::new();

        if self.phase == SessionPhase::Closed {
            if let Some(frame) = self.close_frame.take() {
                let header = self.next_header();
                result.push(self.finish_packet(header, vec![frame], now));
            }
            return result;
        }

        loop {
            let header = self.next_header();
            let budget = self.max_payload_size - Packet::overhead(&header.dcid, header.scid.as_ref());
            let mut frames = Vec::new();
            let mut used = 0;

            if self.ack_needed {
                let ack = Frame::Ack {
                    ranges: self.received_packets.iter_desc().take(MAX_ACK_RANGES).collect(),
                };
                used += ack.serialized_len();
                frames.push(ack);
                self.ack_needed = false;
            }

            while let Some(frame) = self.control_frames.front() {
                let len = frame.serialized_len();
                if used + len > budget {
                    if frames.is_empty() {
                        warn!("frame of {} bytes does not fit into a packet - dropping it", len);
                        self.control_frames.pop_front();
                        continue;
                    }
                    break;
                }
                used += len;
                if let Some(frame) = self.control_frames.pop_front() {
                    frames.push(frame);
                }
            }

            if self.secure_info.is_some() {
                self.fill_stream_frames(&mut frames, &mut used, budget);
            }

            if frames.is_empty() {
                break;
            }
            result.push(self.finish_packet(header, frames, now));
        }
        result
    }

    fn fill_stream_frames(&mut self, frames: &mut Vec<Frame>, used: &mut usize, budget: usize) {
        let mut ids: Vec<StreamId> = self.streams.values()
            .filter(|s| !s.pending && s.send.as_ref().map(|b| b.has_pending()).unwrap_or(false))
            .map(|s| s.id)
            .collect();
        ids.sort();

        for id in ids {
            loop {
                if *used + Frame::STREAM_FRAME_OVERHEAD >= budget {
                    return;
                }
                let max_len = budget - *used - Frame::STREAM_FRAME_OVERHEAD;
                let credit = self.send_max_data - self.data_sent;

                let Some(send) = self.streams.get_mut(&id).and_then(|s| s.send.as_mut()) else { break };
                let Some(segment) = send.next_segment(max_len, credit) else { break };

                self.data_sent += segment.new_bytes;
                let frame = Frame::Stream {
                    id,
                    offset: segment.offset,
                    fin: segment.fin,
                    data: segment.data,
                };
                *used += frame.serialized_len();
                frames.push(frame);
            }
        }
    }

    fn finish_packet(&mut self, header: PacketHeader, frames: Vec<Frame>, now: Instant) -> Transmit {
        let packet_number = self.next_packet_number;
        self.next_packet_number += 1;

        let mut payload = BytesMut::new();
        for frame in &frames {
            frame.ser(&mut payload);
        }
        let packet = Packet {
            header,
            packet_number,
            payload: payload.freeze(),
        };
        trace!("sending {:?}: {:?}", packet, frames);

        let mut buf = BytesMut::with_capacity(self.max_payload_size);
        packet.ser(&mut buf);
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += buf.len().safe_cast();

        if frames.iter().any(|f| f.is_ack_eliciting()) {
            self.sent_packets.insert(packet_number, SentPacket {
                time: now,
                frames: frames.into_iter()
                    .filter(|f| f.is_retransmittable())
                    .collect(),
            });
        }

        Transmit {
            to: self.peer_addr,
            payload: buf.freeze(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_stream::ReadResult;
    use crate::connection_id::ResetTokenGenerator;
    use crate::handshake::PlainHandshakeProvider;
    use crate::packet::Datagram;
    use rstest::rstest;
    use std::net::{Ipv4Addr, SocketAddrV4};

    const CLIENT_ADDR: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1111));
    const SERVER_ADDR: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 2222));

    struct Pair {
        client: SessionInner,
        client_channels: SessionChannels,
        server: SessionInner,
        server_channels: SessionChannels,
        now: Instant,
    }

    fn session(side: Side, config: SessionConfig, local_cid: ConnectionId, remote_cid: ConnectionId) -> (SessionInner, SessionChannels) {
        let (local_addr, peer_addr) = match side {
            Side::Client => (CLIENT_ADDR, SERVER_ADDR),
            Side::Server => (SERVER_ADDR, CLIENT_ADDR),
        };
        SessionInner::new(SessionSetup {
            side,
            config,
            handshake_provider: Arc::new(PlainHandshakeProvider),
            local_cid,
            remote_cid,
            peer_addr,
            local_addr,
            local_reset_token: ResetTokenGenerator::new([7; 16]).token_for(&local_cid),
            max_payload_size: 1200,
            weak_self: Weak::new(),
        })
    }

    impl Pair {
        fn new(client_config: SessionConfig, server_config: SessionConfig) -> Pair {
            let client_cid = ConnectionId::random();
            let server_cid = ConnectionId::random();
            let (client, client_channels) = session(Side::Client, client_config, client_cid, server_cid);
            let (server, server_channels) = session(Side::Server, server_config, server_cid, client_cid);
            let mut pair = Pair { client, client_channels, server, server_channels, now: Instant::now() };
            pair.client.start(pair.now);
            pair.server.start(pair.now);
            pair
        }

        fn established() -> Pair {
            let mut pair = Pair::new(SessionConfig::default(), SessionConfig::default());
            pair.pump();
            assert_eq!(pair.client.phase(), SessionPhase::Secure);
            assert_eq!(pair.server.phase(), SessionPhase::Secure);
            pair
        }

        fn deliver(to: &mut SessionInner, transmits: Vec<Transmit>, from: SocketAddr, now: Instant) {
            for transmit in transmits {
                let len = transmit.payload.len();
                match Packet::deser(transmit.payload).unwrap() {
                    Datagram::Packet(packet) => to.on_packet(packet, from, len, now),
                    Datagram::StatelessReset(token) => { to.on_stateless_reset(&token); }
                }
            }
        }

        /// exchange packets until both sides are quiet
        fn pump(&mut self) {
            for _ in 0..1000 {
                let from_client = self.client.poll_transmits(self.now);
                let from_server = self.server.poll_transmits(self.now);
                if from_client.is_empty() && from_server.is_empty() {
                    return;
                }
                Self::deliver(&mut self.server, from_client, CLIENT_ADDR, self.now);
                Self::deliver(&mut self.client, from_server, SERVER_ADDR, self.now);
            }
            panic!("sessions did not settle");
        }

        fn advance(&mut self, duration: Duration) {
            self.now += duration;
            self.client.on_timeout(self.now);
            self.server.on_timeout(self.now);
        }
    }

    fn drain_events(channels: &mut SessionChannels) -> Vec<SessionEvent> {
        let mut result = Vec::new();
        while let Ok(event) = channels.events.try_recv() {
            result.push(event);
        }
        result
    }

    fn accepted_stream(channels: &mut SessionChannels) -> Stream {
        drain_events(channels).into_iter()
            .find_map(|e| match e {
                SessionEvent::Stream(s) => Some(s),
                _ => None,
            })
            .unwrap()
    }

    fn read_available(stream: &Stream) -> (Vec<u8>, bool) {
        let readable = stream.readable().unwrap();
        let reader = readable.get_reader().unwrap();
        let mut data = Vec::new();
        loop {
            match reader.read().try_take() {
                Some(Ok(ReadResult { value: Some(chunk), done: false })) => data.extend_from_slice(&chunk),
                Some(Ok(ReadResult { done: true, .. })) => return (data, true),
                _ => return (data, false),
            }
        }
    }

    #[test]
    fn test_handshake() {
        let mut pair = Pair::established();

        let client_events = drain_events(&mut pair.client_channels);
        assert!(matches!(&client_events[0], SessionEvent::Secure(info) if info.alpn.as_deref() == Some("h3")));
        assert!(client_events.iter().any(|e| matches!(e, SessionEvent::SessionTicket { .. })));
        assert_eq!(*pair.client_channels.handshake.borrow(), HandshakeStatus::Secure(match &client_events[0] {
            SessionEvent::Secure(info) => info.clone(),
            _ => unreachable!(),
        }));
        assert!(matches!(drain_events(&mut pair.server_channels)[0], SessionEvent::Secure(_)));
        assert!(pair.client.sent_packets.is_empty());
        assert!(pair.server.sent_packets.is_empty());
    }

    #[test]
    fn test_hello_over_bidi_stream() {
        let mut pair = Pair::established();
        let stream = pair.client.open_stream(&StreamOptions::default()).unwrap();
        let mut ack = pair.client.stream_write(stream.id(), Bytes::from_static(b"hello"));
        let mut fin_ack = pair.client.stream_end(stream.id());
        pair.pump();

        assert_eq!(ack.try_take(), Some(Ok(())));
        assert_eq!(fin_ack.try_take(), Some(Ok(())));
        let accepted = accepted_stream(&mut pair.server_channels);
        assert_eq!(accepted.id(), stream.id());
        assert_eq!(read_available(&accepted), (b"hello".to_vec(), true));
        assert_eq!(pair.client.stats().bidi_streams_opened, 1);
    }

    #[test]
    fn test_streams_opened_before_handshake_are_pending() {
        let mut pair = Pair::new(SessionConfig::default(), SessionConfig::default());
        let stream = pair.client.open_stream(&StreamOptions::default()).unwrap();
        assert_eq!(pair.client.stream_status(stream.id()).0, true);
        let mut ack = pair.client.stream_write(stream.id(), Bytes::from_static(b"early"));

        pair.pump();
        assert_eq!(pair.client.stream_status(stream.id()).0, false);
        assert_eq!(ack.try_take(), Some(Ok(())));
        let accepted = accepted_stream(&mut pair.server_channels);
        assert_eq!(read_available(&accepted).0, b"early");
    }

    #[test]
    fn test_pending_uni_stream_fails_for_zero_limit() {
        let server_config = SessionConfig {
            transport_params: TransportParams { initial_max_streams_uni: 0, ..TransportParams::default() },
            ..SessionConfig::default()
        };
        let mut pair = Pair::new(SessionConfig::default(), server_config);
        let stream = pair.client.open_stream(&StreamOptions::uni()).unwrap();
        let mut ack = pair.client.stream_write(stream.id(), Bytes::from_static(b"x"));
        pair.pump();

        assert!(matches!(ack.try_take(), Some(Err(QuicError::OperationFailed(_)))));
        assert!(pair.client.open_stream(&StreamOptions::uni()).is_err());
    }

    #[test]
    fn test_stream_limit_after_handshake() {
        let server_config = SessionConfig {
            transport_params: TransportParams { initial_max_streams_bidi: 1, ..TransportParams::default() },
            ..SessionConfig::default()
        };
        let mut pair = Pair::new(SessionConfig::default(), server_config);
        pair.pump();

        let first = pair.client.open_stream(&StreamOptions::default()).unwrap();
        assert_eq!(pair.client.open_stream(&StreamOptions::default()).err(), Some(QuicError::StreamLimit(Direction::Bidi)));

        // closing the first stream on both sides makes the server grant another one
        pair.client.stream_write(first.id(), Bytes::from_static(b"a"));
        pair.client.stream_end(first.id());
        pair.pump();
        let accepted = accepted_stream(&mut pair.server_channels);
        read_available(&accepted);
        pair.server.stream_end(accepted.id());
        pair.pump();

        assert!(pair.client.open_stream(&StreamOptions::default()).is_ok());
    }

    #[test]
    fn test_lost_packets_are_retransmitted() {
        let mut pair = Pair::established();
        let stream = pair.client.open_stream(&StreamOptions::default()).unwrap();
        let mut ack = pair.client.stream_write(stream.id(), Bytes::from(vec![3u8; 5000]));
        pair.client.stream_end(stream.id());

        // the first flight gets lost entirely
        let lost = pair.client.poll_transmits(pair.now);
        assert!(lost.len() >= 5);
        assert_eq!(ack.try_take(), None);

        pair.advance(Duration::from_millis(100));
        pair.pump();
        assert_eq!(ack.try_take(), Some(Ok(())));
        assert!(pair.client.stats().packets_lost >= 5);

        let accepted = accepted_stream(&mut pair.server_channels);
        assert_eq!(read_available(&accepted), (vec![3u8; 5000], true));
    }

    #[test]
    fn test_write_acks_resolve_in_order() {
        let mut pair = Pair::established();
        let stream = pair.client.open_stream(&StreamOptions::default()).unwrap();
        let mut first = pair.client.stream_write(stream.id(), Bytes::from(vec![1u8; 1000]));
        let mut second = pair.client.stream_write(stream.id(), Bytes::from(vec![2u8; 1000]));

        let transmits = pair.client.poll_transmits(pair.now);
        assert_eq!(transmits.len(), 2);
        // only the second packet arrives
        Pair::deliver(&mut pair.server, transmits[1..].to_vec(), CLIENT_ADDR, pair.now);
        let acks = pair.server.poll_transmits(pair.now);
        Pair::deliver(&mut pair.client, acks, SERVER_ADDR, pair.now);

        assert_eq!(second.try_take(), None);
        assert_eq!(first.try_take(), None);

        pair.advance(Duration::from_millis(100));
        pair.pump();
        assert_eq!(first.try_take(), Some(Ok(())));
        assert_eq!(second.try_take(), Some(Ok(())));
    }

    #[test]
    fn test_receive_window_reopens_on_read() {
        let server_config = SessionConfig {
            transport_params: TransportParams { initial_max_stream_data_bidi_remote: 2000, ..TransportParams::default() },
            ..SessionConfig::default()
        };
        let mut pair = Pair::new(SessionConfig::default(), server_config);
        pair.pump();

        let stream = pair.client.open_stream(&StreamOptions::default()).unwrap();
        let mut ack = pair.client.stream_write(stream.id(), Bytes::from(vec![9u8; 5000]));
        pair.pump();
        assert_eq!(ack.try_take(), None);

        let accepted = accepted_stream(&mut pair.server_channels);
        let mut received = 0;
        for _ in 0..10 {
            received += read_available(&accepted).0.len();
            // this is what the byte stream's pull callback does in a running session
            pair.server.on_stream_pull(accepted.id());
            pair.pump();
        }
        assert_eq!(received, 5000);
        assert_eq!(ack.try_take(), Some(Ok(())));
    }

    #[test]
    fn test_destroy_stream_resets_both_halves() {
        let mut pair = Pair::established();
        let stream = pair.client.open_stream(&StreamOptions::default()).unwrap();
        pair.client.stream_write(stream.id(), Bytes::from_static(b"abc"));
        pair.pump();
        let accepted = accepted_stream(&mut pair.server_channels);

        let reader = stream.readable().unwrap().get_reader().unwrap();
        let mut pending_read = reader.read();
        assert!(pending_read.try_take().is_none());

        let mut server_write = pair.server.stream_write(accepted.id(), Bytes::from(vec![0u8; 100]));
        pair.server.stream_destroy(accepted.id(), None);
        assert!(matches!(server_write.try_take(), Some(Err(QuicError::Aborted(_)))));
        pair.pump();

        // both sides dropped the stream
        assert_eq!(pair.server.stream_status(accepted.id()), (false, HalfState::Ended, HalfState::Ended));
        assert_eq!(pair.client.stream_status(stream.id()), (false, HalfState::Ended, HalfState::Ended));
        assert!(pair.client.streams.is_empty());

        // only the read that was pending fails, later reads report the end
        assert_eq!(pending_read.try_take(), Some(Err(QuicError::StreamReset(0))));
        for _ in 0..3 {
            assert_eq!(reader.read().try_take(), Some(Ok(ReadResult { value: None, done: true })));
        }

        let server_reader = accepted.readable().unwrap().get_reader().unwrap();
        for _ in 0..3 {
            assert_eq!(server_reader.read().try_take(), Some(Ok(ReadResult { value: None, done: true })));
        }
    }

    #[test]
    fn test_reads_after_stop_sending_are_done() {
        let mut pair = Pair::established();
        let stream = pair.client.open_stream(&StreamOptions::default()).unwrap();
        pair.client.stream_write(stream.id(), Bytes::from_static(b"abc"));
        pair.pump();
        let accepted = accepted_stream(&mut pair.server_channels);
        assert_eq!(read_available(&accepted), (b"abc".to_vec(), false));

        let reader = accepted.readable().unwrap().get_reader().unwrap();
        let mut pending_read = reader.read();
        pair.server.stream_stop_sending(accepted.id(), 9);
        assert!(matches!(pending_read.try_take(), Some(Err(QuicError::Aborted(_)))));
        pair.pump();

        for _ in 0..3 {
            assert_eq!(reader.read().try_take(), Some(Ok(ReadResult { value: None, done: true })));
        }
        assert_eq!(pair.server.stream_status(accepted.id()).1, HalfState::Reset);
    }

    #[test]
    fn test_reads_after_session_close_are_done() {
        let mut pair = Pair::established();
        let stream = pair.client.open_stream(&StreamOptions::default()).unwrap();
        pair.client.stream_write(stream.id(), Bytes::from_static(b"abc"));
        pair.pump();
        let accepted = accepted_stream(&mut pair.server_channels);

        let reader = stream.readable().unwrap().get_reader().unwrap();
        let mut pending_read = reader.read();
        pair.client.destroy(None);
        assert!(matches!(pending_read.try_take(), Some(Err(_))));
        for _ in 0..3 {
            assert_eq!(reader.read().try_take(), Some(Ok(ReadResult { value: None, done: true })));
        }

        // the peer learns about the close; unread data is discarded and reads end as well
        pair.pump();
        assert_eq!(pair.server.phase(), SessionPhase::Closed);
        let server_reader = accepted.readable().unwrap().get_reader().unwrap();
        for _ in 0..3 {
            assert_eq!(server_reader.read().try_take(), Some(Ok(ReadResult { value: None, done: true })));
        }
    }

    #[test]
    fn test_stop_sending_is_answered_with_reset() {
        let mut pair = Pair::established();
        let stream = pair.client.open_stream(&StreamOptions::default()).unwrap();
        pair.client.stream_write(stream.id(), Bytes::from_static(b"abc"));
        pair.pump();
        let accepted = accepted_stream(&mut pair.server_channels);

        let mut pending_write = pair.client.stream_write(stream.id(), Bytes::from_static(b"more"));
        pair.server.stream_stop_sending(accepted.id(), 77);
        pair.pump();

        assert_eq!(pending_write.try_take(), Some(Err(QuicError::StreamReset(77))));
        assert_eq!(pair.client.stream_status(stream.id()).2, HalfState::Reset);
    }

    #[test]
    fn test_graceful_close_waits_for_streams() {
        let mut pair = Pair::established();
        let stream = pair.client.open_stream(&StreamOptions::default()).unwrap();
        pair.client.stream_write(stream.id(), Bytes::from_static(b"x"));
        pair.client.stream_end(stream.id());
        pair.pump();
        let accepted = accepted_stream(&mut pair.server_channels);

        pair.client.close(5);
        assert_eq!(pair.client.phase(), SessionPhase::Closing);
        assert!(pair.client.open_stream(&StreamOptions::default()).is_err());
        pair.pump();
        assert_eq!(pair.client.phase(), SessionPhase::Closing);

        read_available(&accepted);
        pair.server.stream_end(accepted.id());
        pair.pump();

        assert_eq!(pair.client.phase(), SessionPhase::Closed);
        assert_eq!(pair.server.phase(), SessionPhase::Closed);
        let server_events = drain_events(&mut pair.server_channels);
        match server_events.last() {
            Some(SessionEvent::Close(info)) => assert_eq!(info.code, CloseCode::application(5)),
            other => panic!("unexpected last event {:?}", other),
        }
        assert!(*pair.client_channels.closed.borrow());
    }

    #[test]
    fn test_close_during_handshake_cancels() {
        let mut pair = Pair::new(SessionConfig::default(), SessionConfig::default());
        pair.client.close(0);
        assert_eq!(pair.client.phase(), SessionPhase::Closed);
        assert_eq!(*pair.client_channels.handshake.borrow(), HandshakeStatus::Failed(QuicError::HandshakeCanceled));
        // the server never heard of the client, so there is nothing to send
        assert!(pair.client.poll_transmits(pair.now).is_empty());
        assert!(pair.client.is_drained());
    }

    #[test]
    fn test_destroy_with_error_emits_error_then_close() {
        let mut pair = Pair::established();
        drain_events(&mut pair.client_channels);
        drain_events(&mut pair.server_channels);

        pair.client.destroy(Some(QuicError::Handler("boom".to_string())));
        let events = drain_events(&mut pair.client_channels);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], SessionEvent::Error(QuicError::Handler(_))));
        assert!(matches!(&events[1], SessionEvent::Close(info) if info.code == CloseCode::transport(TransportErrorCode::InternalError)));

        pair.pump();
        let events = drain_events(&mut pair.server_channels);
        assert!(matches!(&events[..], [SessionEvent::Close(info)] if info.code.is_transport(TransportErrorCode::InternalError)));

        // a second destroy is a no-op
        pair.client.destroy(None);
        assert!(drain_events(&mut pair.client_channels).is_empty());
    }

    #[rstest]
    #[case::both(Duration::from_secs(5), Duration::from_secs(3), Some(Duration::from_secs(3)))]
    #[case::local_only(Duration::from_secs(5), Duration::ZERO, Some(Duration::from_secs(5)))]
    #[case::disabled(Duration::ZERO, Duration::ZERO, None)]
    fn test_idle_timeout(#[case] client_timeout: Duration, #[case] server_timeout: Duration, #[case] expected: Option<Duration>) {
        let mut pair = Pair::new(
            SessionConfig { idle_timeout: client_timeout, ..SessionConfig::default() },
            SessionConfig { idle_timeout: server_timeout, ..SessionConfig::default() },
        );
        pair.pump();
        assert_eq!(pair.client.idle_timeout, expected);
        assert_eq!(pair.server.idle_timeout, expected);
        drain_events(&mut pair.client_channels);

        match expected {
            Some(timeout) => {
                pair.advance(timeout);
                assert_eq!(pair.client.phase(), SessionPhase::Closed);
                assert_eq!(pair.server.phase(), SessionPhase::Closed);
                assert!(pair.client.poll_transmits(pair.now).is_empty());

                let events = drain_events(&mut pair.client_channels);
                match &events[..] {
                    [SessionEvent::Close(info)] => {
                        assert!(info.idle_timeout);
                        assert!(info.code.silent);
                    }
                    other => panic!("unexpected events {:?}", other),
                }
            }
            None => {
                pair.advance(Duration::from_secs(3600));
                assert_eq!(pair.client.phase(), SessionPhase::Secure);
            }
        }
    }

    #[test]
    fn test_stateless_reset_closes_silently() {
        let mut pair = Pair::established();
        drain_events(&mut pair.client_channels);

        assert!(!pair.client.on_stateless_reset(&StatelessResetToken([0; 16])));
        let token = ResetTokenGenerator::new([7; 16]).token_for(&pair.server.local_cid());
        assert!(pair.client.on_stateless_reset(&token));

        let events = drain_events(&mut pair.client_channels);
        assert!(matches!(&events[..], [SessionEvent::Close(info)] if info.stateless_reset && info.code.silent));
    }

    #[test]
    fn test_flow_control_violation_closes_connection() {
        let mut pair = Pair::established();
        pair.client.control_frames.push_back(Frame::Stream {
            id: StreamId::new(Side::Client, Direction::Bidi, 0),
            offset: 10 * 1024 * 1024,
            fin: false,
            data: Bytes::from_static(b"x"),
        });
        pair.pump();

        assert_eq!(pair.server.phase(), SessionPhase::Closed);
        let events = drain_events(&mut pair.client_channels);
        assert!(events.iter().any(|e| matches!(e, SessionEvent::Close(info) if info.code.is_transport(TransportErrorCode::FlowControlError))));
    }

    #[test]
    fn test_peer_exceeding_stream_limit() {
        let server_config = SessionConfig {
            transport_params: TransportParams { initial_max_streams_uni: 0, ..TransportParams::default() },
            ..SessionConfig::default()
        };
        let mut pair = Pair::new(SessionConfig::default(), server_config);
        pair.pump();
        pair.client.control_frames.push_back(Frame::Stream {
            id: StreamId::new(Side::Client, Direction::Uni, 0),
            offset: 0,
            fin: true,
            data: Bytes::from_static(b"x"),
        });
        pair.pump();

        let events = drain_events(&mut pair.server_channels);
        assert!(events.iter().any(|e| matches!(e, SessionEvent::Close(info) if info.code.is_transport(TransportErrorCode::StreamLimitError))));
    }

    #[test]
    fn test_datagrams() {
        let mut pair = Pair::established();
        drain_events(&mut pair.server_channels);
        pair.client.send_datagram(Bytes::from_static(b"ping")).unwrap();
        assert!(matches!(pair.client.send_datagram(Bytes::from(vec![0u8; 1200])), Err(QuicError::OutOfRange { .. })));
        pair.pump();

        let events = drain_events(&mut pair.server_channels);
        assert!(matches!(&events[..], [SessionEvent::Datagram(data)] if data.as_ref() == b"ping"));
        assert_eq!(pair.server.stats().datagrams_received, 1);
        assert_eq!(pair.client.stats().datagrams_sent, 1);
    }

    #[test]
    fn test_headers_and_push_stream() {
        let mut pair = Pair::established();
        let stream = pair.client.open_stream(&StreamOptions::default()).unwrap();
        let request = vec![(":path".to_string(), "/".to_string())];
        pair.client.stream_send_headers(stream.id(), HeadersKind::Initial, request.clone()).unwrap();
        pair.pump();

        let accepted = accepted_stream(&mut pair.server_channels);
        let push = pair.server.push_stream(accepted.id(), vec![(":path".to_string(), "/style.css".to_string())]).unwrap();
        assert_eq!(push.id().initiator(), Side::Server);
        assert_eq!(push.id().direction(), Direction::Uni);
        assert!(push.readable().is_none());
        assert!(pair.client.push_stream(stream.id(), vec![]).is_err());
        pair.pump();

        let pushed = accepted_stream(&mut pair.client_channels);
        assert_eq!(pushed.id(), push.id());
        assert_eq!(pair.server.stats().uni_streams_opened, 1);
    }

    #[test]
    fn test_migration_changes_address_and_validates_path() {
        let mut pair = Pair::established();
        drain_events(&mut pair.server_channels);
        let new_addr: SocketAddr = "127.0.0.1:3333".parse().unwrap();

        pair.client.migrate(new_addr).unwrap();
        assert_eq!(pair.client.phase(), SessionPhase::Migrating);
        assert_eq!(pair.client.local_addr(), new_addr);

        let transmits = pair.client.poll_transmits(pair.now);
        Pair::deliver(&mut pair.server, transmits, new_addr, pair.now);
        assert_eq!(pair.server.peer_addr(), new_addr);

        let transmits = pair.server.poll_transmits(pair.now);
        assert!(transmits.iter().all(|t| t.to == new_addr));
        Pair::deliver(&mut pair.client, transmits, SERVER_ADDR, pair.now);
        assert_eq!(pair.client.phase(), SessionPhase::Secure);

        let transmits = pair.client.poll_transmits(pair.now);
        Pair::deliver(&mut pair.server, transmits, new_addr, pair.now);
        let events = drain_events(&mut pair.server_channels);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SessionEvent::PathValidated(addr) if addr == new_addr));
    }

    #[test]
    fn test_migration_refused() {
        let mut pair = Pair::new(
            SessionConfig::default(),
            SessionConfig {
                transport_params: TransportParams { disable_active_migration: true, ..TransportParams::default() },
                ..SessionConfig::default()
            },
        );
        let addr: SocketAddr = "127.0.0.1:3333".parse().unwrap();
        assert!(matches!(pair.client.migrate(addr), Err(QuicError::InvalidState(_))));
        pair.pump();
        assert!(matches!(pair.client.migrate(addr), Err(QuicError::OperationFailed(_))));
    }

    #[test]
    fn test_alpn_mismatch_closes_both_sides() {
        let mut pair = Pair::new(
            SessionConfig { alpn: vec!["h3".to_string()], ..SessionConfig::default() },
            SessionConfig { alpn: vec!["smtp".to_string()], ..SessionConfig::default() },
        );
        pair.pump();
        assert_eq!(pair.client.phase(), SessionPhase::Closed);
        assert_eq!(pair.server.phase(), SessionPhase::Closed);
        let expected = QuicError::ConnectionClosed(CloseCode::transport(TransportErrorCode::CryptoError));
        assert_eq!(*pair.client_channels.handshake.borrow(), HandshakeStatus::Failed(expected));
    }
}
