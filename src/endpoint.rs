use std::collections::hash_map::Entry;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level, Span};
use uuid::Uuid;

use crate::config::{EndpointConfig, SessionConfig};
use crate::connection_id::{ConnectionId, ResetTokenGenerator};
use crate::error::{CloseCode, ErrorSource, QuicError, TransportErrorCode};
use crate::events::{EndpointHandler, EndpointStats};
use crate::frame::Frame;
use crate::packet::{Datagram, Packet, PacketHeader, PacketKind};
use crate::safe_converter::SafeCast;
use crate::session::{Session, SessionPath, SessionShared};
use crate::session_state::{SessionSetup, Transmit};
use crate::socket::DatagramSocket;
use crate::stream_id::Side;

const MAX_DATAGRAM_SIZE: usize = 65536;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum EndpointState {
    Created,
    Bound,
    /// listening or connected: the set of bindings is fixed
    Active,
    Closing,
    Closed,
}

struct HostResets {
    count: usize,
    since: Instant,
    last_use: u64,
}

/// Stateless reset counts of the most recently seen hosts. Once `capacity` hosts are tracked, the
///  least recently seen one is forgotten, and a host's count starts over after `period`.
struct ResetCounts {
    capacity: usize,
    period: Duration,
    next_use: u64,
    hosts: FxHashMap<IpAddr, HostResets>,
    by_use: BTreeMap<u64, IpAddr>,
}

impl ResetCounts {
    fn new(capacity: usize, period: Duration) -> ResetCounts {
        ResetCounts {
            capacity,
            period,
            next_use: 0,
            hosts: FxHashMap::default(),
            by_use: BTreeMap::new(),
        }
    }

    /// Counts a reset for `host`. Returns false without counting if the host reached `limit`.
    fn try_count(&mut self, host: IpAddr, limit: usize, now: Instant) -> bool {
        let use_id = self.next_use;
        self.next_use += 1;

        match self.hosts.entry(host) {
            Entry::Occupied(mut e) => {
                let resets = e.get_mut();
                self.by_use.remove(&resets.last_use);
                self.by_use.insert(use_id, host);
                resets.last_use = use_id;

                if now.saturating_duration_since(resets.since) >= self.period {
                    resets.count = 0;
                    resets.since = now;
                }
                if resets.count >= limit {
                    return false;
                }
                resets.count += 1;
                true
            }
            Entry::Vacant(e) => {
                if limit == 0 {
                    return false;
                }
                e.insert(HostResets { count: 1, since: now, last_use: use_id });
                self.by_use.insert(use_id, host);

                while self.hosts.len() > self.capacity {
                    let Some((_, oldest)) = self.by_use.pop_first() else { break };
                    self.hosts.remove(&oldest);
                }
                true
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.hosts.len()
    }
}

struct Binding {
    address: SocketAddr,
    socket: Option<Arc<UdpSocket>>,
}

struct EndpointInner {
    state: EndpointState,
    bindings: Vec<Binding>,
    /// the configuration for server sessions, `Some` while listening
    listening: Option<SessionConfig>,
    busy: bool,
    /// routing by destination connection id. Server sessions are also reachable through the
    ///  connection id the client chose for its Initial.
    sessions: FxHashMap<ConnectionId, Arc<SessionShared>>,
    /// one entry per session, keyed by the session's own connection id
    hosts: FxHashMap<ConnectionId, IpAddr>,
    stateless_resets: ResetCounts,
    stats: EndpointStats,
}

impl EndpointInner {
    fn check_open(&self) -> Result<(), QuicError> {
        match self.state {
            EndpointState::Closing => Err(QuicError::invalid_state("endpoint is closing")),
            EndpointState::Closed => Err(QuicError::invalid_state("endpoint is closed")),
            _ => Ok(()),
        }
    }

    fn primary_socket(&self) -> Option<Arc<UdpSocket>> {
        self.bindings.iter()
            .find_map(|b| b.socket.clone())
    }

    /// every registered session once, including those that migrated to another endpoint
    fn unique_sessions(&self) -> Vec<Arc<SessionShared>> {
        self.hosts.keys()
            .filter_map(|cid| self.sessions.get(cid).cloned())
            .collect()
    }

    fn register(&mut self, session: Arc<SessionShared>, alias: Option<ConnectionId>, host: IpAddr) {
        let local_cid = session.local_cid();
        if let Some(alias) = alias {
            self.sessions.insert(alias, session.clone());
        }
        self.sessions.insert(local_cid, session);
        self.hosts.insert(local_cid, host);
    }

    fn num_sessions_for_host(&self, host: IpAddr) -> usize {
        self.hosts.values()
            .filter(|&&h| h == host)
            .count()
    }
}

pub(crate) struct EndpointShared {
    config: EndpointConfig,
    handler: Arc<dyn EndpointHandler>,
    reset_tokens: ResetTokenGenerator,
    inner: Mutex<EndpointInner>,
    /// serializes binding, which suspends
    bind_lock: tokio::sync::Mutex<()>,
    cancel_sender: broadcast::Sender<()>,
}

impl Drop for EndpointShared {
    fn drop(&mut self) {
        let _ = self.cancel_sender.send(());
    }
}

impl EndpointShared {
    pub fn primary_socket(&self) -> Option<Arc<dyn DatagramSocket>> {
        let inner = self.inner.lock().unwrap();
        if inner.check_open().is_err() {
            return None;
        }
        inner.primary_socket()
            .map(|s| Arc::new(s) as Arc<dyn DatagramSocket>)
    }

    pub fn register(&self, session: Arc<SessionShared>, host: IpAddr) {
        self.inner.lock().unwrap().register(session, None, host);
    }

    /// removes all routing entries of a session
    pub fn deregister(&self, session: &Arc<SessionShared>) {
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.retain(|_, s| !Arc::ptr_eq(s, session));
        inner.hosts.remove(&session.local_cid());
        trace!("deregistered session {:?}, {} sessions remaining", session.local_cid(), inner.hosts.len());
    }

    pub fn record_sent(&self, transmits: &[Transmit]) {
        if transmits.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        for transmit in transmits {
            inner.stats.packets_sent += 1;
            inner.stats.bytes_sent += transmit.payload.len().safe_cast();
        }
    }

    /// Reports a failed handler callback through `on_error`
    async fn report(&self, result: anyhow::Result<()>) {
        if let Err(e) = result {
            warn!("endpoint handler failed: {}", e);
            self.handler.on_error(QuicError::Handler(e.to_string())).await;
        }
    }

    async fn bind_socket(address: SocketAddr) -> Result<Arc<UdpSocket>, QuicError> {
        let socket = UdpSocket::bind(address).await
            .map_err(|e| QuicError::OperationFailed(format!("binding to {:?} failed: {}", address, e)))?;
        let socket = Arc::new(socket);
        info!("bound UDP socket to {:?}", socket.local_addr());
        Ok(socket)
    }

    fn spawn_recv_loop(self: &Arc<Self>, socket: Arc<UdpSocket>) {
        tokio::spawn(recv_loop(Arc::downgrade(self), socket, self.cancel_sender.subscribe()));
    }

    /// Routes a datagram. Returns packets to send in reply, which is only ever done for datagrams
    ///  that no session is responsible for.
    fn on_datagram(self: &Arc<Self>, data: Bytes, from: SocketAddr, socket: &Arc<UdpSocket>) -> Vec<Transmit> {
        let len = data.len();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.stats.packets_received += 1;
            inner.stats.bytes_received += len.safe_cast();
        }

        let datagram = match Packet::deser(data) {
            Ok(datagram) => datagram,
            Err(e) => {
                debug!("dropping datagram from {:?}: {}", from, e);
                return Vec::new();
            }
        };

        match datagram {
            Datagram::StatelessReset(token) => {
                let sessions = self.inner.lock().unwrap().unique_sessions();
                if !sessions.iter().any(|s| s.on_stateless_reset(&token)) {
                    debug!("stateless reset from {:?} does not match any session - ignoring", from);
                }
                Vec::new()
            }
            Datagram::Packet(packet) => {
                let session = self.inner.lock().unwrap()
                    .sessions.get(&packet.header.dcid)
                    .cloned();
                if let Some(session) = session {
                    session.on_packet(packet, from, len);
                    return Vec::new();
                }

                match packet.header.kind {
                    PacketKind::Initial => self.on_new_initial(packet, from, len, socket),
                    PacketKind::Short => self.stateless_reset(&packet.header.dcid, from),
                    PacketKind::Handshake => {
                        debug!("dropping {:?} from {:?} for an unknown connection", packet, from);
                        Vec::new()
                    }
                }
            }
        }
    }

    fn on_new_initial(self: &Arc<Self>, packet: Packet, from: SocketAddr, len: usize, socket: &Arc<UdpSocket>) -> Vec<Transmit> {
        let Some(client_cid) = packet.header.scid else {
            return Vec::new();
        };

        let session = {
            let mut inner = self.inner.lock().unwrap();
            let Some(session_config) = inner.listening.clone().filter(|_| inner.state == EndpointState::Active) else {
                debug!("not listening - dropping Initial from {:?}", from);
                return Vec::new();
            };

            let refusal = if inner.busy {
                inner.stats.busy_count += 1;
                Some("endpoint is busy")
            }
            else if self.config.blocklist.contains(&from.ip()) {
                Some("host is blocklisted")
            }
            else if inner.hosts.len() >= self.config.max_connections_total {
                Some("too many connections")
            }
            else if inner.num_sessions_for_host(from.ip()) >= self.config.max_connections_per_host {
                Some("too many connections from this host")
            }
            else {
                None
            };
            if let Some(reason) = refusal {
                debug!("refusing connection from {:?}: {}", from, reason);
                return vec![Self::refusal(client_cid, from, reason)];
            }

            let local_cid = ConnectionId::random();
            debug!("new connection from {:?}, session {:?}", from, local_cid);
            let setup = SessionSetup {
                side: Side::Server,
                config: session_config,
                handshake_provider: self.config.handshake.clone(),
                local_cid,
                remote_cid: client_cid,
                peer_addr: from,
                local_addr: DatagramSocket::local_addr(socket),
                local_reset_token: self.reset_tokens.token_for(&local_cid),
                max_payload_size: self.config.max_payload_size,
                weak_self: Weak::new(),
            };
            let path = SessionPath::new(Arc::downgrade(self), Arc::new(socket.clone()));
            let session = SessionShared::start(setup, path);
            inner.register(session.clone(), Some(packet.header.dcid), from.ip());
            inner.stats.server_sessions += 1;
            session
        };

        session.on_packet(packet, from, len);
        self.spawn_session_handler(session);
        Vec::new()
    }

    /// A CONNECTION_REFUSED close, sent without creating any session state
    fn refusal(client_cid: ConnectionId, to: SocketAddr, reason: &str) -> Transmit {
        let mut payload = BytesMut::new();
        Frame::ConnectionClose {
            source: ErrorSource::Transport,
            code: TransportErrorCode::ConnectionRefused.into(),
            reason: reason.to_string(),
        }.ser(&mut payload);

        let packet = Packet {
            header: PacketHeader {
                kind: PacketKind::Handshake,
                dcid: client_cid,
                scid: Some(ConnectionId::random()),
            },
            packet_number: 0,
            payload: payload.freeze(),
        };
        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        Transmit {
            to,
            payload: buf.freeze(),
        }
    }

    fn stateless_reset(&self, dcid: &ConnectionId, to: SocketAddr) -> Vec<Transmit> {
        if self.config.disable_stateless_reset {
            debug!("packet for unknown connection {:?} from {:?} - stateless reset is disabled", dcid, to);
            return Vec::new();
        }

        let mut inner = self.inner.lock().unwrap();
        if !inner.stateless_resets.try_count(to.ip(), self.config.max_stateless_resets_per_host, Instant::now()) {
            debug!("stateless reset limit for {:?} reached", to.ip());
            return Vec::new();
        }
        inner.stats.stateless_resets_sent += 1;

        debug!("packet for unknown connection {:?} from {:?} - sending stateless reset", dcid, to);
        let mut buf = BytesMut::new();
        Packet::ser_stateless_reset(&self.reset_tokens.token_for(dcid), &mut buf);
        vec![Transmit { to, payload: buf.freeze() }]
    }

    /// Passes a new server session to the application. If the handler fails (or panics), the
    ///  session is refused.
    fn spawn_session_handler(&self, session: Arc<SessionShared>) {
        let handler = self.handler.clone();
        tokio::spawn(async move {
            let handle = Session { shared: session.clone() };
            let handler_for_session = handler.clone();
            let result = tokio::spawn(async move { handler_for_session.on_session(handle).await }).await;

            let error = match result {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(e) => format!("session handler panicked: {}", e),
            };
            warn!("refusing session {:?}: {}", session.local_cid(), error);
            session.with_inner(|inner| inner.destroy_with_code(CloseCode::transport(TransportErrorCode::ConnectionRefused), None));
            handler.on_error(QuicError::Handler(error)).await;
        }.instrument(Span::current()));
    }

    fn stop_receiving(&self) {
        if let Err(err) = self.cancel_sender.send(()) {
            trace!(?err, "no receive loops to cancel");
        }
    }
}

async fn recv_loop(endpoint: Weak<EndpointShared>, socket: Arc<UdpSocket>, mut cancel_receiver: broadcast::Receiver<()>) {
    info!("starting receive loop on {:?}", socket.as_ref().local_addr());
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let (len, from) = select! {
            r = socket.recv_from(&mut buf) => match r {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            },
            _ = cancel_receiver.recv() => break,
        };

        let Some(endpoint) = endpoint.upgrade() else {
            break;
        };

        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
        let replies = span.in_scope(|| {
            trace!("received {} bytes from {:?}", len, from);
            endpoint.on_datagram(Bytes::copy_from_slice(&buf[..len]), from, &socket)
        });

        for reply in &replies {
            socket.send_datagram(reply.to, &reply.payload).instrument(span.clone()).await;
        }
        endpoint.record_sent(&replies);
    }

    debug!("receive loop terminated");
}

/// A QUIC endpoint: a set of UDP bindings, and the sessions using them. It can act as a server
///  (`listen`), as a client (`connect`), or both. Cloning gives another handle to the same
///  endpoint.
#[derive(Clone)]
pub struct Endpoint {
    pub(crate) shared: Arc<EndpointShared>,
}

impl Endpoint {
    pub fn new(config: EndpointConfig, handler: Arc<dyn EndpointHandler>) -> Result<Endpoint, QuicError> {
        config.validate()?;

        let reset_tokens = ResetTokenGenerator::new(config.reset_token_secret.unwrap_or_else(rand::random));
        let (cancel_sender, _) = broadcast::channel(1);
        let inner = EndpointInner {
            state: EndpointState::Created,
            bindings: vec![Binding { address: config.address, socket: None }],
            listening: None,
            busy: false,
            sessions: FxHashMap::default(),
            hosts: FxHashMap::default(),
            stateless_resets: ResetCounts::new(config.address_lru_size, config.stateless_reset_period),
            stats: EndpointStats::default(),
        };

        Ok(Endpoint {
            shared: Arc::new(EndpointShared {
                config,
                handler,
                reset_tokens,
                inner: Mutex::new(inner),
                bind_lock: tokio::sync::Mutex::new(()),
                cancel_sender,
            }),
        })
    }

    /// Adds a UDP binding. Before [Endpoint::bind] it is just recorded, afterwards it is bound
    ///  immediately. Once the endpoint is listening or connected, the bindings are fixed.
    pub async fn add_endpoint(&self, address: SocketAddr) -> Result<(), QuicError> {
        let _bind_guard = self.shared.bind_lock.lock().await;

        let state = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.check_open()?;
            if inner.state == EndpointState::Created {
                inner.bindings.push(Binding { address, socket: None });
                return Ok(());
            }
            inner.state
        };
        if state != EndpointState::Bound {
            return Err(QuicError::invalid_state("bindings cannot be added after listen or connect"));
        }

        let socket = EndpointShared::bind_socket(address).await?;
        let mut inner = self.shared.inner.lock().unwrap();
        inner.check_open()?;
        inner.bindings.push(Binding { address, socket: Some(socket.clone()) });
        self.shared.spawn_recv_loop(socket);
        Ok(())
    }

    /// Binds all addresses and starts receiving. Binding an endpoint that is bound already does
    ///  nothing.
    pub async fn bind(&self) -> Result<(), QuicError> {
        {
            let _bind_guard = self.shared.bind_lock.lock().await;

            let addresses = {
                let inner = self.shared.inner.lock().unwrap();
                inner.check_open()?;
                if inner.state != EndpointState::Created {
                    return Ok(());
                }
                inner.bindings.iter()
                    .map(|b| b.address)
                    .collect::<Vec<_>>()
            };

            let mut sockets = Vec::new();
            for address in addresses {
                sockets.push(EndpointShared::bind_socket(address).await?);
            }

            let mut inner = self.shared.inner.lock().unwrap();
            inner.check_open()?;
            for (binding, socket) in inner.bindings.iter_mut().zip(sockets) {
                binding.socket = Some(socket.clone());
                self.shared.spawn_recv_loop(socket);
            }
            inner.state = EndpointState::Bound;
        }

        self.shared.report(self.shared.handler.on_ready().await).await;
        Ok(())
    }

    /// Accepts new sessions with the given configuration, binding first if necessary
    pub async fn listen(&self, config: SessionConfig) -> Result<(), QuicError> {
        config.validate()?;
        self.bind().await?;
        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.check_open()?;
            if inner.listening.is_some() {
                return Err(QuicError::invalid_state("endpoint is listening already"));
            }
            inner.listening = Some(config);
            inner.state = EndpointState::Active;
        }
        info!("listening on {:?}", self.addresses());
        self.shared.report(self.shared.handler.on_listening().await).await;
        Ok(())
    }

    /// Starts a client session. This returns as soon as the first packet is queued, use
    ///  [Session::handshake_completed] to wait for the handshake.
    pub async fn connect(&self, address: SocketAddr, config: SessionConfig) -> Result<Session, QuicError> {
        config.validate()?;
        if self.shared.config.blocklist.contains(&address.ip()) {
            return Err(QuicError::OperationFailed(format!("{} is blocklisted", address.ip())));
        }
        self.bind().await?;

        let mut inner = self.shared.inner.lock().unwrap();
        inner.check_open()?;
        let socket = inner.primary_socket()
            .ok_or_else(|| QuicError::invalid_state("endpoint is not bound"))?;
        inner.state = EndpointState::Active;

        let local_cid = ConnectionId::random();
        debug!("connecting to {:?}, session {:?}", address, local_cid);
        let setup = SessionSetup {
            side: Side::Client,
            config,
            handshake_provider: self.shared.config.handshake.clone(),
            local_cid,
            // the server replaces this with its own choice
            remote_cid: ConnectionId::random(),
            peer_addr: address,
            local_addr: DatagramSocket::local_addr(&socket),
            local_reset_token: self.shared.reset_tokens.token_for(&local_cid),
            max_payload_size: self.shared.config.max_payload_size,
            weak_self: Weak::new(),
        };
        let path = SessionPath::new(Arc::downgrade(&self.shared), Arc::new(socket));
        let session = SessionShared::start(setup, path);
        inner.register(session.clone(), None, address.ip());
        inner.stats.client_sessions += 1;
        Ok(Session { shared: session })
    }

    /// While busy, every new client is refused with CONNECTION_REFUSED
    pub async fn mark_busy(&self, busy: bool) -> Result<(), QuicError> {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.check_open()?;
            inner.busy = busy;
        }
        debug!("endpoint busy: {}", busy);
        self.shared.report(self.shared.handler.on_busy(busy).await).await;
        Ok(())
    }

    /// The address of the first binding, `None` before the endpoint is bound
    pub fn address(&self) -> Option<SocketAddr> {
        self.addresses().into_iter().next()
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.shared.inner.lock().unwrap()
            .bindings.iter()
            .filter_map(|b| b.socket.as_ref())
            .filter_map(|s| s.as_ref().local_addr().ok())
            .collect()
    }

    /// Gracefully closes all sessions, then stops receiving
    pub async fn close(&self) {
        let sessions = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.check_open().is_err() {
                return;
            }
            inner.state = EndpointState::Closing;
            inner.unique_sessions()
        };
        let sessions = self.owned(sessions);
        info!("closing endpoint with {} sessions", sessions.len());

        for session in &sessions {
            session.with_inner(|inner| inner.close(0));
        }
        for session in &sessions {
            session.wait_closed().await;
        }

        self.shared.inner.lock().unwrap().state = EndpointState::Closed;
        self.shared.stop_receiving();
        self.shared.handler.on_close().await;
    }

    /// Closes all sessions immediately and stops receiving
    pub fn destroy(&self) {
        let sessions = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.state == EndpointState::Closed {
                return;
            }
            inner.state = EndpointState::Closed;
            inner.unique_sessions()
        };
        let sessions = self.owned(sessions);
        info!("destroying endpoint with {} sessions", sessions.len());

        for session in sessions {
            session.with_inner(|inner| inner.destroy(None));
        }
        self.shared.stop_receiving();

        let handler = self.shared.handler.clone();
        tokio::spawn(async move { handler.on_close().await }.instrument(Span::current()));
    }

    pub fn stats(&self) -> EndpointStats {
        self.shared.inner.lock().unwrap().stats.clone()
    }

    /// leaves out sessions that migrated to another endpoint
    fn owned(&self, sessions: Vec<Arc<SessionShared>>) -> Vec<Arc<SessionShared>> {
        let this = Arc::downgrade(&self.shared);
        sessions.into_iter()
            .filter(|s| s.belongs_to(&this))
            .collect()
    }
}
