use std::fmt::{Debug, Formatter};
use std::mem;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::select;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, Instrument, Span};

use crate::config::StreamOptions;
use crate::connection_id::{ConnectionId, StatelessResetToken};
use crate::endpoint::{Endpoint, EndpointShared};
use crate::error::{CloseCode, QuicError};
use crate::events::SessionStats;
use crate::handshake::SecureInfo;
use crate::packet::Packet;
use crate::session_state::{HandshakeStatus, SessionInner, SessionPhase, SessionSetup};
use crate::socket::DatagramSocket;
use crate::stream::Stream;
use crate::stream_id::{Side, StreamId};
use crate::transport_params::TransportParams;

/// Things that happen on a session. `Close` is always the last one.
#[derive(Debug)]
pub enum SessionEvent {
    Secure(SecureInfo),
    /// the peer opened a stream
    Stream(Stream),
    Keylog(String),
    /// a ticket for resuming the session later, together with the server's transport parameters
    ///  to remember for early stream limits
    SessionTicket { ticket: Bytes, remote_params: TransportParams },
    Datagram(Bytes),
    /// the peer's new address answered a PATH_CHALLENGE
    PathValidated(SocketAddr),
    Error(QuicError),
    Close(CloseInfo),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CloseInfo {
    pub code: CloseCode,
    pub reason: String,
    pub idle_timeout: bool,
    pub stateless_reset: bool,
}
impl CloseInfo {
    pub(crate) fn local(code: CloseCode) -> CloseInfo {
        CloseInfo {
            code,
            reason: String::new(),
            idle_timeout: false,
            stateless_reset: false,
        }
    }
}

/// Where a session sends from. This changes on migration.
pub(crate) struct SessionPath {
    pub endpoint: Weak<EndpointShared>,
    pub socket: Arc<dyn DatagramSocket>,
    /// endpoints the session migrated away from. They keep routing packets to the session
    ///  (instead of answering them with a stateless reset) until it is drained.
    pub previous: Vec<Weak<EndpointShared>>,
}

impl SessionPath {
    pub fn new(endpoint: Weak<EndpointShared>, socket: Arc<dyn DatagramSocket>) -> SessionPath {
        SessionPath {
            endpoint,
            socket,
            previous: Vec::new(),
        }
    }
}

struct SessionEvents {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    closed: bool,
}

/// The state of a session that is shared between application handles, the endpoint's receive
///  loop and the session's driver task.
pub(crate) struct SessionShared {
    side: Side,
    local_cid: ConnectionId,
    inner: Mutex<SessionInner>,
    wakeup: Notify,
    events: tokio::sync::Mutex<SessionEvents>,
    handshake: watch::Receiver<HandshakeStatus>,
    closed: watch::Receiver<bool>,
    path: Mutex<SessionPath>,
}

impl SessionShared {
    /// Creates the session, starts its handshake and spawns its driver task
    pub fn start(mut setup: SessionSetup, path: SessionPath) -> Arc<SessionShared> {
        let side = setup.side;
        let local_cid = setup.local_cid;

        let shared = Arc::new_cyclic(|weak_self| {
            setup.weak_self = weak_self.clone();
            let (inner, channels) = SessionInner::new(setup);
            SessionShared {
                side,
                local_cid,
                inner: Mutex::new(inner),
                wakeup: Notify::new(),
                events: tokio::sync::Mutex::new(SessionEvents { rx: channels.events, closed: false }),
                handshake: channels.handshake,
                closed: channels.closed,
                path: Mutex::new(path),
            }
        });

        shared.inner.lock().unwrap().start(Instant::now());
        tokio::spawn(shared.clone().drive().instrument(Span::current()));
        shared
    }

    pub fn local_cid(&self) -> ConnectionId {
        self.local_cid
    }

    /// Runs an operation on the state machine and wakes up the driver to send whatever it
    ///  produced
    pub fn with_inner<R>(&self, f: impl FnOnce(&mut SessionInner) -> R) -> R {
        let result = f(&mut self.inner.lock().unwrap());
        self.wakeup.notify_one();
        result
    }

    pub fn on_packet(&self, packet: Packet, from: SocketAddr, datagram_len: usize) {
        self.with_inner(|inner| inner.on_packet(packet, from, datagram_len, Instant::now()));
    }

    pub fn on_stateless_reset(&self, token: &StatelessResetToken) -> bool {
        self.with_inner(|inner| inner.on_stateless_reset(token))
    }

    pub fn on_stream_pull(&self, id: StreamId) {
        self.with_inner(|inner| inner.on_stream_pull(id));
    }

    pub fn on_stream_cancel(&self, id: StreamId, reason: &str) {
        self.with_inner(|inner| inner.on_stream_cancel(id, reason));
    }

    pub fn endpoint(&self) -> Weak<EndpointShared> {
        self.path.lock().unwrap().endpoint.clone()
    }

    /// true if the session currently sends through `endpoint`
    pub fn belongs_to(&self, endpoint: &Weak<EndpointShared>) -> bool {
        Weak::ptr_eq(&self.path.lock().unwrap().endpoint, endpoint)
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.lock().unwrap().phase()
    }

    pub async fn wait_closed(&self) {
        let mut closed = self.closed.clone();
        while !*closed.borrow_and_update() {
            if closed.changed().await.is_err() {
                return;
            }
        }
    }

    /// The session's driver: it handles timers and sends everything the state machine produces,
    ///  until the session is closed and its last packet is out. Then it removes the session from
    ///  its endpoint.
    async fn drive(self: Arc<Self>) {
        loop {
            let (transmits, deadline, drained) = {
                let mut inner = self.inner.lock().unwrap();
                let now = Instant::now();
                inner.on_timeout(now);
                (inner.poll_transmits(now), inner.next_deadline(), inner.is_drained())
            };

            let (socket, endpoint, previous) = {
                let path = self.path.lock().unwrap();
                (path.socket.clone(), path.endpoint.upgrade(), path.previous.clone())
            };
            for transmit in &transmits {
                socket.send_datagram(transmit.to, &transmit.payload).await;
            }
            if let Some(endpoint) = &endpoint {
                endpoint.record_sent(&transmits);
            }

            if drained {
                debug!("session {:?} is drained - stopping its driver", self.local_cid);
                for endpoint in endpoint.into_iter().chain(previous.iter().filter_map(Weak::upgrade)) {
                    endpoint.deregister(&self);
                }
                return;
            }

            match deadline {
                Some(deadline) => select! {
                    _ = self.wakeup.notified() => {}
                    _ = sleep_until(deadline) => {
                        trace!("session {:?}: timer expired", self.local_cid);
                    }
                },
                None => self.wakeup.notified().await,
            }
        }
    }
}

/// A QUIC session. This is a cheap handle, clones refer to the same session.
#[derive(Clone)]
pub struct Session {
    pub(crate) shared: Arc<SessionShared>,
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("side", &self.shared.side)
            .field("local_cid", &self.shared.local_cid)
            .finish()
    }
}

impl Session {
    pub fn side(&self) -> Side {
        self.shared.side
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.phase()
    }

    /// Opens a new local stream. Before the handshake completes, the stream is pending: writes
    ///  are buffered, and it is announced to the peer once the session is secure.
    pub fn open_stream(&self, options: StreamOptions) -> Result<Stream, QuicError> {
        self.shared.with_inner(|inner| inner.open_stream(&options))
    }

    /// Waits for the handshake to finish
    pub async fn handshake_completed(&self) -> Result<SecureInfo, QuicError> {
        let mut handshake = self.shared.handshake.clone();
        loop {
            let status = handshake.borrow_and_update().clone();
            match status {
                HandshakeStatus::Secure(info) => return Ok(info),
                HandshakeStatus::Failed(e) => return Err(e),
                HandshakeStatus::Pending => {}
            }
            if handshake.changed().await.is_err() {
                return Err(QuicError::HandshakeCanceled);
            }
        }
    }

    /// The next event, or `None` after `Close` was delivered
    pub async fn next_event(&self) -> Option<SessionEvent> {
        let mut events = self.shared.events.lock().await;
        if events.closed {
            return None;
        }
        let event = events.rx.recv().await;
        if matches!(event, Some(SessionEvent::Close(_)) | None) {
            events.closed = true;
        }
        event
    }

    /// Graceful close: no new streams are accepted, and the session closes with `code` once all
    ///  open streams are done. Returns when the session is closed.
    pub async fn close(&self, code: u64) {
        self.shared.with_inner(|inner| inner.close(code));
        self.shared.wait_closed().await;
    }

    /// Immediate close. The peer gets INTERNAL_ERROR if there is an error, NO_ERROR otherwise.
    pub fn destroy(&self, error: Option<QuicError>) {
        self.shared.with_inner(|inner| inner.destroy(error));
    }

    /// Drops the session without notifying the peer
    pub fn destroy_silently(&self) {
        self.shared.with_inner(|inner| inner.destroy_silently());
    }

    pub fn send_datagram(&self, data: impl Into<Bytes>) -> Result<(), QuicError> {
        let data = data.into();
        self.shared.with_inner(|inner| inner.send_datagram(data))
    }

    /// Moves the session to the (primary) binding of another endpoint. Its connection id is
    ///  routed through the target from now on, and the peer learns the new address from the
    ///  first packet sent from there.
    pub fn migrate(&self, target: &Endpoint) -> Result<(), QuicError> {
        let socket = target.shared.primary_socket()
            .ok_or_else(|| QuicError::arg_type("endpoint", "a bound endpoint that is not closing"))?;

        let host = self.shared.with_inner(|inner| {
            inner.migrate(socket.local_addr())?;
            Ok::<_, QuicError>(inner.peer_addr().ip())
        })?;

        {
            let mut path = self.shared.path.lock().unwrap();
            let old_endpoint = mem::replace(&mut path.endpoint, Arc::downgrade(&target.shared));
            path.socket = socket;
            if !Weak::ptr_eq(&old_endpoint, &path.endpoint) {
                path.previous.push(old_endpoint);
            }
        }
        target.shared.register(self.shared.clone(), host);
        Ok(())
    }

    /// The endpoint the session currently belongs to, if it is still alive
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.shared.endpoint().upgrade()
            .map(|shared| Endpoint { shared })
    }

    pub fn peer_certificate(&self) -> Option<Bytes> {
        self.shared.inner.lock().unwrap().peer_certificate()
    }

    pub fn local_address(&self) -> SocketAddr {
        self.shared.inner.lock().unwrap().local_addr()
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.shared.inner.lock().unwrap().peer_addr()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.inner.lock().unwrap().stats()
    }
}
