use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::mpsc;

use crate::error::QuicError;
use crate::session::Session;

/// Application callbacks of an endpoint.
///
/// Errors returned by the callbacks are reported once through `on_error`. For `on_session` the
///  error (or a panic) also refuses the session: it is closed with CONNECTION_REFUSED.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EndpointHandler: Send + Sync + 'static {
    /// a server session was created for a new client
    async fn on_session(&self, session: Session) -> anyhow::Result<()>;

    /// all bindings of the endpoint are bound
    async fn on_ready(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_listening(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_busy(&self, _busy: bool) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_error(&self, _error: QuicError) {}

    async fn on_close(&self) {}
}

#[derive(Debug)]
pub enum EndpointEvent {
    Session(Session),
    Ready,
    Listening,
    Busy(bool),
    Error(QuicError),
    Close,
}

/// An [EndpointHandler] that turns callbacks into [EndpointEvent]s on a channel, for applications
///  that prefer a pull style API
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<EndpointEvent>,
}

impl ChannelHandler {
    pub fn new() -> (Arc<ChannelHandler>, mpsc::UnboundedReceiver<EndpointEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelHandler { tx }), rx)
    }

    fn send(&self, event: EndpointEvent) -> anyhow::Result<()> {
        self.tx.send(event)
            .map_err(|_| anyhow!("endpoint event receiver was dropped"))
    }
}

#[async_trait]
impl EndpointHandler for ChannelHandler {
    async fn on_session(&self, session: Session) -> anyhow::Result<()> {
        self.send(EndpointEvent::Session(session))
    }

    async fn on_ready(&self) -> anyhow::Result<()> {
        self.send(EndpointEvent::Ready)
    }

    async fn on_listening(&self) -> anyhow::Result<()> {
        self.send(EndpointEvent::Listening)
    }

    async fn on_busy(&self, busy: bool) -> anyhow::Result<()> {
        self.send(EndpointEvent::Busy(busy))
    }

    async fn on_error(&self, error: QuicError) {
        let _ = self.send(EndpointEvent::Error(error));
    }

    async fn on_close(&self) {
        let _ = self.send(EndpointEvent::Close);
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct SessionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    /// packets that were not acknowledged within the retransmit interval
    pub packets_lost: u64,
    pub bidi_streams_opened: u64,
    pub uni_streams_opened: u64,
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct EndpointStats {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub packets_sent: u64,
    pub server_sessions: u64,
    pub client_sessions: u64,
    /// Initials refused because the endpoint was marked busy
    pub busy_count: u64,
    pub stateless_resets_sent: u64,
}
