use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::VarIntSupportMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::buf_ext::{hex, put_bytes, put_optional_bytes, put_string, try_get_bytes, try_get_optional_bytes, try_get_string, try_get_varint_usize};
use crate::config::SessionConfig;
use crate::transport_params::TransportParams;

/// What a session learns about the negotiated connection once its handshake completes
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SecureInfo {
    pub servername: String,
    /// `None` if neither side configured any protocols
    pub alpn: Option<String>,
    pub cipher: String,
    pub cipher_version: String,
    /// true if the client presented a session ticket that the server accepted
    pub resumed: bool,
}

/// Output of a handshake step, to be processed by the session in order
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HandshakeEvent {
    /// send this in a CRYPTO frame
    Send(Bytes),
    RemoteParams(TransportParams),
    PeerCertificate(Bytes),
    Keylog(String),
    /// the handshake is complete from this side's perspective
    Secure(SecureInfo),
}

/// One side of a handshake. Each `Send` output is delivered to the peer's `on_crypto` exactly
///  once and in order.
pub trait Handshake: Send {
    /// Called once when the session starts. Clients return their first flight.
    fn start(&mut self) -> anyhow::Result<Vec<HandshakeEvent>>;

    fn on_crypto(&mut self, data: Bytes) -> anyhow::Result<Vec<HandshakeEvent>>;

    /// Servers only: a session ticket to send to the client after the handshake completed.
    fn issue_ticket(&mut self) -> Option<Bytes>;
}

/// This is the seam for plugging in real TLS: the engine only depends on this trait
pub trait HandshakeProvider: Send + Sync {
    fn client_session(&self, config: &SessionConfig, local_params: &TransportParams) -> Box<dyn Handshake>;
    fn server_session(&self, config: &SessionConfig, local_params: &TransportParams) -> Box<dyn Handshake>;
}

/// A handshake without any cryptography. It negotiates ALPN, exchanges transport parameters and
///  certificates, and supports session tickets - everything the engine needs, in plaintext. It
///  is meant for tests and for development setups.
///
/// ```ascii
/// CLIENT_HELLO:    type (u8), client random (32 bytes), servername (string),
///                   alpn (varint count + strings), transport params (bytes),
///                   session ticket (optional bytes)
/// SERVER_HELLO:    type (u8), server random (32 bytes), selected alpn (string, empty for none),
///                   transport params (bytes), certificate (optional bytes),
///                   certificate requested (u8), resumed (u8)
/// CLIENT_FINISHED: type (u8), certificate (optional bytes)
/// ```
pub struct PlainHandshakeProvider;

impl HandshakeProvider for PlainHandshakeProvider {
    fn client_session(&self, config: &SessionConfig, local_params: &TransportParams) -> Box<dyn Handshake> {
        Box::new(PlainHandshake::new(false, config, local_params))
    }

    fn server_session(&self, config: &SessionConfig, local_params: &TransportParams) -> Box<dyn Handshake> {
        Box::new(PlainHandshake::new(true, config, local_params))
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
enum MessageType {
    ClientHello = 1,
    ServerHello = 2,
    ClientFinished = 3,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum PlainState {
    Start,
    /// client: CLIENT_HELLO sent; server: waiting for it
    AwaitingHello,
    /// server only: SERVER_HELLO sent
    AwaitingFinished,
    Done,
}

const RANDOM_LEN: usize = 32;
const TICKET_ID_LEN: usize = 16;
const CIPHER: &str = "NULL";
const CIPHER_VERSION: &str = "plain/1";

struct PlainHandshake {
    is_server: bool,
    state: PlainState,
    servername: String,
    alpn: Vec<String>,
    certificate: Option<Bytes>,
    request_cert: bool,
    keylog: bool,
    session_ticket: Option<Bytes>,
    local_params: TransportParams,
    client_random: [u8; RANDOM_LEN],
    server_random: [u8; RANDOM_LEN],
    selected_alpn: Option<String>,
    resumed: bool,
}

impl PlainHandshake {
    fn new(is_server: bool, config: &SessionConfig, local_params: &TransportParams) -> PlainHandshake {
        PlainHandshake {
            is_server,
            state: PlainState::Start,
            servername: config.servername.clone(),
            alpn: config.alpn.clone(),
            certificate: config.certificate.clone(),
            request_cert: config.request_cert,
            keylog: config.keylog,
            session_ticket: if is_server { None } else { config.session_ticket.clone() },
            local_params: local_params.clone(),
            client_random: [0; RANDOM_LEN],
            server_random: [0; RANDOM_LEN],
            selected_alpn: None,
            resumed: false,
        }
    }

    fn secure_info(&self) -> SecureInfo {
        SecureInfo {
            servername: self.servername.clone(),
            alpn: self.selected_alpn.clone(),
            cipher: CIPHER.to_string(),
            cipher_version: CIPHER_VERSION.to_string(),
            resumed: self.resumed,
        }
    }

    /// NSS key log lines. There is no encryption, so the 'secrets' are derived from both randoms
    ///  and only serve to correlate captured traffic with sessions.
    fn keylog_events(&self, events: &mut Vec<HandshakeEvent>) {
        if !self.keylog {
            return;
        }
        for label in ["CLIENT_HANDSHAKE_TRAFFIC_SECRET", "SERVER_HANDSHAKE_TRAFFIC_SECRET", "CLIENT_TRAFFIC_SECRET_0", "SERVER_TRAFFIC_SECRET_0"] {
            let mut hasher = Sha256::new();
            hasher.update(label.as_bytes());
            hasher.update(self.client_random);
            hasher.update(self.server_random);
            let secret = hasher.finalize();
            events.push(HandshakeEvent::Keylog(format!("{} {} {}", label, hex(&self.client_random), hex(&secret))));
        }
    }

    fn check_message_type(buf: &mut Bytes, expected: MessageType) -> anyhow::Result<()> {
        let raw = buf.try_get_u8()?;
        let actual = MessageType::try_from(raw)
            .map_err(|_| anyhow!("invalid handshake message type {}", raw))?;
        if actual != expected {
            bail!("expected {:?}, got {:?}", expected, actual);
        }
        Ok(())
    }

    fn try_get_random(buf: &mut Bytes) -> anyhow::Result<[u8; RANDOM_LEN]> {
        if buf.remaining() < RANDOM_LEN {
            bail!("handshake message too short");
        }
        let mut result = [0u8; RANDOM_LEN];
        buf.copy_to_slice(&mut result);
        Ok(result)
    }

    fn ser_params(params: &TransportParams, buf: &mut BytesMut) {
        let mut raw = BytesMut::new();
        params.ser(&mut raw);
        put_bytes(buf, &raw);
    }

    fn deser_params(buf: &mut Bytes) -> anyhow::Result<TransportParams> {
        let mut raw = try_get_bytes(buf)?;
        TransportParams::deser(&mut raw)
    }

    fn client_hello(&mut self) -> Bytes {
        self.client_random = rand::random();

        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ClientHello.into());
        buf.put_slice(&self.client_random);
        put_string(&mut buf, &self.servername);
        buf.put_usize_varint(self.alpn.len());
        for protocol in &self.alpn {
            put_string(&mut buf, protocol);
        }
        Self::ser_params(&self.local_params, &mut buf);
        put_optional_bytes(&mut buf, self.session_ticket.as_deref());
        buf.freeze()
    }

    fn on_client_hello(&mut self, mut buf: Bytes) -> anyhow::Result<Vec<HandshakeEvent>> {
        Self::check_message_type(&mut buf, MessageType::ClientHello)?;
        self.client_random = Self::try_get_random(&mut buf)?;
        self.servername = try_get_string(&mut buf)?;
        let num_protocols = try_get_varint_usize(&mut buf)?;
        let mut offered = Vec::with_capacity(num_protocols);
        for _ in 0..num_protocols {
            offered.push(try_get_string(&mut buf)?);
        }
        let remote_params = Self::deser_params(&mut buf)?;
        let ticket = try_get_optional_bytes(&mut buf)?;

        self.selected_alpn = if self.alpn.is_empty() && offered.is_empty() {
            None
        }
        else {
            match self.alpn.iter().find(|p| offered.contains(p)) {
                Some(p) => Some(p.clone()),
                None => bail!("no common application protocol: client offered {:?}, server supports {:?}", offered, self.alpn),
            }
        };

        self.resumed = match ticket {
            Some(mut ticket) => match try_get_string(&mut ticket) {
                Ok(alpn) => Some(alpn) == self.selected_alpn && ticket.remaining() == TICKET_ID_LEN,
                Err(_) => false,
            },
            None => false,
        };
        debug!("received client hello for {}, selected protocol {:?}, resumed: {}", self.servername, self.selected_alpn, self.resumed);

        self.server_random = rand::random();
        let mut reply = BytesMut::new();
        reply.put_u8(MessageType::ServerHello.into());
        reply.put_slice(&self.server_random);
        put_string(&mut reply, self.selected_alpn.as_deref().unwrap_or(""));
        Self::ser_params(&self.local_params, &mut reply);
        put_optional_bytes(&mut reply, self.certificate.as_deref());
        reply.put_u8(self.request_cert.into());
        reply.put_u8(self.resumed.into());

        self.state = PlainState::AwaitingFinished;
        Ok(vec![
            HandshakeEvent::RemoteParams(remote_params),
            HandshakeEvent::Send(reply.freeze()),
        ])
    }

    fn on_server_hello(&mut self, mut buf: Bytes) -> anyhow::Result<Vec<HandshakeEvent>> {
        Self::check_message_type(&mut buf, MessageType::ServerHello)?;
        self.server_random = Self::try_get_random(&mut buf)?;
        let alpn = try_get_string(&mut buf)?;
        let remote_params = Self::deser_params(&mut buf)?;
        let server_certificate = try_get_optional_bytes(&mut buf)?;
        let cert_requested = buf.try_get_u8()? != 0;
        self.resumed = buf.try_get_u8()? != 0;

        self.selected_alpn = if alpn.is_empty() { None } else { Some(alpn) };
        if let Some(alpn) = &self.selected_alpn {
            if !self.alpn.contains(alpn) {
                bail!("server selected protocol {} that was not offered", alpn);
            }
        }

        let mut events = vec![HandshakeEvent::RemoteParams(remote_params)];
        if let Some(cert) = server_certificate {
            events.push(HandshakeEvent::PeerCertificate(cert));
        }

        let mut finished = BytesMut::new();
        finished.put_u8(MessageType::ClientFinished.into());
        put_optional_bytes(&mut finished, if cert_requested { self.certificate.as_deref() } else { None });
        events.push(HandshakeEvent::Send(finished.freeze()));

        self.keylog_events(&mut events);
        self.state = PlainState::Done;
        events.push(HandshakeEvent::Secure(self.secure_info()));
        Ok(events)
    }

    fn on_client_finished(&mut self, mut buf: Bytes) -> anyhow::Result<Vec<HandshakeEvent>> {
        Self::check_message_type(&mut buf, MessageType::ClientFinished)?;
        let client_certificate = try_get_optional_bytes(&mut buf)?;

        let mut events = Vec::new();
        if let Some(cert) = client_certificate {
            events.push(HandshakeEvent::PeerCertificate(cert));
        }
        self.keylog_events(&mut events);
        self.state = PlainState::Done;
        events.push(HandshakeEvent::Secure(self.secure_info()));
        Ok(events)
    }
}

impl Handshake for PlainHandshake {
    fn start(&mut self) -> anyhow::Result<Vec<HandshakeEvent>> {
        if self.state != PlainState::Start {
            bail!("handshake was already started");
        }
        self.state = PlainState::AwaitingHello;
        if self.is_server {
            Ok(vec![])
        }
        else {
            Ok(vec![HandshakeEvent::Send(self.client_hello())])
        }
    }

    fn on_crypto(&mut self, data: Bytes) -> anyhow::Result<Vec<HandshakeEvent>> {
        match (self.is_server, self.state) {
            (true, PlainState::AwaitingHello) => self.on_client_hello(data),
            (true, PlainState::AwaitingFinished) => self.on_client_finished(data),
            (false, PlainState::AwaitingHello) => self.on_server_hello(data),
            (_, state) => bail!("unexpected handshake message in state {:?}", state),
        }
    }

    fn issue_ticket(&mut self) -> Option<Bytes> {
        if !self.is_server || self.state != PlainState::Done {
            return None;
        }
        let mut ticket = BytesMut::new();
        put_string(&mut ticket, self.selected_alpn.as_deref().unwrap_or(""));
        ticket.put_slice(&rand::random::<[u8; TICKET_ID_LEN]>());
        Some(ticket.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config(alpn: &[&str]) -> SessionConfig {
        SessionConfig {
            alpn: alpn.iter().map(|s| s.to_string()).collect(),
            ..SessionConfig::default()
        }
    }

    fn sent(events: &[HandshakeEvent]) -> Bytes {
        events.iter()
            .find_map(|e| match e {
                HandshakeEvent::Send(data) => Some(data.clone()),
                _ => None,
            })
            .unwrap()
    }

    fn secure(events: &[HandshakeEvent]) -> Option<SecureInfo> {
        events.iter()
            .find_map(|e| match e {
                HandshakeEvent::Secure(info) => Some(info.clone()),
                _ => None,
            })
    }

    /// runs a full handshake, returning the client's and the server's events
    fn run(client_config: &SessionConfig, server_config: &SessionConfig) -> anyhow::Result<(Vec<HandshakeEvent>, Vec<HandshakeEvent>)> {
        let client_params = TransportParams { initial_max_streams_uni: 7, ..TransportParams::default() };
        let server_params = TransportParams { initial_max_streams_bidi: 9, ..TransportParams::default() };
        let mut client = PlainHandshakeProvider.client_session(client_config, &client_params);
        let mut server = PlainHandshakeProvider.server_session(server_config, &server_params);

        let hello = sent(&client.start()?);
        assert!(server.start()?.is_empty());
        let mut server_events = server.on_crypto(hello)?;
        assert!(server_events.contains(&HandshakeEvent::RemoteParams(client_params)));

        let client_events = client.on_crypto(sent(&server_events))?;
        assert!(client_events.contains(&HandshakeEvent::RemoteParams(server_params)));
        server_events.extend(server.on_crypto(sent(&client_events))?);
        Ok((client_events, server_events))
    }

    #[rstest]
    #[case::first_choice(&["h3", "hq"], &["h3"], Some("h3"))]
    #[case::server_preference(&["hq", "h3"], &["h3", "hq"], Some("h3"))]
    #[case::none_configured(&[], &[], None)]
    fn test_alpn_negotiation(#[case] client_alpn: &[&str], #[case] server_alpn: &[&str], #[case] expected: Option<&str>) {
        let (client_events, server_events) = run(&config(client_alpn), &config(server_alpn)).unwrap();
        let client_info = secure(&client_events).unwrap();
        let server_info = secure(&server_events).unwrap();
        assert_eq!(client_info, server_info);
        assert_eq!(client_info.alpn.as_deref(), expected);
        assert_eq!(client_info.cipher, "NULL");
    }

    #[test]
    fn test_alpn_mismatch_fails() {
        assert!(run(&config(&["h3"]), &config(&["smtp"])).is_err());
    }

    #[test]
    fn test_certificates() {
        let client_config = SessionConfig {
            certificate: Some(Bytes::from_static(b"client cert")),
            ..SessionConfig::default()
        };
        let server_config = SessionConfig {
            certificate: Some(Bytes::from_static(b"server cert")),
            request_cert: true,
            ..SessionConfig::default()
        };
        let (client_events, server_events) = run(&client_config, &server_config).unwrap();
        assert!(client_events.contains(&HandshakeEvent::PeerCertificate(Bytes::from_static(b"server cert"))));
        assert!(server_events.contains(&HandshakeEvent::PeerCertificate(Bytes::from_static(b"client cert"))));
    }

    #[test]
    fn test_client_cert_only_when_requested() {
        let client_config = SessionConfig {
            certificate: Some(Bytes::from_static(b"client cert")),
            ..SessionConfig::default()
        };
        let (_, server_events) = run(&client_config, &SessionConfig::default()).unwrap();
        assert!(!server_events.iter().any(|e| matches!(e, HandshakeEvent::PeerCertificate(_))));
    }

    #[test]
    fn test_keylog() {
        let client_config = SessionConfig { keylog: true, ..SessionConfig::default() };
        let (client_events, server_events) = run(&client_config, &SessionConfig::default()).unwrap();

        let lines: Vec<_> = client_events.iter()
            .filter_map(|e| match e {
                HandshakeEvent::Keylog(line) => Some(line.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[2].starts_with("CLIENT_TRAFFIC_SECRET_0 "));
        assert!(!server_events.iter().any(|e| matches!(e, HandshakeEvent::Keylog(_))));
    }

    #[test]
    fn test_resumption_with_ticket() {
        let server_config = SessionConfig::default();
        let mut server = PlainHandshakeProvider.server_session(&server_config, &TransportParams::default());
        let mut client = PlainHandshakeProvider.client_session(&SessionConfig::default(), &TransportParams::default());
        assert!(server.start().unwrap().is_empty());
        assert_eq!(server.issue_ticket(), None);

        let server_events = server.on_crypto(sent(&client.start().unwrap())).unwrap();
        let client_events = client.on_crypto(sent(&server_events)).unwrap();
        assert!(!secure(&client_events).unwrap().resumed);
        server.on_crypto(sent(&client_events)).unwrap();
        let ticket = server.issue_ticket().unwrap();

        let resuming_config = SessionConfig {
            session_ticket: Some(ticket),
            remote_transport_params: Some(TransportParams::default()),
            ..SessionConfig::default()
        };
        let (client_events, server_events) = run(&resuming_config, &server_config).unwrap();
        assert!(secure(&client_events).unwrap().resumed);
        assert!(secure(&server_events).unwrap().resumed);
    }

    #[test]
    fn test_unexpected_message() {
        let mut client = PlainHandshakeProvider.client_session(&SessionConfig::default(), &TransportParams::default());
        let hello = sent(&client.start().unwrap());
        assert!(client.on_crypto(hello).is_err());
        assert!(client.start().is_err());
    }
}
