use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashSet;

use crate::buf_ext::hex;
use crate::error::QuicError;
use crate::handshake::{HandshakeProvider, PlainHandshakeProvider};
use crate::transport_params::TransportParams;

pub struct EndpointConfig {
    /// The first address to bind to. Further addresses can be added via
    ///  [crate::endpoint::Endpoint::add_endpoint].
    pub address: SocketAddr,

    /// This is the UDP payload size that the endpoint assumes all routes to support. QUIC requires
    ///  at least 1200 bytes, and that is also the default since it is safe for both IPV4 and IPV6
    ///  with every realistic tunnelling overhead.
    ///
    /// Choosing this value too big causes packets to be dropped silently on routes with smaller
    ///  MTU, so raise it only if you know the network.
    pub max_payload_size: usize,

    pub max_connections_per_host: usize,
    pub max_connections_total: usize,

    /// Number of stateless reset packets sent to a single host before further replies to that
    ///  host are suppressed. This limits amplification with spoofed source addresses.
    pub max_stateless_resets_per_host: usize,
    /// The per host reset counts start over after this period
    pub stateless_reset_period: Duration,
    /// Number of hosts whose stateless reset counts are remembered. Beyond that, the least
    ///  recently seen host is forgotten.
    pub address_lru_size: usize,
    pub disable_stateless_reset: bool,
    /// The secret that stateless reset tokens are derived from. This must be the same across
    ///  restarts for peers to recognize resets after a crash, so it should be configured
    ///  explicitly in production; a random secret is generated if this is `None`.
    pub reset_token_secret: Option<[u8; 16]>,

    /// Peers that are refused before any session state is created, and that [crate::endpoint::Endpoint::connect]
    ///  refuses to contact.
    pub blocklist: FxHashSet<IpAddr>,

    pub handshake: Arc<dyn HandshakeProvider>,
}

impl EndpointConfig {
    pub const MIN_PAYLOAD_SIZE: usize = 1200;

    /// loopback / any IPV4 address with an OS assigned port, plaintext handshake
    pub fn default_ipv4() -> EndpointConfig {
        EndpointConfig {
            address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            max_payload_size: Self::MIN_PAYLOAD_SIZE,
            max_connections_per_host: 100,
            max_connections_total: 10_000,
            max_stateless_resets_per_host: 10,
            stateless_reset_period: Duration::from_secs(60),
            address_lru_size: 1000,
            disable_stateless_reset: false,
            reset_token_secret: None,
            blocklist: FxHashSet::default(),
            handshake: Arc::new(PlainHandshakeProvider),
        }
    }

    pub fn with_address(address: SocketAddr) -> EndpointConfig {
        EndpointConfig {
            address,
            ..Self::default_ipv4()
        }
    }

    pub fn validate(&self) -> Result<(), QuicError> {
        if self.max_payload_size < Self::MIN_PAYLOAD_SIZE || self.max_payload_size > 65527 {
            return Err(QuicError::out_of_range("max_payload_size", self.max_payload_size, "[1200, 65527]"));
        }
        if self.max_connections_total == 0 {
            return Err(QuicError::out_of_range("max_connections_total", self.max_connections_total, ">= 1"));
        }
        if self.max_connections_per_host == 0 {
            return Err(QuicError::out_of_range("max_connections_per_host", self.max_connections_per_host, ">= 1"));
        }
        if self.address_lru_size == 0 {
            return Err(QuicError::out_of_range("address_lru_size", self.address_lru_size, ">= 1"));
        }
        Ok(())
    }
}

/// Configuration for the sessions of an endpoint, used by both `listen` (for all server sessions
///  created by it) and `connect`.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// SNI sent by clients
    pub servername: String,
    /// application protocols, in order of preference. A server picks the first one offered by the
    ///  client that it supports itself; no overlap fails the handshake.
    pub alpn: Vec<String>,
    /// Zero disables the idle timeout on this side. The effective timeout is the minimum of both
    ///  sides' non-zero values.
    pub idle_timeout: Duration,
    /// servers only: ask the client for its certificate
    pub request_cert: bool,
    pub certificate: Option<Bytes>,
    /// emit [crate::session::SessionEvent::Keylog] events with key material
    pub keylog: bool,
    /// clients only: a ticket from an earlier session with the same server
    pub session_ticket: Option<Bytes>,
    /// clients only: the server's transport parameters remembered with `session_ticket`. They allow
    ///  materializing streams before the handshake completes.
    pub remote_transport_params: Option<TransportParams>,
    pub transport_params: TransportParams,
    /// time after which unacknowledged packets are considered lost
    pub retransmit_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            servername: "localhost".to_string(),
            alpn: vec!["h3".to_string()],
            idle_timeout: Duration::from_secs(30),
            request_cert: false,
            certificate: None,
            keylog: false,
            session_ticket: None,
            remote_transport_params: None,
            transport_params: TransportParams::default(),
            retransmit_interval: Duration::from_millis(100),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), QuicError> {
        if self.servername.len() > 255 {
            return Err(QuicError::arg_value("servername", "must not exceed 255 bytes"));
        }
        for protocol in &self.alpn {
            if protocol.is_empty() || protocol.len() > 255 {
                return Err(QuicError::arg_value("alpn", format!("invalid protocol name '{}'", protocol)));
            }
        }
        if self.retransmit_interval.is_zero() {
            return Err(QuicError::out_of_range("retransmit_interval", "0ms", "> 0"));
        }
        if self.session_ticket.is_some() != self.remote_transport_params.is_some() {
            return Err(QuicError::arg_value("session_ticket", "ticket and remote transport parameters must be provided together"));
        }
        Ok(())
    }
}

/// Text encodings for [crate::stream::Stream::read_to_string]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Utf16Le,
    Latin1,
    Ascii,
    Hex,
}

impl FromStr for Encoding {
    type Err = QuicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "utf16le" | "utf-16le" | "ucs2" | "ucs-2" => Ok(Encoding::Utf16Le),
            "latin1" | "binary" => Ok(Encoding::Latin1),
            "ascii" => Ok(Encoding::Ascii),
            "hex" => Ok(Encoding::Hex),
            _ => Err(QuicError::arg_value("defaultEncoding", format!("unknown encoding '{}'", s))),
        }
    }
}

impl Encoding {
    /// Invalid sequences are replaced rather than reported, and an odd trailing byte in UTF-16 is
    ///  dropped.
    pub fn decode(self, data: &[u8]) -> String {
        match self {
            Encoding::Utf8 => String::from_utf8_lossy(data).into_owned(),
            Encoding::Utf16Le => {
                let units: Vec<u16> = data.chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect();
                String::from_utf16_lossy(&units)
            }
            Encoding::Latin1 => data.iter().map(|&b| b as char).collect(),
            Encoding::Ascii => data.iter().map(|&b| (b & 0x7f) as char).collect(),
            Encoding::Hex => hex(data),
        }
    }
}

/// An untyped option value, as it arrives from dynamically typed callers (configuration files,
///  bindings). [StreamOptions::from_values] is where these get validated into typed options.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl OptionValue {
    fn type_name(&self) -> &'static str {
        match self {
            OptionValue::Bool(_) => "boolean",
            OptionValue::Int(_) | OptionValue::Float(_) => "number",
            OptionValue::Str(_) => "string",
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StreamOptions {
    /// Open a unidirectional stream instead of a bidirectional one
    pub half_open: bool,
    /// Number of bytes buffered on the readable side before the stream stops granting the peer
    ///  more flow control credit
    pub high_water_mark: u64,
    pub default_encoding: Encoding,
}

impl Default for StreamOptions {
    fn default() -> Self {
        StreamOptions {
            half_open: false,
            high_water_mark: 16 * 1024,
            default_encoding: Encoding::Utf8,
        }
    }
}

impl StreamOptions {
    pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

    pub fn uni() -> StreamOptions {
        StreamOptions {
            half_open: true,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), QuicError> {
        if self.high_water_mark > Self::MAX_SAFE_INTEGER {
            return Err(QuicError::out_of_range("highWaterMark", self.high_water_mark, "[0, 2^53-1]"));
        }
        Ok(())
    }

    /// Build options from untyped key / value pairs. Keys that are not present keep their
    ///  defaults; every type or range violation is reported before anything else happens.
    pub fn from_values(values: &[(&str, OptionValue)]) -> Result<StreamOptions, QuicError> {
        let mut result = StreamOptions::default();

        for (key, value) in values {
            match *key {
                "halfOpen" => match value {
                    OptionValue::Bool(b) => result.half_open = *b,
                    _ => return Err(QuicError::arg_type(key, "boolean")),
                },
                "highWaterMark" => result.high_water_mark = Self::parse_high_water_mark(value)?,
                "defaultEncoding" => match value {
                    OptionValue::Str(s) => result.default_encoding = s.parse()?,
                    other => return Err(QuicError::arg_type(key, &format!("string, got {}", other.type_name()))),
                },
                other => return Err(QuicError::arg_value(other, "unknown stream option")),
            }
        }

        result.validate()?;
        Ok(result)
    }

    fn parse_high_water_mark(value: &OptionValue) -> Result<u64, QuicError> {
        const NAME: &str = "highWaterMark";
        let raw = match value {
            OptionValue::Int(i) => *i as i128,
            // 'as' saturates, so huge values still end up out of range
            OptionValue::Float(f) if f.is_finite() && f.fract() == 0.0 => *f as i128,
            other => return Err(QuicError::arg_type(NAME, &format!("integer, got {}", other.type_name()))),
        };

        if raw < 0 || raw > Self::MAX_SAFE_INTEGER as i128 {
            return Err(QuicError::out_of_range(NAME, raw, "[0, 2^53-1]"));
        }
        Ok(raw as u64)
    }
}
