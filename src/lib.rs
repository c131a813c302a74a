//! A QUIC-style session and stream engine over UDP.
//!
//! An [endpoint::Endpoint] owns one or more UDP bindings and routes incoming datagrams to
//!  [session::Session]s by destination connection id. Sessions multiplex ordered, flow controlled
//!  byte streams ([stream::Stream]) over a single peer relationship, with loss recovery,
//!  migration, idle timeout and stateless reset. Received stream data is delivered through a
//!  readable byte stream ([byte_stream::ByteStream]) that supports both default reads and reads
//!  into caller supplied buffers.
//!
//! ## Design goals
//!
//! * Application facing operations never block on the network: writes are queued and return a
//!   future that resolves on acknowledgement, reads return futures for data that is not there yet
//! * All protocol state of a session lives in a single synchronous state machine behind a lock.
//!   It is driven by received datagrams, timers and application calls, and its output is sent by
//!   one driver task per session
//! * The handshake is a pluggable trait. The built-in handshake is plaintext and exists for
//!   tests and development setups, so the wire format does not provide confidentiality
//! * Every path to a closed session settles all pending reads and writes, and reports exactly
//!   one close event
//!
//! ## Wire format
//!
//! Every UDP datagram carries exactly one packet, or a stateless reset:
//!
//! ```ascii
//! packet:
//!  0: flags (u8): long form (0x80), fixed bit (0x40), kind (lower two bits)
//!     long header (Initial / Handshake):
//!       version (u32), dcid (len u8 + bytes), scid (len u8 + bytes)
//!     short header:
//!       dcid (len u8 + bytes)
//!  *: packet number (varint)
//!  *: frames
//!  *: CRC-64 of everything before it (u64)
//!
//! stateless reset:
//!  0: flags (u8) - short form with kind 0x03
//!  1: token (16 bytes)
//! ```
//!
//! Frames start with a type byte followed by their fields, integers are varints (see
//!  [frame::Frame] for the details).

pub mod buf_ext;
pub mod byte_stream;
pub mod config;
pub mod connection_id;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod frame;
pub mod handshake;
pub mod packet;
pub mod range_set;
pub mod safe_converter;
pub mod send_buffer;
pub mod session;
pub mod session_state;
pub mod socket;
pub mod stream;
pub mod stream_id;
pub mod stream_state;
pub mod transport_params;
