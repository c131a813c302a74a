use std::time::Duration;

use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::VarIntSupportMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::trace;

use crate::buf_ext::{try_get_varint, try_get_varint_usize};
use crate::connection_id::StatelessResetToken;
use crate::safe_converter::SafeCast;

#[repr(u64)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
enum TransportParamId {
    MaxIdleTimeout = 0x01,
    StatelessResetToken = 0x02,
    InitialMaxData = 0x04,
    InitialMaxStreamDataBidiLocal = 0x05,
    InitialMaxStreamDataBidiRemote = 0x06,
    InitialMaxStreamDataUni = 0x07,
    InitialMaxStreamsBidi = 0x08,
    InitialMaxStreamsUni = 0x09,
    DisableActiveMigration = 0x0c,
}

/// The parameters each side announces during the handshake. The 'local' / 'remote' in the per-stream
///  limits are from the point of view of the side that sends them, i.e. `initial_max_stream_data_bidi_local`
///  limits data on bidi streams that this side opened.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TransportParams {
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    /// zero means 'no idle timeout'. This is filled in from [crate::config::SessionConfig::idle_timeout]
    ///  when a session starts its handshake.
    pub max_idle_timeout: Duration,
    pub disable_active_migration: bool,
    /// filled in by the session
    pub stateless_reset_token: Option<StatelessResetToken>,
}

impl Default for TransportParams {
    fn default() -> Self {
        TransportParams {
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 3,
            initial_max_data: 1024 * 1024,
            initial_max_stream_data_bidi_local: 256 * 1024,
            initial_max_stream_data_bidi_remote: 256 * 1024,
            initial_max_stream_data_uni: 256 * 1024,
            max_idle_timeout: Duration::ZERO,
            disable_active_migration: false,
            stateless_reset_token: None,
        }
    }
}

impl TransportParams {
    /// Encoded as a sequence of `(id: varint, len: varint, value)` entries. Entries with unknown
    ///  ids are skipped on parsing, so new parameters can be added without breaking older peers.
    pub fn ser(&self, buf: &mut impl BufMut) {
        Self::put_varint_param(buf, TransportParamId::MaxIdleTimeout, self.max_idle_timeout.as_millis() as u64);
        if let Some(token) = &self.stateless_reset_token {
            buf.put_u64_varint(TransportParamId::StatelessResetToken.into());
            buf.put_usize_varint(StatelessResetToken::LEN);
            buf.put_slice(&token.0);
        }
        Self::put_varint_param(buf, TransportParamId::InitialMaxData, self.initial_max_data);
        Self::put_varint_param(buf, TransportParamId::InitialMaxStreamDataBidiLocal, self.initial_max_stream_data_bidi_local);
        Self::put_varint_param(buf, TransportParamId::InitialMaxStreamDataBidiRemote, self.initial_max_stream_data_bidi_remote);
        Self::put_varint_param(buf, TransportParamId::InitialMaxStreamDataUni, self.initial_max_stream_data_uni);
        Self::put_varint_param(buf, TransportParamId::InitialMaxStreamsBidi, self.initial_max_streams_bidi);
        Self::put_varint_param(buf, TransportParamId::InitialMaxStreamsUni, self.initial_max_streams_uni);
        if self.disable_active_migration {
            buf.put_u64_varint(TransportParamId::DisableActiveMigration.into());
            buf.put_u8(0);
        }
    }

    fn put_varint_param(buf: &mut impl BufMut, id: TransportParamId, value: u64) {
        let mut value_buf = BytesMut::with_capacity(10);
        value_buf.put_u64_varint(value);

        buf.put_u64_varint(id.into());
        buf.put_usize_varint(value_buf.len());
        buf.put_slice(&value_buf);
    }

    /// Parameters that are missing on the wire are zero / absent, not the local defaults
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<TransportParams> {
        let mut result = TransportParams {
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            max_idle_timeout: Duration::ZERO,
            disable_active_migration: false,
            stateless_reset_token: None,
        };

        while buf.has_remaining() {
            let raw_id = try_get_varint(buf)?;
            let len = try_get_varint_usize(buf)?;
            let mut value = buf.copy_to_bytes(len);

            let id = match TransportParamId::try_from(raw_id) {
                Ok(id) => id,
                Err(_) => {
                    trace!("skipping unknown transport parameter {:x}", raw_id);
                    continue;
                }
            };

            match id {
                TransportParamId::MaxIdleTimeout => result.max_idle_timeout = Duration::from_millis(try_get_varint(&mut value)?),
                TransportParamId::StatelessResetToken => {
                    if value.len() != StatelessResetToken::LEN {
                        bail!("stateless reset token has length {}", value.len());
                    }
                    let mut token = [0u8; StatelessResetToken::LEN];
                    value.copy_to_slice(&mut token);
                    result.stateless_reset_token = Some(StatelessResetToken(token));
                }
                TransportParamId::InitialMaxData => result.initial_max_data = try_get_varint(&mut value)?,
                TransportParamId::InitialMaxStreamDataBidiLocal => result.initial_max_stream_data_bidi_local = try_get_varint(&mut value)?,
                TransportParamId::InitialMaxStreamDataBidiRemote => result.initial_max_stream_data_bidi_remote = try_get_varint(&mut value)?,
                TransportParamId::InitialMaxStreamDataUni => result.initial_max_stream_data_uni = try_get_varint(&mut value)?,
                TransportParamId::InitialMaxStreamsBidi => result.initial_max_streams_bidi = try_get_varint(&mut value)?,
                TransportParamId::InitialMaxStreamsUni => result.initial_max_streams_uni = try_get_varint(&mut value)?,
                TransportParamId::DisableActiveMigration => result.disable_active_migration = true,
            }
        }

        if result.initial_max_streams_bidi > (1u64 << 60) || result.initial_max_streams_uni > (1u64 << 60) {
            bail!("stream limits exceed 2^60");
        }
        Ok(result)
    }

    /// The idle timeout both sides agree on: the smaller of the two values, ignoring zero (which
    ///  means 'disabled').
    pub fn effective_idle_timeout(local: Duration, remote: Duration) -> Option<Duration> {
        match (local.is_zero(), remote.is_zero()) {
            (true, true) => None,
            (false, true) => Some(local),
            (true, false) => Some(remote),
            (false, false) => Some(local.min(remote)),
        }
    }

    pub fn serialized_len(&self) -> u64 {
        let mut buf = Vec::new();
        self.ser(&mut buf);
        buf.len().safe_cast()
    }
}
