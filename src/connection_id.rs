use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::{Buf, BufMut};
use sha2::{Digest, Sha256};

use crate::buf_ext::hex;
use crate::safe_converter::PrecheckedCast;

/// An opaque connection id of up to 20 bytes, chosen by the end point that receives packets
///  addressed to it
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; ConnectionId::MAX_LEN],
}
impl Debug for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CID{{{}}}", hex(self.as_slice()))
    }
}

impl ConnectionId {
    pub const MAX_LEN: usize = 20;
    pub const DEFAULT_LEN: usize = 8;

    pub fn random() -> ConnectionId {
        let raw: [u8; Self::DEFAULT_LEN] = rand::random();
        Self::from_slice(&raw)
            .expect("default length is below the maximum")
    }

    pub fn from_slice(data: &[u8]) -> anyhow::Result<ConnectionId> {
        if data.is_empty() || data.len() > Self::MAX_LEN {
            bail!("invalid connection id length {}", data.len());
        }
        let mut bytes = [0u8; Self::MAX_LEN];
        bytes[..data.len()].copy_from_slice(data);
        Ok(ConnectionId {
            len: data.len().prechecked_cast(),
            bytes,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.len);
        buf.put_slice(self.as_slice());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ConnectionId> {
        let len = buf.try_get_u8()? as usize;
        if buf.remaining() < len {
            bail!("connection id of length {} exceeds the buffer", len);
        }
        let mut raw = [0u8; Self::MAX_LEN];
        if len > Self::MAX_LEN {
            bail!("invalid connection id length {}", len);
        }
        buf.copy_to_slice(&mut raw[..len]);
        Self::from_slice(&raw[..len])
    }

    pub fn serialized_len(&self) -> usize {
        1 + self.len as usize
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct StatelessResetToken(pub [u8; StatelessResetToken::LEN]);
impl Debug for StatelessResetToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RST{{{}}}", hex(&self.0))
    }
}
impl StatelessResetToken {
    pub const LEN: usize = 16;
}

/// Derives stateless reset tokens from a static per-endpoint secret, so that an end point that
///  lost all state for a connection can still produce the token it announced for that connection
///  id: `token = SHA-256(secret || connection id)[..16]`
pub struct ResetTokenGenerator {
    secret: [u8; 16],
}
impl ResetTokenGenerator {
    pub fn new(secret: [u8; 16]) -> ResetTokenGenerator {
        ResetTokenGenerator { secret }
    }

    pub fn token_for(&self, cid: &ConnectionId) -> StatelessResetToken {
        let mut sha256 = Sha256::default();
        sha256.update(self.secret);
        sha256.update(cid.as_slice());
        let digest = sha256.finalize();

        let mut token = [0u8; StatelessResetToken::LEN];
        token.copy_from_slice(&digest[..StatelessResetToken::LEN]);
        StatelessResetToken(token)
    }
}
