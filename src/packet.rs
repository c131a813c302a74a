use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::VarIntSupportMut;
use crc::Crc;

use crate::buf_ext::try_get_varint;
use crate::connection_id::{ConnectionId, StatelessResetToken};

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone)]
    struct Flags: u8 {
        const FORM_LONG = 0b1000_0000;
        /// always set - datagrams without it are not ours
        const FIXED     = 0b0100_0000;
        const MASK_KIND = 0b0000_0011;

        const KIND_INITIAL         = 0b0000_0000;
        const KIND_HANDSHAKE       = 0b0000_0001;
        const KIND_SHORT           = 0b0000_0000;
        const KIND_STATELESS_RESET = 0b0000_0011;
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PacketKind {
    /// long header, the first packet(s) of a client
    Initial,
    /// long header, everything else before both sides have exchanged connection ids
    Handshake,
    Short,
}

#[derive(Clone, Eq, PartialEq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    /// the connection id chosen by the receiver of this packet
    pub dcid: ConnectionId,
    /// long header only: the sender's connection id
    pub scid: Option<ConnectionId>,
}
impl Debug for PacketHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.scid {
            Some(scid) => write!(f, "PCKT{{{:?}:{:?}->{:?}}}", self.kind, scid, self.dcid),
            None => write!(f, "PCKT{{{:?}:{:?}}}", self.kind, self.dcid),
        }
    }
}

/// A packet with its frame payload still serialized. The integrity trailer is checked during
///  parsing and not kept.
///
/// ```ascii
/// 0:  flags (u8)
///     long header:  version (u32), dcid (len u8 + bytes), scid (len u8 + bytes)
///     short header: dcid (len u8 + bytes)
/// *:  packet number (varint)
/// *:  frames
/// *:  CRC-64 over everything before it (u64)
/// ```
#[derive(Clone, Eq, PartialEq)]
pub struct Packet {
    pub header: PacketHeader,
    pub packet_number: u64,
    pub payload: Bytes,
}
impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}#{}[{}]", self.header, self.packet_number, self.payload.len())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Datagram {
    Packet(Packet),
    StatelessReset(StatelessResetToken),
}

const CRC: Crc<u64> = Crc::<u64>::new(&crc::CRC_64_REDIS);

impl Packet {
    pub const VERSION_1: u32 = 1;
    pub const TRAILER_LEN: usize = size_of::<u64>();
    /// flags, a one-byte connection id, a packet number and the trailer
    pub const MIN_LEN: usize = 1 + 2 + 1 + Self::TRAILER_LEN;

    /// the bytes a packet adds on top of its frames, as an upper bound
    pub fn overhead(dcid: &ConnectionId, scid: Option<&ConnectionId>) -> usize {
        1
            + scid.map(|scid| size_of::<u32>() + scid.serialized_len()).unwrap_or(0)
            + dcid.serialized_len()
            + 10
            + Self::TRAILER_LEN
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let start = buf.len();

        let flags = match self.header.kind {
            PacketKind::Initial => Flags::FORM_LONG | Flags::KIND_INITIAL,
            PacketKind::Handshake => Flags::FORM_LONG | Flags::KIND_HANDSHAKE,
            PacketKind::Short => Flags::KIND_SHORT,
        };
        buf.put_u8((flags | Flags::FIXED).bits());

        if self.header.kind != PacketKind::Short {
            buf.put_u32(Self::VERSION_1);
            self.header.dcid.ser(buf);
            self.header.scid.as_ref()
                .expect("long header packet without scid - this is a bug")
                .ser(buf);
        }
        else {
            self.header.dcid.ser(buf);
        }

        buf.put_u64_varint(self.packet_number);
        buf.put_slice(&self.payload);

        let checksum = CRC.checksum(&buf[start..]);
        buf.put_u64(checksum);
    }

    pub fn ser_stateless_reset(token: &StatelessResetToken, buf: &mut impl BufMut) {
        buf.put_u8((Flags::FIXED | Flags::KIND_STATELESS_RESET).bits());
        buf.put_slice(&token.0);
    }

    pub fn deser(mut buf: Bytes) -> anyhow::Result<Datagram> {
        let flags = match buf.first() {
            Some(&b) => Flags::from_bits_truncate(b),
            None => bail!("empty datagram"),
        };
        if !flags.contains(Flags::FIXED) {
            bail!("fixed bit is not set");
        }

        if !flags.contains(Flags::FORM_LONG) && (flags & Flags::MASK_KIND) == Flags::KIND_STATELESS_RESET {
            if buf.len() != 1 + StatelessResetToken::LEN {
                bail!("stateless reset packet has length {}", buf.len());
            }
            let mut token = [0u8; StatelessResetToken::LEN];
            token.copy_from_slice(&buf[1..]);
            return Ok(Datagram::StatelessReset(StatelessResetToken(token)));
        }

        if buf.len() < Self::MIN_LEN {
            bail!("datagram of length {} is shorter than the minimum packet length", buf.len());
        }

        let body_len = buf.len() - Self::TRAILER_LEN;
        let expected_checksum = (&buf[body_len..]).get_u64();
        if CRC.checksum(&buf[..body_len]) != expected_checksum {
            bail!("checksum mismatch");
        }
        buf.truncate(body_len);
        buf.advance(1);

        let header = if flags.contains(Flags::FORM_LONG) {
            let version = buf.try_get_u32()?;
            if version != Self::VERSION_1 {
                bail!("unsupported version {}", version);
            }
            let kind = match flags & Flags::MASK_KIND {
                Flags::KIND_INITIAL => PacketKind::Initial,
                Flags::KIND_HANDSHAKE => PacketKind::Handshake,
                _ => bail!("invalid long header kind"),
            };
            let dcid = ConnectionId::deser(&mut buf)?;
            let scid = ConnectionId::deser(&mut buf)?;
            PacketHeader {
                kind,
                dcid,
                scid: Some(scid),
            }
        }
        else {
            if (flags & Flags::MASK_KIND) != Flags::KIND_SHORT {
                bail!("invalid short header kind");
            }
            PacketHeader {
                kind: PacketKind::Short,
                dcid: ConnectionId::deser(&mut buf)?,
                scid: None,
            }
        };

        let packet_number = try_get_varint(&mut buf)?;
        Ok(Datagram::Packet(Packet {
            header,
            packet_number,
            payload: buf,
        }))
    }
}
