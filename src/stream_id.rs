use std::fmt::{Debug, Display, Formatter};

use crate::error::QuicError;

/// Which end of a connection initiated it (and, for streams, which end opened the stream)
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Side {
    Client,
    Server,
}
impl Side {
    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Direction {
    Bidi,
    Uni,
}

/// A 62 bit stream id. The two low bits encode the stream's class:
///
/// ```ascii
/// 0b00  client initiated, bidirectional
/// 0b01  server initiated, bidirectional
/// 0b10  client initiated, unidirectional
/// 0b11  server initiated, unidirectional
/// ```
///
/// Ids of the same class are allocated in steps of 4.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct StreamId(u64);

impl Debug for StreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}", self.0)
    }
}
impl Display for StreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl StreamId {
    pub const MAX: u64 = (1 << 62) - 1;

    pub fn new(initiator: Side, direction: Direction, index: u64) -> StreamId {
        StreamId((index << 2) | Self::class_bits(initiator, direction))
    }

    pub fn from_raw(raw: u64) -> anyhow::Result<StreamId> {
        if raw > Self::MAX {
            anyhow::bail!("stream id {} exceeds 62 bits", raw);
        }
        Ok(StreamId(raw))
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn initiator(self) -> Side {
        if self.0 & 0b01 == 0 {
            Side::Client
        }
        else {
            Side::Server
        }
    }

    pub fn direction(self) -> Direction {
        if self.0 & 0b10 == 0 {
            Direction::Bidi
        }
        else {
            Direction::Uni
        }
    }

    /// the stream's position in its class: 0 for the first stream of the class, 1 for the
    ///  second etc.
    pub fn index(self) -> u64 {
        self.0 >> 2
    }

    /// a stream can be read locally unless it is a unidirectional stream opened locally
    pub fn is_readable_by(self, side: Side) -> bool {
        self.direction() == Direction::Bidi || self.initiator() != side
    }

    /// a stream can be written locally unless it is a unidirectional stream opened by the peer
    pub fn is_writable_by(self, side: Side) -> bool {
        self.direction() == Direction::Bidi || self.initiator() == side
    }

    fn class_bits(initiator: Side, direction: Direction) -> u64 {
        let initiator_bit = match initiator {
            Side::Client => 0,
            Side::Server => 1,
        };
        let direction_bit = match direction {
            Direction::Bidi => 0,
            Direction::Uni => 2,
        };
        initiator_bit | direction_bit
    }

    fn class(self) -> usize {
        (self.0 & 0b11) as usize
    }
}

/// Hands out stream ids per (initiator, direction) class and keeps track of stream limits.
///
/// For the local side's classes, `limits` hold what the peer allowed us to open (`None` until the
///  peer's transport parameters are known). For the peer's classes, they hold what we announced
///  to the peer.
pub struct StreamIdAllocator {
    side: Side,
    /// number of ids allocated (local classes) or opened by the peer (remote classes), per class
    next_index: [u64; 4],
    limits: [Option<u64>; 4],
}

impl StreamIdAllocator {
    pub fn new(side: Side) -> StreamIdAllocator {
        StreamIdAllocator {
            side,
            next_index: [0; 4],
            limits: [None; 4],
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Allocate the next id for a class, failing if the class's limit is reached.
    pub fn next_id(&mut self, initiator: Side, direction: Direction) -> Result<StreamId, QuicError> {
        let class = Self::class_of(initiator, direction);
        if let Some(limit) = self.limits[class] {
            if self.next_index[class] >= limit {
                return Err(QuicError::StreamLimit(direction));
            }
        }
        Ok(self.allocate(class, initiator, direction))
    }

    /// Allocate the next local id without checking limits. This is for streams that are opened
    ///  before the handshake is complete - they stay pending until [Self::is_within_limit] holds.
    pub fn reserve(&mut self, direction: Direction) -> StreamId {
        let class = Self::class_of(self.side, direction);
        self.allocate(class, self.side, direction)
    }

    fn allocate(&mut self, class: usize, initiator: Side, direction: Direction) -> StreamId {
        let id = StreamId::new(initiator, direction, self.next_index[class]);
        self.next_index[class] += 1;
        id
    }

    pub fn is_within_limit(&self, id: StreamId) -> bool {
        match self.limits[id.class()] {
            None => true,
            Some(limit) => id.index() < limit,
        }
    }

    pub fn limit(&self, initiator: Side, direction: Direction) -> Option<u64> {
        self.limits[Self::class_of(initiator, direction)]
    }

    /// Limits only ever grow - a smaller value (e.g. from a reordered MAX_STREAMS frame) is
    ///  ignored. Returns true if the limit was raised.
    pub fn raise_limit(&mut self, initiator: Side, direction: Direction, limit: u64) -> bool {
        let class = Self::class_of(initiator, direction);
        match self.limits[class] {
            Some(prev) if prev >= limit => false,
            _ => {
                self.limits[class] = Some(limit);
                true
            }
        }
    }

    /// Number of ids handed out (or accepted from the peer) for a class
    #[cfg(test)]
    pub fn count(&self, initiator: Side, direction: Direction) -> u64 {
        self.next_index[Self::class_of(initiator, direction)]
    }

    /// Register a stream id used by the peer. Opening a stream implicitly opens all lower streams
    ///  of the same class, so this returns all ids that are new - in ascending order, possibly
    ///  empty if the stream was opened before.
    pub fn accept_remote(&mut self, id: StreamId) -> Result<Vec<StreamId>, QuicError> {
        if id.initiator() == self.side {
            return Err(QuicError::OperationFailed(format!("stream {} is not a peer-initiated stream", id)));
        }

        let class = id.class();
        let limit = self.limits[class].unwrap_or(0);
        if id.index() >= limit {
            return Err(QuicError::OperationFailed(format!(
                "peer opened {:?} stream {} beyond the announced limit of {}", id.direction(), id, limit)));
        }

        let mut result = Vec::new();
        while self.next_index[class] <= id.index() {
            result.push(StreamId::new(id.initiator(), id.direction(), self.next_index[class]));
            self.next_index[class] += 1;
        }
        Ok(result)
    }

    /// true if this id was handed out locally (for local classes) or accepted from the peer
    pub fn was_opened(&self, id: StreamId) -> bool {
        id.index() < self.next_index[id.class()]
    }

    fn class_of(initiator: Side, direction: Direction) -> usize {
        StreamId::class_bits(initiator, direction) as usize
    }
}
