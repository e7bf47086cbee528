//! Split-transaction bus primitives.
//!
//! The CPU side presents two independent channels, one for loads and one for
//! stores. Each channel carries at most one request per tick; a target that
//! accepts it answers some ticks later through a [`ResponseSlot`] and keeps
//! the answer visible until the requester consumes it.
//!
//! ## Byte lanes
//!
//! Data is always carried as a 32-bit little-endian word. A store names the
//! lanes it updates with a [`ByteMask`]: bit `n` enables bits `[8n+7:8n]`.

use serde::{Deserialize, Serialize};

/// Which of the two independent CPU channels a request travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Load,
    Store,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Load, Channel::Store];

    /// Index for per-channel arrays
    pub fn index(self) -> usize {
        match self {
            Channel::Load => 0,
            Channel::Store => 1,
        }
    }
}

/// Width of a single access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessSize {
    Byte,
    Half,
    Word,
}

impl AccessSize {
    pub fn bytes(self) -> u32 {
        match self {
            AccessSize::Byte => 1,
            AccessSize::Half => 2,
            AccessSize::Word => 4,
        }
    }

    pub fn is_aligned(self, addr: u32) -> bool {
        addr % self.bytes() == 0
    }
}

/// Write-enable bits, one per byte lane of a 32-bit word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ByteMask(u8);

impl ByteMask {
    pub const NONE: ByteMask = ByteMask(0);
    pub const ALL: ByteMask = ByteMask(0xF);

    /// Only the low four bits are meaningful.
    pub const fn new(bits: u8) -> Self {
        ByteMask(bits & 0xF)
    }

    /// Lanes touched by an access of `size` at `addr`
    pub fn for_access(addr: u32, size: AccessSize) -> Self {
        match size {
            AccessSize::Byte => ByteMask::new(1 << (addr & 3)),
            AccessSize::Half => ByteMask::new(0b11 << (addr & 2)),
            AccessSize::Word => ByteMask::ALL,
        }
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn covers_lane(self, lane: u32) -> bool {
        lane < 4 && self.0 & (1 << lane) != 0
    }

    /// Bit mask with every enabled lane set to 0xFF
    pub fn expand(self) -> u32 {
        (0..4)
            .filter(|&lane| self.covers_lane(lane))
            .fold(0, |acc, lane| acc | (0xFF << (lane * 8)))
    }

    /// Replace only the enabled lanes of `old` with those of `new`.
    pub fn merge(self, old: u32, new: u32) -> u32 {
        let m = self.expand();
        (old & !m) | (new & m)
    }
}

/// What a request asks the target to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    /// Read; `tag` is echoed back unchanged in the response
    Load { tag: u16 },
    /// Write the masked lanes of `data`
    Store { data: u32, mask: ByteMask },
}

/// One CPU-issued access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusRequest {
    pub addr: u32,
    pub size: AccessSize,
    pub access: Access,
}

impl BusRequest {
    pub fn load(addr: u32, size: AccessSize, tag: u16) -> Self {
        Self {
            addr,
            size,
            access: Access::Load { tag },
        }
    }

    pub fn store(addr: u32, size: AccessSize, data: u32, mask: ByteMask) -> Self {
        Self {
            addr,
            size,
            access: Access::Store { data, mask },
        }
    }

    /// Full 32-bit store
    pub fn store_word(addr: u32, data: u32) -> Self {
        Self::store(addr, AccessSize::Word, data, ByteMask::ALL)
    }

    pub fn channel(&self) -> Channel {
        match self.access {
            Access::Load { .. } => Channel::Load,
            Access::Store { .. } => Channel::Store,
        }
    }

    /// Load tag, or 0 for stores
    pub fn tag(&self) -> u16 {
        match self.access {
            Access::Load { tag } => tag,
            Access::Store { .. } => 0,
        }
    }
}

/// Completion of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BusResponse {
    pub tag: u16,
    pub data: u32,
    pub error: bool,
}

impl BusResponse {
    pub fn ok(tag: u16, data: u32) -> Self {
        Self {
            tag,
            data,
            error: false,
        }
    }

    pub fn error(tag: u16) -> Self {
        Self {
            tag,
            data: 0,
            error: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct PendingResponse {
    /// Ticks left before the response becomes visible
    remaining: u32,
    response: BusResponse,
}

/// Response register for one channel of one target.
///
/// A response accepted with latency `n` is visible `n` ticks after the
/// accepting tick and stays visible until consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResponseSlot {
    pending: Option<PendingResponse>,
}

impl ResponseSlot {
    /// True from acceptance until the response is consumed
    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    /// The response, once its latency has elapsed
    pub fn visible(&self) -> Option<BusResponse> {
        self.pending
            .filter(|p| p.remaining == 0)
            .map(|p| p.response)
    }

    /// Slot value for the next tick.
    ///
    /// `consumed` only takes effect on a visible response. Latencies below one
    /// tick are clamped to one.
    pub fn next(&self, accepted: Option<BusResponse>, latency: u32, consumed: bool) -> Self {
        let mut next = *self;
        if consumed && self.visible().is_some() {
            next.pending = None;
        } else if let Some(p) = next.pending.as_mut() {
            p.remaining = p.remaining.saturating_sub(1);
        }
        if let Some(response) = accepted {
            next.pending = Some(PendingResponse {
                remaining: latency.max(1) - 1,
                response,
            });
        }
        next
    }
}

/// Everything a target sees from the router during one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TargetPort {
    /// Load accepted this tick
    pub load: Option<BusRequest>,
    /// Store accepted this tick
    pub store: Option<BusRequest>,
    /// The visible load response was consumed this tick
    pub load_consumed: bool,
    /// The visible store response was consumed this tick
    pub store_consumed: bool,
}

impl TargetPort {
    pub fn request(&self, channel: Channel) -> Option<&BusRequest> {
        match channel {
            Channel::Load => self.load.as_ref(),
            Channel::Store => self.store.as_ref(),
        }
    }

    pub fn consumed(&self, channel: Channel) -> bool {
        match channel {
            Channel::Load => self.load_consumed,
            Channel::Store => self.store_consumed,
        }
    }
}

/// Anything the router can forward requests to.
pub trait BusTarget {
    /// Whether a request on `channel` would be accepted this tick
    fn ready(&self, channel: Channel) -> bool;

    /// Response currently presented on `channel`, if any
    fn response(&self, channel: Channel) -> Option<BusResponse>;
}
