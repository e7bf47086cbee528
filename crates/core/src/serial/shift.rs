//! Synchronous shift engine for one 8- or 16-bit transfer.
//!
//! ```text
//!  Idle ──launch──▶ Shifting ──2N edges──▶ Trailer ──1 tick──▶ Idle
//! ```
//!
//! While not idle a divider counts core cycles up to `divider`; every time it
//! wraps the engine emits one tick. In `Shifting` each tick toggles SCLK, and
//! ticks alternate between a capture edge (MISO sampled) and a shift edge
//! (next MOSI bit presented), MSB first. Which of the two comes first is set
//! by [`ShiftConfig::shift_first`]. `Trailer` waits one more tick with the
//! clock parked at its idle level before the engine reports idle again.

use crate::Clocked;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShiftState {
    Idle,
    Shifting,
    Trailer,
}

/// Transfer parameters, latched by the engine at launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftConfig {
    /// Half-period of SCLK is `divider + 1` core cycles
    pub divider: u32,
    /// Clock level between transfers
    pub idle_high: bool,
    /// First edge shifts and second edge captures (phase 1)
    pub shift_first: bool,
    /// Bits per transfer, 8 or 16
    pub bits: u8,
}

impl Default for ShiftConfig {
    fn default() -> Self {
        Self {
            divider: 0,
            idle_high: false,
            shift_first: false,
            bits: 8,
        }
    }
}

impl ShiftConfig {
    fn width(&self) -> u8 {
        if self.bits > 8 {
            16
        } else {
            8
        }
    }
}

/// What happened on a clock edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Capture,
    Shift,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShiftInputs {
    /// Start a transfer of this word (ignored unless idle)
    pub launch: Option<u16>,
    /// Live configuration; latched on launch, idle level followed while idle
    pub config: ShiftConfig,
    /// Serial data in
    pub miso: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShiftOutputs {
    /// The launch word was taken this tick
    pub launched: bool,
    /// SCLK toggled this tick
    pub edge: Option<EdgeKind>,
    /// One-tick pulse: transfer finished, with the received word
    pub done: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftEngine {
    state: ShiftState,
    config: ShiftConfig,
    /// Outgoing bits, left-aligned so bit 15 is the next one presented
    tx: u16,
    /// Incoming bits, shifted in from the right
    rx: u16,
    /// Clock edges emitted in the current transfer
    edges: u8,
    /// Divider counter
    counter: u32,
    sclk: bool,
    mosi: bool,
    /// Last completed received word
    received: u16,
}

impl ShiftEngine {
    pub fn new() -> Self {
        Self {
            state: ShiftState::Idle,
            config: ShiftConfig::default(),
            tx: 0,
            rx: 0,
            edges: 0,
            counter: 0,
            sclk: false,
            mosi: false,
            received: 0,
        }
    }

    /// Force back to idle, as on global reset
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn state(&self) -> ShiftState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == ShiftState::Idle
    }

    pub fn sclk(&self) -> bool {
        self.sclk
    }

    pub fn mosi(&self) -> bool {
        self.mosi
    }

    /// Configuration of the transfer in progress (or the last one)
    pub fn config(&self) -> ShiftConfig {
        self.config
    }

    /// Last word shifted in by a completed transfer
    pub fn received(&self) -> u16 {
        self.received
    }

    /// Clock edges emitted so far in the current transfer
    pub fn edges(&self) -> u8 {
        self.edges
    }

    fn divider_wrapped(&self, next: &mut Self) -> bool {
        if self.counter < self.config.divider {
            next.counter = self.counter + 1;
            false
        } else {
            next.counter = 0;
            true
        }
    }
}

impl Default for ShiftEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Clocked for ShiftEngine {
    type Inputs = ShiftInputs;
    type Outputs = ShiftOutputs;

    fn step(&self, inputs: &ShiftInputs) -> (Self, ShiftOutputs) {
        let mut next = *self;
        let mut out = ShiftOutputs::default();

        match self.state {
            ShiftState::Idle => {
                next.sclk = inputs.config.idle_high;
                if let Some(word) = inputs.launch {
                    let mut config = inputs.config;
                    config.bits = config.width();
                    next.config = config;
                    next.state = ShiftState::Shifting;
                    next.counter = 0;
                    next.edges = 0;
                    next.rx = 0;
                    next.tx = word << (16 - config.bits as u32);
                    if !config.shift_first {
                        next.mosi = next.tx & 0x8000 != 0;
                        next.tx <<= 1;
                    }
                    out.launched = true;
                }
            }
            ShiftState::Shifting => {
                if self.divider_wrapped(&mut next) {
                    next.sclk = !self.sclk;
                    next.edges = self.edges + 1;
                    let leading = next.edges % 2 == 1;
                    if leading != self.config.shift_first {
                        next.rx = (self.rx << 1) | inputs.miso as u16;
                        out.edge = Some(EdgeKind::Capture);
                    } else {
                        next.mosi = self.tx & 0x8000 != 0;
                        next.tx = self.tx << 1;
                        out.edge = Some(EdgeKind::Shift);
                    }
                    if next.edges >= self.config.bits * 2 {
                        next.state = ShiftState::Trailer;
                    }
                }
            }
            ShiftState::Trailer => {
                if self.divider_wrapped(&mut next) {
                    let mask = if self.config.bits >= 16 {
                        0xFFFF
                    } else {
                        (1u16 << self.config.bits) - 1
                    };
                    next.state = ShiftState::Idle;
                    next.received = self.rx & mask;
                    next.sclk = inputs.config.idle_high;
                    out.done = Some(next.received);
                }
            }
        }

        (next, out)
    }
}
