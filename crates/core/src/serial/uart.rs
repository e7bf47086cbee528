//! 8-N-1 asynchronous frame engines.
//!
//! A character on the line is one low start bit, eight data bits LSB first
//! and one high stop bit, each lasting `divider + 1` core cycles. The line
//! idles high.
//!
//! The receiver runs its input through a two-stage [`Synchronizer`] before
//! looking at it, detects the start condition as a falling edge, checks the
//! start bit again half a bit later and then samples every following bit in
//! the middle of its period.

use crate::Clocked;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameState {
    Idle,
    Framing,
}

/// Two flip-flops in series in front of an asynchronous input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Synchronizer {
    stages: [bool; 2],
}

impl Synchronizer {
    /// A synchronizer whose stages already hold `level`
    pub fn new(level: bool) -> Self {
        Self {
            stages: [level; 2],
        }
    }

    /// Synchronised level (second stage)
    pub fn output(&self) -> bool {
        self.stages[1]
    }

    pub fn next(&self, input: bool) -> Self {
        Self {
            stages: [input, self.stages[0]],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxInputs {
    /// Begin sending this byte (ignored unless idle)
    pub start: Option<u8>,
    /// Bit period is `divider + 1` cycles; latched at start
    pub divider: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxOutputs {
    /// The start byte was taken this tick
    pub started: bool,
    /// One-tick pulse at the end of the stop bit
    pub done: bool,
}

/// Transmitting frame engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UartTx {
    state: FrameState,
    /// Start bit in bit 0, data in bits 8:1
    shift: u16,
    /// Framing bit currently on the line (0 = start, 9 = stop)
    bit: u8,
    counter: u32,
    divider: u32,
    line: bool,
}

impl UartTx {
    pub fn new() -> Self {
        Self {
            state: FrameState::Idle,
            shift: 0,
            bit: 0,
            counter: 0,
            divider: 0,
            line: true,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == FrameState::Idle
    }

    /// Level driven on the TX line
    pub fn line(&self) -> bool {
        self.line
    }
}

impl Default for UartTx {
    fn default() -> Self {
        Self::new()
    }
}

impl Clocked for UartTx {
    type Inputs = TxInputs;
    type Outputs = TxOutputs;

    fn step(&self, inputs: &TxInputs) -> (Self, TxOutputs) {
        let mut next = *self;
        let mut out = TxOutputs::default();

        match self.state {
            FrameState::Idle => {
                next.line = true;
                if let Some(byte) = inputs.start {
                    next.state = FrameState::Framing;
                    next.shift = (byte as u16) << 1;
                    next.bit = 0;
                    next.counter = 0;
                    next.divider = inputs.divider;
                    next.line = false;
                    out.started = true;
                }
            }
            FrameState::Framing => {
                if self.counter < self.divider {
                    next.counter = self.counter + 1;
                } else {
                    next.counter = 0;
                    next.bit = self.bit + 1;
                    match next.bit {
                        1..=8 => next.line = (self.shift >> next.bit) & 1 != 0,
                        9 => next.line = true,
                        _ => {
                            next.state = FrameState::Idle;
                            next.line = true;
                            out.done = true;
                        }
                    }
                }
            }
        }

        (next, out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxInputs {
    /// Raw, unsynchronised RX line
    pub line: bool,
    /// Bit period is `divider + 1` cycles; latched at the start edge
    pub divider: u32,
    /// While clear the engine is held idle
    pub enable: bool,
}

/// A received character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RxByte {
    pub data: u8,
    /// Stop bit was sampled low
    pub framing_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxOutputs {
    /// One-tick completion pulse after the stop bit
    pub done: Option<RxByte>,
}

/// Receiving frame engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UartRx {
    sync: Synchronizer,
    /// Synchronised level seen on the previous tick
    prev: bool,
    state: FrameState,
    /// Start bit lands in bit 0, data bits in 8:1 once all nine are in
    shift: u16,
    /// Next framing bit to sample (0 = start, 9 = stop)
    bit: u8,
    counter: u32,
    divider: u32,
}

impl UartRx {
    pub fn new() -> Self {
        Self {
            sync: Synchronizer::new(true),
            prev: true,
            state: FrameState::Idle,
            shift: 0,
            bit: 0,
            counter: 0,
            divider: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == FrameState::Idle
    }
}

impl Default for UartRx {
    fn default() -> Self {
        Self::new()
    }
}

impl Clocked for UartRx {
    type Inputs = RxInputs;
    type Outputs = RxOutputs;

    fn step(&self, inputs: &RxInputs) -> (Self, RxOutputs) {
        let mut next = *self;
        let mut out = RxOutputs::default();

        let level = self.sync.output();
        next.sync = self.sync.next(inputs.line);
        next.prev = level;

        if !inputs.enable {
            next.state = FrameState::Idle;
            return (next, out);
        }

        match self.state {
            FrameState::Idle => {
                if self.prev && !level {
                    next.state = FrameState::Framing;
                    next.shift = 0;
                    next.divider = inputs.divider;
                    // the edge tick counts as the first cycle of the start bit
                    if inputs.divider / 2 == 0 {
                        next.bit = 1;
                        next.counter = 0;
                    } else {
                        next.bit = 0;
                        next.counter = 1;
                    }
                }
            }
            FrameState::Framing => {
                let limit = if self.bit == 0 {
                    self.divider / 2
                } else {
                    self.divider
                };
                if self.counter < limit {
                    next.counter = self.counter + 1;
                } else {
                    next.counter = 0;
                    match self.bit {
                        // a start bit that has gone high again was a glitch
                        0 if level => next.state = FrameState::Idle,
                        0..=8 => {
                            next.shift = (self.shift >> 1) | ((level as u16) << 8);
                            next.bit = self.bit + 1;
                        }
                        _ => {
                            next.state = FrameState::Idle;
                            out.done = Some(RxByte {
                                data: (self.shift >> 1) as u8,
                                framing_error: !level,
                            });
                        }
                    }
                }
            }
        }

        (next, out)
    }
}
