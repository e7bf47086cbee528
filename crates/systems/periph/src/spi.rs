//! SPI display controller
//!
//! A register file in front of a [`ShiftEngine`], plus software-driven
//! output pins for the display (chip select, data/command, reset, power).
//!
//! ## Registers
//!
//! Offsets within the SPI window:
//! - 0x00: TXRX - write launches a transfer, read returns the last received word
//! - 0x04: STATUS - bit 0 READY, bit 1 BUSY, bit 8 CS asserted (read-only)
//! - 0x08: CTRL - bit 0 POS_EDGE, bit 1 WIDTH8, bit 2 CLK_PHASE, bit 8 EN, bit 9 IRQ_EN
//! - 0x0C: CLKDIV - SCLK half-period is CLKDIV + 1 core cycles
//! - 0x10: GPIO - bit 0 CS_N, bit 1 DC, bit 2 RES_N, bit 3 VCCEN, bit 4 PMODEN
//!
//! ## Launch
//!
//! A TXRX write covering byte lane 0 starts a transfer only when EN is set,
//! CS_N is low and the engine is idle. Anything else is dropped and counted.
//! Burst framing (CS, polling READY between bytes) is up to firmware.

use serde::{Deserialize, Serialize};
use soc_core::bus::{Access, BusResponse, BusTarget, ByteMask, Channel, ResponseSlot, TargetPort};
use soc_core::logging::{log, LogCategory, LogLevel};
use soc_core::serial::{EdgeKind, ShiftConfig, ShiftEngine, ShiftInputs, ShiftState};
use soc_core::Clocked;

/// Register offsets (relative to the SPI base)
pub const SPI_TXRX: u32 = 0x00;
pub const SPI_STATUS: u32 = 0x04;
pub const SPI_CTRL: u32 = 0x08;
pub const SPI_CLKDIV: u32 = 0x0C;
pub const SPI_GPIO: u32 = 0x10;

pub const STATUS_READY: u32 = 1 << 0;
pub const STATUS_BUSY: u32 = 1 << 1;
pub const STATUS_CS_ASSERTED: u32 = 1 << 8;

/// Idle-low clock, first edge rising
pub const CTRL_POS_EDGE: u32 = 1 << 0;
pub const CTRL_WIDTH8: u32 = 1 << 1;
/// First edge shifts, second edge captures
pub const CTRL_CLK_PHASE: u32 = 1 << 2;
pub const CTRL_EN: u32 = 1 << 8;
pub const CTRL_IRQ_EN: u32 = 1 << 9;

pub const GPIO_CS_N: u32 = 1 << 0;
pub const GPIO_DC: u32 = 1 << 1;
pub const GPIO_RES_N: u32 = 1 << 2;
pub const GPIO_VCCEN: u32 = 1 << 3;
pub const GPIO_PMODEN: u32 = 1 << 4;

/// CS deasserted, reset released
const GPIO_RESET: u32 = GPIO_CS_N | GPIO_RES_N;

/// Pin levels driven by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpiPins {
    pub sclk: bool,
    pub mosi: bool,
    pub cs_n: bool,
    pub dc: bool,
    pub res_n: bool,
    pub vccen: bool,
    pub pmoden: bool,
}

/// Clock mode a device on the bus must follow to sample correctly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiMode {
    pub idle_high: bool,
    pub shift_first: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiRegisters {
    /// Last value written to TXRX
    pub txrx: u32,
    pub ctrl: u32,
    pub clkdiv: u32,
    pub gpio: u32,
}

impl Default for SpiRegisters {
    fn default() -> Self {
        Self {
            txrx: 0,
            ctrl: 0,
            clkdiv: 0,
            gpio: GPIO_RESET,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpiInputs {
    pub bus: TargetPort,
    pub miso: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpiOutputs {
    /// Word handed to the engine this tick
    pub launched: Option<u16>,
    /// SCLK toggled this tick
    pub edge: Option<EdgeKind>,
    /// Transfer completed this tick, with the received word
    pub done: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiController {
    regs: SpiRegisters,
    engine: ShiftEngine,
    slots: [ResponseSlot; 2],
    latency: u32,
    irq: bool,
    /// TXRX writes that could not launch a transfer
    dropped_launches: u32,
}

impl SpiController {
    pub fn new(latency: u32) -> Self {
        Self {
            regs: SpiRegisters::default(),
            engine: ShiftEngine::new(),
            slots: [ResponseSlot::default(); 2],
            latency,
            irq: false,
            dropped_launches: 0,
        }
    }

    /// Global reset: registers to defaults, engine idle, responses dropped
    pub fn reset(&mut self) {
        *self = Self::new(self.latency);
    }

    pub fn registers(&self) -> &SpiRegisters {
        &self.regs
    }

    pub fn engine(&self) -> &ShiftEngine {
        &self.engine
    }

    pub fn is_ready(&self) -> bool {
        self.engine.is_idle()
    }

    pub fn cs_asserted(&self) -> bool {
        self.regs.gpio & GPIO_CS_N == 0
    }

    pub fn irq(&self) -> bool {
        self.irq
    }

    pub fn dropped_launches(&self) -> u32 {
        self.dropped_launches
    }

    fn idle_high(&self) -> bool {
        self.regs.ctrl & CTRL_POS_EDGE == 0
    }

    /// Live transfer configuration from CTRL and CLKDIV
    fn shift_config(&self) -> ShiftConfig {
        ShiftConfig {
            divider: self.regs.clkdiv,
            idle_high: self.idle_high(),
            shift_first: self.regs.ctrl & CTRL_CLK_PHASE != 0,
            bits: if self.regs.ctrl & CTRL_WIDTH8 != 0 { 8 } else { 16 },
        }
    }

    /// Mode of the transfer in progress, or of the next one while idle
    pub fn mode(&self) -> SpiMode {
        let config = if self.engine.is_idle() {
            self.shift_config()
        } else {
            self.engine.config()
        };
        SpiMode {
            idle_high: config.idle_high,
            shift_first: config.shift_first,
        }
    }

    pub fn pins(&self) -> SpiPins {
        let gpio = self.regs.gpio;
        SpiPins {
            sclk: if self.engine.is_idle() {
                self.idle_high()
            } else {
                self.engine.sclk()
            },
            mosi: self.engine.mosi(),
            cs_n: gpio & GPIO_CS_N != 0,
            dc: gpio & GPIO_DC != 0,
            res_n: gpio & GPIO_RES_N != 0,
            vccen: gpio & GPIO_VCCEN != 0,
            pmoden: gpio & GPIO_PMODEN != 0,
        }
    }

    /// Read from SPI register (no side effects)
    pub fn read_register(&self, offset: u32) -> u32 {
        match offset {
            SPI_TXRX => self.engine.received() as u32,
            SPI_STATUS => {
                let mut status = if self.engine.is_idle() {
                    STATUS_READY
                } else {
                    STATUS_BUSY
                };
                if self.cs_asserted() {
                    status |= STATUS_CS_ASSERTED;
                }
                status
            }
            SPI_CTRL => self.regs.ctrl,
            SPI_CLKDIV => self.regs.clkdiv,
            SPI_GPIO => self.regs.gpio,
            _ => {
                log(LogCategory::Stubs, LogLevel::Debug, || {
                    format!("SPI: read from unmapped offset 0x{:02X}", offset)
                });
                0
            }
        }
    }

    /// Apply a masked register write to `next`, deciding from `self`.
    /// Returns the word to launch, if the write starts a transfer.
    fn write_register(
        &self,
        next: &mut Self,
        offset: u32,
        data: u32,
        mask: ByteMask,
    ) -> Option<u16> {
        match offset {
            SPI_TXRX => {
                next.regs.txrx = mask.merge(self.regs.txrx, data);
                if !mask.covers_lane(0) {
                    return None;
                }
                let enabled = self.regs.ctrl & CTRL_EN != 0;
                if enabled && self.cs_asserted() && self.engine.is_idle() {
                    let word = if self.regs.ctrl & CTRL_WIDTH8 != 0 {
                        next.regs.txrx & 0xFF
                    } else {
                        next.regs.txrx & 0xFFFF
                    };
                    Some(word as u16)
                } else {
                    next.dropped_launches = self.dropped_launches.wrapping_add(1);
                    log(LogCategory::Spi, LogLevel::Warn, || {
                        format!(
                            "SPI: TXRX write {:02X} dropped (en={} cs={} ready={})",
                            data & 0xFF,
                            enabled,
                            self.cs_asserted(),
                            self.engine.is_idle()
                        )
                    });
                    None
                }
            }
            SPI_STATUS => None,
            SPI_CTRL => {
                next.regs.ctrl = mask.merge(self.regs.ctrl, data);
                None
            }
            SPI_CLKDIV => {
                next.regs.clkdiv = mask.merge(self.regs.clkdiv, data);
                None
            }
            SPI_GPIO => {
                next.regs.gpio = mask.merge(self.regs.gpio, data);
                None
            }
            _ => {
                log(LogCategory::Stubs, LogLevel::Debug, || {
                    format!("SPI: write {:08X} to unmapped offset 0x{:02X}", data, offset)
                });
                None
            }
        }
    }
}

impl Default for SpiController {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Clocked for SpiController {
    type Inputs = SpiInputs;
    type Outputs = SpiOutputs;

    fn step(&self, inputs: &SpiInputs) -> (Self, SpiOutputs) {
        let mut next = *self;
        let mut out = SpiOutputs::default();

        let load = inputs
            .bus
            .load
            .map(|req| BusResponse::ok(req.tag(), self.read_register(req.addr)));

        let mut launch = None;
        let store = inputs.bus.store.map(|req| {
            if let Access::Store { data, mask } = req.access {
                launch = self.write_register(&mut next, req.addr, data, mask);
            }
            BusResponse::ok(0, 0)
        });

        let (engine, shift) = self.engine.step(&ShiftInputs {
            launch,
            config: self.shift_config(),
            miso: inputs.miso,
        });
        next.engine = engine;

        if shift.launched {
            out.launched = launch;
            log(LogCategory::Spi, LogLevel::Debug, || {
                format!(
                    "SPI: launch {:04X} ({} bits, div {}, dc={})",
                    launch.unwrap_or(0),
                    engine.config().bits,
                    engine.config().divider,
                    self.regs.gpio & GPIO_DC != 0
                )
            });
        }
        out.edge = shift.edge;
        out.done = shift.done;
        if let Some(word) = shift.done {
            log(LogCategory::Spi, LogLevel::Trace, || {
                format!("SPI: transfer done, received {:04X}", word)
            });
        }

        for channel in Channel::ALL {
            let accepted = match channel {
                Channel::Load => load,
                Channel::Store => store,
            };
            let consumed = inputs.bus.consumed(channel);
            next.slots[channel.index()] =
                self.slots[channel.index()].next(accepted, self.latency, consumed);
        }

        next.irq = next.regs.ctrl & CTRL_IRQ_EN != 0 && next.engine.state() == ShiftState::Idle;
        if next.irq != self.irq {
            log(LogCategory::Interrupts, LogLevel::Debug, || {
                format!("SPI: IRQ {}", if next.irq { "raised" } else { "cleared" })
            });
        }

        (next, out)
    }
}

/// MMIO targets are always ready; in-flight tracking belongs to the router
impl BusTarget for SpiController {
    fn ready(&self, _channel: Channel) -> bool {
        true
    }

    fn response(&self, channel: Channel) -> Option<BusResponse> {
        self.slots[channel.index()].visible()
    }
}
