//! Test bench board.
//!
//! Wires a [`SocSystem`] to the devices on its pins: the OLED panel (an
//! [`SpiMonitor`]) on the SPI side and a host [`SerialConsole`] on the UART
//! side. Either link can instead be looped back onto the SoC itself.
//!
//! The board also stands in for the CPU. [`Board::access`] presents one
//! request, waits for it to be accepted and then for its response, ticking
//! the whole board meanwhile. The driver routines further down replay what
//! firmware does through the same register interface.

use serde::{Deserialize, Serialize};
use soc_core::bus::{AccessSize, BusRequest, BusResponse, ByteMask, Channel};
use soc_core::logging::{log, LogCategory, LogLevel};
use soc_core::System;

use crate::console::SerialConsole;
use crate::display::SpiMonitor;
use crate::spi::{
    GPIO_CS_N, GPIO_DC, SPI_CLKDIV, SPI_CTRL, SPI_GPIO, SPI_STATUS, SPI_TXRX, STATUS_READY,
};
use crate::uart::{
    STATUS_RX_VALID, STATUS_TX_CAN_ACCEPT, STATUS_TX_READY, UART_BAUD_DIV, UART_DATA, UART_STATUS,
};
use crate::{CpuPorts, PinInputs, SocConfig, SocError, SocSystem, TickOutputs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    pub soc: SocConfig,
    /// Bit period of the host console is `console_divisor + 1` cycles
    pub console_divisor: u32,
    /// Drive MISO from MOSI instead of leaving it floating
    pub spi_loopback: bool,
    /// Tie the SoC's TX pin to its own RX pin instead of the console
    pub uart_loopback: bool,
    /// Cycle budget of every blocking helper
    pub max_wait_cycles: u64,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            soc: SocConfig::default(),
            console_divisor: 16,
            spi_loopback: false,
            uart_loopback: false,
            max_wait_cycles: 1_000_000,
        }
    }
}

pub struct Board {
    config: BoardConfig,
    soc: SocSystem,
    display: SpiMonitor,
    console: SerialConsole,
    next_tag: u16,
    elapsed: u64,
}

impl Board {
    pub fn new(config: BoardConfig) -> Result<Self, SocError> {
        Ok(Self {
            soc: SocSystem::new(config.soc)?,
            display: SpiMonitor::new(),
            console: SerialConsole::new(config.console_divisor),
            next_tag: 0,
            elapsed: 0,
            config,
        })
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    pub fn soc(&self) -> &SocSystem {
        &self.soc
    }

    pub fn soc_mut(&mut self) -> &mut SocSystem {
        &mut self.soc
    }

    pub fn display(&self) -> &SpiMonitor {
        &self.display
    }

    pub fn display_mut(&mut self) -> &mut SpiMonitor {
        &mut self.display
    }

    pub fn console(&self) -> &SerialConsole {
        &self.console
    }

    pub fn console_mut(&mut self) -> &mut SerialConsole {
        &mut self.console
    }

    pub fn cycle(&self) -> u64 {
        self.soc.cycle()
    }

    /// Ticks since the board was built; unlike [`Board::cycle`] this survives resets
    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }

    /// Global reset of the SoC; attached devices keep what they saw
    pub fn reset(&mut self) {
        self.soc.reset();
        self.next_tag = 0;
    }

    /// One core tick of the SoC and everything attached to it.
    pub fn tick(&mut self, cpu: &CpuPorts) -> TickOutputs {
        let soc_tx = self.soc.uart_tx();
        let pins = PinInputs {
            miso: if self.config.spi_loopback {
                self.soc.spi_pins().mosi
            } else {
                self.display.miso()
            },
            uart_rx: if self.config.uart_loopback {
                soc_tx
            } else {
                self.console.line()
            },
        };

        let out = self.soc.tick(cpu, &pins);
        self.elapsed += 1;
        self.console.tick(soc_tx);
        let mode = self.soc.spi().mode();
        self.display.observe(&self.soc.spi_pins(), mode);
        out
    }

    /// Tick with no bus traffic
    pub fn idle(&mut self, cycles: u64) {
        let cpu = CpuPorts::default();
        for _ in 0..cycles {
            self.tick(&cpu);
        }
    }

    /// Idle until `done` holds, at most `max_cycles` ticks. Returns the ticks spent.
    pub fn wait_until<F>(
        &mut self,
        what: &str,
        max_cycles: u64,
        mut done: F,
    ) -> Result<u64, SocError>
    where
        F: FnMut(&Board) -> bool,
    {
        let cpu = CpuPorts::default();
        for spent in 0..max_cycles {
            if done(self) {
                return Ok(spent);
            }
            self.tick(&cpu);
        }
        if done(self) {
            return Ok(max_cycles);
        }
        Err(SocError::Timeout {
            what: what.to_string(),
            cycles: max_cycles,
        })
    }

    /// Perform one bus access the way the CPU does: hold the request until
    /// accepted, then take its response as soon as it is visible.
    pub fn access(&mut self, req: BusRequest) -> Result<BusResponse, SocError> {
        let channel = req.channel();
        let budget = self.config.max_wait_cycles;
        let mut spent = 0;

        let issue = match channel {
            Channel::Load => CpuPorts {
                load: Some(req),
                ..Default::default()
            },
            Channel::Store => CpuPorts {
                store: Some(req),
                ..Default::default()
            },
        };
        while !self.tick(&issue).accepted(channel) {
            spent += 1;
            if spent >= budget {
                return Err(SocError::Timeout {
                    what: format!("{:?} at 0x{:08X} to be accepted", channel, req.addr),
                    cycles: spent,
                });
            }
        }

        let wait = CpuPorts {
            load_resp_ready: channel == Channel::Load,
            store_resp_ready: channel == Channel::Store,
            ..Default::default()
        };
        loop {
            if let Some(resp) = self.tick(&wait).response(channel) {
                return Ok(resp);
            }
            spent += 1;
            if spent >= budget {
                return Err(SocError::Timeout {
                    what: format!("{:?} response from 0x{:08X}", channel, req.addr),
                    cycles: spent,
                });
            }
        }
    }

    pub fn write32(&mut self, addr: u32, value: u32) -> Result<(), SocError> {
        self.write_masked(addr, value, ByteMask::ALL)
    }

    /// Store with an explicit byte-lane mask
    pub fn write_masked(&mut self, addr: u32, value: u32, mask: ByteMask) -> Result<(), SocError> {
        let resp = self.access(BusRequest::store(addr, AccessSize::Word, value, mask))?;
        if resp.error {
            return Err(SocError::BusFault { addr });
        }
        Ok(())
    }

    pub fn read32(&mut self, addr: u32) -> Result<u32, SocError> {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);
        let resp = self.access(BusRequest::load(addr, AccessSize::Word, tag))?;
        if resp.error {
            return Err(SocError::BusFault { addr });
        }
        if resp.tag != tag {
            log(LogCategory::Bus, LogLevel::Error, || {
                format!("BUS: load tag {} answered with tag {}", tag, resp.tag)
            });
        }
        Ok(resp.data)
    }

    /// Read `addr` until `value & mask == expected`. Returns the last value read.
    pub fn poll(
        &mut self,
        addr: u32,
        mask: u32,
        expected: u32,
        max_cycles: u64,
    ) -> Result<u32, SocError> {
        let start = self.elapsed;
        loop {
            let value = self.read32(addr)?;
            if value & mask == expected {
                return Ok(value);
            }
            let spent = self.elapsed - start;
            if spent >= max_cycles {
                return Err(SocError::Timeout {
                    what: format!(
                        "0x{:08X} & 0x{:08X} == 0x{:08X} (last 0x{:08X})",
                        addr, mask, expected, value
                    ),
                    cycles: spent,
                });
            }
        }
    }

    fn spi_reg(&self, offset: u32) -> u32 {
        self.soc.config().spi_base + offset
    }

    fn uart_reg(&self, offset: u32) -> u32 {
        self.soc.config().uart_base + offset
    }
}

/// Driver routines, register for register what firmware runs on the CPU
impl Board {
    pub fn spi_init(&mut self, ctrl: u32, clkdiv: u32) -> Result<(), SocError> {
        self.write32(self.spi_reg(SPI_CLKDIV), clkdiv)?;
        self.write32(self.spi_reg(SPI_CTRL), ctrl)
    }

    /// Read-modify-write of the SPI GPIO register
    pub fn spi_gpio_update(&mut self, set: u32, clear: u32) -> Result<(), SocError> {
        let addr = self.spi_reg(SPI_GPIO);
        let gpio = self.read32(addr)?;
        self.write32(addr, (gpio & !clear) | set)
    }

    pub fn spi_cs_assert(&mut self) -> Result<(), SocError> {
        self.spi_gpio_update(0, GPIO_CS_N)
    }

    pub fn spi_cs_deassert(&mut self) -> Result<(), SocError> {
        self.spi_gpio_update(GPIO_CS_N, 0)
    }

    pub fn spi_wait_ready(&mut self) -> Result<(), SocError> {
        let max = self.config.max_wait_cycles;
        self.poll(self.spi_reg(SPI_STATUS), STATUS_READY, STATUS_READY, max)
            .map(|_| ())
    }

    /// Send one word and return the word shifted in
    pub fn spi_xfer(&mut self, word: u16) -> Result<u16, SocError> {
        self.spi_wait_ready()?;
        self.write32(self.spi_reg(SPI_TXRX), word as u32)?;
        self.spi_wait_ready()?;
        let received = self.read32(self.spi_reg(SPI_TXRX))?;
        Ok(received as u16)
    }

    /// CS-framed burst: DC set for data, clear for commands
    pub fn spi_send(&mut self, bytes: &[u8], data: bool) -> Result<(), SocError> {
        if data {
            self.spi_gpio_update(GPIO_DC, GPIO_CS_N)?;
        } else {
            self.spi_gpio_update(0, GPIO_CS_N | GPIO_DC)?;
        }
        for &byte in bytes {
            self.spi_xfer(byte as u16)?;
        }
        self.spi_cs_deassert()
    }

    pub fn uart_set_baud(&mut self, divisor: u32) -> Result<(), SocError> {
        self.write32(self.uart_reg(UART_BAUD_DIV), divisor)
    }

    /// Wait for room in the TX holding register, then fill it
    pub fn uart_putc(&mut self, byte: u8) -> Result<(), SocError> {
        let max = self.config.max_wait_cycles;
        self.poll(self.uart_reg(UART_STATUS), STATUS_TX_CAN_ACCEPT, STATUS_TX_CAN_ACCEPT, max)?;
        self.write32(self.uart_reg(UART_DATA), byte as u32)
    }

    pub fn uart_puts(&mut self, text: &str) -> Result<(), SocError> {
        for byte in text.bytes() {
            self.uart_putc(byte)?;
        }
        Ok(())
    }

    /// Block until the holding register is empty and the last frame is out
    pub fn uart_flush(&mut self) -> Result<(), SocError> {
        let max = self.config.max_wait_cycles;
        let idle = STATUS_TX_CAN_ACCEPT | STATUS_TX_READY;
        self.poll(self.uart_reg(UART_STATUS), idle, idle, max).map(|_| ())
    }

    /// Pop one received byte, if one is waiting
    pub fn uart_getc(&mut self) -> Result<Option<u8>, SocError> {
        let status = self.read32(self.uart_reg(UART_STATUS))?;
        if status & STATUS_RX_VALID == 0 {
            return Ok(None);
        }
        let data = self.read32(self.uart_reg(UART_DATA))?;
        Ok(Some(data as u8))
    }

    /// Block until a byte arrives
    pub fn uart_getc_blocking(&mut self) -> Result<u8, SocError> {
        let max = self.config.max_wait_cycles;
        self.poll(self.uart_reg(UART_STATUS), STATUS_RX_VALID, STATUS_RX_VALID, max)?;
        let data = self.read32(self.uart_reg(UART_DATA))?;
        Ok(data as u8)
    }
}
