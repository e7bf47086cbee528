//! Display-side SPI monitor.
//!
//! Watches the controller's output pins the way the OLED panel does: bytes
//! are assembled MSB first on capture edges while CS is low, each tagged with
//! the level of the DC pin at the time its last bit was captured. A falling
//! CS opens a transaction, a rising CS closes it. Clock activity with CS high
//! is counted as stray and otherwise ignored.

use serde::Serialize;
use soc_core::logging::{log, LogCategory, LogLevel};

use crate::spi::{SpiMode, SpiPins};

/// One byte seen by the panel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpiByte {
    pub value: u8,
    /// DC high: display data, low: command
    pub data: bool,
}

/// Bytes sent between one CS assertion and the next deassertion
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SpiTransaction {
    pub bytes: Vec<SpiByte>,
    /// Bits left over when CS went high mid-byte
    pub partial_bits: u8,
}

impl SpiTransaction {
    pub fn values(&self) -> Vec<u8> {
        self.bytes.iter().map(|b| b.value).collect()
    }
}

#[derive(Debug, Clone)]
pub struct SpiMonitor {
    prev_sclk: bool,
    prev_cs_n: bool,
    prev_res_n: bool,
    shift: u8,
    bits: u8,
    current: Option<SpiTransaction>,
    transactions: Vec<SpiTransaction>,
    stray_edges: u32,
    resets: u32,
}

impl SpiMonitor {
    pub fn new() -> Self {
        Self {
            prev_sclk: true,
            prev_cs_n: true,
            prev_res_n: true,
            shift: 0,
            bits: 0,
            current: None,
            transactions: Vec::new(),
            stray_edges: 0,
            resets: 0,
        }
    }

    /// The panel never drives MISO; it floats high
    pub fn miso(&self) -> bool {
        true
    }

    /// Sample the pins after a tick has been committed.
    pub fn observe(&mut self, pins: &SpiPins, mode: SpiMode) {
        if self.prev_res_n && !pins.res_n {
            self.resets += 1;
            log(LogCategory::Spi, LogLevel::Debug, || "OLED: reset asserted".to_string());
        }

        if self.prev_cs_n && !pins.cs_n {
            self.shift = 0;
            self.bits = 0;
            self.current = Some(SpiTransaction::default());
        }

        if pins.sclk != self.prev_sclk {
            if pins.cs_n {
                self.stray_edges += 1;
            } else {
                // leading edge leaves the idle level
                let leading = pins.sclk != mode.idle_high;
                if leading != mode.shift_first {
                    self.capture(pins);
                }
            }
        }

        if !self.prev_cs_n && pins.cs_n {
            if let Some(mut transaction) = self.current.take() {
                transaction.partial_bits = self.bits;
                log(LogCategory::Spi, LogLevel::Debug, || {
                    format!("OLED: transaction {:02X?}", transaction.values())
                });
                self.transactions.push(transaction);
            }
            self.bits = 0;
        }

        self.prev_sclk = pins.sclk;
        self.prev_cs_n = pins.cs_n;
        self.prev_res_n = pins.res_n;
    }

    fn capture(&mut self, pins: &SpiPins) {
        self.shift = (self.shift << 1) | pins.mosi as u8;
        self.bits += 1;
        if self.bits == 8 {
            let byte = SpiByte {
                value: self.shift,
                data: pins.dc,
            };
            if let Some(t) = self.current.as_mut() {
                t.bytes.push(byte);
            }
            self.shift = 0;
            self.bits = 0;
        }
    }

    /// Completed transactions, oldest first
    pub fn transactions(&self) -> &[SpiTransaction] {
        &self.transactions
    }

    /// Transaction still open (CS low)
    pub fn open_transaction(&self) -> Option<&SpiTransaction> {
        self.current.as_ref()
    }

    /// Every byte received, completed transactions then the open one
    pub fn bytes(&self) -> Vec<u8> {
        self.transactions
            .iter()
            .chain(self.current.iter())
            .flat_map(|t| t.bytes.iter().map(|b| b.value))
            .collect()
    }

    pub fn stray_edges(&self) -> u32 {
        self.stray_edges
    }

    /// Falling edges seen on RES_N
    pub fn resets(&self) -> u32 {
        self.resets
    }

    pub fn clear(&mut self) {
        let (sclk, cs_n, res_n) = (self.prev_sclk, self.prev_cs_n, self.prev_res_n);
        *self = Self::new();
        self.prev_sclk = sclk;
        self.prev_cs_n = cs_n;
        self.prev_res_n = res_n;
        if !cs_n {
            self.current = Some(SpiTransaction::default());
        }
    }
}

impl Default for SpiMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODE: SpiMode = SpiMode {
        idle_high: false,
        shift_first: false,
    };

    fn pins(sclk: bool, mosi: bool, cs_n: bool, dc: bool) -> SpiPins {
        SpiPins {
            sclk,
            mosi,
            cs_n,
            dc,
            res_n: true,
            vccen: false,
            pmoden: false,
        }
    }

    /// Drive `byte` MSB first, data valid before each rising edge
    fn clock_byte(mon: &mut SpiMonitor, byte: u8, dc: bool, mode: SpiMode) {
        let idle = mode.idle_high;
        for i in (0..8).rev() {
            let bit = (byte >> i) & 1 != 0;
            if mode.shift_first {
                mon.observe(&pins(!idle, bit, false, dc), mode);
                mon.observe(&pins(idle, bit, false, dc), mode);
            } else {
                mon.observe(&pins(idle, bit, false, dc), mode);
                mon.observe(&pins(!idle, bit, false, dc), mode);
                mon.observe(&pins(idle, bit, false, dc), mode);
            }
        }
    }

    #[test]
    fn test_collects_bytes_between_cs_edges() {
        let mut mon = SpiMonitor::new();
        mon.observe(&pins(false, false, true, false), MODE);
        mon.observe(&pins(false, false, false, false), MODE);
        clock_byte(&mut mon, 0xAE, false, MODE);
        clock_byte(&mut mon, 0x5A, true, MODE);
        assert_eq!(mon.open_transaction().map(|t| t.values()), Some(vec![0xAE, 0x5A]));
        mon.observe(&pins(false, false, true, false), MODE);

        let t = &mon.transactions()[0];
        assert_eq!(t.values(), vec![0xAE, 0x5A]);
        assert!(!t.bytes[0].data);
        assert!(t.bytes[1].data);
        assert_eq!(t.partial_bits, 0);
        assert_eq!(mon.bytes(), vec![0xAE, 0x5A]);
    }

    #[test]
    fn test_idle_high_clock() {
        let mode = SpiMode {
            idle_high: true,
            shift_first: false,
        };
        let mut mon = SpiMonitor::new();
        mon.observe(&pins(true, false, false, false), mode);
        clock_byte(&mut mon, 0xC8, false, mode);
        assert_eq!(mon.bytes(), vec![0xC8]);
    }

    #[test]
    fn test_edges_with_cs_high_are_stray() {
        let mut mon = SpiMonitor::new();
        mon.observe(&pins(true, true, true, false), MODE);
        mon.observe(&pins(false, true, true, false), MODE);
        mon.observe(&pins(true, true, true, false), MODE);
        assert_eq!(mon.stray_edges(), 2);
        assert!(mon.bytes().is_empty());
        assert!(mon.transactions().is_empty());
    }

    #[test]
    fn test_partial_byte_recorded() {
        let mut mon = SpiMonitor::new();
        mon.observe(&pins(false, false, false, false), MODE);
        mon.observe(&pins(true, true, false, false), MODE);
        mon.observe(&pins(false, true, false, false), MODE);
        mon.observe(&pins(false, true, true, false), MODE);
        assert_eq!(mon.transactions()[0].partial_bits, 1);
        assert!(mon.transactions()[0].bytes.is_empty());
    }

    #[test]
    fn test_reset_pulse_counted() {
        let mut mon = SpiMonitor::new();
        let mut p = pins(false, false, true, false);
        p.res_n = false;
        mon.observe(&p, MODE);
        p.res_n = true;
        mon.observe(&p, MODE);
        assert_eq!(mon.resets(), 1);
    }
}
