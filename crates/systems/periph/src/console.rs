//! Host serial console attached to the UART pins.
//!
//! The host side is built from the same frame engines as the controller: a
//! [`UartRx`] decodes the SoC's TX line and a [`UartTx`] drives the SoC's RX
//! line from a queue of bytes to send. Both run at the console's own
//! divisor, which must match the firmware's BAUD_DIV for clean reception.

use std::collections::VecDeque;

use soc_core::logging::{log, LogCategory, LogLevel};
use soc_core::serial::{RxInputs, TxInputs, UartRx, UartTx};
use soc_core::Clocked;

#[derive(Debug, Clone)]
pub struct SerialConsole {
    divisor: u32,
    tx: UartTx,
    rx: UartRx,
    pending: VecDeque<u8>,
    received: Vec<u8>,
    framing_errors: u32,
}

impl SerialConsole {
    pub fn new(divisor: u32) -> Self {
        Self {
            divisor,
            tx: UartTx::new(),
            rx: UartRx::new(),
            pending: VecDeque::new(),
            received: Vec::new(),
            framing_errors: 0,
        }
    }

    pub fn divisor(&self) -> u32 {
        self.divisor
    }

    /// Takes effect from the next character in each direction
    pub fn set_divisor(&mut self, divisor: u32) {
        self.divisor = divisor;
    }

    /// Level the console drives onto the SoC's RX pin
    pub fn line(&self) -> bool {
        self.tx.line()
    }

    /// Queue bytes for transmission to the SoC
    pub fn send(&mut self, bytes: &[u8]) {
        self.pending.extend(bytes.iter().copied());
    }

    /// Nothing queued and nothing on the wire
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.tx.is_idle()
    }

    /// Advance one core tick, sampling the SoC's TX pin.
    pub fn tick(&mut self, soc_tx: bool) {
        let start = if self.tx.is_idle() {
            self.pending.pop_front()
        } else {
            None
        };
        let (tx, _) = self.tx.step(&TxInputs {
            start,
            divider: self.divisor,
        });
        let (rx, out) = self.rx.step(&RxInputs {
            line: soc_tx,
            divider: self.divisor,
            enable: true,
        });
        self.tx = tx;
        self.rx = rx;

        if let Some(byte) = out.done {
            if byte.framing_error {
                self.framing_errors += 1;
                log(LogCategory::Uart, LogLevel::Warn, || {
                    format!("CONSOLE: framing error on {:02X}", byte.data)
                });
            }
            self.received.push(byte.data);
        }
    }

    /// Bytes received from the SoC so far
    pub fn received(&self) -> &[u8] {
        &self.received
    }

    pub fn take_received(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.received)
    }

    /// Received bytes as text, invalid UTF-8 replaced
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.received).into_owned()
    }

    pub fn framing_errors(&self) -> u32 {
        self.framing_errors
    }
}
