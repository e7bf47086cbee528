//! UART console controller
//!
//! Register file, one TX and one RX frame engine, and a single-slot holding
//! register in each direction.
//!
//! ## Registers
//!
//! Offsets within the UART window:
//! - 0x00: DATA - write fills the TX holding register (only if empty),
//!   read pops the RX holding register
//! - 0x04: STATUS - see `STATUS_*` (read-only, reading clears RX overrun)
//! - 0x08: CTRL - bit 0 TX_EN, bit 1 RX_EN, bit 2 RX_IE, bit 3 TX_IE
//! - 0x0C: BAUD_DIV - bit period is BAUD_DIV + 1 core cycles, both directions
//!
//! ## Interrupt
//!
//! `irq = (RX_IE && rx valid) || (TX_IE && tx idle && tx holding empty)`,
//! recomputed every tick.

use serde::{Deserialize, Serialize};
use soc_core::bus::{Access, BusResponse, BusTarget, ByteMask, Channel, ResponseSlot, TargetPort};
use soc_core::logging::{log, LogCategory, LogLevel};
use soc_core::serial::{RxByte, RxInputs, TxInputs, UartRx, UartTx};
use soc_core::Clocked;

/// Register offsets (relative to the UART base)
pub const UART_DATA: u32 = 0x00;
pub const UART_STATUS: u32 = 0x04;
pub const UART_CTRL: u32 = 0x08;
pub const UART_BAUD_DIV: u32 = 0x0C;

pub const STATUS_RX_VALID: u32 = 1 << 0;
pub const STATUS_TX_READY: u32 = 1 << 1;
pub const STATUS_TX_PENDING: u32 = 1 << 3;
pub const STATUS_RX_OVERRUN: u32 = 1 << 4;
pub const STATUS_TX_CAN_ACCEPT: u32 = 1 << 5;

pub const CTRL_TX_EN: u32 = 1 << 0;
pub const CTRL_RX_EN: u32 = 1 << 1;
pub const CTRL_RX_IE: u32 = 1 << 2;
pub const CTRL_TX_IE: u32 = 1 << 3;

const CTRL_RESET: u32 = CTRL_TX_EN | CTRL_RX_EN;
/// 115200 baud from a 25 MHz core clock
pub const BAUD_DIV_RESET: u32 = 217;

/// One-byte buffer with a valid flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HoldingRegister {
    data: u8,
    valid: bool,
}

impl HoldingRegister {
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Byte last stored, valid or not
    pub fn data(&self) -> u8 {
        self.data
    }

    fn fill(&mut self, data: u8) {
        self.data = data;
        self.valid = true;
    }

    fn release(&mut self) {
        self.valid = false;
    }
}

/// Events the controller counts but never reports on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UartStats {
    /// DATA writes ignored because the TX holding register was full
    pub tx_rejected: u32,
    /// Received bytes dropped because the RX holding register was full
    pub rx_overruns: u32,
    /// Received bytes whose stop bit was low
    pub framing_errors: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UartInputs {
    pub bus: TargetPort,
    /// Raw RX pin
    pub rx_line: bool,
}

impl Default for UartInputs {
    fn default() -> Self {
        Self {
            bus: TargetPort::default(),
            rx_line: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UartOutputs {
    /// Byte handed to the TX engine this tick
    pub tx_started: Option<u8>,
    /// RX engine finished a frame this tick
    pub rx_done: Option<RxByte>,
    /// The finished frame went into the holding register (false on overrun)
    pub rx_captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UartController {
    ctrl: u32,
    baud_div: u32,
    tx_hold: HoldingRegister,
    rx_hold: HoldingRegister,
    /// Sticky until STATUS is read
    overrun: bool,
    tx: UartTx,
    rx: UartRx,
    slots: [ResponseSlot; 2],
    latency: u32,
    irq: bool,
    stats: UartStats,
}

impl UartController {
    pub fn new(latency: u32) -> Self {
        Self {
            ctrl: CTRL_RESET,
            baud_div: BAUD_DIV_RESET,
            tx_hold: HoldingRegister::default(),
            rx_hold: HoldingRegister::default(),
            overrun: false,
            tx: UartTx::new(),
            rx: UartRx::new(),
            slots: [ResponseSlot::default(); 2],
            latency,
            irq: false,
            stats: UartStats::default(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.latency);
    }

    pub fn tx_line(&self) -> bool {
        self.tx.line()
    }

    pub fn tx_hold(&self) -> &HoldingRegister {
        &self.tx_hold
    }

    pub fn rx_hold(&self) -> &HoldingRegister {
        &self.rx_hold
    }

    pub fn overrun(&self) -> bool {
        self.overrun
    }

    pub fn irq(&self) -> bool {
        self.irq
    }

    pub fn stats(&self) -> &UartStats {
        &self.stats
    }

    pub fn tx_engine(&self) -> &UartTx {
        &self.tx
    }

    pub fn status(&self) -> u32 {
        let mut status = 0;
        if self.rx_hold.valid {
            status |= STATUS_RX_VALID;
        }
        if self.tx.is_idle() {
            status |= STATUS_TX_READY;
        }
        if self.tx_hold.valid {
            status |= STATUS_TX_PENDING;
        } else {
            status |= STATUS_TX_CAN_ACCEPT;
        }
        if self.overrun {
            status |= STATUS_RX_OVERRUN;
        }
        status
    }

    /// Register value as the bus would see it, without read side effects
    pub fn peek_register(&self, offset: u32) -> u32 {
        match offset {
            UART_DATA => self.rx_hold.data as u32,
            UART_STATUS => self.status(),
            UART_CTRL => self.ctrl,
            UART_BAUD_DIV => self.baud_div,
            _ => 0,
        }
    }

    fn compute_irq(&self) -> bool {
        let rx = self.ctrl & CTRL_RX_IE != 0 && self.rx_hold.valid;
        let tx = self.ctrl & CTRL_TX_IE != 0 && self.tx.is_idle() && !self.tx_hold.valid;
        rx || tx
    }

    fn write_register(&self, next: &mut Self, offset: u32, data: u32, mask: ByteMask) {
        match offset {
            UART_DATA => {
                if !mask.covers_lane(0) {
                    return;
                }
                if self.tx_hold.valid {
                    next.stats.tx_rejected = self.stats.tx_rejected.wrapping_add(1);
                    log(LogCategory::Uart, LogLevel::Warn, || {
                        format!(
                            "UART: DATA write {:02X} ignored, TX holding register full ({:02X})",
                            data & 0xFF,
                            self.tx_hold.data
                        )
                    });
                } else {
                    next.tx_hold.fill(data as u8);
                }
            }
            UART_STATUS => {}
            UART_CTRL => next.ctrl = mask.merge(self.ctrl, data),
            UART_BAUD_DIV => next.baud_div = mask.merge(self.baud_div, data),
            _ => {
                log(LogCategory::Stubs, LogLevel::Debug, || {
                    format!("UART: write {:08X} to unmapped offset 0x{:02X}", data, offset)
                });
            }
        }
    }
}

impl Default for UartController {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Clocked for UartController {
    type Inputs = UartInputs;
    type Outputs = UartOutputs;

    fn step(&self, inputs: &UartInputs) -> (Self, UartOutputs) {
        let mut next = *self;
        let mut out = UartOutputs::default();

        // CPU load, with DATA pop and STATUS overrun-clear side effects
        let mut popped = false;
        let load = inputs.bus.load.map(|req| {
            match req.addr {
                UART_DATA => {
                    popped = true;
                    next.rx_hold.release();
                }
                UART_STATUS => next.overrun = false,
                UART_CTRL | UART_BAUD_DIV => {}
                offset => log(LogCategory::Stubs, LogLevel::Debug, || {
                    format!("UART: read from unmapped offset 0x{:02X}", offset)
                }),
            }
            BusResponse::ok(req.tag(), self.peek_register(req.addr))
        });

        let store = inputs.bus.store.map(|req| {
            if let Access::Store { data, mask } = req.access {
                self.write_register(&mut next, req.addr, data, mask);
            }
            BusResponse::ok(0, 0)
        });

        // Launch from the pre-tick holding register; a CPU write is only taken
        // into an empty one, so the two never coincide.
        let start = (self.ctrl & CTRL_TX_EN != 0 && self.tx_hold.valid && self.tx.is_idle())
            .then_some(self.tx_hold.data);
        if let Some(byte) = start {
            next.tx_hold.release();
            out.tx_started = Some(byte);
            log(LogCategory::Uart, LogLevel::Debug, || {
                format!("UART: TX {:02X} ({:?})", byte, byte as char)
            });
        }
        let (tx, _) = self.tx.step(&TxInputs {
            start,
            divider: self.baud_div,
        });
        next.tx = tx;

        let (rx, rx_out) = self.rx.step(&RxInputs {
            line: inputs.rx_line,
            divider: self.baud_div,
            enable: self.ctrl & CTRL_RX_EN != 0,
        });
        next.rx = rx;

        if let Some(byte) = rx_out.done {
            out.rx_done = Some(byte);
            if byte.framing_error {
                next.stats.framing_errors = self.stats.framing_errors.wrapping_add(1);
                log(LogCategory::Uart, LogLevel::Warn, || {
                    format!("UART: framing error on RX byte {:02X}", byte.data)
                });
            }
            if !self.rx_hold.valid || popped {
                next.rx_hold.fill(byte.data);
                out.rx_captured = true;
                log(LogCategory::Uart, LogLevel::Debug, || {
                    format!("UART: RX {:02X}", byte.data)
                });
            } else {
                next.overrun = true;
                next.stats.rx_overruns = self.stats.rx_overruns.wrapping_add(1);
                log(LogCategory::Uart, LogLevel::Warn, || {
                    format!(
                        "UART: RX overrun, dropped {:02X} (holding {:02X})",
                        byte.data, self.rx_hold.data
                    )
                });
            }
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

        next.irq = next.compute_irq();
        if next.irq != self.irq {
            log(LogCategory::Interrupts, LogLevel::Debug, || {
                format!("UART: IRQ {}", if next.irq { "raised" } else { "cleared" })
            });
        }

        (next, out)
    }
}

/// MMIO targets are always ready; in-flight tracking belongs to the router
impl BusTarget for UartController {
    fn ready(&self, _channel: Channel) -> bool {
        true
    }

    fn response(&self, channel: Channel) -> Option<BusResponse> {
        self.slots[channel.index()].visible()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soc_core::bus::{AccessSize, BusRequest};
    use soc_core::serial::uart_frame_cycles;

    fn store(offset: u32, value: u32) -> UartInputs {
        store_masked(offset, value, ByteMask::ALL)
    }

    fn store_masked(offset: u32, value: u32, mask: ByteMask) -> UartInputs {
        UartInputs {
            bus: TargetPort {
                store: Some(BusRequest::store(offset, AccessSize::Word, value, mask)),
                ..Default::default()
            },
            rx_line: true,
        }
    }

    fn load(offset: u32) -> UartInputs {
        UartInputs {
            bus: TargetPort {
                load: Some(BusRequest::load(offset, AccessSize::Word, 1)),
                ..Default::default()
            },
            rx_line: true,
        }
    }

    /// Step once, feeding the controller's own TX line back into RX
    fn loop_step(uart: &UartController, mut inputs: UartInputs) -> (UartController, UartOutputs) {
        inputs.rx_line = uart.tx_line();
        uart.step(&inputs)
    }

    fn with_divider(div: u32) -> UartController {
        UartController::new(1).step(&store(UART_BAUD_DIV, div)).0
    }

    /// Frame `byte` onto the RX line of `uart` from outside, bit by bit
    fn receive(mut uart: UartController, byte: u8, div: u32) -> (UartController, Vec<UartOutputs>) {
        let mut outs = Vec::new();
        let mut bits = vec![false];
        bits.extend((0..8).map(|i| (byte >> i) & 1 != 0));
        bits.push(true);
        for bit in bits {
            for _ in 0..=div {
                let (next, out) = uart.step(&UartInputs {
                    rx_line: bit,
                    ..Default::default()
                });
                uart = next;
                outs.push(out);
            }
        }
        // let the synchronizer and mid-bit sampling catch up
        for _ in 0..=div * 2 + 4 {
            let (next, out) = uart.step(&UartInputs::default());
            uart = next;
            outs.push(out);
        }
        (uart, outs)
    }

    #[test]
    fn test_reset_values() {
        let uart = UartController::new(1);
        assert_eq!(uart.peek_register(UART_CTRL), CTRL_TX_EN | CTRL_RX_EN);
        assert_eq!(uart.peek_register(UART_BAUD_DIV), 217);
        assert_eq!(uart.status(), STATUS_TX_READY | STATUS_TX_CAN_ACCEPT);
        assert!(uart.tx_line());
        assert!(!uart.irq());
    }

    #[test]
    fn test_data_write_launches_next_tick() {
        let uart = with_divider(4);
        let (uart, out) = uart.step(&store(UART_DATA, 0x41));
        assert_eq!(out.tx_started, None);
        assert_eq!(uart.status() & STATUS_TX_PENDING, STATUS_TX_PENDING);

        let (uart, out) = uart.step(&UartInputs::default());
        assert_eq!(out.tx_started, Some(0x41));
        assert!(!uart.tx_line(), "start bit");
        assert_eq!(uart.status() & (STATUS_TX_CAN_ACCEPT | STATUS_TX_READY), STATUS_TX_CAN_ACCEPT);
    }

    #[test]
    fn test_data_write_ignored_when_holding_full() {
        let uart = with_divider(4);
        // hold TX disabled so the holding register stays full
        let uart = uart.step(&store(UART_CTRL, CTRL_RX_EN)).0;
        let uart = uart.step(&store(UART_DATA, 0x11)).0;
        let uart = uart.step(&store(UART_DATA, 0x22)).0;
        assert_eq!(uart.tx_hold().data(), 0x11);
        assert_eq!(uart.stats().tx_rejected, 1);
    }

    #[test]
    fn test_data_write_without_lane_zero_ignored() {
        let uart = UartController::new(1);
        let uart = uart.step(&store_masked(UART_DATA, 0x4100, ByteMask::new(0b0010))).0;
        assert!(!uart.tx_hold().is_valid());
    }

    #[test]
    fn test_tx_frame_length() {
        let div = 3;
        let uart = with_divider(div);
        let mut uart = uart.step(&store(UART_DATA, 0x55)).0;
        let mut started_at = None;
        let mut ready_at = None;
        for cycle in 0..200u64 {
            let (next, out) = uart.step(&UartInputs::default());
            uart = next;
            if out.tx_started.is_some() {
                started_at = Some(cycle);
            }
            if started_at.is_some() && uart.status() & STATUS_TX_READY != 0 {
                ready_at = Some(cycle);
                break;
            }
        }
        let frame = ready_at.unwrap() - started_at.unwrap();
        assert_eq!(frame, uart_frame_cycles(div));
    }

    #[test]
    fn test_loopback_a5_div16() {
        let mut uart = with_divider(16);
        uart = loop_step(&uart, store(UART_DATA, 0xA5)).0;
        let mut cycles = 0;
        while uart.status() & STATUS_RX_VALID == 0 {
            uart = loop_step(&uart, UartInputs::default()).0;
            cycles += 1;
            assert!(cycles < 400, "no byte received");
        }
        assert_eq!(uart.peek_register(UART_DATA), 0xA5);

        let (uart, _) = loop_step(&uart, load(UART_DATA));
        assert_eq!(uart.response(Channel::Load).map(|r| r.data), Some(0xA5));
        assert_eq!(uart.status() & STATUS_RX_VALID, 0);
    }

    #[test]
    fn test_overrun_keeps_first_byte() {
        let div = 4;
        let uart = with_divider(div);
        let (uart, outs) = receive(uart, 0x31, div);
        assert!(outs.iter().any(|o| o.rx_captured));
        let (uart, outs) = receive(uart, 0x32, div);
        assert!(outs.iter().any(|o| o.rx_done.is_some() && !o.rx_captured));

        assert!(uart.overrun());
        assert_eq!(uart.rx_hold().data(), 0x31);
        assert_eq!(uart.status() & STATUS_RX_OVERRUN, STATUS_RX_OVERRUN);
        assert_eq!(uart.stats().rx_overruns, 1);

        let (uart, _) = uart.step(&load(UART_STATUS));
        assert_eq!(
            uart.response(Channel::Load).map(|r| r.data & STATUS_RX_OVERRUN),
            Some(STATUS_RX_OVERRUN),
            "the read returns the flag that it clears"
        );
        assert!(!uart.overrun());
        assert_eq!(uart.rx_hold().data(), 0x31);
    }

    #[test]
    fn test_pop_same_tick_as_capture_is_not_overrun() {
        let div = 2;
        let uart = with_divider(div);
        let (mut uart, _) = receive(uart, 0x01, div);

        // start a second frame and find the tick its completion pulse fires
        let mut bits = vec![false];
        bits.extend((0..8).map(|i| (0x02u8 >> i) & 1 != 0));
        bits.push(true);
        let line: Vec<bool> = bits
            .iter()
            .flat_map(|&b| std::iter::repeat(b).take(div as usize + 1))
            .chain(std::iter::repeat(true).take(16))
            .collect();

        let mut probe = uart;
        let mut done_at = None;
        for (i, &level) in line.iter().enumerate() {
            let (next, out) = probe.step(&UartInputs {
                rx_line: level,
                ..Default::default()
            });
            probe = next;
            if out.rx_done.is_some() {
                done_at = Some(i);
                break;
            }
        }
        let done_at = done_at.unwrap();

        for (i, &level) in line.iter().enumerate() {
            let mut inputs = if i == done_at { load(UART_DATA) } else { UartInputs::default() };
            inputs.rx_line = level;
            uart = uart.step(&inputs).0;
        }
        assert!(!uart.overrun());
        assert!(uart.rx_hold().is_valid());
        assert_eq!(uart.rx_hold().data(), 0x02);
        assert_eq!(uart.response(Channel::Load).map(|r| r.data), Some(0x01));
    }

    #[test]
    fn test_rx_disabled_ignores_line() {
        let div = 2;
        let uart = with_divider(div);
        let uart = uart.step(&store(UART_CTRL, CTRL_TX_EN)).0;
        let (uart, outs) = receive(uart, 0x7E, div);
        assert!(outs.iter().all(|o| o.rx_done.is_none()));
        assert!(!uart.rx_hold().is_valid());
    }

    #[test]
    fn test_framing_error_counted_and_delivered() {
        let div = 2;
        let mut uart = with_divider(div);
        // stop bit held low
        let mut bits = vec![false];
        bits.extend((0..8).map(|i| (0x5Au8 >> i) & 1 != 0));
        bits.push(false);
        for bit in bits {
            for _ in 0..=div {
                uart = uart
                    .step(&UartInputs {
                        rx_line: bit,
                        ..Default::default()
                    })
                    .0;
            }
        }
        for _ in 0..8 {
            uart = uart.step(&UartInputs::default()).0;
        }
        assert_eq!(uart.stats().framing_errors, 1);
        assert_eq!(uart.rx_hold().data(), 0x5A);
    }

    #[test]
    fn test_ctrl_masked_write() {
        let uart = UartController::new(1);
        let uart = uart.step(&store(UART_CTRL, 0xAABB_CC03)).0;
        let uart = uart.step(&store_masked(UART_CTRL, 0x1122_3307, ByteMask::new(0b0001))).0;
        assert_eq!(uart.peek_register(UART_CTRL), 0xAABB_CC07);
    }

    #[test]
    fn test_irq_tx_empty_and_rx_valid() {
        let div = 2;
        let uart = with_divider(div);
        let uart = uart.step(&store(UART_CTRL, CTRL_TX_EN | CTRL_RX_EN | CTRL_TX_IE)).0;
        assert!(uart.irq(), "TX idle and empty");

        let (uart, _) = uart.step(&store(UART_DATA, 0x20));
        assert!(!uart.irq(), "TX holding full");

        let uart = uart.step(&store(UART_CTRL, CTRL_TX_EN | CTRL_RX_EN | CTRL_RX_IE)).0;
        assert!(!uart.irq());
        let (uart, _) = receive(uart, 0x33, div);
        assert!(uart.irq(), "RX valid");
        let (uart, _) = uart.step(&load(UART_DATA));
        assert!(!uart.irq());
    }

    #[test]
    fn test_status_is_read_only() {
        let uart = UartController::new(1);
        let uart = uart.step(&store(UART_STATUS, 0xFFFF_FFFF)).0;
        assert_eq!(uart.status(), STATUS_TX_READY | STATUS_TX_CAN_ACCEPT);
    }

    #[test]
    fn test_unmapped_offset_reads_zero() {
        let uart = UartController::new(1);
        let (uart, _) = uart.step(&load(0x20));
        assert_eq!(uart.response(Channel::Load), Some(BusResponse::ok(1, 0)));
    }

    #[test]
    fn test_reset_restores_defaults() {
        let uart = with_divider(3);
        let (mut uart, _) = uart.step(&store(UART_DATA, 0x99));
        uart.reset();
        assert_eq!(uart, UartController::new(1));
    }
}
