//! Bit-level serial engines.
//!
//! - [`ShiftEngine`]: synchronous clock/data shifter (SPI master style)
//! - [`UartTx`] / [`UartRx`]: 8-N-1 asynchronous framing
//!
//! Every engine advances one core cycle per `step` and paces its bits with a
//! divider that counts `0..=div`, so one divider tick lasts `div + 1` cycles.

mod shift;
mod uart;

pub use shift::{EdgeKind, ShiftConfig, ShiftEngine, ShiftInputs, ShiftOutputs, ShiftState};
pub use uart::{
    FrameState, RxByte, RxInputs, RxOutputs, Synchronizer, TxInputs, TxOutputs, UartRx, UartTx,
};

/// Number of framing bits in one 8-N-1 character (start + 8 data + stop)
pub const UART_FRAME_BITS: u32 = 10;

/// Core cycles one 8-N-1 character occupies on the line
pub fn uart_frame_cycles(divider: u32) -> u64 {
    UART_FRAME_BITS as u64 * (divider as u64 + 1)
}
