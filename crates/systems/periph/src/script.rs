//! Register-level scripts.
//!
//! A script is a JSON list of steps run in order on a [`Board`]. Addresses
//! and register values may be written as numbers or as `"0x..."` strings.
//!
//! ```json
//! { "name": "oled init",
//!   "steps": [
//!     { "op": "write", "addr": "0x80000008", "value": "0x103" },
//!     { "op": "poll", "addr": "0x80000004", "mask": 1, "value": 1 },
//!     { "op": "spi_send", "bytes": [174, 161, 200, 175] },
//!     { "op": "expect_display", "bytes": [174, 161, 200, 175] }
//!   ] }
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use soc_core::bus::ByteMask;
use soc_core::logging::{log, LogCategory, LogLevel};

use crate::board::Board;
use crate::SocError;

#[derive(Deserialize)]
#[serde(untagged)]
enum Number {
    Int(u64),
    Text(String),
}

fn parse_u32(n: Number) -> Result<u32, String> {
    let value = match n {
        Number::Int(v) => v,
        Number::Text(s) => {
            let t = s.trim();
            let parsed = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
                None => t.replace('_', "").parse::<u64>(),
            };
            parsed.map_err(|e| format!("invalid number {:?}: {}", s, e))?
        }
    };
    u32::try_from(value).map_err(|_| format!("{} does not fit in 32 bits", value))
}

fn de_u32<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    parse_u32(Number::deserialize(d)?).map_err(serde::de::Error::custom)
}

fn de_opt_u32<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
    match Option::<Number>::deserialize(d)? {
        Some(n) => parse_u32(n).map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

fn all_lanes() -> u8 {
    0xF
}

fn all_bits() -> u32 {
    u32::MAX
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Store to `addr`, optionally with a byte-lane mask
    Write {
        #[serde(deserialize_with = "de_u32")]
        addr: u32,
        #[serde(deserialize_with = "de_u32")]
        value: u32,
        #[serde(default = "all_lanes")]
        mask: u8,
    },
    /// Load from `addr`; if `expect` is given, `value & mask` must equal it
    Read {
        #[serde(deserialize_with = "de_u32")]
        addr: u32,
        #[serde(default, deserialize_with = "de_opt_u32")]
        expect: Option<u32>,
        #[serde(default = "all_bits", deserialize_with = "de_u32")]
        mask: u32,
    },
    /// Load `addr` until the value read, masked with `mask`, equals `value`
    Poll {
        #[serde(deserialize_with = "de_u32")]
        addr: u32,
        #[serde(deserialize_with = "de_u32")]
        mask: u32,
        #[serde(deserialize_with = "de_u32")]
        value: u32,
        #[serde(default)]
        max_cycles: Option<u64>,
    },
    Idle {
        cycles: u64,
    },
    /// Global reset
    Reset,
    /// CS-framed SPI burst, DC high when `data`
    SpiSend {
        bytes: Vec<u8>,
        #[serde(default)]
        data: bool,
    },
    /// Firmware-style `uart_putc` loop, then wait for the line to go idle
    UartPuts {
        text: String,
    },
    /// Retune the host console's bit period, e.g. after a BAUD_DIV write
    ConsoleBaud {
        #[serde(deserialize_with = "de_u32")]
        divisor: u32,
    },
    /// Host console types `text` into the SoC's RX line
    ConsoleSend {
        text: String,
    },
    /// Wait until the console has received text containing `text`
    ExpectConsole {
        text: String,
        #[serde(default)]
        max_cycles: Option<u64>,
    },
    /// Every byte the panel has seen so far must equal `bytes`
    ExpectDisplay {
        bytes: Vec<u8>,
    },
    /// Forget what the panel has seen so far
    ClearDisplay,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<Step>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScriptFile {
    Named(Script),
    Steps(Vec<Step>),
}

impl Script {
    /// Parse either `{"name": ..., "steps": [...]}` or a bare list of steps
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        Ok(match serde_json::from_str::<ScriptFile>(text)? {
            ScriptFile::Named(script) => script,
            ScriptFile::Steps(steps) => Script { name: None, steps },
        })
    }
}

/// One value read by a `read` step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReadRecord {
    pub step: usize,
    pub addr: u32,
    pub value: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ScriptReport {
    pub steps_run: usize,
    pub cycles: u64,
    pub reads: Vec<ReadRecord>,
}

fn failed(step: usize, reason: String) -> SocError {
    SocError::ScriptFailed { step, reason }
}

fn run_step(
    board: &mut Board,
    index: usize,
    step: &Step,
    report: &mut ScriptReport,
) -> Result<(), SocError> {
    let budget = board.config().max_wait_cycles;
    match step {
        Step::Write { addr, value, mask } => {
            board.write_masked(*addr, *value, ByteMask::new(*mask))
        }
        Step::Read { addr, expect, mask } => {
            let value = board.read32(*addr)?;
            report.reads.push(ReadRecord {
                step: index,
                addr: *addr,
                value,
            });
            match expect {
                Some(expected) if value & mask != *expected => Err(failed(
                    index,
                    format!(
                        "read 0x{:08X} from 0x{:08X}, expected 0x{:08X} under mask 0x{:08X}",
                        value, addr, expected, mask
                    ),
                )),
                _ => Ok(()),
            }
        }
        Step::Poll {
            addr,
            mask,
            value,
            max_cycles,
        } => board
            .poll(*addr, *mask, *value, max_cycles.unwrap_or(budget))
            .map(|_| ()),
        Step::Idle { cycles } => {
            board.idle(*cycles);
            Ok(())
        }
        Step::Reset => {
            board.reset();
            Ok(())
        }
        Step::SpiSend { bytes, data } => board.spi_send(bytes, *data),
        Step::UartPuts { text } => {
            board.uart_puts(text)?;
            board.uart_flush()
        }
        Step::ConsoleBaud { divisor } => {
            board.console_mut().set_divisor(*divisor);
            Ok(())
        }
        Step::ConsoleSend { text } => {
            board.console_mut().send(text.as_bytes());
            Ok(())
        }
        Step::ExpectConsole { text, max_cycles } => {
            let max = max_cycles.unwrap_or(budget);
            board
                .wait_until("console text", max, |b| b.console().text().contains(text.as_str()))
                .map(|_| ())
                .map_err(|_| {
                    failed(
                        index,
                        format!(
                            "console never showed {:?}, got {:?}",
                            text,
                            board.console().text()
                        ),
                    )
                })
        }
        Step::ExpectDisplay { bytes } => {
            let seen = board.display().bytes();
            if seen == *bytes {
                Ok(())
            } else {
                Err(failed(
                    index,
                    format!("display saw {:02X?}, expected {:02X?}", seen, bytes),
                ))
            }
        }
        Step::ClearDisplay => {
            board.display_mut().clear();
            Ok(())
        }
    }
}

/// Run every step of `script` on `board`, stopping at the first failure.
/// Step numbers in errors and reports count from 1.
pub fn run_script(board: &mut Board, script: &Script) -> Result<ScriptReport, SocError> {
    let start = board.elapsed();
    let mut report = ScriptReport::default();
    for (i, step) in script.steps.iter().enumerate() {
        let index = i + 1;
        log(LogCategory::Bus, LogLevel::Debug, || {
            format!("SCRIPT: step {} {:?}", index, step)
        });
        run_step(board, index, step, &mut report).map_err(|e| match e {
            SocError::ScriptFailed { .. } => e,
            other => failed(index, other.to_string()),
        })?;
        report.steps_run = index;
    }
    report.cycles = board.elapsed() - start;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::BoardConfig;

    #[test]
    fn test_parse_hex_and_decimal() {
        let script = Script::from_json(
            r#"[
                {"op": "write", "addr": "0x8000_1008", "value": 3},
                {"op": "read", "addr": 2147487756, "expect": "0xD9"},
                {"op": "idle", "cycles": 5},
                {"op": "reset"}
            ]"#,
        )
        .unwrap();
        assert_eq!(script.name, None);
        assert_eq!(
            script.steps[0],
            Step::Write {
                addr: 0x8000_1008,
                value: 3,
                mask: 0xF
            }
        );
        assert_eq!(
            script.steps[1],
            Step::Read {
                addr: 0x8000_100C,
                expect: Some(0xD9),
                mask: u32::MAX
            }
        );
        assert_eq!(script.steps[3], Step::Reset);
    }

    #[test]
    fn test_parse_named_script() {
        let script = Script::from_json(
            r#"{"name": "hello", "steps": [{"op": "console_send", "text": "a"}]}"#,
        )
        .unwrap();
        assert_eq!(script.name.as_deref(), Some("hello"));
        assert_eq!(script.steps.len(), 1);
    }

    #[test]
    fn test_parse_rejects_bad_numbers() {
        assert!(Script::from_json(r#"[{"op": "idle"}]"#).is_err());
        assert!(Script::from_json(r#"[{"op": "read", "addr": "0xZZ"}]"#).is_err());
        assert!(Script::from_json(r#"[{"op": "read", "addr": 4294967296}]"#).is_err());
    }

    #[test]
    fn test_run_reads_and_expectations() {
        let mut board = Board::new(BoardConfig::default()).unwrap();
        let script = Script::from_json(
            r#"[
                {"op": "write", "addr": 64, "value": "0x12345678"},
                {"op": "read", "addr": 64, "expect": "0x5678", "mask": "0xFFFF"},
                {"op": "read", "addr": "0x80001008"}
            ]"#,
        )
        .unwrap();
        let report = run_script(&mut board, &script).unwrap();
        assert_eq!(report.steps_run, 3);
        assert_eq!(report.reads.len(), 2);
        assert_eq!(report.reads[1].value, 0x3);
        assert!(report.cycles > 0);
    }

    #[test]
    fn test_failed_expectation_names_step() {
        let mut board = Board::new(BoardConfig::default()).unwrap();
        let script = Script::from_json(
            r#"[
                {"op": "idle", "cycles": 1},
                {"op": "read", "addr": "0x8000100C", "expect": 16}
            ]"#,
        )
        .unwrap();
        match run_script(&mut board, &script) {
            Err(SocError::ScriptFailed { step, .. }) => assert_eq!(step, 2),
            other => panic!("unexpected result: {:?}", other.map(|r| r.steps_run)),
        }
    }

    #[test]
    fn test_timeout_becomes_script_failure() {
        let mut board = Board::new(BoardConfig::default()).unwrap();
        let script = Script::from_json(
            r#"[{"op": "poll", "addr": "0x80001004", "mask": 1, "value": 1, "max_cycles": 20}]"#,
        )
        .unwrap();
        let err = run_script(&mut board, &script).unwrap_err();
        assert!(matches!(err, SocError::ScriptFailed { step: 1, .. }));
        assert!(err.to_string().contains("Timed out"));
    }

    #[test]
    fn test_console_round_trip_script() {
        let mut board = Board::new(BoardConfig {
            console_divisor: 8,
            ..Default::default()
        })
        .unwrap();
        let script = Script::from_json(
            r#"[
                {"op": "write", "addr": "0x8000100C", "value": 8},
                {"op": "uart_puts", "text": "ping"},
                {"op": "expect_console", "text": "ping", "max_cycles": 1000}
            ]"#,
        )
        .unwrap();
        run_script(&mut board, &script).unwrap();
    }

    #[test]
    fn test_reset_step_keeps_cycle_count() {
        let mut board = Board::new(BoardConfig::default()).unwrap();
        board.write32(0x40, 1).unwrap();
        let script =
            Script::from_json(r#"[{"op": "reset"}, {"op": "idle", "cycles": 1}]"#).unwrap();
        let report = run_script(&mut board, &script).unwrap();
        assert_eq!(report.steps_run, 2);
        assert_eq!(report.cycles, 1);

        let mut board = Board::new(BoardConfig::default()).unwrap();
        let script = Script::from_json(
            r#"[
                {"op": "idle", "cycles": 500},
                {"op": "reset"},
                {"op": "idle", "cycles": 100}
            ]"#,
        )
        .unwrap();
        let report = run_script(&mut board, &script).unwrap();
        assert_eq!(report.cycles, 600);
        assert_eq!(board.cycle(), 100);
        assert_eq!(board.elapsed(), 600);
    }

    #[test]
    fn test_console_baud_follows_soc_divisor() {
        let mut board = Board::new(BoardConfig::default()).unwrap();
        let script = Script::from_json(
            r#"[
                {"op": "write", "addr": "0x8000100C", "value": 8},
                {"op": "console_baud", "divisor": 8},
                {"op": "console_send", "text": "hi"},
                {"op": "poll", "addr": "0x80001004", "mask": 1, "value": 1, "max_cycles": 500},
                {"op": "read", "addr": "0x80001000", "expect": "0x68", "mask": "0xFF"},
                {"op": "poll", "addr": "0x80001004", "mask": 1, "value": 1, "max_cycles": 500},
                {"op": "read", "addr": "0x80001000", "expect": "0x69", "mask": "0xFF"}
            ]"#,
        )
        .unwrap();
        run_script(&mut board, &script).unwrap();
        assert_eq!(board.console().divisor(), 8);
        assert_eq!(board.soc().uart().stats().rx_overruns, 0);
    }

    #[test]
    fn test_clear_display_between_bursts() {
        let mut board = Board::new(BoardConfig::default()).unwrap();
        let script = Script::from_json(
            r#"[
                {"op": "write", "addr": "0x8000000C", "value": 1},
                {"op": "write", "addr": "0x80000008", "value": "0x103"},
                {"op": "spi_send", "bytes": [1, 2]},
                {"op": "expect_display", "bytes": [1, 2]},
                {"op": "clear_display"},
                {"op": "expect_display", "bytes": []},
                {"op": "spi_send", "bytes": [3], "data": true},
                {"op": "expect_display", "bytes": [3]}
            ]"#,
        )
        .unwrap();
        run_script(&mut board, &script).unwrap();
        let transactions = board.display().transactions();
        assert_eq!(transactions.len(), 1);
        assert!(transactions[0].bytes[0].data);
    }
}
