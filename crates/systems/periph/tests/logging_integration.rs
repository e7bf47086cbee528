//! Integration test for logging across the peripheral layer
//!
//! Drives the paths that log at Warn or Debug:
//! - SPI launches dropped by the gating rules
//! - UART TX writes into a full holding register
//! - Memory error responses
//! - Unmapped register offsets

use soc_core::logging::{LogCategory, LogConfig, LogLevel};
use soc_periph::board::{Board, BoardConfig};
use soc_periph::spi::{SPI_TXRX, SPI_CTRL, CTRL_EN};
use soc_periph::uart::{UART_CTRL, UART_DATA, CTRL_RX_EN};
use soc_periph::SocError;

const SPI: u32 = 0x8000_0000;
const UART: u32 = 0x8000_1000;

#[test]
fn test_logging_spi_dropped_launch() {
    let config = LogConfig::global();
    config.set_level(LogCategory::Spi, LogLevel::Warn);

    let mut board = Board::new(BoardConfig::default()).unwrap();
    // enabled, but CS still deasserted
    board.write32(SPI + SPI_CTRL, CTRL_EN).unwrap();
    board.write32(SPI + SPI_TXRX, 0xAE).unwrap();
    assert_eq!(board.soc().spi().dropped_launches(), 1);
    assert!(board.soc().spi().is_ready());
}

#[test]
fn test_logging_uart_tx_rejected() {
    let config = LogConfig::global();
    config.set_level(LogCategory::Uart, LogLevel::Warn);

    let mut board = Board::new(BoardConfig::default()).unwrap();
    // TX disabled keeps the holding register full
    board.write32(UART + UART_CTRL, CTRL_RX_EN).unwrap();
    board.write32(UART + UART_DATA, 0x41).unwrap();
    board.write32(UART + UART_DATA, 0x42).unwrap();
    assert_eq!(board.soc().uart().stats().tx_rejected, 1);
    assert_eq!(board.soc().uart().tx_hold().data(), 0x41);
}

#[test]
fn test_logging_memory_error() {
    let config = LogConfig::global();
    config.set_level(LogCategory::Memory, LogLevel::Warn);

    let mut board = Board::new(BoardConfig::default()).unwrap();
    let err = board.read32(0x0002_0000).unwrap_err();
    assert!(matches!(err, SocError::BusFault { addr: 0x0002_0000 }));
    let err = board.write32(0x0000_0102, 1).unwrap_err();
    assert!(matches!(err, SocError::BusFault { .. }));
}

#[test]
fn test_logging_unmapped_offsets() {
    let config = LogConfig::global();
    config.set_level(LogCategory::Stubs, LogLevel::Debug);

    let mut board = Board::new(BoardConfig::default()).unwrap();
    board.write32(SPI + 0x800, 0xFFFF_FFFF).unwrap();
    assert_eq!(board.read32(SPI + 0x800).unwrap(), 0);
    assert_eq!(board.read32(UART + 0x20).unwrap(), 0);
}

#[test]
fn test_logging_to_file() {
    let path = std::env::temp_dir().join(format!("soc_periph_log_{}.txt", std::process::id()));
    let config = LogConfig::global();
    config.set_level(LogCategory::Bus, LogLevel::Trace);
    config.set_log_file(path.clone()).unwrap();

    let mut board = Board::new(BoardConfig::default()).unwrap();
    board.write32(0x40, 1).unwrap();
    assert_eq!(board.read32(0x40).unwrap(), 1);

    config.clear_log_file();
    config.set_level(LogCategory::Bus, LogLevel::Off);
    assert!(path.exists());
    let _ = std::fs::remove_file(&path);
}
