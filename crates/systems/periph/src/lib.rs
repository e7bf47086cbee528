//! SoC peripheral layer: address router, external memory, SPI display
//! controller and UART console controller, advanced together one core clock
//! tick at a time.
//!
//! Every tick follows the same two phases. All components compute their next
//! state and outputs from the state committed at the end of the previous
//! tick, then all next states are committed at once. No component ever sees
//! another's partial update.

pub mod board;
pub mod console;
pub mod display;
pub mod memory;
pub mod router;
pub mod script;
pub mod spi;
pub mod uart;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use soc_core::bus::{BusResponse, Channel};
use soc_core::{Clocked, MountPointInfo, System};
use thiserror::Error;

use memory::{Memory, MemoryPorts};
use router::{AddressMap, AddressRouter, Target};
use spi::{SpiController, SpiInputs, SpiOutputs, SpiPins};
use uart::{UartController, UartInputs, UartOutputs};

pub use router::CpuPorts;

#[derive(Error, Debug)]
pub enum SocError {
    #[error("Invalid mount point: {0}")]
    InvalidMountPoint(String),

    #[error("Image of {len} bytes does not fit in {capacity} bytes of memory")]
    ImageTooLarge { len: usize, capacity: usize },

    #[error("Timed out after {cycles} cycles waiting for {what}")]
    Timeout { what: String, cycles: u64 },

    #[error("Bus error response from 0x{addr:08X}")]
    BusFault { addr: u32 },

    #[error("Script step {step} failed: {reason}")]
    ScriptFailed { step: usize, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Address map and latencies of the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocConfig {
    pub spi_base: u32,
    pub uart_base: u32,
    /// Size of each peripheral window; a power of two
    pub window_size: u32,
    pub memory_size: usize,
    /// Ticks from acceptance to a visible memory response
    pub memory_latency: u32,
    /// Ticks from acceptance to a visible SPI/UART response
    pub mmio_latency: u32,
}

impl Default for SocConfig {
    fn default() -> Self {
        Self {
            spi_base: 0x8000_0000,
            uart_base: 0x8000_1000,
            window_size: 0x1000,
            memory_size: 64 * 1024,
            memory_latency: 2,
            mmio_latency: 1,
        }
    }
}

/// Smallest window that still holds the SPI register file
const MIN_WINDOW: u32 = 0x20;

impl SocConfig {
    pub fn validate(&self) -> Result<(), SocError> {
        if !self.window_size.is_power_of_two() || self.window_size < MIN_WINDOW {
            return Err(SocError::InvalidConfig(format!(
                "window size 0x{:X} must be a power of two of at least 0x{:X}",
                self.window_size, MIN_WINDOW
            )));
        }
        for (name, base) in [("spi_base", self.spi_base), ("uart_base", self.uart_base)] {
            if base & (self.window_size - 1) != 0 {
                return Err(SocError::InvalidConfig(format!(
                    "{} 0x{:08X} is not aligned to the 0x{:X} window",
                    name, base, self.window_size
                )));
            }
        }
        // both bases are window aligned, so the windows overlap only if equal
        if self.spi_base == self.uart_base {
            return Err(SocError::InvalidConfig(format!(
                "SPI and UART windows overlap at 0x{:08X}",
                self.spi_base
            )));
        }
        Ok(())
    }

    pub fn address_map(&self) -> AddressMap {
        AddressMap::new(self.spi_base, self.uart_base, self.window_size)
    }
}

/// Levels on the SoC's input pins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinInputs {
    pub miso: bool,
    pub uart_rx: bool,
}

impl Default for PinInputs {
    /// Undriven lines float high
    fn default() -> Self {
        Self {
            miso: true,
            uart_rx: true,
        }
    }
}

/// Everything the system presents to its surroundings for one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickOutputs {
    pub load_accepted: bool,
    pub store_accepted: bool,
    pub load_response: Option<BusResponse>,
    pub store_response: Option<BusResponse>,
    pub spi: SpiOutputs,
    pub uart: UartOutputs,
}

impl TickOutputs {
    pub fn accepted(&self, channel: Channel) -> bool {
        match channel {
            Channel::Load => self.load_accepted,
            Channel::Store => self.store_accepted,
        }
    }

    pub fn response(&self, channel: Channel) -> Option<BusResponse> {
        match channel {
            Channel::Load => self.load_response,
            Channel::Store => self.store_response,
        }
    }
}

/// Serialized component state (memory contents excluded)
#[derive(Serialize, Deserialize)]
struct SocState {
    system: String,
    cycle: u64,
    router: AddressRouter,
    memory: MemoryPorts,
    spi: SpiController,
    uart: UartController,
}

const STATE_TAG: &str = "soc_periph";

pub struct SocSystem {
    config: SocConfig,
    router: AddressRouter,
    memory: Memory,
    spi: SpiController,
    uart: UartController,
    cycle: u64,
}

impl SocSystem {
    pub fn new(config: SocConfig) -> Result<Self, SocError> {
        config.validate()?;
        Ok(Self {
            router: AddressRouter::new(config.address_map()),
            memory: Memory::new(config.memory_size, config.memory_latency),
            spi: SpiController::new(config.mmio_latency),
            uart: UartController::new(config.mmio_latency),
            cycle: 0,
            config,
        })
    }

    pub fn config(&self) -> &SocConfig {
        &self.config
    }

    /// Ticks since construction or the last reset
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn router(&self) -> &AddressRouter {
        &self.router
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn spi(&self) -> &SpiController {
        &self.spi
    }

    pub fn uart(&self) -> &UartController {
        &self.uart
    }

    pub fn spi_pins(&self) -> SpiPins {
        self.spi.pins()
    }

    pub fn uart_tx(&self) -> bool {
        self.uart.tx_line()
    }

    pub fn spi_irq(&self) -> bool {
        self.spi.irq()
    }

    pub fn uart_irq(&self) -> bool {
        self.uart.irq()
    }

    /// Advance one core clock tick.
    pub fn tick(&mut self, cpu: &CpuPorts, pins: &PinInputs) -> TickOutputs {
        // Phase 1: every next state from the committed snapshot
        let (router, routing) = self
            .router
            .route(cpu, [&self.memory, &self.spi, &self.uart]);
        let memory = self.memory.step(routing.port(Target::Memory));
        let (spi, spi_out) = self.spi.step(&SpiInputs {
            bus: *routing.port(Target::Spi),
            miso: pins.miso,
        });
        let (uart, uart_out) = self.uart.step(&UartInputs {
            bus: *routing.port(Target::Uart),
            rx_line: pins.uart_rx,
        });

        // Phase 2: commit
        self.router = router;
        self.memory.commit(memory);
        self.spi = spi;
        self.uart = uart;
        self.cycle += 1;

        TickOutputs {
            load_accepted: routing.accepted(Channel::Load),
            store_accepted: routing.accepted(Channel::Store),
            load_response: routing.response(Channel::Load),
            store_response: routing.response(Channel::Store),
            spi: spi_out,
            uart: uart_out,
        }
    }
}

impl System for SocSystem {
    type Error = SocError;

    fn reset(&mut self) {
        self.router.reset();
        self.memory.reset();
        self.spi.reset();
        self.uart.reset();
        self.cycle = 0;
    }

    fn run_cycles(&mut self, cycles: u64) -> Result<(), SocError> {
        let cpu = CpuPorts::default();
        let pins = PinInputs::default();
        for _ in 0..cycles {
            self.tick(&cpu, &pins);
        }
        Ok(())
    }

    fn save_state(&self) -> Value {
        let state = SocState {
            system: STATE_TAG.to_string(),
            cycle: self.cycle,
            router: self.router,
            memory: self.memory.ports(),
            spi: self.spi,
            uart: self.uart,
        };
        serde_json::to_value(state).unwrap_or(Value::Null)
    }

    fn load_state(&mut self, v: &Value) -> Result<(), serde_json::Error> {
        let state: SocState = serde_json::from_value(v.clone())?;
        if state.system != STATE_TAG {
            return Err(serde::de::Error::custom(format!(
                "state belongs to {:?}, not {}",
                state.system, STATE_TAG
            )));
        }
        if *state.router.map() != self.config.address_map() {
            return Err(serde::de::Error::custom(
                "state was saved with a different address map",
            ));
        }
        self.cycle = state.cycle;
        self.router = state.router;
        self.memory.set_ports(state.memory);
        self.spi = state.spi;
        self.uart = state.uart;
        Ok(())
    }

    fn supports_save_states(&self) -> bool {
        true
    }

    fn mount_points(&self) -> Vec<MountPointInfo> {
        vec![MountPointInfo {
            id: "Memory".to_string(),
            name: "Memory Image".to_string(),
            extensions: vec!["bin".to_string(), "img".to_string()],
            required: false,
        }]
    }

    fn mount(&mut self, mount_point_id: &str, data: &[u8]) -> Result<(), SocError> {
        if mount_point_id != "Memory" {
            return Err(SocError::InvalidMountPoint(mount_point_id.to_string()));
        }
        self.memory.load_image(data)
    }

    fn unmount(&mut self, mount_point_id: &str) -> Result<(), SocError> {
        if mount_point_id != "Memory" {
            return Err(SocError::InvalidMountPoint(mount_point_id.to_string()));
        }
        self.memory.clear();
        Ok(())
    }

    fn is_mounted(&self, mount_point_id: &str) -> bool {
        mount_point_id == "Memory" && self.memory.is_loaded()
    }
}
