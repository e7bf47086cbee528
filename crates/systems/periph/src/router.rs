//! Address router for the CPU's load and store channels.
//!
//! ## Memory Map
//!
//! - `spi_base .. spi_base + window_size`: SPI display controller
//! - `uart_base .. uart_base + window_size`: UART console controller
//! - everything else: external memory (catch-all, decode never fails)
//!
//! ## Channels
//!
//! Loads and stores are decoded and accepted independently, so a load to one
//! target and a store to another can both be accepted in the same tick. A
//! request is accepted only when its channel has nothing in flight and the
//! decoded target reports ready; otherwise it simply holds. Once accepted,
//! the router remembers which target owns the channel and forwards that
//! target's response to the CPU until the CPU consumes it.
//!
//! MMIO targets receive the request with `addr` rewritten to the word-aligned
//! register offset inside their window. Memory receives the full address.

use serde::{Deserialize, Serialize};
use soc_core::bus::{BusRequest, BusResponse, BusTarget, Channel, TargetPort};
use soc_core::logging::{log, LogCategory, LogLevel};

/// Destination of a decoded request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    Memory,
    Spi,
    Uart,
}

impl Target {
    pub fn index(self) -> usize {
        match self {
            Target::Memory => 0,
            Target::Spi => 1,
            Target::Uart => 2,
        }
    }
}

/// Fixed decode windows of the two peripherals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressMap {
    spi_base: u32,
    uart_base: u32,
    window_size: u32,
}

impl AddressMap {
    /// `window_size` must be a power of two; see [`crate::SocConfig::validate`].
    pub fn new(spi_base: u32, uart_base: u32, window_size: u32) -> Self {
        Self {
            spi_base,
            uart_base,
            window_size,
        }
    }

    pub fn spi_base(&self) -> u32 {
        self.spi_base
    }

    pub fn uart_base(&self) -> u32 {
        self.uart_base
    }

    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    fn in_window(&self, addr: u32, base: u32) -> bool {
        addr.wrapping_sub(base) < self.window_size
    }

    pub fn decode(&self, addr: u32) -> Target {
        if self.in_window(addr, self.spi_base) {
            Target::Spi
        } else if self.in_window(addr, self.uart_base) {
            Target::Uart
        } else {
            Target::Memory
        }
    }

    /// Word-aligned register offset of `addr` within its window
    pub fn register_offset(&self, addr: u32) -> u32 {
        addr & self.window_size.wrapping_sub(1) & !3
    }
}

/// CPU side of the bus for one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuPorts {
    /// Load presented on the load channel
    pub load: Option<BusRequest>,
    /// Store presented on the store channel
    pub store: Option<BusRequest>,
    /// CPU will take a visible load response this tick
    pub load_resp_ready: bool,
    /// CPU will take a visible store response this tick
    pub store_resp_ready: bool,
}

impl CpuPorts {
    pub fn request(&self, channel: Channel) -> Option<&BusRequest> {
        let req = match channel {
            Channel::Load => self.load.as_ref(),
            Channel::Store => self.store.as_ref(),
        };
        // a request presented on the wrong channel is never accepted
        req.filter(|r| r.channel() == channel)
    }

    pub fn resp_ready(&self, channel: Channel) -> bool {
        match channel {
            Channel::Load => self.load_resp_ready,
            Channel::Store => self.store_resp_ready,
        }
    }
}

/// Result of routing one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Routing {
    ports: [TargetPort; 3],
    accepted: [bool; 2],
    responses: [Option<BusResponse>; 2],
}

impl Routing {
    /// What `target` sees from the router this tick
    pub fn port(&self, target: Target) -> &TargetPort {
        &self.ports[target.index()]
    }

    /// Request on `channel` was accepted (the channel's `ready`)
    pub fn accepted(&self, channel: Channel) -> bool {
        self.accepted[channel.index()]
    }

    /// Response presented to the CPU on `channel`
    pub fn response(&self, channel: Channel) -> Option<BusResponse> {
        self.responses[channel.index()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRouter {
    map: AddressMap,
    /// Owner of the outstanding request, per channel
    inflight: [Option<Target>; 2],
}

impl AddressRouter {
    pub fn new(map: AddressMap) -> Self {
        Self {
            map,
            inflight: [None; 2],
        }
    }

    pub fn reset(&mut self) {
        self.inflight = [None; 2];
    }

    pub fn map(&self) -> &AddressMap {
        &self.map
    }

    pub fn inflight(&self, channel: Channel) -> Option<Target> {
        self.inflight[channel.index()]
    }

    /// Decide this tick's routing from the pre-tick state of the router and
    /// its targets (indexed by [`Target::index`]). Returns the router state
    /// for the next tick.
    pub fn route(&self, cpu: &CpuPorts, targets: [&dyn BusTarget; 3]) -> (Self, Routing) {
        let mut next = *self;
        let mut routing = Routing::default();

        for channel in Channel::ALL {
            let ch = channel.index();
            match self.inflight[ch] {
                Some(owner) => {
                    let response = targets[owner.index()].response(channel);
                    routing.responses[ch] = response;
                    if response.is_some() && cpu.resp_ready(channel) {
                        let port = &mut routing.ports[owner.index()];
                        match channel {
                            Channel::Load => port.load_consumed = true,
                            Channel::Store => port.store_consumed = true,
                        }
                        next.inflight[ch] = None;
                        log(LogCategory::Bus, LogLevel::Trace, || {
                            format!("BUS: {:?} completed by {:?}: {:?}", channel, owner, response)
                        });
                    }
                }
                None => {
                    let Some(req) = cpu.request(channel) else {
                        continue;
                    };
                    let target = self.map.decode(req.addr);
                    if !targets[target.index()].ready(channel) {
                        continue;
                    }
                    let forwarded = match target {
                        Target::Memory => *req,
                        Target::Spi | Target::Uart => BusRequest {
                            addr: self.map.register_offset(req.addr),
                            ..*req
                        },
                    };
                    let port = &mut routing.ports[target.index()];
                    match channel {
                        Channel::Load => port.load = Some(forwarded),
                        Channel::Store => port.store = Some(forwarded),
                    }
                    routing.accepted[ch] = true;
                    next.inflight[ch] = Some(target);
                    log(LogCategory::Bus, LogLevel::Trace, || {
                        format!("BUS: {:?} {:08X} accepted by {:?}", channel, req.addr, target)
                    });
                }
            }
        }

        (next, routing)
    }
}
